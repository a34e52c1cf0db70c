// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Transport Notifications
//!
//! Typed notifications raised by the transport. Any number of subscribers (logging,
//! response dispatch, health reporting) can listen to the same stream through a
//! `tokio::sync::broadcast` channel; a slow subscriber only loses its own backlog.

use crate::{
    errors::{SendError, TransportError},
    ticket::{TicketCategory, TicketResponse, UnparsableMessage},
};
use tokio::sync::broadcast;
use tracing::trace;

/// Number of notifications buffered per subscriber
pub const DEFAULT_EVENT_CAPACITY: usize = 1024;

/// A notification raised by one of the transport components.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// The connection status changed
    ConnectionChanged { connected: bool, reason: String },

    /// A queued ticket reached the broker
    PublishSucceeded {
        ticket_id: String,
        correlation_id: String,
    },

    /// A queued ticket was dropped: expired, rejected by the broker or the publisher closed
    PublishFailed {
        ticket_id: String,
        correlation_id: String,
        reason: TransportError,
    },

    /// A response matched a non-blocking send
    ResponseReceived(TicketResponse),

    /// A non-blocking send failed after it was accepted
    SendFailed {
        ticket_id: String,
        correlation_id: String,
        reason: SendError,
    },

    /// A non-blocking send got no response in time
    ResponseTimedOut {
        ticket_id: String,
        correlation_id: String,
        category: TicketCategory,
    },

    /// A delivery that matched no in-flight ticket or could not be read
    UnparsableMessage(UnparsableMessage),
}

/// Sending half of the notification stream, cheap to clone.
#[derive(Debug, Clone)]
pub struct Notifier {
    sender: broadcast::Sender<TransportEvent>,
}

impl Notifier {
    pub fn new(capacity: usize) -> Notifier {
        let (sender, _) = broadcast::channel(capacity);
        Notifier { sender }
    }

    /// Returns a receiver that sees every notification raised from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        self.sender.subscribe()
    }

    /// Raises a notification. Having no subscriber is not an error.
    pub fn emit(&self, event: TransportEvent) {
        if self.sender.send(event).is_err() {
            trace!("notification dropped, no subscriber");
        }
    }
}

impl Default for Notifier {
    fn default() -> Self {
        Notifier::new(DEFAULT_EVENT_CAPACITY)
    }
}
