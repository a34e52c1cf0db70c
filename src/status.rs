// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Connection Status
//!
//! Per-instance record of whether the broker connection is up, when it last changed,
//! and which tickets were recently sent and received. Pure state, guarded by a single
//! mutex; every real transition raises a [`TransportEvent::ConnectionChanged`].

use crate::{
    events::{Notifier, TransportEvent},
    lock,
};
use chrono::{DateTime, Utc};
use std::{collections::VecDeque, fmt, sync::Mutex};
use tracing::{info, warn};

/// Number of sent and received ticket ids kept in the history
pub const HISTORY_SIZE: usize = 10;

#[derive(Debug, Default)]
struct StatusInner {
    connected_at: Option<DateTime<Utc>>,
    disconnected_at: Option<DateTime<Utc>>,
    last_sent_id: Option<String>,
    last_received_id: Option<String>,
    sent: VecDeque<String>,
    received: VecDeque<String>,
}

impl StatusInner {
    fn is_connected(&self) -> bool {
        self.connected_at.is_some() && self.disconnected_at.is_none()
    }
}

/// Shared connection state of one transport instance.
///
/// A fresh status is disconnected: neither timestamp is set.
#[derive(Debug)]
pub struct ConnectionStatus {
    inner: Mutex<StatusInner>,
    notifier: Notifier,
}

impl ConnectionStatus {
    pub fn new(notifier: Notifier) -> ConnectionStatus {
        ConnectionStatus {
            inner: Mutex::new(StatusInner::default()),
            notifier,
        }
    }

    /// Marks the connection as up.
    ///
    /// # Returns
    /// `true` when this call changed the state, `false` when it was already connected
    pub fn connect(&self, reason: &str) -> bool {
        let mut inner = lock(&self.inner);
        if inner.is_connected() {
            return false;
        }

        inner.connected_at = Some(Utc::now());
        inner.disconnected_at = None;
        info!(reason, "connection is up");

        self.notifier.emit(TransportEvent::ConnectionChanged {
            connected: true,
            reason: reason.to_owned(),
        });

        true
    }

    /// Marks the connection as down.
    ///
    /// # Returns
    /// `true` when this call changed the state, `false` when it was already down
    pub fn disconnect(&self, reason: &str) -> bool {
        let mut inner = lock(&self.inner);
        if !inner.is_connected() {
            return false;
        }

        inner.disconnected_at = Some(Utc::now());
        warn!(reason, "connection is down");

        self.notifier.emit(TransportEvent::ConnectionChanged {
            connected: false,
            reason: reason.to_owned(),
        });

        true
    }

    pub fn is_connected(&self) -> bool {
        lock(&self.inner).is_connected()
    }

    pub fn connected_at(&self) -> Option<DateTime<Utc>> {
        lock(&self.inner).connected_at
    }

    pub fn disconnected_at(&self) -> Option<DateTime<Utc>> {
        lock(&self.inner).disconnected_at
    }

    pub fn last_sent_id(&self) -> Option<String> {
        lock(&self.inner).last_sent_id.clone()
    }

    pub fn last_received_id(&self) -> Option<String> {
        lock(&self.inner).last_received_id.clone()
    }

    /// Records a ticket id that reached the broker.
    pub fn record_sent(&self, ticket_id: &str) {
        let mut inner = lock(&self.inner);
        inner.last_sent_id = Some(ticket_id.to_owned());
        push_bounded(&mut inner.sent, ticket_id);
    }

    /// Records a ticket id a response was received for.
    pub fn record_received(&self, ticket_id: &str) {
        let mut inner = lock(&self.inner);
        inner.last_received_id = Some(ticket_id.to_owned());
        push_bounded(&mut inner.received, ticket_id);
    }

    /// Oldest first.
    pub fn sent_history(&self) -> Vec<String> {
        lock(&self.inner).sent.iter().cloned().collect()
    }

    /// Oldest first.
    pub fn received_history(&self) -> Vec<String> {
        lock(&self.inner).received.iter().cloned().collect()
    }
}

fn push_bounded(history: &mut VecDeque<String>, ticket_id: &str) {
    if history.len() == HISTORY_SIZE {
        history.pop_front();
    }
    history.push_back(ticket_id.to_owned());
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = lock(&self.inner);
        if inner.is_connected() {
            write!(f, "connected since {}", fmt_time(inner.connected_at))?;
        } else {
            write!(f, "disconnected since {}", fmt_time(inner.disconnected_at))?;
        }

        write!(
            f,
            ", last sent: {}, last received: {}",
            inner.last_sent_id.as_deref().unwrap_or("-"),
            inner.last_received_id.as_deref().unwrap_or("-")
        )
    }
}

fn fmt_time(time: Option<DateTime<Utc>>) -> String {
    time.map(|t| t.to_rfc3339()).unwrap_or_else(|| "never".to_owned())
}
