// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Correlated Sender
//!
//! Bridges an outbound ticket to its eventual response. Every send registers the
//! ticket's correlation id in the [`TicketCache`] before publishing it. Responses come
//! back through the [`MessageHandler`] implementation: a matching delivery either
//! completes the parked [`CorrelatedSender::send_and_wait`] call or raises
//! [`TransportEvent::ResponseReceived`]. Deliveries nobody waits for are surfaced as
//! [`TransportEvent::UnparsableMessage`].

use crate::{
    cache::{TicketCache, TicketCacheEntry},
    config::{ResponseTimeouts, TransportConfig},
    consumer::{MessageHandler, ReceivedMessage},
    errors::{SendError, TransportError},
    events::{Notifier, TransportEvent},
    lock,
    publisher::{PublishListener, PublishRequest, PublisherChannel},
    status::ConnectionStatus,
    ticket::{OutboundTicket, TicketCategory, TicketResponse, UnparsableMessage, UnparsableReason},
};
use std::{
    collections::HashMap,
    sync::{Arc, Mutex, Weak},
    time::Duration,
};
use tokio::{sync::oneshot, task::JoinHandle, time::Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Longest pause of the eviction task
const EVICTION_INTERVAL: Duration = Duration::from_secs(1);

/// Sends tickets and matches their responses.
pub struct CorrelatedSender {
    publisher: Arc<PublisherChannel>,
    status: Arc<ConnectionStatus>,
    notifier: Notifier,
    cache: TicketCache,
    timeouts: ResponseTimeouts,
    reply_keys: HashMap<TicketCategory, String>,
    eviction: Mutex<Option<JoinHandle<()>>>,
}

impl CorrelatedSender {
    /// Creates a sender publishing through `publisher` and registers it as the
    /// publisher's listener.
    ///
    /// # Parameters
    /// * `cfg` - Transport configuration (response timeouts and reply routing keys)
    /// * `publisher` - Channel the tickets are published on
    /// * `status` - Connection status the received ticket ids are recorded on
    /// * `notifier` - Where responses and failures of non-blocking sends are raised
    ///
    /// # Returns
    /// An Arc-wrapped CorrelatedSender instance for thread-safe sharing
    pub fn new(
        cfg: &TransportConfig,
        publisher: Arc<PublisherChannel>,
        status: Arc<ConnectionStatus>,
        notifier: Notifier,
    ) -> Arc<CorrelatedSender> {
        let reply_keys = TicketCategory::ALL
            .into_iter()
            .map(|category| (category, cfg.reply_routing_key(category)))
            .collect();

        let sender = Arc::new(CorrelatedSender {
            publisher,
            status,
            notifier,
            cache: TicketCache::new(),
            timeouts: cfg.response_timeouts(),
            reply_keys,
            eviction: Mutex::new(None),
        });

        let weak = Arc::downgrade(&sender);
        let listener: Weak<dyn PublishListener> = weak;
        sender.publisher.set_listener(listener);
        sender
    }

    /// Number of tickets waiting for a response.
    pub fn in_flight(&self) -> usize {
        self.cache.len()
    }

    /// Routing key responses for `category` come back on.
    pub fn reply_routing_key(&self, category: TicketCategory) -> &str {
        self.reply_keys
            .get(&category)
            .map(String::as_str)
            .unwrap_or_default()
    }

    /// Starts the task evicting non-blocking tickets whose response never came.
    pub fn start(self: &Arc<Self>) {
        let mut eviction = lock(&self.eviction);
        if eviction.is_none() {
            *eviction = Some(tokio::spawn(self.clone().run_eviction()));
        }
    }

    /// Sends a ticket without waiting for its response.
    ///
    /// The response is raised later as [`TransportEvent::ResponseReceived`], or
    /// [`TransportEvent::ResponseTimedOut`] when it does not come in time.
    ///
    /// # Returns
    /// The correlation id of the ticket, or the reason it could not be sent
    pub async fn send(&self, ticket: OutboundTicket) -> Result<String, SendError> {
        let category = ticket.category;
        let timeout = self.timeouts.for_category(category, ticket.live);
        let (correlation_id, request) = self.prepare(ticket);

        let entry = TicketCacheEntry::new(&correlation_id, &request.ticket_id, category, timeout);
        self.cache.insert(entry)?;
        self.publish(request).await?;

        Ok(correlation_id)
    }

    /// Sends a ticket and waits for its response up to the category timeout.
    pub async fn send_and_wait(&self, ticket: OutboundTicket) -> Result<TicketResponse, SendError> {
        let timeout = self.timeouts.for_category(ticket.category, ticket.live);
        self.send_and_wait_with_timeout(ticket, timeout).await
    }

    /// Sends a ticket and waits for its response up to `timeout`.
    ///
    /// # Returns
    /// * The matched response
    /// * `SendError::Publish` when the ticket could not be published or queued
    /// * `SendError::Timeout` when no response came in time; the ticket is forgotten
    pub async fn send_and_wait_with_timeout(
        &self,
        ticket: OutboundTicket,
        timeout: Duration,
    ) -> Result<TicketResponse, SendError> {
        let category = ticket.category;
        let (correlation_id, request) = self.prepare(ticket);
        let (waiter, mut response) = oneshot::channel();

        let entry = TicketCacheEntry::new(&correlation_id, &request.ticket_id, category, timeout)
            .with_waiter(waiter);
        self.cache.insert(entry)?;
        self.publish(request).await?;

        match tokio::time::timeout(timeout, &mut response).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(SendError::Canceled),
            Err(_) => {
                if self.cache.take(&correlation_id).is_none() {
                    // a delivery took the entry at the deadline; its outcome is on the way
                    return response.await.unwrap_or(Err(SendError::Canceled));
                }
                warn!(
                    correlation_id = %correlation_id,
                    timeout_ms = timeout.as_millis() as u64,
                    "no response in time"
                );
                Err(SendError::Timeout {
                    correlation_id,
                    timeout_ms: timeout.as_millis(),
                })
            }
        }
    }

    /// Stops the eviction task and cancels every ticket still waiting.
    pub fn dispose(&self) {
        if let Some(task) = lock(&self.eviction).take() {
            task.abort();
        }

        for entry in self.cache.drain() {
            debug!(correlation_id = %entry.correlation_id, "canceling in-flight ticket");
            entry.complete(Err(SendError::Canceled));
        }
    }

    fn prepare(&self, ticket: OutboundTicket) -> (String, PublishRequest) {
        let correlation_id = ticket
            .correlation_id
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let reply_routing_key = ticket
            .reply_routing_key
            .unwrap_or_else(|| self.reply_routing_key(ticket.category).to_owned());

        let request = PublishRequest {
            ticket_id: ticket.ticket_id,
            payload: ticket.payload,
            routing_key: ticket.routing_key,
            correlation_id: correlation_id.clone(),
            reply_routing_key,
        };
        (correlation_id, request)
    }

    async fn publish(&self, request: PublishRequest) -> Result<(), SendError> {
        let correlation_id = request.correlation_id.clone();
        if let Err(err) = self.publisher.publish(request).await {
            self.cache.take(&correlation_id);
            warn!(correlation_id = %correlation_id, error = err.to_string(), "ticket not sent");
            return Err(SendError::Publish(err));
        }

        debug!(correlation_id = %correlation_id, "ticket sent");
        Ok(())
    }

    async fn run_eviction(self: Arc<Self>) {
        loop {
            let now = Instant::now();
            for entry in self.cache.take_expired(now) {
                warn!(
                    correlation_id = %entry.correlation_id,
                    ticket_id = %entry.ticket_id,
                    "dropping ticket without response"
                );
                self.notifier.emit(TransportEvent::ResponseTimedOut {
                    ticket_id: entry.ticket_id,
                    correlation_id: entry.correlation_id,
                    category: entry.category,
                });
            }

            let next = self
                .cache
                .next_deadline()
                .map(|deadline| deadline.min(now + EVICTION_INTERVAL))
                .unwrap_or(now + EVICTION_INTERVAL);
            tokio::time::sleep_until(next.max(Instant::now())).await;
        }
    }

    fn surface_unparsable(&self, message: &ReceivedMessage, reason: UnparsableReason) {
        self.notifier.emit(TransportEvent::UnparsableMessage(UnparsableMessage {
            correlation_id: message.correlation_id.clone(),
            routing_key: message.routing_key.clone(),
            category: message.category,
            raw: message.body.clone(),
            reason,
        }));
    }
}

impl MessageHandler for CorrelatedSender {
    fn handle(&self, message: ReceivedMessage) {
        let Some(entry) = message
            .correlation_id
            .as_deref()
            .and_then(|id| self.cache.take(id))
        else {
            warn!(
                correlation_id = ?message.correlation_id,
                routing_key = %message.routing_key,
                "response matches no ticket in flight"
            );
            self.surface_unparsable(&message, UnparsableReason::Unmatched);
            return;
        };

        let body = match serde_json::from_slice(&message.body) {
            Ok(body) => body,
            Err(err) => {
                warn!(correlation_id = %entry.correlation_id, error = err.to_string(), "unreadable response");
                self.surface_unparsable(&message, UnparsableReason::InvalidBody(err.to_string()));
                let correlation_id = entry.correlation_id.clone();
                entry.complete(Err(SendError::Unparsable {
                    correlation_id,
                    reason: err.to_string(),
                }));
                return;
            }
        };

        self.status.record_received(&entry.ticket_id);
        let response = TicketResponse {
            category: message.category,
            ticket_id: entry.ticket_id.clone(),
            correlation_id: entry.correlation_id.clone(),
            routing_key: message.routing_key,
            body,
            raw: message.body,
            headers: message.headers,
            round_trip: entry.sent_at.elapsed(),
        };
        info!(
            correlation_id = %response.correlation_id,
            ticket_id = %response.ticket_id,
            category = %response.category,
            round_trip_ms = response.round_trip.as_millis() as u64,
            "response received"
        );

        if let Some(Ok(response)) = entry.complete(Ok(response)) {
            self.notifier.emit(TransportEvent::ResponseReceived(response));
        }
    }
}

impl PublishListener for CorrelatedSender {
    fn on_published(&self, request: &PublishRequest) {
        debug!(correlation_id = %request.correlation_id, "queued ticket reached the broker");
    }

    fn on_failed(&self, request: &PublishRequest, reason: &TransportError) {
        let Some(entry) = self.cache.take(&request.correlation_id) else {
            return;
        };

        let outcome = Err(SendError::Publish(reason.clone()));
        if let Some(Err(reason)) = entry.complete(outcome) {
            self.notifier.emit(TransportEvent::SendFailed {
                ticket_id: request.ticket_id.clone(),
                correlation_id: request.correlation_id.clone(),
                reason,
            });
        }
    }
}
