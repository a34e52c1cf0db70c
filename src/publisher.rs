// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Ticket Publisher
//!
//! The [`PublisherChannel`] publishes serialized tickets on one logical channel. With the
//! publish queue enabled, calls only enqueue and a background task drains the queue in
//! FIFO order, discarding items older than the configured expiry. Without it, every
//! call publishes synchronously. Either way broker failures come back as values or
//! notifications, never as panics.
//!
//! The current trace context is injected into the message headers so the ticket can
//! be followed through the broker.

use crate::{
    broker::{HeaderValue, MessageProperties, JSON_CONTENT_TYPE},
    channel::LogicalChannel,
    config::TransportConfig,
    connection::ConnectionManager,
    errors::TransportError,
    events::{Notifier, TransportEvent},
    exchange::ExchangeDefinition,
    lock, otel,
    topology::Topology,
};
use backon::{BackoffBuilder, ExponentialBackoff, ExponentialBuilder};
use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, Weak,
    },
    time::Duration,
};
use tokio::{sync::Notify, task::JoinHandle, time::Instant};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Header carrying the routing key the response should be sent back on
pub const REPLY_ROUTING_KEY_HEADER: &str = "replyRoutingKey";

/// Drain cadence while items are waiting
const BUSY_DRAIN_INTERVAL: Duration = Duration::from_millis(200);
/// Drain cadence with an empty queue
const IDLE_DRAIN_INTERVAL: Duration = Duration::from_secs(1);

const OPEN_RETRY_MIN_DELAY: Duration = Duration::from_millis(500);
const OPEN_RETRY_MAX_DELAY: Duration = Duration::from_secs(30);
const OPEN_RETRY_FACTOR: f32 = 1.25;
const IO_RETRY_STEP: Duration = Duration::from_secs(1);
const IO_RETRY_MAX_DELAY: Duration = Duration::from_secs(10);

/// Settings of a publisher channel.
#[derive(Debug, Clone)]
pub struct PublisherSettings {
    pub exchange: ExchangeDefinition,
    pub use_queue: bool,
    /// 0 means unbounded
    pub queue_limit: usize,
    pub queue_timeout: Duration,
    pub persistent: bool,
}

impl PublisherSettings {
    pub fn from_config(cfg: &TransportConfig) -> PublisherSettings {
        PublisherSettings {
            exchange: ExchangeDefinition::from_config(cfg),
            use_queue: cfg.use_publish_queue(),
            queue_limit: cfg.publish_queue_limit,
            queue_timeout: cfg.publish_queue_timeout(),
            persistent: cfg.persistent_delivery,
        }
    }
}

/// One ticket handed to the publisher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishRequest {
    pub ticket_id: String,
    pub payload: Vec<u8>,
    pub routing_key: String,
    pub correlation_id: String,
    pub reply_routing_key: String,
}

/// How an accepted publish was handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishStatus {
    /// The broker took the message
    Published,
    /// The message waits in the publish queue
    Queued,
}

#[derive(Debug)]
struct PublishQueueItem {
    request: PublishRequest,
    enqueued_at: Instant,
}

/// Told about the outcome of queued publishes.
pub trait PublishListener: Send + Sync {
    fn on_published(&self, request: &PublishRequest);

    fn on_failed(&self, request: &PublishRequest, reason: &TransportError);
}

/// Publishes tickets on one logical channel, optionally through a bounded queue.
pub struct PublisherChannel {
    id: u32,
    manager: Arc<ConnectionManager>,
    settings: PublisherSettings,
    notifier: Notifier,
    listener: Mutex<Option<Weak<dyn PublishListener>>>,
    should_be_open: AtomicBool,
    opened: AtomicBool,
    queue: Mutex<VecDeque<PublishQueueItem>>,
    wake: Notify,
    channel: tokio::sync::Mutex<Option<Arc<LogicalChannel>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl PublisherChannel {
    /// Creates a new publisher channel; nothing happens on the broker until [`open`].
    ///
    /// # Parameters
    /// * `id` - Logical channel id, usually from [`ConnectionManager::get_unique_id`]
    /// * `manager` - Connection manager the channel is obtained from
    /// * `settings` - Exchange, queue and delivery settings
    /// * `notifier` - Where publish outcomes of queued tickets are raised
    ///
    /// # Returns
    /// An Arc-wrapped PublisherChannel instance for thread-safe sharing
    ///
    /// [`open`]: PublisherChannel::open
    pub fn new(
        id: u32,
        manager: Arc<ConnectionManager>,
        settings: PublisherSettings,
        notifier: Notifier,
    ) -> Arc<PublisherChannel> {
        Arc::new(PublisherChannel {
            id,
            manager,
            settings,
            notifier,
            listener: Mutex::new(None),
            should_be_open: AtomicBool::new(false),
            opened: AtomicBool::new(false),
            queue: Mutex::new(VecDeque::new()),
            wake: Notify::new(),
            channel: tokio::sync::Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
        })
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    /// Registers the listener told about queued publish outcomes. Held weakly.
    pub fn set_listener(&self, listener: Weak<dyn PublishListener>) {
        *lock(&self.listener) = Some(listener);
    }

    /// Whether the channel was opened on the broker and not closed since.
    pub fn is_opened(&self) -> bool {
        self.opened.load(Ordering::Acquire)
    }

    /// Number of tickets waiting in the publish queue.
    pub fn pending(&self) -> usize {
        lock(&self.queue).len()
    }

    /// Opens the channel and declares the exchange.
    ///
    /// A failed first attempt is not an error: the channel keeps being retried in the
    /// background until it opens or [`close`](PublisherChannel::close) is called.
    ///
    /// # Returns
    /// `InvalidState` when the publisher is already open
    pub async fn open(self: &Arc<Self>) -> Result<(), TransportError> {
        if self.should_be_open.swap(true, Ordering::AcqRel) {
            return Err(TransportError::InvalidState(format!(
                "publisher channel {} is already open",
                self.id
            )));
        }

        let first = {
            let mut slot = self.channel.lock().await;
            self.acquire_channel(&mut slot).await.map(|_| ())
        };
        if let Err(err) = first {
            warn!(
                channel_id = self.id,
                error = err.to_string(),
                "publisher channel not opened, retrying in background"
            );
            self.track(tokio::spawn(self.clone().reopen(err)));
        }

        if self.settings.use_queue {
            self.track(tokio::spawn(self.clone().run_drain()));
        }

        Ok(())
    }

    /// Publishes a ticket, or enqueues it when the publish queue is enabled.
    ///
    /// # Returns
    /// * `Ok(Published)` or `Ok(Queued)` on success
    /// * `InvalidState` when the channel was never opened or the connection is down
    /// * `QueueFull` when the queue holds `queue_limit` items
    /// * `PublishingError` when the broker rejected a synchronous publish
    pub async fn publish(&self, request: PublishRequest) -> Result<PublishStatus, TransportError> {
        if !self.is_opened() {
            return Err(TransportError::InvalidState(format!(
                "publisher channel {} was never opened",
                self.id
            )));
        }
        if !self.manager.status().is_connected() {
            return Err(TransportError::InvalidState(
                "connection to the broker is down".to_owned(),
            ));
        }

        if !self.settings.use_queue {
            return self.publish_now(&request).await.map(|_| PublishStatus::Published);
        }

        {
            let mut queue = lock(&self.queue);
            let limit = self.settings.queue_limit;
            if limit > 0 && queue.len() >= limit {
                warn!(ticket_id = %request.ticket_id, limit, "publish queue is full");
                return Err(TransportError::QueueFull { limit });
            }

            debug!(ticket_id = %request.ticket_id, pending = queue.len() + 1, "ticket queued");
            queue.push_back(PublishQueueItem {
                request,
                enqueued_at: Instant::now(),
            });
        }
        self.wake.notify_one();

        Ok(PublishStatus::Queued)
    }

    /// Stops publishing and releases the channel.
    ///
    /// Tickets still queued are reported failed, including one whose publish was cut
    /// short. Closing a publisher that never got a channel only stops its background
    /// retries.
    pub async fn close(&self) {
        self.should_be_open.store(false, Ordering::Release);
        let tasks: Vec<_> = lock(&self.tasks).drain(..).collect();
        for task in tasks {
            task.abort();
            // the queue is only touched once the task is gone
            let _ = task.await;
        }

        if !self.opened.swap(false, Ordering::AcqRel) {
            debug!(channel_id = self.id, "publisher channel was never opened, nothing to close");
            return;
        }

        let remaining: Vec<_> = lock(&self.queue).drain(..).collect();
        for item in remaining {
            self.report_failed(
                &item.request,
                TransportError::InvalidState("publisher closed".to_owned()),
            );
        }

        *self.channel.lock().await = None;
        self.manager.release_channel(self.id).await;
        info!(channel_id = self.id, "publisher channel closed");
    }

    fn track(&self, handle: JoinHandle<()>) {
        lock(&self.tasks).push(handle);
    }

    fn listener(&self) -> Option<Arc<dyn PublishListener>> {
        lock(&self.listener).as_ref().and_then(Weak::upgrade)
    }

    /// Returns the usable channel, (re)opening it and declaring the exchange if needed.
    async fn acquire_channel(
        &self,
        slot: &mut Option<Arc<LogicalChannel>>,
    ) -> Result<Arc<LogicalChannel>, TransportError> {
        if let Some(channel) = slot.as_ref().filter(|c| c.is_usable()) {
            return Ok(channel.clone());
        }
        if slot.take().is_some() {
            self.manager.remove_channel(self.id).await;
        }

        let channel = self.manager.get_channel(self.id).await?;
        if channel.is_marked_for_deletion() {
            return Err(TransportError::ChannelError(format!(
                "channel {} is marked for deletion",
                self.id
            )));
        }

        Topology::new()
            .exchange(self.settings.exchange.clone())
            .install(channel.transport().as_ref())
            .await?;

        *slot = Some(channel.clone());
        if !self.opened.swap(true, Ordering::AcqRel) {
            info!(channel_id = self.id, "publisher channel opened");
        }

        Ok(channel)
    }

    async fn publish_now(&self, request: &PublishRequest) -> Result<(), TransportError> {
        let mut slot = self.channel.lock().await;
        let channel = self.acquire_channel(&mut slot).await?;

        let mut properties = channel.publish_properties(|| MessageProperties {
            content_type: Some(JSON_CONTENT_TYPE.to_owned()),
            persistent: self.settings.persistent,
            ..Default::default()
        });
        properties.correlation_id = Some(request.correlation_id.clone());
        properties.message_id = Some(Uuid::new_v4().to_string());
        properties.headers.insert(
            REPLY_ROUTING_KEY_HEADER.to_owned(),
            HeaderValue::Str(request.reply_routing_key.clone()),
        );
        otel::inject_current(&mut properties.headers);

        if let Err(err) = channel
            .transport()
            .basic_publish(
                self.settings.exchange.name(),
                &request.routing_key,
                &request.payload,
                properties,
            )
            .await
        {
            error!(
                channel_id = self.id,
                ticket_id = %request.ticket_id,
                error = err.to_string(),
                "error publishing ticket"
            );
            if err.is_transient() {
                self.manager.mark_for_deletion(self.id);
                *slot = None;
            }
            return Err(TransportError::PublishingError(err.to_string()));
        }

        self.manager.status().record_sent(&request.ticket_id);
        debug!(
            channel_id = self.id,
            ticket_id = %request.ticket_id,
            correlation_id = %request.correlation_id,
            routing_key = %request.routing_key,
            "ticket published"
        );

        Ok(())
    }

    async fn reopen(self: Arc<Self>, mut last_error: TransportError) {
        let mut delays = OpenRetryDelays::new();

        while self.should_be_open.load(Ordering::Acquire) {
            let delay = delays.next(&last_error);
            debug!(
                channel_id = self.id,
                delay_ms = delay.as_millis() as u64,
                error = last_error.to_string(),
                "retrying to open the publisher channel"
            );
            tokio::time::sleep(delay).await;

            if !self.should_be_open.load(Ordering::Acquire) {
                break;
            }

            let mut slot = self.channel.lock().await;
            match self.acquire_channel(&mut slot).await {
                Ok(_) => return,
                Err(err) => last_error = err,
            }
        }
    }

    async fn run_drain(self: Arc<Self>) {
        while self.should_be_open.load(Ordering::Acquire) {
            self.drain().await;

            let delay = if lock(&self.queue).is_empty() {
                IDLE_DRAIN_INTERVAL
            } else {
                BUSY_DRAIN_INTERVAL
            };
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = self.wake.notified() => {}
            }
        }
        debug!(channel_id = self.id, "publish queue drain stopped");
    }

    async fn drain(&self) {
        if !self.manager.status().is_connected() {
            self.discard_expired();
            if lock(&self.queue).is_empty() {
                return;
            }

            let mut slot = self.channel.lock().await;
            if let Err(err) = self.acquire_channel(&mut slot).await {
                debug!(
                    channel_id = self.id,
                    error = err.to_string(),
                    "broker still unreachable, keeping tickets queued"
                );
                return;
            }
        }

        loop {
            if !self.should_be_open.load(Ordering::Acquire)
                || !self.manager.status().is_connected()
            {
                return;
            }

            // the head stays queued until its outcome is known, so a close in the
            // middle of the publish still finds and reports it
            let Some((request, enqueued_at)) = lock(&self.queue)
                .front()
                .map(|item| (item.request.clone(), item.enqueued_at))
            else {
                return;
            };

            let age = enqueued_at.elapsed();
            let outcome = if age > self.settings.queue_timeout {
                Err(TransportError::Expired {
                    age_ms: age.as_millis(),
                })
            } else {
                self.publish_now(&request).await
            };

            lock(&self.queue).pop_front();
            match outcome {
                Ok(()) => self.report_published(&request),
                Err(err) => self.report_failed(&request, err),
            }
        }
    }

    fn discard_expired(&self) {
        let timeout = self.settings.queue_timeout;
        let expired: Vec<_> = {
            let mut queue = lock(&self.queue);
            let (expired, kept) = queue
                .drain(..)
                .partition::<Vec<_>, _>(|item| item.enqueued_at.elapsed() > timeout);
            queue.extend(kept);
            expired
        };

        for item in expired {
            let age_ms = item.enqueued_at.elapsed().as_millis();
            self.report_failed(&item.request, TransportError::Expired { age_ms });
        }
    }

    fn report_published(&self, request: &PublishRequest) {
        self.notifier.emit(TransportEvent::PublishSucceeded {
            ticket_id: request.ticket_id.clone(),
            correlation_id: request.correlation_id.clone(),
        });
        if let Some(listener) = self.listener() {
            listener.on_published(request);
        }
    }

    fn report_failed(&self, request: &PublishRequest, reason: TransportError) {
        warn!(
            ticket_id = %request.ticket_id,
            correlation_id = %request.correlation_id,
            error = reason.to_string(),
            "queued ticket not published"
        );
        if let Some(listener) = self.listener() {
            listener.on_failed(request, &reason);
        }
        self.notifier.emit(TransportEvent::PublishFailed {
            ticket_id: request.ticket_id.clone(),
            correlation_id: request.correlation_id.clone(),
            reason,
        });
    }
}

/// Pauses between attempts to open the channel: multiplicative for broker errors,
/// linear for I/O errors, both capped.
struct OpenRetryDelays {
    backoff: ExponentialBackoff,
    io_attempts: u32,
}

impl OpenRetryDelays {
    fn new() -> OpenRetryDelays {
        OpenRetryDelays {
            backoff: ExponentialBuilder::default()
                .with_factor(OPEN_RETRY_FACTOR)
                .with_min_delay(OPEN_RETRY_MIN_DELAY)
                .with_max_delay(OPEN_RETRY_MAX_DELAY)
                .without_max_times()
                .build(),
            io_attempts: 0,
        }
    }

    fn next(&mut self, last_error: &TransportError) -> Duration {
        if last_error.is_transient() {
            self.io_attempts += 1;
            return (IO_RETRY_STEP * self.io_attempts).min(IO_RETRY_MAX_DELAY);
        }

        self.backoff.next().unwrap_or(OPEN_RETRY_MAX_DELAY)
    }
}
