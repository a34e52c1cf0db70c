// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Response Consumer
//!
//! The [`ConsumerChannel`] receives ticket responses on one logical channel. Opening
//! it declares the exchange and a queue bound with every routing key, then starts a
//! consumer whose deliveries are handed to a [`MessageHandler`]. A health-check task
//! recreates the consumer when it is gone. An unexpected end of the delivery stream
//! triggers a check shortly after instead of waiting for the next interval.
//!
//! With explicit acknowledgement, deliveries are acknowledged one by one or in
//! batches, retrying a bounded number of times. A delivery tag the broker no longer
//! knows is not an error.

use crate::{
    broker::{BrokerChannel, ConsumeOptions, DeliveryStream, RawDelivery},
    channel::LogicalChannel,
    config::TransportConfig,
    connection::ConnectionManager,
    errors::TransportError,
    exchange::ExchangeDefinition,
    lock, otel,
    queue::QueueDefinition,
    ticket::TicketCategory,
    topology::Topology,
};
use futures_util::StreamExt;
use opentelemetry::{
    global::{self, BoxedTracer},
    trace::{Span, Status},
};
use std::{
    collections::BTreeMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};
use tokio::{sync::Notify, task::JoinHandle};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Headers forwarded with every received message
pub const FORWARDED_HEADERS: [&str; 3] = [
    "receivedUtcTimestamp",
    "validatedUtcTimestamp",
    "respondedUtcTimestamp",
];
/// Key the delivery content type is forwarded under
pub const CONTENT_TYPE_HEADER: &str = "content-type";

/// Delay of the health check following an unexpected consumer stop
const QUICK_HEALTH_CHECK: Duration = Duration::from_millis(100);
const ACK_ATTEMPTS: u32 = 5;
const ACK_RETRY_STEP: Duration = Duration::from_millis(100);

/// Settings of a consumer channel.
#[derive(Debug, Clone)]
pub struct ConsumerSettings {
    pub exchange: ExchangeDefinition,
    pub durable_queue: bool,
    pub exclusive: bool,
    pub prefetch_count: u16,
    pub explicit_acking: bool,
    /// 1 acknowledges every delivery on its own
    pub ack_batch_limit: usize,
    pub ack_timeout: Duration,
    pub health_check_interval: Duration,
    /// Prefix of the consumer tags
    pub tag_prefix: String,
}

impl ConsumerSettings {
    pub fn from_config(cfg: &TransportConfig) -> ConsumerSettings {
        ConsumerSettings {
            exchange: ExchangeDefinition::from_config(cfg),
            durable_queue: cfg.durable_queue,
            exclusive: cfg.exclusive_consumer,
            prefetch_count: cfg.prefetch_count,
            explicit_acking: cfg.explicit_acking,
            ack_batch_limit: cfg.ack_batch_limit,
            ack_timeout: cfg.ack_timeout(),
            health_check_interval: cfg.health_check_interval(),
            tag_prefix: cfg.app_name.clone(),
        }
    }
}

/// A delivery as handed to the owner of the consumer.
#[derive(Debug, Clone, PartialEq)]
pub struct ReceivedMessage {
    pub channel_id: u32,
    pub delivery_tag: u64,
    pub routing_key: String,
    pub correlation_id: Option<String>,
    /// Response kind the delivery declares
    pub category: TicketCategory,
    /// Whitelisted headers, as text
    pub headers: BTreeMap<String, String>,
    pub body: Vec<u8>,
}

impl ReceivedMessage {
    fn from_delivery(channel_id: u32, delivery: RawDelivery) -> ReceivedMessage {
        let props = delivery.properties;

        let mut headers: BTreeMap<String, String> = FORWARDED_HEADERS
            .iter()
            .filter_map(|key| {
                props
                    .headers
                    .get(*key)
                    .map(|value| (key.to_string(), value.to_text()))
            })
            .collect();
        if let Some(content_type) = &props.content_type {
            headers.insert(CONTENT_TYPE_HEADER.to_owned(), content_type.clone());
        }

        ReceivedMessage {
            channel_id,
            delivery_tag: delivery.delivery_tag,
            category: TicketCategory::from_declared(props.kind.as_deref(), &delivery.routing_key),
            routing_key: delivery.routing_key,
            correlation_id: props.correlation_id,
            headers,
            body: delivery.body,
        }
    }
}

/// Receives the deliveries of a consumer channel.
///
/// Called on the delivery task; implementations must return quickly.
pub trait MessageHandler: Send + Sync {
    fn handle(&self, message: ReceivedMessage);
}

/// Health probe result of a consumer channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelHealth {
    pub healthy: bool,
    pub status: String,
}

#[derive(Default)]
struct ConsumerState {
    requested_queue: String,
    routing_keys: Vec<String>,
    queue_name: Option<String>,
    channel: Option<Arc<LogicalChannel>>,
    last_error: Option<String>,
}

#[derive(Default)]
struct AckBatch {
    pending: usize,
    last_tag: u64,
    epoch: u64,
}

/// Consumes ticket responses on one logical channel.
pub struct ConsumerChannel {
    id: u32,
    manager: Arc<ConnectionManager>,
    settings: ConsumerSettings,
    handler: Arc<dyn MessageHandler>,
    should_be_open: AtomicBool,
    consuming: AtomicBool,
    wake: Notify,
    state: Mutex<ConsumerState>,
    batch: Mutex<AckBatch>,
    health_task: Mutex<Option<JoinHandle<()>>>,
    delivery_task: Mutex<Option<JoinHandle<()>>>,
}

impl ConsumerChannel {
    /// Creates a new consumer channel; nothing happens on the broker until [`open`].
    ///
    /// # Parameters
    /// * `id` - Logical channel id, usually from [`ConnectionManager::get_unique_id`]
    /// * `manager` - Connection manager the channel is obtained from
    /// * `settings` - Queue, acknowledgement and health-check settings
    /// * `handler` - Receives every delivery
    ///
    /// # Returns
    /// An Arc-wrapped ConsumerChannel instance for thread-safe sharing
    ///
    /// [`open`]: ConsumerChannel::open
    pub fn new(
        id: u32,
        manager: Arc<ConnectionManager>,
        settings: ConsumerSettings,
        handler: Arc<dyn MessageHandler>,
    ) -> Arc<ConsumerChannel> {
        Arc::new(ConsumerChannel {
            id,
            manager,
            settings,
            handler,
            should_be_open: AtomicBool::new(false),
            consuming: AtomicBool::new(false),
            wake: Notify::new(),
            state: Mutex::new(ConsumerState::default()),
            batch: Mutex::new(AckBatch::default()),
            health_task: Mutex::new(None),
            delivery_task: Mutex::new(None),
        })
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    /// Opens the channel and starts consuming.
    ///
    /// Declares the exchange and the queue, binds the queue with every routing key, sets
    /// the prefetch and starts the consumer. If that fails, the health check retries
    /// shortly after.
    ///
    /// # Parameters
    /// * `queue_name` - Queue to consume from; `None` lets the broker name it
    /// * `routing_keys` - Routing keys the queue is bound with, at least one
    ///
    /// # Returns
    /// `InvalidArgument` without routing keys, `InvalidState` when already opened
    pub async fn open(
        self: &Arc<Self>,
        queue_name: Option<&str>,
        routing_keys: &[&str],
    ) -> Result<(), TransportError> {
        if routing_keys.is_empty() {
            return Err(TransportError::InvalidArgument(
                "at least one routing key is required".to_owned(),
            ));
        }
        if self.should_be_open.swap(true, Ordering::AcqRel) {
            return Err(TransportError::InvalidState(format!(
                "consumer channel {} is already opened",
                self.id
            )));
        }

        {
            let mut state = lock(&self.state);
            state.requested_queue = queue_name.unwrap_or_default().to_owned();
            state.routing_keys = routing_keys.iter().map(|k| k.to_string()).collect();
        }

        if let Err(err) = self.start_consuming().await {
            warn!(
                channel_id = self.id,
                error = err.to_string(),
                "consumer channel not opened, the health check will retry"
            );
            lock(&self.state).last_error = Some(err.to_string());
            self.wake.notify_one();
        }

        let task = tokio::spawn(self.clone().run_health_checks());
        *lock(&self.health_task) = Some(task);

        Ok(())
    }

    /// Whether the consumer is running on a usable channel.
    pub fn is_consuming(&self) -> bool {
        self.consuming.load(Ordering::Acquire)
            && lock(&self.state)
                .channel
                .as_ref()
                .is_some_and(|c| c.is_usable())
    }

    /// Effective name of the consumed queue, once declared.
    pub fn queue_name(&self) -> Option<String> {
        lock(&self.state).queue_name.clone()
    }

    /// Reports whether the channel is consuming, with a readable status.
    pub fn health(&self) -> ChannelHealth {
        if !self.should_be_open.load(Ordering::Acquire) {
            return ChannelHealth {
                healthy: false,
                status: format!("consumer channel {} is closed", self.id),
            };
        }

        if self.is_consuming() {
            let queue = self.queue_name().unwrap_or_default();
            return ChannelHealth {
                healthy: true,
                status: format!("consumer channel {} is consuming from {}", self.id, queue),
            };
        }

        let reason = lock(&self.state)
            .last_error
            .clone()
            .unwrap_or_else(|| "waiting for the next health check".to_owned());
        ChannelHealth {
            healthy: false,
            status: format!("consumer channel {} is not consuming: {}", self.id, reason),
        }
    }

    /// Stops consuming and releases the channel. Closing twice only logs.
    pub async fn close(&self) {
        if !self.should_be_open.swap(false, Ordering::AcqRel) {
            warn!(channel_id = self.id, "consumer channel is not open");
            return;
        }

        if let Some(task) = lock(&self.health_task).take() {
            task.abort();
        }
        if let Some(task) = lock(&self.delivery_task).take() {
            task.abort();
        }
        self.consuming.store(false, Ordering::Release);

        let channel = lock(&self.state).channel.take();
        if let Some(channel) = channel {
            if self.settings.explicit_acking {
                self.flush_batch(None, channel.transport()).await;
            }

            if let Some(tag) = channel.consumer_tag() {
                if channel.transport().is_open() {
                    if let Err(err) = channel.transport().basic_cancel(&tag).await {
                        debug!(
                            channel_id = self.id,
                            error = err.to_string(),
                            "error canceling the consumer"
                        );
                    }
                }
            }
        }

        self.manager.release_channel(self.id).await;
        info!(channel_id = self.id, "consumer channel closed");
    }

    async fn start_consuming(self: &Arc<Self>) -> Result<(), TransportError> {
        let (requested, routing_keys) = {
            let state = lock(&self.state);
            (state.requested_queue.clone(), state.routing_keys.clone())
        };

        let channel = self.manager.get_channel(self.id).await?;
        let transport = channel.transport();

        let queue = QueueDefinition::for_responses(
            Some(&requested),
            self.settings.durable_queue,
            self.settings.exclusive,
        );

        let topology = routing_keys.iter().fold(
            Topology::new()
                .exchange(self.settings.exchange.clone())
                .queue(queue),
            |topology, key| topology.routing_key(key),
        );
        let queue_name = topology
            .install(transport.as_ref())
            .await?
            .unwrap_or(requested);

        transport.basic_qos(self.settings.prefetch_count).await?;

        let tag = format!("{}.{}.{}", self.settings.tag_prefix, self.id, Uuid::new_v4().simple());
        let stream = transport
            .basic_consume(
                &queue_name,
                &tag,
                ConsumeOptions {
                    no_ack: !self.settings.explicit_acking,
                    exclusive: self.settings.exclusive,
                },
            )
            .await?;
        channel.set_consumer_tag(Some(tag.clone()));

        {
            let mut state = lock(&self.state);
            state.queue_name = Some(queue_name.clone());
            state.channel = Some(channel.clone());
            state.last_error = None;
        }
        {
            let mut batch = lock(&self.batch);
            batch.pending = 0;
            batch.epoch += 1;
        }
        self.consuming.store(true, Ordering::Release);

        let task = tokio::spawn(self.clone().run_deliveries(channel, stream));
        if let Some(previous) = lock(&self.delivery_task).replace(task) {
            previous.abort();
        }

        info!(
            channel_id = self.id,
            queue = %queue_name,
            consumer_tag = %tag,
            "consumer started"
        );
        Ok(())
    }

    async fn run_deliveries(self: Arc<Self>, channel: Arc<LogicalChannel>, mut stream: DeliveryStream) {
        let tracer = global::tracer("ticket consumer");

        while let Some(result) = stream.next().await {
            match result {
                Ok(delivery) => self.dispatch(&tracer, &channel, delivery),
                Err(err) => error!(channel_id = self.id, error = err.to_string(), "error receiving delivery"),
            }
        }

        self.consuming.store(false, Ordering::Release);
        if self.should_be_open.load(Ordering::Acquire) {
            warn!(channel_id = self.id, "consumer stopped unexpectedly, checking again shortly");
            channel.mark_for_deletion();
            lock(&self.state).last_error = Some("consumer stream ended".to_owned());
            self.wake.notify_one();
        }
    }

    fn dispatch(self: &Arc<Self>, tracer: &BoxedTracer, channel: &Arc<LogicalChannel>, delivery: RawDelivery) {
        let (_ctx, mut span) = otel::new_span(&delivery.properties.headers, tracer, &delivery.routing_key);

        let message = ReceivedMessage::from_delivery(self.id, delivery);
        debug!(
            channel_id = self.id,
            routing_key = %message.routing_key,
            correlation_id = ?message.correlation_id,
            "delivery received"
        );

        let tag = message.delivery_tag;
        self.handler.handle(message);
        span.set_status(Status::Ok);
        span.end();

        if self.settings.explicit_acking {
            self.acknowledge(channel.transport(), tag);
        }
    }

    fn acknowledge(self: &Arc<Self>, transport: &Arc<dyn BrokerChannel>, tag: u64) {
        let limit = self.settings.ack_batch_limit;
        if limit <= 1 {
            tokio::spawn(ack_in_background(transport.clone(), self.id, tag, false));
            return;
        }

        let (full, first) = {
            let mut batch = lock(&self.batch);
            batch.pending += 1;
            batch.last_tag = tag;
            if batch.pending >= limit {
                batch.pending = 0;
                batch.epoch += 1;
                (true, None)
            } else if batch.pending == 1 {
                (false, Some(batch.epoch))
            } else {
                (false, None)
            }
        };

        if full {
            tokio::spawn(ack_in_background(transport.clone(), self.id, tag, true));
        } else if let Some(epoch) = first {
            let consumer = self.clone();
            let transport = transport.clone();
            tokio::spawn(async move {
                tokio::time::sleep(consumer.settings.ack_timeout).await;
                consumer.flush_batch(Some(epoch), &transport).await;
            });
        }
    }

    /// Acknowledges every pending delivery of the batch, unless `epoch` shows the batch
    /// was already flushed.
    async fn flush_batch(&self, epoch: Option<u64>, transport: &Arc<dyn BrokerChannel>) {
        let tag = {
            let mut batch = lock(&self.batch);
            if batch.pending == 0 || epoch.is_some_and(|e| e != batch.epoch) {
                return;
            }
            batch.pending = 0;
            batch.epoch += 1;
            batch.last_tag
        };

        if let Err(err) = ack_with_retry(transport.as_ref(), tag, true).await {
            error!(channel_id = self.id, delivery_tag = tag, error = err.to_string(), "giving up acknowledging deliveries");
        }
    }

    /// Checks every interval, or shortly after a wake-up. A wake-up raised while a
    /// check runs is kept by the `Notify` permit and served on the next iteration.
    async fn run_health_checks(self: Arc<Self>) {
        while self.should_be_open.load(Ordering::Acquire) {
            tokio::select! {
                _ = tokio::time::sleep(self.settings.health_check_interval) => {}
                _ = self.wake.notified() => tokio::time::sleep(QUICK_HEALTH_CHECK).await,
            }

            self.check_health().await;
        }
    }

    async fn check_health(self: &Arc<Self>) {
        if !self.should_be_open.load(Ordering::Acquire) {
            return;
        }
        if self.is_consuming() {
            debug!(channel_id = self.id, "consumer channel is healthy");
            return;
        }

        let stale = lock(&self.state).channel.take();
        if let Some(stale) = stale {
            stale.mark_for_deletion();
            self.manager.remove_channel(self.id).await;
        }

        match self.start_consuming().await {
            Ok(()) => info!(channel_id = self.id, "consumer channel reopened"),
            Err(err) => {
                warn!(
                    channel_id = self.id,
                    error = err.to_string(),
                    "consumer channel still down"
                );
                lock(&self.state).last_error = Some(err.to_string());
            }
        }
    }
}

/// Acknowledges a delivery, retrying with an increasing pause.
///
/// An unknown delivery tag means the broker already dropped the delivery and counts as
/// done. A closed channel cannot acknowledge anything and is not retried.
///
/// # Parameters
/// * `transport` - Channel the delivery came from
/// * `tag` - Delivery tag
/// * `multiple` - Acknowledge every delivery up to `tag`
///
/// # Returns
/// `AckMessageError` when the acknowledgement was abandoned
pub(crate) async fn ack_with_retry(
    transport: &dyn BrokerChannel,
    tag: u64,
    multiple: bool,
) -> Result<(), TransportError> {
    let mut last_error = String::new();

    for attempt in 1..=ACK_ATTEMPTS {
        match transport.basic_ack(tag, multiple).await {
            Ok(()) => return Ok(()),
            Err(TransportError::UnknownDeliveryTag) => {
                debug!(delivery_tag = tag, "delivery tag already reclaimed by the broker");
                return Ok(());
            }
            Err(err @ TransportError::ChannelClosed(_)) => {
                return Err(TransportError::AckMessageError(err.to_string()));
            }
            Err(err) => {
                warn!(delivery_tag = tag, attempt, error = err.to_string(), "error acknowledging delivery");
                last_error = err.to_string();
                if attempt < ACK_ATTEMPTS {
                    tokio::time::sleep(ACK_RETRY_STEP * attempt).await;
                }
            }
        }
    }

    Err(TransportError::AckMessageError(last_error))
}

async fn ack_in_background(transport: Arc<dyn BrokerChannel>, channel_id: u32, tag: u64, multiple: bool) {
    if let Err(err) = ack_with_retry(transport.as_ref(), tag, multiple).await {
        error!(channel_id, delivery_tag = tag, error = err.to_string(), "giving up acknowledging delivery");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        broker::{HeaderValue, MessageProperties, MockBrokerChannel},
        events::Notifier,
        testing::{fake_manager, FakeBroker},
    };
    use mockall::Sequence;

    const REPLY_KEY: &str = "node1.ticket.confirm";

    #[derive(Default)]
    struct Recorder {
        messages: Mutex<Vec<ReceivedMessage>>,
    }

    impl MessageHandler for Recorder {
        fn handle(&self, message: ReceivedMessage) {
            lock(&self.messages).push(message);
        }
    }

    impl Recorder {
        fn received(&self) -> Vec<ReceivedMessage> {
            lock(&self.messages).clone()
        }
    }

    fn consumer(broker: &Arc<FakeBroker>, cfg: TransportConfig) -> (Arc<ConsumerChannel>, Arc<Recorder>) {
        let manager = fake_manager(broker, &cfg, &Notifier::default());
        let recorder = Arc::new(Recorder::default());
        let consumer = ConsumerChannel::new(
            manager.get_unique_id(),
            manager,
            ConsumerSettings::from_config(&cfg),
            recorder.clone(),
        );
        (consumer, recorder)
    }

    fn explicit(batch: usize) -> TransportConfig {
        TransportConfig {
            explicit_acking: true,
            ack_batch_limit: batch,
            ack_timeout_ms: 1_000,
            ..Default::default()
        }
    }

    fn reply(correlation_id: &str) -> MessageProperties {
        MessageProperties {
            correlation_id: Some(correlation_id.to_owned()),
            ..Default::default()
        }
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn bound_routing_key_delivers_to_the_handler() {
        let broker = FakeBroker::new();
        let (consumer, recorder) = consumer(&broker, TransportConfig::default());
        consumer.open(None, &[REPLY_KEY]).await.unwrap();

        assert_eq!(broker.deliver(REPLY_KEY, reply("c-1"), b"{\"result\":\"accepted\"}"), 1);
        settle().await;

        let received = recorder.received();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].correlation_id.as_deref(), Some("c-1"));
        assert_eq!(received[0].routing_key, REPLY_KEY);
        assert_eq!(received[0].body, b"{\"result\":\"accepted\"}".to_vec());
        assert_eq!(received[0].category, TicketCategory::Ticket);

        let bindings = broker.bindings();
        assert_eq!(bindings.len(), 1);
        assert_eq!(bindings[0].routing_key, REPLY_KEY);
        assert_eq!(consumer.queue_name().as_deref(), Some("amq.gen-1"));
        assert!(consumer.health().healthy);
    }

    #[tokio::test]
    async fn open_validates_its_arguments() {
        let broker = FakeBroker::new();
        let (consumer, _) = consumer(&broker, TransportConfig::default());

        assert!(matches!(
            consumer.open(Some("responses"), &[]).await,
            Err(TransportError::InvalidArgument(_))
        ));

        consumer.open(Some("responses"), &[REPLY_KEY]).await.unwrap();
        assert!(matches!(
            consumer.open(Some("responses"), &[REPLY_KEY]).await,
            Err(TransportError::InvalidState(_))
        ));
        consumer.close().await;
    }

    #[tokio::test]
    async fn queue_follows_the_settings() {
        let broker = FakeBroker::new();
        let cfg = TransportConfig {
            durable_queue: true,
            exclusive_consumer: false,
            ..Default::default()
        };
        let (consumer, _) = consumer(&broker, cfg);
        consumer.open(Some("mts-responses"), &[REPLY_KEY, "node1.cancel.confirm"]).await.unwrap();

        assert_eq!(
            broker.queues(),
            vec![QueueDefinition::for_responses(Some("mts-responses"), true, false)]
        );
        assert_eq!(broker.bindings().len(), 2);
        assert_eq!(consumer.queue_name().as_deref(), Some("mts-responses"));
        consumer.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn whitelisted_headers_and_declared_kind_are_forwarded() {
        let broker = FakeBroker::new();
        let (consumer, recorder) = consumer(&broker, TransportConfig::default());
        consumer.open(None, &["node1.cancel.confirm"]).await.unwrap();

        let mut props = reply("c-9");
        props.content_type = Some("application/json".into());
        props.kind = Some("TicketCashoutResponse".into());
        props.headers.insert("receivedUtcTimestamp".into(), HeaderValue::Int(1_700_000_000_000));
        props.headers.insert("x-internal".into(), HeaderValue::Str("hidden".into()));
        broker.deliver("node1.cancel.confirm", props, b"{}");
        settle().await;

        let message = &recorder.received()[0];
        assert_eq!(message.category, TicketCategory::Cashout);
        assert_eq!(
            message.headers.get("receivedUtcTimestamp").map(String::as_str),
            Some("1700000000000")
        );
        assert_eq!(
            message.headers.get(CONTENT_TYPE_HEADER).map(String::as_str),
            Some("application/json")
        );
        assert!(!message.headers.contains_key("x-internal"));
    }

    #[tokio::test(start_paused = true)]
    async fn explicit_acking_acknowledges_each_delivery() {
        let broker = FakeBroker::new();
        let (consumer, _) = consumer(&broker, explicit(1));
        consumer.open(None, &[REPLY_KEY]).await.unwrap();

        broker.deliver(REPLY_KEY, reply("c-1"), b"{}");
        broker.deliver(REPLY_KEY, reply("c-2"), b"{}");
        settle().await;

        assert_eq!(broker.acks(), vec![(1, false), (2, false)]);
    }

    #[tokio::test(start_paused = true)]
    async fn automatic_acking_sends_no_acks() {
        let broker = FakeBroker::new();
        let (consumer, recorder) = consumer(&broker, TransportConfig::default());
        consumer.open(None, &[REPLY_KEY]).await.unwrap();

        broker.deliver(REPLY_KEY, reply("c-1"), b"{}");
        settle().await;

        assert_eq!(recorder.received().len(), 1);
        assert!(broker.acks().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn batched_acks_flush_on_count_and_on_timeout() {
        let broker = FakeBroker::new();
        let (consumer, _) = consumer(&broker, explicit(3));
        consumer.open(None, &[REPLY_KEY]).await.unwrap();

        for id in ["c-1", "c-2", "c-3", "c-4"] {
            broker.deliver(REPLY_KEY, reply(id), b"{}");
        }
        settle().await;
        assert_eq!(broker.acks(), vec![(3, true)]);

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(broker.acks(), vec![(3, true), (4, true)]);
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_delivery_tag_is_not_a_failure() {
        let mut transport = MockBrokerChannel::new();
        let mut seq = Sequence::new();
        transport
            .expect_basic_ack()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Err(TransportError::Broker("timeout".into())));
        transport
            .expect_basic_ack()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Err(TransportError::UnknownDeliveryTag));

        assert_eq!(ack_with_retry(&transport, 7, false).await, Ok(()));
    }

    #[tokio::test(start_paused = true)]
    async fn ack_gives_up_after_bounded_attempts() {
        let mut transport = MockBrokerChannel::new();
        transport
            .expect_basic_ack()
            .times(ACK_ATTEMPTS as usize)
            .returning(|_, _| Err(TransportError::Broker("timeout".into())));

        assert!(matches!(
            ack_with_retry(&transport, 7, false).await,
            Err(TransportError::AckMessageError(_))
        ));
    }

    #[tokio::test]
    async fn ack_on_closed_channel_is_not_retried() {
        let mut transport = MockBrokerChannel::new();
        transport
            .expect_basic_ack()
            .times(1)
            .returning(|_, _| Err(TransportError::ChannelClosed("gone".into())));

        assert!(matches!(
            ack_with_retry(&transport, 7, false).await,
            Err(TransportError::AckMessageError(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn unexpected_stop_is_repaired_shortly() {
        let broker = FakeBroker::new();
        let (consumer, recorder) = consumer(&broker, TransportConfig::default());
        consumer.open(None, &[REPLY_KEY]).await.unwrap();

        broker.end_consumers();
        settle().await;
        assert!(!consumer.is_consuming());

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(consumer.is_consuming());
        assert_eq!(broker.consumer_count(), 1);
        assert_eq!(broker.channels_created(), 2);

        broker.deliver(REPLY_KEY, reply("c-2"), b"{}");
        settle().await;
        assert_eq!(recorder.received().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_ack_retries_and_unknown_tag_keep_consuming() {
        let broker = FakeBroker::new();
        broker.script_acks(vec![
            Err(TransportError::Broker("timeout".into())),
            Err(TransportError::UnknownDeliveryTag),
        ]);
        let (consumer, recorder) = consumer(&broker, explicit(1));
        consumer.open(None, &[REPLY_KEY]).await.unwrap();

        broker.deliver(REPLY_KEY, reply("c-1"), b"{}");
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(recorder.received().len(), 1);
        assert!(broker.acks().is_empty());
        assert!(consumer.is_consuming());

        broker.deliver(REPLY_KEY, reply("c-2"), b"{}");
        settle().await;
        assert_eq!(recorder.received().len(), 2);
        assert_eq!(broker.acks(), vec![(2, false)]);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_first_open_is_retried_shortly() {
        let broker = FakeBroker::new();
        broker.set_reachable(false);
        let (consumer, _) = consumer(&broker, TransportConfig::default());

        consumer.open(None, &[REPLY_KEY]).await.unwrap();
        assert!(!consumer.is_consuming());
        assert!(!consumer.health().healthy);

        broker.set_reachable(true);
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(consumer.is_consuming());
        assert_eq!(broker.consumer_count(), 1);
        consumer.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn every_unexpected_stop_is_repaired_shortly() {
        let broker = FakeBroker::new();
        let (consumer, _) = consumer(&broker, TransportConfig::default());
        consumer.open(None, &[REPLY_KEY]).await.unwrap();

        for round in 1..=3 {
            broker.end_consumers();
            settle().await;
            assert!(!consumer.is_consuming());

            tokio::time::sleep(Duration::from_millis(200)).await;
            assert!(consumer.is_consuming(), "not repaired after stop {round}");
            assert_eq!(broker.consumer_count(), 1);
        }
        consumer.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn health_check_reopens_after_an_outage() {
        let broker = FakeBroker::new();
        let (consumer, _) = consumer(&broker, TransportConfig::default());
        consumer.open(None, &[REPLY_KEY]).await.unwrap();

        broker.set_reachable(false);
        broker.kill_connections("broker restart");
        tokio::time::sleep(Duration::from_secs(1)).await;

        let health = consumer.health();
        assert!(!health.healthy);
        assert!(health.status.contains("not consuming"));

        broker.set_reachable(true);
        tokio::time::sleep(Duration::from_secs(181)).await;
        assert!(consumer.health().healthy);
        assert_eq!(broker.consumer_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn close_cancels_the_consumer() {
        let broker = FakeBroker::new();
        let (consumer, _) = consumer(&broker, TransportConfig::default());
        consumer.open(None, &[REPLY_KEY]).await.unwrap();

        consumer.close().await;
        consumer.close().await;

        assert_eq!(broker.consumer_count(), 0);
        assert!(!consumer.health().healthy);
        assert_eq!(broker.deliver(REPLY_KEY, reply("c-1"), b"{}"), 0);
    }
}
