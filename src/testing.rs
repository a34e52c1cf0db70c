// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! In-memory broker used by the unit tests. It routes published messages nowhere,
//! records them instead, and delivers messages to consumers whose queue was bound with
//! the exact routing key (or `#`).

use crate::{
    broker::{
        BrokerChannel, BrokerConnection, BrokerConnector, ConsumeOptions, DeliveryStream,
        MessageProperties, RawDelivery, ShutdownHandler,
    },
    channel::SequentialIdGenerator,
    config::TransportConfig,
    connection::ConnectionManager,
    errors::TransportError,
    events::Notifier,
    exchange::ExchangeDefinition,
    lock,
    queue::{QueueBinding, QueueDefinition},
    status::ConnectionStatus,
};
use async_trait::async_trait;
use futures_util::{stream, StreamExt};
use std::{
    collections::{HashMap, VecDeque},
    time::Duration,
    sync::{
        atomic::{AtomicBool, AtomicU16, Ordering},
        Arc, Mutex,
    },
};
use tokio::sync::mpsc;

/// Connection manager over `broker` whose status reports to `notifier`.
pub(crate) fn fake_manager(
    broker: &Arc<FakeBroker>,
    cfg: &TransportConfig,
    notifier: &Notifier,
) -> Arc<ConnectionManager> {
    Arc::new(ConnectionManager::new(
        cfg,
        broker.connector(),
        Arc::new(ConnectionStatus::new(notifier.clone())),
        Arc::new(SequentialIdGenerator::default()),
    ))
}

type DeliverySender = mpsc::UnboundedSender<Result<RawDelivery, TransportError>>;

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Published {
    pub exchange: String,
    pub routing_key: String,
    pub payload: Vec<u8>,
    pub properties: MessageProperties,
}

struct ActiveConsumer {
    queue: String,
    channel_id: u16,
    sender: DeliverySender,
}

#[derive(Default)]
struct BrokerState {
    reachable: bool,
    connect_attempts: usize,
    channels_created: usize,
    connections: Vec<Arc<FakeConnection>>,
    exchanges: Vec<String>,
    queues: Vec<QueueDefinition>,
    bindings: Vec<QueueBinding>,
    published: Vec<Published>,
    publish_failures: VecDeque<TransportError>,
    publish_delay: Duration,
    ack_results: VecDeque<Result<(), TransportError>>,
    acks: Vec<(u64, bool)>,
    consumers: HashMap<String, ActiveConsumer>,
    next_tag: u64,
    generated_queues: usize,
}

pub(crate) struct FakeBroker {
    state: Mutex<BrokerState>,
    next_channel: AtomicU16,
}

impl FakeBroker {
    pub fn new() -> Arc<FakeBroker> {
        Arc::new(FakeBroker {
            state: Mutex::new(BrokerState {
                reachable: true,
                ..Default::default()
            }),
            next_channel: AtomicU16::new(1),
        })
    }

    pub fn connector(self: &Arc<Self>) -> Arc<dyn BrokerConnector> {
        Arc::new(FakeConnector {
            broker: self.clone(),
        })
    }

    pub fn set_reachable(&self, reachable: bool) {
        lock(&self.state).reachable = reachable;
    }

    pub fn connect_attempts(&self) -> usize {
        lock(&self.state).connect_attempts
    }

    pub fn channels_created(&self) -> usize {
        lock(&self.state).channels_created
    }

    pub fn connection(&self, index: usize) -> Arc<FakeConnection> {
        lock(&self.state).connections[index].clone()
    }

    /// Drops every open connection as if the broker went away.
    pub fn kill_connections(&self, reason: &str) {
        let connections: Vec<_> = lock(&self.state)
            .connections
            .iter()
            .filter(|c| c.is_open())
            .cloned()
            .collect();
        for connection in connections {
            connection.kill(reason);
        }
    }

    pub fn fail_next_publish(&self, err: TransportError) {
        lock(&self.state).publish_failures.push_back(err);
    }

    /// Every publish takes `delay` before the broker answers.
    pub fn delay_publishes(&self, delay: Duration) {
        lock(&self.state).publish_delay = delay;
    }

    pub fn script_acks(&self, results: Vec<Result<(), TransportError>>) {
        lock(&self.state).ack_results.extend(results);
    }

    pub fn published(&self) -> Vec<Published> {
        lock(&self.state).published.clone()
    }

    pub fn acks(&self) -> Vec<(u64, bool)> {
        lock(&self.state).acks.clone()
    }

    pub fn bindings(&self) -> Vec<QueueBinding> {
        lock(&self.state).bindings.clone()
    }

    pub fn queues(&self) -> Vec<QueueDefinition> {
        lock(&self.state).queues.clone()
    }

    pub fn exchanges(&self) -> Vec<String> {
        lock(&self.state).exchanges.clone()
    }

    pub fn consumer_count(&self) -> usize {
        lock(&self.state).consumers.len()
    }

    /// Ends every consumer stream as if the broker closed the channels.
    pub fn end_consumers(&self) {
        lock(&self.state).consumers.clear();
    }

    /// Delivers a message to every consumer bound with `routing_key`.
    ///
    /// # Returns
    /// The number of consumers the message was handed to
    pub fn deliver(
        &self,
        routing_key: &str,
        properties: MessageProperties,
        body: &[u8],
    ) -> usize {
        let mut state = lock(&self.state);
        let queues: Vec<String> = state
            .bindings
            .iter()
            .filter(|b| b.routing_key == routing_key || b.routing_key == "#")
            .map(|b| b.queue_name.clone())
            .collect();

        let mut delivered = 0;
        let mut targets = Vec::new();
        for consumer in state.consumers.values() {
            if queues.contains(&consumer.queue) {
                targets.push(consumer.sender.clone());
            }
        }
        for sender in targets {
            state.next_tag += 1;
            let delivery = RawDelivery {
                delivery_tag: state.next_tag,
                exchange: "mts".to_owned(),
                routing_key: routing_key.to_owned(),
                body: body.to_vec(),
                properties: properties.clone(),
            };
            if sender.send(Ok(delivery)).is_ok() {
                delivered += 1;
            }
        }

        delivered
    }

    fn drop_consumers_of(&self, channel_ids: &[u16]) {
        lock(&self.state)
            .consumers
            .retain(|_, c| !channel_ids.contains(&c.channel_id));
    }
}

struct FakeConnector {
    broker: Arc<FakeBroker>,
}

#[async_trait]
impl BrokerConnector for FakeConnector {
    async fn connect(&self) -> Result<Arc<dyn BrokerConnection>, TransportError> {
        let mut state = lock(&self.broker.state);
        state.connect_attempts += 1;
        if !state.reachable {
            return Err(TransportError::Io("connection refused".to_owned()));
        }

        let connection = Arc::new(FakeConnection {
            broker: self.broker.clone(),
            open: AtomicBool::new(true),
            handler: Mutex::new(None),
            channels: Mutex::new(Vec::new()),
        });
        state.connections.push(connection.clone());
        Ok(connection)
    }
}

pub(crate) struct FakeConnection {
    broker: Arc<FakeBroker>,
    open: AtomicBool,
    handler: Mutex<Option<ShutdownHandler>>,
    channels: Mutex<Vec<Arc<FakeChannel>>>,
}

impl FakeConnection {
    /// Closes the connection and its channels and fires the shutdown handler.
    pub fn kill(&self, reason: &str) {
        self.close_all();
        if let Some(handler) = lock(&self.handler).as_ref() {
            handler(reason.to_owned());
        }
    }

    fn close_all(&self) {
        self.open.store(false, Ordering::SeqCst);
        let ids: Vec<u16> = lock(&self.channels)
            .iter()
            .map(|c| {
                c.open.store(false, Ordering::SeqCst);
                c.id
            })
            .collect();
        self.broker.drop_consumers_of(&ids);
    }
}

#[async_trait]
impl BrokerConnection for FakeConnection {
    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn create_channel(&self) -> Result<Arc<dyn BrokerChannel>, TransportError> {
        if !self.is_open() {
            return Err(TransportError::ChannelClosed("connection closed".to_owned()));
        }

        let channel = Arc::new(FakeChannel {
            id: self.broker.next_channel.fetch_add(1, Ordering::SeqCst),
            open: AtomicBool::new(true),
            broker: self.broker.clone(),
        });
        lock(&self.channels).push(channel.clone());
        lock(&self.broker.state).channels_created += 1;
        Ok(channel)
    }

    fn on_shutdown(&self, handler: ShutdownHandler) {
        *lock(&self.handler) = Some(handler);
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.close_all();
        Ok(())
    }
}

pub(crate) struct FakeChannel {
    id: u16,
    open: AtomicBool,
    broker: Arc<FakeBroker>,
}

impl FakeChannel {
    fn ensure_open(&self) -> Result<(), TransportError> {
        if self.open.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(TransportError::ChannelClosed(format!("channel {} closed", self.id)))
        }
    }
}

#[async_trait]
impl BrokerChannel for FakeChannel {
    fn id(&self) -> u16 {
        self.id
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn exchange_declare(&self, def: &ExchangeDefinition) -> Result<(), TransportError> {
        self.ensure_open()?;
        lock(&self.broker.state).exchanges.push(def.name.clone());
        Ok(())
    }

    async fn queue_declare(&self, def: &QueueDefinition) -> Result<String, TransportError> {
        self.ensure_open()?;
        let mut state = lock(&self.broker.state);
        state.queues.push(def.clone());
        if def.name.is_empty() {
            state.generated_queues += 1;
            Ok(format!("amq.gen-{}", state.generated_queues))
        } else {
            Ok(def.name.clone())
        }
    }

    async fn queue_bind(&self, binding: &QueueBinding) -> Result<(), TransportError> {
        self.ensure_open()?;
        lock(&self.broker.state).bindings.push(binding.clone());
        Ok(())
    }

    async fn basic_qos(&self, _prefetch_count: u16) -> Result<(), TransportError> {
        self.ensure_open()
    }

    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        properties: MessageProperties,
    ) -> Result<(), TransportError> {
        self.ensure_open()?;
        let delay = lock(&self.broker.state).publish_delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let mut state = lock(&self.broker.state);
        if let Some(err) = state.publish_failures.pop_front() {
            return Err(err);
        }

        state.published.push(Published {
            exchange: exchange.to_owned(),
            routing_key: routing_key.to_owned(),
            payload: payload.to_vec(),
            properties,
        });
        Ok(())
    }

    async fn basic_consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        _options: ConsumeOptions,
    ) -> Result<DeliveryStream, TransportError> {
        self.ensure_open()?;
        let (sender, receiver) = mpsc::unbounded_channel();
        lock(&self.broker.state).consumers.insert(
            consumer_tag.to_owned(),
            ActiveConsumer {
                queue: queue.to_owned(),
                channel_id: self.id,
                sender,
            },
        );

        Ok(stream::unfold(receiver, |mut rx| async move {
            rx.recv().await.map(|delivery| (delivery, rx))
        })
        .boxed())
    }

    async fn basic_ack(&self, delivery_tag: u64, multiple: bool) -> Result<(), TransportError> {
        self.ensure_open()?;
        let mut state = lock(&self.broker.state);
        let result = state.ack_results.pop_front().unwrap_or(Ok(()));
        if result.is_ok() {
            state.acks.push((delivery_tag, multiple));
        }
        result
    }

    async fn basic_nack(
        &self,
        _delivery_tag: u64,
        _multiple: bool,
        _requeue: bool,
    ) -> Result<(), TransportError> {
        self.ensure_open()
    }

    async fn basic_cancel(&self, consumer_tag: &str) -> Result<(), TransportError> {
        self.ensure_open()?;
        lock(&self.broker.state).consumers.remove(consumer_tag);
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.open.store(false, Ordering::SeqCst);
        self.broker.drop_consumers_of(&[self.id]);
        Ok(())
    }
}
