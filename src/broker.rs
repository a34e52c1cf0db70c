// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Broker Abstraction
//!
//! Traits that separate the transport from the AMQP client library. The connection
//! manager, publisher and consumer channels only talk to these traits; the `amqp`
//! module implements them on top of lapin, and tests drive them with an in-memory
//! broker or mockall mocks.

use crate::{
    errors::TransportError,
    exchange::ExchangeDefinition,
    queue::{QueueBinding, QueueDefinition},
};
use async_trait::async_trait;
use futures_util::stream::BoxStream;
use std::{collections::BTreeMap, sync::Arc};

#[cfg(test)]
use mockall::automock;

/// Default content type for ticket payloads
pub const JSON_CONTENT_TYPE: &str = "application/json";

/// Callback invoked once when a connection shuts down, with the reason.
pub type ShutdownHandler = Box<dyn Fn(String) + Send + Sync>;

/// Stream of deliveries of one consumer; it ends when the channel goes away.
pub type DeliveryStream = BoxStream<'static, Result<RawDelivery, TransportError>>;

/// A message header value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeaderValue {
    Str(String),
    Int(i64),
    Bool(bool),
}

impl HeaderValue {
    /// Renders the value as text, the form whitelisted headers are handed on in.
    pub fn to_text(&self) -> String {
        match self {
            HeaderValue::Str(v) => v.clone(),
            HeaderValue::Int(v) => v.to_string(),
            HeaderValue::Bool(v) => v.to_string(),
        }
    }
}

pub type Headers = BTreeMap<String, HeaderValue>;

/// Properties attached to a published or delivered message.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageProperties {
    pub content_type: Option<String>,
    pub correlation_id: Option<String>,
    pub kind: Option<String>,
    pub message_id: Option<String>,
    pub persistent: bool,
    pub headers: Headers,
}

/// A message as delivered by the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawDelivery {
    pub delivery_tag: u64,
    pub exchange: String,
    pub routing_key: String,
    pub body: Vec<u8>,
    pub properties: MessageProperties,
}

/// Options of a `basic.consume`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConsumeOptions {
    pub no_ack: bool,
    pub exclusive: bool,
}

/// Creates physical connections to the broker.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait BrokerConnector: Send + Sync {
    async fn connect(&self) -> Result<Arc<dyn BrokerConnection>, TransportError>;
}

/// One physical connection multiplexing many channels.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait BrokerConnection: Send + Sync {
    fn is_open(&self) -> bool;

    async fn create_channel(&self) -> Result<Arc<dyn BrokerChannel>, TransportError>;

    /// Registers the callback fired when the broker or the network drops the connection.
    fn on_shutdown(&self, handler: ShutdownHandler);

    async fn close(&self) -> Result<(), TransportError>;
}

/// One logical channel on a connection.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    fn id(&self) -> u16;

    fn is_open(&self) -> bool;

    async fn exchange_declare(&self, def: &ExchangeDefinition) -> Result<(), TransportError>;

    /// Declares the queue and returns its effective name.
    async fn queue_declare(&self, def: &QueueDefinition) -> Result<String, TransportError>;

    async fn queue_bind(&self, binding: &QueueBinding) -> Result<(), TransportError>;

    async fn basic_qos(&self, prefetch_count: u16) -> Result<(), TransportError>;

    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        properties: MessageProperties,
    ) -> Result<(), TransportError>;

    async fn basic_consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        options: ConsumeOptions,
    ) -> Result<DeliveryStream, TransportError>;

    async fn basic_ack(&self, delivery_tag: u64, multiple: bool) -> Result<(), TransportError>;

    async fn basic_nack(
        &self,
        delivery_tag: u64,
        multiple: bool,
        requeue: bool,
    ) -> Result<(), TransportError>;

    async fn basic_cancel(&self, consumer_tag: &str) -> Result<(), TransportError>;

    async fn close(&self) -> Result<(), TransportError>;
}
