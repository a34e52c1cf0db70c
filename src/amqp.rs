// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # lapin Broker Adapter
//!
//! Implements the broker traits on top of lapin. This is the only module that touches
//! the AMQP client library: it builds the connection URI from configuration, converts
//! message properties and headers both ways, and turns lapin errors into
//! [`TransportError`]s.

use crate::{
    broker::{
        BrokerChannel, BrokerConnection, BrokerConnector, ConsumeOptions, DeliveryStream,
        HeaderValue, Headers, MessageProperties, RawDelivery, ShutdownHandler,
    },
    config::TransportConfig,
    errors::TransportError,
    exchange::ExchangeDefinition,
    queue::{QueueBinding, QueueDefinition},
};
use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::{
    message::Delivery,
    options::{
        BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicNackOptions,
        BasicPublishOptions, BasicQosOptions, ExchangeDeclareOptions, QueueBindOptions,
        QueueDeclareOptions,
    },
    protocol::basic::AMQPProperties,
    types::{AMQPValue, FieldTable, LongString, ShortString},
    uri::{AMQPAuthority, AMQPQueryString, AMQPScheme, AMQPUri, AMQPUserInfo},
    BasicProperties, Channel, Connection, ConnectionProperties,
};
use std::{collections::BTreeMap, sync::Arc};
use tracing::{debug, error, info};

/// AMQP reply code for a normal close
const REPLY_SUCCESS: u16 = 200;
/// Delivery mode of messages that survive a broker restart
const DELIVERY_MODE_PERSISTENT: u8 = 2;
const DELIVERY_MODE_TRANSIENT: u8 = 1;

/// Creates lapin connections from the transport configuration.
pub struct LapinConnector {
    uri: AMQPUri,
    connection_name: String,
    ssl_server_name: Option<String>,
}

impl LapinConnector {
    pub fn new(cfg: &TransportConfig) -> LapinConnector {
        LapinConnector {
            uri: amqp_uri(cfg),
            connection_name: cfg.app_name.clone(),
            ssl_server_name: cfg.ssl_server_name.clone(),
        }
    }
}

/// Builds the connection URI: `amqps` when TLS is on, heartbeat in the query.
pub(crate) fn amqp_uri(cfg: &TransportConfig) -> AMQPUri {
    AMQPUri {
        scheme: if cfg.use_ssl {
            AMQPScheme::AMQPS
        } else {
            AMQPScheme::AMQP
        },
        authority: AMQPAuthority {
            userinfo: AMQPUserInfo {
                username: cfg.username.clone(),
                password: cfg.password.clone(),
            },
            host: cfg.host.clone(),
            port: cfg.port,
        },
        vhost: cfg.virtual_host.clone(),
        query: AMQPQueryString {
            heartbeat: Some(cfg.heartbeat_secs),
            ..Default::default()
        },
    }
}

#[async_trait]
impl BrokerConnector for LapinConnector {
    async fn connect(&self) -> Result<Arc<dyn BrokerConnection>, TransportError> {
        debug!(
            host = %self.uri.authority.host,
            port = self.uri.authority.port,
            vhost = %self.uri.vhost,
            "creating amqp connection..."
        );

        if let (AMQPScheme::AMQPS, Some(server_name)) = (&self.uri.scheme, &self.ssl_server_name) {
            info!(server_name = %server_name, "connecting over tls");
        }

        let options = ConnectionProperties::default()
            .with_connection_name(LongString::from(self.connection_name.clone()));

        match Connection::connect_uri(self.uri.clone(), options).await {
            Ok(connection) => {
                debug!("amqp connected");
                Ok(Arc::new(LapinConnection { connection }))
            }
            Err(err) => {
                error!(error = err.to_string(), "failure to connect");
                Err(map_error(err))
            }
        }
    }
}

struct LapinConnection {
    connection: Connection,
}

#[async_trait]
impl BrokerConnection for LapinConnection {
    fn is_open(&self) -> bool {
        self.connection.status().connected()
    }

    async fn create_channel(&self) -> Result<Arc<dyn BrokerChannel>, TransportError> {
        match self.connection.create_channel().await {
            Ok(channel) => {
                debug!(channel = channel.id(), "channel created");
                Ok(Arc::new(LapinChannel { channel }))
            }
            Err(err) => {
                error!(error = err.to_string(), "error to create the channel");
                Err(map_error(err))
            }
        }
    }

    fn on_shutdown(&self, handler: ShutdownHandler) {
        self.connection.on_error(move |err| handler(err.to_string()));
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.connection
            .close(REPLY_SUCCESS, "closed by client")
            .await
            .map_err(map_error)
    }
}

struct LapinChannel {
    channel: Channel,
}

#[async_trait]
impl BrokerChannel for LapinChannel {
    fn id(&self) -> u16 {
        self.channel.id()
    }

    fn is_open(&self) -> bool {
        self.channel.status().connected()
    }

    async fn exchange_declare(&self, def: &ExchangeDefinition) -> Result<(), TransportError> {
        self.channel
            .exchange_declare(
                &def.name,
                def.kind.into(),
                ExchangeDeclareOptions {
                    passive: false,
                    durable: def.durable,
                    auto_delete: false,
                    internal: false,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
            .map_err(|err| TransportError::DeclareExchangeError(format!("{}: {}", def.name, err)))
    }

    async fn queue_declare(&self, def: &QueueDefinition) -> Result<String, TransportError> {
        let queue = self
            .channel
            .queue_declare(
                &def.name,
                QueueDeclareOptions {
                    passive: false,
                    durable: def.durable,
                    exclusive: def.exclusive,
                    auto_delete: def.auto_delete,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
            .map_err(|err| TransportError::DeclareQueueError(format!("{}: {}", def.name, err)))?;

        Ok(queue.name().as_str().to_owned())
    }

    async fn queue_bind(&self, binding: &QueueBinding) -> Result<(), TransportError> {
        self.channel
            .queue_bind(
                &binding.queue_name,
                &binding.exchange_name,
                &binding.routing_key,
                QueueBindOptions { nowait: false },
                FieldTable::default(),
            )
            .await
            .map_err(|_| {
                TransportError::BindingExchangeToQueueError(
                    binding.exchange_name.clone(),
                    binding.queue_name.clone(),
                )
            })
    }

    async fn basic_qos(&self, prefetch_count: u16) -> Result<(), TransportError> {
        self.channel
            .basic_qos(prefetch_count, BasicQosOptions { global: false })
            .await
            .map_err(|err| TransportError::QoSDeclarationError(err.to_string()))
    }

    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        properties: MessageProperties,
    ) -> Result<(), TransportError> {
        self.channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions {
                    immediate: false,
                    mandatory: false,
                },
                payload,
                to_basic_properties(properties),
            )
            .await
            .map_err(map_error)?
            .await
            .map_err(map_error)?;

        Ok(())
    }

    async fn basic_consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        options: ConsumeOptions,
    ) -> Result<DeliveryStream, TransportError> {
        let consumer = self
            .channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions {
                    no_local: false,
                    no_ack: options.no_ack,
                    exclusive: options.exclusive,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
            .map_err(|err| TransportError::ConsumerDeclarationError(err.to_string()))?;

        Ok(consumer
            .map(|result| result.map(raw_delivery).map_err(map_error))
            .boxed())
    }

    async fn basic_ack(&self, delivery_tag: u64, multiple: bool) -> Result<(), TransportError> {
        self.channel
            .basic_ack(delivery_tag, BasicAckOptions { multiple })
            .await
            .map_err(map_error)
    }

    async fn basic_nack(
        &self,
        delivery_tag: u64,
        multiple: bool,
        requeue: bool,
    ) -> Result<(), TransportError> {
        self.channel
            .basic_nack(delivery_tag, BasicNackOptions { multiple, requeue })
            .await
            .map_err(map_error)
    }

    async fn basic_cancel(&self, consumer_tag: &str) -> Result<(), TransportError> {
        self.channel
            .basic_cancel(consumer_tag, BasicCancelOptions { nowait: false })
            .await
            .map_err(map_error)
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.channel
            .close(REPLY_SUCCESS, "closed by client")
            .await
            .map_err(map_error)
    }
}

/// Classifies a lapin error.
///
/// A PRECONDITION_FAILED about an unknown delivery tag is recognised by its text, the
/// broker reports it as a channel-level protocol error.
pub(crate) fn map_error(err: lapin::Error) -> TransportError {
    let text = err.to_string();
    if text.to_lowercase().contains("unknown delivery tag") {
        return TransportError::UnknownDeliveryTag;
    }

    match err {
        lapin::Error::IOError(io) => TransportError::Io(io.to_string()),
        lapin::Error::InvalidChannel(_)
        | lapin::Error::InvalidChannelState(_)
        | lapin::Error::InvalidConnectionState(_) => TransportError::ChannelClosed(text),
        _ => TransportError::Broker(text),
    }
}

fn to_basic_properties(props: MessageProperties) -> BasicProperties {
    let mut headers = BTreeMap::<ShortString, AMQPValue>::default();
    for (key, value) in props.headers {
        let amqp_value = match value {
            HeaderValue::Str(v) => AMQPValue::LongString(LongString::from(v)),
            HeaderValue::Int(v) => AMQPValue::LongLongInt(v),
            HeaderValue::Bool(v) => AMQPValue::Boolean(v),
        };
        headers.insert(ShortString::from(key), amqp_value);
    }

    let mut basic = BasicProperties::default()
        .with_delivery_mode(if props.persistent {
            DELIVERY_MODE_PERSISTENT
        } else {
            DELIVERY_MODE_TRANSIENT
        })
        .with_headers(FieldTable::from(headers));

    if let Some(content_type) = props.content_type {
        basic = basic.with_content_type(ShortString::from(content_type));
    }
    if let Some(correlation_id) = props.correlation_id {
        basic = basic.with_correlation_id(ShortString::from(correlation_id));
    }
    if let Some(kind) = props.kind {
        basic = basic.with_type(ShortString::from(kind));
    }
    if let Some(message_id) = props.message_id {
        basic = basic.with_message_id(ShortString::from(message_id));
    }

    basic
}

fn from_amqp_properties(props: &AMQPProperties) -> MessageProperties {
    let mut headers = Headers::new();
    if let Some(table) = props.headers() {
        for (key, value) in table.inner() {
            if let Some(value) = header_from_amqp(value) {
                headers.insert(key.as_str().to_owned(), value);
            }
        }
    }

    MessageProperties {
        content_type: props.content_type().as_ref().map(|v| v.as_str().to_owned()),
        correlation_id: props.correlation_id().as_ref().map(|v| v.as_str().to_owned()),
        kind: props.kind().as_ref().map(|v| v.as_str().to_owned()),
        message_id: props.message_id().as_ref().map(|v| v.as_str().to_owned()),
        persistent: *props.delivery_mode() == Some(DELIVERY_MODE_PERSISTENT),
        headers,
    }
}

fn header_from_amqp(value: &AMQPValue) -> Option<HeaderValue> {
    match value {
        AMQPValue::LongString(v) => Some(HeaderValue::Str(
            String::from_utf8_lossy(v.as_bytes()).into_owned(),
        )),
        AMQPValue::ShortString(v) => Some(HeaderValue::Str(v.as_str().to_owned())),
        AMQPValue::Boolean(v) => Some(HeaderValue::Bool(*v)),
        AMQPValue::ShortShortInt(v) => Some(HeaderValue::Int(i64::from(*v))),
        AMQPValue::ShortShortUInt(v) => Some(HeaderValue::Int(i64::from(*v))),
        AMQPValue::ShortInt(v) => Some(HeaderValue::Int(i64::from(*v))),
        AMQPValue::ShortUInt(v) => Some(HeaderValue::Int(i64::from(*v))),
        AMQPValue::LongInt(v) => Some(HeaderValue::Int(i64::from(*v))),
        AMQPValue::LongUInt(v) => Some(HeaderValue::Int(i64::from(*v))),
        AMQPValue::LongLongInt(v) => Some(HeaderValue::Int(*v)),
        AMQPValue::Timestamp(v) => i64::try_from(*v).ok().map(HeaderValue::Int),
        _ => None,
    }
}

fn raw_delivery(delivery: Delivery) -> RawDelivery {
    RawDelivery {
        delivery_tag: delivery.delivery_tag,
        exchange: delivery.exchange.as_str().to_owned(),
        routing_key: delivery.routing_key.as_str().to_owned(),
        properties: from_amqp_properties(&delivery.properties),
        body: delivery.data,
    }
}
