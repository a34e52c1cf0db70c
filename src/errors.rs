// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types for the Ticket Transport
//!
//! This module provides the error types surfaced by the transport. `TransportError`
//! covers connection, channel, topology, publish and acknowledgement failures.
//! `SendError` is the outcome type of a correlated send, and `ConfigError` covers
//! configuration loading and validation.

use thiserror::Error;

/// Represents errors that can occur during broker operations.
///
/// Broker library errors are converted into this type at the lowest layer, so that
/// retry loops, the publish path and the queue-drain task deal with one error type.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// A public entry point was called with an argument it cannot work with
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The component is not in a state that allows the operation
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// The physical connection could not be established or is not open
    #[error("failure to connect")]
    ConnectFailure,

    /// Error creating a channel from an established connection
    #[error("failure to create a channel `{0}`")]
    ChannelError(String),

    /// The channel or connection was already closed by the broker or by us
    #[error("channel closed `{0}`")]
    ChannelClosed(String),

    /// Socket level failure
    #[error("io error `{0}`")]
    Io(String),

    /// Any other error reported by the broker library
    #[error("broker error `{0}`")]
    Broker(String),

    /// Error declaring an exchange with the given name
    #[error("failure to declare an exchange `{0}`")]
    DeclareExchangeError(String),

    /// Error declaring a queue with the given name
    #[error("failure to declare a queue `{0}`")]
    DeclareQueueError(String),

    /// Error binding a queue to an exchange
    #[error("failure to binding exchange `{0}` to queue `{1}`")]
    BindingExchangeToQueueError(String, String),

    /// Error configuring Quality of Service parameters
    #[error("failure to configure qos `{0}`")]
    QoSDeclarationError(String),

    /// Error declaring a consumer
    #[error("consumer declaration error `{0}`")]
    ConsumerDeclarationError(String),

    /// Error publishing a message
    #[error("failure to publish `{0}`")]
    PublishingError(String),

    /// The publish queue already holds `limit` items
    #[error("publish queue is full (limit {limit})")]
    QueueFull { limit: usize },

    /// A queued item outlived the configured queue timeout
    #[error("queued item expired after {age_ms} ms")]
    Expired { age_ms: u128 },

    /// The broker no longer knows the delivery tag being acknowledged
    #[error("unknown delivery tag")]
    UnknownDeliveryTag,

    /// Error acknowledging a message
    #[error("failure to ack message `{0}`")]
    AckMessageError(String),
}

impl TransportError {
    /// Socket and already-closed errors get the linear channel-open backoff, the rest
    /// the multiplicative one.
    pub fn is_transient(&self) -> bool {
        matches!(self, TransportError::Io(_) | TransportError::ChannelClosed(_))
    }
}

/// Outcome of a correlated send that did not produce a response.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SendError {
    /// The ticket could not be published or queued
    #[error("publish failed: {0}")]
    Publish(#[from] TransportError),

    /// Another in-flight ticket already uses this correlation id
    #[error("correlation id `{0}` is already in flight")]
    DuplicateCorrelationId(String),

    /// No matching response arrived before the deadline
    #[error("no response for `{correlation_id}` within {timeout_ms} ms")]
    Timeout {
        correlation_id: String,
        timeout_ms: u128,
    },

    /// A response arrived but its body could not be read
    #[error("unparsable response for `{correlation_id}`: {reason}")]
    Unparsable {
        correlation_id: String,
        reason: String,
    },

    /// The sender was disposed while the call was waiting
    #[error("send canceled")]
    Canceled,
}

/// Errors raised while loading or validating configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// The `config` crate could not build or deserialize the sources
    #[error("failure to load configuration: {0}")]
    Load(#[from] config::ConfigError),

    /// A value is out of its accepted range
    #[error("invalid configuration value `{0}`: {1}")]
    Invalid(&'static str, String),
}
