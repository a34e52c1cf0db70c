// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Transport Configuration
//!
//! Settings consumed by the connection manager, the publisher and consumer channels and
//! the correlated sender. Values can be built in code, or loaded with the `config`
//! crate from an optional file layered under `TICKET_AMQP_*` environment variables.

use crate::{errors::ConfigError, exchange::ExchangeKind, ticket::TicketCategory};
use serde::Deserialize;
use std::time::Duration;

/// Lowest accepted per-item expiry of the publish queue
pub const MIN_PUBLISH_QUEUE_TIMEOUT_MS: u64 = 10_000;
/// Default per-item expiry of the publish queue
pub const DEFAULT_PUBLISH_QUEUE_TIMEOUT_MS: u64 = 15_000;
/// Prefix of the environment variables read by [`TransportConfig::load`]
pub const ENV_PREFIX: &str = "TICKET_AMQP";

/// Configuration of one transport instance.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct TransportConfig {
    pub app_name: String,
    pub host: String,
    pub port: u16,
    pub virtual_host: String,
    pub username: String,
    pub password: String,
    pub use_ssl: bool,
    pub ssl_server_name: Option<String>,
    pub heartbeat_secs: u16,
    pub automatic_recovery: bool,
    pub exchange_name: String,
    pub exchange_kind: ExchangeKind,
    pub node_id: i32,
    pub ticket_response_timeout_live_ms: u64,
    pub ticket_response_timeout_prematch_ms: u64,
    pub ticket_cancellation_response_timeout_ms: u64,
    pub ticket_cashout_response_timeout_ms: u64,
    pub ticket_non_sr_settle_response_timeout_ms: u64,
    pub publish_queue_limit: usize,
    pub publish_queue_timeout_ms: u64,
    pub exclusive_consumer: bool,
    pub durable_queue: bool,
    pub persistent_delivery: bool,
    pub prefetch_count: u16,
    pub explicit_acking: bool,
    pub ack_batch_limit: usize,
    pub ack_timeout_ms: u64,
    pub health_check_interval_secs: u64,
    pub reconnect_delay_ms: u64,
}

impl Default for TransportConfig {
    fn default() -> Self {
        TransportConfig {
            app_name: "ticket-amqp".to_owned(),
            host: "localhost".to_owned(),
            port: 5672,
            virtual_host: "/".to_owned(),
            username: "guest".to_owned(),
            password: "guest".to_owned(),
            use_ssl: false,
            ssl_server_name: None,
            heartbeat_secs: 60,
            automatic_recovery: true,
            exchange_name: "mts".to_owned(),
            exchange_kind: ExchangeKind::Topic,
            node_id: 1,
            ticket_response_timeout_live_ms: 17_000,
            ticket_response_timeout_prematch_ms: 5_000,
            ticket_cancellation_response_timeout_ms: 5_000,
            ticket_cashout_response_timeout_ms: 5_000,
            ticket_non_sr_settle_response_timeout_ms: 5_000,
            publish_queue_limit: 0,
            publish_queue_timeout_ms: DEFAULT_PUBLISH_QUEUE_TIMEOUT_MS,
            exclusive_consumer: true,
            durable_queue: false,
            persistent_delivery: true,
            prefetch_count: 10,
            explicit_acking: false,
            ack_batch_limit: 1,
            ack_timeout_ms: 5_000,
            health_check_interval_secs: 180,
            reconnect_delay_ms: 1_000,
        }
    }
}

impl TransportConfig {
    /// Loads the configuration from an optional file and the environment.
    ///
    /// Environment variables take precedence over the file, e.g.
    /// `TICKET_AMQP_HOST=mq.example.com`. Missing keys keep their defaults.
    ///
    /// # Parameters
    /// * `path` - Optional configuration file, any format the `config` crate knows
    ///
    /// # Returns
    /// A validated configuration or a ConfigError
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path));
        }

        let builder =
            builder.add_source(config::Environment::with_prefix(ENV_PREFIX).try_parsing(true));

        Self::from_builder(builder)
    }

    pub(crate) fn from_builder(
        builder: config::ConfigBuilder<config::builder::DefaultState>,
    ) -> Result<Self, ConfigError> {
        let cfg: TransportConfig = builder.build()?.try_deserialize()?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Checks the values a broker session cannot work without.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.host.trim().is_empty() {
            return Err(ConfigError::Invalid("host", "must not be empty".to_owned()));
        }

        if self.port == 0 {
            return Err(ConfigError::Invalid("port", "must not be 0".to_owned()));
        }

        if self.exchange_name.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "exchange_name",
                "must not be empty".to_owned(),
            ));
        }

        if self.prefetch_count == 0 {
            return Err(ConfigError::Invalid(
                "prefetch_count",
                "must be at least 1".to_owned(),
            ));
        }

        if self.ack_batch_limit == 0 {
            return Err(ConfigError::Invalid(
                "ack_batch_limit",
                "must be at least 1".to_owned(),
            ));
        }

        if self.health_check_interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "health_check_interval_secs",
                "must be greater than 0".to_owned(),
            ));
        }

        let timeouts = [
            ("ticket_response_timeout_live_ms", self.ticket_response_timeout_live_ms),
            (
                "ticket_response_timeout_prematch_ms",
                self.ticket_response_timeout_prematch_ms,
            ),
            (
                "ticket_cancellation_response_timeout_ms",
                self.ticket_cancellation_response_timeout_ms,
            ),
            (
                "ticket_cashout_response_timeout_ms",
                self.ticket_cashout_response_timeout_ms,
            ),
            (
                "ticket_non_sr_settle_response_timeout_ms",
                self.ticket_non_sr_settle_response_timeout_ms,
            ),
        ];
        for (name, value) in timeouts {
            if value == 0 {
                return Err(ConfigError::Invalid(name, "must be greater than 0".to_owned()));
            }
        }

        Ok(())
    }

    /// Whether published tickets go through the internal queue.
    pub fn use_publish_queue(&self) -> bool {
        self.publish_queue_limit > 0 || self.publish_queue_timeout_ms > 0
    }

    /// Per-item expiry of the publish queue, never below ten seconds.
    pub fn publish_queue_timeout(&self) -> Duration {
        Duration::from_millis(self.publish_queue_timeout_ms.max(MIN_PUBLISH_QUEUE_TIMEOUT_MS))
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_secs(self.health_check_interval_secs)
    }

    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    /// Response timeouts per ticket category.
    pub fn response_timeouts(&self) -> ResponseTimeouts {
        ResponseTimeouts {
            ticket_live: Duration::from_millis(self.ticket_response_timeout_live_ms),
            ticket_prematch: Duration::from_millis(self.ticket_response_timeout_prematch_ms),
            cancel: Duration::from_millis(self.ticket_cancellation_response_timeout_ms),
            cashout: Duration::from_millis(self.ticket_cashout_response_timeout_ms),
            non_sr_settle: Duration::from_millis(self.ticket_non_sr_settle_response_timeout_ms),
        }
    }

    /// Routing key responses for `category` are sent back on.
    pub fn reply_routing_key(&self, category: TicketCategory) -> String {
        format!("node{}.{}.confirm", self.node_id, category.routing_segment())
    }
}

/// How long a ticket of each category waits for its response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResponseTimeouts {
    pub ticket_live: Duration,
    pub ticket_prematch: Duration,
    pub cancel: Duration,
    pub cashout: Duration,
    pub non_sr_settle: Duration,
}

impl ResponseTimeouts {
    /// Timeout for a ticket of `category`; `live` only matters for submitted tickets.
    pub fn for_category(&self, category: TicketCategory, live: bool) -> Duration {
        match category {
            TicketCategory::Ticket if live => self.ticket_live,
            TicketCategory::Ticket => self.ticket_prematch,
            TicketCategory::Cancel => self.cancel,
            TicketCategory::Cashout => self.cashout,
            TicketCategory::NonSrSettle => self.non_sr_settle,
        }
    }
}

impl Default for ResponseTimeouts {
    fn default() -> Self {
        TransportConfig::default().response_timeouts()
    }
}
