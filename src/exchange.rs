// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Exchange Definitions
//!
//! The exchange tickets are published to and response queues are bound to. Both the
//! publisher and the consumer declare it before use; declaring an existing exchange
//! with the same flags is a no-op on the broker.

use crate::config::TransportConfig;
use serde::Deserialize;

/// Exchange kinds a transport can be configured with.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExchangeKind {
    Direct,
    Fanout,
    #[default]
    Topic,
    Headers,
}

impl From<ExchangeKind> for lapin::ExchangeKind {
    fn from(kind: ExchangeKind) -> lapin::ExchangeKind {
        match kind {
            ExchangeKind::Direct => lapin::ExchangeKind::Direct,
            ExchangeKind::Fanout => lapin::ExchangeKind::Fanout,
            ExchangeKind::Headers => lapin::ExchangeKind::Headers,
            ExchangeKind::Topic => lapin::ExchangeKind::Topic,
        }
    }
}

/// Name, kind and durability of the ticket exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExchangeDefinition {
    pub(crate) name: String,
    pub(crate) kind: ExchangeKind,
    pub(crate) durable: bool,
}

impl ExchangeDefinition {
    /// A durable exchange of the given kind.
    pub fn new(name: &str, kind: ExchangeKind) -> ExchangeDefinition {
        ExchangeDefinition {
            name: name.to_owned(),
            kind,
            durable: true,
        }
    }

    /// The exchange named by `exchange_name` and `exchange_kind`.
    pub fn from_config(cfg: &TransportConfig) -> ExchangeDefinition {
        ExchangeDefinition::new(&cfg.exchange_name, cfg.exchange_kind)
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn takes_name_and_kind_from_config() {
        let cfg = TransportConfig {
            exchange_name: "mts-test".to_owned(),
            exchange_kind: ExchangeKind::Direct,
            ..Default::default()
        };

        let def = ExchangeDefinition::from_config(&cfg);
        assert_eq!(def, ExchangeDefinition::new("mts-test", ExchangeKind::Direct));
        assert!(def.durable);
        assert_eq!(def.name(), "mts-test");
    }

    #[test]
    fn kind_is_read_in_lowercase() {
        let kind: ExchangeKind = serde_json::from_str("\"fanout\"").unwrap();
        assert_eq!(kind, ExchangeKind::Fanout);

        let kind: lapin::ExchangeKind = ExchangeKind::Topic.into();
        assert!(matches!(kind, lapin::ExchangeKind::Topic));
    }
}
