// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Topology Installation
//!
//! Collects the exchange, queue and bindings a channel relies on and declares them on a
//! [`BrokerChannel`]. Publishers install an exchange-only topology each time their
//! channel is (re)opened; consumers install the exchange, their response queue and one
//! binding per routing key.

use crate::{
    broker::BrokerChannel,
    errors::TransportError,
    exchange::ExchangeDefinition,
    queue::{QueueBinding, QueueDefinition},
};
use tracing::{debug, error};

/// A set of topology definitions installed in order: exchanges, queue, bindings.
#[derive(Debug, Clone, Default)]
pub struct Topology {
    pub(crate) exchanges: Vec<ExchangeDefinition>,
    pub(crate) queue: Option<QueueDefinition>,
    pub(crate) routing_keys: Vec<String>,
}

impl Topology {
    pub fn new() -> Topology {
        Topology::default()
    }

    /// Adds an exchange definition to the topology.
    pub fn exchange(mut self, def: ExchangeDefinition) -> Self {
        self.exchanges.push(def);
        self
    }

    /// Sets the queue this topology declares.
    pub fn queue(mut self, def: QueueDefinition) -> Self {
        self.queue = Some(def);
        self
    }

    /// Adds a routing key the queue is bound with on every declared exchange.
    pub fn routing_key(mut self, key: &str) -> Self {
        self.routing_keys.push(key.to_owned());
        self
    }

    /// Installs the topology on a channel.
    ///
    /// This method performs the following operations in order:
    /// 1. Declares all exchanges
    /// 2. Declares the queue, if any
    /// 3. Binds the queue to every exchange with every routing key
    ///
    /// # Parameters
    /// * `channel` - The channel the declarations are sent on
    ///
    /// # Returns
    /// The effective queue name (None when no queue is declared) or a TransportError
    pub async fn install(&self, channel: &dyn BrokerChannel) -> Result<Option<String>, TransportError> {
        self.install_exchanges(channel).await?;

        let Some(queue) = &self.queue else {
            return Ok(None);
        };

        let name = self.install_queue(channel, queue).await?;
        self.binding_queue(channel, &name).await?;

        Ok(Some(name))
    }

    async fn install_exchanges(&self, channel: &dyn BrokerChannel) -> Result<(), TransportError> {
        for exch in &self.exchanges {
            debug!("creating exchange: {}", exch.name());

            if let Err(err) = channel.exchange_declare(exch).await {
                error!(
                    error = err.to_string(),
                    name = exch.name(),
                    "error to declare the exchange"
                );
                return Err(err);
            }
        }

        Ok(())
    }

    async fn install_queue(
        &self,
        channel: &dyn BrokerChannel,
        def: &QueueDefinition,
    ) -> Result<String, TransportError> {
        if def.is_server_named() {
            debug!("creating a server-named queue");
        } else {
            debug!("creating queue: {}", def.name());
        }

        match channel.queue_declare(def).await {
            Err(err) => {
                error!(error = err.to_string(), name = def.name(), "error to declare the queue");
                Err(err)
            }
            Ok(name) => {
                debug!("queue: {} was created", name);
                Ok(name)
            }
        }
    }

    async fn binding_queue(&self, channel: &dyn BrokerChannel, queue: &str) -> Result<(), TransportError> {
        for exch in &self.exchanges {
            for key in &self.routing_keys {
                debug!(
                    "binding queue: {} to the exchange: {} with the key: {}",
                    queue, exch.name, key
                );

                let binding = QueueBinding::new(queue, &exch.name, key);
                if let Err(err) = channel.queue_bind(&binding).await {
                    error!(error = err.to_string(), "error to bind queue to exchange");
                    return Err(err);
                }
            }
        }

        debug!("queue was bounded");

        Ok(())
    }
}
