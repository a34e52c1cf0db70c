// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Response Queues
//!
//! The queue a consumer channel reads responses from and the bindings that route each
//! reply routing key into it.

/// Declaration flags of a response queue.
///
/// An empty name asks the broker to generate one; the effective name is what the
/// declaration returns.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueDefinition {
    pub(crate) name: String,
    pub(crate) durable: bool,
    pub(crate) exclusive: bool,
    pub(crate) auto_delete: bool,
}

impl QueueDefinition {
    /// A queue named by the broker, removed once its last consumer is gone.
    pub fn server_named() -> QueueDefinition {
        QueueDefinition {
            auto_delete: true,
            ..Default::default()
        }
    }

    /// A queue with a fixed name that outlives its consumers.
    pub fn named(name: &str) -> QueueDefinition {
        QueueDefinition {
            name: name.to_owned(),
            ..Default::default()
        }
    }

    /// The queue a consumer declares for its responses.
    ///
    /// # Parameters
    /// * `name` - Requested queue name; `None` or an empty name gets a server-named queue
    /// * `durable` - Whether the queue survives a broker restart
    /// * `exclusive` - Whether only this connection may use the queue
    pub fn for_responses(name: Option<&str>, durable: bool, exclusive: bool) -> QueueDefinition {
        let def = match name.filter(|n| !n.is_empty()) {
            Some(name) => QueueDefinition::named(name),
            None => QueueDefinition::server_named(),
        };

        QueueDefinition {
            durable,
            exclusive,
            ..def
        }
    }

    pub fn is_server_named(&self) -> bool {
        self.name.is_empty()
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Routes `routing_key` on an exchange into a queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueBinding {
    pub(crate) queue_name: String,
    pub(crate) exchange_name: String,
    pub(crate) routing_key: String,
}

impl QueueBinding {
    pub fn new(queue: &str, exchange: &str, routing_key: &str) -> QueueBinding {
        QueueBinding {
            queue_name: queue.to_owned(),
            exchange_name: exchange.to_owned(),
            routing_key: routing_key.to_owned(),
        }
    }
}
