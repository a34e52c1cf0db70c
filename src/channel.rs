// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Logical Channels
//!
//! A [`LogicalChannel`] is the connection manager's record of one broker channel: its
//! transport handle, the per-mode metadata publishers and consumers hang on it, and the
//! deletion mark used for lazy cleanup after a shutdown. Channel ids come from an
//! injected [`ChannelIdGenerator`].

use crate::{
    broker::{BrokerChannel, MessageProperties},
    lock,
};
use std::sync::{
    atomic::{AtomicBool, AtomicU32, Ordering},
    Arc, Mutex,
};

/// Hands out ids for logical channels.
pub trait ChannelIdGenerator: Send + Sync {
    fn next_id(&self) -> u32;
}

/// Collision-free generator counting up from a starting value.
#[derive(Debug)]
pub struct SequentialIdGenerator {
    next: AtomicU32,
}

impl SequentialIdGenerator {
    pub fn new(start: u32) -> SequentialIdGenerator {
        SequentialIdGenerator {
            next: AtomicU32::new(start),
        }
    }
}

impl Default for SequentialIdGenerator {
    fn default() -> Self {
        SequentialIdGenerator::new(1)
    }
}

impl ChannelIdGenerator for SequentialIdGenerator {
    fn next_id(&self) -> u32 {
        self.next.fetch_add(1, Ordering::Relaxed)
    }
}

/// One broker channel tracked by the connection manager.
pub struct LogicalChannel {
    id: u32,
    transport: Arc<dyn BrokerChannel>,
    marked_for_deletion: AtomicBool,
    properties: Mutex<Option<MessageProperties>>,
    consumer_tag: Mutex<Option<String>>,
}

impl LogicalChannel {
    pub(crate) fn new(id: u32, transport: Arc<dyn BrokerChannel>) -> LogicalChannel {
        LogicalChannel {
            id,
            transport,
            marked_for_deletion: AtomicBool::new(false),
            properties: Mutex::new(None),
            consumer_tag: Mutex::new(None),
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn transport(&self) -> &Arc<dyn BrokerChannel> {
        &self.transport
    }

    /// A channel is usable while it is not marked and its transport handle is open.
    pub fn is_usable(&self) -> bool {
        !self.is_marked_for_deletion() && self.transport.is_open()
    }

    pub fn is_marked_for_deletion(&self) -> bool {
        self.marked_for_deletion.load(Ordering::Acquire)
    }

    pub(crate) fn mark_for_deletion(&self) {
        self.marked_for_deletion.store(true, Ordering::Release);
    }

    /// Properties reused by every publish on this channel, created on first use.
    pub(crate) fn publish_properties(&self, init: impl FnOnce() -> MessageProperties) -> MessageProperties {
        lock(&self.properties).get_or_insert_with(init).clone()
    }

    pub(crate) fn set_consumer_tag(&self, tag: Option<String>) {
        *lock(&self.consumer_tag) = tag;
    }

    pub fn consumer_tag(&self) -> Option<String> {
        lock(&self.consumer_tag).clone()
    }

    /// Drops the publish and consume metadata before the channel leaves the table.
    pub(crate) fn clear(&self) {
        *lock(&self.properties) = None;
        *lock(&self.consumer_tag) = None;
    }
}

impl std::fmt::Debug for LogicalChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogicalChannel")
            .field("id", &self.id)
            .field("transport_id", &self.transport.id())
            .field("marked_for_deletion", &self.is_marked_for_deletion())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::MockBrokerChannel;
    use std::collections::HashSet;

    #[test]
    fn sequential_ids_never_collide_across_threads() {
        let generator = Arc::new(SequentialIdGenerator::default());
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let generator = generator.clone();
                std::thread::spawn(move || (0..250).map(|_| generator.next_id()).collect::<Vec<_>>())
            })
            .collect();

        let mut seen = HashSet::new();
        for handle in handles {
            for id in handle.join().unwrap() {
                assert!(seen.insert(id), "duplicate id {}", id);
            }
        }
        assert_eq!(seen.len(), 1000);
    }

    #[test]
    fn marked_channel_is_not_usable() {
        let mut transport = MockBrokerChannel::new();
        transport.expect_is_open().return_const(true);
        let channel = LogicalChannel::new(3, Arc::new(transport));

        assert!(channel.is_usable());
        channel.mark_for_deletion();
        assert!(!channel.is_usable());
    }

    #[test]
    fn publish_properties_are_created_once_and_cleared() {
        let channel = LogicalChannel::new(1, Arc::new(MockBrokerChannel::new()));
        let first = channel.publish_properties(|| MessageProperties {
            content_type: Some("application/json".into()),
            ..Default::default()
        });
        let second = channel.publish_properties(MessageProperties::default);
        assert_eq!(first, second);

        channel.set_consumer_tag(Some("tag".into()));
        channel.clear();
        assert_eq!(channel.consumer_tag(), None);
        assert_eq!(
            channel.publish_properties(MessageProperties::default),
            MessageProperties::default()
        );
    }
}
