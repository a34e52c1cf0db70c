// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Ticket Cache
//!
//! In-flight tickets keyed by correlation id. Each entry lives from the send until its
//! response arrives or its timeout elapses. A blocking caller parks on the receiving
//! half of the entry's oneshot channel; the delivery side only looks the entry up and
//! completes it.

use crate::{
    errors::SendError,
    lock,
    ticket::{TicketCategory, TicketResponse},
};
use std::{collections::HashMap, sync::Mutex, time::Duration};
use tokio::{sync::oneshot, time::Instant};

/// Completes a blocking send.
pub type Waiter = oneshot::Sender<Result<TicketResponse, SendError>>;

/// One in-flight ticket.
#[derive(Debug)]
pub struct TicketCacheEntry {
    pub correlation_id: String,
    pub ticket_id: String,
    pub category: TicketCategory,
    pub sent_at: Instant,
    /// How long a response is waited for
    pub timeout: Duration,
    waiter: Option<Waiter>,
}

impl TicketCacheEntry {
    pub fn new(
        correlation_id: &str,
        ticket_id: &str,
        category: TicketCategory,
        timeout: Duration,
    ) -> TicketCacheEntry {
        TicketCacheEntry {
            correlation_id: correlation_id.to_owned(),
            ticket_id: ticket_id.to_owned(),
            category,
            sent_at: Instant::now(),
            timeout,
            waiter: None,
        }
    }

    /// Attaches the caller parked on this entry.
    pub fn with_waiter(mut self, waiter: Waiter) -> Self {
        self.waiter = Some(waiter);
        self
    }

    pub fn is_blocking(&self) -> bool {
        self.waiter.is_some()
    }

    fn is_expired(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.sent_at) >= self.timeout
    }

    /// Hands the outcome to the parked caller.
    ///
    /// # Returns
    /// The outcome back when nobody waits for it any more
    pub fn complete(
        self,
        outcome: Result<TicketResponse, SendError>,
    ) -> Option<Result<TicketResponse, SendError>> {
        match self.waiter {
            Some(waiter) => waiter.send(outcome).err(),
            None => Some(outcome),
        }
    }
}

/// Correlation id to in-flight ticket.
#[derive(Debug, Default)]
pub struct TicketCache {
    entries: Mutex<HashMap<String, TicketCacheEntry>>,
}

impl TicketCache {
    pub fn new() -> TicketCache {
        TicketCache::default()
    }

    /// Adds an entry; a correlation id already in flight is rejected.
    pub fn insert(&self, entry: TicketCacheEntry) -> Result<(), SendError> {
        let mut entries = lock(&self.entries);
        if entries.contains_key(&entry.correlation_id) {
            return Err(SendError::DuplicateCorrelationId(entry.correlation_id));
        }

        entries.insert(entry.correlation_id.clone(), entry);
        Ok(())
    }

    /// Removes and returns the entry for `correlation_id`.
    pub fn take(&self, correlation_id: &str) -> Option<TicketCacheEntry> {
        lock(&self.entries).remove(correlation_id)
    }

    pub fn contains(&self, correlation_id: &str) -> bool {
        lock(&self.entries).contains_key(correlation_id)
    }

    pub fn len(&self) -> usize {
        lock(&self.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.entries).is_empty()
    }

    /// Removes the non-blocking entries whose timeout elapsed at `now`.
    ///
    /// Blocking entries are left to their waiting caller, which evicts them itself.
    pub fn take_expired(&self, now: Instant) -> Vec<TicketCacheEntry> {
        let mut entries = lock(&self.entries);
        let expired: Vec<String> = entries
            .values()
            .filter(|e| !e.is_blocking() && e.is_expired(now))
            .map(|e| e.correlation_id.clone())
            .collect();

        expired
            .iter()
            .filter_map(|id| entries.remove(id))
            .collect()
    }

    /// Earliest deadline among the non-blocking entries.
    pub fn next_deadline(&self) -> Option<Instant> {
        lock(&self.entries)
            .values()
            .filter(|e| !e.is_blocking())
            .map(|e| e.sent_at + e.timeout)
            .min()
    }

    /// Removes every entry.
    pub fn drain(&self) -> Vec<TicketCacheEntry> {
        lock(&self.entries).drain().map(|(_, e)| e).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(id: &str, timeout_ms: u64) -> TicketCacheEntry {
        TicketCacheEntry::new(
            id,
            &format!("ticket-{}", id),
            TicketCategory::Ticket,
            Duration::from_millis(timeout_ms),
        )
    }

    #[test]
    fn duplicate_correlation_id_is_rejected() {
        let cache = TicketCache::new();
        cache.insert(entry("c-1", 100)).unwrap();

        assert_eq!(
            cache.insert(entry("c-1", 100)),
            Err(SendError::DuplicateCorrelationId("c-1".into()))
        );
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn concurrent_inserts_keep_one_entry_per_id() {
        let cache = std::sync::Arc::new(TicketCache::new());
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let cache = cache.clone();
                std::thread::spawn(move || {
                    (0..50)
                        .filter(|i| cache.insert(entry(&format!("c-{}", i), 100)).is_ok())
                        .count()
                })
            })
            .collect();

        let inserted: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(inserted, 50);
        assert_eq!(cache.len(), 50);
    }

    #[tokio::test(start_paused = true)]
    async fn only_non_blocking_entries_expire() {
        let cache = TicketCache::new();
        let (waiter, _rx) = oneshot::channel();
        cache.insert(entry("c-1", 100)).unwrap();
        cache.insert(entry("c-2", 100).with_waiter(waiter)).unwrap();
        cache.insert(entry("c-3", 500)).unwrap();

        tokio::time::advance(Duration::from_millis(150)).await;
        let expired = cache.take_expired(Instant::now());

        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].correlation_id, "c-1");
        assert!(cache.contains("c-2"));
        assert!(cache.contains("c-3"));
    }

    #[tokio::test]
    async fn complete_reaches_the_waiter() {
        let (waiter, rx) = oneshot::channel();
        let leftover = entry("c-1", 100)
            .with_waiter(waiter)
            .complete(Err(SendError::Canceled));

        assert!(leftover.is_none());
        assert_eq!(rx.await.unwrap(), Err(SendError::Canceled));
    }

    #[test]
    fn complete_without_waiter_returns_the_outcome() {
        let outcome = entry("c-1", 100).complete(Err(SendError::Canceled));
        assert_eq!(outcome, Some(Err(SendError::Canceled)));
    }
}
