// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

mod otel;

pub mod amqp;
pub mod broker;
pub mod cache;
pub mod channel;
pub mod config;
pub mod connection;
pub mod consumer;
pub mod errors;
pub mod events;
pub mod exchange;
pub mod publisher;
pub mod queue;
pub mod sender;
pub mod status;
pub mod ticket;
pub mod topology;
pub mod transport;

#[cfg(test)]
pub(crate) mod testing;

use std::sync::{Mutex, MutexGuard, PoisonError};

/// Locks a mutex guarding plain state; a panic in another holder does not make that
/// state unusable.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
