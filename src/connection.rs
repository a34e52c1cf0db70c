// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Connection Management
//!
//! The [`ConnectionManager`] owns the single physical broker connection of a transport
//! instance and hands out logical channels multiplexed over it. It creates the
//! connection on demand, probes and rebuilds it after a reported loss, and keeps the
//! table of channel ids with their deletion marks.
//!
//! Channel cleanup is two-phase: a connection shutdown only marks every channel for
//! deletion, and the next [`ConnectionManager::get_channel`] or
//! [`ConnectionManager::remove_channel`] for that id purges it.

use crate::{
    broker::{BrokerConnection, BrokerConnector},
    channel::{ChannelIdGenerator, LogicalChannel},
    config::TransportConfig,
    errors::TransportError,
    lock,
    status::ConnectionStatus,
};
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};
use tracing::{debug, error, info, warn};

type ChannelTable = HashMap<u32, Option<Arc<LogicalChannel>>>;

/// Generated ids tried before falling back to the lowest free id.
const MAX_GENERATED_ID_ATTEMPTS: usize = 10;

/// Factory of logical channels over one physical connection.
pub struct ConnectionManager {
    connector: Arc<dyn BrokerConnector>,
    status: Arc<ConnectionStatus>,
    id_generator: Arc<dyn ChannelIdGenerator>,
    automatic_recovery: bool,
    reconnect_delay: Duration,
    connection: tokio::sync::Mutex<Option<Arc<dyn BrokerConnection>>>,
    channels: Arc<Mutex<ChannelTable>>,
    generation: Arc<AtomicU64>,
    disposed: AtomicBool,
}

impl ConnectionManager {
    /// Creates a manager; no connection is made until the first channel is requested.
    ///
    /// # Parameters
    /// * `cfg` - Transport configuration (recovery flag and reconnect delay)
    /// * `connector` - Creates physical connections
    /// * `status` - Connection status shared with the channels
    /// * `id_generator` - Source of channel ids
    pub fn new(
        cfg: &TransportConfig,
        connector: Arc<dyn BrokerConnector>,
        status: Arc<ConnectionStatus>,
        id_generator: Arc<dyn ChannelIdGenerator>,
    ) -> ConnectionManager {
        ConnectionManager {
            connector,
            status,
            id_generator,
            automatic_recovery: cfg.automatic_recovery,
            reconnect_delay: cfg.reconnect_delay(),
            connection: tokio::sync::Mutex::new(None),
            channels: Arc::new(Mutex::new(HashMap::new())),
            generation: Arc::new(AtomicU64::new(0)),
            disposed: AtomicBool::new(false),
        }
    }

    pub fn status(&self) -> &Arc<ConnectionStatus> {
        &self.status
    }

    /// Returns a channel id not present in the table and reserves it.
    ///
    /// A generator that keeps repeating taken ids is given up on after a few tries and
    /// the lowest free id is used instead.
    pub fn get_unique_id(&self) -> u32 {
        let mut channels = lock(&self.channels);
        let generated = (0..MAX_GENERATED_ID_ATTEMPTS)
            .map(|_| self.id_generator.next_id())
            .find(|id| !channels.contains_key(id));

        let id = match generated {
            Some(id) => id,
            None => {
                let id = (1..=u32::MAX)
                    .find(|id| !channels.contains_key(id))
                    .unwrap_or(0);
                warn!(
                    attempts = MAX_GENERATED_ID_ATTEMPTS,
                    channel_id = id,
                    "channel id generator keeps repeating taken ids, using the lowest free id"
                );
                id
            }
        };
        channels.insert(id, None);
        id
    }

    /// Returns the logical channel for `id`, creating the connection and the channel as
    /// needed.
    ///
    /// When the status reports the connection as lost, a throwaway connection probes
    /// the broker first; if it answers, the stale connection and all its channels are
    /// dropped and a new connection is made.
    ///
    /// # Returns
    /// The usable channel, or `ConnectFailure` when no open connection can be had
    pub async fn get_channel(&self, id: u32) -> Result<Arc<LogicalChannel>, TransportError> {
        if self.disposed.load(Ordering::Acquire) {
            return Err(TransportError::InvalidState(
                "connection manager disposed".to_owned(),
            ));
        }

        let mut current = self.connection.lock().await;
        let connection = match current.clone() {
            None => {
                let connection = self.open_connection().await?;
                *current = Some(connection.clone());
                connection
            }
            Some(stale) if !self.status.is_connected() => {
                let connection = self.recover(stale).await?;
                *current = Some(connection.clone());
                connection
            }
            Some(connection) => connection,
        };

        if !connection.is_open() {
            error!(channel_id = id, "connection is not open");
            return Err(TransportError::ConnectFailure);
        }

        self.lookup_or_create(id, connection.as_ref()).await
    }

    /// Marks the channel for deletion; the next lookup or removal purges it.
    pub fn mark_for_deletion(&self, id: u32) {
        if let Some(Some(channel)) = lock(&self.channels).get(&id) {
            channel.mark_for_deletion();
        }
    }

    /// Purges a channel marked for deletion. The id stays reserved.
    pub async fn remove_channel(&self, id: u32) {
        let Some(channel) = lock(&self.channels).get(&id).cloned().flatten() else {
            return;
        };

        if !channel.is_marked_for_deletion() {
            debug!(channel_id = id, "channel is not marked for deletion, keeping it");
            return;
        }

        self.purge(&channel).await;
    }

    /// Marks and purges the channel in one go; used by channel owners on close.
    pub async fn release_channel(&self, id: u32) {
        self.mark_for_deletion(id);
        self.remove_channel(id).await;
    }

    /// Number of channels currently held in the table.
    pub fn channel_count(&self) -> usize {
        lock(&self.channels).values().filter(|c| c.is_some()).count()
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    /// Closes every channel and then the connection. Calling it again does nothing.
    pub async fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }

        debug!("disposing connection manager");
        self.generation.fetch_add(1, Ordering::AcqRel);

        let channels: Vec<_> = lock(&self.channels)
            .drain()
            .filter_map(|(_, channel)| channel)
            .collect();
        for channel in channels {
            channel.mark_for_deletion();
            close_channel(&channel).await;
            channel.clear();
        }

        if let Some(connection) = self.connection.lock().await.take() {
            if let Err(err) = connection.close().await {
                debug!(error = err.to_string(), "error closing the connection");
            }
        }

        self.status.disconnect("connection manager disposed");
    }

    async fn open_connection(&self) -> Result<Arc<dyn BrokerConnection>, TransportError> {
        debug!("creating amqp connection...");

        let connection = match self.connector.connect().await {
            Ok(c) => c,
            Err(err) => {
                error!(error = err.to_string(), "failure to connect");
                return Err(TransportError::ConnectFailure);
            }
        };

        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        let current = self.generation.clone();
        let channels = self.channels.clone();
        let status = self.status.clone();

        connection.on_shutdown(Box::new(move |reason| {
            if current.load(Ordering::Acquire) != generation {
                debug!(reason, "ignoring shutdown of a replaced connection");
                return;
            }

            warn!(reason, "connection shutdown, marking channels for deletion");
            for channel in lock(&channels).values().flatten() {
                channel.mark_for_deletion();
            }
            status.disconnect(&reason);
        }));

        debug!("amqp connected");
        self.status.connect("connection created");

        Ok(connection)
    }

    async fn recover(
        &self,
        stale: Arc<dyn BrokerConnection>,
    ) -> Result<Arc<dyn BrokerConnection>, TransportError> {
        if !self.automatic_recovery {
            warn!("connection lost and automatic recovery is disabled");
            return Err(TransportError::ConnectFailure);
        }

        info!("connection reported down, probing the broker");
        let probe = match self.connector.connect().await {
            Ok(probe) => probe,
            Err(err) => {
                warn!(error = err.to_string(), "broker is still unreachable");
                return Err(TransportError::ConnectFailure);
            }
        };
        if let Err(err) = probe.close().await {
            debug!(error = err.to_string(), "error closing the probe connection");
        }

        self.generation.fetch_add(1, Ordering::AcqRel);
        if let Err(err) = stale.close().await {
            debug!(error = err.to_string(), "error closing the stale connection");
        }
        self.purge_all().await;

        tokio::time::sleep(self.reconnect_delay).await;

        self.open_connection().await
    }

    async fn lookup_or_create(
        &self,
        id: u32,
        connection: &dyn BrokerConnection,
    ) -> Result<Arc<LogicalChannel>, TransportError> {
        let existing = lock(&self.channels).get(&id).cloned().flatten();
        if let Some(channel) = existing {
            if channel.is_usable() {
                return Ok(channel);
            }

            debug!(channel_id = id, "purging unusable channel before reuse");
            channel.mark_for_deletion();
            self.purge(&channel).await;
        }

        debug!(channel_id = id, "creating amqp channel...");
        let transport = match connection.create_channel().await {
            Ok(t) => t,
            Err(err) => {
                error!(channel_id = id, error = err.to_string(), "error to create the channel");
                return Err(TransportError::ChannelError(err.to_string()));
            }
        };

        let channel = Arc::new(LogicalChannel::new(id, transport));
        lock(&self.channels).insert(id, Some(channel.clone()));
        debug!(channel_id = id, "channel created");

        Ok(channel)
    }

    async fn purge(&self, channel: &Arc<LogicalChannel>) {
        close_channel(channel).await;
        channel.clear();

        let mut channels = lock(&self.channels);
        if let Some(slot) = channels.get_mut(&channel.id()) {
            if slot.as_ref().is_some_and(|c| Arc::ptr_eq(c, channel)) {
                *slot = None;
            }
        }
    }

    async fn purge_all(&self) {
        let channels: Vec<_> = lock(&self.channels)
            .values_mut()
            .filter_map(Option::take)
            .collect();

        for channel in channels {
            channel.mark_for_deletion();
            close_channel(&channel).await;
            channel.clear();
        }
    }
}

async fn close_channel(channel: &LogicalChannel) {
    if !channel.transport().is_open() {
        return;
    }

    if let Err(err) = channel.transport().close().await {
        debug!(
            channel_id = channel.id(),
            error = err.to_string(),
            "error closing the channel"
        );
    }
}
