// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Ticket Transport
//!
//! Wires the pieces of one transport instance together: the shared connection status,
//! the connection manager, a publisher channel, a consumer channel bound to the reply
//! routing keys of every ticket category and the correlated sender between them.
//!
//! ```no_run
//! use ticket_amqp::{config::TransportConfig, ticket::{OutboundTicket, TicketCategory}, transport::TicketTransport};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let transport = TicketTransport::new(TransportConfig::load(None)?)?;
//! transport.start().await?;
//!
//! let ticket = OutboundTicket::new("ticket-1", TicketCategory::Ticket, b"{}".to_vec(), "node1.ticket");
//! let response = transport.send_and_wait(ticket).await?;
//! println!("{}", response.body);
//!
//! transport.dispose().await;
//! # Ok(())
//! # }
//! ```

use crate::{
    amqp::LapinConnector,
    broker::BrokerConnector,
    channel::SequentialIdGenerator,
    config::TransportConfig,
    connection::ConnectionManager,
    consumer::{ChannelHealth, ConsumerChannel, ConsumerSettings},
    errors::{ConfigError, SendError, TransportError},
    events::{Notifier, TransportEvent},
    publisher::{PublisherChannel, PublisherSettings},
    sender::CorrelatedSender,
    status::ConnectionStatus,
    ticket::{OutboundTicket, TicketCategory, TicketResponse},
};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::info;

/// One transport instance: a connection, a publisher, a consumer and the correlation
/// between them.
pub struct TicketTransport {
    cfg: TransportConfig,
    notifier: Notifier,
    status: Arc<ConnectionStatus>,
    manager: Arc<ConnectionManager>,
    publisher: Arc<PublisherChannel>,
    consumer: Arc<ConsumerChannel>,
    sender: Arc<CorrelatedSender>,
}

impl TicketTransport {
    /// Creates a transport connecting to the broker with lapin.
    ///
    /// # Returns
    /// The transport, or the validation error of `cfg`
    pub fn new(cfg: TransportConfig) -> Result<TicketTransport, ConfigError> {
        let connector = Arc::new(LapinConnector::new(&cfg));
        TicketTransport::with_connector(cfg, connector)
    }

    /// Creates a transport over any broker connector.
    pub fn with_connector(
        cfg: TransportConfig,
        connector: Arc<dyn BrokerConnector>,
    ) -> Result<TicketTransport, ConfigError> {
        cfg.validate()?;

        let notifier = Notifier::default();
        let status = Arc::new(ConnectionStatus::new(notifier.clone()));
        let manager = Arc::new(ConnectionManager::new(
            &cfg,
            connector,
            status.clone(),
            Arc::new(SequentialIdGenerator::default()),
        ));

        let publisher = PublisherChannel::new(
            manager.get_unique_id(),
            manager.clone(),
            PublisherSettings::from_config(&cfg),
            notifier.clone(),
        );
        let sender = CorrelatedSender::new(&cfg, publisher.clone(), status.clone(), notifier.clone());
        let consumer = ConsumerChannel::new(
            manager.get_unique_id(),
            manager.clone(),
            ConsumerSettings::from_config(&cfg),
            sender.clone(),
        );

        Ok(TicketTransport {
            cfg,
            notifier,
            status,
            manager,
            publisher,
            consumer,
            sender,
        })
    }

    /// Opens the publisher and the consumer and starts evicting unanswered tickets.
    pub async fn start(&self) -> Result<(), TransportError> {
        self.publisher.open().await?;

        let reply_keys: Vec<String> = TicketCategory::ALL
            .into_iter()
            .map(|category| self.cfg.reply_routing_key(category))
            .collect();
        let reply_keys: Vec<&str> = reply_keys.iter().map(String::as_str).collect();
        self.consumer.open(None, &reply_keys).await?;

        self.sender.start();
        info!(node_id = self.cfg.node_id, "ticket transport started");
        Ok(())
    }

    /// Sends a ticket; its response is raised as a notification.
    pub async fn send(&self, ticket: OutboundTicket) -> Result<String, SendError> {
        self.sender.send(ticket).await
    }

    /// Sends a ticket and waits for its response.
    pub async fn send_and_wait(&self, ticket: OutboundTicket) -> Result<TicketResponse, SendError> {
        self.sender.send_and_wait(ticket).await
    }

    /// Subscribes to the notifications of this transport.
    pub fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        self.notifier.subscribe()
    }

    pub fn status(&self) -> &Arc<ConnectionStatus> {
        &self.status
    }

    pub fn sender(&self) -> &Arc<CorrelatedSender> {
        &self.sender
    }

    /// Health of the response consumer, with the connection status appended.
    pub fn health(&self) -> ChannelHealth {
        let health = self.consumer.health();
        ChannelHealth {
            healthy: health.healthy && self.status.is_connected(),
            status: format!("{}; {}", health.status, self.status),
        }
    }

    /// Cancels waiting calls, closes both channels and the connection.
    pub async fn dispose(&self) {
        self.sender.dispose();
        self.consumer.close().await;
        self.publisher.close().await;
        self.manager.dispose().await;
        info!("ticket transport disposed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{broker::MessageProperties, testing::FakeBroker};
    use std::time::Duration;

    fn transport(broker: &Arc<FakeBroker>) -> Arc<TicketTransport> {
        Arc::new(TicketTransport::with_connector(TransportConfig::default(), broker.connector()).unwrap())
    }

    fn ticket(id: &str) -> OutboundTicket {
        OutboundTicket::new(id, TicketCategory::Ticket, b"{}".to_vec(), "node1.ticket")
    }

    #[test]
    fn invalid_configuration_is_rejected() {
        let cfg = TransportConfig {
            host: String::new(),
            ..Default::default()
        };
        assert!(TicketTransport::with_connector(cfg, FakeBroker::new().connector()).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn start_binds_every_reply_key() {
        let broker = FakeBroker::new();
        let transport = transport(&broker);
        transport.start().await.unwrap();

        let mut keys: Vec<_> = broker.bindings().into_iter().map(|b| b.routing_key).collect();
        keys.sort();
        assert_eq!(
            keys,
            vec![
                "node1.cancel.confirm",
                "node1.cashout.confirm",
                "node1.nonsrsettle.confirm",
                "node1.ticket.confirm",
            ]
        );
        assert!(transport.health().healthy);
        transport.dispose().await;
    }

    #[tokio::test(start_paused = true)]
    async fn round_trip_through_the_broker() {
        let broker = FakeBroker::new();
        let transport = transport(&broker);
        transport.start().await.unwrap();

        let caller = transport.clone();
        let waiting = tokio::spawn(async move { caller.send_and_wait(ticket("t-1")).await });

        let published = loop {
            if let Some(p) = broker.published().into_iter().next() {
                break p;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        };
        let props = MessageProperties {
            correlation_id: published.properties.correlation_id.clone(),
            ..Default::default()
        };
        broker.deliver("node1.ticket.confirm", props, b"{\"result\":\"accepted\"}");

        let response = waiting.await.unwrap().unwrap();
        assert_eq!(response.ticket_id, "t-1");
        assert_eq!(transport.status().last_sent_id().as_deref(), Some("t-1"));
        assert_eq!(transport.status().last_received_id().as_deref(), Some("t-1"));
        transport.dispose().await;
    }

    #[tokio::test(start_paused = true)]
    async fn dispose_closes_everything() {
        let broker = FakeBroker::new();
        let transport = transport(&broker);
        let mut events = transport.subscribe();
        transport.start().await.unwrap();

        transport.dispose().await;

        assert!(!transport.status().is_connected());
        assert!(!transport.health().healthy);
        assert_eq!(broker.consumer_count(), 0);
        assert!(matches!(
            transport.send(ticket("t-1")).await,
            Err(SendError::Publish(TransportError::InvalidState(_)))
        ));

        let mut changes = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let TransportEvent::ConnectionChanged { connected, .. } = event {
                changes.push(connected);
            }
        }
        assert_eq!(changes, vec![true, false]);
    }
}
