// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Ticket Envelope Types
//!
//! The transport never looks inside a ticket. It takes a serialized payload plus a
//! small metadata tuple, and hands back responses as raw bytes together with the
//! parsed JSON body.

use serde::Deserialize;
use std::{collections::BTreeMap, fmt, time::Duration};

/// Kind of ticket sent, which is also the kind of response expected for it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TicketCategory {
    Ticket,
    Cancel,
    Cashout,
    NonSrSettle,
}

impl TicketCategory {
    pub const ALL: [TicketCategory; 4] = [
        TicketCategory::Ticket,
        TicketCategory::Cancel,
        TicketCategory::Cashout,
        TicketCategory::NonSrSettle,
    ];

    /// Segment used in routing keys, e.g. `node1.cancel.confirm`.
    pub fn routing_segment(&self) -> &'static str {
        match self {
            TicketCategory::Ticket => "ticket",
            TicketCategory::Cancel => "cancel",
            TicketCategory::Cashout => "cashout",
            TicketCategory::NonSrSettle => "nonsrsettle",
        }
    }

    /// Reads the response kind a delivery declares.
    ///
    /// The AMQP `type` property wins when present and recognised; otherwise the routing
    /// key is inspected, defaulting to a ticket response.
    pub fn from_declared(kind: Option<&str>, routing_key: &str) -> TicketCategory {
        if let Some(category) = kind.and_then(Self::parse) {
            return category;
        }

        let routing_key = routing_key.to_lowercase();
        if routing_key.contains("nonsrsettle") {
            TicketCategory::NonSrSettle
        } else if routing_key.contains("cashout") {
            TicketCategory::Cashout
        } else if routing_key.contains("cancel") {
            TicketCategory::Cancel
        } else {
            TicketCategory::Ticket
        }
    }

    fn parse(value: &str) -> Option<TicketCategory> {
        match value.to_lowercase().as_str() {
            "ticket" | "ticketresponse" => Some(TicketCategory::Ticket),
            "cancel" | "ticketcancelresponse" => Some(TicketCategory::Cancel),
            "cashout" | "ticketcashoutresponse" => Some(TicketCategory::Cashout),
            "nonsrsettle" | "ticketnonsrsettleresponse" => Some(TicketCategory::NonSrSettle),
            _ => None,
        }
    }
}

impl fmt::Display for TicketCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.routing_segment())
    }
}

/// A serialized ticket and the metadata the transport needs to route it.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundTicket {
    pub ticket_id: String,
    pub category: TicketCategory,
    pub live: bool,
    pub payload: Vec<u8>,
    pub routing_key: String,
    pub correlation_id: Option<String>,
    pub reply_routing_key: Option<String>,
}

impl OutboundTicket {
    /// Creates a prematch ticket with a generated correlation id and the default reply
    /// routing key.
    pub fn new(
        ticket_id: impl Into<String>,
        category: TicketCategory,
        payload: impl Into<Vec<u8>>,
        routing_key: impl Into<String>,
    ) -> Self {
        OutboundTicket {
            ticket_id: ticket_id.into(),
            category,
            live: false,
            payload: payload.into(),
            routing_key: routing_key.into(),
            correlation_id: None,
            reply_routing_key: None,
        }
    }

    pub fn live(mut self) -> Self {
        self.live = true;
        self
    }

    pub fn correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    pub fn reply_routing_key(mut self, key: impl Into<String>) -> Self {
        self.reply_routing_key = Some(key.into());
        self
    }
}

/// A broker response matched to the ticket that triggered it.
#[derive(Debug, Clone, PartialEq)]
pub struct TicketResponse {
    pub category: TicketCategory,
    pub ticket_id: String,
    pub correlation_id: String,
    pub routing_key: String,
    pub body: serde_json::Value,
    pub raw: Vec<u8>,
    pub headers: BTreeMap<String, String>,
    pub round_trip: Duration,
}

/// Why a delivery could not be turned into a [`TicketResponse`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnparsableReason {
    /// No in-flight ticket carries the delivery's correlation id
    Unmatched,
    /// The body is not valid JSON
    InvalidBody(String),
}

impl fmt::Display for UnparsableReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UnparsableReason::Unmatched => f.write_str("no ticket waits for this correlation id"),
            UnparsableReason::InvalidBody(err) => write!(f, "invalid body: {}", err),
        }
    }
}

/// A delivery surfaced as-is because it could not be matched or read.
#[derive(Debug, Clone, PartialEq)]
pub struct UnparsableMessage {
    pub correlation_id: Option<String>,
    pub routing_key: String,
    pub category: TicketCategory,
    pub raw: Vec<u8>,
    pub reason: UnparsableReason,
}
