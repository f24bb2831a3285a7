//! Broker routing targets
//!
//! Defines the Address type describing where a client publishes to or
//! consumes from, and the exchange kinds the broker supports.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Kind of broker-side exchange
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ExchangeKind {
    /// Route on exact routing-key match
    #[default]
    Direct,
    /// Route to every bound queue, ignoring the routing key
    Fanout,
    /// Route on routing-key pattern match
    Topic,
    /// Route on message headers
    Headers,
}

impl ExchangeKind {
    /// Wire name of this exchange kind
    pub fn as_str(&self) -> &'static str {
        match self {
            ExchangeKind::Direct => "direct",
            ExchangeKind::Fanout => "fanout",
            ExchangeKind::Topic => "topic",
            ExchangeKind::Headers => "headers",
        }
    }
}

/// A broker routing target: exchange, queue and routing key.
///
/// An empty exchange name addresses the broker's default exchange, which
/// routes straight to the queue named by the routing key. Such addresses
/// never declare an exchange and never bind a queue; any other address
/// requires both.
///
/// Treated as immutable once `validate` has accepted it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Address {
    /// Queue name (required)
    pub queue: String,
    /// Routing key; falls back to the queue name when unset
    #[serde(default)]
    pub routing_key: Option<String>,
    /// Exchange name; empty means the broker's default exchange
    #[serde(default)]
    pub exchange: String,
    /// Exchange kind used when the exchange must be declared
    #[serde(default)]
    pub exchange_kind: ExchangeKind,
}

impl Address {
    /// Create an address on the broker's default exchange
    pub fn new(queue: impl Into<String>) -> Self {
        Self {
            queue: queue.into(),
            routing_key: None,
            exchange: String::new(),
            exchange_kind: ExchangeKind::Direct,
        }
    }

    /// Set the exchange name
    pub fn with_exchange(mut self, exchange: impl Into<String>) -> Self {
        self.exchange = exchange.into();
        self
    }

    /// Set an explicit routing key
    pub fn with_routing_key(mut self, routing_key: impl Into<String>) -> Self {
        self.routing_key = Some(routing_key.into());
        self
    }

    /// Set the exchange kind
    pub fn with_exchange_kind(mut self, kind: ExchangeKind) -> Self {
        self.exchange_kind = kind;
        self
    }

    /// Check required fields, filling the routing key from the queue name
    /// when it was left unset
    pub fn validate(&mut self) -> Result<()> {
        if self.queue.is_empty() {
            return Err(Error::MissingQueueName);
        }

        if self.routing_key.is_none() {
            self.routing_key = Some(self.queue.clone());
        }

        Ok(())
    }

    /// Resolved routing key (falls back to the queue name)
    pub fn routing_key(&self) -> &str {
        self.routing_key.as_deref().unwrap_or(&self.queue)
    }

    /// True when this address targets the broker's default exchange
    pub fn is_default_exchange(&self) -> bool {
        self.exchange.is_empty()
    }
}

impl std::fmt::Display for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.queue)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_fills_routing_key() {
        let mut address = Address::new("events");
        address.validate().unwrap();
        assert_eq!(address.routing_key(), "events");
        assert_eq!(address.routing_key, Some("events".to_string()));
    }

    #[test]
    fn test_validate_keeps_explicit_routing_key() {
        let mut address = Address::new("events").with_routing_key("audit");
        address.validate().unwrap();
        assert_eq!(address.routing_key(), "audit");
    }

    #[test]
    fn test_validate_rejects_missing_queue() {
        let mut address = Address::new("");
        assert!(matches!(address.validate(), Err(Error::MissingQueueName)));
    }

    #[test]
    fn test_default_exchange_predicate() {
        let plain = Address::new("q1");
        assert!(plain.is_default_exchange());

        let routed = Address::new("q1").with_exchange("ex1");
        assert!(!routed.is_default_exchange());
    }

    #[test]
    fn test_display_renders_queue() {
        let address = Address::new("q1").with_exchange("ex1");
        assert_eq!(address.to_string(), "q1");
    }
}
