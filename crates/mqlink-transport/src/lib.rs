//! MQLink Transport - Broker transport backends
//!
//! This crate defines the transport seam the orchestration layer drives and
//! provides pluggable backends:
//! - AMQP 0.9.1 via `lapin` (feature `amqp`)
//! - An in-memory broker for development and testing (feature `memory`)

pub mod traits;

#[cfg(feature = "amqp")]
pub mod amqp;

#[cfg(feature = "memory")]
pub mod memory;

// Re-exports
pub use traits::{BrokerChannel, BrokerConnection, ConnectParams, Connector, DeliveryReceiver};

#[cfg(feature = "amqp")]
pub use amqp::AmqpConnector;

#[cfg(feature = "memory")]
pub use memory::{BrokerOp, MemoryBroker};
