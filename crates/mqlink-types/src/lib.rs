//! MQLink Types - Core domain types for the broker client layer
//!
//! This crate contains all shared types used across MQLink components.

pub mod address;
pub mod error;
pub mod message;

// Re-export commonly used types
pub use address::{Address, ExchangeKind};
pub use error::{Error, Result};
pub use message::{Delivery, MessageMetadata, MessageProperties, Payload};
