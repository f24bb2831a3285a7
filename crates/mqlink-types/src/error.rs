//! Error types for MQLink
//!
//! Defines all error types used throughout the client layer.

use thiserror::Error;

/// Main error type for MQLink operations
#[derive(Error, Debug)]
pub enum Error {
    /// Address has no queue name
    #[error("Address is missing its queue name")]
    MissingQueueName,

    /// Publish attempted on a client with no publisher address
    #[error("Cannot publish messages without a publisher address")]
    MissingPublisherAddress,

    /// Client built with neither a publisher nor a subscriber address
    #[error("Client has neither a publisher nor a subscriber address")]
    ClientWithoutAddress,

    /// Required configuration key has no value and no default
    #[error("Configuration key not set: {0}")]
    NotConfigured(String),

    /// Configuration source failed to load or a value had the wrong type
    #[error("Configuration error: {0}")]
    Config(String),

    /// Inbound payload is not valid UTF-8
    #[error("Payload is not valid UTF-8")]
    NonUtf8Payload(#[from] std::string::FromUtf8Error),

    /// Inbound payload could not be decoded as JSON
    #[error("Couldn't decode payload as JSON: {text}")]
    InvalidFormat {
        text: String,
        #[source]
        source: serde_json::Error,
    },

    /// Outbound payload serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Broker transport error
    #[error("Transport error: {0}")]
    Transport(String),

    /// Operation requires an open connection and channel
    #[error("Not connected to the broker")]
    NotConnected,

    /// Registry instances run at most once
    #[error("Registry already started")]
    AlreadyStarted,
}

/// Result type alias for MQLink operations
pub type Result<T> = std::result::Result<T, Error>;
