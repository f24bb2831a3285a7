//! Broker connection management
//!
//! Owns the single connection and the single channel multiplexed over it,
//! with idempotent get-or-open accessors. A channel is only valid while its
//! connection is open, and a closed connection is never reopened in place;
//! the accessor hands out a fresh connection object instead.

use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, info};

use mqlink_transport::{BrokerChannel, BrokerConnection, ConnectParams, Connector};
use mqlink_types::Result;

/// Manages the one connection/channel pair the whole registry shares
pub struct ConnectionManager {
    connector: Arc<dyn Connector>,
    params: ConnectParams,
    connection: Mutex<Option<Arc<dyn BrokerConnection>>>,
    channel: Mutex<Option<Arc<dyn BrokerChannel>>>,
}

impl ConnectionManager {
    /// Create a manager over the given transport and endpoint
    pub fn new(connector: Arc<dyn Connector>, params: ConnectParams) -> Self {
        Self {
            connector,
            params,
            connection: Mutex::new(None),
            channel: Mutex::new(None),
        }
    }

    /// Get the open connection, opening one on first use. An existing open
    /// connection is reused without a network round-trip.
    pub async fn connection(&self) -> Result<Arc<dyn BrokerConnection>> {
        let mut slot = self.connection.lock().await;
        if let Some(connection) = slot.as_ref() {
            if connection.is_open() {
                return Ok(Arc::clone(connection));
            }
        }

        info!(host = %self.params.host, port = self.params.port, "Opening broker connection");
        let connection = self.connector.connect(&self.params).await?;
        *slot = Some(Arc::clone(&connection));
        Ok(connection)
    }

    /// Get the open channel over the current connection, opening one on
    /// first use
    pub async fn channel(&self) -> Result<Arc<dyn BrokerChannel>> {
        let mut slot = self.channel.lock().await;
        if let Some(channel) = slot.as_ref() {
            if channel.is_open() {
                return Ok(Arc::clone(channel));
            }
        }

        let connection = self.connection().await?;
        debug!("Opening broker channel");
        let channel = connection.open_channel().await?;
        *slot = Some(Arc::clone(&channel));
        Ok(channel)
    }

    /// Close the channel and the connection; a no-op when nothing is open
    pub async fn close(&self) -> Result<()> {
        if let Some(channel) = self.channel.lock().await.take() {
            channel.close().await?;
        }
        if let Some(connection) = self.connection.lock().await.take() {
            connection.close().await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mqlink_transport::{BrokerOp, MemoryBroker};

    fn params() -> ConnectParams {
        ConnectParams {
            host: "localhost".to_string(),
            port: 5672,
            username: "guest".to_string(),
            password: "guest".to_string(),
            virtual_host: "/".to_string(),
        }
    }

    fn count(broker: &MemoryBroker, op: &BrokerOp) -> usize {
        broker.ops().iter().filter(|seen| *seen == op).count()
    }

    #[tokio::test]
    async fn test_connection_reused_while_open() {
        let broker = MemoryBroker::new();
        let manager = ConnectionManager::new(Arc::new(broker.clone()), params());

        let first = manager.connection().await.unwrap();
        let second = manager.connection().await.unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(count(&broker, &BrokerOp::Connect), 1);
    }

    #[tokio::test]
    async fn test_channel_reused_while_open() {
        let broker = MemoryBroker::new();
        let manager = ConnectionManager::new(Arc::new(broker.clone()), params());

        let first = manager.channel().await.unwrap();
        let second = manager.channel().await.unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(count(&broker, &BrokerOp::Connect), 1);
        assert_eq!(count(&broker, &BrokerOp::OpenChannel), 1);
    }

    #[tokio::test]
    async fn test_closed_connection_is_replaced_not_reused() {
        let broker = MemoryBroker::new();
        let manager = ConnectionManager::new(Arc::new(broker.clone()), params());

        let first = manager.connection().await.unwrap();
        first.close().await.unwrap();

        let second = manager.connection().await.unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
        assert_eq!(count(&broker, &BrokerOp::Connect), 2);
    }

    #[tokio::test]
    async fn test_close_without_open_is_noop() {
        let broker = MemoryBroker::new();
        let manager = ConnectionManager::new(Arc::new(broker.clone()), params());

        manager.close().await.unwrap();
        assert!(broker.ops().is_empty());
    }

    #[tokio::test]
    async fn test_close_shuts_channel_then_connection() {
        let broker = MemoryBroker::new();
        let manager = ConnectionManager::new(Arc::new(broker.clone()), params());

        manager.channel().await.unwrap();
        manager.close().await.unwrap();

        let ops = broker.ops();
        let channel_close = ops.iter().position(|op| *op == BrokerOp::CloseChannel);
        let connection_close = ops.iter().position(|op| *op == BrokerOp::CloseConnection);
        assert!(channel_close.unwrap() < connection_close.unwrap());
    }
}
