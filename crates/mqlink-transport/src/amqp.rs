//! AMQP transport backend
//!
//! Speaks AMQP 0.9.1 via `lapin`. The orchestration layer never sees lapin
//! types; everything is adapted at this boundary.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicPublishOptions,
    BasicQosOptions, ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
};
use lapin::types::{FieldTable, ShortString};
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties};
use tokio::sync::mpsc;
use tracing::{debug, error};

use mqlink_types::{Delivery, Error, ExchangeKind, MessageMetadata, MessageProperties, Result};

use crate::traits::{
    BrokerChannel, BrokerConnection, ConnectParams, Connector, DeliveryReceiver, DELIVERY_BUFFER,
};

/// AMQP reply code for a clean close
const REPLY_SUCCESS: u16 = 200;

fn transport_err(err: lapin::Error) -> Error {
    Error::Transport(err.to_string())
}

fn to_lapin_kind(kind: ExchangeKind) -> lapin::ExchangeKind {
    match kind {
        ExchangeKind::Direct => lapin::ExchangeKind::Direct,
        ExchangeKind::Fanout => lapin::ExchangeKind::Fanout,
        ExchangeKind::Topic => lapin::ExchangeKind::Topic,
        ExchangeKind::Headers => lapin::ExchangeKind::Headers,
    }
}

/// Connector for real AMQP brokers
#[derive(Debug, Clone, Default)]
pub struct AmqpConnector;

impl AmqpConnector {
    /// Create a new AMQP connector
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Connector for AmqpConnector {
    async fn connect(&self, params: &ConnectParams) -> Result<Arc<dyn BrokerConnection>> {
        debug!(
            host = %params.host,
            port = params.port,
            vhost = %params.virtual_host,
            "Opening AMQP connection"
        );

        let connection = Connection::connect(&params.amqp_uri(), ConnectionProperties::default())
            .await
            .map_err(transport_err)?;

        Ok(Arc::new(AmqpConnection { inner: connection }))
    }
}

/// One open AMQP connection
pub struct AmqpConnection {
    inner: Connection,
}

#[async_trait]
impl BrokerConnection for AmqpConnection {
    async fn open_channel(&self) -> Result<Arc<dyn BrokerChannel>> {
        let channel = self.inner.create_channel().await.map_err(transport_err)?;
        Ok(Arc::new(AmqpChannel { inner: channel }))
    }

    fn is_open(&self) -> bool {
        self.inner.status().connected()
    }

    async fn close(&self) -> Result<()> {
        if !self.inner.status().connected() {
            return Ok(());
        }

        self.inner
            .close(REPLY_SUCCESS, "closed by client")
            .await
            .map_err(transport_err)
    }
}

/// One channel over an AMQP connection
pub struct AmqpChannel {
    inner: Channel,
}

#[async_trait]
impl BrokerChannel for AmqpChannel {
    // ==================== Topology ====================

    async fn declare_exchange(&self, name: &str, kind: ExchangeKind) -> Result<()> {
        self.inner
            .exchange_declare(
                name,
                to_lapin_kind(kind),
                ExchangeDeclareOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(transport_err)
    }

    async fn declare_queue(&self, name: &str) -> Result<()> {
        self.inner
            .queue_declare(name, QueueDeclareOptions::default(), FieldTable::default())
            .await
            .map(|_| ())
            .map_err(transport_err)
    }

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()> {
        self.inner
            .queue_bind(
                queue,
                exchange,
                routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(transport_err)
    }

    // ==================== Consuming ====================

    async fn set_prefetch(&self, count: u16) -> Result<()> {
        self.inner
            .basic_qos(count, BasicQosOptions::default())
            .await
            .map_err(transport_err)
    }

    async fn consume(&self, queue: &str) -> Result<(String, DeliveryReceiver)> {
        let mut consumer = self
            .inner
            .basic_consume(
                queue,
                "",
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(transport_err)?;

        let tag = consumer.tag().to_string();
        let (tx, rx) = mpsc::channel(DELIVERY_BUFFER);

        let consumer_tag = tag.clone();
        tokio::spawn(async move {
            while let Some(attempt) = consumer.next().await {
                let delivery = match attempt {
                    Ok(delivery) => delivery,
                    Err(err) => {
                        error!(consumer = %consumer_tag, error = %err, "Consumer stream failed");
                        break;
                    }
                };

                let forwarded = Delivery {
                    metadata: MessageMetadata {
                        delivery_tag: delivery.delivery_tag,
                        redelivered: delivery.redelivered,
                        exchange: delivery.exchange.to_string(),
                        routing_key: delivery.routing_key.to_string(),
                        properties: MessageProperties {
                            content_type: delivery
                                .properties
                                .content_type()
                                .as_ref()
                                .map(|value| value.to_string()),
                            app_id: delivery
                                .properties
                                .app_id()
                                .as_ref()
                                .map(|value| value.to_string()),
                        },
                    },
                    body: Bytes::from(delivery.data),
                };

                if tx.send(forwarded).await.is_err() {
                    // receiver side went away, stop pumping
                    break;
                }
            }

            debug!(consumer = %consumer_tag, "Consumer stream ended");
        });

        Ok((tag, rx))
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<()> {
        self.inner
            .basic_cancel(consumer_tag, BasicCancelOptions::default())
            .await
            .map_err(transport_err)
    }

    async fn ack(&self, delivery_tag: u64) -> Result<()> {
        self.inner
            .basic_ack(delivery_tag, BasicAckOptions::default())
            .await
            .map_err(transport_err)
    }

    // ==================== Publishing ====================

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: Bytes,
        properties: &MessageProperties,
    ) -> Result<()> {
        let mut props = BasicProperties::default();
        if let Some(content_type) = &properties.content_type {
            props = props.with_content_type(ShortString::from(content_type.clone()));
        }
        if let Some(app_id) = &properties.app_id {
            props = props.with_app_id(ShortString::from(app_id.clone()));
        }

        self.inner
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                &body,
                props,
            )
            .await
            .map(|_| ())
            .map_err(transport_err)
    }

    // ==================== Lifecycle ====================

    fn is_open(&self) -> bool {
        self.inner.status().connected()
    }

    async fn close(&self) -> Result<()> {
        if !self.inner.status().connected() {
            return Ok(());
        }

        self.inner
            .close(REPLY_SUCCESS, "closed by client")
            .await
            .map_err(transport_err)
    }
}
