//! Broker-side topology setup and teardown
//!
//! Sequences the handshake for every registered client over one shared
//! channel: declare exchange, declare queue, bind, set QoS, attach the
//! consumer. Teardown cancels every consumer and only closes the channel
//! and connection once all cancellations have completed, in whatever order
//! the broker confirms them.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use futures::future::join_all;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use mqlink_transport::{BrokerChannel, DeliveryReceiver};
use mqlink_types::{Address, Error, Result};

use crate::client::{ErrorHook, MessageClient};
use crate::connection::ConnectionManager;

/// Progress of the broker-side handshake
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetupState {
    /// Nothing has happened yet
    Idle,
    /// Waiting for the connection handshake
    Connecting,
    /// Connection open, waiting for the channel
    ChannelOpen,
    /// Topology in place, consumers attached
    Running,
    /// Teardown finished
    Stopped,
}

/// One attached consumer: its broker tag and the task pumping deliveries
struct ConsumerHandle {
    tag: String,
    pump: JoinHandle<()>,
}

/// Drives the handshake and teardown for a set of clients
pub struct SetupOrchestrator {
    clients: Vec<Arc<MessageClient>>,
    connections: ConnectionManager,
    app_id: String,
    default_prefetch: u16,
    default_error_hook: Option<ErrorHook>,
    channel: Option<Arc<dyn BrokerChannel>>,
    consumers: Vec<ConsumerHandle>,
    state: SetupState,
}

impl SetupOrchestrator {
    pub(crate) fn new(
        clients: Vec<Arc<MessageClient>>,
        connections: ConnectionManager,
        app_id: String,
        default_prefetch: u16,
        default_error_hook: Option<ErrorHook>,
    ) -> Self {
        Self {
            clients,
            connections,
            app_id,
            default_prefetch,
            default_error_hook,
            channel: None,
            consumers: Vec::new(),
            state: SetupState::Idle,
        }
    }

    /// Current handshake state
    pub fn state(&self) -> SetupState {
        self.state
    }

    /// Tags of the consumers attached so far
    pub fn consumer_tags(&self) -> Vec<String> {
        self.consumers
            .iter()
            .map(|consumer| consumer.tag.clone())
            .collect()
    }

    /// Run the full handshake: connection, channel, then per-client
    /// topology. Steps for one client are strictly sequential; the relative
    /// order between clients is not part of the contract.
    pub async fn setup(&mut self) -> Result<()> {
        self.state = SetupState::Connecting;
        self.connections.connection().await?;

        self.state = SetupState::ChannelOpen;
        let channel = self.connections.channel().await?;
        self.channel = Some(Arc::clone(&channel));

        let clients = self.clients.clone();
        for client in &clients {
            client.bind(
                Arc::clone(&channel),
                self.app_id.clone(),
                self.default_error_hook.clone(),
            );

            if let Some(address) = client.publisher_address() {
                self.setup_address(&channel, address, None).await?;
            }
            if let Some(address) = client.subscriber_address() {
                self.setup_address(&channel, address, Some(client)).await?;
            }
        }

        self.state = SetupState::Running;
        info!(
            clients = clients.len(),
            consumers = self.consumers.len(),
            "Broker topology ready"
        );
        Ok(())
    }

    /// Bring one address online: exchange, queue, binding, and for
    /// subscriber legs the QoS and the consumer itself
    async fn setup_address(
        &mut self,
        channel: &Arc<dyn BrokerChannel>,
        address: &Address,
        subscriber: Option<&Arc<MessageClient>>,
    ) -> Result<()> {
        // Default-exchange addresses route straight to the queue: no
        // exchange to declare, nothing to bind.
        if !address.is_default_exchange() {
            debug!(
                exchange = %address.exchange,
                kind = address.exchange_kind.as_str(),
                "Declaring exchange"
            );
            channel
                .declare_exchange(&address.exchange, address.exchange_kind)
                .await?;
        }

        debug!(queue = %address.queue, "Declaring queue");
        channel.declare_queue(&address.queue).await?;

        if !address.is_default_exchange() {
            debug!(
                queue = %address.queue,
                exchange = %address.exchange,
                routing_key = %address.routing_key(),
                "Binding queue"
            );
            channel
                .bind_queue(&address.queue, &address.exchange, address.routing_key())
                .await?;
        }

        let Some(client) = subscriber else {
            return Ok(());
        };

        let prefetch = client.prefetch_count().unwrap_or(self.default_prefetch);
        channel.set_prefetch(prefetch).await?;

        let (tag, deliveries) = channel.consume(&address.queue).await?;
        debug!(queue = %address.queue, consumer = %tag, "Consumer attached");

        let pump = Self::spawn_pump(Arc::clone(channel), Arc::clone(client), deliveries);
        self.consumers.push(ConsumerHandle { tag, pump });
        Ok(())
    }

    /// Pump task for one consumer: acknowledge every delivery on receipt,
    /// then hand it to the client. Acknowledging first keeps a failing
    /// handler from triggering broker redelivery.
    fn spawn_pump(
        channel: Arc<dyn BrokerChannel>,
        client: Arc<MessageClient>,
        mut deliveries: DeliveryReceiver,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(delivery) = deliveries.recv().await {
                if let Err(err) = channel.ack(delivery.metadata.delivery_tag).await {
                    warn!(
                        delivery_tag = delivery.metadata.delivery_tag,
                        error = %err,
                        "Failed to acknowledge delivery"
                    );
                }
                client.handle_delivery(delivery);
            }
        })
    }

    /// Cancel every consumer, wait for all cancellations to complete, then
    /// close the channel and the connection. The close sequence runs at
    /// most once per orchestrator.
    pub async fn tear_down(&mut self) -> Result<()> {
        if self.state == SetupState::Stopped {
            return Ok(());
        }

        let consumers = std::mem::take(&mut self.consumers);
        if consumers.is_empty() {
            // Publisher-only topology: nothing to cancel, but the channel
            // and connection still come down.
            return self.close_all().await;
        }

        let channel = self.channel.clone().ok_or(Error::NotConnected)?;
        let total = consumers.len();
        let completed = Arc::new(AtomicUsize::new(0));

        let mut pumps = Vec::with_capacity(total);
        let cancellations: Vec<_> = consumers
            .into_iter()
            .map(|consumer| {
                let ConsumerHandle { tag, pump } = consumer;
                pumps.push(pump);

                let channel = Arc::clone(&channel);
                let completed = Arc::clone(&completed);
                async move {
                    if let Err(err) = channel.cancel(&tag).await {
                        warn!(consumer = %tag, error = %err, "Failed to cancel consumer");
                    }
                    let done = completed.fetch_add(1, Ordering::SeqCst) + 1;
                    debug!(consumer = %tag, done, total, "Consumer cancelled");
                }
            })
            .collect();

        // The join barrier: the close sequence must not start until every
        // cancellation has completed, in whatever order they finish.
        join_all(cancellations).await;

        // Cancelled consumers close their delivery streams; let the pumps
        // drain before the channel goes away.
        for pump in pumps {
            if let Err(err) = pump.await {
                warn!(error = %err, "Consumer pump task failed");
            }
        }

        self.close_all().await
    }

    async fn close_all(&mut self) -> Result<()> {
        debug!("Closing broker channel and connection");
        self.channel = None;

        if let Err(err) = self.connections.close().await {
            error!(error = %err, "Failed to close broker connection");
        }

        self.state = SetupState::Stopped;
        Ok(())
    }
}
