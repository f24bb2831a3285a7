//! In-memory broker backend
//!
//! A miniature broker living inside the process, for development and
//! testing. Routing follows the rules the real broker applies: the default
//! exchange routes straight to the queue named by the routing key, direct
//! exchanges route on exact binding match, fanout exchanges ignore the key.
//!
//! Every served operation is recorded in an op log so tests can assert on
//! the exact sequence the orchestration layer produced. Cancellations can
//! be held and released one by one to drive teardown-ordering tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info};
use uuid::Uuid;

use mqlink_types::{Delivery, Error, ExchangeKind, MessageMetadata, MessageProperties, Result};

use crate::traits::{
    BrokerChannel, BrokerConnection, ConnectParams, Connector, DeliveryReceiver, DELIVERY_BUFFER,
};

/// One recorded broker operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrokerOp {
    Connect,
    OpenChannel,
    DeclareExchange { exchange: String, kind: ExchangeKind },
    DeclareQueue { queue: String },
    BindQueue { queue: String, exchange: String, routing_key: String },
    SetPrefetch { count: u16 },
    Consume { queue: String, consumer_tag: String },
    Cancel { consumer_tag: String },
    Ack { delivery_tag: u64 },
    Publish { exchange: String, routing_key: String },
    CloseChannel,
    CloseConnection,
}

/// Exchange-to-queue binding
#[derive(Debug, Clone, PartialEq, Eq)]
struct Binding {
    exchange: String,
    queue: String,
    routing_key: String,
}

struct QueueState {
    /// Messages waiting for a consumer to attach
    backlog: VecDeque<Delivery>,
}

struct ConsumerState {
    queue: String,
    sender: mpsc::Sender<Delivery>,
}

struct BrokerState {
    exchanges: DashMap<String, ExchangeKind>,
    queues: DashMap<String, QueueState>,
    bindings: Mutex<Vec<Binding>>,
    consumers: DashMap<String, ConsumerState>,
    delivery_seq: AtomicU64,
    acked: Mutex<Vec<u64>>,
    ops: Mutex<Vec<BrokerOp>>,
    hold_cancellations: AtomicBool,
    pending_cancels: Mutex<Vec<(String, oneshot::Sender<()>)>>,
}

impl BrokerState {
    fn record(&self, op: BrokerOp) {
        self.ops.lock().push(op);
    }

    fn next_delivery_tag(&self) -> u64 {
        self.delivery_seq.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Queues a message published to `exchange` with `routing_key` lands in
    fn route(&self, exchange: &str, routing_key: &str) -> Vec<String> {
        if exchange.is_empty() {
            return vec![routing_key.to_string()];
        }

        let kind = self
            .exchanges
            .get(exchange)
            .map(|entry| *entry.value())
            .unwrap_or(ExchangeKind::Direct);

        self.bindings
            .lock()
            .iter()
            .filter(|binding| binding.exchange == exchange)
            .filter(|binding| match kind {
                ExchangeKind::Fanout => true,
                _ => binding.routing_key == routing_key,
            })
            .map(|binding| binding.queue.clone())
            .collect()
    }

    /// Hand a delivery to the queue's consumer, or park it in the backlog
    async fn deliver(&self, queue: &str, delivery: Delivery) {
        let sender = self.consumers.iter().find_map(|entry| {
            let consumer = entry.value();
            (consumer.queue == queue).then(|| consumer.sender.clone())
        });

        match sender {
            Some(sender) => {
                if let Err(returned) = sender.send(delivery).await {
                    // consumer detached mid-flight, keep the message
                    if let Some(mut state) = self.queues.get_mut(queue) {
                        state.backlog.push_back(returned.0);
                    }
                }
            }
            None => {
                if let Some(mut state) = self.queues.get_mut(queue) {
                    state.backlog.push_back(delivery);
                }
            }
        }
    }
}

/// In-process broker. Cloning shares the broker state; the clone handed to
/// a registry keeps serving the assertions of the test that owns it.
#[derive(Clone)]
pub struct MemoryBroker {
    state: Arc<BrokerState>,
}

impl MemoryBroker {
    /// Create a new in-memory broker
    pub fn new() -> Self {
        info!("Initializing in-memory broker");
        Self {
            state: Arc::new(BrokerState {
                exchanges: DashMap::new(),
                queues: DashMap::new(),
                bindings: Mutex::new(Vec::new()),
                consumers: DashMap::new(),
                delivery_seq: AtomicU64::new(0),
                acked: Mutex::new(Vec::new()),
                ops: Mutex::new(Vec::new()),
                hold_cancellations: AtomicBool::new(false),
                pending_cancels: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Snapshot of every operation served so far
    pub fn ops(&self) -> Vec<BrokerOp> {
        self.state.ops.lock().clone()
    }

    /// Delivery tags acknowledged so far
    pub fn acked(&self) -> Vec<u64> {
        self.state.acked.lock().clone()
    }

    /// Number of consumers currently attached
    pub fn consumer_count(&self) -> usize {
        self.state.consumers.len()
    }

    /// Hold consumer cancellations until released, so a test can complete
    /// them in an arbitrary order
    pub fn hold_cancellations(&self) {
        self.state.hold_cancellations.store(true, Ordering::SeqCst);
    }

    /// Tags of cancellations currently waiting for release
    pub fn pending_cancellations(&self) -> Vec<String> {
        self.state
            .pending_cancels
            .lock()
            .iter()
            .map(|(tag, _)| tag.clone())
            .collect()
    }

    /// Release one held cancellation; returns false for an unknown tag
    pub fn release_cancellation(&self, consumer_tag: &str) -> bool {
        let mut pending = self.state.pending_cancels.lock();
        match pending.iter().position(|(tag, _)| tag == consumer_tag) {
            Some(position) => {
                let (_, release) = pending.remove(position);
                let _ = release.send(());
                true
            }
            None => false,
        }
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Connector for MemoryBroker {
    async fn connect(&self, params: &ConnectParams) -> Result<Arc<dyn BrokerConnection>> {
        debug!(host = %params.host, "Opening in-memory connection");
        self.state.record(BrokerOp::Connect);

        Ok(Arc::new(MemoryConnection {
            state: Arc::clone(&self.state),
            open: AtomicBool::new(true),
        }))
    }
}

/// One open connection to the in-memory broker
pub struct MemoryConnection {
    state: Arc<BrokerState>,
    open: AtomicBool,
}

#[async_trait]
impl BrokerConnection for MemoryConnection {
    async fn open_channel(&self) -> Result<Arc<dyn BrokerChannel>> {
        if !self.open.load(Ordering::SeqCst) {
            return Err(Error::NotConnected);
        }

        self.state.record(BrokerOp::OpenChannel);
        Ok(Arc::new(MemoryChannel {
            state: Arc::clone(&self.state),
            open: AtomicBool::new(true),
        }))
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn close(&self) -> Result<()> {
        if self.open.swap(false, Ordering::SeqCst) {
            self.state.record(BrokerOp::CloseConnection);
        }
        Ok(())
    }
}

/// One channel over an in-memory connection
pub struct MemoryChannel {
    state: Arc<BrokerState>,
    open: AtomicBool,
}

#[async_trait]
impl BrokerChannel for MemoryChannel {
    // ==================== Topology ====================

    async fn declare_exchange(&self, name: &str, kind: ExchangeKind) -> Result<()> {
        self.state.record(BrokerOp::DeclareExchange {
            exchange: name.to_string(),
            kind,
        });
        self.state.exchanges.insert(name.to_string(), kind);
        debug!(exchange = %name, kind = kind.as_str(), "Exchange declared");
        Ok(())
    }

    async fn declare_queue(&self, name: &str) -> Result<()> {
        self.state.record(BrokerOp::DeclareQueue {
            queue: name.to_string(),
        });
        self.state
            .queues
            .entry(name.to_string())
            .or_insert_with(|| QueueState {
                backlog: VecDeque::new(),
            });
        debug!(queue = %name, "Queue declared");
        Ok(())
    }

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()> {
        self.state.record(BrokerOp::BindQueue {
            queue: queue.to_string(),
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
        });

        let binding = Binding {
            exchange: exchange.to_string(),
            queue: queue.to_string(),
            routing_key: routing_key.to_string(),
        };
        let mut bindings = self.state.bindings.lock();
        if !bindings.contains(&binding) {
            bindings.push(binding);
        }
        Ok(())
    }

    // ==================== Consuming ====================

    async fn set_prefetch(&self, count: u16) -> Result<()> {
        self.state.record(BrokerOp::SetPrefetch { count });
        Ok(())
    }

    async fn consume(&self, queue: &str) -> Result<(String, DeliveryReceiver)> {
        if !self.state.queues.contains_key(queue) {
            return Err(Error::Transport(format!("unknown queue: {queue}")));
        }

        let tag = format!("ctag-{}", Uuid::new_v4());
        let (tx, rx) = mpsc::channel(DELIVERY_BUFFER);

        let backlog: Vec<Delivery> = self
            .state
            .queues
            .get_mut(queue)
            .map(|mut state| state.backlog.drain(..).collect())
            .unwrap_or_default();

        if !backlog.is_empty() {
            // drain off-task so a large backlog can't wedge the attach
            let sender = tx.clone();
            tokio::spawn(async move {
                for delivery in backlog {
                    if sender.send(delivery).await.is_err() {
                        break;
                    }
                }
            });
        }

        self.state.consumers.insert(
            tag.clone(),
            ConsumerState {
                queue: queue.to_string(),
                sender: tx,
            },
        );
        self.state.record(BrokerOp::Consume {
            queue: queue.to_string(),
            consumer_tag: tag.clone(),
        });
        debug!(queue = %queue, consumer = %tag, "Consumer attached");

        Ok((tag, rx))
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<()> {
        if self.state.hold_cancellations.load(Ordering::SeqCst) {
            let (release_tx, release_rx) = oneshot::channel();
            self.state
                .pending_cancels
                .lock()
                .push((consumer_tag.to_string(), release_tx));
            // parked until the test releases this cancellation
            let _ = release_rx.await;
        }

        self.state.consumers.remove(consumer_tag);
        self.state.record(BrokerOp::Cancel {
            consumer_tag: consumer_tag.to_string(),
        });
        debug!(consumer = %consumer_tag, "Consumer cancelled");
        Ok(())
    }

    async fn ack(&self, delivery_tag: u64) -> Result<()> {
        self.state.record(BrokerOp::Ack { delivery_tag });
        self.state.acked.lock().push(delivery_tag);
        Ok(())
    }

    // ==================== Publishing ====================

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: Bytes,
        properties: &MessageProperties,
    ) -> Result<()> {
        self.state.record(BrokerOp::Publish {
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
        });

        if !exchange.is_empty() && !self.state.exchanges.contains_key(exchange) {
            return Err(Error::Transport(format!("unknown exchange: {exchange}")));
        }

        for queue in self.state.route(exchange, routing_key) {
            if !self.state.queues.contains_key(&queue) {
                debug!(queue = %queue, "Dropping unroutable message");
                continue;
            }

            let delivery = Delivery {
                metadata: MessageMetadata {
                    delivery_tag: self.state.next_delivery_tag(),
                    redelivered: false,
                    exchange: exchange.to_string(),
                    routing_key: routing_key.to_string(),
                    properties: properties.clone(),
                },
                body: body.clone(),
            };
            self.state.deliver(&queue, delivery).await;
        }

        Ok(())
    }

    // ==================== Lifecycle ====================

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn close(&self) -> Result<()> {
        if self.open.swap(false, Ordering::SeqCst) {
            self.state.record(BrokerOp::CloseChannel);
        }
        Ok(())
    }
}
