//! Publisher/subscriber clients
//!
//! A `MessageClient` is one logical unit attached to the broker topology:
//! at most one subscriber address, at most one publisher address, a message
//! handler and an optional error hook. The shared channel is injected once
//! by the orchestrator during setup.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, OnceLock};

use tracing::{debug, error};

use mqlink_transport::BrokerChannel;
use mqlink_types::{Address, Delivery, Error, MessageMetadata, MessageProperties, Payload, Result};

/// Asynchronous work produced by a handler
pub type HandlerTask = Pin<Box<dyn Future<Output = Result<()>> + Send + 'static>>;

/// Outcome of one handler invocation.
///
/// Handlers either finish inline or hand back a task; the dispatcher spawns
/// tasks on the runtime instead of awaiting them, so one slow handler never
/// blocks the delivery pump.
pub enum HandlerAction {
    /// Handler completed inline
    Done,
    /// Handler produced asynchronous work to run on the runtime
    Task(HandlerTask),
}

impl HandlerAction {
    /// Wrap a future as asynchronous handler work
    pub fn task<F>(future: F) -> Self
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        Self::Task(Box::pin(future))
    }
}

/// User message handler
pub type MessageHandler =
    Arc<dyn Fn(Payload, &MessageMetadata) -> Result<HandlerAction> + Send + Sync>;

/// Error hook. Receives the originating client, the error and the metadata
/// of the delivery that produced it.
pub type ErrorHook = Arc<dyn Fn(&MessageClient, &Error, &MessageMetadata) + Send + Sync>;

/// Shared resources injected once during setup
struct ClientRuntime {
    channel: Arc<dyn BrokerChannel>,
    /// Built once at bind time and reused for every publish
    publish_properties: MessageProperties,
    default_error_hook: Option<ErrorHook>,
}

/// Client that publishes and subscribes to broker queues
pub struct MessageClient {
    subscriber: Option<Address>,
    publisher: Option<Address>,
    on_message: Option<MessageHandler>,
    on_error: Option<ErrorHook>,
    parse_json: bool,
    prefetch_count: Option<u16>,
    runtime: OnceLock<ClientRuntime>,
}

impl MessageClient {
    /// Start building a client
    pub fn builder() -> MessageClientBuilder {
        MessageClientBuilder::default()
    }

    /// Address this client consumes from, if any
    pub fn subscriber_address(&self) -> Option<&Address> {
        self.subscriber.as_ref()
    }

    /// Address this client publishes to, if any
    pub fn publisher_address(&self) -> Option<&Address> {
        self.publisher.as_ref()
    }

    pub(crate) fn prefetch_count(&self) -> Option<u16> {
        self.prefetch_count
    }

    /// Inject the shared channel and registry-level defaults. Called once
    /// by the orchestrator; later calls are ignored.
    pub(crate) fn bind(
        &self,
        channel: Arc<dyn BrokerChannel>,
        app_id: String,
        default_error_hook: Option<ErrorHook>,
    ) {
        let _ = self.runtime.set(ClientRuntime {
            channel,
            publish_properties: MessageProperties {
                content_type: Some("application/json".to_string()),
                app_id: Some(app_id),
            },
            default_error_hook,
        });
    }

    /// Publish one message to this client's publisher address.
    ///
    /// Structured payloads are serialized to JSON. Fails before touching
    /// the network when no publisher address is configured or the client
    /// has not been attached to a channel yet.
    pub async fn publish(&self, payload: impl Into<Payload>) -> Result<()> {
        let address = self
            .publisher
            .as_ref()
            .ok_or(Error::MissingPublisherAddress)?;
        let runtime = self.runtime.get().ok_or(Error::NotConnected)?;

        let body = payload.into().into_bytes()?;
        debug!(queue = %address, "Publishing message");

        runtime
            .channel
            .publish(
                &address.exchange,
                address.routing_key(),
                body,
                &runtime.publish_properties,
            )
            .await
    }

    /// Dispatch one inbound delivery, already acknowledged by the
    /// orchestrator. Handler failures never propagate out of this call;
    /// they go through the error-hook chain.
    pub(crate) fn handle_delivery(self: &Arc<Self>, delivery: Delivery) {
        let Delivery { metadata, body } = delivery;
        let queue = self
            .subscriber
            .as_ref()
            .map(|address| address.queue.as_str())
            .unwrap_or_default();

        let Some(handler) = self.on_message.as_ref() else {
            debug!(
                delivery_tag = metadata.delivery_tag,
                queue = %queue,
                "Ignoring message: no handler registered"
            );
            return;
        };
        debug!(delivery_tag = metadata.delivery_tag, queue = %queue, "Processing message");

        let payload = match self.parse_incoming(&body) {
            Ok(payload) => payload,
            Err(err) => {
                self.route_error(&err, &metadata);
                return;
            }
        };

        match handler(payload, &metadata) {
            Ok(HandlerAction::Done) => {}
            Ok(HandlerAction::Task(task)) => {
                let client = Arc::clone(self);
                tokio::spawn(async move {
                    if let Err(err) = task.await {
                        client.route_error(&err, &metadata);
                    }
                });
            }
            Err(err) => self.route_error(&err, &metadata),
        }
    }

    fn parse_incoming(&self, body: &[u8]) -> Result<Payload> {
        let text = String::from_utf8(body.to_vec())?;
        if !self.parse_json {
            return Ok(Payload::Text(text));
        }

        match serde_json::from_str(&text) {
            Ok(value) => Ok(Payload::Json(value)),
            Err(source) => {
                error!(%text, "Couldn't decode message as JSON");
                Err(Error::InvalidFormat { text, source })
            }
        }
    }

    /// Route an error through the hook chain: client hook, then the
    /// registry default, then a logged fallback.
    fn route_error(&self, error: &Error, metadata: &MessageMetadata) {
        if let Some(hook) = &self.on_error {
            hook(self, error, metadata);
        } else if let Some(hook) = self
            .runtime
            .get()
            .and_then(|runtime| runtime.default_error_hook.as_ref())
        {
            hook(self, error, metadata);
        } else {
            error!(
                delivery_tag = metadata.delivery_tag,
                error = %error,
                "Uncaught error while processing message"
            );
        }
    }
}

/// Builder for [`MessageClient`]
pub struct MessageClientBuilder {
    subscriber: Option<Address>,
    publisher: Option<Address>,
    on_message: Option<MessageHandler>,
    on_error: Option<ErrorHook>,
    parse_json: bool,
    prefetch_count: Option<u16>,
}

impl Default for MessageClientBuilder {
    fn default() -> Self {
        Self {
            subscriber: None,
            publisher: None,
            on_message: None,
            on_error: None,
            parse_json: true,
            prefetch_count: None,
        }
    }
}

impl MessageClientBuilder {
    /// Consume from this address
    pub fn subscriber(mut self, address: Address) -> Self {
        self.subscriber = Some(address);
        self
    }

    /// Publish to this address
    pub fn publisher(mut self, address: Address) -> Self {
        self.publisher = Some(address);
        self
    }

    /// Handler invoked for each inbound message
    pub fn on_message<F>(mut self, handler: F) -> Self
    where
        F: Fn(Payload, &MessageMetadata) -> Result<HandlerAction> + Send + Sync + 'static,
    {
        self.on_message = Some(Arc::new(handler));
        self
    }

    /// Hook invoked when this client's handler fails
    pub fn on_error<F>(mut self, hook: F) -> Self
    where
        F: Fn(&MessageClient, &Error, &MessageMetadata) + Send + Sync + 'static,
    {
        self.on_error = Some(Arc::new(hook));
        self
    }

    /// Disable or enable JSON parsing of inbound payloads (on by default)
    pub fn parse_json(mut self, parse_json: bool) -> Self {
        self.parse_json = parse_json;
        self
    }

    /// Flow-control limit for this client's consumer
    pub fn prefetch_count(mut self, count: u16) -> Self {
        self.prefetch_count = Some(count);
        self
    }

    /// Validate the addresses and build the client.
    ///
    /// A client must carry at least one capability; both addresses are
    /// validated up front so startup fails before any network traffic.
    pub fn build(self) -> Result<MessageClient> {
        if self.subscriber.is_none() && self.publisher.is_none() {
            return Err(Error::ClientWithoutAddress);
        }

        let mut subscriber = self.subscriber;
        if let Some(address) = subscriber.as_mut() {
            address.validate()?;
        }
        let mut publisher = self.publisher;
        if let Some(address) = publisher.as_mut() {
            address.validate()?;
        }

        Ok(MessageClient {
            subscriber,
            publisher,
            on_message: self.on_message,
            on_error: self.on_error,
            parse_json: self.parse_json,
            prefetch_count: self.prefetch_count,
            runtime: OnceLock::new(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use mqlink_transport::{ConnectParams, Connector, MemoryBroker};
    use serde_json::json;
    use tokio::sync::mpsc;

    fn metadata(tag: u64) -> MessageMetadata {
        MessageMetadata {
            delivery_tag: tag,
            redelivered: false,
            exchange: String::new(),
            routing_key: "q1".to_string(),
            properties: MessageProperties::default(),
        }
    }

    fn delivery(tag: u64, body: &str) -> Delivery {
        Delivery {
            metadata: metadata(tag),
            body: Bytes::from(body.to_string()),
        }
    }

    async fn bound_channel(broker: &MemoryBroker) -> Arc<dyn BrokerChannel> {
        let params = ConnectParams {
            host: "localhost".to_string(),
            port: 5672,
            username: "guest".to_string(),
            password: "guest".to_string(),
            virtual_host: "/".to_string(),
        };
        let connection = broker.connect(&params).await.unwrap();
        connection.open_channel().await.unwrap()
    }

    #[test]
    fn test_builder_rejects_client_without_addresses() {
        let result = MessageClient::builder().build();
        assert!(matches!(result, Err(Error::ClientWithoutAddress)));
    }

    #[test]
    fn test_builder_validates_addresses() {
        let result = MessageClient::builder()
            .subscriber(Address::new(""))
            .build();
        assert!(matches!(result, Err(Error::MissingQueueName)));
    }

    #[tokio::test]
    async fn test_publish_without_publisher_address_fails() {
        let broker = MemoryBroker::new();
        let channel = bound_channel(&broker).await;

        let client = MessageClient::builder()
            .subscriber(Address::new("q1"))
            .build()
            .unwrap();
        client.bind(channel, "test".to_string(), None);

        let result = client.publish("hello").await;
        assert!(matches!(result, Err(Error::MissingPublisherAddress)));

        let publishes = broker
            .ops()
            .iter()
            .filter(|op| matches!(op, mqlink_transport::BrokerOp::Publish { .. }))
            .count();
        assert_eq!(publishes, 0);
    }

    #[tokio::test]
    async fn test_publish_before_bind_fails() {
        let client = MessageClient::builder()
            .publisher(Address::new("q1"))
            .build()
            .unwrap();

        assert!(matches!(
            client.publish("hello").await,
            Err(Error::NotConnected)
        ));
    }

    #[tokio::test]
    async fn test_publish_serializes_json_and_stamps_properties() {
        let broker = MemoryBroker::new();
        let channel = bound_channel(&broker).await;
        channel.declare_queue("q1").await.unwrap();
        let (_, mut deliveries) = channel.consume("q1").await.unwrap();

        let client = MessageClient::builder()
            .publisher(Address::new("q1"))
            .build()
            .unwrap();
        client.bind(channel, "billing".to_string(), None);

        client.publish(json!({"a": 1})).await.unwrap();

        let delivery = deliveries.recv().await.unwrap();
        let parsed: serde_json::Value = serde_json::from_slice(&delivery.body).unwrap();
        assert_eq!(parsed, json!({"a": 1}));
        assert_eq!(
            delivery.metadata.properties.content_type.as_deref(),
            Some("application/json")
        );
        assert_eq!(delivery.metadata.properties.app_id.as_deref(), Some("billing"));
    }

    #[tokio::test]
    async fn test_dispatch_parses_json_payload() {
        let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();

        let client = Arc::new(
            MessageClient::builder()
                .subscriber(Address::new("q1"))
                .on_message(move |payload, _| {
                    seen_tx.send(payload).unwrap();
                    Ok(HandlerAction::Done)
                })
                .build()
                .unwrap(),
        );

        client.handle_delivery(delivery(1, r#"{"a": 1}"#));

        let payload = seen_rx.recv().await.unwrap();
        assert_eq!(payload.as_json(), Some(&json!({"a": 1})));
    }

    #[tokio::test]
    async fn test_dispatch_keeps_text_when_parsing_disabled() {
        let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();

        let client = Arc::new(
            MessageClient::builder()
                .subscriber(Address::new("q1"))
                .parse_json(false)
                .on_message(move |payload, _| {
                    seen_tx.send(payload).unwrap();
                    Ok(HandlerAction::Done)
                })
                .build()
                .unwrap(),
        );

        client.handle_delivery(delivery(1, "not json"));

        let payload = seen_rx.recv().await.unwrap();
        assert_eq!(payload.as_str(), Some("not json"));
    }

    #[tokio::test]
    async fn test_invalid_json_routes_format_error_to_hook() {
        let (err_tx, mut err_rx) = mpsc::unbounded_channel();

        let client = Arc::new(
            MessageClient::builder()
                .subscriber(Address::new("q1"))
                .on_message(|_, _| Ok(HandlerAction::Done))
                .on_error(move |_, error, meta| {
                    err_tx.send((format!("{error}"), meta.clone())).unwrap();
                })
                .build()
                .unwrap(),
        );

        client.handle_delivery(delivery(7, "not json"));

        let (rendered, meta) = err_rx.recv().await.unwrap();
        assert!(rendered.contains("JSON"));
        assert_eq!(meta.delivery_tag, 7);
    }

    #[tokio::test]
    async fn test_handler_error_reaches_client_hook_with_same_metadata() {
        let (err_tx, mut err_rx) = mpsc::unbounded_channel();

        let client = Arc::new(
            MessageClient::builder()
                .subscriber(Address::new("q1"))
                .on_message(|_, _| Err(Error::Transport("boom".to_string())))
                .on_error(move |_, _, meta| {
                    err_tx.send(meta.clone()).unwrap();
                })
                .build()
                .unwrap(),
        );

        client.handle_delivery(delivery(42, r#"{"ok": true}"#));

        let meta = err_rx.recv().await.unwrap();
        assert_eq!(meta, metadata(42));
    }

    #[tokio::test]
    async fn test_async_handler_error_reaches_hook() {
        let (err_tx, mut err_rx) = mpsc::unbounded_channel();

        let client = Arc::new(
            MessageClient::builder()
                .subscriber(Address::new("q1"))
                .on_message(|_, _| {
                    Ok(HandlerAction::task(async {
                        Err(Error::Transport("late failure".to_string()))
                    }))
                })
                .on_error(move |_, error, _| {
                    err_tx.send(format!("{error}")).unwrap();
                })
                .build()
                .unwrap(),
        );

        client.handle_delivery(delivery(1, r#"{}"#));

        let rendered = err_rx.recv().await.unwrap();
        assert!(rendered.contains("late failure"));
    }

    #[tokio::test]
    async fn test_default_hook_used_when_client_has_none() {
        let broker = MemoryBroker::new();
        let channel = bound_channel(&broker).await;
        let (err_tx, mut err_rx) = mpsc::unbounded_channel();

        let default_hook: ErrorHook = Arc::new(move |_, error, _| {
            err_tx.send(format!("{error}")).unwrap();
        });

        let client = Arc::new(
            MessageClient::builder()
                .subscriber(Address::new("q1"))
                .on_message(|_, _| Err(Error::Transport("boom".to_string())))
                .build()
                .unwrap(),
        );
        client.bind(channel, "test".to_string(), Some(default_hook));

        client.handle_delivery(delivery(1, r#"{}"#));

        assert!(err_rx.recv().await.unwrap().contains("boom"));
    }

    #[tokio::test]
    async fn test_delivery_without_handler_is_dropped() {
        let client = Arc::new(
            MessageClient::builder()
                .subscriber(Address::new("q1"))
                .build()
                .unwrap(),
        );

        // nothing to assert beyond "does not panic"; the message is dropped
        client.handle_delivery(delivery(1, "ignored"));
    }
}
