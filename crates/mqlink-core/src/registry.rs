//! Client registry
//!
//! The single entry point applications drive: register clients, then
//! `start` to bring the topology up and park until `stop`, which runs the
//! teardown. Nothing in this layer is reused across a start/stop cycle; a
//! second run needs fresh instances.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::Notify;
use tracing::info;

use mqlink_transport::Connector;
use mqlink_types::{Error, MessageMetadata, Result};

use crate::client::{ErrorHook, MessageClient};
use crate::config::Settings;
use crate::connection::ConnectionManager;
use crate::orchestrator::SetupOrchestrator;

/// Requests a running registry to shut down
#[derive(Clone)]
pub struct StopHandle {
    shutdown: Arc<Notify>,
}

impl StopHandle {
    /// Initiate graceful teardown
    pub fn stop(&self) {
        self.shutdown.notify_one();
    }
}

/// Registry of message clients sharing one broker connection
pub struct ClientRegistry {
    connector: Arc<dyn Connector>,
    clients: Vec<Arc<MessageClient>>,
    default_error_hook: Option<ErrorHook>,
    shutdown: Arc<Notify>,
    started: AtomicBool,
}

impl ClientRegistry {
    /// Create a registry over the given transport
    pub fn new(connector: Arc<dyn Connector>) -> Self {
        Self {
            connector,
            clients: Vec::new(),
            default_error_hook: None,
            shutdown: Arc::new(Notify::new()),
            started: AtomicBool::new(false),
        }
    }

    /// Register a client; the returned handle stays valid for publishing
    pub fn add_client(&mut self, client: MessageClient) -> Arc<MessageClient> {
        let client = Arc::new(client);
        self.clients.push(Arc::clone(&client));
        client
    }

    /// Install the fallback error hook used by clients without their own
    pub fn set_default_error_hook<F>(&mut self, hook: F)
    where
        F: Fn(&MessageClient, &Error, &MessageMetadata) + Send + Sync + 'static,
    {
        self.default_error_hook = Some(Arc::new(hook));
    }

    /// Handle for stopping the registry from another task
    pub fn stop_handle(&self) -> StopHandle {
        StopHandle {
            shutdown: Arc::clone(&self.shutdown),
        }
    }

    /// Initiate graceful teardown
    pub fn stop(&self) {
        self.shutdown.notify_one();
    }

    /// Bring the topology up, park until `stop`, then tear everything
    /// down. Setup errors abort startup immediately. A registry instance
    /// runs at most once.
    pub async fn start(&mut self, settings: &Settings) -> Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(Error::AlreadyStarted);
        }

        let params = settings.connect_params()?;
        let app_id = settings.app_id()?;
        let default_prefetch = settings.default_prefetch()?;

        let connections = ConnectionManager::new(Arc::clone(&self.connector), params);
        let mut orchestrator = SetupOrchestrator::new(
            self.clients.clone(),
            connections,
            app_id,
            default_prefetch,
            self.default_error_hook.clone(),
        );

        orchestrator.setup().await?;
        info!(clients = self.clients.len(), "Registry running");

        self.shutdown.notified().await;
        info!("Shutting down registry");
        orchestrator.tear_down().await
    }
}
