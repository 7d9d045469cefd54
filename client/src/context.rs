//! Explicitly constructed client state.
//!
//! A [`ClientContext`] owns one circuit registry, one request client, one
//! dispatcher and one connection manager. Nothing is process-global, so
//! independent contexts (e.g. one per test) never share state.

use std::sync::Arc;

use crate::api::AnalysisApi;
use crate::circuit_breaker::CircuitBreakerRegistry;
use crate::client::RequestClient;
use crate::config::ClientConfig;
use crate::config::ConfigError;
use crate::connection::ConnectionManager;
use crate::dispatcher::EventDispatcher;
use crate::notify::Notifier;
use crate::notify::TracingNotifier;
use crate::progress::ProgressReducer;
use crate::progress::ProgressTracker;
use crate::transport::StreamConnector;
use crate::transport::WsConnector;

#[derive(Debug, Clone)]
pub struct ClientContext {
    config: ClientConfig,
    api: AnalysisApi,
    dispatcher: Arc<EventDispatcher>,
    connection: ConnectionManager,
}

impl ClientContext {
    /// Builds a context talking to the configured HTTP and WebSocket
    /// endpoints, reporting notices through `tracing`.
    pub fn new(config: ClientConfig) -> Result<Self, ConfigError> {
        let connector = WsConnector::new(config.stream_url()?)
            .map_err(|e| ConfigError::Validation(e.to_string()))?;
        Self::with_parts(config, Arc::new(connector), Arc::new(TracingNotifier))
    }

    pub fn with_parts(
        config: ClientConfig,
        connector: Arc<dyn StreamConnector>,
        notifier: Arc<dyn Notifier>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;

        let circuits = Arc::new(CircuitBreakerRegistry::new(config.circuit_config()));
        let client = RequestClient::new(&config, circuits, Arc::clone(&notifier))?;
        let dispatcher = Arc::new(EventDispatcher::new());
        let connection = ConnectionManager::spawn(
            connector,
            Arc::clone(&dispatcher),
            notifier,
            config.connection_config(),
        );

        Ok(Self {
            config,
            api: AnalysisApi::new(Arc::new(client)),
            dispatcher,
            connection,
        })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn api(&self) -> &AnalysisApi {
        &self.api
    }

    pub fn client(&self) -> &Arc<RequestClient> {
        self.api.client()
    }

    pub fn circuits(&self) -> &Arc<CircuitBreakerRegistry> {
        self.api.client().circuits()
    }

    pub fn dispatcher(&self) -> &Arc<EventDispatcher> {
        &self.dispatcher
    }

    pub fn connection(&self) -> &ConnectionManager {
        &self.connection
    }

    /// Starts following `job_id` over the stream. The returned tracker
    /// joins the job on creation and leaves it when dropped.
    pub fn track_job(&self, job_id: impl Into<String>) -> ProgressTracker {
        ProgressTracker::start(Arc::clone(&self.dispatcher), ProgressReducer::new(job_id))
    }
}
