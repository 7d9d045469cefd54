//! Resilient client for the brand audit analysis service.
//!
//! Requests go through [`RequestClient`], which layers per-endpoint circuit
//! breakers over bounded retries. Job progress arrives over a long-lived
//! stream owned by [`ConnectionManager`], fanned out by [`EventDispatcher`]
//! and folded into [`ProgressSnapshot`]s.

pub mod api;
pub mod circuit_breaker;
pub mod classifier;
pub mod client;
pub mod config;
pub mod connection;
pub mod context;
pub mod dispatcher;
pub mod error;
pub mod heartbeat;
pub mod notify;
pub mod progress;
pub mod retry;
pub mod transport;

pub use api::AnalysisApi;
pub use circuit_breaker::CircuitBreakerRegistry;
pub use circuit_breaker::CircuitState;
pub use client::Endpoint;
pub use client::RequestClient;
pub use client::RequestOptions;
pub use config::ClientConfig;
pub use config::ConfigError;
pub use config::ConfigLoader;
pub use connection::ConnectionConfig;
pub use connection::ConnectionManager;
pub use connection::ConnectionSnapshot;
pub use connection::ConnectionStatus;
pub use context::ClientContext;
pub use dispatcher::EventDispatcher;
pub use dispatcher::EventType;
pub use dispatcher::StreamEvent;
pub use dispatcher::SubscribeOptions;
pub use dispatcher::SubscriptionHandle;
pub use error::ApiError;
pub use error::ErrorKind;
pub use error::Presentation;
pub use error::Result;
pub use heartbeat::ConnectionQuality;
pub use notify::Notice;
pub use notify::NoticeLevel;
pub use notify::Notifier;
pub use notify::TracingNotifier;
pub use progress::ProgressReducer;
pub use progress::ProgressSnapshot;
pub use progress::ProgressTracker;
pub use retry::RetryConfig;
pub use retry::RetryExecutor;
pub use transport::StreamConnector;
pub use transport::StreamSession;
pub use transport::TransportError;
pub use transport::WsConnector;
