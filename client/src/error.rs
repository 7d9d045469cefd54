//! Error taxonomy for the request and streaming paths.
//!
//! Every failure a caller can observe is an [`ApiError`]: a closed
//! [`ErrorKind`] plus the context presentation code needs (endpoint,
//! error id, message, suggested actions). Retryability is an explicit
//! field so control flow never depends on matching on error types.

use std::fmt;
use std::time::Duration;

use chrono::DateTime;
use chrono::Utc;
use uuid::Uuid;

/// Result alias for client operations.
pub type Result<T> = std::result::Result<T, ApiError>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorKind {
    /// HTTP 429. `retry_after` comes from the response or defaults to 60s.
    RateLimited { retry_after: Duration },
    /// HTTP 401/403.
    Unauthorized,
    /// Any other 4xx, or a request rejected before it was sent.
    InvalidRequest,
    /// HTTP 5xx.
    ServerFault,
    /// No response at all: DNS, refused connection, timeout.
    NetworkUnavailable,
    Unknown,
    /// Rejected locally by an open circuit; no network call was made.
    CircuitOpen { retry_after: Duration },
    /// The stream could not be re-established within the reconnect budget.
    ConnectionFailed,
    /// Advisory: no inbound stream traffic for too long.
    ConnectionStale,
}

impl ErrorKind {
    pub fn is_retryable(&self) -> bool {
        match self {
            ErrorKind::RateLimited { .. }
            | ErrorKind::ServerFault
            | ErrorKind::NetworkUnavailable
            | ErrorKind::Unknown => true,
            ErrorKind::Unauthorized
            | ErrorKind::InvalidRequest
            | ErrorKind::CircuitOpen { .. }
            | ErrorKind::ConnectionFailed
            | ErrorKind::ConnectionStale => false,
        }
    }

    /// Failures that say something about the health of the endpoint itself
    /// and therefore count against its circuit.
    pub fn is_endpoint_health_failure(&self) -> bool {
        matches!(self, ErrorKind::ServerFault | ErrorKind::NetworkUnavailable)
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            ErrorKind::RateLimited { retry_after } | ErrorKind::CircuitOpen { retry_after } => {
                Some(*retry_after)
            }
            _ => None,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            ErrorKind::RateLimited { .. } => "rate_limited",
            ErrorKind::Unauthorized => "unauthorized",
            ErrorKind::InvalidRequest => "invalid_request",
            ErrorKind::ServerFault => "server_fault",
            ErrorKind::NetworkUnavailable => "network_unavailable",
            ErrorKind::Unknown => "unknown",
            ErrorKind::CircuitOpen { .. } => "circuit_open",
            ErrorKind::ConnectionFailed => "connection_failed",
            ErrorKind::ConnectionStale => "connection_stale",
        }
    }

    fn default_message(&self) -> String {
        match self {
            ErrorKind::RateLimited { retry_after } => format!(
                "Too many requests; the service asked to wait {}s",
                retry_after.as_secs()
            ),
            ErrorKind::Unauthorized => "You are not authorized to perform this request".into(),
            ErrorKind::InvalidRequest => "The request was rejected as invalid".into(),
            ErrorKind::ServerFault => "The analysis service encountered an internal error".into(),
            ErrorKind::NetworkUnavailable => "Unable to reach the analysis service".into(),
            ErrorKind::Unknown => "An unexpected error occurred".into(),
            ErrorKind::CircuitOpen { retry_after } => format!(
                "Service temporarily unavailable; retry in {}s",
                retry_after.as_secs()
            ),
            ErrorKind::ConnectionFailed => "Lost the live progress connection".into(),
            ErrorKind::ConnectionStale => "No progress updates received recently".into(),
        }
    }

    fn default_actions(&self) -> Vec<String> {
        let actions: &[&str] = match self {
            ErrorKind::RateLimited { .. } => &["Wait a moment before trying again"],
            ErrorKind::Unauthorized => &["Sign in again", "Check that your API token is valid"],
            ErrorKind::InvalidRequest => &["Check the company name and try again"],
            ErrorKind::ServerFault => &["Try again shortly", "Contact support if this persists"],
            ErrorKind::NetworkUnavailable => &[
                "Check your internet connection",
                "Verify the service address in your configuration",
            ],
            ErrorKind::Unknown => &["Try again shortly"],
            ErrorKind::CircuitOpen { .. } => &["Wait for the service to recover, then retry"],
            ErrorKind::ConnectionFailed => &[
                "Check your internet connection",
                "Re-open the job to resume live progress",
            ],
            ErrorKind::ConnectionStale => &["Progress may be delayed; keep waiting or refresh"],
        };
        actions.iter().map(|a| (*a).to_string()).collect()
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// How presentation code should frame an error to the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Presentation {
    /// "Try again shortly."
    Transient,
    /// Fix input or re-authenticate.
    ActionRequired,
    /// Circuit open: "service temporarily unavailable" with a retry time.
    TemporarilyUnavailable,
}

/// A classified failure, enriched with where and when it happened.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{message} [{kind}] ({endpoint}, error id {error_id})")]
pub struct ApiError {
    pub kind: ErrorKind,
    pub retryable: bool,
    pub error_id: String,
    pub endpoint: String,
    pub status: Option<u16>,
    pub timestamp: DateTime<Utc>,
    pub message: String,
    pub suggested_actions: Vec<String>,
}

impl ApiError {
    pub fn new(kind: ErrorKind, endpoint: impl Into<String>) -> Self {
        Self {
            retryable: kind.is_retryable(),
            error_id: Uuid::new_v4().to_string(),
            endpoint: endpoint.into(),
            status: None,
            timestamp: Utc::now(),
            message: kind.default_message(),
            suggested_actions: kind.default_actions(),
            kind,
        }
    }

    pub fn circuit_open(endpoint: impl Into<String>, retry_after: Duration) -> Self {
        Self::new(ErrorKind::CircuitOpen { retry_after }, endpoint)
    }

    pub fn connection_failed(attempts: u32) -> Self {
        let mut err = Self::new(ErrorKind::ConnectionFailed, "stream");
        err.message = format!("{} after {attempts} reconnect attempts", err.message);
        err
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }

    pub fn retry_after(&self) -> Option<Duration> {
        self.kind.retry_after()
    }

    pub fn presentation(&self) -> Presentation {
        match self.kind {
            ErrorKind::CircuitOpen { .. } => Presentation::TemporarilyUnavailable,
            _ if self.retryable => Presentation::Transient,
            _ => Presentation::ActionRequired,
        }
    }
}
