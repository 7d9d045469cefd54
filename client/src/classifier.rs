//! Error classification for retry and circuit decisions.
//!
//! Maps a raw failure of one network exchange onto an [`ErrorKind`].
//! Rules are checked in order:
//!
//! 1. no response at all -> `NetworkUnavailable`
//! 2. 429 -> `RateLimited` (with `Retry-After`, default 60s)
//! 3. 401/403 -> `Unauthorized`
//! 4. other 4xx -> `InvalidRequest`
//! 5. 5xx -> `ServerFault`
//! 6. anything else -> `Unknown`

use std::time::Duration;

use chrono::DateTime;
use chrono::Utc;
use reqwest::header::RETRY_AFTER;

use crate::error::ApiError;
use crate::error::ErrorKind;

/// Used when a 429 carries no usable `Retry-After`.
pub const DEFAULT_RETRY_AFTER: Duration = Duration::from_secs(60);

/// Trait for errors the retry executor can reason about.
pub trait RetryClassifiable {
    fn is_retryable(&self) -> bool;

    /// Minimum wait the failure itself asks for, if any.
    fn suggested_backoff(&self) -> Option<Duration>;
}

impl RetryClassifiable for ApiError {
    fn is_retryable(&self) -> bool {
        self.retryable
    }

    fn suggested_backoff(&self) -> Option<Duration> {
        match self.kind {
            ErrorKind::RateLimited { retry_after } => Some(retry_after),
            _ => None,
        }
    }
}

/// A failed exchange, before classification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Failure {
    /// The request never got a response.
    Transport { message: String },
    /// The server answered with a non-success status.
    Status {
        status: u16,
        retry_after: Option<Duration>,
        body: Option<String>,
    },
    /// A success response whose body is not valid JSON.
    Decode { message: String },
    /// Valid JSON that does not match the expected response type.
    Schema { message: String },
}

impl Failure {
    pub fn from_reqwest(err: &reqwest::Error) -> Self {
        if let Some(status) = err.status() {
            return Failure::Status {
                status: status.as_u16(),
                retry_after: None,
                body: None,
            };
        }
        if err.is_decode() {
            return Failure::Decode {
                message: err.to_string(),
            };
        }
        Failure::Transport {
            message: err.to_string(),
        }
    }

    /// Drains a non-success response into a `Failure::Status`.
    pub async fn from_response(response: reqwest::Response) -> Self {
        let status = response.status().as_u16();
        let retry_after = response
            .headers()
            .get(RETRY_AFTER)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| parse_retry_after(value, Utc::now()));
        let body = response.text().await.ok().filter(|b| !b.trim().is_empty());
        Failure::Status {
            status,
            retry_after,
            body,
        }
    }
}

/// Classifies `failure` for a request to `endpoint`.
pub fn classify(failure: &Failure, endpoint: &str, default_retry_after: Duration) -> ApiError {
    match failure {
        Failure::Transport { message } => ApiError::new(ErrorKind::NetworkUnavailable, endpoint)
            .with_message(format!("Unable to reach the analysis service: {message}")),
        Failure::Status {
            status,
            retry_after,
            body,
        } => {
            let kind = match *status {
                429 => ErrorKind::RateLimited {
                    retry_after: retry_after.unwrap_or(default_retry_after),
                },
                401 | 403 => ErrorKind::Unauthorized,
                400..=499 => ErrorKind::InvalidRequest,
                500..=599 => ErrorKind::ServerFault,
                _ => ErrorKind::Unknown,
            };
            let mut err = ApiError::new(kind, endpoint).with_status(*status);
            if let Some(detail) = body.as_deref().and_then(extract_detail) {
                err.message = format!("{} ({detail})", err.message);
            }
            err
        }
        Failure::Decode { message } => ApiError::new(ErrorKind::Unknown, endpoint)
            .with_message(format!("Could not decode the service response: {message}")),
        Failure::Schema { message } => {
            let mut err = ApiError::new(ErrorKind::InvalidRequest, endpoint).with_message(format!(
                "The service response did not have the expected shape: {message}"
            ));
            err.suggested_actions = vec!["Contact support if this persists".to_string()];
            err
        }
    }
}

/// Parses a `Retry-After` header: delta-seconds or an HTTP date.
pub fn parse_retry_after(value: &str, now: DateTime<Utc>) -> Option<Duration> {
    let value = value.trim();
    if let Ok(secs) = value.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }
    let at = DateTime::parse_from_rfc2822(value).ok()?.with_timezone(&Utc);
    Some((at - now).to_std().unwrap_or(Duration::ZERO))
}

/// Pulls a human-readable reason out of a JSON error body
/// (`{"detail": ...}`, `{"error": ...}` or `{"message": ...}`).
fn extract_detail(body: &str) -> Option<String> {
    let value: serde_json::Value = serde_json::from_str(body).ok()?;
    ["detail", "error", "message"].iter().find_map(|key| {
        let field = value.get(key)?;
        match field {
            serde_json::Value::String(s) => Some(s.clone()),
            serde_json::Value::Object(obj) => obj
                .get("message")
                .and_then(|m| m.as_str())
                .map(str::to_string),
            _ => None,
        }
    })
}
