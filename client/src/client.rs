//! The single request path used by every backend call.
//!
//! `request` consults the endpoint's circuit, runs the exchange under the
//! retry executor, records one outcome back into the circuit and returns
//! either the decoded body or a classified [`ApiError`].

use std::fmt;
use std::sync::Arc;
use std::sync::PoisonError;
use std::sync::RwLock;
use std::time::Duration;

use reqwest::Method;
use reqwest::header::CONTENT_TYPE;
use serde::de::DeserializeOwned;
use serde_json::Value;
use uuid::Uuid;

use crate::circuit_breaker::CircuitBreakerRegistry;
use crate::classifier::Failure;
use crate::classifier::classify;
use crate::config::ClientConfig;
use crate::config::ConfigError;
use crate::error::ApiError;
use crate::error::ErrorKind;
use crate::error::Result;
use crate::notify::Notice;
use crate::notify::Notifier;
use crate::retry;
use crate::retry::RetryExecutor;

pub const CORRELATION_ID_HEADER: &str = "X-Correlation-ID";

/// One HTTP operation: a method, the concrete path, and the route template
/// the path was built from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub method: Method,
    pub path: String,
    /// Logical route, e.g. `/analyze/{id}/status`. Circuits are keyed on it.
    pub route: String,
}

impl Endpoint {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        let path = path.into();
        Self {
            method,
            route: path.clone(),
            path,
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::GET, path)
    }

    pub fn post(path: impl Into<String>) -> Self {
        Self::new(Method::POST, path)
    }

    pub fn with_route(mut self, route: impl Into<String>) -> Self {
        self.route = route.into();
        self
    }

    pub fn circuit_key(&self) -> String {
        format!("{} {}", self.method, self.route)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.method, self.path)
    }
}

#[derive(Debug, Clone, Default)]
pub struct RequestOptions {
    /// JSON body, sent as-is.
    pub body: Option<Value>,
    /// Overrides the configured attempt budget.
    pub max_attempts: Option<u32>,
    /// Per-attempt timeout; defaults to `api.request_timeout_ms`.
    pub timeout: Option<Duration>,
}

impl RequestOptions {
    pub fn json(body: Value) -> Self {
        Self {
            body: Some(body),
            ..Self::default()
        }
    }

    pub fn max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

pub struct RequestClient {
    http: reqwest::Client,
    base_url: String,
    auth_token: RwLock<Option<String>>,
    circuits: Arc<CircuitBreakerRegistry>,
    retry: RetryExecutor,
    notifier: Arc<dyn Notifier>,
    default_retry_after: Duration,
    request_timeout: Duration,
}

impl fmt::Debug for RequestClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestClient")
            .field("base_url", &self.base_url)
            .field("retry", &self.retry)
            .field("request_timeout", &self.request_timeout)
            .finish_non_exhaustive()
    }
}

impl RequestClient {
    pub fn new(
        config: &ClientConfig,
        circuits: Arc<CircuitBreakerRegistry>,
        notifier: Arc<dyn Notifier>,
    ) -> std::result::Result<Self, ConfigError> {
        let base_url = config.base_url()?.as_str().trim_end_matches('/').to_string();
        let http = reqwest::Client::builder()
            .user_agent(concat!("brand-audit/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| ConfigError::HttpClient(e.to_string()))?;

        Ok(Self {
            http,
            base_url,
            auth_token: RwLock::new(config.api.auth_token.clone()),
            circuits,
            retry: RetryExecutor::new(config.retry_config()),
            notifier,
            default_retry_after: config.default_retry_after(),
            request_timeout: config.request_timeout(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn set_auth_token(&self, token: Option<String>) {
        *self
            .auth_token
            .write()
            .unwrap_or_else(PoisonError::into_inner) = token;
    }

    fn auth_token(&self) -> Option<String> {
        self.auth_token
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn circuits(&self) -> &Arc<CircuitBreakerRegistry> {
        &self.circuits
    }

    pub fn retry_executor(&self) -> &RetryExecutor {
        &self.retry
    }

    /// Issues `endpoint` and decodes the JSON response into `T`.
    ///
    /// An empty success body decodes as JSON `null`.
    pub async fn request<T: DeserializeOwned>(
        &self,
        endpoint: &Endpoint,
        options: RequestOptions,
    ) -> Result<T> {
        let label = endpoint.to_string();
        let result = self
            .execute(endpoint, &label, &options)
            .await
            .and_then(|body| self.decode(&label, body));

        if let Err(err) = &result {
            tracing::warn!(
                endpoint = %label,
                error_id = %err.error_id,
                kind = %err.kind,
                "request failed: {}",
                err.message
            );
            self.notifier.notify(Notice::from_api_error(err));
        }
        result
    }

    async fn execute(&self, endpoint: &Endpoint, label: &str, options: &RequestOptions) -> Result<Value> {
        if endpoint.path.trim().is_empty() {
            return Err(ApiError::new(ErrorKind::InvalidRequest, label)
                .with_message("Request path must not be empty"));
        }

        let key = endpoint.circuit_key();
        if let Err(open) = self.circuits.admit(&key) {
            tracing::debug!(endpoint = label, circuit = %key, "circuit open, failing fast");
            return Err(ApiError::circuit_open(label, open.retry_after));
        }

        let payload = match &options.body {
            Some(body) => Some(serde_json::to_vec(body).map_err(|e| {
                ApiError::new(ErrorKind::InvalidRequest, label)
                    .with_message(format!("Could not encode request body: {e}"))
            })?),
            None => None,
        };
        let signature = retry::signature(&key, payload.as_deref());
        let correlation_id = Uuid::new_v4().to_string();
        let max_attempts = options
            .max_attempts
            .unwrap_or(self.retry.config().max_attempts);
        let timeout = options.timeout.unwrap_or(self.request_timeout);

        let payload = payload.as_deref();
        let correlation_id = correlation_id.as_str();
        let outcome = self
            .retry
            .run(&signature, max_attempts, move |attempt| {
                self.send_once(endpoint, label, payload, correlation_id, timeout, attempt)
            })
            .await;

        match &outcome {
            Ok(_) => self.circuits.record_success(&key),
            Err(err) => self.circuits.record_failure(&key, &err.kind),
        }
        outcome
    }

    async fn send_once(
        &self,
        endpoint: &Endpoint,
        label: &str,
        payload: Option<&[u8]>,
        correlation_id: &str,
        timeout: Duration,
        attempt: u32,
    ) -> Result<Value> {
        let url = if endpoint.path.starts_with('/') {
            format!("{}{}", self.base_url, endpoint.path)
        } else {
            format!("{}/{}", self.base_url, endpoint.path)
        };

        let mut builder = self
            .http
            .request(endpoint.method.clone(), &url)
            .header(CONTENT_TYPE, "application/json")
            .header(CORRELATION_ID_HEADER, correlation_id)
            .timeout(timeout);
        if let Some(token) = self.auth_token() {
            builder = builder.bearer_auth(token);
        }
        if let Some(body) = payload {
            builder = builder.body(body.to_vec());
        }

        tracing::debug!(endpoint = label, attempt, correlation_id, "sending request");
        let response = builder
            .send()
            .await
            .map_err(|e| classify(&Failure::from_reqwest(&e), label, self.default_retry_after))?;

        if !response.status().is_success() {
            let failure = Failure::from_response(response).await;
            return Err(classify(&failure, label, self.default_retry_after));
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| classify(&Failure::from_reqwest(&e), label, self.default_retry_after))?;
        parse_body(&body).map_err(|e| {
            classify(
                &Failure::Decode {
                    message: e.to_string(),
                },
                label,
                self.default_retry_after,
            )
        })
    }

    /// Converts a parsed body into `T`. A shape mismatch is not retryable.
    fn decode<T: DeserializeOwned>(&self, label: &str, body: Value) -> Result<T> {
        serde_json::from_value(body).map_err(|e| {
            classify(
                &Failure::Schema {
                    message: e.to_string(),
                },
                label,
                self.default_retry_after,
            )
        })
    }
}

/// An empty success body parses as JSON `null`.
fn parse_body(body: &[u8]) -> serde_json::Result<Value> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(Value::Null);
    }
    serde_json::from_slice(body)
}
