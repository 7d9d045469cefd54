//! Bounded retry with exponential backoff and jitter.
//!
//! The delay before retry `n` (0-based) is
//! `min(base * 2^n + jitter, max_delay)` with `jitter` drawn from
//! `[0, jitter)`. A rate-limit hint from the failure raises that delay to
//! at least the hinted wait. Non-retryable failures return immediately
//! without sleeping, and the final failure is surfaced unchanged.

use std::collections::HashMap;
use std::fmt::Display;
use std::future::Future;
use std::sync::Mutex;
use std::sync::PoisonError;
use std::time::Duration;

use rand::Rng;
use sha2::Digest;
use sha2::Sha256;

use crate::classifier::RetryClassifiable;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Upper bound (exclusive) of the random jitter added to each delay.
    pub jitter: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(10_000),
            jitter: Duration::from_millis(1000),
        }
    }
}

/// Reported before each backoff sleep.
#[derive(Debug, Clone)]
pub struct RetryStatus {
    /// The attempt that just failed (0-based).
    pub attempt: u32,
    pub delay: Duration,
    pub reason: String,
    pub is_rate_limit: bool,
}

/// Backoff for `attempt` with an explicit jitter sample.
pub fn backoff_delay(config: &RetryConfig, attempt: u32, jitter: Duration) -> Duration {
    let factor = 2u32.saturating_pow(attempt);
    config
        .base_delay
        .saturating_mul(factor)
        .saturating_add(jitter)
        .min(config.max_delay)
}

fn sample_jitter(max: Duration) -> Duration {
    let max_ms = max.as_millis() as u64;
    if max_ms == 0 {
        return Duration::ZERO;
    }
    Duration::from_millis(rand::rng().random_range(0..max_ms))
}

/// Stable key for the observability counter: endpoint plus a hash of the
/// request payload.
pub fn signature(endpoint: &str, payload: Option<&[u8]>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(payload.unwrap_or_default());
    let digest = format!("{:x}", hasher.finalize());
    format!("{endpoint}#{}", &digest[..16])
}

/// Stateless across calls apart from a best-effort attempt counter.
#[derive(Debug, Default)]
pub struct RetryExecutor {
    config: RetryConfig,
    attempts: Mutex<HashMap<String, u64>>,
}

impl RetryExecutor {
    pub fn new(config: RetryConfig) -> Self {
        Self {
            config,
            attempts: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Total attempts made so far for `signature` across all calls.
    pub fn attempts_for(&self, signature: &str) -> u64 {
        self.attempts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(signature)
            .copied()
            .unwrap_or(0)
    }

    fn count_attempt(&self, signature: &str) {
        let mut attempts = self.attempts.lock().unwrap_or_else(PoisonError::into_inner);
        *attempts.entry(signature.to_string()).or_insert(0) += 1;
    }

    /// Delay to wait after `attempt` failed with the given backoff hint.
    pub fn delay_for(&self, attempt: u32, hint: Option<Duration>) -> Duration {
        let delay = backoff_delay(&self.config, attempt, sample_jitter(self.config.jitter));
        match hint {
            Some(floor) => delay.max(floor),
            None => delay,
        }
    }

    /// Runs `operation` up to `max_attempts` times. The operation receives
    /// the 0-based attempt number.
    pub async fn run<F, Fut, T, E>(&self, signature: &str, max_attempts: u32, operation: F) -> Result<T, E>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: RetryClassifiable + Display,
    {
        self.run_with_status(signature, max_attempts, operation, |_| {})
            .await
    }

    /// Like [`RetryExecutor::run`], reporting each scheduled retry to `status_cb`.
    pub async fn run_with_status<F, Fut, T, E, S>(
        &self,
        signature: &str,
        max_attempts: u32,
        mut operation: F,
        mut status_cb: S,
    ) -> Result<T, E>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: RetryClassifiable + Display,
        S: FnMut(RetryStatus),
    {
        let max_attempts = max_attempts.max(1);
        let mut attempt: u32 = 0;

        loop {
            self.count_attempt(signature);
            let err = match operation(attempt).await {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };

            if !err.is_retryable() {
                tracing::debug!(signature, attempt, error = %err, "not retrying permanent error");
                return Err(err);
            }
            if attempt + 1 >= max_attempts {
                tracing::warn!(signature, attempts = attempt + 1, error = %err, "retries exhausted");
                return Err(err);
            }

            let hint = err.suggested_backoff();
            let delay = self.delay_for(attempt, hint);
            let status = RetryStatus {
                attempt,
                delay,
                reason: err.to_string(),
                is_rate_limit: hint.is_some(),
            };
            tracing::info!(
                signature,
                attempt,
                delay_ms = delay.as_millis() as u64,
                rate_limited = status.is_rate_limit,
                "retrying after transient error: {}",
                status.reason
            );
            status_cb(status);

            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }
}
