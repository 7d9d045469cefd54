//! Per-endpoint circuit breakers.
//!
//! ```text
//! Closed   -> Open      failure_count >= threshold (ServerFault / NetworkUnavailable only)
//! Open     -> HalfOpen  first request after next_attempt_at; it becomes the probe
//! HalfOpen -> Closed    probe succeeds, failure_count reset
//! HalfOpen -> Open      probe fails, fresh open window
//! ```
//!
//! Circuits are created lazily on first use and live as long as the
//! registry. Critical sections never span an `.await`.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;
use std::time::Duration;
use std::time::Instant;

use strum_macros::Display;

use crate::error::ErrorKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub open_duration: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            open_duration: Duration::from_secs(60),
        }
    }
}

/// State of one endpoint's circuit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointCircuit {
    pub failure_count: u32,
    pub state: CircuitState,
    /// Set whenever `state == Open`.
    pub next_attempt_at: Option<Instant>,
    probe_in_flight: bool,
}

impl Default for EndpointCircuit {
    fn default() -> Self {
        Self {
            failure_count: 0,
            state: CircuitState::Closed,
            next_attempt_at: None,
            probe_in_flight: false,
        }
    }
}

impl EndpointCircuit {
    fn open(&mut self, now: Instant, open_duration: Duration) {
        self.state = CircuitState::Open;
        self.next_attempt_at = Some(now + open_duration);
        self.probe_in_flight = false;
    }

    fn close(&mut self) {
        self.state = CircuitState::Closed;
        self.failure_count = 0;
        self.next_attempt_at = None;
        self.probe_in_flight = false;
    }
}

/// Granted passage through a circuit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Pass,
    /// The single trial request of a half-open circuit.
    Probe,
}

/// Request rejected without touching the network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("circuit open, retry after {retry_after:?}")]
pub struct CircuitOpen {
    pub retry_after: Duration,
}

#[derive(Debug, Default)]
pub struct CircuitBreakerRegistry {
    config: CircuitBreakerConfig,
    circuits: Mutex<HashMap<String, EndpointCircuit>>,
}

impl CircuitBreakerRegistry {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            circuits: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    fn circuits(&self) -> MutexGuard<'_, HashMap<String, EndpointCircuit>> {
        self.circuits.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Snapshot of the circuit for `key`, if one has been created.
    pub fn circuit(&self, key: &str) -> Option<EndpointCircuit> {
        self.circuits().get(key).cloned()
    }

    pub fn state(&self, key: &str) -> CircuitState {
        self.circuit(key)
            .map(|c| c.state)
            .unwrap_or(CircuitState::Closed)
    }

    pub fn admit(&self, key: &str) -> Result<Admission, CircuitOpen> {
        self.admit_at(key, Instant::now())
    }

    pub fn admit_at(&self, key: &str, now: Instant) -> Result<Admission, CircuitOpen> {
        let mut circuits = self.circuits();
        let circuit = circuits.entry(key.to_string()).or_default();
        match circuit.state {
            CircuitState::Closed => Ok(Admission::Pass),
            CircuitState::Open => {
                let next = circuit.next_attempt_at.unwrap_or(now);
                if now >= next {
                    circuit.state = CircuitState::HalfOpen;
                    circuit.probe_in_flight = true;
                    tracing::info!(endpoint = key, "circuit half-open, admitting probe");
                    Ok(Admission::Probe)
                } else {
                    Err(CircuitOpen {
                        retry_after: next - now,
                    })
                }
            }
            CircuitState::HalfOpen if circuit.probe_in_flight => Err(CircuitOpen {
                retry_after: Duration::ZERO,
            }),
            CircuitState::HalfOpen => {
                circuit.probe_in_flight = true;
                Ok(Admission::Probe)
            }
        }
    }

    pub fn record_success(&self, key: &str) {
        let mut circuits = self.circuits();
        let circuit = circuits.entry(key.to_string()).or_default();
        match circuit.state {
            CircuitState::Closed => circuit.failure_count = 0,
            CircuitState::HalfOpen => {
                tracing::info!(endpoint = key, "probe succeeded, circuit closed");
                circuit.close();
            }
            // Started before the circuit opened; too old to say anything.
            CircuitState::Open => {}
        }
    }

    pub fn record_failure(&self, key: &str, kind: &ErrorKind) {
        self.record_failure_at(key, kind, Instant::now());
    }

    pub fn record_failure_at(&self, key: &str, kind: &ErrorKind, now: Instant) {
        let open_duration = self.config.open_duration;
        let threshold = self.config.failure_threshold;
        let mut circuits = self.circuits();
        let circuit = circuits.entry(key.to_string()).or_default();

        if !kind.is_endpoint_health_failure() {
            // Request-specific failure: free the probe slot, leave state alone.
            circuit.probe_in_flight = false;
            return;
        }

        circuit.failure_count = circuit.failure_count.saturating_add(1);
        match circuit.state {
            CircuitState::Closed if circuit.failure_count >= threshold => {
                tracing::warn!(
                    endpoint = key,
                    failures = circuit.failure_count,
                    open_secs = open_duration.as_secs(),
                    "circuit opened"
                );
                circuit.open(now, open_duration);
            }
            CircuitState::Closed | CircuitState::Open => {}
            CircuitState::HalfOpen => {
                tracing::warn!(endpoint = key, "probe failed, circuit re-opened");
                circuit.open(now, open_duration);
            }
        }
    }
}
