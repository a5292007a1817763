//! Per-context circuit breaker.
//!
//! ```text
//! CLOSED --(failures >= threshold)--> OPEN --(reset timeout elapsed)--> HALF_OPEN
//!    ^                                  ^                                  |
//!    |                                  +------------(failure)-------------+
//!    +------------------------------(success)------------------------------+
//! ```
//!
//! The OPEN -> HALF_OPEN transition is evaluated lazily when [`CircuitBreaker::is_open`]
//! is called; there is no background timer.

use std::{collections::HashMap, time::Duration};

use parking_lot::Mutex;
use tokio::time::Instant;

pub const FAILURE_THRESHOLD: u32 = 5;
pub const RESET_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone)]
pub struct CircuitStatus {
    pub failures: u32,
    pub last_failure_time: Option<Instant>,
    pub state: CircuitState,
}

impl Default for CircuitStatus {
    fn default() -> Self {
        Self {
            failures: 0,
            last_failure_time: None,
            state: CircuitState::Closed,
        }
    }
}

pub struct CircuitBreaker {
    circuits: Mutex<HashMap<String, CircuitStatus>>,
    failure_threshold: u32,
    reset_timeout: Duration,
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(FAILURE_THRESHOLD, RESET_TIMEOUT)
    }
}

impl CircuitBreaker {
    pub fn new(failure_threshold: u32, reset_timeout: Duration) -> Self {
        Self {
            circuits: Mutex::new(HashMap::new()),
            failure_threshold,
            reset_timeout,
        }
    }

    /// Whether operations for `context` should be skipped right now.
    pub fn is_open(&self, context: &str) -> bool {
        let mut circuits = self.circuits.lock();
        let Some(status) = circuits.get_mut(context) else {
            return false;
        };

        if status.state == CircuitState::Open {
            let elapsed = status
                .last_failure_time
                .map(|t| t.elapsed() >= self.reset_timeout)
                .unwrap_or(true);
            if elapsed {
                tracing::info!(context, "circuit half-open");
                status.state = CircuitState::HalfOpen;
            }
        }

        status.state == CircuitState::Open
    }

    pub fn record_error(&self, context: &str) {
        let mut circuits = self.circuits.lock();
        let status = circuits.entry(context.to_owned()).or_default();

        status.failures += 1;
        status.last_failure_time = Some(Instant::now());

        let trip = status.state == CircuitState::HalfOpen
            || status.failures >= self.failure_threshold;
        if trip && status.state != CircuitState::Open {
            tracing::warn!(context, failures = status.failures, "circuit opened");
            status.state = CircuitState::Open;
        }
    }

    pub fn record_success(&self, context: &str) {
        let mut circuits = self.circuits.lock();
        if let Some(status) = circuits.get_mut(context) {
            if status.state != CircuitState::Closed {
                tracing::info!(context, "circuit closed");
            }
            *status = CircuitStatus::default();
        }
    }

    pub fn status(&self, context: &str) -> CircuitStatus {
        self.circuits
            .lock()
            .get(context)
            .cloned()
            .unwrap_or_default()
    }

    pub fn reset(&self, context: &str) {
        self.circuits.lock().remove(context);
    }
}
