//! Per-relay circuit breaker.
//!
//! Three states:
//! - Closed: relay is eligible for traffic
//! - Open: relay had `failure_threshold` consecutive failures and is excluded until
//!   `reset_timeout` has elapsed since the last failure
//! - HalfOpen: exactly one trial request is in flight
//!
//! The Open -> HalfOpen transition is lazy: it happens when a caller takes the trial slot
//! via [`CircuitBreaker::try_acquire`], never from a background timer. While the trial is
//! in flight every other caller is rejected as if the circuit were open.
//!
//! The breaker is pure state. The caller passes `now` in and serializes access (the
//! manager keeps one breaker per relay behind its own lock).

use crate::error::RelayError;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CircuitState {
    /// Normal operation
    Closed,
    /// Excluded until the reset timeout elapses
    Open,
    /// One trial request in flight
    HalfOpen,
}

impl CircuitState {
    /// Human-readable state name
    pub fn name(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half-open",
        }
    }
}

/// Configuration for circuit breaker behavior
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before the circuit opens
    pub failure_threshold: u32,
    /// Time after the last failure before a trial is permitted
    pub reset_timeout_ms: u64,
}

impl CircuitBreakerConfig {
    pub fn reset_timeout(&self) -> Duration {
        Duration::from_millis(self.reset_timeout_ms)
    }
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            reset_timeout_ms: 30_000,
        }
    }
}

/// Snapshot of one relay's circuit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CircuitRecord {
    pub state: CircuitState,
    /// Consecutive failures since the last success
    pub failure_count: u32,
    pub last_failure_time: Option<Instant>,
    pub last_success_time: Option<Instant>,
}

impl CircuitRecord {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            last_failure_time: None,
            last_success_time: None,
        }
    }

    /// Whether an Open circuit has waited out its timeout and may run a trial.
    pub fn trial_eligible(&self, reset_timeout: Duration, now: Instant) -> bool {
        match (self.state, self.last_failure_time) {
            (CircuitState::Open, Some(last_failure)) => now >= last_failure + reset_timeout,
            (CircuitState::Open, None) => true,
            _ => false,
        }
    }
}

/// How a request was let through the breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Circuit closed
    Normal,
    /// Circuit was open and this request holds the single trial slot
    Trial,
}

/// Circuit breaker for a single relay.
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    url: String,
    config: CircuitBreakerConfig,
    record: CircuitRecord,
}

impl CircuitBreaker {
    pub fn new(url: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            url: url.into(),
            config,
            record: CircuitRecord::new(),
        }
    }

    pub fn record(&self) -> &CircuitRecord {
        &self.record
    }

    pub fn state(&self) -> CircuitState {
        self.record.state
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Whether the circuit is Open and its timeout has elapsed.
    pub fn is_trial_eligible(&self, now: Instant) -> bool {
        self.record.trial_eligible(self.config.reset_timeout(), now)
    }

    /// Take the trial slot if the circuit is Open and eligible. Moves to HalfOpen.
    pub fn attempt_trial(&mut self, now: Instant) -> bool {
        if !self.is_trial_eligible(now) {
            return false;
        }
        info!("Circuit for {} transitioning from open to half-open", self.url);
        self.record.state = CircuitState::HalfOpen;
        true
    }

    /// Ask permission to send one request to the relay.
    pub fn try_acquire(&mut self, now: Instant) -> Result<Admission, RelayError> {
        let state = self.record.state;
        match state {
            CircuitState::Closed => Ok(Admission::Normal),
            CircuitState::Open if self.attempt_trial(now) => Ok(Admission::Trial),
            CircuitState::Open | CircuitState::HalfOpen => {
                Err(RelayError::CircuitOpen(self.url.clone()))
            }
        }
    }

    /// Record a successful request.
    pub fn record_success(&mut self, now: Instant) {
        self.record.last_success_time = Some(now);

        match self.record.state {
            CircuitState::Closed => {
                self.record.failure_count = 0;
            }
            CircuitState::HalfOpen => {
                info!("Circuit for {} closed after successful trial", self.url);
                self.record.state = CircuitState::Closed;
                self.record.failure_count = 0;
            }
            CircuitState::Open => {
                // A request admitted before the circuit opened finished late
                debug!("Late success for {} while circuit open; staying open", self.url);
            }
        }
    }

    /// Record a failed request.
    pub fn record_failure(&mut self, now: Instant) {
        self.record.last_failure_time = Some(now);
        self.record.failure_count = self.record.failure_count.saturating_add(1);

        match self.record.state {
            CircuitState::Closed => {
                if self.record.failure_count >= self.config.failure_threshold {
                    warn!(
                        "Circuit for {} opened after {} consecutive failures",
                        self.url, self.record.failure_count
                    );
                    self.record.state = CircuitState::Open;
                } else {
                    debug!(
                        "Failure {}/{} recorded for {}",
                        self.record.failure_count, self.config.failure_threshold, self.url
                    );
                }
            }
            CircuitState::HalfOpen => {
                warn!("Trial failed for {}; circuit re-opened", self.url);
                self.record.state = CircuitState::Open;
            }
            CircuitState::Open => {
                debug!("Failure recorded for {} while circuit open", self.url);
            }
        }
    }

    /// Give back a trial slot whose request never produced an outcome.
    ///
    /// HalfOpen returns to Open with the failure time untouched, so the next caller is
    /// immediately eligible for a trial again.
    pub fn release_trial(&mut self) {
        if self.record.state == CircuitState::HalfOpen {
            debug!("Trial for {} abandoned; circuit back to open", self.url);
            self.record.state = CircuitState::Open;
        }
    }

    /// Force the circuit closed (use with caution)
    pub fn reset(&mut self) {
        self.record.state = CircuitState::Closed;
        self.record.failure_count = 0;
    }
}
