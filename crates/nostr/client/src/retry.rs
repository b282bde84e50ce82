//! Reconnect backoff for a single relay.
//!
//! Delays double from `base_delay_ms` and are capped at `max_delay_ms`. The retry counter
//! is incremented before the delay is computed, so with the defaults the waits are
//! 2s, 4s, 8s and the fourth request is refused.

use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tokio::task::AbortHandle;
use tracing::debug;

/// Backoff parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 1_000,
            max_delay_ms: 8_000,
        }
    }
}

/// Handle to one armed retry timer.
#[derive(Debug)]
pub struct RetryHandle {
    delay: Duration,
    abort: AbortHandle,
}

impl RetryHandle {
    pub fn delay(&self) -> Duration {
        self.delay
    }

    /// Stop the timer. No-op if it already fired.
    pub fn cancel(&self) {
        self.abort.abort();
    }
}

/// Schedules reconnect attempts for one relay. At most one timer is pending at a time.
#[derive(Debug)]
pub struct RetryScheduler {
    config: RetryConfig,
    current_retry: u32,
    pending: Option<AbortHandle>,
}

impl RetryScheduler {
    pub fn new(config: RetryConfig) -> Self {
        Self {
            config,
            current_retry: 0,
            pending: None,
        }
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Number of retries scheduled since the last reset.
    pub fn current_retry(&self) -> u32 {
        self.current_retry
    }

    pub fn can_retry(&self) -> bool {
        self.current_retry < self.config.max_retries
    }

    /// Delay for retry number `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u64.checked_shl(attempt).unwrap_or(u64::MAX);
        let delay = self.config.base_delay_ms.saturating_mul(factor);
        Duration::from_millis(delay.min(self.config.max_delay_ms))
    }

    /// Whether a timer is armed and has not fired yet.
    pub fn has_pending(&self) -> bool {
        self.pending.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Arm a timer that runs `callback` after the next backoff delay.
    ///
    /// Returns `None` when retries are exhausted. Replaces any timer that
    /// is still pending. Must be called from within a tokio runtime.
    pub fn schedule_retry<F, Fut>(&mut self, callback: F) -> Option<RetryHandle>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        if !self.can_retry() {
            debug!("Retries exhausted after {} attempts", self.current_retry);
            return None;
        }

        self.cancel_pending();
        self.current_retry += 1;
        let delay = self.delay_for(self.current_retry);

        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            // Detached: the callback may reset this scheduler, which aborts the timer task
            tokio::spawn(callback());
        });
        self.pending = Some(handle.abort_handle());
        Some(RetryHandle {
            delay,
            abort: handle.abort_handle(),
        })
    }

    /// Cancel the pending timer, if any. The counter is untouched.
    pub fn cancel_pending(&mut self) {
        if let Some(handle) = self.pending.take() {
            handle.abort();
        }
    }

    /// Cancel the pending timer and zero the counter.
    pub fn reset_retry(&mut self) {
        self.cancel_pending();
        self.current_retry = 0;
    }
}

impl Drop for RetryScheduler {
    fn drop(&mut self) {
        self.cancel_pending();
    }
}
