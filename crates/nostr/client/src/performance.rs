//! Per-relay performance scoring.
//!
//! Every completed operation updates the relay's counters and recomputes a 0-100 score:
//! - Success rate (with a prior added to both counts) weighted 0.7
//! - Response time, normalized so faster is higher and anything at or beyond
//!   `slow_response_ms` floors at 0, weighted 0.3
//!
//! Average response time is an exponential moving average over successful operations
//! only. Failures move the counts but never the average.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::time::Instant;

/// Response-time component used before any successful sample exists.
const NEUTRAL_LATENCY_COMPONENT: f64 = 0.5;

/// Operation categories tracked separately.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    /// Live subscription
    Read,
    /// Event publish
    Write,
    /// One-shot query
    Fetch,
}

impl OperationKind {
    pub fn name(&self) -> &'static str {
        match self {
            OperationKind::Read => "read",
            OperationKind::Write => "write",
            OperationKind::Fetch => "fetch",
        }
    }
}

/// Scoring parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PerformanceConfig {
    /// Weight of the newest latency sample in the moving average
    pub ema_weight: f64,
    /// Weight of the success-rate component
    pub success_weight: f64,
    /// Weight of the response-time component
    pub latency_weight: f64,
    /// Latency at which the response-time component reaches 0
    pub slow_response_ms: f64,
    /// Pseudo-count added to both successes and failures
    pub prior: f64,
}

impl Default for PerformanceConfig {
    fn default() -> Self {
        Self {
            ema_weight: 0.2,
            success_weight: 0.7,
            latency_weight: 0.3,
            slow_response_ms: 5_000.0,
            prior: 1.0,
        }
    }
}

/// Counters for one operation kind.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OperationStats {
    pub success_count: u64,
    pub failure_count: u64,
    pub total_time_ms: f64,
}

/// Snapshot of one relay's performance.
#[derive(Debug, Clone, PartialEq)]
pub struct PerformanceRecord {
    /// Composite score, 0-100
    pub score: f64,
    /// Moving average over successful operations; `None` until the first success
    pub avg_response_time_ms: Option<f64>,
    pub success_count: u64,
    pub failure_count: u64,
    pub last_updated: Option<Instant>,
    pub operations: BTreeMap<OperationKind, OperationStats>,
}

/// Compute the composite score from raw counts and average latency.
pub fn compute_score(
    config: &PerformanceConfig,
    success_count: u64,
    failure_count: u64,
    avg_response_time_ms: Option<f64>,
) -> f64 {
    let successes = success_count as f64 + config.prior;
    let total = success_count as f64 + failure_count as f64 + 2.0 * config.prior;
    let success_rate = if total > 0.0 { successes / total } else { 0.5 };

    let latency = match avg_response_time_ms {
        Some(avg) if config.slow_response_ms > 0.0 => {
            1.0 - (avg.max(0.0) / config.slow_response_ms).min(1.0)
        }
        Some(_) => 0.0,
        None => NEUTRAL_LATENCY_COMPONENT,
    };

    let weight_sum = config.success_weight + config.latency_weight;
    if weight_sum <= 0.0 {
        return 0.0;
    }
    let raw = (success_rate * config.success_weight + latency * config.latency_weight) / weight_sum;
    (raw * 100.0).clamp(0.0, 100.0)
}

/// Rolling health tracker for a single relay.
#[derive(Debug, Clone)]
pub struct PerformanceTracker {
    config: PerformanceConfig,
    record: PerformanceRecord,
}

impl PerformanceTracker {
    pub fn new(config: PerformanceConfig) -> Self {
        let score = compute_score(&config, 0, 0, None);
        Self {
            config,
            record: PerformanceRecord {
                score,
                avg_response_time_ms: None,
                success_count: 0,
                failure_count: 0,
                last_updated: None,
                operations: BTreeMap::new(),
            },
        }
    }

    pub fn record(&self) -> &PerformanceRecord {
        &self.record
    }

    pub fn score(&self) -> f64 {
        self.record.score
    }

    /// Record one completed operation.
    pub fn record_outcome(
        &mut self,
        operation: OperationKind,
        success: bool,
        elapsed: Duration,
        now: Instant,
    ) {
        let elapsed_ms = elapsed.as_secs_f64() * 1000.0;
        let stats = self.record.operations.entry(operation).or_default();
        stats.total_time_ms += elapsed_ms;

        if success {
            stats.success_count += 1;
            self.record.success_count += 1;
            self.record.avg_response_time_ms = Some(match self.record.avg_response_time_ms {
                Some(avg) => self.config.ema_weight * elapsed_ms + (1.0 - self.config.ema_weight) * avg,
                None => elapsed_ms,
            });
        } else {
            stats.failure_count += 1;
            self.record.failure_count += 1;
        }

        self.record.last_updated = Some(now);
        self.record.score = compute_score(
            &self.config,
            self.record.success_count,
            self.record.failure_count,
            self.record.avg_response_time_ms,
        );
    }
}
