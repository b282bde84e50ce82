//! Manager configuration.
//!
//! Loaded from TOML with camelCase keys. Every field has a default, so an empty file is a
//! valid configuration that connects to the bootstrap relays:
//!
//! ```toml
//! publishTimeoutMs = 5000
//!
//! [[relays]]
//! url = "wss://relay.damus.io"
//! isRequired = true
//!
//! [[relays]]
//! url = "wss://nos.lol"
//! supportsWrite = false
//!
//! [circuit]
//! failureThreshold = 3
//! resetTimeoutMs = 30000
//! ```

use crate::DEFAULT_RELAYS;
use crate::circuit::CircuitBreakerConfig;
use crate::descriptor::{RelayDescriptor, normalize_relay_url};
use crate::error::{ClientError, Result};
use crate::performance::PerformanceConfig;
use crate::retry::RetryConfig;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

fn default_connect_timeout_ms() -> u64 {
    10_000
}

fn default_publish_timeout_ms() -> u64 {
    5_000
}

fn default_eose_timeout_ms() -> u64 {
    10_000
}

fn default_fetch_timeout_ms() -> u64 {
    15_000
}

fn default_status_channel_capacity() -> usize {
    256
}

fn default_dedup_capacity() -> usize {
    10_000
}

/// Configuration for [`RelayConnectionManager`](crate::RelayConnectionManager).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManagerConfig {
    /// Relays to register at startup; empty means the bootstrap set
    #[serde(default)]
    pub relays: Vec<RelayDescriptor>,

    #[serde(default)]
    pub circuit: CircuitBreakerConfig,

    #[serde(default)]
    pub retry: RetryConfig,

    #[serde(default)]
    pub performance: PerformanceConfig,

    /// Deadline for opening a relay link
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// Per-relay deadline for an OK after sending an event
    #[serde(default = "default_publish_timeout_ms")]
    pub publish_timeout_ms: u64,

    /// Per-relay deadline for the first EOSE of a subscription
    #[serde(default = "default_eose_timeout_ms")]
    pub eose_timeout_ms: u64,

    /// Overall deadline for a one-shot fetch
    #[serde(default = "default_fetch_timeout_ms")]
    pub fetch_timeout_ms: u64,

    /// Buffered status notifications per subscriber
    #[serde(default = "default_status_channel_capacity")]
    pub status_channel_capacity: usize,

    /// Event ids each subscription remembers for dedup
    #[serde(default = "default_dedup_capacity")]
    pub dedup_capacity: usize,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            relays: Vec::new(),
            circuit: CircuitBreakerConfig::default(),
            retry: RetryConfig::default(),
            performance: PerformanceConfig::default(),
            connect_timeout_ms: default_connect_timeout_ms(),
            publish_timeout_ms: default_publish_timeout_ms(),
            eose_timeout_ms: default_eose_timeout_ms(),
            fetch_timeout_ms: default_fetch_timeout_ms(),
            status_channel_capacity: default_status_channel_capacity(),
            dedup_capacity: default_dedup_capacity(),
        }
    }
}

impl ManagerConfig {
    /// Configuration with an explicit relay list.
    pub fn with_relays(relays: Vec<RelayDescriptor>) -> Self {
        Self {
            relays,
            ..Self::default()
        }
    }

    /// Parse and validate a TOML document.
    pub fn from_toml_str(input: &str) -> Result<Self> {
        let config: Self = toml::from_str(input)?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let contents = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml_str(&contents)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn publish_timeout(&self) -> Duration {
        Duration::from_millis(self.publish_timeout_ms)
    }

    pub fn eose_timeout(&self) -> Duration {
        Duration::from_millis(self.eose_timeout_ms)
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_millis(self.fetch_timeout_ms)
    }

    /// Relays to register, with URLs normalized. Falls back to the bootstrap set.
    pub fn descriptors(&self) -> Result<Vec<RelayDescriptor>> {
        if self.relays.is_empty() {
            return DEFAULT_RELAYS
                .iter()
                .map(|url| RelayDescriptor::new(*url).normalized())
                .collect();
        }
        self.relays
            .iter()
            .cloned()
            .map(RelayDescriptor::normalized)
            .collect()
    }

    /// Reject settings the manager cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.circuit.failure_threshold == 0 {
            return Err(ClientError::Config(
                "circuit.failureThreshold must be at least 1".to_string(),
            ));
        }
        if self.retry.base_delay_ms > self.retry.max_delay_ms {
            return Err(ClientError::Config(format!(
                "retry.baseDelayMs ({}) exceeds retry.maxDelayMs ({})",
                self.retry.base_delay_ms, self.retry.max_delay_ms
            )));
        }

        let perf = &self.performance;
        for (name, value) in [
            ("emaWeight", perf.ema_weight),
            ("successWeight", perf.success_weight),
            ("latencyWeight", perf.latency_weight),
        ] {
            if !value.is_finite() || !(0.0..=1.0).contains(&value) {
                return Err(ClientError::Config(format!(
                    "performance.{name} must be between 0 and 1, got {value}"
                )));
            }
        }
        if perf.success_weight + perf.latency_weight <= 0.0 {
            return Err(ClientError::Config(
                "performance weights must not both be zero".to_string(),
            ));
        }
        if !perf.slow_response_ms.is_finite() || perf.slow_response_ms <= 0.0 {
            return Err(ClientError::Config(
                "performance.slowResponseMs must be positive".to_string(),
            ));
        }
        if !perf.prior.is_finite() || perf.prior < 0.0 {
            return Err(ClientError::Config(
                "performance.prior must not be negative".to_string(),
            ));
        }

        for (name, value) in [
            ("connectTimeoutMs", self.connect_timeout_ms),
            ("publishTimeoutMs", self.publish_timeout_ms),
            ("eoseTimeoutMs", self.eose_timeout_ms),
            ("fetchTimeoutMs", self.fetch_timeout_ms),
        ] {
            if value == 0 {
                return Err(ClientError::Config(format!("{name} must be positive")));
            }
        }
        if self.status_channel_capacity == 0 {
            return Err(ClientError::Config(
                "statusChannelCapacity must be positive".to_string(),
            ));
        }
        if self.dedup_capacity == 0 {
            return Err(ClientError::Config(
                "dedupCapacity must be positive".to_string(),
            ));
        }

        let mut seen = HashSet::new();
        for relay in &self.relays {
            let url = normalize_relay_url(&relay.url)
                .map_err(|e| ClientError::Config(format!("relay {}: {}", relay.url, e)))?;
            if !seen.insert(url.clone()) {
                return Err(ClientError::Config(format!("relay {url} listed twice")));
            }
        }
        Ok(())
    }
}
