//! Client error types

use std::collections::BTreeMap;
use std::time::Duration;
use thiserror::Error;

/// Failure of a single relay's portion of an operation.
///
/// These are absorbed into the relay's circuit breaker and performance record and only
/// reach the caller inside an outcome map or [`ClientError::AllRelaysFailed`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RelayError {
    /// Transport-level failure opening or using the relay link
    #[error("Connection error: {0}")]
    Connection(String),

    /// Malformed or unexpected relay message
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Relay excluded from this attempt because its circuit is open
    #[error("Circuit breaker open for relay: {0}")]
    CircuitOpen(String),

    /// The relay did not answer within the per-operation deadline
    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    /// The relay answered but refused the event
    #[error("Rejected by relay: {0}")]
    Rejected(String),
}

impl RelayError {
    /// Whether this failure is a per-operation timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(self, RelayError::Timeout(_))
    }
}

/// Client error type
#[derive(Error, Debug)]
pub enum ClientError {
    /// Invalid relay URL
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    /// URL parse error
    #[error("URL parse error: {0}")]
    UrlParse(#[from] url::ParseError),

    /// Relay is already registered
    #[error("Relay already registered: {0}")]
    RelayExists(String),

    /// Relay is not registered
    #[error("Unknown relay: {0}")]
    UnknownRelay(String),

    /// No relay satisfies the selection constraints, even after relaxation
    #[error("No relay satisfies the selection constraints")]
    SelectionExhausted,

    /// Every selected relay failed; carries each relay's failure
    #[error("All {} selected relays failed", .0.len())]
    AllRelaysFailed(BTreeMap<String, RelayError>),

    /// Single relay failure surfaced directly (e.g. explicit connect)
    #[error(transparent)]
    Relay(#[from] RelayError),

    /// Invalid configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// TOML parse error
    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The manager has been shut down
    #[error("Relay manager is shut down")]
    ManagerClosed,
}

/// Client result type
pub type Result<T> = std::result::Result<T, ClientError>;
