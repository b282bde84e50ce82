//! Static description of a configured relay.

use crate::error::{ClientError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use url::Url;

/// A relay as configured by the user.
///
/// Immutable once registered with the manager. `url` is the unique key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayDescriptor {
    /// Relay WebSocket URL
    pub url: String,

    /// Relay may be used for reads
    #[serde(default = "default_true")]
    pub supports_read: bool,

    /// Relay may be used for writes
    #[serde(default = "default_true")]
    pub supports_write: bool,

    /// NIPs the relay advertises
    #[serde(default)]
    pub supported_nips: BTreeSet<u16>,

    /// Never dropped from a selection on score grounds
    #[serde(default)]
    pub is_required: bool,
}

fn default_true() -> bool {
    true
}

impl RelayDescriptor {
    /// Read/write relay with no advertised NIPs.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            supports_read: true,
            supports_write: true,
            supported_nips: BTreeSet::new(),
            is_required: false,
        }
    }

    /// Read-only relay.
    pub fn read_only(mut self) -> Self {
        self.supports_read = true;
        self.supports_write = false;
        self
    }

    /// Write-only relay.
    pub fn write_only(mut self) -> Self {
        self.supports_read = false;
        self.supports_write = true;
        self
    }

    /// Set the advertised NIPs.
    pub fn nips(mut self, nips: impl IntoIterator<Item = u16>) -> Self {
        self.supported_nips = nips.into_iter().collect();
        self
    }

    /// Mark the relay as required.
    pub fn required(mut self) -> Self {
        self.is_required = true;
        self
    }

    /// Validate and normalize the URL in place.
    pub fn normalized(mut self) -> Result<Self> {
        self.url = normalize_relay_url(&self.url)?;
        Ok(self)
    }
}

/// Validate a relay URL and return its canonical spelling.
///
/// Only `ws://` and `wss://` are accepted; scheme and host are lowercased and a trailing
/// slash on an empty path is removed.
pub fn normalize_relay_url(raw: &str) -> Result<String> {
    let url = Url::parse(raw.trim())?;

    if url.scheme() != "ws" && url.scheme() != "wss" {
        return Err(ClientError::InvalidUrl(format!(
            "URL must use ws:// or wss:// scheme, got: {}",
            url.scheme()
        )));
    }
    if url.host_str().is_none_or(str::is_empty) {
        return Err(ClientError::InvalidUrl(format!("missing host: {raw}")));
    }

    let mut normalized = url.to_string();
    if url.path() == "/" && url.query().is_none() && url.fragment().is_none() {
        normalized.pop();
    }
    Ok(normalized)
}
