//! Event and filter types carried by the relay client.
//!
//! Events arrive already signed; this crate never interprets content or verifies
//! signatures. It only needs the identity (`id`) for deduplication and the kind for
//! filtering.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Event kinds the client knows by name.
///
/// Anything else round-trips through [`EventKind::Other`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "u16", into = "u16")]
pub enum EventKind {
    /// Kind 0: user metadata
    Metadata,
    /// Kind 1: short text note
    TextNote,
    /// Kind 3: follow list
    Contacts,
    /// Kind 4: encrypted direct message
    EncryptedDirectMessage,
    /// Kind 5: deletion request
    Deletion,
    /// Kind 6: repost
    Repost,
    /// Kind 7: reaction
    Reaction,
    /// Kind 9734: zap request
    ZapRequest,
    /// Kind 9735: zap receipt
    ZapReceipt,
    /// Kind 10002: relay list metadata
    RelayList,
    /// Kind 30023: long-form article
    LongForm,
    /// Any other kind
    Other(u16),
}

impl EventKind {
    /// Numeric kind as sent on the wire.
    pub fn as_u16(self) -> u16 {
        match self {
            EventKind::Metadata => 0,
            EventKind::TextNote => 1,
            EventKind::Contacts => 3,
            EventKind::EncryptedDirectMessage => 4,
            EventKind::Deletion => 5,
            EventKind::Repost => 6,
            EventKind::Reaction => 7,
            EventKind::ZapRequest => 9734,
            EventKind::ZapReceipt => 9735,
            EventKind::RelayList => 10002,
            EventKind::LongForm => 30023,
            EventKind::Other(kind) => kind,
        }
    }
}

impl From<u16> for EventKind {
    fn from(kind: u16) -> Self {
        match kind {
            0 => EventKind::Metadata,
            1 => EventKind::TextNote,
            3 => EventKind::Contacts,
            4 => EventKind::EncryptedDirectMessage,
            5 => EventKind::Deletion,
            6 => EventKind::Repost,
            7 => EventKind::Reaction,
            9734 => EventKind::ZapRequest,
            9735 => EventKind::ZapReceipt,
            10002 => EventKind::RelayList,
            30023 => EventKind::LongForm,
            other => EventKind::Other(other),
        }
    }
}

impl From<EventKind> for u16 {
    fn from(kind: EventKind) -> Self {
        kind.as_u16()
    }
}

/// A signed Nostr event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    /// Hex-encoded event id (sha256 of the serialized event)
    pub id: String,
    /// Hex-encoded author public key
    pub pubkey: String,
    /// Unix timestamp in seconds
    pub created_at: u64,
    /// Event kind
    pub kind: EventKind,
    /// Tags
    #[serde(default)]
    pub tags: Vec<Vec<String>>,
    /// Content
    #[serde(default)]
    pub content: String,
    /// Hex-encoded schnorr signature
    pub sig: String,
}

/// Filter for subscription requests.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Filter {
    /// Event IDs
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ids: Option<Vec<String>>,

    /// Authors (pubkeys)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub authors: Option<Vec<String>>,

    /// Event kinds
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kinds: Option<Vec<EventKind>>,

    /// Events since timestamp
    #[serde(skip_serializing_if = "Option::is_none")]
    pub since: Option<u64>,

    /// Events until timestamp
    #[serde(skip_serializing_if = "Option::is_none")]
    pub until: Option<u64>,

    /// Maximum number of events
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<u64>,

    /// Generic tag queries keyed by `#<letter>`
    #[serde(flatten, skip_serializing_if = "HashMap::is_empty")]
    pub tags: HashMap<String, Vec<String>>,
}

impl Filter {
    /// Create a new empty filter.
    pub fn new() -> Self {
        Self::default()
    }

    /// Filter by event IDs.
    pub fn ids(mut self, ids: Vec<String>) -> Self {
        self.ids = Some(ids);
        self
    }

    /// Filter by authors.
    pub fn authors(mut self, authors: Vec<String>) -> Self {
        self.authors = Some(authors);
        self
    }

    /// Filter by kinds.
    pub fn kinds(mut self, kinds: Vec<EventKind>) -> Self {
        self.kinds = Some(kinds);
        self
    }

    /// Filter by events since timestamp.
    pub fn since(mut self, timestamp: u64) -> Self {
        self.since = Some(timestamp);
        self
    }

    /// Filter by events until timestamp.
    pub fn until(mut self, timestamp: u64) -> Self {
        self.until = Some(timestamp);
        self
    }

    /// Limit number of results.
    pub fn limit(mut self, n: u64) -> Self {
        self.limit = Some(n);
        self
    }

    /// Add a tag filter. The key is the tag letter (e.g. "e", "p").
    pub fn tag(mut self, key: impl Into<String>, values: Vec<String>) -> Self {
        self.tags.insert(format!("#{}", key.into()), values);
        self
    }

    /// Filter by #e (event reference) tags.
    pub fn event_refs(self, event_ids: Vec<String>) -> Self {
        self.tag("e", event_ids)
    }

    /// Filter by #p (pubkey reference) tags.
    pub fn pubkey_refs(self, pubkeys: Vec<String>) -> Self {
        self.tag("p", pubkeys)
    }
}
