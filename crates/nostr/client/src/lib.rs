//! Health-routed Nostr relay client.
//!
//! This crate provides:
//! - Per-relay circuit breaking and performance scoring
//! - Deterministic relay selection with required relays and filter relaxation
//! - Exponential reconnect backoff
//! - Publish fan-out with per-relay deadlines and outcome maps
//! - Merged, deduplicated subscription streams
//!
//! # Example
//!
//! ```rust,no_run
//! use futures::StreamExt;
//! use nostr_client::{
//!     Filter, EventKind, ManagerConfig, RelayConnectionManager, SelectionRequest,
//!     SubscriptionEvent,
//! };
//!
//! #[tokio::main]
//! async fn main() -> nostr_client::Result<()> {
//!     // Empty config registers the default relays
//!     let manager = RelayConnectionManager::new(ManagerConfig::default())?;
//!     manager.connect_all().await?;
//!
//!     let filter = Filter::new().kinds(vec![EventKind::TextNote]).limit(10);
//!     let mut notes = manager
//!         .subscribe(vec![filter], SelectionRequest::read(2).min_score(40.0))
//!         .await?;
//!
//!     while let Some(item) = notes.next().await {
//!         match item {
//!             SubscriptionEvent::Event { relay_url, event } => {
//!                 println!("{} from {}", event.id, relay_url);
//!             }
//!             SubscriptionEvent::AllEose => break,
//!             _ => {}
//!         }
//!     }
//!
//!     manager.shutdown();
//!     Ok(())
//! }
//! ```

pub mod circuit;
pub mod clock;
pub mod config;
pub mod connection;
pub mod descriptor;
pub mod error;
pub mod event;
pub mod manager;
pub mod message;
pub mod performance;
pub mod retry;
pub mod selector;
pub mod subscription;
pub mod transport;

// Re-export main types
pub use circuit::{Admission, CircuitBreaker, CircuitBreakerConfig, CircuitRecord, CircuitState};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::ManagerConfig;
pub use connection::{ConnectionState, PublishConfirmation, RelayConnection, RelayStatus};
pub use descriptor::{RelayDescriptor, normalize_relay_url};
pub use error::{ClientError, RelayError, Result};
pub use event::{Event, EventKind, Filter};
pub use manager::{PublishOutcome, PublishReport, RelayConnectionManager, RelayHealth};
pub use message::{ClientMessage, MessageError, RelayMessage};
pub use performance::{
    OperationKind, OperationStats, PerformanceConfig, PerformanceRecord, PerformanceTracker,
    compute_score,
};
pub use retry::{RetryConfig, RetryHandle, RetryScheduler};
pub use selector::{Operation, RelayCandidate, SelectionRequest, select};
pub use subscription::{EoseTracker, EventStream, SubscriptionEvent, generate_subscription_id};
pub use transport::{RelayLink, RelayTransport, WebSocketTransport};

/// Bootstrap relays used when no relays are configured.
pub const DEFAULT_RELAYS: &[&str] = &[
    "wss://relay.damus.io",
    "wss://nos.lol",
    "wss://relay.nostr.band",
    "wss://relay.snort.social",
];
