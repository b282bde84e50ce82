//! Integration tests for the relay connection manager.
//!
//! Relays are simulated in memory by [`MockTransport`]; each URL is scripted to accept,
//! reject, stay silent or refuse connections, and tests can cut a link at any time.

pub mod config;
pub mod publish;
pub mod reconnect;

use async_trait::async_trait;
use nostr_client::{
    Event, EventKind, ManagerConfig, RelayConnectionManager, RelayDescriptor, RelayError,
    RelayLink, RelayTransport, SystemClock,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Once;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

pub fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init();
    });
}

/// How a fake relay reacts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Behavior {
    /// OK true for events, stored events then EOSE for REQs
    Accept,
    /// OK false for events, CLOSED for REQs
    Reject,
    /// Never answers
    Silent,
    /// Connection attempts fail
    Refuse,
}

struct LiveLink {
    to_client: mpsc::WeakUnboundedSender<String>,
    kill: oneshot::Sender<()>,
}

#[derive(Default)]
struct MockState {
    behaviors: HashMap<String, Behavior>,
    stored: HashMap<String, Vec<Event>>,
    received: HashMap<String, Vec<String>>,
    connects: HashMap<String, u32>,
    links: HashMap<String, LiveLink>,
}

/// In-memory relays keyed by URL.
#[derive(Clone, Default)]
pub struct MockTransport {
    state: Arc<Mutex<MockState>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_behavior(&self, url: &str, behavior: Behavior) {
        self.state.lock().behaviors.insert(url.to_string(), behavior);
    }

    /// Events the relay returns for any REQ.
    pub fn store(&self, url: &str, events: Vec<Event>) {
        self.state.lock().stored.insert(url.to_string(), events);
    }

    /// Frames the client sent to this relay, across all links.
    pub fn received(&self, url: &str) -> Vec<String> {
        self.state
            .lock()
            .received
            .get(url)
            .cloned()
            .unwrap_or_default()
    }

    pub fn connect_count(&self, url: &str) -> u32 {
        self.state.lock().connects.get(url).copied().unwrap_or(0)
    }

    /// Cut the live link to this relay.
    pub fn drop_link(&self, url: &str) {
        if let Some(link) = self.state.lock().links.remove(url) {
            let _ = link.kill.send(());
        }
    }

    /// Push a raw frame to the client over the live link.
    pub fn inject(&self, url: &str, frame: String) -> bool {
        let state = self.state.lock();
        state
            .links
            .get(url)
            .and_then(|link| link.to_client.upgrade())
            .is_some_and(|tx| tx.send(frame).is_ok())
    }

    fn behavior(&self, url: &str) -> Behavior {
        self.state
            .lock()
            .behaviors
            .get(url)
            .copied()
            .unwrap_or(Behavior::Accept)
    }

    fn answer(&self, url: &str, frame: &str) -> Vec<String> {
        self.state
            .lock()
            .received
            .entry(url.to_string())
            .or_default()
            .push(frame.to_string());

        let Ok(value) = serde_json::from_str::<serde_json::Value>(frame) else {
            return Vec::new();
        };
        let behavior = self.behavior(url);
        match (value[0].as_str(), behavior) {
            (Some("EVENT"), Behavior::Accept) => {
                vec![format!(r#"["OK","{}",true,""]"#, value[1]["id"].as_str().unwrap_or_default())]
            }
            (Some("EVENT"), Behavior::Reject) => {
                vec![format!(
                    r#"["OK","{}",false,"blocked: not on whitelist"]"#,
                    value[1]["id"].as_str().unwrap_or_default()
                )]
            }
            (Some("REQ"), Behavior::Accept) => {
                let sub = value[1].as_str().unwrap_or_default();
                let mut frames: Vec<String> = self
                    .state
                    .lock()
                    .stored
                    .get(url)
                    .cloned()
                    .unwrap_or_default()
                    .into_iter()
                    .map(|event| event_frame(sub, &event))
                    .collect();
                frames.push(format!(r#"["EOSE","{sub}"]"#));
                frames
            }
            (Some("REQ"), Behavior::Reject) => {
                vec![format!(
                    r#"["CLOSED","{}","restricted: no reads"]"#,
                    value[1].as_str().unwrap_or_default()
                )]
            }
            _ => Vec::new(),
        }
    }
}

#[async_trait]
impl RelayTransport for MockTransport {
    async fn connect(&self, url: &str) -> Result<RelayLink, RelayError> {
        *self
            .state
            .lock()
            .connects
            .entry(url.to_string())
            .or_default() += 1;

        if self.behavior(url) == Behavior::Refuse {
            return Err(RelayError::Connection(format!("{url} refused connection")));
        }

        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();
        let (in_tx, in_rx) = mpsc::unbounded_channel::<String>();
        let (kill_tx, mut kill_rx) = oneshot::channel();

        self.state.lock().links.insert(
            url.to_string(),
            LiveLink {
                to_client: in_tx.downgrade(),
                kill: kill_tx,
            },
        );

        let relay = self.clone();
        let url = url.to_string();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = &mut kill_rx => break,
                    frame = out_rx.recv() => {
                        let Some(frame) = frame else { break };
                        for reply in relay.answer(&url, &frame) {
                            let _ = in_tx.send(reply);
                        }
                    }
                }
            }
        });

        Ok(RelayLink {
            outgoing: out_tx,
            incoming: in_rx,
        })
    }
}

pub fn event_frame(subscription_id: &str, event: &Event) -> String {
    serde_json::json!(["EVENT", subscription_id, event]).to_string()
}

pub fn note(id: &str) -> Event {
    Event {
        id: id.to_string(),
        pubkey: "f".repeat(64),
        created_at: 1_700_000_000,
        kind: EventKind::TextNote,
        tags: vec![],
        content: format!("note {id}"),
        sig: "0".repeat(128),
    }
}

pub fn manager_with(
    transport: &MockTransport,
    urls: &[&str],
    tweak: impl FnOnce(&mut ManagerConfig),
) -> RelayConnectionManager {
    init_tracing();
    let mut config =
        ManagerConfig::with_relays(urls.iter().map(|url| RelayDescriptor::new(*url)).collect());
    tweak(&mut config);
    RelayConnectionManager::with_transport(config, Arc::new(transport.clone()), Arc::new(SystemClock))
        .unwrap()
}

/// Poll `check` until it holds, sleeping between attempts.
pub async fn eventually(mut check: impl FnMut() -> bool) {
    for _ in 0..200 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not met in time");
}
