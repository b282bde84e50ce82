//! Per-relay connection actor.
//!
//! One `RelayConnection` lives for as long as its relay is registered. Each successful
//! connect attaches a fresh [`RelayLink`] and spawns a receive loop that routes relay frames:
//! - OK to the publish call waiting on that event id
//! - EVENT, EOSE and CLOSED to the subscription route with that id
//! - NOTICE and AUTH are logged
//!
//! Subscription routes survive a lost link and are re-sent on the next connect.

use crate::error::RelayError;
use crate::event::{Event, Filter};
use crate::message::{ClientMessage, RelayMessage};
use crate::transport::{RelayLink, RelayTransport};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};

/// Connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// Connect in progress
    Connecting,
    /// Link established
    Open,
    /// Not connected; never connected or closed on purpose
    Closed,
    /// Link lost or connect failed
    Failed,
}

impl ConnectionState {
    pub fn name(&self) -> &'static str {
        match self {
            ConnectionState::Connecting => "connecting",
            ConnectionState::Open => "open",
            ConnectionState::Closed => "closed",
            ConnectionState::Failed => "failed",
        }
    }
}

/// Relay status change notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayStatus {
    pub url: String,
    pub state: ConnectionState,
}

/// Confirmation result for event publishing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishConfirmation {
    /// Event ID that was published
    pub event_id: String,
    /// Whether the relay accepted the event
    pub accepted: bool,
    /// Message from the relay
    pub message: String,
}

impl PublishConfirmation {
    /// Accepted, or rejected only because the relay already has the event.
    pub fn is_stored(&self) -> bool {
        self.accepted || self.message.starts_with("duplicate:")
    }
}

/// What a subscription route delivers, tagged with the relay URL by the receiver side.
#[derive(Debug, Clone)]
pub enum RouteMessage {
    Event(Event),
    Eose,
    Closed(String),
    /// The link dropped; the route stays registered for the next connect
    Lost,
}

pub(crate) type RouteSender = mpsc::UnboundedSender<(String, RouteMessage)>;

/// Fired once with the relay's first answer to a REQ.
pub(crate) type FirstResponse = oneshot::Sender<Result<(), RelayError>>;

struct SubscriptionRoute {
    filters: Vec<Filter>,
    tx: RouteSender,
    first_response: Option<FirstResponse>,
}

impl SubscriptionRoute {
    fn resolve(&mut self, result: Result<(), RelayError>) {
        if let Some(tx) = self.first_response.take() {
            let _ = tx.send(result);
        }
    }
}

/// Publish calls waiting on an OK, by event id. Each waiter carries its own token.
type PendingMap = Arc<Mutex<HashMap<String, Vec<(u64, oneshot::Sender<PublishConfirmation>)>>>>;
type RouteMap = Arc<Mutex<HashMap<String, SubscriptionRoute>>>;

/// Removes this call's waiter when the publish call ends, however it ends.
struct PendingGuard {
    pending: PendingMap,
    event_id: String,
    token: u64,
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        let mut pending = self.pending.lock();
        if let Some(waiters) = pending.get_mut(&self.event_id) {
            waiters.retain(|(token, _)| *token != self.token);
            if waiters.is_empty() {
                pending.remove(&self.event_id);
            }
        }
    }
}

/// Live connection to one relay.
pub struct RelayConnection {
    url: String,
    state: RwLock<ConnectionState>,
    outgoing: Mutex<Option<mpsc::UnboundedSender<String>>>,
    pending_confirmations: PendingMap,
    next_waiter: AtomicU64,
    routes: RouteMap,
    recv_task: Mutex<Option<AbortHandle>>,
    status_tx: broadcast::Sender<RelayStatus>,
}

impl RelayConnection {
    pub fn new(url: impl Into<String>, status_tx: broadcast::Sender<RelayStatus>) -> Self {
        Self {
            url: url.into(),
            state: RwLock::new(ConnectionState::Closed),
            outgoing: Mutex::new(None),
            pending_confirmations: Arc::new(Mutex::new(HashMap::new())),
            next_waiter: AtomicU64::new(0),
            routes: Arc::new(Mutex::new(HashMap::new())),
            recv_task: Mutex::new(None),
            status_tx,
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.read()
    }

    pub fn is_open(&self) -> bool {
        self.state() == ConnectionState::Open
    }

    fn set_state(&self, new_state: ConnectionState) {
        let old = std::mem::replace(&mut *self.state.write(), new_state);
        if old != new_state {
            debug!(
                "Relay {} state {} -> {}",
                self.url,
                old.name(),
                new_state.name()
            );
            // Nobody listening is fine
            let _ = self.status_tx.send(RelayStatus {
                url: self.url.clone(),
                state: new_state,
            });
        }
    }

    /// Open a link and start the receive loop.
    ///
    /// The returned receiver fires when the link is lost. It is dropped without firing when
    /// the connection is closed on purpose.
    pub async fn connect(
        &self,
        transport: &dyn RelayTransport,
        connect_timeout: Duration,
    ) -> Result<oneshot::Receiver<()>, RelayError> {
        self.detach();
        self.set_state(ConnectionState::Connecting);

        let link = match tokio::time::timeout(connect_timeout, transport.connect(&self.url)).await
        {
            Ok(Ok(link)) => link,
            Ok(Err(e)) => {
                warn!("Failed to connect to {}: {}", self.url, e);
                self.set_state(ConnectionState::Failed);
                return Err(e);
            }
            Err(_) => {
                warn!("Connection to {} timed out after {:?}", self.url, connect_timeout);
                self.set_state(ConnectionState::Failed);
                return Err(RelayError::Timeout(connect_timeout));
            }
        };

        let lost = self.attach(link);
        self.set_state(ConnectionState::Open);
        info!("Connected to relay: {}", self.url);
        self.resubscribe();
        Ok(lost)
    }

    fn attach(&self, link: RelayLink) -> oneshot::Receiver<()> {
        let RelayLink {
            outgoing,
            mut incoming,
        } = link;
        *self.outgoing.lock() = Some(outgoing);

        let (lost_tx, lost_rx) = oneshot::channel();
        let url = self.url.clone();
        let pending = Arc::clone(&self.pending_confirmations);
        let routes = Arc::clone(&self.routes);

        let handle = tokio::spawn(async move {
            while let Some(text) = incoming.recv().await {
                handle_frame(&url, &text, &pending, &routes);
            }

            debug!("Link to {} ended", url);
            // Waiting publishers see their sender dropped
            pending.lock().clear();
            for route in routes.lock().values_mut() {
                route.resolve(Err(RelayError::Connection("connection lost".to_string())));
                let _ = route.tx.send((url.clone(), RouteMessage::Lost));
            }
            let _ = lost_tx.send(());
        });
        *self.recv_task.lock() = Some(handle.abort_handle());
        lost_rx
    }

    /// Stop the receive loop and drop the outgoing side without signalling a loss.
    fn detach(&self) {
        if let Some(handle) = self.recv_task.lock().take() {
            handle.abort();
        }
        self.outgoing.lock().take();
        self.pending_confirmations.lock().clear();
    }

    /// Record a link loss detected by the owner.
    pub fn mark_failed(&self) {
        self.outgoing.lock().take();
        self.set_state(ConnectionState::Failed);
    }

    /// Close the link on purpose. Routes are dropped too.
    pub fn close(&self) {
        if self.state() == ConnectionState::Open {
            info!("Disconnecting from relay: {}", self.url);
        }
        self.detach();
        for (_, mut route) in self.routes.lock().drain() {
            route.resolve(Err(RelayError::Connection("connection closed".to_string())));
        }
        self.set_state(ConnectionState::Closed);
    }

    fn send(&self, message: &ClientMessage) -> Result<(), RelayError> {
        let text = message.to_json()?;
        let outgoing = self.outgoing.lock();
        let Some(tx) = outgoing.as_ref() else {
            return Err(RelayError::Connection(format!("not connected to {}", self.url)));
        };
        debug!("Sending to {}: {}", self.url, text);
        tx.send(text)
            .map_err(|_| RelayError::Connection(format!("link to {} closed", self.url)))
    }

    /// Send an event and wait for the relay's OK.
    ///
    /// Callers bound the wait themselves; dropping the future discards its waiter. Concurrent
    /// publishes of the same event all receive the relay's OK.
    pub async fn publish(&self, event: &Event) -> Result<PublishConfirmation, RelayError> {
        let (tx, rx) = oneshot::channel();
        let token = self.next_waiter.fetch_add(1, Ordering::Relaxed);
        self.pending_confirmations
            .lock()
            .entry(event.id.clone())
            .or_default()
            .push((token, tx));
        let _guard = PendingGuard {
            pending: Arc::clone(&self.pending_confirmations),
            event_id: event.id.clone(),
            token,
        };

        self.send(&ClientMessage::Event(event.clone()))?;

        rx.await.map_err(|_| {
            RelayError::Connection(format!("connection to {} lost awaiting OK", self.url))
        })
    }

    /// Register a subscription route and send its REQ.
    ///
    /// Nothing is registered when the receiving side is already gone.
    pub(crate) fn subscribe(
        &self,
        subscription_id: &str,
        filters: Vec<Filter>,
        tx: RouteSender,
        first_response: Option<FirstResponse>,
    ) -> Result<(), RelayError> {
        let req = ClientMessage::Req {
            subscription_id: subscription_id.to_string(),
            filters: filters.clone(),
        };

        {
            let mut routes = self.routes.lock();
            if tx.is_closed() {
                return Ok(());
            }
            routes.insert(
                subscription_id.to_string(),
                SubscriptionRoute {
                    filters,
                    tx,
                    first_response,
                },
            );
        }

        if let Err(e) = self.send(&req) {
            self.routes.lock().remove(subscription_id);
            return Err(e);
        }
        Ok(())
    }

    /// Drop a route and send CLOSE if the link is up. Idempotent.
    pub fn unsubscribe(&self, subscription_id: &str) {
        let removed = self.routes.lock().remove(subscription_id);
        if removed.is_some() && self.is_open() {
            let close = ClientMessage::Close {
                subscription_id: subscription_id.to_string(),
            };
            if let Err(e) = self.send(&close) {
                debug!("CLOSE {} not sent to {}: {}", subscription_id, self.url, e);
            }
        }
    }

    pub fn active_subscriptions(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.routes.lock().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Re-send REQ for every registered route.
    fn resubscribe(&self) {
        let reqs: Vec<ClientMessage> = self
            .routes
            .lock()
            .iter()
            .map(|(id, route)| ClientMessage::Req {
                subscription_id: id.clone(),
                filters: route.filters.clone(),
            })
            .collect();

        for req in reqs {
            if let Err(e) = self.send(&req) {
                warn!("Failed to resubscribe on {}: {}", self.url, e);
            }
        }
    }
}

impl Drop for RelayConnection {
    fn drop(&mut self) {
        if let Some(handle) = self.recv_task.get_mut().take() {
            handle.abort();
        }
    }
}

fn handle_frame(url: &str, text: &str, pending: &PendingMap, routes: &RouteMap) {
    let message = match RelayMessage::from_json(text) {
        Ok(message) => message,
        Err(e) => {
            warn!("Dropping malformed frame from {}: {}", url, e);
            return;
        }
    };

    match message {
        RelayMessage::Ok {
            event_id,
            accepted,
            message,
        } => {
            let waiters = pending.lock().remove(&event_id).unwrap_or_default();
            for (_, tx) in waiters {
                let _ = tx.send(PublishConfirmation {
                    event_id: event_id.clone(),
                    accepted,
                    message: message.clone(),
                });
            }
        }
        RelayMessage::Event {
            subscription_id,
            event,
        } => {
            let mut routes = routes.lock();
            let delivered = routes
                .get(&subscription_id)
                .map(|route| route.tx.send((url.to_string(), RouteMessage::Event(event))).is_ok());
            if delivered == Some(false) {
                debug!("Subscription {} receiver gone, removing", subscription_id);
                routes.remove(&subscription_id);
            }
        }
        RelayMessage::Eose { subscription_id } => {
            if let Some(route) = routes.lock().get_mut(&subscription_id) {
                route.resolve(Ok(()));
                let _ = route.tx.send((url.to_string(), RouteMessage::Eose));
            }
        }
        RelayMessage::Closed {
            subscription_id,
            message,
        } => {
            warn!(
                "Subscription {} closed by {}: {}",
                subscription_id, url, message
            );
            if let Some(mut route) = routes.lock().remove(&subscription_id) {
                route.resolve(Err(RelayError::Rejected(message.clone())));
                let _ = route.tx.send((url.to_string(), RouteMessage::Closed(message)));
            }
        }
        RelayMessage::Notice { message } => {
            info!("Notice from {}: {}", url, message);
        }
        RelayMessage::Auth { challenge } => {
            debug!("AUTH challenge from {} ignored: {}", url, challenge);
        }
        RelayMessage::Count {
            subscription_id,
            count,
        } => {
            debug!("COUNT {} from {}: {}", subscription_id, url, count);
        }
    }
}
