//! Merged subscription stream across relays.
//!
//! Every relay of a subscription feeds one channel. [`EventStream`] drops events whose id it
//! has already yielded (the first relay to deliver an id wins) and reports per-relay EOSE
//! plus a single [`SubscriptionEvent::AllEose`] once every relay has finished sending
//! stored events.

use crate::connection::{RelayConnection, RouteMessage};
use crate::event::Event;
use futures::Stream;
use std::collections::{BTreeSet, HashSet, VecDeque};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;

/// Generate a unique subscription ID.
pub fn generate_subscription_id() -> String {
    Uuid::new_v4().to_string()[..8].to_string()
}

/// Items yielded by an [`EventStream`].
#[derive(Debug, Clone, PartialEq)]
pub enum SubscriptionEvent {
    /// First delivery of an event
    Event { relay_url: String, event: Event },
    /// A relay finished sending stored events
    Eose { relay_url: String },
    /// A relay ended the subscription
    Closed { relay_url: String, message: String },
    /// Every relay has sent EOSE (or ended the subscription)
    AllEose,
}

/// Tracks which relays still owe stored events.
#[derive(Debug, Clone, Default)]
pub struct EoseTracker {
    relays: BTreeSet<String>,
    finished: BTreeSet<String>,
    reported: bool,
}

impl EoseTracker {
    pub fn new(relays: impl IntoIterator<Item = String>) -> Self {
        Self {
            relays: relays.into_iter().collect(),
            finished: BTreeSet::new(),
            reported: false,
        }
    }

    /// Mark a relay finished. Returns true exactly once, when the last relay finishes.
    pub fn finish(&mut self, relay_url: &str) -> bool {
        if self.relays.contains(relay_url) {
            self.finished.insert(relay_url.to_string());
        }
        if !self.reported && !self.relays.is_empty() && self.finished.len() == self.relays.len()
        {
            self.reported = true;
            return true;
        }
        false
    }

    pub fn is_complete(&self) -> bool {
        self.reported
    }
}

/// Recently yielded event ids, bounded. The oldest id is evicted first.
#[derive(Debug, Clone)]
struct RecentIds {
    capacity: usize,
    ids: HashSet<String>,
    /// Insertion order, oldest first
    order: VecDeque<String>,
}

impl RecentIds {
    fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            ids: HashSet::new(),
            order: VecDeque::new(),
        }
    }

    /// Remember `id`. Returns false if it is already remembered.
    fn insert(&mut self, id: &str) -> bool {
        if self.ids.contains(id) {
            return false;
        }
        if self.ids.len() >= self.capacity
            && let Some(oldest) = self.order.pop_front()
        {
            self.ids.remove(&oldest);
        }
        self.ids.insert(id.to_string());
        self.order.push_back(id.to_string());
        true
    }
}

/// Deduplicated, cancellable stream of events from several relays.
///
/// Dedup remembers the most recent `dedup_capacity` ids only, so an id evicted long ago is
/// yielded again if a relay resends it.
///
/// Dropping the stream cancels it.
pub struct EventStream {
    id: String,
    rx: mpsc::UnboundedReceiver<(String, RouteMessage)>,
    connections: Vec<Arc<RelayConnection>>,
    seen: RecentIds,
    eose: EoseTracker,
    queued: VecDeque<SubscriptionEvent>,
    cancelled: bool,
}

impl EventStream {
    pub(crate) fn new(
        id: String,
        rx: mpsc::UnboundedReceiver<(String, RouteMessage)>,
        connections: Vec<Arc<RelayConnection>>,
        dedup_capacity: usize,
    ) -> Self {
        let eose = EoseTracker::new(connections.iter().map(|c| c.url().to_string()));
        Self {
            id,
            rx,
            connections,
            seen: RecentIds::new(dedup_capacity),
            eose,
            queued: VecDeque::new(),
            cancelled: false,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Relays this subscription was opened on.
    pub fn relay_urls(&self) -> Vec<String> {
        self.connections.iter().map(|c| c.url().to_string()).collect()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled
    }

    /// Close the subscription on every relay. Safe to call more than once.
    pub fn cancel(&mut self) {
        if self.cancelled {
            return;
        }
        self.cancelled = true;
        // Close first so no relay can register a late route
        self.rx.close();
        for connection in &self.connections {
            connection.unsubscribe(&self.id);
        }
        debug!("Subscription {} cancelled", self.id);
    }

    /// Wait for the next item. `None` once cancelled and drained.
    pub async fn recv(&mut self) -> Option<SubscriptionEvent> {
        futures::future::poll_fn(|cx| self.poll_event(cx)).await
    }

    fn accept(&mut self, relay_url: String, message: RouteMessage) {
        match message {
            RouteMessage::Event(event) => {
                if self.seen.insert(&event.id) {
                    self.queued
                        .push_back(SubscriptionEvent::Event { relay_url, event });
                }
            }
            RouteMessage::Eose => {
                let all = self.eose.finish(&relay_url);
                self.queued.push_back(SubscriptionEvent::Eose { relay_url });
                if all {
                    self.queued.push_back(SubscriptionEvent::AllEose);
                }
            }
            RouteMessage::Closed(message) => {
                let all = self.eose.finish(&relay_url);
                self.queued
                    .push_back(SubscriptionEvent::Closed { relay_url, message });
                if all {
                    self.queued.push_back(SubscriptionEvent::AllEose);
                }
            }
            RouteMessage::Lost => {
                // Resubscribe on reconnect restarts the relay's feed
                debug!("Subscription {} lost relay {}", self.id, relay_url);
                if self.eose.finish(&relay_url) {
                    self.queued.push_back(SubscriptionEvent::AllEose);
                }
            }
        }
    }

    fn poll_event(&mut self, cx: &mut Context<'_>) -> Poll<Option<SubscriptionEvent>> {
        loop {
            if let Some(item) = self.queued.pop_front() {
                return Poll::Ready(Some(item));
            }
            match self.rx.poll_recv(cx) {
                Poll::Ready(Some((relay_url, message))) => self.accept(relay_url, message),
                Poll::Ready(None) => return Poll::Ready(None),
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

impl Stream for EventStream {
    type Item = SubscriptionEvent;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().poll_event(cx)
    }
}

impl Drop for EventStream {
    fn drop(&mut self) {
        self.cancel();
    }
}

impl std::fmt::Debug for EventStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventStream")
            .field("id", &self.id)
            .field("relays", &self.relay_urls())
            .field("cancelled", &self.cancelled)
            .finish()
    }
}
