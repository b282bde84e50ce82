//! Relay connection manager.
//!
//! Owns every registered relay together with its circuit breaker, performance tracker,
//! retry scheduler and connection. Callers publish and subscribe through the manager; it
//! picks relays with [`select`](crate::selector::select) over a snapshot, fans the work out
//! to one spawned task per relay and records every outcome against that relay.
//!
//! Per-relay state sits behind per-relay locks, never a manager-wide one. Relay failures are
//! absorbed and recorded; a call only fails when selection finds nothing or every selected
//! relay failed.

use crate::circuit::{Admission, CircuitBreaker, CircuitRecord};
use crate::clock::{Clock, SystemClock};
use crate::config::ManagerConfig;
use crate::connection::{ConnectionState, RelayConnection, RelayStatus, RouteSender};
use crate::descriptor::{RelayDescriptor, normalize_relay_url};
use crate::error::{ClientError, RelayError, Result};
use crate::event::{Event, Filter};
use crate::performance::{OperationKind, PerformanceRecord, PerformanceTracker};
use crate::retry::RetryScheduler;
use crate::selector::{RelayCandidate, SelectionRequest, select};
use crate::subscription::{EventStream, SubscriptionEvent, generate_subscription_id};
use crate::transport::{RelayTransport, WebSocketTransport};
use futures::future::join_all;
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, info, warn};

/// Result of publishing to one relay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublishOutcome {
    /// Relay acknowledged the event
    Ok,
    /// No acknowledgment before the deadline
    Timeout,
    /// Relay answered OK false
    Rejected(String),
    /// Relay was skipped or its link failed
    Failed(RelayError),
}

impl PublishOutcome {
    pub fn is_ok(&self) -> bool {
        matches!(self, PublishOutcome::Ok)
    }

    fn from_result(result: &std::result::Result<(), RelayError>) -> Self {
        match result {
            Ok(()) => PublishOutcome::Ok,
            Err(RelayError::Timeout(_)) => PublishOutcome::Timeout,
            Err(RelayError::Rejected(message)) => PublishOutcome::Rejected(message.clone()),
            Err(e) => PublishOutcome::Failed(e.clone()),
        }
    }
}

/// Per-relay outcomes of a publish call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishReport {
    pub event_id: String,
    pub outcomes: BTreeMap<String, PublishOutcome>,
}

impl PublishReport {
    /// Relays that acknowledged the event.
    pub fn accepted(&self) -> Vec<&str> {
        self.outcomes
            .iter()
            .filter(|(_, outcome)| outcome.is_ok())
            .map(|(url, _)| url.as_str())
            .collect()
    }
}

/// Health of one relay at a point in time.
#[derive(Debug, Clone)]
pub struct RelayHealth {
    pub descriptor: RelayDescriptor,
    pub circuit: CircuitRecord,
    pub performance: PerformanceRecord,
    pub connection: ConnectionState,
    pub current_retry: u32,
}

struct RelayEntry {
    descriptor: RelayDescriptor,
    circuit: Mutex<CircuitBreaker>,
    performance: Mutex<PerformanceTracker>,
    retry: Mutex<RetryScheduler>,
    connection: Arc<RelayConnection>,
    /// Serializes connect attempts for this relay
    connect_lock: tokio::sync::Mutex<()>,
    removed: AtomicBool,
}

impl RelayEntry {
    fn url(&self) -> &str {
        &self.descriptor.url
    }

    fn candidate(&self, now: tokio::time::Instant) -> RelayCandidate {
        let circuit = self.circuit.lock();
        RelayCandidate {
            descriptor: self.descriptor.clone(),
            circuit: circuit.record().clone(),
            performance: self.performance.lock().record().clone(),
            trial_eligible: circuit.is_trial_eligible(now),
        }
    }

    fn health(&self) -> RelayHealth {
        RelayHealth {
            descriptor: self.descriptor.clone(),
            circuit: self.circuit.lock().record().clone(),
            performance: self.performance.lock().record().clone(),
            connection: self.connection.state(),
            current_retry: self.retry.lock().current_retry(),
        }
    }

    /// Record one operation outcome into both the circuit and the score.
    fn record(
        &self,
        operation: OperationKind,
        result: &std::result::Result<(), RelayError>,
        elapsed: Duration,
        now: tokio::time::Instant,
    ) {
        {
            let mut circuit = self.circuit.lock();
            if result.is_ok() {
                circuit.record_success(now);
            } else {
                circuit.record_failure(now);
            }
        }
        self.record_score(operation, result, elapsed, now);
    }

    /// Record an outcome into the score only. Used when the link dropped mid-operation:
    /// the link watcher reports that loss to the circuit once.
    fn record_score(
        &self,
        operation: OperationKind,
        result: &std::result::Result<(), RelayError>,
        elapsed: Duration,
        now: tokio::time::Instant,
    ) {
        self.performance
            .lock()
            .record_outcome(operation, result.is_ok(), elapsed, now);

        if let Err(e) = result {
            debug!("{} failed on {}: {}", operation.name(), self.url(), e);
        }
    }
}

struct ManagerInner {
    config: ManagerConfig,
    clock: Arc<dyn Clock>,
    transport: Arc<dyn RelayTransport>,
    relays: RwLock<HashMap<String, Arc<RelayEntry>>>,
    status_tx: broadcast::Sender<RelayStatus>,
    closed: AtomicBool,
}

/// Health-routed connection manager for a set of Nostr relays.
///
/// Cheap to clone; clones share the same relays.
#[derive(Clone)]
pub struct RelayConnectionManager {
    inner: Arc<ManagerInner>,
}

impl RelayConnectionManager {
    /// Manager over WebSockets, with the configured relays registered.
    pub fn new(config: ManagerConfig) -> Result<Self> {
        Self::with_transport(config, Arc::new(WebSocketTransport), Arc::new(SystemClock))
    }

    /// Manager with an injected transport and clock.
    pub fn with_transport(
        config: ManagerConfig,
        transport: Arc<dyn RelayTransport>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        config.validate()?;
        let descriptors = config.descriptors()?;
        let (status_tx, _) = broadcast::channel(config.status_channel_capacity);

        let manager = Self {
            inner: Arc::new(ManagerInner {
                config,
                clock,
                transport,
                relays: RwLock::new(HashMap::new()),
                status_tx,
                closed: AtomicBool::new(false),
            }),
        };
        for descriptor in descriptors {
            manager.register_relay(descriptor)?;
        }
        Ok(manager)
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.inner.config
    }

    fn ensure_open(&self) -> Result<()> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(ClientError::ManagerClosed);
        }
        Ok(())
    }

    /// Add a relay. Its circuit starts closed and its score neutral.
    pub fn register_relay(&self, descriptor: RelayDescriptor) -> Result<()> {
        self.ensure_open()?;
        let descriptor = descriptor.normalized()?;
        let url = descriptor.url.clone();

        let mut relays = self.inner.relays.write();
        if relays.contains_key(&url) {
            return Err(ClientError::RelayExists(url));
        }

        let config = &self.inner.config;
        let entry = RelayEntry {
            circuit: Mutex::new(CircuitBreaker::new(url.clone(), config.circuit.clone())),
            performance: Mutex::new(PerformanceTracker::new(config.performance.clone())),
            retry: Mutex::new(RetryScheduler::new(config.retry.clone())),
            connection: Arc::new(RelayConnection::new(
                url.clone(),
                self.inner.status_tx.clone(),
            )),
            connect_lock: tokio::sync::Mutex::new(()),
            removed: AtomicBool::new(false),
            descriptor,
        };
        relays.insert(url.clone(), Arc::new(entry));
        info!("Registered relay: {}", url);
        Ok(())
    }

    /// Remove a relay, cancelling its reconnect timer and closing its connection.
    pub fn remove_relay(&self, url: &str) -> Result<RelayDescriptor> {
        let url = normalize_relay_url(url)?;
        let entry = self
            .inner
            .relays
            .write()
            .remove(&url)
            .ok_or_else(|| ClientError::UnknownRelay(url.clone()))?;

        entry.removed.store(true, Ordering::SeqCst);
        entry.retry.lock().reset_retry();
        entry.connection.close();
        info!("Removed relay: {}", url);
        Ok(entry.descriptor.clone())
    }

    /// Registered relay URLs, sorted.
    pub fn relay_urls(&self) -> Vec<String> {
        let mut urls: Vec<String> = self.inner.relays.read().keys().cloned().collect();
        urls.sort();
        urls
    }

    pub fn relay_health(&self, url: &str) -> Option<RelayHealth> {
        let url = normalize_relay_url(url).ok()?;
        self.inner.relays.read().get(&url).map(|entry| entry.health())
    }

    /// Health of every relay, sorted by URL.
    pub fn snapshot(&self) -> Vec<RelayHealth> {
        let mut health: Vec<RelayHealth> = self
            .inner
            .relays
            .read()
            .values()
            .map(|entry| entry.health())
            .collect();
        health.sort_by(|a, b| a.descriptor.url.cmp(&b.descriptor.url));
        health
    }

    /// Relay status notifications. Drop the receiver to unsubscribe.
    pub fn status_stream(&self) -> broadcast::Receiver<RelayStatus> {
        self.inner.status_tx.subscribe()
    }

    fn entries(&self) -> Vec<Arc<RelayEntry>> {
        self.inner.relays.read().values().cloned().collect()
    }

    fn entry(&self, url: &str) -> Option<Arc<RelayEntry>> {
        self.inner.relays.read().get(url).cloned()
    }

    fn choose(&self, request: &SelectionRequest) -> Result<Vec<Arc<RelayEntry>>> {
        let now = self.inner.clock.now();
        let entries = self.entries();
        let candidates: Vec<RelayCandidate> = entries.iter().map(|e| e.candidate(now)).collect();

        let chosen = select(&candidates, request)?;
        debug!(
            "Selected {} relay(s) for {:?}: {:?}",
            chosen.len(),
            request.operation,
            chosen.iter().map(|d| d.url.as_str()).collect::<Vec<_>>()
        );
        Ok(chosen
            .iter()
            .filter_map(|descriptor| self.entry(&descriptor.url))
            .collect())
    }

    /// Connect every registered relay. Failures arm background reconnects.
    pub async fn connect_all(&self) -> Result<BTreeMap<String, std::result::Result<(), RelayError>>> {
        self.ensure_open()?;

        let tasks = self.entries().into_iter().map(|entry| {
            let inner = Arc::clone(&self.inner);
            tokio::spawn(async move {
                let url = entry.url().to_string();
                let result = inner.connect_attempt(&entry).await;
                (url, result)
            })
        });

        let mut results = BTreeMap::new();
        for joined in join_all(tasks).await {
            match joined {
                Ok((url, result)) => {
                    results.insert(url, result);
                }
                Err(e) => warn!("Connect task failed: {}", e),
            }
        }
        Ok(results)
    }

    /// Publish an event to the selected relays.
    ///
    /// Each relay gets its own deadline. Succeeds when at least one relay acknowledges.
    pub async fn publish(&self, event: Event, request: SelectionRequest) -> Result<PublishReport> {
        self.ensure_open()?;
        let entries = self.choose(&request)?;
        info!("Publishing {} to {} relay(s)", event.id, entries.len());

        let event = Arc::new(event);
        let tasks = entries.into_iter().map(|entry| {
            let inner = Arc::clone(&self.inner);
            let event = Arc::clone(&event);
            tokio::spawn(async move {
                let url = entry.url().to_string();
                let result = inner.publish_to(&entry, &event).await;
                (url, result)
            })
        });

        let mut outcomes = BTreeMap::new();
        let mut errors = BTreeMap::new();
        for joined in join_all(tasks).await {
            let (url, result) = match joined {
                Ok(pair) => pair,
                Err(e) => {
                    warn!("Publish task failed: {}", e);
                    continue;
                }
            };
            if let Err(e) = &result {
                errors.insert(url.clone(), e.clone());
            }
            outcomes.insert(url, PublishOutcome::from_result(&result));
        }

        if !outcomes.values().any(PublishOutcome::is_ok) {
            warn!("Publish of {} failed on every relay", event.id);
            return Err(ClientError::AllRelaysFailed(errors));
        }

        Ok(PublishReport {
            event_id: event.id.clone(),
            outcomes,
        })
    }

    /// Open a subscription on the selected relays and merge their events.
    ///
    /// Returns once every selected relay has been sent its REQ (or failed). The stream runs
    /// until cancelled or dropped.
    pub async fn subscribe(
        &self,
        filters: Vec<Filter>,
        request: SelectionRequest,
    ) -> Result<EventStream> {
        self.open_stream(filters, request, OperationKind::Read).await
    }

    /// Collect stored events matching `filters` until every relay sent EOSE or the fetch
    /// deadline passes.
    pub async fn fetch(&self, filters: Vec<Filter>, request: SelectionRequest) -> Result<Vec<Event>> {
        let mut stream = self
            .open_stream(filters, request, OperationKind::Fetch)
            .await?;
        let mut events = Vec::new();

        let collect = async {
            while let Some(item) = stream.recv().await {
                match item {
                    SubscriptionEvent::Event { event, .. } => events.push(event),
                    SubscriptionEvent::AllEose => break,
                    _ => {}
                }
            }
        };
        if tokio::time::timeout(self.inner.config.fetch_timeout(), collect)
            .await
            .is_err()
        {
            debug!("Fetch {} hit its deadline", stream.id());
        }

        stream.cancel();
        Ok(events)
    }

    async fn open_stream(
        &self,
        filters: Vec<Filter>,
        request: SelectionRequest,
        operation: OperationKind,
    ) -> Result<EventStream> {
        self.ensure_open()?;
        let entries = self.choose(&request)?;
        let subscription_id = generate_subscription_id();
        let (tx, rx) = mpsc::unbounded_channel();
        info!(
            "Opening subscription {} on {} relay(s)",
            subscription_id,
            entries.len()
        );

        let tasks = entries.into_iter().map(|entry| {
            let inner = Arc::clone(&self.inner);
            let subscription_id = subscription_id.clone();
            let filters = filters.clone();
            let tx = tx.clone();
            tokio::spawn(async move {
                let result = inner
                    .subscribe_on(&entry, &subscription_id, filters, tx, operation)
                    .await;
                (entry, result)
            })
        });

        let mut opened = Vec::new();
        let mut errors = BTreeMap::new();
        for joined in join_all(tasks).await {
            match joined {
                Ok((entry, Ok(()))) => opened.push(Arc::clone(&entry.connection)),
                Ok((entry, Err(e))) => {
                    errors.insert(entry.url().to_string(), e);
                }
                Err(e) => warn!("Subscribe task failed: {}", e),
            }
        }

        if opened.is_empty() {
            warn!("Subscription {} failed on every relay", subscription_id);
            return Err(ClientError::AllRelaysFailed(errors));
        }
        Ok(EventStream::new(
            subscription_id,
            rx,
            opened,
            self.inner.config.dedup_capacity,
        ))
    }

    /// Cancel every reconnect timer and close every connection.
    ///
    /// Later calls return [`ClientError::ManagerClosed`].
    pub fn shutdown(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("Shutting down relay manager");
        for entry in self.entries() {
            entry.retry.lock().reset_retry();
            entry.connection.close();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }
}

impl std::fmt::Debug for RelayConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayConnectionManager")
            .field("relays", &self.relay_urls())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl ManagerInner {
    fn is_live(&self, entry: &RelayEntry) -> bool {
        !self.closed.load(Ordering::SeqCst) && !entry.removed.load(Ordering::SeqCst)
    }

    /// Make sure the relay has an open link, connecting if needed.
    async fn ensure_connected(
        self: &Arc<Self>,
        entry: &Arc<RelayEntry>,
    ) -> std::result::Result<(), RelayError> {
        let _guard = entry.connect_lock.lock().await;
        if entry.connection.is_open() {
            return Ok(());
        }
        if !self.is_live(entry) {
            return Err(RelayError::Connection(format!(
                "relay {} is no longer managed",
                entry.url()
            )));
        }

        let lost = entry
            .connection
            .connect(self.transport.as_ref(), self.config.connect_timeout())
            .await?;

        if !self.is_live(entry) {
            entry.connection.close();
            return Err(RelayError::Connection(format!(
                "relay {} is no longer managed",
                entry.url()
            )));
        }

        entry.retry.lock().reset_retry();
        self.watch_link(entry, lost);
        Ok(())
    }

    fn watch_link(self: &Arc<Self>, entry: &Arc<RelayEntry>, lost: oneshot::Receiver<()>) {
        let inner = Arc::downgrade(self);
        let weak_entry = Arc::downgrade(entry);
        tokio::spawn(async move {
            // Err means the link was closed on purpose
            if lost.await.is_err() {
                return;
            }
            if let (Some(inner), Some(entry)) = (inner.upgrade(), weak_entry.upgrade()) {
                inner.handle_transport_loss(&entry);
            }
        });
    }

    fn handle_transport_loss(self: &Arc<Self>, entry: &Arc<RelayEntry>) {
        if !self.is_live(entry) {
            return;
        }
        warn!("Lost connection to {}", entry.url());
        entry.connection.mark_failed();
        entry.circuit.lock().record_failure(self.clock.now());
        self.arm_reconnect(entry);
    }

    fn arm_reconnect(self: &Arc<Self>, entry: &Arc<RelayEntry>) {
        if !self.is_live(entry) {
            return;
        }
        let inner: Weak<Self> = Arc::downgrade(self);
        let weak_entry = Arc::downgrade(entry);

        let handle = entry.retry.lock().schedule_retry(move || async move {
            if let (Some(inner), Some(entry)) = (inner.upgrade(), weak_entry.upgrade()) {
                inner.reconnect(entry).await;
            }
        });

        match handle {
            Some(handle) => info!(
                "Reconnecting to {} in {:?}",
                entry.url(),
                handle.delay()
            ),
            None => warn!("Giving up reconnecting to {}", entry.url()),
        }
    }

    async fn reconnect(self: Arc<Self>, entry: Arc<RelayEntry>) {
        if !self.is_live(&entry) || entry.connection.is_open() {
            return;
        }
        debug!("Reconnect attempt for {}", entry.url());
        if let Err(e) = self.connect_attempt(&entry).await {
            debug!("Reconnect to {} failed: {}", entry.url(), e);
        }
    }

    /// A connection attempt outside any caller operation; the result feeds the circuit.
    async fn connect_attempt(
        self: &Arc<Self>,
        entry: &Arc<RelayEntry>,
    ) -> std::result::Result<(), RelayError> {
        let admission = entry.circuit.lock().try_acquire(self.clock.now());
        if let Err(e) = admission {
            self.arm_reconnect(entry);
            return Err(e);
        }

        match self.ensure_connected(entry).await {
            Ok(()) => {
                entry.circuit.lock().record_success(self.clock.now());
                Ok(())
            }
            Err(e) => {
                if self.is_live(entry) {
                    entry.circuit.lock().record_failure(self.clock.now());
                    self.arm_reconnect(entry);
                } else {
                    entry.circuit.lock().release_trial();
                }
                Err(e)
            }
        }
    }

    async fn publish_to(
        self: &Arc<Self>,
        entry: &Arc<RelayEntry>,
        event: &Event,
    ) -> std::result::Result<(), RelayError> {
        entry.circuit.lock().try_acquire(self.clock.now())?;

        let started = self.clock.now();
        let mut link_lost = false;
        let result = match self.ensure_connected(entry).await {
            Ok(()) => {
                match tokio::time::timeout(
                    self.config.publish_timeout(),
                    entry.connection.publish(event),
                )
                .await
                {
                    Ok(Ok(confirmation)) if confirmation.is_stored() => Ok(()),
                    Ok(Ok(confirmation)) => Err(RelayError::Rejected(confirmation.message)),
                    Ok(Err(e)) => {
                        link_lost = matches!(e, RelayError::Connection(_));
                        Err(e)
                    }
                    Err(_) => Err(RelayError::Timeout(self.config.publish_timeout())),
                }
            }
            Err(e) => Err(e),
        };

        let now = self.clock.now();
        let elapsed = now.saturating_duration_since(started);
        if link_lost {
            entry.record_score(OperationKind::Write, &result, elapsed, now);
        } else {
            entry.record(OperationKind::Write, &result, elapsed, now);
        }
        result
    }

    async fn subscribe_on(
        self: &Arc<Self>,
        entry: &Arc<RelayEntry>,
        subscription_id: &str,
        filters: Vec<Filter>,
        tx: RouteSender,
        operation: OperationKind,
    ) -> std::result::Result<(), RelayError> {
        let admission = entry.circuit.lock().try_acquire(self.clock.now())?;

        let started = self.clock.now();
        let (first_tx, first_rx) = oneshot::channel();
        let opened = match self.ensure_connected(entry).await {
            Ok(()) => entry
                .connection
                .subscribe(subscription_id, filters, tx, Some(first_tx)),
            Err(e) => Err(e),
        };

        if let Err(e) = opened {
            let now = self.clock.now();
            entry.record(
                operation,
                &Err(e.clone()),
                now.saturating_duration_since(started),
                now,
            );
            return Err(e);
        }

        // Score the relay on its first answer, off the caller's path
        let inner = Arc::clone(self);
        let entry = Arc::clone(entry);
        let eose_timeout = self.config.eose_timeout();
        tokio::spawn(async move {
            let first = tokio::time::timeout(eose_timeout, first_rx).await;
            let now = inner.clock.now();
            let elapsed = now.saturating_duration_since(started);
            match first {
                Ok(Ok(result @ Err(RelayError::Connection(_)))) => {
                    entry.record_score(operation, &result, elapsed, now)
                }
                Ok(Ok(result)) => entry.record(operation, &result, elapsed, now),
                Err(_) => entry.record(
                    operation,
                    &Err(RelayError::Timeout(eose_timeout)),
                    elapsed,
                    now,
                ),
                // Cancelled before the relay answered
                Ok(Err(_)) => {
                    if admission == Admission::Trial {
                        entry.circuit.lock().release_trial();
                    }
                }
            }
        });
        Ok(())
    }
}
