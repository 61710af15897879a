//! Owns the single live connection and the category routes over it.

use super::{ConnectionState, Transport, TransportError, TransportEvent, TransportKind};
use crate::decode::RawPayload;
use crate::events::EventCategory;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Receives every payload delivered for one category.
pub type DataSink = Arc<dyn Fn(RawPayload) + Send + Sync>;
/// Receives errors the source reports for an established subscription.
pub type ErrorSink = Arc<dyn Fn(&str) + Send + Sync>;

#[derive(Debug, Clone, Copy)]
pub struct ManagerSettings {
    /// Try the relay when the primary cannot be opened.
    pub fallback_enabled: bool,
    /// Let the registry retry a rejected primary subscription on the relay.
    pub fallback_on_subscribe_failure: bool,
}

impl Default for ManagerSettings {
    fn default() -> Self {
        Self {
            fallback_enabled: true,
            fallback_on_subscribe_failure: true,
        }
    }
}

struct Route {
    id: u64,
    on_data: DataSink,
    on_error: ErrorSink,
}

struct Status {
    state: ConnectionState,
    active: Option<TransportKind>,
    last_error: Option<String>,
    pump: Option<JoinHandle<()>>,
}

struct Shared {
    primary: Arc<dyn Transport>,
    fallback: Option<Arc<dyn Transport>>,
    settings: ManagerSettings,
    status: Mutex<Status>,
    routes: DashMap<EventCategory, Route>,
    /// Pools whose progress is watched, with a holder count.
    pools: Mutex<HashMap<String, usize>>,
    /// Serialises connection attempts.
    connect_lock: tokio::sync::Mutex<()>,
    state_tx: broadcast::Sender<ConnectionState>,
    next_route: AtomicU64,
}

impl Shared {
    fn transport(&self, kind: TransportKind) -> Option<Arc<dyn Transport>> {
        match kind {
            TransportKind::Primary => Some(self.primary.clone()),
            TransportKind::Fallback => self.fallback.clone(),
        }
    }

    fn active(&self) -> Option<(TransportKind, Arc<dyn Transport>)> {
        let kind = self.status.lock().active?;
        self.transport(kind).map(|t| (kind, t))
    }

    fn set_state(&self, state: ConnectionState) {
        self.status.lock().state = state;
        debug!(state = %state, "connection state changed");
        // No receivers is fine.
        let _ = self.state_tx.send(state);
    }

    fn transports(&self) -> impl Iterator<Item = &Arc<dyn Transport>> {
        std::iter::once(&self.primary).chain(self.fallback.as_ref())
    }

    fn fail(&self, reason: String) {
        {
            let mut status = self.status.lock();
            status.state = ConnectionState::Failed;
            status.active = None;
            status.last_error = Some(reason);
        }
        let _ = self.state_tx.send(ConnectionState::Failed);
    }
}

/// Cheap to clone; all clones drive the same connection.
#[derive(Clone)]
pub struct TransportManager {
    shared: Arc<Shared>,
}

impl TransportManager {
    pub fn new(
        primary: Arc<dyn Transport>,
        fallback: Option<Arc<dyn Transport>>,
        settings: ManagerSettings,
    ) -> Self {
        let (state_tx, _) = broadcast::channel(64);
        Self {
            shared: Arc::new(Shared {
                primary,
                fallback,
                settings,
                status: Mutex::new(Status {
                    state: ConnectionState::Idle,
                    active: None,
                    last_error: None,
                    pump: None,
                }),
                routes: DashMap::new(),
                pools: Mutex::new(HashMap::new()),
                connect_lock: tokio::sync::Mutex::new(()),
                state_tx,
                next_route: AtomicU64::new(1),
            }),
        }
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.shared.status.lock().state
    }

    pub fn last_error(&self) -> Option<String> {
        self.shared.status.lock().last_error.clone()
    }

    pub fn active_transport(&self) -> Option<TransportKind> {
        self.shared.status.lock().active
    }

    /// Every transition from now on, in order.
    pub fn state_changes(&self) -> broadcast::Receiver<ConnectionState> {
        self.shared.state_tx.subscribe()
    }

    /// Categories with a registered route, in category order.
    pub fn known_categories(&self) -> Vec<EventCategory> {
        let mut known: Vec<EventCategory> = self.shared.routes.iter().map(|r| *r.key()).collect();
        known.sort();
        known
    }

    /// Open a connection if none is live. Safe to call repeatedly and
    /// concurrently; only one attempt runs at a time.
    pub async fn initialize(&self) -> Result<(), TransportError> {
        let _guard = self.shared.connect_lock.lock().await;
        self.initialize_locked().await
    }

    async fn initialize_locked(&self) -> Result<(), TransportError> {
        if let ConnectionState::Connected(kind) = self.connection_state() {
            debug!(transport = %kind, "reusing live connection");
            return Ok(());
        }

        match self.open(TransportKind::Primary).await {
            Ok(()) => Ok(()),
            Err(e) if self.shared.settings.fallback_enabled && self.shared.fallback.is_some() => {
                warn!(error = %e, "primary transport unavailable, switching to fallback");
                self.open(TransportKind::Fallback).await
            }
            Err(e) => Err(e),
        }
    }

    async fn open(&self, kind: TransportKind) -> Result<(), TransportError> {
        let transport = self
            .shared
            .transport(kind)
            .ok_or(TransportError::FallbackUnavailable)?;

        self.shared.set_state(ConnectionState::Connecting(kind));
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        if let Err(e) = transport.connect(events_tx).await {
            error!(transport = %kind, error = %e, "failed to open transport");
            self.shared.fail(e.to_string());
            return Err(e);
        }

        let pump = tokio::spawn(pump(Arc::downgrade(&self.shared), kind, events_rx));
        {
            let mut status = self.shared.status.lock();
            status.active = Some(kind);
            if let Some(stale) = status.pump.replace(pump) {
                stale.abort();
            }
        }
        self.shared.set_state(ConnectionState::Connected(kind));
        info!(transport = %kind, name = transport.name(), "transport connected");

        let known = self.known_categories();
        if !known.is_empty() {
            info!(transport = %kind, categories = known.len(), "resubscribing known categories");
            if let Err(e) = transport.subscribe(&known).await {
                warn!(transport = %kind, error = %e, "resubscribe failed");
                let message = e.to_string();
                for category in known {
                    let sink = self.shared.routes.get(&category).map(|r| r.on_error.clone());
                    if let Some(on_error) = sink {
                        on_error(&message);
                    }
                }
            }
        }
        Ok(())
    }

    /// Drop whatever connection is live without touching the state.
    async fn close_active(&self) {
        let (active, pump) = {
            let mut status = self.shared.status.lock();
            (status.active.take(), status.pump.take())
        };
        if let Some(pump) = pump {
            pump.abort();
        }
        if let Some(transport) = active.and_then(|kind| self.shared.transport(kind)) {
            transport.disconnect().await;
        }
    }

    /// Tear down the live connection, go back to Idle and initialise again.
    /// Known categories are resubscribed on whichever transport comes up.
    pub async fn reconnect(&self) -> Result<(), TransportError> {
        let _guard = self.shared.connect_lock.lock().await;
        info!(categories = self.shared.routes.len(), "reconnecting");
        self.close_active().await;
        self.shared.set_state(ConnectionState::Idle);
        self.initialize_locked().await
    }

    /// Whether a rejected primary subscription may be retried on the relay.
    pub fn can_fall_back(&self) -> bool {
        let settings = self.shared.settings;
        settings.fallback_enabled
            && settings.fallback_on_subscribe_failure
            && self.shared.fallback.is_some()
            && self.active_transport() != Some(TransportKind::Fallback)
    }

    /// Move the whole connection to the relay.
    pub async fn fall_back(&self) -> Result<(), TransportError> {
        let _guard = self.shared.connect_lock.lock().await;
        if self.active_transport() == Some(TransportKind::Fallback) {
            return Ok(());
        }
        if self.shared.fallback.is_none() {
            return Err(TransportError::FallbackUnavailable);
        }
        warn!("moving connection to fallback transport");
        self.close_active().await;
        self.open(TransportKind::Fallback).await
    }

    /// Close the connection and return to Idle. Routes are kept.
    pub async fn shutdown(&self) {
        let _guard = self.shared.connect_lock.lock().await;
        self.close_active().await;
        self.shared.set_state(ConnectionState::Idle);
        info!("transport shut down");
    }

    /// Ask every transport to carry progress for `pool_id` until the lease
    /// is dropped. Leases for the same pool are counted.
    pub fn watch_pool(&self, pool_id: &str) -> PoolLease {
        let first = {
            let mut pools = self.shared.pools.lock();
            let holders = pools.entry(pool_id.to_string()).or_insert(0);
            *holders += 1;
            *holders == 1
        };
        if first {
            debug!(pool = pool_id, "watching pool progress");
            for transport in self.shared.transports() {
                transport.watch_pool(pool_id);
            }
        }
        PoolLease {
            pool_id: pool_id.to_string(),
            shared: Arc::downgrade(&self.shared),
        }
    }

    /// Pools with at least one live lease, sorted.
    pub fn watched_pools(&self) -> Vec<String> {
        let mut pools: Vec<String> = self.shared.pools.lock().keys().cloned().collect();
        pools.sort();
        pools
    }

    /// Route `category` to the sinks and subscribe on the live transport,
    /// connecting first if needed.
    pub async fn issue_subscribe(
        &self,
        category: EventCategory,
        on_data: DataSink,
        on_error: ErrorSink,
    ) -> Result<TeardownHandle, TransportError> {
        self.initialize().await?;
        let (kind, transport) = self.shared.active().ok_or(TransportError::NotConnected)?;

        let id = self.shared.next_route.fetch_add(1, Ordering::Relaxed);
        self.shared.routes.insert(
            category,
            Route {
                id,
                on_data,
                on_error,
            },
        );

        let mut attempt = (kind, transport);
        let mut switched = false;
        let kind = loop {
            let Err(e) = attempt.1.subscribe(&[category]).await else {
                break attempt.0;
            };
            // Retry once if the connection moved while this was in flight.
            match self.shared.active() {
                Some(now) if now.0 != attempt.0 && !switched => {
                    info!(
                        category = %category,
                        from = %attempt.0,
                        to = %now.0,
                        "transport changed mid-subscribe, retrying"
                    );
                    attempt = now;
                    switched = true;
                }
                _ => {
                    warn!(category = %category, transport = %attempt.0, error = %e, "subscribe failed");
                    self.shared.routes.remove_if(&category, |_, r| r.id == id);
                    return Err(e);
                }
            }
        };
        info!(category = %category, transport = %kind, "underlying subscription active");

        Ok(TeardownHandle {
            category,
            route_id: id,
            shared: Arc::downgrade(&self.shared),
        })
    }
}

impl fmt::Debug for TransportManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportManager")
            .field("state", &self.connection_state())
            .field("routes", &self.shared.routes.len())
            .finish()
    }
}

/// Releases one underlying subscription. Consumed by `teardown`.
pub struct TeardownHandle {
    category: EventCategory,
    route_id: u64,
    shared: Weak<Shared>,
}

impl TeardownHandle {
    pub fn category(&self) -> EventCategory {
        self.category
    }

    pub fn teardown(self) {
        let Some(shared) = self.shared.upgrade() else {
            return;
        };
        let removed = shared
            .routes
            .remove_if(&self.category, |_, r| r.id == self.route_id)
            .is_some();
        if !removed {
            debug!(category = %self.category, "route already replaced, nothing to tear down");
            return;
        }
        if let Some((_, transport)) = shared.active() {
            transport.unsubscribe(self.category);
        }
        info!(category = %self.category, "underlying subscription torn down");
    }
}

impl fmt::Debug for TeardownHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TeardownHandle")
            .field("category", &self.category)
            .field("route_id", &self.route_id)
            .finish()
    }
}

/// Keeps one pool's progress channel open. Dropping it releases the pool.
pub struct PoolLease {
    pool_id: String,
    shared: Weak<Shared>,
}

impl PoolLease {
    pub fn pool_id(&self) -> &str {
        &self.pool_id
    }
}

impl Drop for PoolLease {
    fn drop(&mut self) {
        let Some(shared) = self.shared.upgrade() else {
            return;
        };
        let last = {
            let mut pools = shared.pools.lock();
            match pools.get_mut(&self.pool_id) {
                Some(holders) if *holders > 1 => {
                    *holders -= 1;
                    false
                }
                Some(_) => {
                    pools.remove(&self.pool_id);
                    true
                }
                None => false,
            }
        };
        if last {
            debug!(pool = %self.pool_id, "pool progress released");
            for transport in shared.transports() {
                transport.unwatch_pool(&self.pool_id);
            }
        }
    }
}

impl fmt::Debug for PoolLease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoolLease").field("pool_id", &self.pool_id).finish()
    }
}

async fn pump(
    shared: Weak<Shared>,
    kind: TransportKind,
    mut events: mpsc::UnboundedReceiver<TransportEvent>,
) {
    while let Some(event) = events.recv().await {
        let Some(shared) = shared.upgrade() else {
            return;
        };
        match event {
            TransportEvent::Data { category, payload } => {
                let sink = shared.routes.get(&category).map(|r| r.on_data.clone());
                match sink {
                    Some(on_data) => on_data(payload),
                    None => debug!(category = %category, "delivery with no route"),
                }
            }
            TransportEvent::Error { category, message } => {
                warn!(category = %category, transport = %kind, error = %message, "subscription error");
                let sink = shared.routes.get(&category).map(|r| r.on_error.clone());
                if let Some(on_error) = sink {
                    on_error(&message);
                }
            }
            TransportEvent::Closed { reason } => {
                if shared.status.lock().active != Some(kind) {
                    return;
                }
                error!(transport = %kind, reason = %reason, "connection lost, reconnect required");
                shared.status.lock().pump = None;
                shared.fail(reason);
                return;
            }
        }
    }
}
