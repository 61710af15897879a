//! Subscription registry: many callbacks per category over at most one
//! underlying subscription.
//!
//! Each category gets an entry on first subscribe. The entry's `pending`
//! flag is set while the underlying subscribe is in flight and is the only
//! guard against issuing a second one. When the last callback leaves, a
//! grace timer starts; a subscriber returning inside the window reuses the
//! live subscription, otherwise it is torn down and the entry dropped.

pub mod timer;

pub use timer::{GraceTimer, ManualTimer, TimerHandle, TimerTask, TokioTimer};

use crate::decode::{self, RawPayload};
use crate::events::{CanonicalRecord, EventCategory};
use crate::transport::{
    ConnectionState, DataSink, ErrorSink, PoolLease, TeardownHandle, TransportError,
    TransportManager,
};
use parking_lot::Mutex;
use std::any::Any;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::runtime::Handle;
use tracing::{debug, error, info, warn};

pub type Callback = Arc<dyn Fn(&CanonicalRecord) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CategoryState {
    Unsubscribed,
    PendingSubscribe,
    Active,
    GracePeriod,
}

impl fmt::Display for CategoryState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Unsubscribed => "unsubscribed",
            Self::PendingSubscribe => "pending",
            Self::Active => "active",
            Self::GracePeriod => "grace",
        };
        f.write_str(s)
    }
}

struct Grace {
    token: u64,
    handle: TimerHandle,
}

struct Entry {
    /// Distinguishes this entry from earlier ones for the same category.
    epoch: u64,
    callbacks: BTreeMap<u64, Callback>,
    pending: bool,
    teardown: Option<TeardownHandle>,
    grace: Option<Grace>,
    /// The grace window closed while a subscribe was still in flight.
    retiring: bool,
}

impl Entry {
    fn new(epoch: u64) -> Self {
        Self {
            epoch,
            callbacks: BTreeMap::new(),
            pending: false,
            teardown: None,
            grace: None,
            retiring: false,
        }
    }
}

struct Shared {
    transport: TransportManager,
    timer: Arc<dyn GraceTimer>,
    grace_period: Duration,
    runtime: Handle,
    entries: Mutex<HashMap<EventCategory, Entry>>,
    next_id: AtomicU64,
}

impl Shared {
    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn dispatch(&self, category: EventCategory, raw: &RawPayload) {
        let callbacks: Vec<(u64, Callback)> = {
            let entries = self.entries.lock();
            match entries.get(&category) {
                Some(entry) => entry
                    .callbacks
                    .iter()
                    .map(|(id, cb)| (*id, cb.clone()))
                    .collect(),
                None => Vec::new(),
            }
        };
        if callbacks.is_empty() {
            debug!(category = %category, "delivery with no subscribers");
            return;
        }

        let record = decode::decode(category, raw);
        for (id, callback) in callbacks {
            if let Err(panic) = catch_unwind(AssertUnwindSafe(|| callback(&record))) {
                error!(
                    category = %category,
                    subscriber = id,
                    panic = panic_message(panic.as_ref()),
                    "subscriber callback panicked"
                );
            }
        }
    }

    /// Drop one callback; start the grace window if it was the last.
    fn release(self: &Arc<Self>, category: EventCategory, id: u64) {
        let mut entries = self.entries.lock();
        let Some(entry) = entries.get_mut(&category) else {
            return;
        };
        if entry.callbacks.remove(&id).is_none() || !entry.callbacks.is_empty() {
            return;
        }

        let token = self.next_id();
        let registry = Arc::downgrade(self);
        let handle = self.timer.schedule(
            self.grace_period,
            Box::new(move || {
                if let Some(registry) = registry.upgrade() {
                    registry.expire(category, token);
                }
            }),
        );
        if let Some(previous) = entry.grace.replace(Grace { token, handle }) {
            previous.handle.cancel();
        }
        debug!(category = %category, grace = ?self.grace_period, "last subscriber left, grace period started");
    }

    fn expire(&self, category: EventCategory, token: u64) {
        let teardown = {
            let mut entries = self.entries.lock();
            let Some(entry) = entries.get_mut(&category) else {
                return;
            };
            if entry.grace.as_ref().map(|g| g.token) != Some(token) {
                debug!(category = %category, "stale grace timer ignored");
                return;
            }
            entry.grace = None;
            if !entry.callbacks.is_empty() {
                return;
            }
            if entry.pending {
                debug!(category = %category, "grace expired mid-subscribe, retiring once settled");
                entry.retiring = true;
                return;
            }
            entries.remove(&category).and_then(|e| e.teardown)
        };

        info!(category = %category, "grace period expired, unsubscribing");
        if let Some(handle) = teardown {
            handle.teardown();
        }
    }

    /// Record the outcome of an underlying subscribe for entry `epoch`.
    fn settle(
        &self,
        category: EventCategory,
        epoch: u64,
        result: Result<TeardownHandle, TransportError>,
    ) {
        let mut entries = self.entries.lock();
        let Some(entry) = entries.get_mut(&category).filter(|e| e.epoch == epoch) else {
            drop(entries);
            if let Ok(handle) = result {
                debug!(category = %category, "subscription settled for a dropped entry");
                handle.teardown();
            }
            return;
        };

        entry.pending = false;
        let retire = entry.retiring || (result.is_err() && entry.callbacks.is_empty());
        match result {
            Ok(handle) if !retire => {
                entry.teardown = Some(handle);
                let subscribers = entry.callbacks.len();
                drop(entries);
                info!(category = %category, subscribers, "category active");
            }
            Ok(handle) => {
                if let Some(grace) = entries.remove(&category).and_then(|e| e.grace) {
                    grace.handle.cancel();
                }
                drop(entries);
                info!(category = %category, "subscription retired on arrival");
                handle.teardown();
            }
            Err(e) => {
                if retire {
                    if let Some(grace) = entries.remove(&category).and_then(|e| e.grace) {
                        grace.handle.cancel();
                    }
                }
                drop(entries);
                error!(category = %category, error = %e, "subscribe failed, category has no live subscription");
            }
        }
    }
}

async fn issue(shared: &Arc<Shared>, category: EventCategory) -> Result<TeardownHandle, TransportError> {
    let registry = Arc::downgrade(shared);
    let on_data: DataSink = Arc::new(move |payload: RawPayload| {
        if let Some(registry) = registry.upgrade() {
            registry.dispatch(category, &payload);
        }
    });
    let on_error: ErrorSink = Arc::new(move |message: &str| {
        warn!(category = %category, error = message, "source reported a subscription error");
    });
    shared
        .transport
        .issue_subscribe(category, on_data, on_error)
        .await
}

async fn establish(shared: Arc<Shared>, category: EventCategory, epoch: u64) {
    let result = match issue(&shared, category).await {
        Err(e) if shared.transport.can_fall_back() => {
            warn!(category = %category, error = %e, "subscribe rejected, retrying on fallback");
            match shared.transport.fall_back().await {
                Ok(()) => issue(&shared, category).await,
                Err(fallback_err) => Err(fallback_err),
            }
        }
        other => other,
    };
    shared.settle(category, epoch, result);
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.as_str()
    } else {
        "non-string panic payload"
    }
}

/// Cheap to clone; clones share the same entries.
#[derive(Clone)]
pub struct SubscriptionRegistry {
    shared: Arc<Shared>,
}

impl SubscriptionRegistry {
    /// Must be called inside a tokio runtime; underlying subscribes are
    /// spawned onto it.
    pub fn new(
        transport: TransportManager,
        timer: Arc<dyn GraceTimer>,
        grace_period: Duration,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                transport,
                timer,
                grace_period,
                runtime: Handle::current(),
                entries: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Register `callback` for every record of `category`. The callback
    /// stays registered until the returned guard is dropped or
    /// [`Subscription::unsubscribe`] is called.
    pub fn subscribe<F>(&self, category: EventCategory, callback: F) -> Subscription
    where
        F: Fn(&CanonicalRecord) + Send + Sync + 'static,
    {
        let shared = &self.shared;
        let id = shared.next_id();
        let issue_epoch = {
            let mut entries = shared.entries.lock();
            let entry = entries
                .entry(category)
                .or_insert_with(|| Entry::new(shared.next_id()));
            if let Some(grace) = entry.grace.take() {
                grace.handle.cancel();
                debug!(category = %category, "subscriber returned within grace period");
            }
            entry.retiring = false;
            entry.callbacks.insert(id, Arc::new(callback));

            if !entry.pending && entry.teardown.is_none() {
                entry.pending = true;
                Some(entry.epoch)
            } else {
                None
            }
        };

        if let Some(epoch) = issue_epoch {
            debug!(category = %category, "issuing underlying subscribe");
            shared
                .runtime
                .spawn(establish(shared.clone(), category, epoch));
        }

        Subscription {
            category,
            id,
            registry: Arc::downgrade(shared),
            lease: None,
            released: false,
        }
    }

    /// Decode `raw` once and hand the record to every callback of
    /// `category` in registration order. A panicking callback is logged and
    /// the rest still run.
    pub fn dispatch(&self, category: EventCategory, raw: &RawPayload) {
        self.shared.dispatch(category, raw);
    }

    /// Cancel every grace timer, tear down every underlying subscription and
    /// forget all entries. Outstanding guards become no-ops.
    pub fn reset(&self) {
        let drained: Vec<(EventCategory, Entry)> = self.shared.entries.lock().drain().collect();
        let count = drained.len();
        for (_, entry) in drained {
            if let Some(grace) = entry.grace {
                grace.handle.cancel();
            }
            if let Some(handle) = entry.teardown {
                handle.teardown();
            }
        }
        info!(categories = count, "registry reset");
    }

    pub fn category_state(&self, category: EventCategory) -> CategoryState {
        let entries = self.shared.entries.lock();
        match entries.get(&category) {
            None => CategoryState::Unsubscribed,
            Some(e) if e.pending => CategoryState::PendingSubscribe,
            Some(e) if e.grace.is_some() => CategoryState::GracePeriod,
            Some(e) if e.teardown.is_some() => CategoryState::Active,
            // A failed subscribe leaves callbacks waiting for a retry.
            Some(_) => CategoryState::Unsubscribed,
        }
    }

    pub fn subscriber_count(&self, category: EventCategory) -> usize {
        self.shared
            .entries
            .lock()
            .get(&category)
            .map_or(0, |e| e.callbacks.len())
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.shared.transport.connection_state()
    }

    /// The only recovery from a dropped connection. Live categories are
    /// resubscribed on whichever transport comes up, and categories whose
    /// subscribe had failed are issued again.
    pub async fn reconnect(&self) -> Result<(), TransportError> {
        self.shared.transport.reconnect().await?;
        self.retry_unestablished();
        Ok(())
    }

    fn retry_unestablished(&self) {
        let retry: Vec<(EventCategory, u64)> = {
            let mut entries = self.shared.entries.lock();
            entries
                .iter_mut()
                .filter(|(_, e)| !e.pending && e.teardown.is_none() && !e.callbacks.is_empty())
                .map(|(category, e)| {
                    e.pending = true;
                    (*category, e.epoch)
                })
                .collect()
        };
        for (category, epoch) in retry {
            debug!(category = %category, "retrying subscribe after reconnect");
            self.shared
                .runtime
                .spawn(establish(self.shared.clone(), category, epoch));
        }
    }

    pub fn transport(&self) -> &TransportManager {
        &self.shared.transport
    }
}

impl fmt::Debug for SubscriptionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let entries = self.shared.entries.lock();
        f.debug_struct("SubscriptionRegistry")
            .field("categories", &entries.len())
            .field("grace_period", &self.shared.grace_period)
            .finish()
    }
}

/// Keeps one callback registered. Dropping it unsubscribes.
#[must_use = "dropping a Subscription unsubscribes immediately"]
pub struct Subscription {
    category: EventCategory,
    id: u64,
    registry: Weak<Shared>,
    lease: Option<PoolLease>,
    released: bool,
}

impl Subscription {
    pub fn category(&self) -> EventCategory {
        self.category
    }

    /// Tie `lease` to this subscription; it is released with it.
    pub fn with_lease(mut self, lease: PoolLease) -> Self {
        self.lease = Some(lease);
        self
    }

    pub fn unsubscribe(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if std::mem::replace(&mut self.released, true) {
            return;
        }
        if let Some(registry) = self.registry.upgrade() {
            registry.release(self.category, self.id);
        }
        self.lease.take();
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.release();
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("category", &self.category)
            .field("id", &self.id)
            .field("lease", &self.lease)
            .finish()
    }
}
