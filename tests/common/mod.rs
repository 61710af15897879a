//! In-memory transports and helpers shared by the integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use poolwatch::registry::{CategoryState, ManualTimer, SubscriptionRegistry};
use poolwatch::transport::{
    ManagerSettings, Transport, TransportError, TransportEvent, TransportManager,
};
use poolwatch::{EventCategory, RawPayload};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};

pub const GRACE: Duration = Duration::from_secs(30);

/// A transport whose connects and subscribes succeed or fail on command.
pub struct MockTransport {
    name: &'static str,
    refuse_connect: AtomicBool,
    rejected: Mutex<HashSet<EventCategory>>,
    connects: AtomicUsize,
    disconnects: AtomicUsize,
    batches: Mutex<Vec<Vec<EventCategory>>>,
    unsubscribed: Mutex<Vec<EventCategory>>,
    events: Mutex<Option<mpsc::UnboundedSender<TransportEvent>>>,
    /// Subscribes wait while this is false.
    gate: watch::Sender<bool>,
    /// When non-empty, only batches touching these categories wait.
    parked: Mutex<HashSet<EventCategory>>,
    pools: Mutex<Vec<String>>,
}

impl MockTransport {
    pub fn new(name: &'static str) -> Arc<Self> {
        let (gate, _) = watch::channel(true);
        Arc::new(Self {
            name,
            refuse_connect: AtomicBool::new(false),
            rejected: Mutex::new(HashSet::new()),
            connects: AtomicUsize::new(0),
            disconnects: AtomicUsize::new(0),
            batches: Mutex::new(Vec::new()),
            unsubscribed: Mutex::new(Vec::new()),
            events: Mutex::new(None),
            gate,
            parked: Mutex::new(HashSet::new()),
            pools: Mutex::new(Vec::new()),
        })
    }

    pub fn refuse_connect(&self, refuse: bool) {
        self.refuse_connect.store(refuse, Ordering::SeqCst);
    }

    pub fn reject(&self, category: EventCategory) {
        self.rejected.lock().insert(category);
    }

    /// Park every subscribe until [`MockTransport::release`].
    pub fn hold(&self) {
        self.parked.lock().clear();
        self.gate.send_replace(false);
    }

    /// Park only subscribes that include `category`.
    pub fn hold_category(&self, category: EventCategory) {
        self.parked.lock().insert(category);
        self.gate.send_replace(false);
    }

    pub fn release(&self) {
        self.parked.lock().clear();
        self.gate.send_replace(true);
    }

    /// Pools currently watched on this transport.
    pub fn watched_pools(&self) -> Vec<String> {
        self.pools.lock().clone()
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn disconnects(&self) -> usize {
        self.disconnects.load(Ordering::SeqCst)
    }

    pub fn batches(&self) -> Vec<Vec<EventCategory>> {
        self.batches.lock().clone()
    }

    /// How many accepted subscribe calls included `category`.
    pub fn subscribes(&self, category: EventCategory) -> usize {
        self.batches
            .lock()
            .iter()
            .filter(|batch| batch.contains(&category))
            .count()
    }

    pub fn unsubscribes(&self, category: EventCategory) -> usize {
        self.unsubscribed
            .lock()
            .iter()
            .filter(|c| **c == category)
            .count()
    }

    /// Deliver a payload as if it came off the wire.
    pub fn emit(&self, category: EventCategory, payload: RawPayload) {
        let tx = self.events.lock().clone().expect("transport not connected");
        tx.send(TransportEvent::Data { category, payload })
            .expect("manager stopped listening");
    }

    /// Drop the connection from the far side.
    pub fn drop_connection(&self, reason: &str) {
        if let Some(tx) = self.events.lock().take() {
            let _ = tx.send(TransportEvent::Closed {
                reason: reason.to_string(),
            });
        }
    }
}

#[async_trait]
impl Transport for MockTransport {
    fn name(&self) -> &'static str {
        self.name
    }

    async fn connect(
        &self,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Result<(), TransportError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        if self.refuse_connect.load(Ordering::SeqCst) {
            return Err(TransportError::Closed(format!("{} refused", self.name)));
        }
        *self.events.lock() = Some(events);
        Ok(())
    }

    async fn subscribe(&self, categories: &[EventCategory]) -> Result<(), TransportError> {
        let parks = {
            let parked = self.parked.lock();
            parked.is_empty() || categories.iter().any(|c| parked.contains(c))
        };
        if parks {
            let mut gate = self.gate.subscribe();
            let _ = gate.wait_for(|open| *open).await;
        }
        // The connection may have been closed while waiting.
        if self.events.lock().is_none() {
            return Err(TransportError::NotConnected);
        }

        let rejected = {
            let rejected = self.rejected.lock();
            categories.iter().copied().find(|c| rejected.contains(c))
        };
        if let Some(category) = rejected {
            return Err(TransportError::SubscribeRejected {
                category,
                message: "schema not registered".into(),
            });
        }
        self.batches.lock().push(categories.to_vec());
        Ok(())
    }

    fn unsubscribe(&self, category: EventCategory) {
        self.unsubscribed.lock().push(category);
    }

    async fn disconnect(&self) {
        self.disconnects.fetch_add(1, Ordering::SeqCst);
        self.events.lock().take();
    }

    fn watch_pool(&self, pool_id: &str) {
        self.pools.lock().push(pool_id.to_string());
    }

    fn unwatch_pool(&self, pool_id: &str) {
        self.pools.lock().retain(|p| p != pool_id);
    }
}

pub struct Harness {
    pub primary: Arc<MockTransport>,
    pub relay: Arc<MockTransport>,
    pub manager: TransportManager,
    pub registry: SubscriptionRegistry,
    pub timer: ManualTimer,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_settings(ManagerSettings::default())
    }

    pub fn with_settings(settings: ManagerSettings) -> Self {
        let primary = MockTransport::new("primary");
        let relay = MockTransport::new("relay");
        let manager = TransportManager::new(primary.clone(), Some(relay.clone()), settings);
        let timer = ManualTimer::new();
        let registry = SubscriptionRegistry::new(manager.clone(), Arc::new(timer.clone()), GRACE);
        Self {
            primary,
            relay,
            manager,
            registry,
            timer,
        }
    }

    /// Let spawned subscribe tasks run until `category` leaves
    /// PendingSubscribe.
    pub async fn settle(&self, category: EventCategory) {
        for _ in 0..100 {
            if self.registry.category_state(category) != CategoryState::PendingSubscribe {
                return;
            }
            tokio::task::yield_now().await;
        }
        panic!("{category} still pending");
    }

    /// Give spawned tasks and the pump a few turns.
    pub async fn spin(&self) {
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
    }
}
