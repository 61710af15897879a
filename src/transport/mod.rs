//! Transport abstraction and connection lifecycle.
//!
//! A [`Transport`] is one way of reaching the event source: the primary
//! schema-id stream or the fallback channel relay. The [`TransportManager`]
//! owns at most one live transport at a time and routes its deliveries to
//! the per-category sinks registered through `issue_subscribe`.

mod manager;

pub use manager::{
    DataSink, ErrorSink, ManagerSettings, PoolLease, TeardownHandle, TransportManager,
};

pub use crate::ws::TransportError;

use crate::decode::RawPayload;
use crate::events::EventCategory;
use async_trait::async_trait;
use std::fmt;
use tokio::sync::mpsc;

/// Which of the two transports a connection uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportKind {
    Primary,
    Fallback,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Primary => f.write_str("primary"),
            Self::Fallback => f.write_str("fallback"),
        }
    }
}

/// Process-wide connection state, mutated only by the manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Connecting(TransportKind),
    Connected(TransportKind),
    Failed,
}

impl ConnectionState {
    pub fn is_connected(self) -> bool {
        matches!(self, Self::Connected(_))
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => f.write_str("idle"),
            Self::Connecting(kind) => write!(f, "connecting({kind})"),
            Self::Connected(kind) => write!(f, "connected({kind})"),
            Self::Failed => f.write_str("failed"),
        }
    }
}

/// Everything a live transport reports back to the manager.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    Data {
        category: EventCategory,
        payload: RawPayload,
    },
    /// The source rejected or broke an established subscription.
    Error {
        category: EventCategory,
        message: String,
    },
    /// The connection dropped after opening. No retry is attempted.
    Closed { reason: String },
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// Short name for logs.
    fn name(&self) -> &'static str;

    /// Open the connection. Deliveries for this session go to `events`.
    async fn connect(
        &self,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Result<(), TransportError>;

    /// Subscribe to every category in `categories` as one batch.
    async fn subscribe(&self, categories: &[EventCategory]) -> Result<(), TransportError>;

    /// Stop delivery for `category`. Best-effort.
    fn unsubscribe(&self, category: EventCategory);

    /// Close the connection and forget all subscriptions.
    async fn disconnect(&self);

    /// Carry progress for `pool_id` from now on, including across
    /// reconnects. Transports without per-pool feeds ignore this.
    fn watch_pool(&self, _pool_id: &str) {}

    fn unwatch_pool(&self, _pool_id: &str) {}
}
