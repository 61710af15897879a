//! Real-time prediction-pool event multiplexer.
//!
//! Many consumers subscribe to event categories through one
//! [`SubscriptionRegistry`]; each category holds at most one underlying
//! subscription on the primary stream or the relay fallback, and every
//! payload is decoded once into a [`CanonicalRecord`].

pub mod config;
pub mod decode;
pub mod events;
pub mod filters;
pub mod registry;
pub mod transport;
pub mod ws;

pub use decode::{decode, RawPayload};
pub use events::{CanonicalRecord, EventCategory};
pub use registry::{CategoryState, Subscription, SubscriptionRegistry};
pub use transport::{ConnectionState, TransportError, TransportKind, TransportManager};
