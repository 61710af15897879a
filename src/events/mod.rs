//! Event categories and the canonical records the decoder produces.
//!
//! Every category maps 1:1 to a schema id on the primary stream and to a
//! channel name on the fallback relay. Both mappings are exhaustive
//! `match`es, so adding a category without wiring it fails to compile.

mod types;

pub use types::{
    BetPlaced, CanonicalRecord, CycleResolved, LiquidityAdded, PoolCreated, PoolProgress,
    PoolSettled, PrizeClaimed, ReputationChanged, SlipEvaluated,
};

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// The real-time event kinds multiplexed by the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String")]
pub enum EventCategory {
    PoolCreated,
    PoolSettled,
    BetPlaced,
    PoolProgress,
    ReputationChanged,
    LiquidityAdded,
    CycleResolved,
    SlipEvaluated,
    PrizeClaimed,
}

impl EventCategory {
    pub const ALL: [EventCategory; 9] = [
        EventCategory::PoolCreated,
        EventCategory::PoolSettled,
        EventCategory::BetPlaced,
        EventCategory::PoolProgress,
        EventCategory::ReputationChanged,
        EventCategory::LiquidityAdded,
        EventCategory::CycleResolved,
        EventCategory::SlipEvaluated,
        EventCategory::PrizeClaimed,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Self::PoolCreated => "PoolCreated",
            Self::PoolSettled => "PoolSettled",
            Self::BetPlaced => "BetPlaced",
            Self::PoolProgress => "PoolProgress",
            Self::ReputationChanged => "ReputationChanged",
            Self::LiquidityAdded => "LiquidityAdded",
            Self::CycleResolved => "CycleResolved",
            Self::SlipEvaluated => "SlipEvaluated",
            Self::PrizeClaimed => "PrizeClaimed",
        }
    }

    /// Channel name on the fallback relay. For pool progress this is the
    /// aggregate feed, used while no single pool is watched.
    pub fn relay_channel(self) -> &'static str {
        match self {
            Self::PoolCreated => "pools:created",
            Self::PoolSettled => "pools:settled",
            Self::BetPlaced => "bets",
            Self::PoolProgress => "pools:progress",
            Self::ReputationChanged => "reputation",
            Self::LiquidityAdded => "liquidity",
            Self::CycleResolved => "cycles:resolved",
            Self::SlipEvaluated => "slips:evaluated",
            Self::PrizeClaimed => "prizes:claimed",
        }
    }

    /// Resolve a relay channel back to its category.
    ///
    /// Pool progress is also published on per-pool channels of the form
    /// `pool:<id>:progress`.
    pub fn from_channel(channel: &str) -> Option<Self> {
        if let Some(category) = Self::ALL.into_iter().find(|c| c.relay_channel() == channel) {
            return Some(category);
        }
        let id = channel.strip_prefix("pool:")?.strip_suffix(":progress")?;
        (!id.is_empty() && !id.contains(':')).then_some(Self::PoolProgress)
    }

    /// Per-pool progress channel for `pool_id`.
    pub fn pool_progress_channel(pool_id: &str) -> String {
        format!("pool:{pool_id}:progress")
    }

    /// Hex schema id used on the primary stream.
    pub fn schema_id(self) -> String {
        crate::decode::schema_id(self)
    }
}

impl fmt::Display for EventCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownCategory(pub String);

impl fmt::Display for UnknownCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown event category: {}", self.0)
    }
}

impl std::error::Error for UnknownCategory {}

impl FromStr for EventCategory {
    type Err = UnknownCategory;

    /// Accepts `PoolProgress`, `pool_progress` or `pool-progress`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted: String = s
            .chars()
            .filter(|c| *c != '_' && *c != '-')
            .collect::<String>()
            .to_ascii_lowercase();
        Self::ALL
            .into_iter()
            .find(|c| c.name().to_ascii_lowercase() == wanted)
            .ok_or_else(|| UnknownCategory(s.to_string()))
    }
}

impl TryFrom<String> for EventCategory {
    type Error = UnknownCategory;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}
