//! Canonical record shapes emitted by the payload decoder.
//!
//! Identifiers and amounts are strings (amounts are decimal token
//! quantities in whatever unit the source used), timestamps are unix
//! seconds, counts are integers.

use super::EventCategory;
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolCreated {
    pub pool_id: String,
    pub creator: String,
    /// Odds in basis points of the payout multiplier (e.g. 150 = 1.50x).
    pub odds: u64,
    pub creator_stake: String,
    pub event_start_time: u64,
    pub event_end_time: u64,
    pub category: String,
    pub league: String,
    pub home_team: String,
    pub away_team: String,
    pub title: String,
    pub timestamp: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolSettled {
    pub pool_id: String,
    pub result: String,
    pub creator_side_won: bool,
    pub timestamp: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BetPlaced {
    pub pool_id: String,
    pub bettor: String,
    pub amount: String,
    pub is_for_outcome: bool,
    pub timestamp: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolProgress {
    pub pool_id: String,
    pub fill_percentage: u64,
    pub total_bettor_stake: String,
    pub total_creator_side_stake: String,
    pub max_pool_size: String,
    pub participant_count: u64,
    pub bet_count: u64,
    pub timestamp: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReputationChanged {
    pub user: String,
    pub old_reputation: u64,
    pub new_reputation: u64,
    pub action: String,
    pub timestamp: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LiquidityAdded {
    pub pool_id: String,
    pub provider: String,
    pub amount: String,
    pub timestamp: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CycleResolved {
    pub cycle_id: String,
    pub prize_pool: String,
    pub total_slips: u64,
    pub timestamp: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SlipEvaluated {
    pub slip_id: String,
    pub cycle_id: String,
    pub player: String,
    pub is_winner: bool,
    pub correct_predictions: u64,
    pub total_predictions: u64,
    pub timestamp: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PrizeClaimed {
    pub cycle_id: String,
    pub player: String,
    pub rank: u64,
    pub amount: String,
    pub timestamp: u64,
}

/// One decoded event, independent of the wire format it arrived in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event")]
pub enum CanonicalRecord {
    PoolCreated(PoolCreated),
    PoolSettled(PoolSettled),
    BetPlaced(BetPlaced),
    PoolProgress(PoolProgress),
    ReputationChanged(ReputationChanged),
    LiquidityAdded(LiquidityAdded),
    CycleResolved(CycleResolved),
    SlipEvaluated(SlipEvaluated),
    PrizeClaimed(PrizeClaimed),
}

impl CanonicalRecord {
    pub fn category(&self) -> EventCategory {
        match self {
            Self::PoolCreated(_) => EventCategory::PoolCreated,
            Self::PoolSettled(_) => EventCategory::PoolSettled,
            Self::BetPlaced(_) => EventCategory::BetPlaced,
            Self::PoolProgress(_) => EventCategory::PoolProgress,
            Self::ReputationChanged(_) => EventCategory::ReputationChanged,
            Self::LiquidityAdded(_) => EventCategory::LiquidityAdded,
            Self::CycleResolved(_) => EventCategory::CycleResolved,
            Self::SlipEvaluated(_) => EventCategory::SlipEvaluated,
            Self::PrizeClaimed(_) => EventCategory::PrizeClaimed,
        }
    }

    /// The pool this event concerns, for pool-scoped categories.
    pub fn pool_id(&self) -> Option<&str> {
        match self {
            Self::PoolCreated(r) => Some(&r.pool_id),
            Self::PoolSettled(r) => Some(&r.pool_id),
            Self::BetPlaced(r) => Some(&r.pool_id),
            Self::PoolProgress(r) => Some(&r.pool_id),
            Self::LiquidityAdded(r) => Some(&r.pool_id),
            Self::ReputationChanged(_)
            | Self::CycleResolved(_)
            | Self::SlipEvaluated(_)
            | Self::PrizeClaimed(_) => None,
        }
    }

    /// The account that acted or was affected, if the event names one.
    pub fn account(&self) -> Option<&str> {
        match self {
            Self::PoolCreated(r) => Some(&r.creator),
            Self::BetPlaced(r) => Some(&r.bettor),
            Self::ReputationChanged(r) => Some(&r.user),
            Self::LiquidityAdded(r) => Some(&r.provider),
            Self::SlipEvaluated(r) => Some(&r.player),
            Self::PrizeClaimed(r) => Some(&r.player),
            Self::PoolSettled(_) | Self::PoolProgress(_) | Self::CycleResolved(_) => None,
        }
    }

    pub fn timestamp(&self) -> u64 {
        match self {
            Self::PoolCreated(r) => r.timestamp,
            Self::PoolSettled(r) => r.timestamp,
            Self::BetPlaced(r) => r.timestamp,
            Self::PoolProgress(r) => r.timestamp,
            Self::ReputationChanged(r) => r.timestamp,
            Self::LiquidityAdded(r) => r.timestamp,
            Self::CycleResolved(r) => r.timestamp,
            Self::SlipEvaluated(r) => r.timestamp,
            Self::PrizeClaimed(r) => r.timestamp,
        }
    }
}

fn short(addr: &str) -> &str {
    addr.get(..10).unwrap_or(addr)
}

impl std::fmt::Display for CanonicalRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::PoolCreated(r) => write!(
                f,
                "PoolCreated(pool={}, {} vs {}, odds={}, stake={})",
                r.pool_id, r.home_team, r.away_team, r.odds, r.creator_stake
            ),
            Self::PoolSettled(r) => write!(
                f,
                "PoolSettled(pool={}, result={}, creator_won={})",
                r.pool_id, r.result, r.creator_side_won
            ),
            Self::BetPlaced(r) => write!(
                f,
                "BetPlaced(pool={}, bettor={}, amount={}, for={})",
                r.pool_id,
                short(&r.bettor),
                r.amount,
                r.is_for_outcome
            ),
            Self::PoolProgress(r) => write!(
                f,
                "PoolProgress(pool={}, fill={}%, bettors={})",
                r.pool_id, r.fill_percentage, r.participant_count
            ),
            Self::ReputationChanged(r) => write!(
                f,
                "ReputationChanged(user={}, {}->{})",
                short(&r.user),
                r.old_reputation,
                r.new_reputation
            ),
            Self::LiquidityAdded(r) => write!(
                f,
                "LiquidityAdded(pool={}, provider={}, amount={})",
                r.pool_id,
                short(&r.provider),
                r.amount
            ),
            Self::CycleResolved(r) => write!(
                f,
                "CycleResolved(cycle={}, prize_pool={}, slips={})",
                r.cycle_id, r.prize_pool, r.total_slips
            ),
            Self::SlipEvaluated(r) => write!(
                f,
                "SlipEvaluated(slip={}, correct={}/{}, winner={})",
                r.slip_id, r.correct_predictions, r.total_predictions, r.is_winner
            ),
            Self::PrizeClaimed(r) => write!(
                f,
                "PrizeClaimed(cycle={}, player={}, rank={}, amount={})",
                r.cycle_id,
                short(&r.player),
                r.rank,
                r.amount
            ),
        }
    }
}
