//! Per-category field tables and record builders.

use super::abi::AbiType as A;
use super::fields::{field, FieldKind as K, FieldSet, FieldSpec};
use crate::events::{
    BetPlaced, CanonicalRecord, CycleResolved, EventCategory, LiquidityAdded, PoolCreated,
    PoolProgress, PoolSettled, PrizeClaimed, ReputationChanged, SlipEvaluated,
};

// ─── Field tables (ABI parameter order) ─────────────────────────────────────

const POOL_CREATED: &[FieldSpec] = &[
    field("poolId", A::Uint256, K::Id, &["id"]),
    field("creator", A::Address, K::Address, &[]),
    field("odds", A::Uint256, K::Count, &[]),
    field("creatorStake", A::Uint256, K::Amount, &["stake"]),
    field("eventStartTime", A::Uint256, K::Timestamp, &["startTime"]),
    field("eventEndTime", A::Uint256, K::Timestamp, &["endTime"]),
    field("category", A::Bytes32, K::Text, &[]),
    field("league", A::Bytes32, K::Text, &[]),
    field("homeTeam", A::Bytes32, K::Text, &["home"]),
    field("awayTeam", A::Bytes32, K::Text, &["away"]),
    field("title", A::String, K::Text, &["marketTitle"]),
    field("timestamp", A::Uint256, K::Timestamp, &["blockTimestamp"]),
];

const POOL_SETTLED: &[FieldSpec] = &[
    field("poolId", A::Uint256, K::Id, &["id"]),
    field("result", A::Bytes32, K::Text, &["outcome"]),
    field("creatorSideWon", A::Bool, K::Flag, &[]),
    field("timestamp", A::Uint256, K::Timestamp, &["blockTimestamp"]),
];

const BET_PLACED: &[FieldSpec] = &[
    field("poolId", A::Uint256, K::Id, &["id"]),
    field("bettor", A::Address, K::Address, &["user", "player"]),
    field("amount", A::Uint256, K::Amount, &["stake"]),
    field("isForOutcome", A::Bool, K::Flag, &["side"]),
    field("timestamp", A::Uint256, K::Timestamp, &["blockTimestamp"]),
];

const POOL_PROGRESS: &[FieldSpec] = &[
    field("poolId", A::Uint256, K::Id, &["id"]),
    field("fillPercentage", A::Uint256, K::Count, &["fill", "fillPercent"]),
    field("totalBettorStake", A::Uint256, K::Amount, &[]),
    field("totalCreatorSideStake", A::Uint256, K::Amount, &[]),
    field("maxPoolSize", A::Uint256, K::Amount, &[]),
    field("participantCount", A::Uint256, K::Count, &["participants"]),
    field("betCount", A::Uint256, K::Count, &["bets"]),
    field("timestamp", A::Uint256, K::Timestamp, &["blockTimestamp"]),
];

const REPUTATION_CHANGED: &[FieldSpec] = &[
    field("user", A::Address, K::Address, &["account"]),
    field("oldReputation", A::Uint256, K::Count, &["previousReputation"]),
    field("newReputation", A::Uint256, K::Count, &["reputation"]),
    field("action", A::Bytes32, K::Text, &["reason"]),
    field("timestamp", A::Uint256, K::Timestamp, &["blockTimestamp"]),
];

const LIQUIDITY_ADDED: &[FieldSpec] = &[
    field("poolId", A::Uint256, K::Id, &["id"]),
    field("provider", A::Address, K::Address, &["lp", "user"]),
    field("amount", A::Uint256, K::Amount, &[]),
    field("timestamp", A::Uint256, K::Timestamp, &["blockTimestamp"]),
];

const CYCLE_RESOLVED: &[FieldSpec] = &[
    field("cycleId", A::Uint256, K::Id, &["id"]),
    field("prizePool", A::Uint256, K::Amount, &[]),
    field("totalSlips", A::Uint256, K::Count, &["slipCount"]),
    field("timestamp", A::Uint256, K::Timestamp, &["blockTimestamp"]),
];

const SLIP_EVALUATED: &[FieldSpec] = &[
    field("slipId", A::Uint256, K::Id, &["id"]),
    field("cycleId", A::Uint256, K::Id, &[]),
    field("player", A::Address, K::Address, &["user"]),
    field("isWinner", A::Bool, K::Flag, &["won"]),
    field("correctPredictions", A::Uint256, K::Count, &["correctCount"]),
    field("totalPredictions", A::Uint256, K::Count, &[]),
    field("timestamp", A::Uint256, K::Timestamp, &["blockTimestamp"]),
];

const PRIZE_CLAIMED: &[FieldSpec] = &[
    field("cycleId", A::Uint256, K::Id, &[]),
    field("player", A::Address, K::Address, &["user"]),
    field("rank", A::Uint256, K::Count, &[]),
    field("amount", A::Uint256, K::Amount, &["prize"]),
    field("timestamp", A::Uint256, K::Timestamp, &["blockTimestamp"]),
];

pub fn fields(category: EventCategory) -> &'static [FieldSpec] {
    match category {
        EventCategory::PoolCreated => POOL_CREATED,
        EventCategory::PoolSettled => POOL_SETTLED,
        EventCategory::BetPlaced => BET_PLACED,
        EventCategory::PoolProgress => POOL_PROGRESS,
        EventCategory::ReputationChanged => REPUTATION_CHANGED,
        EventCategory::LiquidityAdded => LIQUIDITY_ADDED,
        EventCategory::CycleResolved => CYCLE_RESOLVED,
        EventCategory::SlipEvaluated => SLIP_EVALUATED,
        EventCategory::PrizeClaimed => PRIZE_CLAIMED,
    }
}

/// `PoolCreated(uint256 poolId,address creator,...)`
pub fn signature(category: EventCategory) -> String {
    let params: Vec<String> = fields(category)
        .iter()
        .map(|f| format!("{} {}", f.abi.as_str(), f.name))
        .collect();
    format!("{}({})", category.name(), params.join(","))
}

pub fn build(category: EventCategory, f: &FieldSet) -> CanonicalRecord {
    match category {
        EventCategory::PoolCreated => CanonicalRecord::PoolCreated(PoolCreated {
            pool_id: f.str("poolId"),
            creator: f.str("creator"),
            odds: f.num("odds"),
            creator_stake: f.str("creatorStake"),
            event_start_time: f.num("eventStartTime"),
            event_end_time: f.num("eventEndTime"),
            category: f.str("category"),
            league: f.str("league"),
            home_team: f.str("homeTeam"),
            away_team: f.str("awayTeam"),
            title: f.str("title"),
            timestamp: f.num("timestamp"),
        }),
        EventCategory::PoolSettled => CanonicalRecord::PoolSettled(PoolSettled {
            pool_id: f.str("poolId"),
            result: f.str("result"),
            creator_side_won: f.flag("creatorSideWon"),
            timestamp: f.num("timestamp"),
        }),
        EventCategory::BetPlaced => CanonicalRecord::BetPlaced(BetPlaced {
            pool_id: f.str("poolId"),
            bettor: f.str("bettor"),
            amount: f.str("amount"),
            is_for_outcome: f.flag("isForOutcome"),
            timestamp: f.num("timestamp"),
        }),
        EventCategory::PoolProgress => CanonicalRecord::PoolProgress(PoolProgress {
            pool_id: f.str("poolId"),
            fill_percentage: f.num("fillPercentage"),
            total_bettor_stake: f.str("totalBettorStake"),
            total_creator_side_stake: f.str("totalCreatorSideStake"),
            max_pool_size: f.str("maxPoolSize"),
            participant_count: f.num("participantCount"),
            bet_count: f.num("betCount"),
            timestamp: f.num("timestamp"),
        }),
        EventCategory::ReputationChanged => CanonicalRecord::ReputationChanged(ReputationChanged {
            user: f.str("user"),
            old_reputation: f.num("oldReputation"),
            new_reputation: f.num("newReputation"),
            action: f.str("action"),
            timestamp: f.num("timestamp"),
        }),
        EventCategory::LiquidityAdded => CanonicalRecord::LiquidityAdded(LiquidityAdded {
            pool_id: f.str("poolId"),
            provider: f.str("provider"),
            amount: f.str("amount"),
            timestamp: f.num("timestamp"),
        }),
        EventCategory::CycleResolved => CanonicalRecord::CycleResolved(CycleResolved {
            cycle_id: f.str("cycleId"),
            prize_pool: f.str("prizePool"),
            total_slips: f.num("totalSlips"),
            timestamp: f.num("timestamp"),
        }),
        EventCategory::SlipEvaluated => CanonicalRecord::SlipEvaluated(SlipEvaluated {
            slip_id: f.str("slipId"),
            cycle_id: f.str("cycleId"),
            player: f.str("player"),
            is_winner: f.flag("isWinner"),
            correct_predictions: f.num("correctPredictions"),
            total_predictions: f.num("totalPredictions"),
            timestamp: f.num("timestamp"),
        }),
        EventCategory::PrizeClaimed => CanonicalRecord::PrizeClaimed(PrizeClaimed {
            cycle_id: f.str("cycleId"),
            player: f.str("player"),
            rank: f.num("rank"),
            amount: f.str("amount"),
            timestamp: f.num("timestamp"),
        }),
    }
}
