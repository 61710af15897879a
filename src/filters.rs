//! Narrowing wrappers over [`SubscriptionRegistry::subscribe`].
//!
//! These hold no state of their own; the predicate lives in the callback.

use crate::events::{CanonicalRecord, EventCategory, PoolProgress};
use crate::registry::{Subscription, SubscriptionRegistry};

/// Records of `category` that concern `pool_id`. Categories without a pool
/// id never match. For pool progress the pool's own feed is kept open for
/// as long as the subscription lives.
pub fn for_pool<F>(
    registry: &SubscriptionRegistry,
    category: EventCategory,
    pool_id: impl Into<String>,
    callback: F,
) -> Subscription
where
    F: Fn(&CanonicalRecord) + Send + Sync + 'static,
{
    let pool_id = pool_id.into();
    let lease = (category == EventCategory::PoolProgress)
        .then(|| registry.transport().watch_pool(&pool_id));
    let subscription = registry.subscribe(category, move |record| {
        if record.pool_id() == Some(pool_id.as_str()) {
            callback(record);
        }
    });
    match lease {
        Some(lease) => subscription.with_lease(lease),
        None => subscription,
    }
}

/// Records of `category` naming `account`, compared case-insensitively so
/// checksummed and lowercase addresses both match.
pub fn for_account<F>(
    registry: &SubscriptionRegistry,
    category: EventCategory,
    account: impl Into<String>,
    callback: F,
) -> Subscription
where
    F: Fn(&CanonicalRecord) + Send + Sync + 'static,
{
    let account = account.into();
    registry.subscribe(category, move |record| {
        if record
            .account()
            .is_some_and(|a| a.eq_ignore_ascii_case(&account))
        {
            callback(record);
        }
    })
}

/// Typed progress updates for one pool.
pub fn pool_progress<F>(
    registry: &SubscriptionRegistry,
    pool_id: impl Into<String>,
    callback: F,
) -> Subscription
where
    F: Fn(&PoolProgress) + Send + Sync + 'static,
{
    let pool_id = pool_id.into();
    let lease = registry.transport().watch_pool(&pool_id);
    registry
        .subscribe(EventCategory::PoolProgress, move |record| {
            if let CanonicalRecord::PoolProgress(progress) = record {
                if progress.pool_id == pool_id {
                    callback(progress);
                }
            }
        })
        .with_lease(lease)
}
