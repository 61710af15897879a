mod common;

use common::{Harness, GRACE};
use parking_lot::Mutex;
use poolwatch::filters;
use poolwatch::registry::CategoryState;
use poolwatch::transport::{ManagerSettings, TransportKind};
use poolwatch::{CanonicalRecord, ConnectionState, EventCategory, RawPayload, Subscription};
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn counter() -> (Arc<AtomicUsize>, impl Fn(&CanonicalRecord) + Send + Sync + 'static) {
    let hits = Arc::new(AtomicUsize::new(0));
    let inner = hits.clone();
    (hits, move |_: &CanonicalRecord| {
        inner.fetch_add(1, Ordering::SeqCst);
    })
}

fn payload(value: serde_json::Value) -> RawPayload {
    RawPayload::Object(value)
}

#[tokio::test]
async fn test_three_progress_subscribers_share_one_subscription() {
    let h = Harness::new();
    let log: Arc<Mutex<Vec<&'static str>>> = Arc::new(Mutex::new(Vec::new()));

    let _subs: Vec<Subscription> = ["cbA", "cbB", "cbC"]
        .into_iter()
        .map(|label| {
            let log = log.clone();
            filters::for_pool(&h.registry, EventCategory::PoolProgress, "42", move |_| {
                log.lock().push(label)
            })
        })
        .collect();
    h.settle(EventCategory::PoolProgress).await;

    assert_eq!(h.primary.subscribes(EventCategory::PoolProgress), 1);
    assert_eq!(h.registry.subscriber_count(EventCategory::PoolProgress), 3);
    assert_eq!(
        h.registry.category_state(EventCategory::PoolProgress),
        CategoryState::Active
    );

    h.primary.emit(
        EventCategory::PoolProgress,
        payload(json!({ "poolId": "42", "fillPercentage": 73 })),
    );
    // Another pool: filtered out by every subscriber.
    h.primary.emit(
        EventCategory::PoolProgress,
        payload(json!({ "poolId": "7", "fillPercentage": 10 })),
    );
    h.spin().await;

    assert_eq!(*log.lock(), vec!["cbA", "cbB", "cbC"]);
}

#[tokio::test]
async fn test_same_tick_subscribes_issue_once() {
    let h = Harness::new();
    let subs: Vec<Subscription> = (0..5)
        .map(|_| h.registry.subscribe(EventCategory::BetPlaced, |_| {}))
        .collect();
    assert_eq!(
        h.registry.category_state(EventCategory::BetPlaced),
        CategoryState::PendingSubscribe
    );
    h.settle(EventCategory::BetPlaced).await;

    assert_eq!(h.primary.subscribes(EventCategory::BetPlaced), 1);
    assert_eq!(h.primary.connects(), 1);
    assert_eq!(h.registry.subscriber_count(EventCategory::BetPlaced), subs.len());
}

#[tokio::test]
async fn test_returning_subscriber_within_grace_reuses_subscription() {
    let h = Harness::new();
    let first = h.registry.subscribe(EventCategory::BetPlaced, |_| {});
    h.settle(EventCategory::BetPlaced).await;

    first.unsubscribe();
    assert_eq!(
        h.registry.category_state(EventCategory::BetPlaced),
        CategoryState::GracePeriod
    );
    assert_eq!(h.timer.advance(Duration::from_secs(5)), 0);

    let (hits, cb) = counter();
    let _second = h.registry.subscribe(EventCategory::BetPlaced, cb);
    assert_eq!(
        h.registry.category_state(EventCategory::BetPlaced),
        CategoryState::Active
    );
    assert_eq!(h.timer.armed(), 0);

    h.timer.advance(GRACE * 2);
    assert_eq!(h.primary.subscribes(EventCategory::BetPlaced), 1);
    assert_eq!(h.primary.unsubscribes(EventCategory::BetPlaced), 0);

    h.primary.emit(
        EventCategory::BetPlaced,
        payload(json!({ "poolId": "1", "amount": "5" })),
    );
    h.spin().await;
    assert_eq!(hits.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_grace_expiry_tears_down_exactly_once() {
    let h = Harness::new();
    let sub = h.registry.subscribe(EventCategory::PoolSettled, |_| {});
    h.settle(EventCategory::PoolSettled).await;

    drop(sub);
    assert_eq!(h.timer.advance(GRACE - Duration::from_secs(1)), 0);
    assert_eq!(h.primary.unsubscribes(EventCategory::PoolSettled), 0);
    assert_eq!(h.timer.advance(Duration::from_secs(1)), 1);

    assert_eq!(h.primary.unsubscribes(EventCategory::PoolSettled), 1);
    assert_eq!(
        h.registry.category_state(EventCategory::PoolSettled),
        CategoryState::Unsubscribed
    );
    assert!(h.manager.known_categories().is_empty());

    // A later subscriber starts from scratch.
    let _again = h.registry.subscribe(EventCategory::PoolSettled, |_| {});
    h.settle(EventCategory::PoolSettled).await;
    assert_eq!(h.primary.subscribes(EventCategory::PoolSettled), 2);
    assert_eq!(h.primary.unsubscribes(EventCategory::PoolSettled), 1);
}

#[tokio::test]
async fn test_grace_expiring_mid_subscribe_retires_on_arrival() {
    let h = Harness::new();
    h.primary.hold();

    let sub = h.registry.subscribe(EventCategory::CycleResolved, |_| {});
    h.spin().await;
    assert_eq!(
        h.registry.category_state(EventCategory::CycleResolved),
        CategoryState::PendingSubscribe
    );

    drop(sub);
    assert_eq!(h.timer.advance(GRACE), 1);
    assert_eq!(
        h.registry.category_state(EventCategory::CycleResolved),
        CategoryState::PendingSubscribe
    );

    h.primary.release();
    h.settle(EventCategory::CycleResolved).await;

    assert_eq!(
        h.registry.category_state(EventCategory::CycleResolved),
        CategoryState::Unsubscribed
    );
    assert_eq!(h.primary.subscribes(EventCategory::CycleResolved), 1);
    assert_eq!(h.primary.unsubscribes(EventCategory::CycleResolved), 1);
}

#[tokio::test]
async fn test_panicking_callback_does_not_stop_siblings() {
    let h = Harness::new();
    let (before, cb_before) = counter();
    let (after, cb_after) = counter();

    let _a = h.registry.subscribe(EventCategory::SlipEvaluated, cb_before);
    let _b = h
        .registry
        .subscribe(EventCategory::SlipEvaluated, |_| panic!("subscriber bug"));
    let _c = h.registry.subscribe(EventCategory::SlipEvaluated, cb_after);
    h.settle(EventCategory::SlipEvaluated).await;

    h.primary.emit(EventCategory::SlipEvaluated, payload(json!({ "slipId": "3" })));
    h.spin().await;
    h.registry
        .dispatch(EventCategory::SlipEvaluated, &payload(json!({ "slipId": "4" })));

    assert_eq!(before.load(Ordering::SeqCst), 2);
    assert_eq!(after.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_callback_may_unsubscribe_itself_during_dispatch() {
    let h = Harness::new();
    let slot: Arc<Mutex<Option<Subscription>>> = Arc::new(Mutex::new(None));
    let (hits, cb) = counter();

    let inner = slot.clone();
    let sub = h.registry.subscribe(EventCategory::PrizeClaimed, move |record| {
        cb(record);
        inner.lock().take();
    });
    *slot.lock() = Some(sub);
    h.settle(EventCategory::PrizeClaimed).await;

    h.registry
        .dispatch(EventCategory::PrizeClaimed, &payload(json!({ "rank": 1 })));
    h.registry
        .dispatch(EventCategory::PrizeClaimed, &payload(json!({ "rank": 2 })));

    assert_eq!(hits.load(Ordering::SeqCst), 1);
    assert_eq!(
        h.registry.category_state(EventCategory::PrizeClaimed),
        CategoryState::GracePeriod
    );
}

#[tokio::test]
async fn test_rejected_subscribe_retries_on_relay() {
    let h = Harness::new();
    h.primary.reject(EventCategory::PoolSettled);

    let _bets = h.registry.subscribe(EventCategory::BetPlaced, |_| {});
    h.settle(EventCategory::BetPlaced).await;

    let (hits, cb) = counter();
    let _settled = h.registry.subscribe(EventCategory::PoolSettled, cb);
    h.settle(EventCategory::PoolSettled).await;

    assert_eq!(h.manager.active_transport(), Some(TransportKind::Fallback));
    assert_eq!(
        h.relay.batches(),
        vec![vec![EventCategory::BetPlaced], vec![EventCategory::PoolSettled]]
    );
    assert_eq!(
        h.registry.category_state(EventCategory::PoolSettled),
        CategoryState::Active
    );

    h.relay.emit(
        EventCategory::PoolSettled,
        payload(json!({ "poolId": "9", "creatorSideWon": true })),
    );
    h.spin().await;
    assert_eq!(hits.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_rejected_subscribe_without_fallback_gives_up() {
    let h = Harness::with_settings(ManagerSettings {
        fallback_enabled: true,
        fallback_on_subscribe_failure: false,
    });
    h.primary.reject(EventCategory::LiquidityAdded);

    let _sub = h.registry.subscribe(EventCategory::LiquidityAdded, |_| {});
    h.settle(EventCategory::LiquidityAdded).await;

    assert_eq!(
        h.registry.category_state(EventCategory::LiquidityAdded),
        CategoryState::Unsubscribed
    );
    // The callback is kept so a later subscribe or reconnect can retry.
    assert_eq!(h.registry.subscriber_count(EventCategory::LiquidityAdded), 1);
    assert_eq!(h.relay.connects(), 0);
}

#[tokio::test]
async fn test_reset_tears_down_everything() {
    let h = Harness::new();
    let live = h.registry.subscribe(EventCategory::BetPlaced, |_| {});
    let leaving = h.registry.subscribe(EventCategory::PoolCreated, |_| {});
    h.settle(EventCategory::BetPlaced).await;
    h.settle(EventCategory::PoolCreated).await;

    drop(leaving);
    assert_eq!(h.timer.armed(), 1);

    h.registry.reset();
    assert_eq!(h.timer.armed(), 0);
    assert_eq!(h.primary.unsubscribes(EventCategory::BetPlaced), 1);
    assert_eq!(h.primary.unsubscribes(EventCategory::PoolCreated), 1);
    for category in [EventCategory::BetPlaced, EventCategory::PoolCreated] {
        assert_eq!(h.registry.category_state(category), CategoryState::Unsubscribed);
    }

    // Guards outliving a reset are inert.
    drop(live);
    assert_eq!(h.timer.armed(), 0);
    assert_eq!(h.primary.unsubscribes(EventCategory::BetPlaced), 1);
}

#[tokio::test]
async fn test_reconnect_after_drop_resubscribes_live_categories() {
    let h = Harness::new();
    let _sub = h.registry.subscribe(EventCategory::ReputationChanged, |_| {});
    h.settle(EventCategory::ReputationChanged).await;

    h.primary.drop_connection("reset by peer");
    h.spin().await;
    assert_eq!(h.registry.connection_state(), ConnectionState::Failed);
    assert_eq!(h.manager.last_error().as_deref(), Some("reset by peer"));

    h.registry.reconnect().await.expect("reconnect");
    assert_eq!(
        h.registry.connection_state(),
        ConnectionState::Connected(TransportKind::Primary)
    );
    assert_eq!(h.primary.connects(), 2);
    assert_eq!(h.primary.subscribes(EventCategory::ReputationChanged), 2);
}

#[tokio::test]
async fn test_failed_subscribe_is_retried_after_reconnect() {
    let h = Harness::with_settings(ManagerSettings {
        fallback_enabled: false,
        fallback_on_subscribe_failure: false,
    });
    h.primary.refuse_connect(true);

    let _sub = h.registry.subscribe(EventCategory::PoolCreated, |_| {});
    h.settle(EventCategory::PoolCreated).await;
    assert_eq!(h.registry.connection_state(), ConnectionState::Failed);
    assert_eq!(
        h.registry.category_state(EventCategory::PoolCreated),
        CategoryState::Unsubscribed
    );

    h.primary.refuse_connect(false);
    h.registry.reconnect().await.expect("reconnect");
    h.settle(EventCategory::PoolCreated).await;

    assert_eq!(
        h.registry.category_state(EventCategory::PoolCreated),
        CategoryState::Active
    );
    assert_eq!(h.primary.subscribes(EventCategory::PoolCreated), 1);
}

#[tokio::test]
async fn test_disabled_fallback_is_never_used_for_subscribes() {
    let h = Harness::with_settings(ManagerSettings {
        fallback_enabled: false,
        fallback_on_subscribe_failure: true,
    });
    h.primary.refuse_connect(true);

    let _sub = h.registry.subscribe(EventCategory::BetPlaced, |_| {});
    h.settle(EventCategory::BetPlaced).await;

    assert_eq!(h.relay.connects(), 0);
    assert_eq!(h.manager.active_transport(), None);
    assert_eq!(h.registry.connection_state(), ConnectionState::Failed);
    assert_eq!(
        h.registry.category_state(EventCategory::BetPlaced),
        CategoryState::Unsubscribed
    );
}

#[tokio::test]
async fn test_in_flight_subscribe_follows_connection_to_relay() {
    let h = Harness::new();
    h.primary.hold_category(EventCategory::BetPlaced);
    h.primary.reject(EventCategory::PoolSettled);

    let (hits, cb) = counter();
    let _bets = h.registry.subscribe(EventCategory::BetPlaced, cb);
    let _settled = h.registry.subscribe(EventCategory::PoolSettled, |_| {});
    h.settle(EventCategory::PoolSettled).await;
    assert_eq!(h.manager.active_transport(), Some(TransportKind::Fallback));

    // The parked primary subscribe now finds its connection gone.
    h.primary.release();
    h.settle(EventCategory::BetPlaced).await;

    for category in [EventCategory::BetPlaced, EventCategory::PoolSettled] {
        assert_eq!(h.registry.category_state(category), CategoryState::Active);
    }
    assert_eq!(
        h.manager.known_categories(),
        vec![EventCategory::PoolSettled, EventCategory::BetPlaced]
    );

    h.relay.emit(EventCategory::BetPlaced, payload(json!({ "poolId": "3" })));
    h.spin().await;
    assert_eq!(hits.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_pool_filters_keep_pool_feed_open_while_subscribed() {
    let h = Harness::new();

    let typed = filters::pool_progress(&h.registry, "42", |_| {});
    let generic = filters::for_pool(&h.registry, EventCategory::PoolProgress, "42", |_| {});
    let _bets = filters::for_pool(&h.registry, EventCategory::BetPlaced, "42", |_| {});
    h.settle(EventCategory::PoolProgress).await;

    assert_eq!(h.manager.watched_pools(), vec!["42"]);
    assert_eq!(h.relay.watched_pools(), vec!["42"]);
    assert_eq!(h.primary.watched_pools(), vec!["42"]);

    drop(typed);
    assert_eq!(h.relay.watched_pools(), vec!["42"]);

    drop(generic);
    assert!(h.manager.watched_pools().is_empty());
    assert!(h.relay.watched_pools().is_empty());
}
