mod common;

use common::{Harness, MockTransport};
use poolwatch::transport::{ManagerSettings, TransportKind, TransportManager};
use poolwatch::{CanonicalRecord, ConnectionState, EventCategory, RawPayload};
use serde_json::json;
use std::sync::Arc;
use tokio::sync::broadcast;

fn drain(states: &mut broadcast::Receiver<ConnectionState>) -> Vec<ConnectionState> {
    let mut seen = Vec::new();
    while let Ok(state) = states.try_recv() {
        seen.push(state);
    }
    seen
}

#[tokio::test]
async fn test_reconnect_moves_known_categories_to_relay_in_one_batch() {
    let h = Harness::new();
    let _settled = h.registry.subscribe(EventCategory::PoolSettled, |_| {});
    let _bets = h.registry.subscribe(EventCategory::BetPlaced, |_| {});
    h.settle(EventCategory::PoolSettled).await;
    h.settle(EventCategory::BetPlaced).await;

    let mut states = h.manager.state_changes();
    h.primary.refuse_connect(true);
    h.registry.reconnect().await.expect("fallback should come up");

    assert_eq!(
        drain(&mut states),
        vec![
            ConnectionState::Idle,
            ConnectionState::Connecting(TransportKind::Primary),
            ConnectionState::Failed,
            ConnectionState::Connecting(TransportKind::Fallback),
            ConnectionState::Connected(TransportKind::Fallback),
        ]
    );
    assert_eq!(
        h.relay.batches(),
        vec![vec![EventCategory::PoolSettled, EventCategory::BetPlaced]]
    );
    assert_eq!(h.primary.disconnects(), 1);
    assert_eq!(h.manager.active_transport(), Some(TransportKind::Fallback));
    assert!(h
        .manager
        .last_error()
        .is_some_and(|e| e.contains("primary refused")));
}

#[tokio::test]
async fn test_initialize_falls_back_when_primary_unreachable() {
    let primary = MockTransport::new("primary");
    let relay = MockTransport::new("relay");
    primary.refuse_connect(true);
    let manager = TransportManager::new(
        primary.clone(),
        Some(relay.clone()),
        ManagerSettings::default(),
    );
    let mut states = manager.state_changes();

    manager.initialize().await.expect("relay should connect");

    assert_eq!(
        drain(&mut states),
        vec![
            ConnectionState::Connecting(TransportKind::Primary),
            ConnectionState::Failed,
            ConnectionState::Connecting(TransportKind::Fallback),
            ConnectionState::Connected(TransportKind::Fallback),
        ]
    );
    assert_eq!(relay.connects(), 1);
    assert!(relay.batches().is_empty());
}

#[tokio::test]
async fn test_no_fallback_configured_fails() {
    let primary = MockTransport::new("primary");
    primary.refuse_connect(true);
    let manager = TransportManager::new(primary.clone(), None, ManagerSettings::default());

    assert!(manager.initialize().await.is_err());
    assert_eq!(manager.connection_state(), ConnectionState::Failed);
    assert!(!manager.can_fall_back());
}

#[tokio::test]
async fn test_concurrent_initialize_connects_once() {
    let primary = MockTransport::new("primary");
    let manager = TransportManager::new(primary.clone(), None, ManagerSettings::default());

    let (a, b, c) = tokio::join!(manager.initialize(), manager.initialize(), manager.initialize());
    assert!(a.is_ok() && b.is_ok() && c.is_ok());
    assert_eq!(primary.connects(), 1);
}

#[tokio::test]
async fn test_relay_deliveries_are_decoded_for_subscribers() {
    let h = Harness::new();
    h.primary.refuse_connect(true);
    let seen: Arc<parking_lot::Mutex<Vec<CanonicalRecord>>> = Arc::default();

    let sink = seen.clone();
    let _sub = h.registry.subscribe(EventCategory::BetPlaced, move |record| {
        sink.lock().push(record.clone())
    });
    h.settle(EventCategory::BetPlaced).await;
    assert_eq!(h.manager.active_transport(), Some(TransportKind::Fallback));

    h.relay.emit(
        EventCategory::BetPlaced,
        RawPayload::Object(json!({
            "args": { "poolId": "12", "bettor": "0x00000000000000000000000000000000000000aa" },
            "amount": "2500000000000000000",
            "isForOutcome": true,
        })),
    );
    h.spin().await;

    let seen = seen.lock();
    assert_eq!(seen.len(), 1);
    match &seen[0] {
        CanonicalRecord::BetPlaced(bet) => {
            assert_eq!(bet.pool_id, "12");
            assert_eq!(bet.amount, "2500000000000000000");
            assert!(bet.is_for_outcome);
            assert!(bet.bettor.eq_ignore_ascii_case("0x00000000000000000000000000000000000000aa"));
        }
        other => panic!("unexpected record: {other}"),
    }
}

#[tokio::test]
async fn test_shutdown_returns_to_idle() {
    let h = Harness::new();
    h.manager.initialize().await.expect("connect");
    h.manager.shutdown().await;

    assert_eq!(h.manager.connection_state(), ConnectionState::Idle);
    assert_eq!(h.manager.active_transport(), None);
    assert_eq!(h.primary.disconnects(), 1);
}
