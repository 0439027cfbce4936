//! Lane lifecycle scenarios across the manager, the stores and the reporter.

use chrono::{DateTime, Duration, TimeZone, Utc};
use futures::future::join_all;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::sync::Arc;

use lane_engine::engine::{LaneManager, ManagerConfig, ManualClock, ResultEffect, StatusReporter};
use lane_engine::storage::{LaneStore, SqliteLaneStore};
use lane_engine::strategy::risk::SafetyConfig;
use lane_engine::strategy::stake::StakeCalculator;
use lane_engine::types::{
    Direction, LaneError, LaneStatus, Rejection, SettingsUpdate, TradeOutcome, TradeRequest,
};

use crate::flaky_store::FlakyStore;

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 2, 9, 0, 0).unwrap()
}

fn config() -> ManagerConfig {
    ManagerConfig {
        payout_rate: Some(dec!(0.85)),
        write_retry_limit: 2,
        ..Default::default()
    }
}

fn build(store: Arc<dyn LaneStore>, config: ManagerConfig) -> (Arc<LaneManager>, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::new(t0()));
    let manager = LaneManager::new(store, StakeCalculator::new(SafetyConfig::default()), config)
        .with_clock(clock.clone());
    (Arc::new(manager), clock)
}

fn signal(account: &str, trade_id: &str) -> TradeRequest {
    TradeRequest::new(account, "EURUSD", Direction::Call).with_trade_id(trade_id)
}

async fn lose(manager: &LaneManager, trade_id: &str, amount: Decimal) -> ResultEffect {
    manager
        .handle_result(trade_id, TradeOutcome::Loss, -amount)
        .await
        .unwrap()
}

fn lane_id_of(effect: &ResultEffect) -> String {
    match effect {
        ResultEffect::LaneOpened { lane_id, .. } => lane_id.clone(),
        other => panic!("expected a new lane, got {other:?}"),
    }
}

// ---------------------------------------------------------------------------
// SQLite end to end
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_sqlite_recovery_sequence_and_report() {
    let store: Arc<dyn LaneStore> = Arc::new(SqliteLaneStore::in_memory().await.unwrap());
    let (manager, clock) = build(Arc::clone(&store), config());

    let p1 = manager.assign_trade(signal("acct-1", "t1")).await.unwrap();
    assert_eq!(p1.amount, dec!(1.00));
    let lane_id = lane_id_of(&lose(&manager, "t1", p1.amount).await);

    clock.advance(Duration::minutes(1));
    let p2 = manager.assign_trade(signal("acct-1", "t2")).await.unwrap();
    assert_eq!(p2.amount, dec!(1.24));
    lose(&manager, "t2", p2.amount).await;

    clock.advance(Duration::minutes(1));
    let p3 = manager.assign_trade(signal("acct-1", "t3")).await.unwrap();
    assert_eq!(p3.amount, dec!(2.70));
    assert_eq!(p3.level, 2);
    let effect = manager
        .handle_result("t3", TradeOutcome::Win, dec!(2.30))
        .await
        .unwrap();
    assert_eq!(effect, ResultEffect::LaneCompleted { lane_id: lane_id.clone() });

    let lane = store.get_lane(&lane_id).await.unwrap().unwrap();
    assert_eq!(lane.status, LaneStatus::Completed);
    assert_eq!(lane.total_invested, dec!(4.94));
    assert_eq!(lane.trades.len(), 3);
    assert!(store.get_active_lanes("acct-1").await.unwrap().is_empty());

    let reporter = StatusReporter::new(Arc::clone(&store)).with_clock(clock.clone());
    let status = reporter.account_status("acct-1").await.unwrap();
    assert!(status.active_lanes.is_empty());
    assert_eq!(status.today.lanes_created, 1);
    assert_eq!(status.today.lanes_completed, 1);
    assert_eq!(status.today.wins, 1);
    assert_eq!(status.today.losses, 2);
    assert_eq!(status.today.amount_recovered, dec!(2.24));
}

#[tokio::test]
async fn test_reported_amount_matches_next_placement() {
    let store: Arc<dyn LaneStore> = Arc::new(SqliteLaneStore::in_memory().await.unwrap());
    let (manager, clock) = build(Arc::clone(&store), config());
    let reporter = StatusReporter::new(Arc::clone(&store)).with_clock(clock.clone());

    manager.assign_trade(signal("acct-1", "t1")).await.unwrap();
    lose(&manager, "t1", dec!(1.00)).await;

    for (trade_id, expected) in [("t2", dec!(1.24)), ("t3", dec!(2.70))] {
        let status = reporter.account_status("acct-1").await.unwrap();
        assert_eq!(status.active_lanes[0].amount, expected);
        let p = manager.assign_trade(signal("acct-1", trade_id)).await.unwrap();
        assert_eq!(p.amount, expected);
        lose(&manager, trade_id, p.amount).await;
    }
}

#[tokio::test]
async fn test_sqlite_settings_survive_manager_restart() {
    let store: Arc<dyn LaneStore> = Arc::new(SqliteLaneStore::in_memory().await.unwrap());
    let (manager, _) = build(Arc::clone(&store), config());
    manager
        .update_settings(
            "acct-1",
            SettingsUpdate {
                concurrent_trading_enabled: Some(true),
                max_concurrent_lanes: Some(2),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    drop(manager);

    let (manager, _) = build(Arc::clone(&store), config());
    manager.assign_trade(signal("acct-1", "t1")).await.unwrap();
    manager.assign_trade(signal("acct-1", "t2")).await.unwrap();
    let err = manager.assign_trade(signal("acct-1", "t3")).await.unwrap_err();
    assert_eq!(err, LaneError::Rejected(Rejection::ConcurrencyCap { limit: 2 }));
}

// ---------------------------------------------------------------------------
// Operator actions
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_operator_cancel_wins_over_late_result() {
    let store = Arc::new(FlakyStore::new());
    let (manager, _) = build(store.clone(), config());

    manager.assign_trade(signal("acct-1", "t1")).await.unwrap();
    let lane_id = lane_id_of(&lose(&manager, "t1", dec!(1)).await);

    let p2 = manager.assign_trade(signal("acct-1", "t2")).await.unwrap();
    assert_eq!(p2.lane_id.as_deref(), Some(lane_id.as_str()));

    let closed = manager
        .force_terminal(&lane_id, LaneStatus::Cancelled, "operator stop")
        .await
        .unwrap();
    assert_eq!(closed.status, LaneStatus::Cancelled);

    let effect = manager
        .handle_result("t2", TradeOutcome::Win, dec!(1.05))
        .await
        .unwrap();
    assert_eq!(effect, ResultEffect::StaleDiscarded { lane_id: lane_id.clone() });

    let lane = store.inner().get_lane(&lane_id).await.unwrap().unwrap();
    assert_eq!(lane.status, LaneStatus::Cancelled);
    assert_eq!(lane.close_reason.as_deref(), Some("operator stop"));
    assert_eq!(lane.trades.len(), 1);

    // Closing again is a no-op.
    let again = manager
        .force_terminal(&lane_id, LaneStatus::Completed, "late")
        .await
        .unwrap();
    assert_eq!(again.status, LaneStatus::Cancelled);
}

// ---------------------------------------------------------------------------
// Store outages
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_outage_writes_replayed_after_recovery() {
    let store = Arc::new(FlakyStore::new());
    let (manager, clock) = build(store.clone(), config());

    store.set_down(true);
    let p1 = manager.assign_trade(signal("acct-1", "t1")).await.unwrap();
    assert_eq!(p1.amount, dec!(1.00));
    let lane_id = lane_id_of(&lose(&manager, "t1", p1.amount).await);
    assert_eq!(manager.queued_writes("acct-1").await, 1);
    assert!(store.refused() > 0);
    assert_eq!(store.inner().lane_count().await, 0);

    store.set_down(false);
    clock.advance(Duration::seconds(1));
    assert_eq!(manager.flush_pending_writes().await, 1);
    assert_eq!(manager.queued_writes("acct-1").await, 0);

    let stored = store.inner().get_lane(&lane_id).await.unwrap().unwrap();
    assert_eq!(stored.current_level, 1);
    assert_eq!(stored.total_invested, dec!(1.00));

    // The replayed lane keeps recovering through the store.
    let p2 = manager.assign_trade(signal("acct-1", "t2")).await.unwrap();
    assert_eq!(p2.lane_id.as_deref(), Some(lane_id.as_str()));
    assert_eq!(p2.amount, dec!(1.24));
    lose(&manager, "t2", p2.amount).await;
    let stored = store.inner().get_lane(&lane_id).await.unwrap().unwrap();
    assert_eq!(stored.current_level, 2);
    assert_eq!(stored.total_invested, dec!(2.24));
}

#[tokio::test]
async fn test_degraded_account_recovers_when_store_returns() {
    let store = Arc::new(FlakyStore::new());
    let (manager, clock) = build(store.clone(), config());

    store.set_down(true);
    manager.assign_trade(signal("acct-1", "t1")).await.unwrap();
    lose(&manager, "t1", dec!(1)).await;
    for _ in 0..2 {
        manager.flush_pending_writes().await;
        clock.advance(Duration::minutes(1));
    }
    assert!(manager.is_degraded("acct-1").await);

    // Degraded: base trades only, losses open no lane.
    let p = manager.assign_trade(signal("acct-1", "t2")).await.unwrap();
    assert_eq!(p.lane_id, None);
    assert_eq!(lose(&manager, "t2", p.amount).await, ResultEffect::BaseLoss);

    store.set_down(false);
    let report = manager.run_maintenance().await;
    assert_eq!(report.flushed_writes, 1);
    assert!(!manager.is_degraded("acct-1").await);
    assert_eq!(store.inner().lane_count().await, 1);

    let p = manager.assign_trade(signal("acct-1", "t3")).await.unwrap();
    assert!(p.lane_id.is_some());
}

#[tokio::test]
async fn test_slow_store_does_not_block_signals() {
    let store = Arc::new(FlakyStore::new());
    let (manager, _) = build(
        store.clone(),
        ManagerConfig {
            store_timeout: std::time::Duration::from_millis(20),
            ..config()
        },
    );

    store.set_delay(std::time::Duration::from_millis(200));
    let p = manager.assign_trade(signal("acct-1", "t1")).await.unwrap();
    assert_eq!(p.lane_id, None);
    assert_eq!(p.amount, dec!(1.00));
}

#[tokio::test]
async fn test_slow_settlement_still_records_loss() {
    let store = Arc::new(FlakyStore::new());
    let (manager, _) = build(
        store.clone(),
        ManagerConfig {
            store_timeout: std::time::Duration::from_millis(300),
            operation_timeout: std::time::Duration::from_millis(350),
            ..config()
        },
    );

    manager.assign_trade(signal("acct-1", "t1")).await.unwrap();

    // Opening the lane takes two store calls, together longer than one
    // operation but each within the store timeout.
    store.set_delay(std::time::Duration::from_millis(200));
    let effect = lose(&manager, "t1", dec!(1.00)).await;
    let lane_id = lane_id_of(&effect);
    assert_eq!(effect, ResultEffect::LaneOpened { lane_id: lane_id.clone(), level: 1 });

    store.set_delay(std::time::Duration::ZERO);
    let stored = store.inner().get_lane(&lane_id).await.unwrap().unwrap();
    assert_eq!(stored.current_level, 1);
    assert_eq!(stored.total_invested, dec!(1.00));
    assert_eq!(stored.trades.len(), 1);

    let err = manager
        .handle_result("t1", TradeOutcome::Loss, dec!(-1.00))
        .await
        .unwrap_err();
    assert_eq!(err, LaneError::NotFound("t1".into()));

    let p = manager.assign_trade(signal("acct-1", "t2")).await.unwrap();
    assert_eq!(p.lane_id.as_deref(), Some(lane_id.as_str()));
    assert_eq!(p.amount, dec!(1.24));
}

// ---------------------------------------------------------------------------
// Concurrency
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_accounts_are_independent_under_load() {
    let store = Arc::new(FlakyStore::new());
    let (manager, _) = build(store.clone(), config());
    let accounts: Vec<String> = (0..8).map(|i| format!("acct-{i}")).collect();

    let placements = join_all(accounts.iter().map(|account| {
        let manager = Arc::clone(&manager);
        let req = signal(account, &format!("{account}-t1"));
        async move { manager.assign_trade(req).await }
    }))
    .await;
    assert!(placements.iter().all(|p| p.is_ok()));
    assert_eq!(manager.pending_count().await, accounts.len());

    let effects = join_all(accounts.iter().map(|account| {
        let manager = Arc::clone(&manager);
        let trade_id = format!("{account}-t1");
        async move { lose(&manager, &trade_id, dec!(1)).await }
    }))
    .await;

    let mut lane_ids: Vec<String> = effects.iter().map(lane_id_of).collect();
    lane_ids.sort();
    lane_ids.dedup();
    assert_eq!(lane_ids.len(), accounts.len());
    for account in &accounts {
        assert_eq!(store.inner().get_active_lanes(account).await.unwrap().len(), 1);
    }
    assert_eq!(manager.pending_count().await, 0);
}
