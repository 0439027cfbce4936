//! Fault-injecting lane store for integration testing.
//!
//! Wraps `MemoryLaneStore` and can be switched "down" (every call fails with
//! `PersistenceUnavailable`) or slowed by a fixed delay, so outage and
//! recovery paths run without a real database.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use lane_engine::storage::{LaneStore, MemoryLaneStore};
use lane_engine::types::{
    AccountSettings, Lane, LaneError, LaneStatistics, LaneStatus, LaneTrade, NewLane,
    SettingsUpdate,
};

pub struct FlakyStore {
    inner: MemoryLaneStore,
    down: AtomicBool,
    delay_ms: AtomicU64,
    /// Calls refused while down.
    refused: AtomicUsize,
}

impl FlakyStore {
    pub fn new() -> Self {
        Self {
            inner: MemoryLaneStore::new(),
            down: AtomicBool::new(false),
            delay_ms: AtomicU64::new(0),
            refused: AtomicUsize::new(0),
        }
    }

    pub fn set_down(&self, down: bool) {
        self.down.store(down, Ordering::SeqCst);
    }

    pub fn set_delay(&self, delay: Duration) {
        self.delay_ms.store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn refused(&self) -> usize {
        self.refused.load(Ordering::SeqCst)
    }

    pub fn inner(&self) -> &MemoryLaneStore {
        &self.inner
    }

    async fn gate(&self) -> Result<(), LaneError> {
        let delay = self.delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        if self.down.load(Ordering::SeqCst) {
            self.refused.fetch_add(1, Ordering::SeqCst);
            return Err(LaneError::PersistenceUnavailable("store offline".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl LaneStore for FlakyStore {
    async fn create_lane(&self, new_lane: NewLane) -> Result<Lane, LaneError> {
        self.gate().await?;
        self.inner.create_lane(new_lane).await
    }

    async fn get_lane(&self, lane_id: &str) -> Result<Option<Lane>, LaneError> {
        self.gate().await?;
        self.inner.get_lane(lane_id).await
    }

    async fn get_active_lanes(&self, account: &str) -> Result<Vec<Lane>, LaneError> {
        self.gate().await?;
        self.inner.get_active_lanes(account).await
    }

    async fn lanes_touched_since(
        &self,
        account: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<Lane>, LaneError> {
        self.gate().await?;
        self.inner.lanes_touched_since(account, since).await
    }

    async fn count_lanes_created_since(
        &self,
        account: &str,
        since: DateTime<Utc>,
    ) -> Result<u32, LaneError> {
        self.gate().await?;
        self.inner.count_lanes_created_since(account, since).await
    }

    async fn append_trade_to_lane(
        &self,
        lane_id: &str,
        trade: LaneTrade,
        next_amount: Decimal,
    ) -> Result<Lane, LaneError> {
        self.gate().await?;
        self.inner.append_trade_to_lane(lane_id, trade, next_amount).await
    }

    async fn set_terminal(
        &self,
        lane_id: &str,
        status: LaneStatus,
        reason: &str,
        at: DateTime<Utc>,
    ) -> Result<Lane, LaneError> {
        self.gate().await?;
        self.inner.set_terminal(lane_id, status, reason, at).await
    }

    async fn put_lane(&self, lane: &Lane) -> Result<bool, LaneError> {
        self.gate().await?;
        self.inner.put_lane(lane).await
    }

    async fn get_settings(&self, account: &str) -> Result<AccountSettings, LaneError> {
        self.gate().await?;
        self.inner.get_settings(account).await
    }

    async fn upsert_settings(
        &self,
        account: &str,
        update: &SettingsUpdate,
    ) -> Result<AccountSettings, LaneError> {
        self.gate().await?;
        self.inner.upsert_settings(account, update).await
    }

    async fn list_accounts(&self) -> Result<Vec<String>, LaneError> {
        self.gate().await?;
        self.inner.list_accounts().await
    }

    async fn lane_statistics(
        &self,
        account: &str,
        since: DateTime<Utc>,
    ) -> Result<LaneStatistics, LaneError> {
        self.gate().await?;
        self.inner.lane_statistics(account, since).await
    }

    async fn purge_closed_lanes(&self, closed_before: DateTime<Utc>) -> Result<u32, LaneError> {
        self.gate().await?;
        self.inner.purge_closed_lanes(closed_before).await
    }

    async fn health_check(&self) -> Result<(), LaneError> {
        self.gate().await
    }
}
