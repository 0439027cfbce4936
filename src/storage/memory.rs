//! In-memory `LaneStore`.
//!
//! Holds everything behind a single `RwLock`, so every mutation is atomic
//! with respect to other callers. Used by tests and by dry runs where no
//! database is configured.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::collections::HashMap;
use tokio::sync::RwLock;

use super::LaneStore;
use crate::types::{
    AccountSettings, Lane, LaneError, LaneStatistics, LaneStatus, LaneTrade, NewLane,
    SettingsUpdate,
};

#[derive(Default)]
struct Tables {
    lanes: HashMap<String, Lane>,
    settings: HashMap<String, AccountSettings>,
}

#[derive(Default)]
pub struct MemoryLaneStore {
    tables: RwLock<Tables>,
}

impl MemoryLaneStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of lanes ever stored, in any status.
    pub async fn lane_count(&self) -> usize {
        self.tables.read().await.lanes.len()
    }
}

fn sorted(mut lanes: Vec<Lane>) -> Vec<Lane> {
    lanes.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.lane_id.cmp(&b.lane_id)));
    lanes
}

#[async_trait]
impl LaneStore for MemoryLaneStore {
    async fn create_lane(&self, new_lane: NewLane) -> Result<Lane, LaneError> {
        let lane = Lane::open(new_lane);
        let mut tables = self.tables.write().await;
        if tables.lanes.contains_key(&lane.lane_id) {
            return Err(LaneError::Storage(format!("Lane {} already exists", lane.lane_id)));
        }
        tables.lanes.insert(lane.lane_id.clone(), lane.clone());
        Ok(lane)
    }

    async fn get_lane(&self, lane_id: &str) -> Result<Option<Lane>, LaneError> {
        Ok(self.tables.read().await.lanes.get(lane_id).cloned())
    }

    async fn get_active_lanes(&self, account: &str) -> Result<Vec<Lane>, LaneError> {
        let tables = self.tables.read().await;
        Ok(sorted(
            tables
                .lanes
                .values()
                .filter(|l| l.account == account && l.is_active())
                .cloned()
                .collect(),
        ))
    }

    async fn lanes_touched_since(
        &self,
        account: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<Lane>, LaneError> {
        let tables = self.tables.read().await;
        Ok(sorted(
            tables
                .lanes
                .values()
                .filter(|l| l.account == account && (l.created_at >= since || l.updated_at >= since))
                .cloned()
                .collect(),
        ))
    }

    async fn count_lanes_created_since(
        &self,
        account: &str,
        since: DateTime<Utc>,
    ) -> Result<u32, LaneError> {
        let tables = self.tables.read().await;
        let count = tables
            .lanes
            .values()
            .filter(|l| l.account == account && l.created_at >= since)
            .count();
        Ok(count as u32)
    }

    async fn append_trade_to_lane(
        &self,
        lane_id: &str,
        trade: LaneTrade,
        next_amount: Decimal,
    ) -> Result<Lane, LaneError> {
        let mut tables = self.tables.write().await;
        let stored = tables
            .lanes
            .get_mut(lane_id)
            .ok_or_else(|| LaneError::LaneNotFound(lane_id.to_string()))?;
        // Mutate a copy so a rejected trade leaves the stored lane untouched.
        let mut lane = stored.clone();
        lane.record_trade(trade)?;
        lane.set_projected_stake(next_amount);
        *stored = lane.clone();
        Ok(lane)
    }

    async fn set_terminal(
        &self,
        lane_id: &str,
        status: LaneStatus,
        reason: &str,
        at: DateTime<Utc>,
    ) -> Result<Lane, LaneError> {
        let mut tables = self.tables.write().await;
        let lane = tables
            .lanes
            .get_mut(lane_id)
            .ok_or_else(|| LaneError::LaneNotFound(lane_id.to_string()))?;
        lane.terminate(status, reason, at)?;
        Ok(lane.clone())
    }

    async fn put_lane(&self, lane: &Lane) -> Result<bool, LaneError> {
        let mut tables = self.tables.write().await;
        match tables.lanes.get(&lane.lane_id) {
            Some(existing) if existing.version >= lane.version => Ok(false),
            _ => {
                tables.lanes.insert(lane.lane_id.clone(), lane.clone());
                Ok(true)
            }
        }
    }

    async fn get_settings(&self, account: &str) -> Result<AccountSettings, LaneError> {
        let mut tables = self.tables.write().await;
        Ok(tables
            .settings
            .entry(account.to_string())
            .or_insert_with(|| AccountSettings::defaults_for(account))
            .clone())
    }

    async fn upsert_settings(
        &self,
        account: &str,
        update: &SettingsUpdate,
    ) -> Result<AccountSettings, LaneError> {
        let mut tables = self.tables.write().await;
        let mut settings = tables
            .settings
            .get(account)
            .cloned()
            .unwrap_or_else(|| AccountSettings::defaults_for(account));
        settings.apply(update);
        settings.validate()?;
        tables.settings.insert(account.to_string(), settings.clone());
        Ok(settings)
    }

    async fn list_accounts(&self) -> Result<Vec<String>, LaneError> {
        let tables = self.tables.read().await;
        let mut accounts: Vec<String> = tables
            .settings
            .keys()
            .cloned()
            .chain(tables.lanes.values().map(|l| l.account.clone()))
            .collect();
        accounts.sort();
        accounts.dedup();
        Ok(accounts)
    }

    async fn lane_statistics(
        &self,
        account: &str,
        since: DateTime<Utc>,
    ) -> Result<LaneStatistics, LaneError> {
        let tables = self.tables.read().await;
        Ok(LaneStatistics::from_lanes(
            tables
                .lanes
                .values()
                .filter(|l| l.account == account && l.created_at >= since),
        ))
    }

    async fn purge_closed_lanes(&self, closed_before: DateTime<Utc>) -> Result<u32, LaneError> {
        let mut tables = self.tables.write().await;
        let before = tables.lanes.len();
        tables
            .lanes
            .retain(|_, l| l.is_active() || l.completed_at.map_or(true, |at| at >= closed_before));
        Ok((before - tables.lanes.len()) as u32)
    }

    async fn health_check(&self) -> Result<(), LaneError> {
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
