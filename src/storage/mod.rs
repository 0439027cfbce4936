//! Persistence layer.
//!
//! `LaneStore` is the durable home of lanes and per-account settings. The
//! SQLite implementation backs production; the in-memory one backs tests
//! and dry runs. Lane mutations are read-modify-write under a version check
//! so a racing writer surfaces as `ConcurrentModification` instead of a
//! corrupted total.

pub mod memory;
pub mod sqlite;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;

use crate::types::{
    AccountSettings, Lane, LaneError, LaneStatistics, LaneStatus, LaneTrade, NewLane,
    SettingsUpdate,
};

pub use memory::MemoryLaneStore;
pub use sqlite::SqliteLaneStore;

/// Durable storage for lanes and account settings.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait LaneStore: Send + Sync {
    /// Insert a new level-0 lane. The id is derived from account, symbol and creation time.
    async fn create_lane(&self, new_lane: NewLane) -> Result<Lane, LaneError>;

    async fn get_lane(&self, lane_id: &str) -> Result<Option<Lane>, LaneError>;

    /// Active lanes for an account, oldest first.
    async fn get_active_lanes(&self, account: &str) -> Result<Vec<Lane>, LaneError>;

    /// Lanes created or updated at or after `since`, oldest first.
    async fn lanes_touched_since(
        &self,
        account: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<Lane>, LaneError>;

    async fn count_lanes_created_since(
        &self,
        account: &str,
        since: DateTime<Utc>,
    ) -> Result<u32, LaneError>;

    /// Record a settled trade in one transaction: level, amounts, trade
    /// list, status and timestamps change together or not at all.
    /// `next_amount` becomes the lane's `current_amount` if it stays active.
    async fn append_trade_to_lane(
        &self,
        lane_id: &str,
        trade: LaneTrade,
        next_amount: Decimal,
    ) -> Result<Lane, LaneError>;

    /// Force a terminal status. A no-op returning the stored lane when it
    /// is already terminal.
    async fn set_terminal(
        &self,
        lane_id: &str,
        status: LaneStatus,
        reason: &str,
        at: DateTime<Utc>,
    ) -> Result<Lane, LaneError>;

    /// Write a lane snapshot computed elsewhere (queued writes). Applied
    /// only when newer than the stored version; returns whether it was.
    async fn put_lane(&self, lane: &Lane) -> Result<bool, LaneError>;

    /// Settings for an account, created with defaults when absent.
    async fn get_settings(&self, account: &str) -> Result<AccountSettings, LaneError>;

    async fn upsert_settings(
        &self,
        account: &str,
        update: &SettingsUpdate,
    ) -> Result<AccountSettings, LaneError>;

    /// Every account with settings or lanes.
    async fn list_accounts(&self) -> Result<Vec<String>, LaneError>;

    /// Aggregate over an account's lanes created at or after `since`.
    async fn lane_statistics(
        &self,
        account: &str,
        since: DateTime<Utc>,
    ) -> Result<LaneStatistics, LaneError>;

    /// Delete completed and cancelled lanes closed before `closed_before`.
    /// Returns how many were removed.
    async fn purge_closed_lanes(&self, closed_before: DateTime<Utc>) -> Result<u32, LaneError>;

    async fn health_check(&self) -> Result<(), LaneError>;
}
