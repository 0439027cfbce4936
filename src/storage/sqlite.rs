//! SQLite-backed `LaneStore` (sqlx).
//!
//! Money is stored as decimal TEXT so amounts round-trip exactly, times as
//! unix milliseconds, and a lane's trade list as a JSON column. Every lane
//! mutation is a transaction that re-reads the row, applies the change in
//! Rust and writes it back with `WHERE version = ?`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::query::Query;
use sqlx::sqlite::{Sqlite, SqliteArguments, SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info};

use super::LaneStore;
use crate::types::{
    AccountSettings, Lane, LaneError, LaneStatistics, LaneStatus, LaneTrade, NewLane,
    SettingsUpdate,
};

const LANE_COLUMNS: &str = "lane_id, account, symbol, status, current_level, base_amount, \
    current_amount, multiplier, max_level, total_invested, total_potential_payout, trades, \
    version, close_reason, created_at, updated_at, completed_at";

const LANE_VALUES: &str = "?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17";

const LANE_UPDATE_SET: &str = "account = ?2, symbol = ?3, status = ?4, current_level = ?5, \
    base_amount = ?6, current_amount = ?7, multiplier = ?8, max_level = ?9, \
    total_invested = ?10, total_potential_payout = ?11, trades = ?12, version = ?13, \
    close_reason = ?14, created_at = ?15, updated_at = ?16, completed_at = ?17";

pub struct SqliteLaneStore {
    pool: SqlitePool,
}

impl SqliteLaneStore {
    /// Open (creating if needed) the database at `database_url`.
    pub async fn connect(database_url: &str, max_connections: u32) -> anyhow::Result<Self> {
        let options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .busy_timeout(Duration::from_secs(5));
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to open {database_url}: {e}"))?;

        let store = Self { pool };
        store.initialize_schema().await?;
        info!(database_url, max_connections, "Lane store ready");
        Ok(store)
    }

    /// Private in-memory database. One connection that never expires, so
    /// the data lives as long as the store.
    pub async fn in_memory() -> anyhow::Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await?;
        let store = Self { pool };
        store.initialize_schema().await?;
        Ok(store)
    }

    /// Close the pool. Later calls fail with `PersistenceUnavailable`.
    pub async fn close(&self) {
        self.pool.close().await;
    }

    async fn initialize_schema(&self) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS lanes (
                lane_id TEXT PRIMARY KEY,
                account TEXT NOT NULL,
                symbol TEXT NOT NULL,
                status TEXT NOT NULL CHECK (status IN ('active', 'completed', 'cancelled')),
                current_level INTEGER NOT NULL,
                base_amount TEXT NOT NULL,
                current_amount TEXT NOT NULL,
                multiplier TEXT NOT NULL,
                max_level INTEGER NOT NULL,
                total_invested TEXT NOT NULL,
                total_potential_payout TEXT NOT NULL,
                trades TEXT NOT NULL DEFAULT '[]',
                version INTEGER NOT NULL,
                close_reason TEXT,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                completed_at INTEGER
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_lanes_account_status ON lanes (account, status)",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS account_settings (
                account TEXT PRIMARY KEY,
                concurrent_trading_enabled INTEGER NOT NULL,
                max_concurrent_lanes INTEGER NOT NULL,
                lane_assignment_strategy TEXT NOT NULL,
                auto_create_lanes INTEGER NOT NULL,
                cool_down_seconds INTEGER NOT NULL,
                max_daily_lanes INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn fetch_lane(&self, lane_id: &str) -> Result<Option<Lane>, LaneError> {
        let row = sqlx::query(&format!("SELECT {LANE_COLUMNS} FROM lanes WHERE lane_id = ?1"))
            .bind(lane_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx)?;
        row.as_ref().map(lane_from_row).transpose()
    }

    /// Read-modify-write of one lane inside a transaction. `mutate` runs on
    /// the freshly read row; the write only lands if nobody bumped the
    /// version in between.
    async fn update_lane<F>(&self, lane_id: &str, mutate: F) -> Result<Lane, LaneError>
    where
        F: FnOnce(&mut Lane) -> Result<bool, LaneError> + Send,
    {
        let mut tx = self.pool.begin().await.map_err(map_sqlx)?;

        let row = sqlx::query(&format!("SELECT {LANE_COLUMNS} FROM lanes WHERE lane_id = ?1"))
            .bind(lane_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(map_sqlx)?
            .ok_or_else(|| LaneError::LaneNotFound(lane_id.to_string()))?;
        let mut lane = lane_from_row(&row)?;
        let expected = lane.version;

        if !mutate(&mut lane)? {
            return Ok(lane);
        }

        let sql = format!("UPDATE lanes SET {LANE_UPDATE_SET} WHERE lane_id = ?1 AND version = ?18");
        let result = bind_lane(sqlx::query(&sql), &lane)?
            .bind(expected as i64)
            .execute(&mut *tx)
            .await
            .map_err(|e| map_write_conflict(e, lane_id, expected))?;

        if result.rows_affected() == 0 {
            return Err(LaneError::ConcurrentModification {
                lane_id: lane_id.to_string(),
                expected,
            });
        }

        tx.commit()
            .await
            .map_err(|e| map_write_conflict(e, lane_id, expected))?;
        debug!(lane_id, version = lane.version, status = %lane.status, "Lane updated");
        Ok(lane)
    }

    async fn fetch_settings(&self, account: &str) -> Result<Option<AccountSettings>, LaneError> {
        let row = sqlx::query(
            "SELECT account, concurrent_trading_enabled, max_concurrent_lanes, \
             lane_assignment_strategy, auto_create_lanes, cool_down_seconds, max_daily_lanes \
             FROM account_settings WHERE account = ?1",
        )
        .bind(account)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx)?;
        row.as_ref().map(settings_from_row).transpose()
    }

    async fn write_settings(&self, settings: &AccountSettings) -> Result<(), LaneError> {
        sqlx::query(
            r#"
            INSERT INTO account_settings
            (account, concurrent_trading_enabled, max_concurrent_lanes, lane_assignment_strategy,
             auto_create_lanes, cool_down_seconds, max_daily_lanes)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            ON CONFLICT(account) DO UPDATE SET
                concurrent_trading_enabled = excluded.concurrent_trading_enabled,
                max_concurrent_lanes = excluded.max_concurrent_lanes,
                lane_assignment_strategy = excluded.lane_assignment_strategy,
                auto_create_lanes = excluded.auto_create_lanes,
                cool_down_seconds = excluded.cool_down_seconds,
                max_daily_lanes = excluded.max_daily_lanes
            "#,
        )
        .bind(settings.account.clone())
        .bind(settings.concurrent_trading_enabled)
        .bind(settings.max_concurrent_lanes as i64)
        .bind(settings.lane_assignment_strategy.as_str())
        .bind(settings.auto_create_lanes)
        .bind(settings.cool_down_seconds as i64)
        .bind(settings.max_daily_lanes as i64)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx)?;
        Ok(())
    }
}

#[async_trait]
impl LaneStore for SqliteLaneStore {
    async fn create_lane(&self, new_lane: NewLane) -> Result<Lane, LaneError> {
        let lane = Lane::open(new_lane);
        let sql = format!("INSERT INTO lanes ({LANE_COLUMNS}) VALUES ({LANE_VALUES})");
        bind_lane(sqlx::query(&sql), &lane)?
            .execute(&self.pool)
            .await
            .map_err(|e| match e {
                sqlx::Error::Database(ref db) if db.is_unique_violation() => {
                    LaneError::Storage(format!("Lane {} already exists", lane.lane_id))
                }
                other => map_sqlx(other),
            })?;
        debug!(lane_id = %lane.lane_id, "Lane created");
        Ok(lane)
    }

    async fn get_lane(&self, lane_id: &str) -> Result<Option<Lane>, LaneError> {
        self.fetch_lane(lane_id).await
    }

    async fn get_active_lanes(&self, account: &str) -> Result<Vec<Lane>, LaneError> {
        let rows = sqlx::query(&format!(
            "SELECT {LANE_COLUMNS} FROM lanes WHERE account = ?1 AND status = 'active' \
             ORDER BY created_at, lane_id"
        ))
        .bind(account)
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx)?;
        rows.iter().map(lane_from_row).collect()
    }

    async fn lanes_touched_since(
        &self,
        account: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<Lane>, LaneError> {
        let rows = sqlx::query(&format!(
            "SELECT {LANE_COLUMNS} FROM lanes \
             WHERE account = ?1 AND (created_at >= ?2 OR updated_at >= ?2) \
             ORDER BY created_at, lane_id"
        ))
        .bind(account)
        .bind(since.timestamp_millis())
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx)?;
        rows.iter().map(lane_from_row).collect()
    }

    async fn count_lanes_created_since(
        &self,
        account: &str,
        since: DateTime<Utc>,
    ) -> Result<u32, LaneError> {
        let row = sqlx::query("SELECT COUNT(*) FROM lanes WHERE account = ?1 AND created_at >= ?2")
            .bind(account)
            .bind(since.timestamp_millis())
            .fetch_one(&self.pool)
            .await
            .map_err(map_sqlx)?;
        let count: i64 = row.try_get(0).map_err(map_sqlx)?;
        to_u32(count, "lane count")
    }

    async fn append_trade_to_lane(
        &self,
        lane_id: &str,
        trade: LaneTrade,
        next_amount: Decimal,
    ) -> Result<Lane, LaneError> {
        self.update_lane(lane_id, move |lane| {
            lane.record_trade(trade)?;
            lane.set_projected_stake(next_amount);
            Ok(true)
        })
        .await
    }

    async fn set_terminal(
        &self,
        lane_id: &str,
        status: LaneStatus,
        reason: &str,
        at: DateTime<Utc>,
    ) -> Result<Lane, LaneError> {
        let reason = reason.to_string();
        self.update_lane(lane_id, move |lane| lane.terminate(status, &reason, at))
            .await
    }

    async fn put_lane(&self, lane: &Lane) -> Result<bool, LaneError> {
        let sql = format!(
            "INSERT INTO lanes ({LANE_COLUMNS}) VALUES ({LANE_VALUES}) \
             ON CONFLICT(lane_id) DO UPDATE SET {LANE_UPDATE_SET} \
             WHERE excluded.version > lanes.version"
        );
        let result = bind_lane(sqlx::query(&sql), lane)?
            .execute(&self.pool)
            .await
            .map_err(map_sqlx)?;
        Ok(result.rows_affected() > 0)
    }

    async fn get_settings(&self, account: &str) -> Result<AccountSettings, LaneError> {
        if let Some(settings) = self.fetch_settings(account).await? {
            return Ok(settings);
        }
        let defaults = AccountSettings::defaults_for(account);
        sqlx::query(
            r#"
            INSERT OR IGNORE INTO account_settings
            (account, concurrent_trading_enabled, max_concurrent_lanes, lane_assignment_strategy,
             auto_create_lanes, cool_down_seconds, max_daily_lanes)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            "#,
        )
        .bind(defaults.account.clone())
        .bind(defaults.concurrent_trading_enabled)
        .bind(defaults.max_concurrent_lanes as i64)
        .bind(defaults.lane_assignment_strategy.as_str())
        .bind(defaults.auto_create_lanes)
        .bind(defaults.cool_down_seconds as i64)
        .bind(defaults.max_daily_lanes as i64)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx)?;

        // A concurrent caller may have won the insert with real values.
        Ok(self.fetch_settings(account).await?.unwrap_or(defaults))
    }

    async fn upsert_settings(
        &self,
        account: &str,
        update: &SettingsUpdate,
    ) -> Result<AccountSettings, LaneError> {
        let mut settings = self
            .fetch_settings(account)
            .await?
            .unwrap_or_else(|| AccountSettings::defaults_for(account));
        settings.apply(update);
        settings.validate()?;
        self.write_settings(&settings).await?;
        info!(
            account,
            concurrent = settings.concurrent_trading_enabled,
            max_lanes = settings.max_concurrent_lanes,
            strategy = %settings.lane_assignment_strategy,
            "Account settings updated"
        );
        Ok(settings)
    }

    async fn list_accounts(&self) -> Result<Vec<String>, LaneError> {
        let rows = sqlx::query(
            "SELECT account FROM account_settings UNION SELECT account FROM lanes ORDER BY account",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx)?;
        rows.iter()
            .map(|row| row.try_get::<String, _>(0).map_err(map_sqlx))
            .collect()
    }

    async fn lane_statistics(
        &self,
        account: &str,
        since: DateTime<Utc>,
    ) -> Result<LaneStatistics, LaneError> {
        let rows = sqlx::query(&format!(
            "SELECT {LANE_COLUMNS} FROM lanes WHERE account = ?1 AND created_at >= ?2"
        ))
        .bind(account)
        .bind(since.timestamp_millis())
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx)?;
        let lanes = rows.iter().map(lane_from_row).collect::<Result<Vec<_>, _>>()?;
        Ok(LaneStatistics::from_lanes(&lanes))
    }

    async fn purge_closed_lanes(&self, closed_before: DateTime<Utc>) -> Result<u32, LaneError> {
        let result = sqlx::query(
            "DELETE FROM lanes WHERE status != 'active' AND completed_at IS NOT NULL \
             AND completed_at < ?1",
        )
        .bind(closed_before.timestamp_millis())
        .execute(&self.pool)
        .await
        .map_err(map_sqlx)?;
        let purged = result.rows_affected() as u32;
        if purged > 0 {
            info!(purged, before = %closed_before, "Closed lanes purged");
        }
        Ok(purged)
    }

    async fn health_check(&self) -> Result<(), LaneError> {
        sqlx::query("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .map_err(map_sqlx)?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Row mapping
// ---------------------------------------------------------------------------

/// Bind every lane column in `LANE_COLUMNS` order (?1..?17).
fn bind_lane<'q>(
    query: Query<'q, Sqlite, SqliteArguments<'q>>,
    lane: &Lane,
) -> Result<Query<'q, Sqlite, SqliteArguments<'q>>, LaneError> {
    let trades = serde_json::to_string(&lane.trades)
        .map_err(|e| LaneError::Storage(format!("Failed to encode trades: {e}")))?;
    Ok(query
        .bind(lane.lane_id.clone())
        .bind(lane.account.clone())
        .bind(lane.symbol.clone())
        .bind(lane.status.as_str())
        .bind(lane.current_level as i64)
        .bind(lane.base_amount.to_string())
        .bind(lane.current_amount.to_string())
        .bind(lane.multiplier.to_string())
        .bind(lane.max_level as i64)
        .bind(lane.total_invested.to_string())
        .bind(lane.total_potential_payout.to_string())
        .bind(trades)
        .bind(lane.version as i64)
        .bind(lane.close_reason.clone())
        .bind(lane.created_at.timestamp_millis())
        .bind(lane.updated_at.timestamp_millis())
        .bind(lane.completed_at.map(|t| t.timestamp_millis())))
}

fn lane_from_row(row: &SqliteRow) -> Result<Lane, LaneError> {
    let trades: String = row.try_get("trades").map_err(map_sqlx)?;
    let trades: Vec<LaneTrade> = serde_json::from_str(&trades)
        .map_err(|e| LaneError::Storage(format!("Corrupt trades column: {e}")))?;
    let status: String = row.try_get("status").map_err(map_sqlx)?;
    let version: i64 = row.try_get("version").map_err(map_sqlx)?;
    let completed_at: Option<i64> = row.try_get("completed_at").map_err(map_sqlx)?;

    Ok(Lane {
        lane_id: row.try_get("lane_id").map_err(map_sqlx)?,
        account: row.try_get("account").map_err(map_sqlx)?,
        symbol: row.try_get("symbol").map_err(map_sqlx)?,
        status: status.parse()?,
        current_level: to_u32(row.try_get("current_level").map_err(map_sqlx)?, "current_level")?,
        base_amount: decimal_col(row, "base_amount")?,
        current_amount: decimal_col(row, "current_amount")?,
        multiplier: decimal_col(row, "multiplier")?,
        max_level: to_u32(row.try_get("max_level").map_err(map_sqlx)?, "max_level")?,
        total_invested: decimal_col(row, "total_invested")?,
        total_potential_payout: decimal_col(row, "total_potential_payout")?,
        trades,
        version: u64::try_from(version)
            .map_err(|_| LaneError::Storage(format!("Negative lane version {version}")))?,
        close_reason: row.try_get("close_reason").map_err(map_sqlx)?,
        created_at: millis(row.try_get("created_at").map_err(map_sqlx)?)?,
        updated_at: millis(row.try_get("updated_at").map_err(map_sqlx)?)?,
        completed_at: completed_at.map(millis).transpose()?,
    })
}

fn settings_from_row(row: &SqliteRow) -> Result<AccountSettings, LaneError> {
    let strategy: String = row.try_get("lane_assignment_strategy").map_err(map_sqlx)?;
    Ok(AccountSettings {
        account: row.try_get("account").map_err(map_sqlx)?,
        concurrent_trading_enabled: row.try_get("concurrent_trading_enabled").map_err(map_sqlx)?,
        max_concurrent_lanes: to_u32(
            row.try_get("max_concurrent_lanes").map_err(map_sqlx)?,
            "max_concurrent_lanes",
        )?,
        lane_assignment_strategy: strategy.parse()?,
        auto_create_lanes: row.try_get("auto_create_lanes").map_err(map_sqlx)?,
        cool_down_seconds: to_u32(
            row.try_get("cool_down_seconds").map_err(map_sqlx)?,
            "cool_down_seconds",
        )?,
        max_daily_lanes: to_u32(
            row.try_get("max_daily_lanes").map_err(map_sqlx)?,
            "max_daily_lanes",
        )?,
    })
}

fn decimal_col(row: &SqliteRow, column: &str) -> Result<Decimal, LaneError> {
    let raw: String = row.try_get(column).map_err(map_sqlx)?;
    Decimal::from_str(&raw)
        .map_err(|e| LaneError::Storage(format!("Corrupt {column} value {raw:?}: {e}")))
}

fn millis(ms: i64) -> Result<DateTime<Utc>, LaneError> {
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| LaneError::Storage(format!("Timestamp out of range: {ms}")))
}

fn to_u32(value: i64, what: &str) -> Result<u32, LaneError> {
    u32::try_from(value).map_err(|_| LaneError::Storage(format!("{what} out of range: {value}")))
}

/// Transport-level failures mean the store is unreachable; everything else
/// is a hard storage error.
fn map_sqlx(err: sqlx::Error) -> LaneError {
    let unavailable = match &err {
        sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed
        | sqlx::Error::Io(_) => true,
        // SQLITE_BUSY / SQLITE_LOCKED
        sqlx::Error::Database(db) => matches!(db.code().as_deref(), Some("5") | Some("6")),
        _ => false,
    };
    if unavailable {
        LaneError::PersistenceUnavailable(err.to_string())
    } else {
        LaneError::Storage(err.to_string())
    }
}

/// A busy database during a lane write means another writer holds the row's
/// lock; the caller re-reads and retries like a version mismatch.
fn map_write_conflict(err: sqlx::Error, lane_id: &str, expected: u64) -> LaneError {
    if let sqlx::Error::Database(db) = &err {
        // SQLITE_BUSY / SQLITE_BUSY_SNAPSHOT
        if matches!(db.code().as_deref(), Some("5") | Some("517")) {
            return LaneError::ConcurrentModification {
                lane_id: lane_id.to_string(),
                expected,
            };
        }
    }
    map_sqlx(err)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
