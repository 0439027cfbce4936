//! Status reporter: read-only projection of the lane store.
//!
//! Per account: the active lanes and today's counters. "Today" is the
//! current UTC day.

use chrono::{DateTime, Utc};
use futures::future::join_all;
use rust_decimal::Decimal;
use serde::Serialize;
use std::sync::Arc;

use super::clock::{day_start, Clock, SystemClock};
use crate::storage::LaneStore;
use crate::types::{Lane, LaneError, LaneStatistics, LaneStatus, TradeOutcome};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LaneSummary {
    pub lane_id: String,
    pub symbol: String,
    pub level: u32,
    pub max_level: u32,
    /// Projected next stake.
    pub amount: Decimal,
    pub invested: Decimal,
    pub trades: usize,
    pub created_at: DateTime<Utc>,
}

impl From<&Lane> for LaneSummary {
    fn from(lane: &Lane) -> Self {
        Self {
            lane_id: lane.lane_id.clone(),
            symbol: lane.symbol.clone(),
            level: lane.current_level,
            max_level: lane.max_level,
            amount: lane.current_amount,
            invested: lane.total_invested,
            trades: lane.trades.len(),
            created_at: lane.created_at,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DailyCounters {
    pub lanes_created: u32,
    pub lanes_completed: u32,
    pub lanes_cancelled: u32,
    /// Lane trades settled today.
    pub wins: u32,
    pub losses: u32,
    /// Losing stakes won back by lanes completed today.
    pub amount_recovered: Decimal,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AccountStatus {
    pub account: String,
    pub active_lanes: Vec<LaneSummary>,
    pub today: DailyCounters,
    pub generated_at: DateTime<Utc>,
}

pub struct StatusReporter {
    store: Arc<dyn LaneStore>,
    clock: Arc<dyn Clock>,
}

impl StatusReporter {
    pub fn new(store: Arc<dyn LaneStore>) -> Self {
        Self {
            store,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub async fn account_status(&self, account: &str) -> Result<AccountStatus, LaneError> {
        let now = self.clock.now();
        let since = day_start(now);
        let (active, touched) = futures::try_join!(
            self.store.get_active_lanes(account),
            self.store.lanes_touched_since(account, since),
        )?;

        Ok(AccountStatus {
            account: account.to_string(),
            active_lanes: active.iter().map(LaneSummary::from).collect(),
            today: daily_counters(&touched, since),
            generated_at: now,
        })
    }

    /// Status for every known account, sorted by account.
    pub async fn snapshot(&self) -> Result<Vec<AccountStatus>, LaneError> {
        let accounts = self.store.list_accounts().await?;
        join_all(accounts.iter().map(|a| self.account_status(a)))
            .await
            .into_iter()
            .collect()
    }

    /// Aggregate over lanes the account created in the last `days` days.
    pub async fn lane_statistics(
        &self,
        account: &str,
        days: u32,
    ) -> Result<LaneStatistics, LaneError> {
        let since = self.clock.now() - chrono::Duration::days(i64::from(days));
        self.store.lane_statistics(account, since).await
    }

    pub async fn health(&self) -> Result<(), LaneError> {
        self.store.health_check().await
    }
}

fn daily_counters(lanes: &[Lane], since: DateTime<Utc>) -> DailyCounters {
    let mut c = DailyCounters::default();
    for lane in lanes {
        if lane.created_at >= since {
            c.lanes_created += 1;
        }
        let closed_today = lane.completed_at.is_some_and(|t| t >= since);
        match lane.status {
            LaneStatus::Completed if closed_today => {
                c.lanes_completed += 1;
                c.amount_recovered += lane.loss_history().iter().copied().sum::<Decimal>();
            }
            LaneStatus::Cancelled if closed_today => c.lanes_cancelled += 1,
            _ => {}
        }
        for trade in lane.trades.iter().filter(|t| t.recorded_at >= since) {
            match trade.outcome {
                TradeOutcome::Win => c.wins += 1,
                TradeOutcome::Loss => c.losses += 1,
            }
        }
    }
    c
}
