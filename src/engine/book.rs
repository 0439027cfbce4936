//! Per-account in-memory state.
//!
//! An `AccountBook` is owned by the manager behind the account's mutex. It
//! is the snapshot decisions are made from: known lanes, cached settings,
//! outstanding placements, the cool-down clock, the daily lane counter and
//! the queue of lane writes waiting for the store to come back.

use chrono::{DateTime, Duration, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};

use crate::types::{AccountSettings, Direction, Lane};

/// A placement handed to the execution side and not yet settled.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PendingPlacement {
    pub trade_id: String,
    pub account: String,
    pub symbol: String,
    pub direction: Direction,
    pub amount: Decimal,
    /// `None` for a base trade.
    pub lane_id: Option<String>,
    pub level: u32,
    pub placed_at: DateTime<Utc>,
}

#[derive(Debug)]
pub struct AccountBook {
    pub account: String,
    /// Lanes known to this session, keyed by id. Terminal lanes stay until
    /// pruned so late results can be recognised as stale.
    lanes: BTreeMap<String, Lane>,
    /// `None` until read from the store, and after an invalidation.
    pub settings: Option<AccountSettings>,
    /// The active-lane snapshot has been read from the store.
    pub loaded: bool,
    pub pending: HashMap<String, PendingPlacement>,
    pub last_placement_at: Option<DateTime<Utc>>,
    /// Lanes created on `counter_day`.
    lanes_created: u32,
    counter_day: Option<NaiveDate>,
    last_created_at: Option<DateTime<Utc>>,
    pub balance: Decimal,
    /// Latest unsaved snapshot per lane.
    backlog: BTreeMap<String, Lane>,
    pub failed_flushes: u32,
    pub next_retry_at: Option<DateTime<Utc>>,
    /// Base-trade-only routing until the backlog drains.
    pub degraded: bool,
}

impl AccountBook {
    pub fn new(account: &str, balance: Decimal) -> Self {
        Self {
            account: account.to_string(),
            lanes: BTreeMap::new(),
            settings: None,
            loaded: false,
            pending: HashMap::new(),
            last_placement_at: None,
            lanes_created: 0,
            counter_day: None,
            last_created_at: None,
            balance,
            backlog: BTreeMap::new(),
            failed_flushes: 0,
            next_retry_at: None,
            degraded: false,
        }
    }

    /// Cached settings, or the defaults while the store has not answered.
    pub fn effective_settings(&self) -> AccountSettings {
        self.settings
            .clone()
            .unwrap_or_else(|| AccountSettings::defaults_for(&self.account))
    }

    // -- Lanes -------------------------------------------------------------

    pub fn lane(&self, lane_id: &str) -> Option<&Lane> {
        self.lanes.get(lane_id)
    }

    /// Insert or refresh a lane. An older version never replaces a newer
    /// one, so a slow store read cannot roll back a local mutation.
    pub fn upsert_lane(&mut self, lane: Lane) {
        if let Some(last) = self.last_created_at {
            if lane.created_at > last {
                self.last_created_at = Some(lane.created_at);
            }
        } else {
            self.last_created_at = Some(lane.created_at);
        }
        match self.lanes.get(&lane.lane_id) {
            Some(existing) if existing.version > lane.version => {}
            _ => {
                self.lanes.insert(lane.lane_id.clone(), lane);
            }
        }
    }

    pub fn forget_lane(&mut self, lane_id: &str) {
        self.lanes.remove(lane_id);
    }

    pub fn active_lanes(&self) -> impl Iterator<Item = &Lane> {
        self.lanes.values().filter(|l| l.is_active())
    }

    pub fn active_count(&self) -> usize {
        self.active_lanes().count()
    }

    pub fn lane_has_pending(&self, lane_id: &str) -> bool {
        self.pending
            .values()
            .any(|p| p.lane_id.as_deref() == Some(lane_id))
    }

    /// Active lanes with no outstanding placement. Only these may receive a
    /// new trade, which keeps each lane single-writer.
    pub fn eligible_lanes(&self) -> impl Iterator<Item = &Lane> {
        self.active_lanes()
            .filter(move |l| !self.lane_has_pending(&l.lane_id))
    }

    pub fn outstanding_base_trades(&self) -> usize {
        self.pending.values().filter(|p| p.lane_id.is_none()).count()
    }

    /// Drop terminal lanes closed before `before` with nothing outstanding.
    pub fn prune_closed(&mut self, before: DateTime<Utc>) -> usize {
        let stale: Vec<String> = self
            .lanes
            .values()
            .filter(|l| {
                !l.is_active()
                    && l.completed_at.map_or(true, |t| t < before)
                    && !self.backlog.contains_key(&l.lane_id)
                    && !self.lane_has_pending(&l.lane_id)
            })
            .map(|l| l.lane_id.clone())
            .collect();
        for id in &stale {
            self.lanes.remove(id);
        }
        stale.len()
    }

    // -- Admission clocks --------------------------------------------------

    /// Seconds left in the cool-down, if one is running.
    pub fn cooldown_remaining(&self, now: DateTime<Utc>, cool_down_seconds: u32) -> Option<i64> {
        if cool_down_seconds == 0 {
            return None;
        }
        let last = self.last_placement_at?;
        let ready_at = last + Duration::seconds(i64::from(cool_down_seconds));
        if now < ready_at {
            // Round up so a caller never sees "0s remaining".
            let ms = (ready_at - now).num_milliseconds();
            Some((ms + 999) / 1000)
        } else {
            None
        }
    }

    pub fn lanes_created_today(&self, now: DateTime<Utc>) -> u32 {
        if self.counter_day == Some(now.date_naive()) {
            self.lanes_created
        } else {
            0
        }
    }

    /// Seed the daily counter from the store.
    pub fn set_created_today(&mut self, now: DateTime<Utc>, count: u32) {
        self.counter_day = Some(now.date_naive());
        self.lanes_created = count;
    }

    pub fn note_lane_created(&mut self, now: DateTime<Utc>) {
        let today = now.date_naive();
        if self.counter_day != Some(today) {
            self.counter_day = Some(today);
            self.lanes_created = 0;
        }
        self.lanes_created += 1;
    }

    /// Creation time for a new lane: `now`, nudged forward so lane ids stay
    /// unique when two lanes open within the same millisecond.
    pub fn next_creation_time(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        match self.last_created_at {
            Some(last) if now <= last => last + Duration::milliseconds(1),
            _ => now,
        }
    }

    // -- Write-behind queue ------------------------------------------------

    pub fn queue_write(&mut self, lane: Lane) {
        match self.backlog.get(&lane.lane_id) {
            Some(queued) if queued.version >= lane.version => {}
            _ => {
                self.backlog.insert(lane.lane_id.clone(), lane);
            }
        }
    }

    pub fn has_queued(&self, lane_id: &str) -> bool {
        self.backlog.contains_key(lane_id)
    }

    pub fn backlog_len(&self) -> usize {
        self.backlog.len()
    }

    /// Queued snapshots, oldest lane first.
    pub fn queued_writes(&self) -> Vec<Lane> {
        let mut lanes: Vec<Lane> = self.backlog.values().cloned().collect();
        lanes.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        lanes
    }

    /// Remove a flushed snapshot unless a newer one was queued meanwhile.
    pub fn mark_flushed(&mut self, lane_id: &str, version: u64) {
        if self.backlog.get(lane_id).is_some_and(|l| l.version <= version) {
            self.backlog.remove(lane_id);
        }
    }

    /// Record a failed flush. Returns `true` when this failure tipped the
    /// account into degraded mode.
    pub fn record_flush_failure(
        &mut self,
        now: DateTime<Utc>,
        retry_backoff: std::time::Duration,
        max_backoff: std::time::Duration,
        retry_limit: u32,
    ) -> bool {
        self.failed_flushes = self.failed_flushes.saturating_add(1);
        let exponent = self.failed_flushes.saturating_sub(1).min(20);
        let delay = retry_backoff
            .saturating_mul(1u32 << exponent)
            .min(max_backoff);
        let delay = Duration::from_std(delay).unwrap_or_else(|_| Duration::seconds(60));
        self.next_retry_at = Some(now + delay);

        if !self.degraded && self.failed_flushes >= retry_limit {
            self.degraded = true;
            return true;
        }
        false
    }

    /// Record a successful flush. Returns `true` when the account leaves
    /// degraded mode.
    pub fn record_flush_success(&mut self) -> bool {
        self.failed_flushes = 0;
        self.next_retry_at = None;
        if self.degraded && self.backlog.is_empty() {
            self.degraded = false;
            return true;
        }
        false
    }

    pub fn retry_due(&self, now: DateTime<Utc>) -> bool {
        self.next_retry_at.map_or(true, |at| now >= at)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{LaneTrade, NewLane, TradeOutcome};
    use chrono::TimeZone;
    use rust_decimal_macros::dec;
    use std::time::Duration as StdDuration;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 2, 9, 0, 0).unwrap()
    }

    fn lane(at: DateTime<Utc>) -> Lane {
        Lane::open(NewLane {
            account: "acct-1".into(),
            symbol: "EURUSD".into(),
            base_amount: dec!(1),
            multiplier: dec!(2.5),
            max_level: 7,
            created_at: at,
        })
    }

    fn pending(trade_id: &str, lane_id: Option<&str>) -> PendingPlacement {
        PendingPlacement {
            trade_id: trade_id.into(),
            account: "acct-1".into(),
            symbol: "EURUSD".into(),
            direction: Direction::Call,
            amount: dec!(1),
            lane_id: lane_id.map(String::from),
            level: 0,
            placed_at: t0(),
        }
    }

    #[test]
    fn test_eligible_excludes_lanes_with_pending() {
        let mut book = AccountBook::new("acct-1", dec!(100));
        let a = lane(t0());
        let b = lane(t0() + Duration::seconds(1));
        book.upsert_lane(a.clone());
        book.upsert_lane(b.clone());
        book.pending.insert("t1".into(), pending("t1", Some(&a.lane_id)));
        book.pending.insert("t2".into(), pending("t2", None));

        let eligible: Vec<&str> = book.eligible_lanes().map(|l| l.lane_id.as_str()).collect();
        assert_eq!(eligible, vec![b.lane_id.as_str()]);
        assert_eq!(book.outstanding_base_trades(), 1);
        assert_eq!(book.active_count(), 2);
    }

    #[test]
    fn test_upsert_never_rolls_back() {
        let mut book = AccountBook::new("acct-1", dec!(100));
        let fresh = lane(t0());
        let mut advanced = fresh.clone();
        advanced
            .record_trade(LaneTrade {
                trade_id: "t1".into(),
                amount: dec!(1),
                outcome: TradeOutcome::Loss,
                pnl: dec!(-1),
                expected_payout: dec!(0.85),
                recorded_at: t0(),
            })
            .unwrap();
        book.upsert_lane(advanced.clone());
        book.upsert_lane(fresh);
        assert_eq!(book.lane(&advanced.lane_id), Some(&advanced));
    }

    #[test]
    fn test_cooldown_remaining() {
        let mut book = AccountBook::new("acct-1", dec!(100));
        assert_eq!(book.cooldown_remaining(t0(), 30), None);
        book.last_placement_at = Some(t0());
        assert_eq!(book.cooldown_remaining(t0() + Duration::seconds(10), 30), Some(20));
        assert_eq!(book.cooldown_remaining(t0() + Duration::milliseconds(29_500), 30), Some(1));
        assert_eq!(book.cooldown_remaining(t0() + Duration::seconds(30), 30), None);
        assert_eq!(book.cooldown_remaining(t0(), 0), None);
    }

    #[test]
    fn test_daily_counter_rolls_over() {
        let mut book = AccountBook::new("acct-1", dec!(100));
        book.set_created_today(t0(), 4);
        book.note_lane_created(t0());
        assert_eq!(book.lanes_created_today(t0()), 5);
        assert_eq!(book.lanes_created_today(t0() + Duration::days(1)), 0);
        book.note_lane_created(t0() + Duration::days(1));
        assert_eq!(book.lanes_created_today(t0() + Duration::days(1)), 1);
    }

    #[test]
    fn test_creation_times_strictly_increase() {
        let mut book = AccountBook::new("acct-1", dec!(100));
        assert_eq!(book.next_creation_time(t0()), t0());
        book.upsert_lane(lane(t0()));
        let next = book.next_creation_time(t0());
        assert_eq!(next, t0() + Duration::milliseconds(1));
    }

    #[test]
    fn test_backoff_and_degrade() {
        let mut book = AccountBook::new("acct-1", dec!(100));
        let backoff = StdDuration::from_millis(500);
        let cap = StdDuration::from_secs(2);

        assert!(!book.record_flush_failure(t0(), backoff, cap, 3));
        assert_eq!(book.next_retry_at, Some(t0() + Duration::milliseconds(500)));
        assert!(!book.record_flush_failure(t0(), backoff, cap, 3));
        assert_eq!(book.next_retry_at, Some(t0() + Duration::milliseconds(1000)));
        assert!(book.record_flush_failure(t0(), backoff, cap, 3));
        assert!(book.degraded);
        assert!(!book.record_flush_failure(t0(), backoff, cap, 3));
        assert_eq!(book.next_retry_at, Some(t0() + Duration::seconds(2)));

        assert!(book.record_flush_success());
        assert!(!book.degraded);
        assert_eq!(book.failed_flushes, 0);
    }

    #[test]
    fn test_queue_keeps_latest_version() {
        let mut book = AccountBook::new("acct-1", dec!(100));
        let v0 = lane(t0());
        let mut v1 = v0.clone();
        v1.version = 1;
        book.queue_write(v1.clone());
        book.queue_write(v0.clone());
        assert_eq!(book.queued_writes(), vec![v1.clone()]);

        book.mark_flushed(&v0.lane_id, 0);
        assert!(book.has_queued(&v0.lane_id));
        book.mark_flushed(&v0.lane_id, 1);
        assert_eq!(book.backlog_len(), 0);
    }

    #[test]
    fn test_prune_closed_keeps_pending_lanes() {
        let mut book = AccountBook::new("acct-1", dec!(100));
        let mut done = lane(t0());
        done.terminate(crate::types::LaneStatus::Cancelled, "operator", t0()).unwrap();
        let mut held = lane(t0() + Duration::seconds(1));
        held.terminate(crate::types::LaneStatus::Cancelled, "operator", t0()).unwrap();
        book.upsert_lane(done.clone());
        book.upsert_lane(held.clone());
        book.pending.insert("t9".into(), pending("t9", Some(&held.lane_id)));

        assert_eq!(book.prune_closed(t0() + Duration::hours(1)), 1);
        assert!(book.lane(&done.lane_id).is_none());
        assert!(book.lane(&held.lane_id).is_some());
    }
}
