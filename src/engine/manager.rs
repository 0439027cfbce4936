//! Lane manager: admission, routing, sizing and settlement.
//!
//! Each account is an independent domain behind its own mutex. A signal is
//! admitted (cool-down, daily cap, sequencing, concurrency cap), routed into
//! an eligible lane or issued as a base trade, sized by the stake
//! calculator and recorded as a pending placement. Results settle the
//! placement: a base loss opens a lane, a lane win completes it, a lane
//! loss advances or cancels it.
//!
//! When the store is unreachable the account keeps deciding from its
//! in-memory snapshot and queues lane writes; `flush_pending_writes` replays
//! them with exponential backoff and degrades the account to base-only
//! routing once retries are exhausted.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use super::book::{AccountBook, PendingPlacement};
use super::clock::{day_start, Clock, SystemClock};
use crate::storage::LaneStore;
use crate::strategy::stake::{fallback_amount, StakeCalculator, StakeRequest};
use crate::strategy::StakeProfile;
use crate::types::{
    AccountSettings, Lane, LaneError, LaneStatus, LaneTrade, NewLane, Placement, Rejection,
    SettingsUpdate, TradeOutcome, TradeRequest,
};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Bound for a whole assign call and for claiming a result's placement.
    pub operation_timeout: Duration,
    /// Bound for one store call; elapsed counts as the store being down.
    pub store_timeout: Duration,
    /// Placements older than this are dropped by maintenance.
    pub pending_ttl: Duration,
    /// Consecutive failed flushes before an account is degraded.
    pub write_retry_limit: u32,
    pub retry_backoff: Duration,
    pub max_backoff: Duration,
    pub default_balance: Decimal,
    pub default_profile: StakeProfile,
    pub profiles: HashMap<String, StakeProfile>,
    pub balances: HashMap<String, Decimal>,
    pub payout_rate: Option<Decimal>,
    pub payout_overrides: HashMap<String, Decimal>,
    /// Off: every signal is a base trade and no lane opens.
    pub martingale_enabled: bool,
    /// Closed lanes older than this are purged from the store; `None`
    /// keeps them forever.
    pub lane_retention: Option<chrono::Duration>,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            operation_timeout: Duration::from_secs(5),
            store_timeout: Duration::from_secs(1),
            pending_ttl: Duration::from_secs(15 * 60),
            write_retry_limit: 5,
            retry_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(30),
            default_balance: Decimal::from(1000),
            default_profile: StakeProfile::default(),
            profiles: HashMap::new(),
            balances: HashMap::new(),
            payout_rate: None,
            payout_overrides: HashMap::new(),
            martingale_enabled: true,
            lane_retention: Some(chrono::Duration::days(30)),
        }
    }
}

impl ManagerConfig {
    pub fn profile_for(&self, account: &str) -> &StakeProfile {
        self.profiles.get(account).unwrap_or(&self.default_profile)
    }

    /// Payout rate for a symbol; per-symbol overrides win.
    pub fn payout_for(&self, symbol: &str) -> Option<Decimal> {
        self.payout_overrides.get(symbol).copied().or(self.payout_rate)
    }

    pub fn balance_for(&self, account: &str) -> Decimal {
        self.balances.get(account).copied().unwrap_or(self.default_balance)
    }
}

// ---------------------------------------------------------------------------
// Results
// ---------------------------------------------------------------------------

/// What a settled trade did to the account's lanes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "effect", rename_all = "snake_case")]
pub enum ResultEffect {
    BaseWin,
    /// Base loss that did not open a lane (auto-create off, caps, degraded).
    BaseLoss,
    LaneOpened { lane_id: String, level: u32 },
    LaneAdvanced { lane_id: String, level: u32 },
    LaneCompleted { lane_id: String },
    LaneCancelled { lane_id: String },
    /// The lane was already terminal; the result changed nothing.
    StaleDiscarded { lane_id: String },
}

impl fmt::Display for ResultEffect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResultEffect::BaseWin => write!(f, "base win"),
            ResultEffect::BaseLoss => write!(f, "base loss"),
            ResultEffect::LaneOpened { lane_id, level } => write!(f, "opened {lane_id} at L{level}"),
            ResultEffect::LaneAdvanced { lane_id, level } => write!(f, "advanced {lane_id} to L{level}"),
            ResultEffect::LaneCompleted { lane_id } => write!(f, "completed {lane_id}"),
            ResultEffect::LaneCancelled { lane_id } => write!(f, "cancelled {lane_id}"),
            ResultEffect::StaleDiscarded { lane_id } => write!(f, "discarded (lane {lane_id} closed)"),
        }
    }
}

/// Counts from one maintenance pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MaintenanceReport {
    pub expired_placements: usize,
    pub flushed_writes: usize,
    pub purged_lanes: u32,
}

// ---------------------------------------------------------------------------
// Manager
// ---------------------------------------------------------------------------

pub struct LaneManager {
    store: Arc<dyn LaneStore>,
    calculator: StakeCalculator,
    config: ManagerConfig,
    clock: Arc<dyn Clock>,
    martingale_enabled: AtomicBool,
    books: RwLock<HashMap<String, Arc<Mutex<AccountBook>>>>,
    /// trade_id → account, so results route without touching other accounts.
    trade_index: RwLock<HashMap<String, String>>,
}

impl LaneManager {
    pub fn new(store: Arc<dyn LaneStore>, calculator: StakeCalculator, config: ManagerConfig) -> Self {
        Self {
            store,
            calculator,
            martingale_enabled: AtomicBool::new(config.martingale_enabled),
            config,
            clock: Arc::new(SystemClock),
            books: RwLock::new(HashMap::new()),
            trade_index: RwLock::new(HashMap::new()),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    pub fn store(&self) -> Arc<dyn LaneStore> {
        Arc::clone(&self.store)
    }

    pub fn martingale_enabled(&self) -> bool {
        self.martingale_enabled.load(Ordering::SeqCst)
    }

    /// Switch recovery staking on or off for every account. Active lanes
    /// are kept and resume when it is switched back on.
    pub fn set_martingale_enabled(&self, enabled: bool) {
        let was = self.martingale_enabled.swap(enabled, Ordering::SeqCst);
        if was != enabled {
            info!(enabled, "Martingale staking toggled");
        }
    }

    // -- Signal path -------------------------------------------------------

    /// Admit a signal and size its stake. Rejections leave no trace.
    pub async fn assign_trade(&self, req: TradeRequest) -> Result<Placement, LaneError> {
        let account = req.account.clone();
        let trade_id = req.trade_id.clone();
        let result = self.bounded("assign_trade", self.assign_inner(req)).await;
        if let Err(e) = &result {
            warn!(account = %account, trade_id = %trade_id, error = %e, "Signal not placed");
        }
        result
    }

    async fn assign_inner(&self, req: TradeRequest) -> Result<Placement, LaneError> {
        if self.trade_index.read().await.contains_key(&req.trade_id) {
            return Err(LaneError::DuplicateTrade(req.trade_id));
        }

        let book_arc = self.book(&req.account).await;
        let mut book = book_arc.lock().await;
        self.refresh_book(&mut book).await?;

        let settings = book.effective_settings();
        settings.validate()?;
        let now = self.clock.now();

        let target = if self.martingale_enabled() {
            route(&book, &settings, &req.symbol, now)?
        } else {
            None
        };

        let profile = self.config.profile_for(&req.account);
        let payout_rate = self.config.payout_for(&req.symbol);
        let (loss_history, level, base_amount, multiplier) = match &target {
            Some(lane) => (lane.loss_history(), lane.current_level, lane.base_amount, lane.multiplier),
            None => (Vec::new(), 0, profile.base_amount, profile.multiplier),
        };
        let lane_id = target.as_ref().map(|l| l.lane_id.clone());

        let decision = match self.calculator.next_amount(&StakeRequest {
            loss_history: &loss_history,
            level,
            base_amount,
            multiplier,
            payout_rate,
            target_profit_ratio: profile.target_profit_ratio,
            balance: book.balance,
        }) {
            Ok(decision) => decision,
            Err(err @ LaneError::RiskExceeded { .. }) => {
                if let Some(lane_id) = &lane_id {
                    warn!(
                        account = %req.account,
                        lane_id = %lane_id,
                        level,
                        error = %err,
                        "Recovery stake exceeds balance; cancelling lane"
                    );
                    self.terminate_in_book(&mut book, lane_id, LaneStatus::Cancelled, "risk limit exceeded")
                        .await?;
                }
                return Err(err);
            }
            Err(e) => return Err(e),
        };

        {
            let mut index = self.trade_index.write().await;
            if index.contains_key(&req.trade_id) {
                return Err(LaneError::DuplicateTrade(req.trade_id));
            }
            index.insert(req.trade_id.clone(), req.account.clone());
        }

        book.pending.insert(
            req.trade_id.clone(),
            PendingPlacement {
                trade_id: req.trade_id.clone(),
                account: req.account.clone(),
                symbol: req.symbol.clone(),
                direction: req.direction,
                amount: decision.amount,
                lane_id: lane_id.clone(),
                level,
                placed_at: now,
            },
        );
        book.last_placement_at = Some(now);

        let placement = Placement {
            trade_id: req.trade_id,
            account: req.account,
            symbol: req.symbol,
            direction: req.direction,
            amount: decision.amount,
            lane_id,
            level,
            reduced_recovery: decision.reduced_recovery,
        };

        if placement.reduced_recovery {
            warn!(
                account = %placement.account,
                raw = %decision.raw,
                ceiling = %decision.ceiling,
                "Stake clamped below full recovery"
            );
        }
        info!(
            account = %placement.account,
            trade_id = %placement.trade_id,
            symbol = %placement.symbol,
            direction = %placement.direction,
            amount = %placement.amount,
            lane_id = placement.lane_id.as_deref().unwrap_or("-"),
            level = placement.level,
            "Placement issued"
        );
        Ok(placement)
    }

    // -- Result path -------------------------------------------------------

    /// Settle a placed trade. Unknown or already-settled ids are `NotFound`.
    ///
    /// Only claiming the placement is bounded by `operation_timeout`. Once
    /// claimed the settlement runs to completion; each store call inside it
    /// is still bounded by `store_timeout` and falls back to queued writes.
    pub async fn handle_result(
        &self,
        trade_id: &str,
        outcome: TradeOutcome,
        pnl: Decimal,
    ) -> Result<ResultEffect, LaneError> {
        let (mut book, pending) = self
            .bounded("handle_result", self.claim_placement(trade_id))
            .await?;
        self.settle(&mut book, pending, outcome, pnl).await
    }

    /// Remove a pending placement and its index entry, returning the locked
    /// book. Nothing awaits between the two removals.
    async fn claim_placement(
        &self,
        trade_id: &str,
    ) -> Result<(OwnedMutexGuard<AccountBook>, PendingPlacement), LaneError> {
        let account = self.trade_index.read().await.get(trade_id).cloned();
        let Some(account) = account else {
            warn!(trade_id, "Result for unknown trade");
            return Err(LaneError::NotFound(trade_id.to_string()));
        };

        let mut book = self.book(&account).await.lock_owned().await;
        let mut index = self.trade_index.write().await;
        let Some(pending) = book.pending.remove(trade_id) else {
            warn!(account = %account, trade_id, "Result for a trade no longer pending");
            return Err(LaneError::NotFound(trade_id.to_string()));
        };
        index.remove(trade_id);
        Ok((book, pending))
    }

    async fn settle(
        &self,
        book: &mut AccountBook,
        pending: PendingPlacement,
        outcome: TradeOutcome,
        pnl: Decimal,
    ) -> Result<ResultEffect, LaneError> {
        let account = pending.account.clone();
        let trade_id = pending.trade_id.as_str();
        let now = self.clock.now();
        book.balance += pnl;

        let expected_payout = self
            .config
            .payout_for(&pending.symbol)
            .map(|rate| (pending.amount * rate).round_dp(2))
            .unwrap_or(Decimal::ZERO);
        let trade = LaneTrade {
            trade_id: trade_id.to_string(),
            amount: pending.amount,
            outcome,
            pnl,
            expected_payout,
            recorded_at: now,
        };

        let effect = match pending.lane_id.as_deref() {
            None => self.settle_base(book, &pending, trade, now).await?,
            Some(lane_id) => self.settle_lane(book, lane_id, trade).await?,
        };

        info!(
            account = %account,
            trade_id,
            outcome = %outcome,
            pnl = %pnl,
            balance = %book.balance,
            effect = %effect,
            "Result processed"
        );
        Ok(effect)
    }

    async fn settle_base(
        &self,
        book: &mut AccountBook,
        pending: &PendingPlacement,
        trade: LaneTrade,
        now: DateTime<Utc>,
    ) -> Result<ResultEffect, LaneError> {
        if trade.outcome == TradeOutcome::Win {
            return Ok(ResultEffect::BaseWin);
        }

        self.refresh_book(book).await?;
        let settings = book.effective_settings();
        let skip = if !self.martingale_enabled() {
            Some("martingale disabled")
        } else if !settings.auto_create_lanes {
            Some("auto-create disabled")
        } else if book.degraded {
            Some("store writes degraded")
        } else if book.lanes_created_today(now) >= settings.max_daily_lanes {
            Some("daily lane limit reached")
        } else if book.active_count() >= settings.max_concurrent_lanes as usize {
            Some("concurrent lane cap reached")
        } else {
            None
        };
        if let Some(reason) = skip {
            info!(account = %book.account, trade_id = %trade.trade_id, reason, "Base loss; no lane opened");
            return Ok(ResultEffect::BaseLoss);
        }

        let lane = self.open_lane(book, &pending.symbol, trade, now).await?;
        Ok(ResultEffect::LaneOpened {
            lane_id: lane.lane_id,
            level: lane.current_level,
        })
    }

    async fn settle_lane(
        &self,
        book: &mut AccountBook,
        lane_id: &str,
        trade: LaneTrade,
    ) -> Result<ResultEffect, LaneError> {
        let lane = self.lane_for_result(book, lane_id).await?;
        if lane.status.is_terminal() {
            warn!(
                account = %book.account,
                lane_id,
                trade_id = %trade.trade_id,
                status = %lane.status,
                "Result for closed lane discarded"
            );
            return Ok(ResultEffect::StaleDiscarded { lane_id: lane_id.to_string() });
        }

        let lane = match self.append_trade(book, lane_id, trade).await {
            Ok(lane) => lane,
            Err(LaneError::LaneTerminal { .. }) => {
                warn!(account = %book.account, lane_id, "Lane closed concurrently; result discarded");
                return Ok(ResultEffect::StaleDiscarded { lane_id: lane_id.to_string() });
            }
            Err(e) => return Err(e),
        };

        Ok(match lane.status {
            LaneStatus::Active => ResultEffect::LaneAdvanced {
                lane_id: lane.lane_id,
                level: lane.current_level,
            },
            LaneStatus::Completed => {
                info!(
                    account = %lane.account,
                    lane_id = %lane.lane_id,
                    invested = %lane.total_invested,
                    trades = lane.trades.len(),
                    "Lane recovered"
                );
                ResultEffect::LaneCompleted { lane_id: lane.lane_id }
            }
            LaneStatus::Cancelled => {
                warn!(
                    account = %lane.account,
                    lane_id = %lane.lane_id,
                    level = lane.current_level,
                    max_level = lane.max_level,
                    invested = %lane.total_invested,
                    "Lane cancelled at max level"
                );
                ResultEffect::LaneCancelled { lane_id: lane.lane_id }
            }
        })
    }

    // -- Operator surface --------------------------------------------------

    /// Force a lane to a terminal status. Idempotent; a pending placement
    /// on the lane will be discarded when its result arrives.
    pub async fn force_terminal(
        &self,
        lane_id: &str,
        status: LaneStatus,
        reason: &str,
    ) -> Result<Lane, LaneError> {
        if !status.is_terminal() {
            return Err(LaneError::Configuration(
                "A lane can only be forced to completed or cancelled".to_string(),
            ));
        }

        let (account, stored) = self.locate_lane(lane_id).await?;
        let book_arc = self.book(&account).await;
        let mut book = book_arc.lock().await;
        if let Some(lane) = stored {
            book.upsert_lane(lane);
        }
        let lane = self.terminate_in_book(&mut book, lane_id, status, reason).await?;
        info!(account = %account, lane_id, status = %lane.status, reason, "Lane closed by operator");
        Ok(lane)
    }

    pub async fn update_settings(
        &self,
        account: &str,
        update: SettingsUpdate,
    ) -> Result<AccountSettings, LaneError> {
        let book_arc = self.book(account).await;
        let mut book = book_arc.lock().await;
        let settings = self
            .store_call("upsert_settings", self.store.upsert_settings(account, &update))
            .await?;
        book.settings = Some(settings.clone());
        Ok(settings)
    }

    /// Drop the cached settings; the next decision re-reads the store.
    pub async fn invalidate_settings(&self, account: &str) {
        let book_arc = self.book(account).await;
        book_arc.lock().await.settings = None;
    }

    pub async fn settings(&self, account: &str) -> Result<AccountSettings, LaneError> {
        let book_arc = self.book(account).await;
        let mut book = book_arc.lock().await;
        self.refresh_book(&mut book).await?;
        Ok(book.effective_settings())
    }

    pub async fn update_balance(&self, account: &str, balance: Decimal) {
        let book_arc = self.book(account).await;
        let mut book = book_arc.lock().await;
        debug!(account, old = %book.balance, new = %balance, "Balance updated");
        book.balance = balance;
    }

    pub async fn balance(&self, account: &str) -> Decimal {
        let book_arc = self.book(account).await;
        let balance = book_arc.lock().await.balance;
        balance
    }

    /// Forget a placement the broker refused. The lane it targeted becomes
    /// eligible again; the cool-down clock is not rewound.
    pub async fn abandon_placement(&self, trade_id: &str) -> Result<PendingPlacement, LaneError> {
        let account = self
            .trade_index
            .read()
            .await
            .get(trade_id)
            .cloned()
            .ok_or_else(|| LaneError::NotFound(trade_id.to_string()))?;
        let book_arc = self.book(&account).await;
        let mut book = book_arc.lock().await;
        let pending = book
            .pending
            .remove(trade_id)
            .ok_or_else(|| LaneError::NotFound(trade_id.to_string()))?;
        self.trade_index.write().await.remove(trade_id);
        info!(account = %account, trade_id, "Placement abandoned");
        Ok(pending)
    }

    pub async fn pending_count(&self) -> usize {
        let mut total = 0;
        for book in self.all_books().await {
            total += book.lock().await.pending.len();
        }
        total
    }

    pub async fn pending_placements(&self, account: &str) -> Vec<PendingPlacement> {
        let book_arc = self.book(account).await;
        let book = book_arc.lock().await;
        let mut placements: Vec<PendingPlacement> = book.pending.values().cloned().collect();
        placements.sort_by(|a, b| a.placed_at.cmp(&b.placed_at));
        placements
    }

    pub async fn is_degraded(&self, account: &str) -> bool {
        let book_arc = self.book(account).await;
        let degraded = book_arc.lock().await.degraded;
        degraded
    }

    pub async fn queued_writes(&self, account: &str) -> usize {
        let book_arc = self.book(account).await;
        let queued = book_arc.lock().await.backlog_len();
        queued
    }

    // -- Maintenance -------------------------------------------------------

    /// Drop placements with no result after `pending_ttl`, and prune lanes
    /// closed before today.
    pub async fn expire_stale_placements(&self) -> usize {
        let now = self.clock.now();
        let ttl = chrono::Duration::from_std(self.config.pending_ttl)
            .unwrap_or_else(|_| chrono::Duration::days(1));
        let mut expired = 0;

        for book_arc in self.all_books().await {
            let mut book = book_arc.lock().await;
            let stale: Vec<String> = book
                .pending
                .values()
                .filter(|p| now - p.placed_at >= ttl)
                .map(|p| p.trade_id.clone())
                .collect();
            if !stale.is_empty() {
                let mut index = self.trade_index.write().await;
                for trade_id in &stale {
                    if let Some(p) = book.pending.remove(trade_id) {
                        index.remove(trade_id);
                        warn!(
                            account = %p.account,
                            trade_id = %p.trade_id,
                            lane_id = p.lane_id.as_deref().unwrap_or("-"),
                            amount = %p.amount,
                            "Placement expired without a result"
                        );
                    }
                }
                expired += stale.len();
            }
            book.prune_closed(day_start(now));
        }
        expired
    }

    /// Replay queued lane writes for accounts whose retry is due. Returns
    /// the number of lanes written.
    pub async fn flush_pending_writes(&self) -> usize {
        let now = self.clock.now();
        let mut written = 0;
        for book_arc in self.all_books().await {
            let mut book = book_arc.lock().await;
            if book.backlog_len() == 0 || !book.retry_due(now) {
                continue;
            }
            written += self.flush_book(&mut book, now).await;
        }
        written
    }

    async fn flush_book(&self, book: &mut AccountBook, now: DateTime<Utc>) -> usize {
        let mut written = 0;
        for lane in book.queued_writes() {
            match self.store_call("put_lane", self.store.put_lane(&lane)).await {
                Ok(applied) => {
                    book.mark_flushed(&lane.lane_id, lane.version);
                    written += 1;
                    if !applied {
                        warn!(
                            account = %book.account,
                            lane_id = %lane.lane_id,
                            version = lane.version,
                            "Store holds a newer lane version; reloading"
                        );
                        book.forget_lane(&lane.lane_id);
                        book.loaded = false;
                    }
                }
                Err(e) => {
                    let degraded_now = book.record_flush_failure(
                        now,
                        self.config.retry_backoff,
                        self.config.max_backoff,
                        self.config.write_retry_limit,
                    );
                    warn!(
                        account = %book.account,
                        error = %e,
                        failures = book.failed_flushes,
                        queued = book.backlog_len(),
                        "Lane write replay failed"
                    );
                    if degraded_now {
                        error!(
                            account = %book.account,
                            "Write retries exhausted; routing base trades only"
                        );
                    }
                    return written;
                }
            }
        }
        if book.record_flush_success() {
            info!(account = %book.account, "Queued writes replayed; lane routing restored");
        }
        written
    }

    /// Delete lanes that closed longer than `lane_retention` ago. Returns 0
    /// when retention is off.
    pub async fn purge_closed_lanes(&self) -> Result<u32, LaneError> {
        let Some(retention) = self.config.lane_retention else {
            return Ok(0);
        };
        let cutoff = self.clock.now() - retention;
        self.store_call("purge_closed_lanes", self.store.purge_closed_lanes(cutoff))
            .await
    }

    pub async fn run_maintenance(&self) -> MaintenanceReport {
        let expired_placements = self.expire_stale_placements().await;
        let flushed_writes = self.flush_pending_writes().await;
        let purged_lanes = match self.purge_closed_lanes().await {
            Ok(purged) => purged,
            Err(e) => {
                warn!(error = %e, "Closed-lane purge failed");
                0
            }
        };
        MaintenanceReport { expired_placements, flushed_writes, purged_lanes }
    }

    /// Run maintenance every `every` until the handle is aborted.
    pub fn spawn_maintenance(self: &Arc<Self>, every: Duration) -> tokio::task::JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let report = manager.run_maintenance().await;
                if report != MaintenanceReport::default() {
                    debug!(
                        expired = report.expired_placements,
                        flushed = report.flushed_writes,
                        purged = report.purged_lanes,
                        "Maintenance pass"
                    );
                }
            }
        })
    }

    // -- Internals ---------------------------------------------------------

    async fn book(&self, account: &str) -> Arc<Mutex<AccountBook>> {
        if let Some(book) = self.books.read().await.get(account) {
            return Arc::clone(book);
        }
        let mut books = self.books.write().await;
        Arc::clone(books.entry(account.to_string()).or_insert_with(|| {
            Arc::new(Mutex::new(AccountBook::new(account, self.config.balance_for(account))))
        }))
    }

    async fn all_books(&self) -> Vec<Arc<Mutex<AccountBook>>> {
        self.books.read().await.values().cloned().collect()
    }

    async fn bounded<T, F>(&self, op: &str, fut: F) -> Result<T, LaneError>
    where
        F: Future<Output = Result<T, LaneError>>,
    {
        match tokio::time::timeout(self.config.operation_timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(LaneError::Timeout(format!(
                "{op} exceeded {}ms",
                self.config.operation_timeout.as_millis()
            ))),
        }
    }

    async fn store_call<T, F>(&self, what: &str, fut: F) -> Result<T, LaneError>
    where
        F: Future<Output = Result<T, LaneError>>,
    {
        match tokio::time::timeout(self.config.store_timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(LaneError::PersistenceUnavailable(format!(
                "{what} timed out after {}ms",
                self.config.store_timeout.as_millis()
            ))),
        }
    }

    /// Load settings and the active-lane snapshot if missing. An
    /// unreachable store is tolerated: decisions use what is in memory.
    async fn refresh_book(&self, book: &mut AccountBook) -> Result<(), LaneError> {
        match self.load_book(book).await {
            Err(e) if e.is_unavailable() => {
                warn!(account = %book.account, error = %e, "Store unavailable; using in-memory snapshot");
                Ok(())
            }
            other => other,
        }
    }

    async fn load_book(&self, book: &mut AccountBook) -> Result<(), LaneError> {
        if book.settings.is_none() {
            let settings = self
                .store_call("get_settings", self.store.get_settings(&book.account))
                .await?;
            book.settings = Some(settings);
        }
        if !book.loaded {
            let now = self.clock.now();
            let lanes = self
                .store_call("get_active_lanes", self.store.get_active_lanes(&book.account))
                .await?;
            let created = self
                .store_call(
                    "count_lanes_created_since",
                    self.store.count_lanes_created_since(&book.account, day_start(now)),
                )
                .await?;
            let count = lanes.len();
            for lane in lanes {
                if !book.has_queued(&lane.lane_id) {
                    book.upsert_lane(lane);
                }
            }
            let created = created.max(book.lanes_created_today(now));
            book.set_created_today(now, created);
            book.loaded = true;
            debug!(account = %book.account, active = count, created_today = created, "Account loaded");
        }
        Ok(())
    }

    async fn lane_for_result(&self, book: &mut AccountBook, lane_id: &str) -> Result<Lane, LaneError> {
        if let Some(lane) = book.lane(lane_id) {
            return Ok(lane.clone());
        }
        let lane = self
            .store_call("get_lane", self.store.get_lane(lane_id))
            .await?
            .ok_or_else(|| LaneError::LaneNotFound(lane_id.to_string()))?;
        book.upsert_lane(lane.clone());
        Ok(lane)
    }

    /// Find the account owning a lane: in-memory books first, then the
    /// store (returning the stored lane).
    async fn locate_lane(&self, lane_id: &str) -> Result<(String, Option<Lane>), LaneError> {
        for book_arc in self.all_books().await {
            let book = book_arc.lock().await;
            if book.lane(lane_id).is_some() {
                return Ok((book.account.clone(), None));
            }
        }
        match self.store_call("get_lane", self.store.get_lane(lane_id)).await? {
            Some(lane) => Ok((lane.account.clone(), Some(lane))),
            None => Err(LaneError::LaneNotFound(lane_id.to_string())),
        }
    }

    /// Record a trade in a lane through the store, retrying once after a
    /// concurrent modification. Queues the write when the store is down, or
    /// when earlier writes for the lane are still queued.
    async fn append_trade(
        &self,
        book: &mut AccountBook,
        lane_id: &str,
        trade: LaneTrade,
    ) -> Result<Lane, LaneError> {
        if book.has_queued(lane_id) {
            let next_amount = self.projected_stake(book, lane_id, &trade)?;
            return apply_locally(book, lane_id, trade, next_amount);
        }

        let mut retried = false;
        loop {
            let next_amount = self.projected_stake(book, lane_id, &trade)?;
            let attempt = self
                .store_call(
                    "append_trade_to_lane",
                    self.store.append_trade_to_lane(lane_id, trade.clone(), next_amount),
                )
                .await;
            match attempt {
                Ok(lane) => {
                    book.upsert_lane(lane.clone());
                    return Ok(lane);
                }
                Err(LaneError::ConcurrentModification { expected, .. }) if !retried => {
                    retried = true;
                    warn!(account = %book.account, lane_id, expected, "Concurrent lane write; reloading");
                    if let Some(fresh) = self.store_call("get_lane", self.store.get_lane(lane_id)).await? {
                        let already = fresh.contains_trade(&trade.trade_id);
                        book.upsert_lane(fresh.clone());
                        if already {
                            return Ok(fresh);
                        }
                    }
                }
                Err(e) if e.is_unavailable() => {
                    warn!(account = %book.account, lane_id, error = %e, "Store unavailable; queuing lane write");
                    return apply_locally(book, lane_id, trade, next_amount);
                }
                Err(e @ LaneError::LaneTerminal { .. }) => {
                    if let Ok(Some(fresh)) = self.store_call("get_lane", self.store.get_lane(lane_id)).await {
                        book.upsert_lane(fresh);
                    }
                    return Err(e);
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Open a lane for a lost base trade, recording that trade as its first.
    async fn open_lane(
        &self,
        book: &mut AccountBook,
        symbol: &str,
        trade: LaneTrade,
        now: DateTime<Utc>,
    ) -> Result<Lane, LaneError> {
        let profile = self.config.profile_for(&book.account);
        let new_lane = NewLane {
            account: book.account.clone(),
            symbol: symbol.to_string(),
            base_amount: profile.base_amount,
            multiplier: profile.multiplier,
            max_level: profile.max_level,
            created_at: book.next_creation_time(now),
        };

        let lane = match self.store_call("create_lane", self.store.create_lane(new_lane.clone())).await {
            Ok(created) => {
                book.note_lane_created(now);
                book.upsert_lane(created.clone());
                self.append_trade(book, &created.lane_id, trade).await?
            }
            Err(e) if e.is_unavailable() => {
                warn!(account = %book.account, error = %e, "Store unavailable; opening lane in memory");
                let mut lane = Lane::open(new_lane);
                let next_amount = self.stake_after(book, &lane, &trade);
                lane.record_trade(trade)?;
                lane.set_projected_stake(next_amount);
                book.note_lane_created(now);
                book.upsert_lane(lane.clone());
                book.queue_write(lane.clone());
                lane
            }
            Err(e) => return Err(e),
        };

        info!(
            account = %lane.account,
            lane_id = %lane.lane_id,
            symbol = %lane.symbol,
            level = lane.current_level,
            invested = %lane.total_invested,
            "Lane opened"
        );
        Ok(lane)
    }

    fn projected_stake(
        &self,
        book: &AccountBook,
        lane_id: &str,
        trade: &LaneTrade,
    ) -> Result<Decimal, LaneError> {
        let lane = book
            .lane(lane_id)
            .ok_or_else(|| LaneError::LaneNotFound(lane_id.to_string()))?;
        Ok(self.stake_after(book, lane, trade))
    }

    /// The stake the next placement into `lane` will be sized at once
    /// `trade` is recorded, from the same calculation `assign_trade` runs.
    fn stake_after(&self, book: &AccountBook, lane: &Lane, trade: &LaneTrade) -> Decimal {
        if trade.outcome == TradeOutcome::Win {
            return lane.current_amount;
        }
        let mut losses = lane.loss_history();
        losses.push(trade.amount);
        let level = lane.current_level + 1;
        let profile = self.config.profile_for(&book.account);
        let decision = self.calculator.next_amount(&StakeRequest {
            loss_history: &losses,
            level,
            base_amount: lane.base_amount,
            multiplier: lane.multiplier,
            payout_rate: self.config.payout_for(&lane.symbol),
            target_profit_ratio: profile.target_profit_ratio,
            balance: book.balance,
        });
        match decision {
            Ok(decision) => decision.amount,
            Err(LaneError::RiskExceeded { needed, .. }) => needed,
            Err(_) => fallback_amount(lane.base_amount, lane.multiplier, level),
        }
    }

    async fn terminate_in_book(
        &self,
        book: &mut AccountBook,
        lane_id: &str,
        status: LaneStatus,
        reason: &str,
    ) -> Result<Lane, LaneError> {
        let now = self.clock.now();
        if !book.has_queued(lane_id) {
            match self
                .store_call("set_terminal", self.store.set_terminal(lane_id, status, reason, now))
                .await
            {
                Ok(lane) => {
                    book.upsert_lane(lane.clone());
                    return Ok(lane);
                }
                Err(e) if e.is_unavailable() => {
                    warn!(account = %book.account, lane_id, error = %e, "Store unavailable; queuing lane close");
                }
                Err(e) => return Err(e),
            }
        }

        let mut lane = book
            .lane(lane_id)
            .cloned()
            .ok_or_else(|| LaneError::LaneNotFound(lane_id.to_string()))?;
        if lane.terminate(status, reason, now)? {
            book.upsert_lane(lane.clone());
            book.queue_write(lane.clone());
        }
        Ok(lane)
    }
}

/// Admission and lane selection for one signal. `Ok(None)` is a base trade.
fn route(
    book: &AccountBook,
    settings: &AccountSettings,
    symbol: &str,
    now: DateTime<Utc>,
) -> Result<Option<Lane>, LaneError> {
    if let Some(remaining_secs) = book.cooldown_remaining(now, settings.cool_down_seconds) {
        return Err(LaneError::Rejected(Rejection::CoolDown { remaining_secs }));
    }

    // Degraded accounts route base trades only and open no lanes.
    let eligible: Vec<&Lane> = if book.degraded {
        Vec::new()
    } else {
        book.eligible_lanes().collect()
    };

    if !book.degraded
        && eligible.is_empty()
        && book.lanes_created_today(now) >= settings.max_daily_lanes
    {
        return Err(LaneError::Rejected(Rejection::DailyLaneLimit {
            limit: settings.max_daily_lanes,
        }));
    }

    if !settings.concurrent_trading_enabled && !book.pending.is_empty() {
        return Err(LaneError::Rejected(Rejection::SequenceInFlight));
    }

    if let Some(lane) = settings
        .lane_assignment_strategy
        .select(eligible.iter().copied(), symbol)
    {
        return Ok(Some(lane.clone()));
    }

    // Every outstanding base trade may become a lane.
    let lanes_in_use = if book.degraded { 0 } else { book.active_count() };
    if lanes_in_use + book.outstanding_base_trades() >= settings.max_concurrent_lanes as usize {
        return Err(LaneError::Rejected(Rejection::ConcurrencyCap {
            limit: settings.max_concurrent_lanes,
        }));
    }
    Ok(None)
}

fn apply_locally(
    book: &mut AccountBook,
    lane_id: &str,
    trade: LaneTrade,
    next_amount: Decimal,
) -> Result<Lane, LaneError> {
    let mut lane = book
        .lane(lane_id)
        .cloned()
        .ok_or_else(|| LaneError::LaneNotFound(lane_id.to_string()))?;
    lane.record_trade(trade)?;
    lane.set_projected_stake(next_amount);
    book.upsert_lane(lane.clone());
    book.queue_write(lane.clone());
    Ok(lane)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
