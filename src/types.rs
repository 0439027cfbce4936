//! Shared types for the lane engine.
//!
//! These types form the data model used across all modules: lanes and the
//! trades recorded in them, per-account settings, the signal/placement
//! boundary types, and the domain error enum.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::strategy::stake::fallback_amount;

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// Lane lifecycle status. `Completed` and `Cancelled` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LaneStatus {
    Active,
    Completed,
    Cancelled,
}

impl LaneStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            LaneStatus::Active => "active",
            LaneStatus::Completed => "completed",
            LaneStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, LaneStatus::Active)
    }
}

impl fmt::Display for LaneStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for LaneStatus {
    type Err = LaneError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "active" => Ok(LaneStatus::Active),
            "completed" => Ok(LaneStatus::Completed),
            "cancelled" | "canceled" => Ok(LaneStatus::Cancelled),
            _ => Err(LaneError::Configuration(format!("Unknown lane status: {s}"))),
        }
    }
}

/// Outcome of a settled trade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TradeOutcome {
    Win,
    Loss,
}

impl fmt::Display for TradeOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TradeOutcome::Win => write!(f, "win"),
            TradeOutcome::Loss => write!(f, "loss"),
        }
    }
}

impl std::str::FromStr for TradeOutcome {
    type Err = LaneError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "win" | "won" => Ok(TradeOutcome::Win),
            "loss" | "lose" | "lost" => Ok(TradeOutcome::Loss),
            _ => Err(LaneError::Configuration(format!("Unknown trade outcome: {s}"))),
        }
    }
}

/// Trade direction as supplied by the signal source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Call,
    Put,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Call => write!(f, "CALL"),
            Direction::Put => write!(f, "PUT"),
        }
    }
}

/// Case-insensitive; accepts the buy/sell and up/down spellings signal
/// channels use interchangeably.
impl std::str::FromStr for Direction {
    type Err = LaneError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "call" | "buy" | "up" => Ok(Direction::Call),
            "put" | "sell" | "down" => Ok(Direction::Put),
            _ => Err(LaneError::Configuration(format!("Unknown direction: {s}"))),
        }
    }
}

/// How an incoming signal picks among an account's active lanes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LaneAssignmentStrategy {
    #[default]
    Fifo,
    RoundRobin,
    SymbolPriority,
}

impl LaneAssignmentStrategy {
    pub const ALL: &'static [LaneAssignmentStrategy] = &[
        LaneAssignmentStrategy::Fifo,
        LaneAssignmentStrategy::RoundRobin,
        LaneAssignmentStrategy::SymbolPriority,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            LaneAssignmentStrategy::Fifo => "fifo",
            LaneAssignmentStrategy::RoundRobin => "round_robin",
            LaneAssignmentStrategy::SymbolPriority => "symbol_priority",
        }
    }
}

impl fmt::Display for LaneAssignmentStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for LaneAssignmentStrategy {
    type Err = LaneError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "fifo" => Ok(LaneAssignmentStrategy::Fifo),
            "round_robin" | "roundrobin" => Ok(LaneAssignmentStrategy::RoundRobin),
            "symbol_priority" => Ok(LaneAssignmentStrategy::SymbolPriority),
            _ => Err(LaneError::Configuration(format!(
                "Unknown lane assignment strategy: {s}"
            ))),
        }
    }
}

// ---------------------------------------------------------------------------
// Lane
// ---------------------------------------------------------------------------

/// A trade recorded in a lane. Amounts serialise as strings so the JSON
/// column in the store round-trips exactly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LaneTrade {
    pub trade_id: String,
    #[serde(with = "rust_decimal::serde::str")]
    pub amount: Decimal,
    pub outcome: TradeOutcome,
    #[serde(with = "rust_decimal::serde::str")]
    pub pnl: Decimal,
    /// Profit the trade would have returned on a win (amount × payout rate).
    #[serde(with = "rust_decimal::serde::str")]
    pub expected_payout: Decimal,
    pub recorded_at: DateTime<Utc>,
}

/// Parameters for opening a lane.
#[derive(Debug, Clone, PartialEq)]
pub struct NewLane {
    pub account: String,
    pub symbol: String,
    pub base_amount: Decimal,
    pub multiplier: Decimal,
    pub max_level: u32,
    pub created_at: DateTime<Utc>,
}

/// An independent recovery sequence: consecutive losses are recorded until
/// a win completes it or the level cap cancels it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Lane {
    pub lane_id: String,
    pub account: String,
    /// Symbol that triggered creation; only symbol-priority routing reads it.
    pub symbol: String,
    pub status: LaneStatus,
    /// Number of losses recorded in this lane.
    pub current_level: u32,
    pub base_amount: Decimal,
    /// Next stake as the stake calculator sized it when the last trade
    /// settled. Assignment recomputes it against the current balance.
    pub current_amount: Decimal,
    pub multiplier: Decimal,
    pub max_level: u32,
    pub total_invested: Decimal,
    pub total_potential_payout: Decimal,
    /// Chronological.
    pub trades: Vec<LaneTrade>,
    pub version: u64,
    pub close_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl fmt::Display for Lane {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] {} {} L{}/{} next=${:.2} invested=${:.2} trades={}",
            self.lane_id,
            self.symbol,
            self.status,
            self.current_level,
            self.max_level,
            self.current_amount,
            self.total_invested,
            self.trades.len(),
        )
    }
}

impl Lane {
    /// Lane ids are derived from account, symbol and creation time. Callers
    /// keep creation times strictly increasing per account.
    pub fn lane_id_for(account: &str, symbol: &str, created_at: DateTime<Utc>) -> String {
        format!("{account}:{symbol}:{}", created_at.timestamp_millis())
    }

    /// Build a fresh level-0 lane.
    pub fn open(new_lane: NewLane) -> Self {
        Self {
            lane_id: Self::lane_id_for(&new_lane.account, &new_lane.symbol, new_lane.created_at),
            account: new_lane.account,
            symbol: new_lane.symbol,
            status: LaneStatus::Active,
            current_level: 0,
            base_amount: new_lane.base_amount,
            current_amount: new_lane.base_amount,
            multiplier: new_lane.multiplier,
            max_level: new_lane.max_level,
            total_invested: Decimal::ZERO,
            total_potential_payout: Decimal::ZERO,
            trades: Vec::new(),
            version: 0,
            close_reason: None,
            created_at: new_lane.created_at,
            updated_at: new_lane.created_at,
            completed_at: None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.status == LaneStatus::Active
    }

    pub fn trade_ids(&self) -> impl Iterator<Item = &str> {
        self.trades.iter().map(|t| t.trade_id.as_str())
    }

    pub fn contains_trade(&self, trade_id: &str) -> bool {
        self.trades.iter().any(|t| t.trade_id == trade_id)
    }

    /// Stakes of the losing trades, oldest first.
    pub fn loss_history(&self) -> Vec<Decimal> {
        self.trades
            .iter()
            .filter(|t| t.outcome == TradeOutcome::Loss)
            .map(|t| t.amount)
            .collect()
    }

    /// Sum of recorded stakes. Always equals `total_invested`.
    pub fn recorded_stake_sum(&self) -> Decimal {
        self.trades.iter().map(|t| t.amount).sum()
    }

    /// Apply a settled trade. A win completes the lane, a loss advances it,
    /// and a loss past `max_level` cancels it.
    pub fn record_trade(&mut self, trade: LaneTrade) -> Result<(), LaneError> {
        if self.status.is_terminal() {
            return Err(LaneError::LaneTerminal {
                lane_id: self.lane_id.clone(),
                status: self.status,
            });
        }
        if self.contains_trade(&trade.trade_id) {
            return Err(LaneError::DuplicateTrade(trade.trade_id));
        }

        let at = trade.recorded_at;
        self.total_invested += trade.amount;
        self.total_potential_payout += trade.expected_payout;

        match trade.outcome {
            TradeOutcome::Win => {
                self.status = LaneStatus::Completed;
                self.completed_at = Some(at);
                self.close_reason = Some("recovered".to_string());
            }
            TradeOutcome::Loss => {
                self.current_level += 1;
                if self.current_level > self.max_level {
                    self.status = LaneStatus::Cancelled;
                    self.completed_at = Some(at);
                    self.close_reason = Some("max level exceeded".to_string());
                } else {
                    self.current_amount =
                        fallback_amount(self.base_amount, self.multiplier, self.current_level);
                }
            }
        }

        self.trades.push(trade);
        self.updated_at = at;
        self.version += 1;
        Ok(())
    }

    /// Store the stake the next placement into this lane will use. Ignored
    /// once the lane is terminal.
    pub fn set_projected_stake(&mut self, amount: Decimal) {
        if self.is_active() {
            self.current_amount = amount;
        }
    }

    /// Move the lane to a terminal status. Returns `false` when the lane
    /// was already terminal (no change).
    pub fn terminate(
        &mut self,
        status: LaneStatus,
        reason: &str,
        at: DateTime<Utc>,
    ) -> Result<bool, LaneError> {
        if !status.is_terminal() {
            return Err(LaneError::Configuration(
                "A lane can only be forced to completed or cancelled".to_string(),
            ));
        }
        if self.status.is_terminal() {
            return Ok(false);
        }
        self.status = status;
        self.completed_at = Some(at);
        self.updated_at = at;
        self.close_reason = Some(reason.to_string());
        self.version += 1;
        Ok(true)
    }
}

// ---------------------------------------------------------------------------
// Lane statistics
// ---------------------------------------------------------------------------

/// Aggregate over the lanes an account created within a window.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LaneStatistics {
    pub total_lanes: u32,
    pub completed_lanes: u32,
    pub active_lanes: u32,
    pub cancelled_lanes: u32,
    /// Mean `current_level`, to two places.
    pub avg_level: Decimal,
    pub max_level: u32,
    pub total_invested: Decimal,
    pub total_potential_payout: Decimal,
}

impl LaneStatistics {
    pub fn from_lanes<'a>(lanes: impl IntoIterator<Item = &'a Lane>) -> Self {
        let mut stats = Self::default();
        let mut level_sum: u64 = 0;
        for lane in lanes {
            stats.total_lanes += 1;
            match lane.status {
                LaneStatus::Active => stats.active_lanes += 1,
                LaneStatus::Completed => stats.completed_lanes += 1,
                LaneStatus::Cancelled => stats.cancelled_lanes += 1,
            }
            level_sum += u64::from(lane.current_level);
            stats.max_level = stats.max_level.max(lane.current_level);
            stats.total_invested += lane.total_invested;
            stats.total_potential_payout += lane.total_potential_payout;
        }
        if stats.total_lanes > 0 {
            stats.avg_level =
                (Decimal::from(level_sum) / Decimal::from(stats.total_lanes)).round_dp(2);
        }
        stats
    }
}

// ---------------------------------------------------------------------------
// Account settings
// ---------------------------------------------------------------------------

/// Per-account concurrency and admission settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccountSettings {
    pub account: String,
    pub concurrent_trading_enabled: bool,
    pub max_concurrent_lanes: u32,
    pub lane_assignment_strategy: LaneAssignmentStrategy,
    pub auto_create_lanes: bool,
    pub cool_down_seconds: u32,
    pub max_daily_lanes: u32,
}

impl AccountSettings {
    /// Conservative defaults applied on first reference to an account.
    pub fn defaults_for(account: &str) -> Self {
        Self {
            account: account.to_string(),
            concurrent_trading_enabled: false,
            max_concurrent_lanes: 3,
            lane_assignment_strategy: LaneAssignmentStrategy::Fifo,
            auto_create_lanes: true,
            cool_down_seconds: 0,
            max_daily_lanes: 10,
        }
    }

    pub fn validate(&self) -> Result<(), LaneError> {
        if self.max_concurrent_lanes == 0 {
            return Err(LaneError::Configuration(format!(
                "[{}] max_concurrent_lanes must be at least 1",
                self.account
            )));
        }
        if self.max_daily_lanes == 0 {
            return Err(LaneError::Configuration(format!(
                "[{}] max_daily_lanes must be at least 1",
                self.account
            )));
        }
        Ok(())
    }

    /// Merge a partial update into these settings.
    pub fn apply(&mut self, update: &SettingsUpdate) {
        if let Some(v) = update.concurrent_trading_enabled {
            self.concurrent_trading_enabled = v;
        }
        if let Some(v) = update.max_concurrent_lanes {
            self.max_concurrent_lanes = v;
        }
        if let Some(v) = update.lane_assignment_strategy {
            self.lane_assignment_strategy = v;
        }
        if let Some(v) = update.auto_create_lanes {
            self.auto_create_lanes = v;
        }
        if let Some(v) = update.cool_down_seconds {
            self.cool_down_seconds = v;
        }
        if let Some(v) = update.max_daily_lanes {
            self.max_daily_lanes = v;
        }
    }
}

/// Partial settings update from the operator surface.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SettingsUpdate {
    pub concurrent_trading_enabled: Option<bool>,
    pub max_concurrent_lanes: Option<u32>,
    pub lane_assignment_strategy: Option<LaneAssignmentStrategy>,
    pub auto_create_lanes: Option<bool>,
    pub cool_down_seconds: Option<u32>,
    pub max_daily_lanes: Option<u32>,
}

// ---------------------------------------------------------------------------
// Signal and placement boundary
// ---------------------------------------------------------------------------

/// An opportunity from the signal source. The trade id is chosen by the
/// caller and later identifies the result callback.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeRequest {
    pub account: String,
    pub symbol: String,
    pub direction: Direction,
    pub trade_id: String,
}

impl TradeRequest {
    /// Request with a freshly generated trade id.
    pub fn new(account: &str, symbol: &str, direction: Direction) -> Self {
        Self {
            account: account.to_string(),
            symbol: symbol.to_string(),
            direction,
            trade_id: uuid::Uuid::new_v4().to_string(),
        }
    }

    pub fn with_trade_id(mut self, trade_id: &str) -> Self {
        self.trade_id = trade_id.to_string();
        self
    }
}

/// What the execution subsystem should place.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Placement {
    pub trade_id: String,
    pub account: String,
    pub symbol: String,
    pub direction: Direction,
    pub amount: Decimal,
    /// `None` for a base trade.
    pub lane_id: Option<String>,
    pub level: u32,
    /// The stake was clamped below full recovery.
    pub reduced_recovery: bool,
}

impl fmt::Display for Placement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] {} {} ${:.2} ({}) [{}]",
            self.account,
            self.direction,
            self.symbol,
            self.amount,
            match &self.lane_id {
                Some(id) => format!("lane {id} L{}", self.level),
                None => "base".to_string(),
            },
            self.trade_id,
        )
    }
}

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Why an opportunity was refused without any state change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    CoolDown { remaining_secs: i64 },
    DailyLaneLimit { limit: u32 },
    SequenceInFlight,
    ConcurrencyCap { limit: u32 },
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Rejection::CoolDown { remaining_secs } => {
                write!(f, "cool-down active ({remaining_secs}s remaining)")
            }
            Rejection::DailyLaneLimit { limit } => {
                write!(f, "daily lane limit reached ({limit})")
            }
            Rejection::SequenceInFlight => {
                write!(f, "a trade is already in flight and concurrent trading is disabled")
            }
            Rejection::ConcurrencyCap { limit } => {
                write!(f, "concurrent lane cap reached ({limit})")
            }
        }
    }
}

/// Domain errors. Every variant is scoped to a single account.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum LaneError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Trade not found: {0}")]
    NotFound(String),

    #[error("Lane not found: {0}")]
    LaneNotFound(String),

    #[error("Lane {lane_id} is already {status}")]
    LaneTerminal { lane_id: String, status: LaneStatus },

    #[error("Lane {lane_id} was modified concurrently (read version {expected})")]
    ConcurrentModification { lane_id: String, expected: u64 },

    #[error("Risk limit exceeded: need ${needed:.2}, have ${available:.2}")]
    RiskExceeded { needed: Decimal, available: Decimal },

    #[error("Persistence unavailable: {0}")]
    PersistenceUnavailable(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Duplicate trade id: {0}")]
    DuplicateTrade(String),

    #[error("Trade rejected: {0}")]
    Rejected(Rejection),

    #[error("Storage error: {0}")]
    Storage(String),
}

impl LaneError {
    /// Errors after which the in-memory snapshot keeps serving decisions
    /// and writes are queued.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, LaneError::PersistenceUnavailable(_))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
