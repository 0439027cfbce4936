//! Configuration loading from TOML.
//!
//! Reads `config.toml` and deserializes into strongly-typed structs. Money
//! values are `Decimal`. Per-account staking overrides live under
//! `[accounts.<name>]`.

use anyhow::{Context, Result};
use rust_decimal::Decimal;
use serde::Deserialize;
use std::collections::HashMap;
use std::fs;
use std::time::Duration;

use crate::engine::ManagerConfig;
use crate::strategy::risk::SafetyConfig;
use crate::strategy::StakeProfile;

/// Default config path; `LANE_ENGINE_CONFIG` overrides it.
pub const DEFAULT_CONFIG_PATH: &str = "config.toml";

/// Top-level application configuration.
#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub engine: EngineConfig,
    pub staking: StakingConfig,
    #[serde(default)]
    pub safety: SafetyConfig,
    pub storage: StorageConfig,
    pub dashboard: DashboardConfig,
    #[serde(default)]
    pub accounts: HashMap<String, AccountOverrides>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct EngineConfig {
    /// Upper bound for one assign/result call, including store I/O.
    pub operation_timeout_ms: u64,
    /// Upper bound for a single store call.
    pub store_timeout_ms: u64,
    /// Placements with no result after this long are dropped.
    pub pending_ttl_secs: u64,
    pub maintenance_interval_secs: u64,
    /// Balance assumed for accounts with no reported balance.
    pub default_balance: Decimal,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StakingConfig {
    pub base_amount: Decimal,
    pub multiplier: Decimal,
    pub max_level: u32,
    pub target_profit_ratio: Decimal,
    /// Broker payout rate; when absent the fallback formula is used.
    #[serde(default)]
    pub payout_rate: Option<Decimal>,
    #[serde(default)]
    pub payout_overrides: HashMap<String, Decimal>,
    /// Off: every signal is a base trade and losses open no lane.
    #[serde(default = "default_true")]
    pub martingale_enabled: bool,
}

fn default_true() -> bool {
    true
}

fn default_retention_days() -> u32 {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    pub database_url: String,
    pub max_connections: u32,
    /// Consecutive failed flushes before an account is degraded.
    pub write_retry_limit: u32,
    pub retry_backoff_ms: u64,
    pub max_backoff_ms: u64,
    /// Closed lanes older than this are purged by maintenance; 0 keeps them.
    #[serde(default = "default_retention_days")]
    pub lane_retention_days: u32,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DashboardConfig {
    pub enabled: bool,
    pub port: u16,
}

/// Per-account overrides of the `[staking]` defaults.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct AccountOverrides {
    pub base_amount: Option<Decimal>,
    pub multiplier: Option<Decimal>,
    pub max_level: Option<u32>,
    pub target_profit_ratio: Option<Decimal>,
    /// Starting balance until the execution side reports one.
    pub balance: Option<Decimal>,
}

impl AppConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &str) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {path}"))?;
        Self::from_toml(&contents).with_context(|| format!("Invalid config file: {path}"))
    }

    /// Parse and validate configuration from a TOML string.
    pub fn from_toml(contents: &str) -> Result<Self> {
        let config: AppConfig =
            toml::from_str(contents).context("Failed to parse configuration")?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        self.safety.validate().context("[safety]")?;
        self.default_profile().validate().context("[staking]")?;
        for account in self.accounts.keys() {
            self.stake_profile(account)
                .validate()
                .with_context(|| format!("[accounts.{account}]"))?;
        }
        if let Some(rate) = self.staking.payout_rate {
            anyhow::ensure!(rate > Decimal::ZERO, "[staking] payout_rate must be positive");
        }
        for (symbol, rate) in &self.staking.payout_overrides {
            anyhow::ensure!(
                *rate > Decimal::ZERO,
                "[staking.payout_overrides] {symbol} must be positive"
            );
        }
        anyhow::ensure!(
            self.engine.store_timeout_ms < self.engine.operation_timeout_ms,
            "[engine] store_timeout_ms must be below operation_timeout_ms"
        );
        anyhow::ensure!(
            self.storage.max_connections > 0,
            "[storage] max_connections must be at least 1"
        );
        Ok(())
    }

    pub fn default_profile(&self) -> StakeProfile {
        StakeProfile {
            base_amount: self.staking.base_amount,
            multiplier: self.staking.multiplier,
            max_level: self.staking.max_level,
            target_profit_ratio: self.staking.target_profit_ratio,
        }
    }

    /// Staking profile for an account, with overrides applied.
    pub fn stake_profile(&self, account: &str) -> StakeProfile {
        let mut profile = self.default_profile();
        if let Some(o) = self.accounts.get(account) {
            if let Some(v) = o.base_amount {
                profile.base_amount = v;
            }
            if let Some(v) = o.multiplier {
                profile.multiplier = v;
            }
            if let Some(v) = o.max_level {
                profile.max_level = v;
            }
            if let Some(v) = o.target_profit_ratio {
                profile.target_profit_ratio = v;
            }
        }
        profile
    }

    /// Build the lane manager's runtime configuration.
    pub fn manager_config(&self) -> ManagerConfig {
        ManagerConfig {
            operation_timeout: Duration::from_millis(self.engine.operation_timeout_ms),
            store_timeout: Duration::from_millis(self.engine.store_timeout_ms),
            pending_ttl: Duration::from_secs(self.engine.pending_ttl_secs),
            write_retry_limit: self.storage.write_retry_limit,
            retry_backoff: Duration::from_millis(self.storage.retry_backoff_ms),
            max_backoff: Duration::from_millis(self.storage.max_backoff_ms),
            default_balance: self.engine.default_balance,
            default_profile: self.default_profile(),
            profiles: self
                .accounts
                .keys()
                .map(|account| (account.clone(), self.stake_profile(account)))
                .collect(),
            balances: self
                .accounts
                .iter()
                .filter_map(|(account, o)| o.balance.map(|b| (account.clone(), b)))
                .collect(),
            payout_rate: self.staking.payout_rate,
            payout_overrides: self.staking.payout_overrides.clone(),
            martingale_enabled: self.staking.martingale_enabled,
            lane_retention: (self.storage.lane_retention_days > 0)
                .then(|| chrono::Duration::days(i64::from(self.storage.lane_retention_days))),
        }
    }
}
