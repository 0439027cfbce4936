//! Risk clamps for recovery stakes.
//!
//! Bounds every stake by a fraction of the account balance and by a
//! progressive per-level cap, optionally limited by an absolute maximum.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::Deserialize;

use super::stake::fallback_amount;
use crate::types::LaneError;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Safety limits applied after the recovery formula.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SafetyConfig {
    /// Largest stake as a fraction of the balance.
    pub max_risk_fraction: Decimal,
    /// The cap at level `k` is `base × level_cap_growth^k`.
    pub level_cap_growth: Decimal,
    /// Absolute stake ceiling, if any.
    #[serde(default)]
    pub max_stake: Option<Decimal>,
}

impl Default for SafetyConfig {
    fn default() -> Self {
        Self {
            max_risk_fraction: dec!(0.10), // 10% of balance per stake
            level_cap_growth: dec!(3),
            max_stake: None,
        }
    }
}

impl SafetyConfig {
    pub fn validate(&self) -> Result<(), LaneError> {
        if self.max_risk_fraction <= Decimal::ZERO || self.max_risk_fraction > Decimal::ONE {
            return Err(LaneError::Configuration(format!(
                "max_risk_fraction must be in (0, 1], got {}",
                self.max_risk_fraction
            )));
        }
        if self.level_cap_growth < Decimal::ONE {
            return Err(LaneError::Configuration(format!(
                "level_cap_growth must be at least 1, got {}",
                self.level_cap_growth
            )));
        }
        if let Some(max) = self.max_stake {
            if max <= Decimal::ZERO {
                return Err(LaneError::Configuration(format!(
                    "max_stake must be positive, got {max}"
                )));
            }
        }
        Ok(())
    }

    /// Per-level cap: `base × growth^level`, bounded by `max_stake`.
    pub fn progressive_cap(&self, base_amount: Decimal, level: u32) -> Decimal {
        let cap = fallback_amount(base_amount, self.level_cap_growth, level);
        match self.max_stake {
            Some(max) => cap.min(max),
            None => cap,
        }
    }

    /// Upper clamp for a stake at `level` given the current balance.
    pub fn ceiling(&self, base_amount: Decimal, level: u32, balance: Decimal) -> Decimal {
        let by_balance = balance.max(Decimal::ZERO) * self.max_risk_fraction;
        by_balance.min(self.progressive_cap(base_amount, level))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
