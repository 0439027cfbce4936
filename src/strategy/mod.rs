//! Strategy layer: stake sizing, lane assignment, and risk clamps.

pub mod assignment;
pub mod risk;
pub mod stake;

use rust_decimal::Decimal;
use rust_decimal_macros::dec;

use crate::types::LaneError;

/// Per-account staking parameters, resolved from configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct StakeProfile {
    pub base_amount: Decimal,
    /// Fallback-formula multiplier; also stored on every lane.
    pub multiplier: Decimal,
    pub max_level: u32,
    /// Target profit of a recovered lane as a fraction of the base amount.
    pub target_profit_ratio: Decimal,
}

impl Default for StakeProfile {
    fn default() -> Self {
        Self {
            base_amount: dec!(1.00),
            multiplier: dec!(2.5),
            max_level: 7,
            target_profit_ratio: dec!(0.05),
        }
    }
}

impl StakeProfile {
    pub fn validate(&self) -> Result<(), LaneError> {
        if self.base_amount <= Decimal::ZERO {
            return Err(LaneError::Configuration(format!(
                "base_amount must be positive, got {}",
                self.base_amount
            )));
        }
        if self.multiplier <= Decimal::ONE {
            return Err(LaneError::Configuration(format!(
                "multiplier must be greater than 1, got {}",
                self.multiplier
            )));
        }
        if self.target_profit_ratio < Decimal::ZERO {
            return Err(LaneError::Configuration(format!(
                "target_profit_ratio must not be negative, got {}",
                self.target_profit_ratio
            )));
        }
        Ok(())
    }
}
