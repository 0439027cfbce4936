//! Recovery stake sizing.
//!
//! Computes the next stake for a lane so that a win recoups every loss in
//! the lane plus a target profit, given the broker's payout rate. When no
//! payout rate is known the classic compounding formula is used instead.
//! Either way the result is clamped by the [`SafetyConfig`] limits.

use rust_decimal::{Decimal, RoundingStrategy};
use tracing::debug;

use super::risk::SafetyConfig;
use crate::types::LaneError;

/// Money is staked in whole cents.
const MONEY_DP: u32 = 2;

/// Classic martingale: `base × multiplier^level`. Level 0 is the base trade.
/// Saturates instead of overflowing.
pub fn fallback_amount(base_amount: Decimal, multiplier: Decimal, level: u32) -> Decimal {
    (0..level).fold(base_amount, |acc, _| {
        acc.checked_mul(multiplier).unwrap_or(Decimal::MAX)
    })
}

// ---------------------------------------------------------------------------
// Request / decision
// ---------------------------------------------------------------------------

/// Inputs for one stake computation.
#[derive(Debug, Clone)]
pub struct StakeRequest<'a> {
    /// Stakes lost so far in this lane, oldest first.
    pub loss_history: &'a [Decimal],
    /// Losses recorded in the lane (0 for a base trade).
    pub level: u32,
    pub base_amount: Decimal,
    pub multiplier: Decimal,
    /// Profit per unit staked on a win; `None` selects the fallback formula.
    pub payout_rate: Option<Decimal>,
    pub target_profit_ratio: Decimal,
    pub balance: Decimal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StakeMode {
    /// Payout-aware recovery formula.
    Enhanced,
    /// `base × multiplier^level`.
    Fallback,
}

/// A sized stake.
#[derive(Debug, Clone, PartialEq)]
pub struct StakeDecision {
    pub amount: Decimal,
    /// Unclamped amount, rounded up to cents.
    pub raw: Decimal,
    pub ceiling: Decimal,
    pub mode: StakeMode,
    /// A win at `amount` will not fully recover the lane.
    pub reduced_recovery: bool,
}

// ---------------------------------------------------------------------------
// Calculator
// ---------------------------------------------------------------------------

pub struct StakeCalculator {
    safety: SafetyConfig,
}

impl StakeCalculator {
    pub fn new(safety: SafetyConfig) -> Self {
        Self { safety }
    }

    /// Access the safety configuration.
    pub fn config(&self) -> &SafetyConfig {
        &self.safety
    }

    /// Size the next stake.
    ///
    /// Enhanced formula:
    ///   required_win = Σ losses + base × target_profit_ratio
    ///   raw          = required_win / payout_rate
    ///
    /// Then `amount = clamp(raw, base, min(balance × max_risk_fraction,
    /// progressive_cap(level)))`. The floor wins when the ceiling is below
    /// the base amount; a stake above the balance is refused.
    pub fn next_amount(&self, req: &StakeRequest<'_>) -> Result<StakeDecision, LaneError> {
        if req.base_amount <= Decimal::ZERO {
            return Err(LaneError::Configuration(format!(
                "base_amount must be positive, got {}",
                req.base_amount
            )));
        }
        if req.multiplier <= Decimal::ONE {
            return Err(LaneError::Configuration(format!(
                "multiplier must be greater than 1, got {}",
                req.multiplier
            )));
        }
        if req.target_profit_ratio < Decimal::ZERO {
            return Err(LaneError::Configuration(format!(
                "target_profit_ratio must not be negative, got {}",
                req.target_profit_ratio
            )));
        }

        let (raw, mode) = match req.payout_rate {
            Some(rate) if rate <= Decimal::ZERO => {
                return Err(LaneError::Configuration(format!(
                    "payout_rate must be positive, got {rate}"
                )));
            }
            Some(rate) => {
                let total_losses: Decimal = req.loss_history.iter().copied().sum();
                let target_profit = req.base_amount * req.target_profit_ratio;
                let required_win = total_losses + target_profit;
                let raw = required_win.checked_div(rate).unwrap_or(Decimal::MAX);
                (raw, StakeMode::Enhanced)
            }
            None => (
                fallback_amount(req.base_amount, req.multiplier, req.level),
                StakeMode::Fallback,
            ),
        };

        // Round the target up so an unclamped win never falls a cent short,
        // and the ceiling down so the clamp is never exceeded.
        let raw = raw.round_dp_with_strategy(MONEY_DP, RoundingStrategy::AwayFromZero);
        let ceiling = self
            .safety
            .ceiling(req.base_amount, req.level, req.balance)
            .round_dp_with_strategy(MONEY_DP, RoundingStrategy::ToZero);

        let amount = raw.min(ceiling).max(req.base_amount);

        if amount > req.balance {
            return Err(LaneError::RiskExceeded {
                needed: amount,
                available: req.balance,
            });
        }

        let reduced_recovery = amount < raw;

        debug!(
            level = req.level,
            mode = ?mode,
            raw = %raw,
            ceiling = %ceiling,
            amount = %amount,
            reduced_recovery,
            "Stake sized"
        );

        Ok(StakeDecision {
            amount,
            raw,
            ceiling,
            mode,
            reduced_recovery,
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn calc() -> StakeCalculator {
        StakeCalculator::new(SafetyConfig::default())
    }

    fn request(losses: &[Decimal]) -> StakeRequest<'_> {
        StakeRequest {
            loss_history: losses,
            level: losses.len() as u32,
            base_amount: dec!(1.00),
            multiplier: dec!(2.5),
            payout_rate: Some(dec!(0.85)),
            target_profit_ratio: dec!(0.05),
            balance: dec!(1000),
        }
    }

    #[test]
    fn test_base_case_is_base_amount() {
        let d = calc().next_amount(&request(&[])).unwrap();
        assert_eq!(d.amount, dec!(1.00));
        assert_eq!(d.mode, StakeMode::Enhanced);
        assert!(!d.reduced_recovery);
    }

    #[test]
    fn test_first_recovery_stake() {
        let d = calc().next_amount(&request(&[dec!(1.00)])).unwrap();
        assert_eq!(d.amount, dec!(1.24));
    }

    #[test]
    fn test_second_recovery_stake() {
        let d = calc().next_amount(&request(&[dec!(1.00), dec!(1.24)])).unwrap();
        assert_eq!(d.amount, dec!(2.70));
    }

    #[test]
    fn test_unclamped_win_recovers_target() {
        let losses = [dec!(1.00), dec!(1.24), dec!(2.70)];
        let d = calc().next_amount(&request(&losses)).unwrap();
        assert!(!d.reduced_recovery);
        let total: Decimal = losses.iter().copied().sum();
        let net = d.amount * dec!(0.85) - total;
        assert!(net >= dec!(0.05), "net profit {net} below target");
        // Never more than a cent of payout above the target.
        assert!(net < dec!(0.05) + dec!(0.01));
    }

    #[test]
    fn test_balance_clamp_marks_reduced_recovery() {
        let losses = [dec!(1.00), dec!(1.24)];
        let mut req = request(&losses);
        req.balance = dec!(20); // ceiling = 2.00
        let d = calc().next_amount(&req).unwrap();
        assert_eq!(d.amount, dec!(2.00));
        assert_eq!(d.raw, dec!(2.70));
        assert!(d.reduced_recovery);
    }

    #[test]
    fn test_progressive_cap_clamp() {
        let calc = StakeCalculator::new(SafetyConfig {
            level_cap_growth: dec!(1.1),
            ..Default::default()
        });
        let d = calc.next_amount(&request(&[dec!(1.00)])).unwrap();
        assert_eq!(d.amount, dec!(1.10));
        assert!(d.reduced_recovery);
    }

    #[test]
    fn test_floor_wins_over_small_ceiling() {
        let mut req = request(&[]);
        req.balance = dec!(5); // ceiling 0.50 < base 1.00
        let d = calc().next_amount(&req).unwrap();
        assert_eq!(d.amount, dec!(1.00));
    }

    #[test]
    fn test_stake_above_balance_is_risk_exceeded() {
        let mut req = request(&[]);
        req.balance = dec!(0.50);
        let err = calc().next_amount(&req).unwrap_err();
        assert_eq!(
            err,
            LaneError::RiskExceeded { needed: dec!(1.00), available: dec!(0.50) }
        );
    }

    #[test]
    fn test_fallback_formula() {
        let losses = [dec!(1.00), dec!(2.50)];
        let mut req = request(&losses);
        req.payout_rate = None;
        let d = calc().next_amount(&req).unwrap();
        assert_eq!(d.mode, StakeMode::Fallback);
        assert_eq!(d.amount, dec!(6.25));
    }

    #[test]
    fn test_fallback_level_zero_matches_enhanced() {
        let mut req = request(&[]);
        let enhanced = calc().next_amount(&req).unwrap();
        req.payout_rate = None;
        let fallback = calc().next_amount(&req).unwrap();
        assert_eq!(enhanced.amount, fallback.amount);
    }

    #[test]
    fn test_invalid_configuration() {
        let mut req = request(&[]);
        req.multiplier = dec!(1);
        assert!(matches!(calc().next_amount(&req), Err(LaneError::Configuration(_))));

        let mut req = request(&[]);
        req.payout_rate = Some(dec!(0));
        assert!(matches!(calc().next_amount(&req), Err(LaneError::Configuration(_))));

        let mut req = request(&[]);
        req.base_amount = dec!(-1);
        assert!(matches!(calc().next_amount(&req), Err(LaneError::Configuration(_))));
    }

    #[test]
    fn test_fallback_amount_saturates() {
        assert_eq!(fallback_amount(dec!(1), dec!(10), 200), Decimal::MAX);
        assert_eq!(fallback_amount(dec!(1), dec!(1.5), 2), dec!(2.25));
    }
}
