//! Lane assignment strategies.
//!
//! Given the lanes an account could route a signal into, pick one. The
//! strategy is a plain enum dispatched by `match`, keyed by the account's
//! `lane_assignment_strategy` setting.

use tracing::debug;

use crate::types::{Lane, LaneAssignmentStrategy};

impl LaneAssignmentStrategy {
    /// Select a lane for a signal on `symbol`. Returns `None` only when
    /// `lanes` is empty.
    ///
    /// - `fifo`: oldest lane.
    /// - `round_robin`: fewest recorded trades, then oldest.
    /// - `symbol_priority`: oldest lane on `symbol`, else oldest overall.
    pub fn select<'a, I>(&self, lanes: I, symbol: &str) -> Option<&'a Lane>
    where
        I: IntoIterator<Item = &'a Lane>,
    {
        let lanes: Vec<&Lane> = lanes.into_iter().collect();

        let chosen = match self {
            LaneAssignmentStrategy::Fifo => oldest(&lanes),
            LaneAssignmentStrategy::RoundRobin => lanes
                .iter()
                .copied()
                .min_by(|a, b| {
                    a.trades
                        .len()
                        .cmp(&b.trades.len())
                        .then(a.created_at.cmp(&b.created_at))
                        .then_with(|| a.lane_id.cmp(&b.lane_id))
                }),
            LaneAssignmentStrategy::SymbolPriority => {
                let matching: Vec<&Lane> =
                    lanes.iter().copied().filter(|l| l.symbol == symbol).collect();
                oldest(&matching).or_else(|| oldest(&lanes))
            }
        };

        if let Some(lane) = chosen {
            debug!(
                strategy = %self,
                lane_id = %lane.lane_id,
                lane_symbol = %lane.symbol,
                symbol,
                trades = lane.trades.len(),
                candidates = lanes.len(),
                "Lane selected"
            );
        }

        chosen
    }
}

fn oldest<'a>(lanes: &[&'a Lane]) -> Option<&'a Lane> {
    lanes
        .iter()
        .copied()
        .min_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.lane_id.cmp(&b.lane_id)))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{LaneTrade, NewLane, TradeOutcome};
    use chrono::{DateTime, Duration, TimeZone, Utc};
    use rust_decimal_macros::dec;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 2, 9, 0, 0).unwrap()
    }

    fn lane(symbol: &str, created_at: DateTime<Utc>, losses: usize) -> Lane {
        let mut lane = Lane::open(NewLane {
            account: "acct-1".into(),
            symbol: symbol.into(),
            base_amount: dec!(1),
            multiplier: dec!(2),
            max_level: 7,
            created_at,
        });
        for i in 0..losses {
            lane.record_trade(LaneTrade {
                trade_id: format!("{symbol}-{i}"),
                amount: dec!(1),
                outcome: TradeOutcome::Loss,
                pnl: dec!(-1),
                expected_payout: dec!(0.85),
                recorded_at: created_at + Duration::minutes(i as i64 + 1),
            })
            .unwrap();
        }
        lane
    }

    /// L1: no trades, created t0. L2: two trades, created t1 > t0.
    fn l1_l2() -> Vec<Lane> {
        vec![
            lane("GBPUSD", t0() + Duration::minutes(30), 2),
            lane("EURUSD", t0(), 0),
        ]
    }

    #[test]
    fn test_round_robin_prefers_fewest_trades() {
        let lanes = l1_l2();
        let chosen = LaneAssignmentStrategy::RoundRobin.select(&lanes, "USDJPY").unwrap();
        assert_eq!(chosen.symbol, "EURUSD");
    }

    #[test]
    fn test_fifo_prefers_oldest() {
        let lanes = l1_l2();
        let chosen = LaneAssignmentStrategy::Fifo.select(&lanes, "GBPUSD").unwrap();
        assert_eq!(chosen.symbol, "EURUSD");
    }

    #[test]
    fn test_symbol_priority_prefers_matching_symbol() {
        let lanes = l1_l2();
        let chosen = LaneAssignmentStrategy::SymbolPriority.select(&lanes, "GBPUSD").unwrap();
        assert_eq!(chosen.symbol, "GBPUSD");
    }

    #[test]
    fn test_symbol_priority_falls_back_to_fifo() {
        let lanes = l1_l2();
        let chosen = LaneAssignmentStrategy::SymbolPriority.select(&lanes, "AUDCAD").unwrap();
        assert_eq!(chosen.symbol, "EURUSD");
    }

    #[test]
    fn test_symbol_priority_oldest_among_matches() {
        let lanes = vec![
            lane("EURUSD", t0() + Duration::minutes(10), 0),
            lane("GBPUSD", t0(), 0),
            lane("EURUSD", t0() + Duration::minutes(5), 3),
        ];
        let chosen = LaneAssignmentStrategy::SymbolPriority.select(&lanes, "EURUSD").unwrap();
        assert_eq!(chosen.created_at, t0() + Duration::minutes(5));
    }

    #[test]
    fn test_round_robin_ties_broken_by_age() {
        let lanes = vec![
            lane("EURUSD", t0() + Duration::minutes(10), 1),
            lane("GBPUSD", t0() + Duration::minutes(5), 1),
            lane("USDJPY", t0() + Duration::minutes(1), 2),
        ];
        let chosen = LaneAssignmentStrategy::RoundRobin.select(&lanes, "EURUSD").unwrap();
        assert_eq!(chosen.symbol, "GBPUSD");
    }

    #[test]
    fn test_empty_candidates() {
        for strategy in LaneAssignmentStrategy::ALL {
            assert!(strategy.select(&Vec::<Lane>::new(), "EURUSD").is_none());
        }
    }
}
