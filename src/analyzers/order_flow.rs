// =============================================================================
// Order-Flow Analyzer — directional buy/sell imbalance
// =============================================================================
//
// Looks at the trailing 5 minutes of aggregated trades for a symbol and emits
// an accumulation (long) or distribution (short) candidate when the taker
// flow is lopsided and backed by enough large orders for the symbol's tier.
// =============================================================================

use rust_decimal::prelude::*;
use rust_decimal::Decimal;

use crate::runtime_config::MonitoringConfig;
use crate::types::{Candidate, Direction, Producer, Trade, TradeSide};

/// Buy-ratio bounds for a signal.
const ACCUMULATION_RATIO: f64 = 0.65;
const DISTRIBUTION_RATIO: f64 = 0.35;

/// Analyse a 5-minute trade window. `trades` is a buffer snapshot,
/// oldest-first. Returns at most one candidate.
pub fn analyze(
    trades: &[Trade],
    cfg: &MonitoringConfig,
    symbol: &str,
    now_ms: i64,
) -> Option<Candidate> {
    let tier = cfg.tier_of(symbol);
    let large_floor = Decimal::from_f64(cfg.large_order_threshold(tier)).unwrap_or_default();

    let mut buy_vol = Decimal::ZERO;
    let mut sell_vol = Decimal::ZERO;
    let mut large_buys = 0u32;
    let mut large_sells = 0u32;

    for t in trades {
        match t.side {
            TradeSide::Buy => {
                buy_vol += t.notional_usd;
                if t.notional_usd >= large_floor {
                    large_buys += 1;
                }
            }
            TradeSide::Sell => {
                sell_vol += t.notional_usd;
                if t.notional_usd >= large_floor {
                    large_sells += 1;
                }
            }
        }
    }

    let total = buy_vol + sell_vol;
    if total <= Decimal::ZERO {
        // Ratio undefined on an empty window.
        return None;
    }
    let ratio = (buy_vol / total).to_f64().unwrap_or(0.5);

    let (direction, large_count) = if ratio >= ACCUMULATION_RATIO && large_buys >= cfg.whale_min {
        (Direction::Long, large_buys)
    } else if ratio <= DISTRIBUTION_RATIO && large_sells >= cfg.whale_min {
        (Direction::Short, large_sells)
    } else {
        return None;
    };

    let raw_score = 50.0 + 30.0 * (ratio - 0.5).abs() * 2.0 + (2.0 * large_count as f64).min(15.0);

    Some(Candidate {
        producer: Producer::OrderFlow,
        symbol: symbol.to_string(),
        direction,
        raw_score,
        zone: None,
        notional_usd: total,
        large_orders: large_count,
        ts: now_ms,
    })
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn trade(side: TradeSide, notional: Decimal, ts: i64) -> Trade {
        Trade {
            symbol: "PEPEUSDT".into(),
            exchange: "binance".into(),
            price: dec!(0.00001234),
            side,
            notional_usd: notional,
            ts,
        }
    }

    fn cfg() -> MonitoringConfig {
        MonitoringConfig::default()
    }

    #[test]
    fn empty_window_aborts() {
        assert!(analyze(&[], &cfg(), "PEPEUSDT", 0).is_none());
    }

    #[test]
    fn lopsided_buying_with_large_orders_is_accumulation() {
        // Tier-3 symbol: large-order floor is 2,000 USD.
        // buy_vol = 720k across 7 large + filler, sell_vol = 280k.
        let mut trades = Vec::new();
        for i in 0..7 {
            trades.push(trade(TradeSide::Buy, dec!(100000), i * 1_000));
        }
        trades.push(trade(TradeSide::Buy, dec!(20000), 8_000));
        trades.push(trade(TradeSide::Sell, dec!(280000), 9_000));

        let c = analyze(&trades, &cfg(), "PEPEUSDT", 10_000).expect("candidate");
        assert_eq!(c.direction, Direction::Long);
        assert_eq!(c.large_orders, 8);
        // ratio = 0.72: 50 + 30*0.44 + min(15, 16) = 78.2
        assert!((c.raw_score - 78.2).abs() < 1e-9);
    }

    #[test]
    fn lopsided_selling_is_distribution() {
        let mut trades = Vec::new();
        for i in 0..5 {
            trades.push(trade(TradeSide::Sell, dec!(50000), i * 1_000));
        }
        trades.push(trade(TradeSide::Buy, dec!(50000), 6_000));
        let c = analyze(&trades, &cfg(), "PEPEUSDT", 7_000).expect("candidate");
        assert_eq!(c.direction, Direction::Short);
    }

    #[test]
    fn balanced_flow_emits_nothing() {
        let trades = vec![
            trade(TradeSide::Buy, dec!(100000), 0),
            trade(TradeSide::Sell, dec!(100000), 1_000),
        ];
        assert!(analyze(&trades, &cfg(), "PEPEUSDT", 2_000).is_none());
    }

    #[test]
    fn ratio_without_enough_large_orders_emits_nothing() {
        // 90% buying, but every order is below the tier-3 floor.
        let mut trades = Vec::new();
        for i in 0..20 {
            trades.push(trade(TradeSide::Buy, dec!(900), i * 100));
        }
        trades.push(trade(TradeSide::Sell, dec!(2000), 3_000));
        assert!(analyze(&trades, &cfg(), "PEPEUSDT", 4_000).is_none());
    }

    #[test]
    fn tier1_floor_is_higher() {
        // Same orders on a tier-1 symbol: 5,000 USD orders are not "large".
        let mut trades: Vec<Trade> = (0..5)
            .map(|i| {
                let mut t = trade(TradeSide::Buy, dec!(5000), i * 1_000);
                t.symbol = "BTCUSDT".into();
                t
            })
            .collect();
        trades.push({
            let mut t = trade(TradeSide::Sell, dec!(5000), 6_000);
            t.symbol = "BTCUSDT".into();
            t
        });
        assert!(analyze(&trades, &cfg(), "BTCUSDT", 7_000).is_none());
    }
}
