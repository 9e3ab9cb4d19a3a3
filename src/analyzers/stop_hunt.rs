// =============================================================================
// Stop-Hunt Detector — liquidation cascades with absorption confirmation
// =============================================================================
//
// A stop hunt shows up as a dense cluster of same-side liquidations (the
// cascade) followed by aggressive trading against the liquidated side (the
// absorption). The detector works in two phases:
//
//   1. On every new liquidation, the trailing 30 s window is re-evaluated.
//      A window whose summed notional strictly exceeds the tier threshold
//      with >= 0.6 side dominance becomes a *pending* cascade.
//   2. The pending cascade matures once a full 30 s of trades after its last
//      liquidation is available. Absorption volume then raises or withholds
//      the score bonus, and the candidate is emitted.
//
// Direction follows the squeeze: a short-liquidation cascade forces buying
// and argues for continuation up (long); a long-liquidation cascade mirrors.
// =============================================================================

use std::collections::HashMap;

use rust_decimal::prelude::*;
use rust_decimal::Decimal;
use tracing::debug;

use crate::market_data::EventBufferManager;
use crate::runtime_config::MonitoringConfig;
use crate::types::{Candidate, Direction, Liquidation, LiquidationSide, PriceZone, Producer, TradeSide};

/// Cascade lookback and absorption window length.
const WINDOW_MS: i64 = 30_000;
/// Minimum share of cascade volume on the dominant side.
const DOMINANCE_MIN: f64 = 0.6;

/// A detected cascade waiting for its absorption window to complete.
#[derive(Debug, Clone)]
struct PendingCascade {
    liquidated_side: LiquidationSide,
    direction: Direction,
    zone: PriceZone,
    cascade_volume: Decimal,
    dominance: f64,
    /// Timestamp of the last liquidation in the cascade.
    window_end: i64,
}

/// Stateful stop-hunt detector. One instance serves all symbols; the pending
/// table is keyed by symbol.
pub struct StopHuntDetector {
    pending: HashMap<String, PendingCascade>,
}

impl StopHuntDetector {
    pub fn new() -> Self {
        Self {
            pending: HashMap::new(),
        }
    }

    /// Re-evaluate the cascade window after a liquidation append. Never emits
    /// directly — a qualifying window is parked until absorption can be
    /// measured. An ongoing cascade keeps extending its own window.
    pub fn on_liquidation(
        &mut self,
        buffers: &EventBufferManager,
        cfg: &MonitoringConfig,
        symbol: &str,
        now_ms: i64,
    ) {
        let window = buffers.snapshot_liquidations(symbol, now_ms - WINDOW_MS);
        if window.is_empty() {
            return;
        }

        let tier = cfg.tier_of(symbol);
        let threshold = Decimal::from_f64(cfg.cascade_threshold(tier)).unwrap_or_default();

        let volume: Decimal = window.iter().map(|l| l.notional_usd).sum();
        // Strict: a cascade exactly at the threshold does not trigger.
        if volume <= threshold {
            return;
        }

        let (side, dominance) = match dominant_side(&window, volume) {
            Some(v) => v,
            None => return,
        };
        if dominance < DOMINANCE_MIN {
            return;
        }

        let direction = match side {
            LiquidationSide::ShortLiquidated => Direction::Long,
            LiquidationSide::LongLiquidated => Direction::Short,
        };

        let mut lower = window[0].price;
        let mut upper = window[0].price;
        for l in &window[1..] {
            if l.price < lower {
                lower = l.price;
            }
            if l.price > upper {
                upper = l.price;
            }
        }

        let window_end = window.last().map(|l| l.ts).unwrap_or(now_ms);

        debug!(
            symbol,
            side = %side,
            volume = %volume,
            dominance = format!("{dominance:.2}"),
            "cascade window qualified — awaiting absorption"
        );

        self.pending.insert(
            symbol.to_string(),
            PendingCascade {
                liquidated_side: side,
                direction,
                zone: PriceZone { lower, upper },
                cascade_volume: volume,
                dominance,
                window_end,
            },
        );
    }

    /// Complete any pending cascade whose absorption window has elapsed.
    /// Called from the pipeline flush tick.
    pub fn poll(
        &mut self,
        buffers: &EventBufferManager,
        cfg: &MonitoringConfig,
        symbol: &str,
        now_ms: i64,
    ) -> Option<Candidate> {
        let pending = self.pending.get(symbol)?;
        if now_ms < pending.window_end + WINDOW_MS {
            // Absorption window still in flight — defer.
            return None;
        }
        let pending = self.pending.remove(symbol)?;

        let tier = cfg.tier_of(symbol);
        let absorption_side = match pending.liquidated_side {
            LiquidationSide::ShortLiquidated => TradeSide::Buy,
            LiquidationSide::LongLiquidated => TradeSide::Sell,
        };
        let min_order = Decimal::from_f64(cfg.absorption_min_order(tier)).unwrap_or_default();
        let threshold = Decimal::from_f64(cfg.absorption_threshold(tier)).unwrap_or_default();

        let absorption: Decimal = buffers
            .snapshot_trades(symbol, pending.window_end)
            .iter()
            .filter(|t| {
                t.ts <= pending.window_end + WINDOW_MS
                    && t.side == absorption_side
                    && t.notional_usd >= min_order
            })
            .map(|t| t.notional_usd)
            .sum();

        let absorbed = absorption >= threshold;

        let cascade_threshold =
            Decimal::from_f64(cfg.cascade_threshold(tier)).unwrap_or(Decimal::ONE);
        let volume_f = pending.cascade_volume.to_f64().unwrap_or(0.0);
        let threshold_f = cascade_threshold.to_f64().unwrap_or(1.0).max(1.0);

        let raw_score = 50.0
            + 20.0 * (volume_f / (3.0 * threshold_f)).min(1.0)
            + 15.0 * pending.dominance
            + if absorbed { 20.0 } else { 0.0 };

        debug!(
            symbol,
            absorption = %absorption,
            absorbed,
            score = format!("{raw_score:.1}"),
            "cascade matured"
        );

        Some(Candidate {
            producer: Producer::StopHunt,
            symbol: symbol.to_string(),
            direction: pending.direction,
            raw_score,
            zone: Some(pending.zone),
            notional_usd: pending.cascade_volume,
            large_orders: 0,
            ts: now_ms,
        })
    }

    /// Symbols with a cascade currently awaiting absorption.
    pub fn pending_symbols(&self) -> Vec<String> {
        self.pending.keys().cloned().collect()
    }
}

impl Default for StopHuntDetector {
    fn default() -> Self {
        Self::new()
    }
}

/// Entry/stop/target derived from the cascade zone, decimal all the way.
///
/// Long: enter at the zone top, stop 0.1% of entry below the zone bottom,
/// target at 2:1 reward-to-risk. Short mirrors.
pub fn zone_levels(zone: &PriceZone, direction: Direction) -> (Decimal, Decimal, Decimal) {
    let pad = |entry: Decimal| entry * Decimal::new(1, 3); // 0.1% of entry
    match direction {
        Direction::Short => {
            let entry = zone.lower;
            let stop = zone.upper + pad(entry);
            let target = entry - (stop - entry) * Decimal::TWO;
            (entry, stop, target)
        }
        // A directionless candidate never reaches here; treat as long.
        _ => {
            let entry = zone.upper;
            let stop = zone.lower - pad(entry);
            let target = entry + (entry - stop) * Decimal::TWO;
            (entry, stop, target)
        }
    }
}

fn dominant_side(window: &[Liquidation], total: Decimal) -> Option<(LiquidationSide, f64)> {
    if total <= Decimal::ZERO {
        return None;
    }
    let short_vol: Decimal = window
        .iter()
        .filter(|l| l.side == LiquidationSide::ShortLiquidated)
        .map(|l| l.notional_usd)
        .sum();
    let long_vol = total - short_vol;

    let (side, side_vol) = if short_vol >= long_vol {
        (LiquidationSide::ShortLiquidated, short_vol)
    } else {
        (LiquidationSide::LongLiquidated, long_vol)
    };

    let dominance = (side_vol / total).to_f64().unwrap_or(0.0);
    Some((side, dominance))
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Liquidation, Trade};
    use rust_decimal_macros::dec;

    fn buffers() -> EventBufferManager {
        EventBufferManager::new(1000, 500, 3_600_000, 2_000)
    }

    fn cfg() -> MonitoringConfig {
        MonitoringConfig::default()
    }

    fn short_liq(ts: i64, price: Decimal, notional: Decimal) -> Liquidation {
        Liquidation {
            symbol: "BTCUSDT".into(),
            exchange: "binance".into(),
            price,
            side: LiquidationSide::ShortLiquidated,
            notional_usd: notional,
            ts,
        }
    }

    fn buy(ts: i64, notional: Decimal) -> Trade {
        Trade {
            symbol: "BTCUSDT".into(),
            exchange: "binance".into(),
            price: dec!(96000),
            side: TradeSide::Buy,
            notional_usd: notional,
            ts,
        }
    }

    #[test]
    fn cascade_at_threshold_does_not_trigger() {
        let b = buffers();
        let mut det = StopHuntDetector::new();
        // Exactly 2,000,000 — strict `>` must not fire.
        for i in 0..10 {
            b.append_liquidation(short_liq(i * 1_000, dec!(96000), dec!(200000)));
        }
        det.on_liquidation(&b, &cfg(), "BTCUSDT", 10_000);
        assert!(det.pending_symbols().is_empty());
    }

    #[test]
    fn one_cent_over_threshold_triggers() {
        let b = buffers();
        let mut det = StopHuntDetector::new();
        for i in 0..10 {
            b.append_liquidation(short_liq(i * 1_000, dec!(96000), dec!(200000)));
        }
        b.append_liquidation(short_liq(10_000, dec!(96000), dec!(0.01)));
        det.on_liquidation(&b, &cfg(), "BTCUSDT", 10_000);
        assert_eq!(det.pending_symbols(), vec!["BTCUSDT".to_string()]);
    }

    #[test]
    fn pending_cascade_defers_until_absorption_window_elapses() {
        let b = buffers();
        let mut det = StopHuntDetector::new();
        for i in 0..12 {
            b.append_liquidation(short_liq(i * 1_500, dec!(95900), dec!(200000)));
        }
        det.on_liquidation(&b, &cfg(), "BTCUSDT", 18_000);
        // Last liquidation at 16,500 — window completes at 46,500.
        assert!(det.poll(&b, &cfg(), "BTCUSDT", 30_000).is_none());
        assert!(det.poll(&b, &cfg(), "BTCUSDT", 47_000).is_some());
    }

    #[test]
    fn absorption_present_raises_score() {
        let cfg = cfg();

        // Cascade of 2.4M short liquidations over 20 s, prices 95,800–96,000.
        let build = |with_absorption: bool| -> Candidate {
            let b = buffers();
            let mut det = StopHuntDetector::new();
            for i in 0..12 {
                let price = dec!(95800) + Decimal::from(i * 18);
                b.append_liquidation(short_liq(i * 1_700, price, dec!(200000)));
            }
            det.on_liquidation(&b, &cfg, "BTCUSDT", 19_000);
            if with_absorption {
                // 1.2M of buys in the 30 s after the cascade.
                for i in 0..6 {
                    b.append_trade(buy(20_000 + i * 3_000, dec!(200000)));
                }
            }
            det.poll(&b, &cfg, "BTCUSDT", 60_000).expect("candidate")
        };

        let absorbed = build(true);
        let unabsorbed = build(false);

        assert_eq!(absorbed.direction, Direction::Long);
        assert!((absorbed.raw_score - unabsorbed.raw_score - 20.0).abs() < 1e-9);
        // 50 + 20*min(1, 2.4/6) + 15*1.0 + 20 = 93
        assert!((absorbed.raw_score - 93.0).abs() < 1e-9);
    }

    #[test]
    fn small_absorption_trades_below_floor_ignored() {
        let b = buffers();
        let cfg = cfg();
        let mut det = StopHuntDetector::new();
        for i in 0..12 {
            b.append_liquidation(short_liq(i * 1_000, dec!(95900), dec!(200000)));
        }
        det.on_liquidation(&b, &cfg, "BTCUSDT", 11_000);
        // Plenty of buy volume but every order is under the tier-1 floor.
        for i in 0..100 {
            b.append_trade(buy(12_000 + i * 200, dec!(2000)));
        }
        let c = det.poll(&b, &cfg, "BTCUSDT", 60_000).expect("candidate");
        // No absorption bonus.
        assert!(c.raw_score < 70.0 + 15.0);
    }

    #[test]
    fn mixed_sides_without_dominance_do_not_qualify() {
        let b = buffers();
        let mut det = StopHuntDetector::new();
        for i in 0..6 {
            b.append_liquidation(short_liq(i * 1_000, dec!(96000), dec!(300000)));
            b.append_liquidation(Liquidation {
                side: LiquidationSide::LongLiquidated,
                ..short_liq(i * 1_000 + 500, dec!(96000), dec!(300000))
            });
        }
        det.on_liquidation(&b, &cfg(), "BTCUSDT", 6_000);
        assert!(det.pending_symbols().is_empty());
    }

    #[test]
    fn zone_levels_long_and_short() {
        let zone = PriceZone {
            lower: dec!(95800),
            upper: dec!(96000),
        };
        let (entry, stop, target) = zone_levels(&zone, Direction::Long);
        assert_eq!(entry, dec!(96000));
        assert_eq!(stop, dec!(95704)); // 95800 - 96
        assert_eq!(target, dec!(96592)); // 96000 + 2*296

        let (entry_s, stop_s, target_s) = zone_levels(&zone, Direction::Short);
        assert_eq!(entry_s, dec!(95800));
        assert_eq!(stop_s, dec!(96095.8));
        assert!(target_s < entry_s);
    }
}
