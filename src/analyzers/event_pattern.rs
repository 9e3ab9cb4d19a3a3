// =============================================================================
// Event-Pattern Detector — whale events and volume spikes
// =============================================================================
//
// Two sub-detectors over the same 5-minute trade window:
//
// - Whale accumulation/distribution: enough distinct large orders piling up
//   on one side. Direction follows the dominant side.
// - Volume spike: the last minute's notional against the symbol's 24 h
//   per-minute baseline. Direction is None — a spike says "something is
//   happening", not which way.
//
// Both share the tier-aware large-order floor so illiquid symbols do not
// trigger on noise.
// =============================================================================

use rust_decimal::prelude::*;
use rust_decimal::Decimal;

use crate::market_data::BaselineStats;
use crate::runtime_config::MonitoringConfig;
use crate::types::{Candidate, Direction, Producer, Trade, TradeSide};

/// Buy-ratio confirmation band for whale events.
const WHALE_CONFIRM_RATIO: f64 = 0.6;
/// Minimum baseline history before spikes are trusted.
const SPIKE_MIN_MINUTES: i64 = 30;

/// Detect a whale accumulation/distribution in a 5-minute trade window.
pub fn detect_whale(
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
    let mut large_buy_vol = Decimal::ZERO;
    let mut large_sell_vol = Decimal::ZERO;

    for t in trades {
        match t.side {
            TradeSide::Buy => {
                buy_vol += t.notional_usd;
                if t.notional_usd >= large_floor {
                    large_buys += 1;
                    large_buy_vol += t.notional_usd;
                }
            }
            TradeSide::Sell => {
                sell_vol += t.notional_usd;
                if t.notional_usd >= large_floor {
                    large_sells += 1;
                    large_sell_vol += t.notional_usd;
                }
            }
        }
    }

    // A tie is not dominance.
    let (direction, count, side_vol) = if large_buys > large_sells {
        (Direction::Long, large_buys, large_buy_vol)
    } else if large_sells > large_buys {
        (Direction::Short, large_sells, large_sell_vol)
    } else {
        return None;
    };

    if count < cfg.whale_event_min {
        return None;
    }

    let total = buy_vol + sell_vol;
    let ratio = if total > Decimal::ZERO {
        (buy_vol / total).to_f64().unwrap_or(0.5)
    } else {
        0.5
    };
    let confirmed = match direction {
        Direction::Long => ratio >= WHALE_CONFIRM_RATIO,
        Direction::Short => ratio <= 1.0 - WHALE_CONFIRM_RATIO,
        Direction::None => false,
    };

    let raw_score = 50.0 + 4.0 * (count.min(7) as f64) + if confirmed { 5.0 } else { 0.0 };

    Some(Candidate {
        producer: Producer::WhaleEvent,
        symbol: symbol.to_string(),
        direction,
        raw_score,
        zone: None,
        notional_usd: side_vol,
        large_orders: count,
        ts: now_ms,
    })
}

/// Detect an abnormal last-minute volume against the rolling baseline.
///
/// `trades` is the 5-minute window snapshot; only the last 60 s contributes
/// to `v_now`. Fires when `v_now >= max(3µ, µ + 3σ)`.
pub fn detect_volume_spike(
    trades: &[Trade],
    stats: Option<BaselineStats>,
    cfg: &MonitoringConfig,
    symbol: &str,
    now_ms: i64,
) -> Option<Candidate> {
    let stats = stats?;
    if stats.minutes < SPIKE_MIN_MINUTES || stats.mean <= 0.0 {
        return None;
    }

    let v_now: Decimal = trades
        .iter()
        .filter(|t| t.ts >= now_ms - 60_000)
        .map(|t| t.notional_usd)
        .sum();
    let v_now_f = v_now.to_f64().unwrap_or(0.0);

    // Tier floor keeps illiquid symbols from spiking on a single lot.
    let tier = cfg.tier_of(symbol);
    if v_now_f < cfg.large_order_threshold(tier) {
        return None;
    }

    let threshold = (3.0 * stats.mean).max(stats.mean + 3.0 * stats.stddev);
    if v_now_f < threshold {
        return None;
    }

    let multiple = v_now_f / stats.mean;
    let raw_score = (50.0 + 8.0 * (multiple - 3.0)).min(90.0);

    Some(Candidate {
        producer: Producer::VolumeSpike,
        symbol: symbol.to_string(),
        direction: Direction::None,
        raw_score,
        zone: None,
        notional_usd: v_now,
        large_orders: 0,
        ts: now_ms,
    })
}

// =============================================================================
// Tests
// =============================================================================
