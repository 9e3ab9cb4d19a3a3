// =============================================================================
// Signal Merger — coalesces near-simultaneous candidates into one signal
// =============================================================================
//
// A single market event (a cascade, a burst of whale orders) often trips more
// than one analyzer within moments. Candidates for the same symbol are parked
// for a short coalescing window and merged into one TradingSignal:
//
//   kind       highest-priority producer wins
//   direction  majority vote; ties and directionless votes defer to the
//              highest-priority candidate
//   levels     stop-hunt zone when present, otherwise a band around the most
//              recent trade price
//   confidence max raw score, +5 when two or more producers concurred
// =============================================================================

use std::collections::HashMap;

use rust_decimal::Decimal;
use tracing::debug;
use uuid::Uuid;

use crate::analyzers::stop_hunt::zone_levels;
use crate::market_data::EventBufferManager;
use crate::runtime_config::MonitoringConfig;
use crate::types::{
    fingerprint, Candidate, ContextAssessment, Direction, Priority, Producer, SignalKind,
    TradingSignal,
};

/// Bonus when at least two distinct analyzers agreed.
const CONCURRENCE_BONUS: f64 = 5.0;
/// Fallback stop distance around the last trade price (0.5%).
fn fallback_stop_fraction() -> Decimal {
    Decimal::new(5, 3)
}

struct PendingGroup {
    candidates: Vec<Candidate>,
    opened_at: i64,
}

/// Per-symbol candidate coalescing. Symbols never share a group, so the
/// window cannot reorder signals across symbols.
pub struct SignalMerger {
    pending: HashMap<String, PendingGroup>,
    coalesce_ms: i64,
}

impl SignalMerger {
    pub fn new(coalesce_ms: i64) -> Self {
        Self {
            pending: HashMap::new(),
            coalesce_ms,
        }
    }

    /// Park a candidate. Zero-score candidates are analyzer-error sentinels
    /// and are discarded here.
    pub fn add(&mut self, candidate: Candidate) {
        if candidate.raw_score <= 0.0 {
            return;
        }
        let group = self
            .pending
            .entry(candidate.symbol.clone())
            .or_insert_with(|| PendingGroup {
                candidates: Vec::new(),
                opened_at: candidate.ts,
            });
        group.candidates.push(candidate);
    }

    /// Emit a signal for every group whose coalescing window has elapsed.
    pub fn flush_ready(
        &mut self,
        buffers: &EventBufferManager,
        cfg: &MonitoringConfig,
        now_ms: i64,
    ) -> Vec<TradingSignal> {
        let ready: Vec<String> = self
            .pending
            .iter()
            .filter(|(_, g)| now_ms - g.opened_at >= self.coalesce_ms)
            .map(|(s, _)| s.clone())
            .collect();

        let mut out = Vec::new();
        for symbol in ready {
            if let Some(group) = self.pending.remove(&symbol) {
                if let Some(signal) = merge_group(&symbol, group.candidates, buffers, cfg, now_ms) {
                    out.push(signal);
                }
            }
        }
        out
    }

    /// Number of symbols currently coalescing.
    pub fn pending_groups(&self) -> usize {
        self.pending.len()
    }
}

fn merge_group(
    symbol: &str,
    candidates: Vec<Candidate>,
    buffers: &EventBufferManager,
    cfg: &MonitoringConfig,
    now_ms: i64,
) -> Option<TradingSignal> {
    debug_assert!(!candidates.is_empty());

    let primary = candidates
        .iter()
        .max_by(|a, b| {
            (a.producer.priority(), a.raw_score)
                .partial_cmp(&(b.producer.priority(), b.raw_score))
                .unwrap_or(std::cmp::Ordering::Equal)
        })?
        .clone();

    let direction = vote_direction(&candidates, &primary);
    let kind = SignalKind::from_candidate(primary.producer, direction);

    // Prefer the stop-hunt zone; otherwise band around the last trade.
    let levels = candidates
        .iter()
        .find(|c| c.producer == Producer::StopHunt && c.zone.is_some())
        .and_then(|c| c.zone.as_ref())
        .map(|z| zone_levels(z, direction))
        .or_else(|| last_trade_levels(buffers, symbol, direction, now_ms));

    let (entry, stop, target) = match levels {
        Some(l) => l,
        None => {
            debug!(symbol, "no price reference for merged signal — dropping group");
            return None;
        }
    };

    let max_score = candidates
        .iter()
        .map(|c| c.raw_score)
        .fold(f64::MIN, f64::max);
    let distinct_producers = {
        let mut ps: Vec<Producer> = candidates.iter().map(|c| c.producer).collect();
        ps.sort_by_key(|p| p.priority());
        ps.dedup();
        ps.len()
    };
    let confidence = max_score + if distinct_producers >= 2 { CONCURRENCE_BONUS } else { 0.0 };

    let tier = cfg.tier_of(symbol);
    Some(TradingSignal {
        id: Uuid::new_v4().to_string(),
        symbol: symbol.to_string(),
        kind,
        direction,
        entry,
        stop,
        target,
        confidence,
        tier,
        priority: Priority::from_confidence(confidence),
        context: ContextAssessment::Neutral,
        context_stale: false,
        ts: now_ms,
        fingerprint: fingerprint(symbol, kind, direction, confidence),
    })
}

/// Majority vote over directional candidates; a tie or any directionless
/// candidate defers to the highest-priority one.
fn vote_direction(candidates: &[Candidate], primary: &Candidate) -> Direction {
    if candidates.iter().any(|c| c.direction == Direction::None) {
        return primary.direction;
    }
    let longs = candidates.iter().filter(|c| c.direction == Direction::Long).count();
    let shorts = candidates.iter().filter(|c| c.direction == Direction::Short).count();
    if longs > shorts {
        Direction::Long
    } else if shorts > longs {
        Direction::Short
    } else {
        primary.direction
    }
}

/// Entry at the most recent trade price, stop 0.5% away, target at 2:1 R.
fn last_trade_levels(
    buffers: &EventBufferManager,
    symbol: &str,
    direction: Direction,
    now_ms: i64,
) -> Option<(Decimal, Decimal, Decimal)> {
    // Only the recent past counts as a usable reference.
    let last = buffers.last_trade(symbol).filter(|t| now_ms - t.ts <= 60_000)?;
    let entry = last.price;
    let delta = entry * fallback_stop_fraction();
    match direction {
        Direction::Short => {
            let stop = entry + delta;
            let target = entry - delta * Decimal::TWO;
            Some((entry, stop, target))
        }
        _ => {
            let stop = entry - delta;
            let target = entry + delta * Decimal::TWO;
            Some((entry, stop, target))
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{PriceZone, Trade, TradeSide};
    use rust_decimal_macros::dec;

    fn buffers_with_trade(price: Decimal, ts: i64) -> EventBufferManager {
        let b = EventBufferManager::new(1000, 500, 3_600_000, 2_000);
        b.append_trade(Trade {
            symbol: "PEPEUSDT".into(),
            exchange: "binance".into(),
            price,
            side: TradeSide::Buy,
            notional_usd: dec!(1000),
            ts,
        });
        b
    }

    fn candidate(producer: Producer, direction: Direction, raw_score: f64, ts: i64) -> Candidate {
        Candidate {
            producer,
            symbol: "PEPEUSDT".into(),
            direction,
            raw_score,
            zone: None,
            notional_usd: dec!(100000),
            large_orders: 3,
            ts,
        }
    }

    #[test]
    fn window_holds_until_elapsed() {
        let b = buffers_with_trade(dec!(0.00001234), 0);
        let cfg = MonitoringConfig::default();
        let mut m = SignalMerger::new(2_000);
        m.add(candidate(Producer::OrderFlow, Direction::Long, 75.0, 1_000));
        assert!(m.flush_ready(&b, &cfg, 2_000).is_empty());
        let out = m.flush_ready(&b, &cfg, 3_000);
        assert_eq!(out.len(), 1);
        assert_eq!(m.pending_groups(), 0);
    }

    #[test]
    fn concurrence_bonus_applied_for_two_producers() {
        let b = buffers_with_trade(dec!(0.00001234), 0);
        let cfg = MonitoringConfig::default();
        let mut m = SignalMerger::new(2_000);
        m.add(candidate(Producer::OrderFlow, Direction::Long, 77.0, 0));
        m.add(candidate(Producer::WhaleEvent, Direction::Long, 83.0, 100));
        let out = m.flush_ready(&b, &cfg, 2_500);
        assert_eq!(out.len(), 1);
        let s = &out[0];
        // max(77, 83) + 5
        assert!((s.confidence - 88.0).abs() < 1e-9);
        // Whale beats order-flow in kind selection.
        assert_eq!(s.kind, SignalKind::WhaleAccumulation);
        assert_eq!(s.direction, Direction::Long);
    }

    #[test]
    fn directionless_candidate_defers_to_primary() {
        let b = buffers_with_trade(dec!(0.00001234), 0);
        let cfg = MonitoringConfig::default();
        let mut m = SignalMerger::new(2_000);
        m.add(candidate(Producer::VolumeSpike, Direction::None, 60.0, 0));
        m.add(candidate(Producer::OrderFlow, Direction::Short, 72.0, 100));
        let out = m.flush_ready(&b, &cfg, 2_500);
        assert_eq!(out[0].direction, Direction::Short);
        assert_eq!(out[0].kind, SignalKind::Distribution);
    }

    #[test]
    fn stop_hunt_zone_wins_over_trade_band() {
        let b = buffers_with_trade(dec!(90000), 0);
        let cfg = MonitoringConfig::default();
        let mut m = SignalMerger::new(2_000);
        let mut c = candidate(Producer::StopHunt, Direction::Long, 90.0, 0);
        c.symbol = "PEPEUSDT".into();
        c.zone = Some(PriceZone {
            lower: dec!(95800),
            upper: dec!(96000),
        });
        m.add(c);
        let out = m.flush_ready(&b, &cfg, 2_500);
        assert_eq!(out[0].entry, dec!(96000));
        assert!(out[0].stop < dec!(95800));
        assert_eq!(out[0].kind, SignalKind::StopHunt);
    }

    #[test]
    fn fallback_levels_use_last_trade_with_half_percent_stop() {
        let b = buffers_with_trade(dec!(2.0), 1_000);
        let cfg = MonitoringConfig::default();
        let mut m = SignalMerger::new(2_000);
        m.add(candidate(Producer::OrderFlow, Direction::Long, 75.0, 1_000));
        let out = m.flush_ready(&b, &cfg, 3_500);
        let s = &out[0];
        assert_eq!(s.entry, dec!(2.0));
        assert_eq!(s.stop, dec!(1.990));
        assert_eq!(s.target, dec!(2.020));
    }

    #[test]
    fn group_without_price_reference_is_dropped() {
        let b = EventBufferManager::new(1000, 500, 3_600_000, 2_000);
        let cfg = MonitoringConfig::default();
        let mut m = SignalMerger::new(2_000);
        m.add(candidate(Producer::OrderFlow, Direction::Long, 75.0, 0));
        assert!(m.flush_ready(&b, &cfg, 2_500).is_empty());
    }

    #[test]
    fn zero_score_candidates_are_discarded() {
        let mut m = SignalMerger::new(2_000);
        m.add(candidate(Producer::OrderFlow, Direction::Long, 0.0, 0));
        assert_eq!(m.pending_groups(), 0);
    }
}
