// =============================================================================
// Market-Context Filter — funding + OI trend vs. signal direction
// =============================================================================
//
// Reads the freshest context snapshot for the symbol and classifies it
// against the signal's direction:
//
//   long:  favorable    when funding <= -f_lo and ΔOI_1h >= +oi_thresh
//          unfavorable  when funding >= +f_hi and ΔOI_1h >= +oi_thresh
//                       (new money piling onto an already-crowded side)
//   short: mirrored
//
// Stale or absent context is neutral, never an error, and flags the signal
// as degraded. The filter adjusts confidence and, depending on the mode,
// decides whether the messaging sink sees the signal at all; the dashboard
// always does.
// =============================================================================

use rust_decimal::prelude::*;

use crate::market_context::ContextStore;
use crate::runtime_config::{FilterMode, MarketContextConfig};
use crate::types::{ContextAssessment, Direction, TradingSignal};

/// Outcome of a context assessment for one signal.
#[derive(Debug, Clone, Copy)]
pub struct ContextVerdict {
    pub assessment: ContextAssessment,
    /// No snapshot, or the freshest one was older than `age_max_secs`.
    pub stale: bool,
    pub confidence_delta: f64,
    /// Keep the signal off the messaging sink (dashboard still sees it).
    pub suppress_sink: bool,
}

/// Assess a signal against the context store and apply the verdict in place.
pub fn apply(
    store: &ContextStore,
    cfg: &MarketContextConfig,
    signal: &mut TradingSignal,
    now_ms: i64,
) -> ContextVerdict {
    let verdict = assess(store, cfg, &signal.symbol, signal.direction, now_ms);
    signal.context = verdict.assessment;
    signal.context_stale = verdict.stale;
    signal.confidence = (signal.confidence + verdict.confidence_delta).clamp(0.0, 100.0);
    signal.priority = crate::types::Priority::from_confidence(signal.confidence);
    verdict
}

/// Pure assessment, shared by the pipeline and tests.
pub fn assess(
    store: &ContextStore,
    cfg: &MarketContextConfig,
    symbol: &str,
    direction: Direction,
    now_ms: i64,
) -> ContextVerdict {
    if !cfg.enabled {
        return neutral(true, cfg);
    }

    let snapshot = match store.latest(symbol) {
        Some(s) if now_ms - s.ts <= (cfg.age_max_secs as i64) * 1000 => s,
        _ => return neutral(true, cfg),
    };

    let funding = snapshot.funding_rate.to_f64().unwrap_or(0.0);
    let oi_change = store.oi_change_1h(symbol, now_ms);

    let oi_confirms = oi_change.map(|c| c >= cfg.oi_threshold).unwrap_or(false);

    let assessment = match direction {
        Direction::Long => {
            if funding <= -cfg.funding_lo && oi_confirms {
                ContextAssessment::Favorable
            } else if funding >= cfg.funding_hi && oi_confirms {
                ContextAssessment::Unfavorable
            } else {
                ContextAssessment::Neutral
            }
        }
        Direction::Short => {
            if funding >= cfg.funding_hi && oi_confirms {
                ContextAssessment::Favorable
            } else if funding <= -cfg.funding_lo && oi_confirms {
                ContextAssessment::Unfavorable
            } else {
                ContextAssessment::Neutral
            }
        }
        Direction::None => ContextAssessment::Neutral,
    };

    let confidence_delta = match assessment {
        ContextAssessment::Favorable => cfg.favorable_bonus,
        ContextAssessment::Unfavorable => -cfg.unfavorable_penalty,
        ContextAssessment::Neutral => {
            // Funding already leaning with the signal earns a nudge even when
            // the OI condition is unmet.
            let leaning = match direction {
                Direction::Long => funding <= -cfg.funding_lo,
                Direction::Short => funding >= cfg.funding_hi,
                Direction::None => false,
            };
            if leaning {
                cfg.neutral_bonus
            } else {
                0.0
            }
        }
    };

    let suppress_sink = match cfg.filter_mode {
        FilterMode::Strict => assessment != ContextAssessment::Favorable,
        FilterMode::Normal => assessment == ContextAssessment::Unfavorable,
        FilterMode::Permissive => false,
    };

    ContextVerdict {
        assessment,
        stale: false,
        confidence_delta,
        suppress_sink,
    }
}

fn neutral(stale: bool, cfg: &MarketContextConfig) -> ContextVerdict {
    ContextVerdict {
        assessment: ContextAssessment::Neutral,
        stale,
        confidence_delta: 0.0,
        // Strict mode passes only favorable; stale context is not favorable.
        suppress_sink: cfg.filter_mode == FilterMode::Strict,
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ContextSnapshot;
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;

    fn store_with(funding: Decimal, oi_then: Decimal, oi_now: Decimal, now: i64) -> ContextStore {
        let store = ContextStore::new(72);
        store.push(ContextSnapshot {
            symbol: "PEPEUSDT".into(),
            ts: now - 3_600_000,
            open_interest_usd: oi_then,
            funding_rate: funding,
            source_exchange: "binance".into(),
        });
        store.push(ContextSnapshot {
            symbol: "PEPEUSDT".into(),
            ts: now - 60_000,
            open_interest_usd: oi_now,
            funding_rate: funding,
            source_exchange: "binance".into(),
        });
        store
    }

    fn cfg() -> MarketContextConfig {
        MarketContextConfig::default()
    }

    #[test]
    fn crowded_long_with_rising_oi_is_unfavorable() {
        let now = 10_000_000;
        // funding +0.03% (0.0003), OI +8%.
        let store = store_with(dec!(0.0003), dec!(1000000), dec!(1080000), now);
        let v = assess(&store, &cfg(), "PEPEUSDT", Direction::Long, now);
        assert_eq!(v.assessment, ContextAssessment::Unfavorable);
        assert_eq!(v.confidence_delta, -10.0);
        assert!(v.suppress_sink); // normal mode suppresses the sink
        assert!(!v.stale);
    }

    #[test]
    fn same_context_favors_a_short() {
        let now = 10_000_000;
        let store = store_with(dec!(0.0003), dec!(1000000), dec!(1080000), now);
        let v = assess(&store, &cfg(), "PEPEUSDT", Direction::Short, now);
        assert_eq!(v.assessment, ContextAssessment::Favorable);
        assert_eq!(v.confidence_delta, 5.0);
        assert!(!v.suppress_sink);
    }

    #[test]
    fn negative_funding_rising_oi_favors_long() {
        let now = 10_000_000;
        let store = store_with(dec!(-0.0002), dec!(1000000), dec!(1050000), now);
        let v = assess(&store, &cfg(), "PEPEUSDT", Direction::Long, now);
        assert_eq!(v.assessment, ContextAssessment::Favorable);
    }

    #[test]
    fn flat_oi_is_neutral_with_leaning_bonus() {
        let now = 10_000_000;
        let store = store_with(dec!(-0.0002), dec!(1000000), dec!(1000000), now);
        let v = assess(&store, &cfg(), "PEPEUSDT", Direction::Long, now);
        assert_eq!(v.assessment, ContextAssessment::Neutral);
        assert_eq!(v.confidence_delta, 2.0);
        assert!(!v.suppress_sink);
    }

    #[test]
    fn stale_snapshot_is_neutral_and_flagged() {
        let now = 100_000_000;
        // Snapshots end an hour before `now` — far past age_max.
        let store = store_with(dec!(0.0003), dec!(1000000), dec!(1080000), now - 3_600_000);
        let v = assess(&store, &cfg(), "PEPEUSDT", Direction::Long, now);
        assert_eq!(v.assessment, ContextAssessment::Neutral);
        assert!(v.stale);
        assert_eq!(v.confidence_delta, 0.0);
    }

    #[test]
    fn absent_symbol_is_neutral_stale() {
        let store = ContextStore::new(72);
        let v = assess(&store, &cfg(), "NEVERSEEN", Direction::Long, 0);
        assert_eq!(v.assessment, ContextAssessment::Neutral);
        assert!(v.stale);
    }

    #[test]
    fn strict_mode_suppresses_everything_but_favorable() {
        let now = 10_000_000;
        let mut strict = cfg();
        strict.filter_mode = FilterMode::Strict;

        let store = store_with(dec!(0.00005), dec!(1000000), dec!(1000000), now);
        let v = assess(&store, &strict, "PEPEUSDT", Direction::Long, now);
        assert_eq!(v.assessment, ContextAssessment::Neutral);
        assert!(v.suppress_sink);
    }

    #[test]
    fn permissive_mode_never_suppresses() {
        let now = 10_000_000;
        let mut permissive = cfg();
        permissive.filter_mode = FilterMode::Permissive;

        let store = store_with(dec!(0.0003), dec!(1000000), dec!(1080000), now);
        let v = assess(&store, &permissive, "PEPEUSDT", Direction::Long, now);
        assert_eq!(v.assessment, ContextAssessment::Unfavorable);
        assert!(!v.suppress_sink);
    }

    #[test]
    fn directionless_signal_is_neutral() {
        let now = 10_000_000;
        let store = store_with(dec!(0.0003), dec!(1000000), dec!(1080000), now);
        let v = assess(&store, &cfg(), "PEPEUSDT", Direction::None, now);
        assert_eq!(v.assessment, ContextAssessment::Neutral);
        assert_eq!(v.confidence_delta, 0.0);
    }
}
