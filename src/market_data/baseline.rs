// =============================================================================
// Volume Baseline Tracker — rolling per-minute notional statistics
// =============================================================================
//
// Maintains, per symbol, the notional volume of each one-minute bucket over
// the trailing 24 h. The spike detector compares the most recent minute
// against the mean and stddev of the *completed* buckets, so the in-progress
// minute never dilutes its own baseline.
//
// Minutes with no trades count as zero-volume buckets; quiet symbols keep a
// low baseline instead of a survivor-biased one.
// =============================================================================

use std::collections::{HashMap, VecDeque};

use parking_lot::RwLock;
use rust_decimal::prelude::*;
use rust_decimal::Decimal;
use serde::Serialize;

/// 24 h of one-minute buckets.
const WINDOW_MINUTES: i64 = 1440;

/// Rolling mean / stddev of per-minute notional volume for one symbol.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct BaselineStats {
    pub mean: f64,
    pub stddev: f64,
    /// Number of minute slots the statistics cover (1..=1440).
    pub minutes: i64,
}

struct SymbolBaseline {
    /// (minute index, summed notional), oldest-first, contiguous in spirit —
    /// empty minutes are implied zeros.
    buckets: VecDeque<(i64, f64)>,
    first_minute: i64,
}

/// Thread-safe per-symbol baseline tracker. Updated on every trade ingest.
pub struct BaselineTracker {
    inner: RwLock<HashMap<String, SymbolBaseline>>,
}

impl BaselineTracker {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(HashMap::new()),
        }
    }

    /// Fold a trade's notional into its minute bucket.
    pub fn record_trade(&self, symbol: &str, ts_ms: i64, notional_usd: Decimal) {
        let minute = ts_ms.div_euclid(60_000);
        let notional = notional_usd.to_f64().unwrap_or(0.0);

        let mut map = self.inner.write();
        let base = map.entry(symbol.to_string()).or_insert_with(|| SymbolBaseline {
            buckets: VecDeque::new(),
            first_minute: minute,
        });

        match base.buckets.back_mut() {
            Some((m, sum)) if *m == minute => *sum += notional,
            Some((m, _)) if *m > minute => {
                // Late trade for an already-closed bucket; fold it in where it
                // belongs if that bucket is still retained.
                if let Some((_, sum)) = base.buckets.iter_mut().find(|(m2, _)| *m2 == minute) {
                    *sum += notional;
                }
            }
            _ => base.buckets.push_back((minute, notional)),
        }

        // Prune beyond the 24 h window (plus the in-progress minute).
        let cutoff = minute - WINDOW_MINUTES;
        while base.buckets.front().map(|(m, _)| *m < cutoff).unwrap_or(false) {
            base.buckets.pop_front();
        }
    }

    /// Baseline statistics for `symbol` at `now_ms`, over completed minutes
    /// only. Returns `None` for a symbol with no history at all.
    pub fn stats(&self, symbol: &str, now_ms: i64) -> Option<BaselineStats> {
        let cur_minute = now_ms.div_euclid(60_000);
        let map = self.inner.read();
        let base = map.get(symbol)?;

        let start = base.first_minute.max(cur_minute - WINDOW_MINUTES);
        let minutes = (cur_minute - start).max(1);

        let mut total = 0.0_f64;
        let mut total_sq = 0.0_f64;
        for (m, sum) in &base.buckets {
            if *m >= start && *m < cur_minute {
                total += sum;
                total_sq += sum * sum;
            }
        }

        let n = minutes as f64;
        let mean = total / n;
        let var = (total_sq / n - mean * mean).max(0.0);

        Some(BaselineStats {
            mean,
            stddev: var.sqrt(),
            minutes,
        })
    }
}

impl Default for BaselineTracker {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn unknown_symbol_has_no_stats() {
        let t = BaselineTracker::new();
        assert!(t.stats("NEVERSEEN", 0).is_none());
    }

    #[test]
    fn steady_volume_yields_flat_baseline() {
        let t = BaselineTracker::new();
        // 60 minutes of exactly 1000 USD/minute.
        for i in 0..60 {
            t.record_trade("BTCUSDT", i * 60_000, dec!(1000));
        }
        let stats = t.stats("BTCUSDT", 60 * 60_000).unwrap();
        assert!((stats.mean - 1000.0).abs() < 1e-6);
        assert!(stats.stddev < 1e-6);
        assert_eq!(stats.minutes, 60);
    }

    #[test]
    fn in_progress_minute_excluded_from_baseline() {
        let t = BaselineTracker::new();
        for i in 0..30 {
            t.record_trade("BTCUSDT", i * 60_000, dec!(1000));
        }
        // A huge burst in the current minute must not lift the baseline.
        let now = 30 * 60_000 + 5_000;
        t.record_trade("BTCUSDT", now - 1_000, dec!(500000));
        let stats = t.stats("BTCUSDT", now).unwrap();
        assert!((stats.mean - 1000.0).abs() < 1e-6);
    }

    #[test]
    fn empty_minutes_count_as_zero() {
        let t = BaselineTracker::new();
        t.record_trade("BTCUSDT", 0, dec!(1000));
        // Nothing for 9 minutes.
        let stats = t.stats("BTCUSDT", 10 * 60_000).unwrap();
        assert!((stats.mean - 100.0).abs() < 1e-6);
        assert_eq!(stats.minutes, 10);
    }

    #[test]
    fn window_prunes_beyond_24h() {
        let t = BaselineTracker::new();
        t.record_trade("BTCUSDT", 0, dec!(1_000_000));
        let now = (WINDOW_MINUTES + 100) * 60_000;
        t.record_trade("BTCUSDT", now - 30_000, dec!(1000));
        let stats = t.stats("BTCUSDT", now).unwrap();
        // The old million-dollar bucket fell out of the window.
        assert!(stats.mean < 1.0);
    }
}
