// =============================================================================
// Market Context Module
// =============================================================================
//
// Periodically-polled open-interest and funding-rate snapshots, kept in a
// bounded per-symbol ring, plus the filter that turns the freshest snapshot
// into a favorable / neutral / unfavorable verdict for a signal.

pub mod filter;
pub mod poller;

use std::collections::{HashMap, VecDeque};

use parking_lot::RwLock;
use rust_decimal::prelude::*;

use crate::types::ContextSnapshot;

/// Bounded per-symbol ring of context snapshots (~6 h at the 5-minute
/// default cadence with 72 entries).
pub struct ContextStore {
    rings: RwLock<HashMap<String, VecDeque<ContextSnapshot>>>,
    max_snapshots: usize,
}

impl ContextStore {
    pub fn new(max_snapshots: usize) -> Self {
        Self {
            rings: RwLock::new(HashMap::new()),
            max_snapshots,
        }
    }

    /// Append a snapshot, evicting the oldest entry beyond the ring cap.
    pub fn push(&self, snapshot: ContextSnapshot) {
        let mut rings = self.rings.write();
        let ring = rings
            .entry(snapshot.symbol.clone())
            .or_insert_with(|| VecDeque::with_capacity(self.max_snapshots));
        ring.push_back(snapshot);
        while ring.len() > self.max_snapshots {
            ring.pop_front();
        }
    }

    /// The most recent snapshot for a symbol, if any.
    pub fn latest(&self, symbol: &str) -> Option<ContextSnapshot> {
        self.rings.read().get(symbol).and_then(|r| r.back().cloned())
    }

    /// Fractional open-interest change over the hour before `now_ms`.
    ///
    /// The reference value one hour ago is linearly interpolated between the
    /// two snapshots bracketing that instant; without a snapshot at or before
    /// it there is nothing to interpolate from and `None` is returned.
    pub fn oi_change_1h(&self, symbol: &str, now_ms: i64) -> Option<f64> {
        let rings = self.rings.read();
        let ring = rings.get(symbol)?;
        let newest = ring.back()?;
        let target = now_ms - 3_600_000;

        let mut before: Option<&ContextSnapshot> = None;
        let mut after: Option<&ContextSnapshot> = None;
        for snap in ring.iter() {
            if snap.ts <= target {
                before = Some(snap);
            } else {
                after = Some(snap);
                break;
            }
        }

        let oi_then = match (before, after) {
            (Some(b), Some(a)) if a.ts > b.ts => {
                let span = (a.ts - b.ts) as f64;
                let frac = (target - b.ts) as f64 / span;
                let b_oi = b.open_interest_usd.to_f64()?;
                let a_oi = a.open_interest_usd.to_f64()?;
                b_oi + (a_oi - b_oi) * frac
            }
            (Some(b), _) => b.open_interest_usd.to_f64()?,
            (None, _) => return None,
        };

        if oi_then <= 0.0 {
            return None;
        }
        let oi_now = newest.open_interest_usd.to_f64()?;
        Some((oi_now - oi_then) / oi_then)
    }

    /// Symbols with at least one snapshot.
    pub fn symbols(&self) -> Vec<String> {
        self.rings.read().keys().cloned().collect()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;

    fn snap(ts: i64, oi: Decimal) -> ContextSnapshot {
        ContextSnapshot {
            symbol: "BTCUSDT".into(),
            ts,
            open_interest_usd: oi,
            funding_rate: dec!(0.0001),
            source_exchange: "binance".into(),
        }
    }

    #[test]
    fn ring_evicts_beyond_cap() {
        let store = ContextStore::new(3);
        for i in 0..5 {
            store.push(snap(i * 300_000, dec!(1000000)));
        }
        let latest = store.latest("BTCUSDT").unwrap();
        assert_eq!(latest.ts, 4 * 300_000);
        // Oldest two evicted: ΔOI from ts=600k onward only.
        assert!(store.oi_change_1h("BTCUSDT", 600_000 + 3_600_000).is_some());
    }

    #[test]
    fn latest_on_unknown_symbol_is_none() {
        let store = ContextStore::new(72);
        assert!(store.latest("NEVERSEEN").is_none());
        assert!(store.oi_change_1h("NEVERSEEN", 0).is_none());
    }

    #[test]
    fn oi_change_with_exact_bucket() {
        let store = ContextStore::new(72);
        store.push(snap(0, dec!(1000000)));
        store.push(snap(3_600_000, dec!(1080000)));
        let change = store.oi_change_1h("BTCUSDT", 3_600_000).unwrap();
        assert!((change - 0.08).abs() < 1e-9);
    }

    #[test]
    fn oi_change_interpolates_between_buckets() {
        let store = ContextStore::new(72);
        // Snapshots at t=0 (1.0M) and t=40min (1.4M); target t-1h = 20min
        // from a now of 80min — interpolated OI there is 1.2M.
        store.push(snap(0, dec!(1000000)));
        store.push(snap(2_400_000, dec!(1400000)));
        store.push(snap(4_800_000, dec!(1500000)));
        let change = store.oi_change_1h("BTCUSDT", 4_800_000).unwrap();
        assert!((change - 0.25).abs() < 1e-9);
    }

    #[test]
    fn oi_change_without_history_is_none() {
        let store = ContextStore::new(72);
        store.push(snap(3_600_000, dec!(1000000)));
        // Nothing at or before now-1h.
        assert!(store.oi_change_1h("BTCUSDT", 3_700_000).is_none());
    }
}
