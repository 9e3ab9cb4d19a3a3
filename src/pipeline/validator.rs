// =============================================================================
// Anti-Spam Validator — dedup, cooldown and the hourly rate cap
// =============================================================================
//
// Three gates, checked in order, each with its own drop counter:
//
//   1. Fingerprint dedup  — same (symbol, kind, direction, confidence-bucket)
//                           within the dedup window
//   2. Per-symbol cooldown — one delivery per symbol per cooldown period
//   3. Hourly rate cap     — a sliding one-hour window across all symbols
//
// Maps are pruned in place on every admission check, so the structure stays
// O(active symbols + recent emissions).
// =============================================================================

use std::collections::{HashMap, VecDeque};

use serde::Serialize;
use tracing::debug;

use crate::runtime_config::SignalsConfig;
use crate::types::TradingSignal;

/// Why a signal was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    Duplicate,
    Cooldown,
    RateLimited,
}

impl DropReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Duplicate => "duplicate",
            Self::Cooldown => "cooldown",
            Self::RateLimited => "rate_limited",
        }
    }
}

impl std::fmt::Display for DropReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Per-reason drop totals, exposed on the dashboard snapshot.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct ValidatorCounters {
    pub admitted: u64,
    pub dropped_duplicate: u64,
    pub dropped_cooldown: u64,
    pub dropped_rate_limited: u64,
}

/// Stateful admission control. One instance behind a mutex serves the whole
/// pipeline; all operations are O(1) amortised.
pub struct SpamGuard {
    /// fingerprint -> last emission ts (ms).
    dedup: HashMap<String, i64>,
    /// symbol -> last emission ts (ms).
    cooldown: HashMap<String, i64>,
    /// Emission timestamps in the trailing hour, oldest-first.
    emitted: VecDeque<i64>,
    pub counters: ValidatorCounters,
}

const HOUR_MS: i64 = 3_600_000;

impl SpamGuard {
    pub fn new() -> Self {
        Self {
            dedup: HashMap::new(),
            cooldown: HashMap::new(),
            emitted: VecDeque::new(),
            counters: ValidatorCounters::default(),
        }
    }

    /// Admit or reject a signal. Admission records the signal against all
    /// three gates atomically (the caller holds the lock).
    pub fn admit(
        &mut self,
        signal: &TradingSignal,
        cfg: &SignalsConfig,
        now_ms: i64,
    ) -> Result<(), DropReason> {
        self.prune(cfg, now_ms);

        if let Some(last) = self.dedup.get(&signal.fingerprint) {
            if now_ms - last < cfg.dedup_window_ms() {
                self.counters.dropped_duplicate += 1;
                debug!(symbol = %signal.symbol, fingerprint = %signal.fingerprint, "signal dropped: duplicate");
                return Err(DropReason::Duplicate);
            }
        }

        if let Some(last) = self.cooldown.get(&signal.symbol) {
            if now_ms - last < cfg.cooldown_ms() {
                self.counters.dropped_cooldown += 1;
                debug!(symbol = %signal.symbol, "signal dropped: cooldown");
                return Err(DropReason::Cooldown);
            }
        }

        if self.emitted.len() >= cfg.max_signals_per_hour as usize {
            self.counters.dropped_rate_limited += 1;
            debug!(symbol = %signal.symbol, "signal dropped: rate limited");
            return Err(DropReason::RateLimited);
        }

        self.dedup.insert(signal.fingerprint.clone(), now_ms);
        self.cooldown.insert(signal.symbol.clone(), now_ms);
        self.emitted.push_back(now_ms);
        self.counters.admitted += 1;
        Ok(())
    }

    fn prune(&mut self, cfg: &SignalsConfig, now_ms: i64) {
        let dedup_window = cfg.dedup_window_ms();
        self.dedup.retain(|_, ts| now_ms - *ts < dedup_window);
        let cooldown = cfg.cooldown_ms();
        self.cooldown.retain(|_, ts| now_ms - *ts < cooldown);
        while self.emitted.front().map(|ts| now_ms - ts >= HOUR_MS).unwrap_or(false) {
            self.emitted.pop_front();
        }
    }
}

impl Default for SpamGuard {
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
    use crate::types::{
        fingerprint, ContextAssessment, Direction, Priority, SignalKind, Tier,
    };
    use rust_decimal_macros::dec;

    fn signal(symbol: &str, confidence: f64, ts: i64) -> TradingSignal {
        let kind = SignalKind::Accumulation;
        let direction = Direction::Long;
        TradingSignal {
            id: format!("test-{symbol}-{ts}"),
            symbol: symbol.to_string(),
            kind,
            direction,
            entry: dec!(100),
            stop: dec!(99.5),
            target: dec!(101),
            confidence,
            tier: Tier::Tier3,
            priority: Priority::from_confidence(confidence),
            context: ContextAssessment::Neutral,
            context_stale: false,
            ts,
            fingerprint: fingerprint(symbol, kind, direction, confidence),
        }
    }

    fn cfg() -> SignalsConfig {
        SignalsConfig::default()
    }

    #[test]
    fn duplicate_within_window_dropped() {
        let mut g = SpamGuard::new();
        let cfg = cfg();
        assert!(g.admit(&signal("BTCUSDT", 80.0, 0), &cfg, 0).is_ok());
        let second = signal("BTCUSDT", 80.0, 60_000);
        assert_eq!(g.admit(&second, &cfg, 60_000), Err(DropReason::Duplicate));
        assert_eq!(g.counters.dropped_duplicate, 1);
    }

    #[test]
    fn duplicate_after_window_admitted() {
        let mut g = SpamGuard::new();
        let cfg = cfg();
        assert!(g.admit(&signal("BTCUSDT", 80.0, 0), &cfg, 0).is_ok());
        // Past both dedup window and cooldown.
        assert!(g.admit(&signal("BTCUSDT", 80.0, 400_000), &cfg, 400_000).is_ok());
    }

    #[test]
    fn cooldown_blocks_same_symbol_different_fingerprint() {
        let mut g = SpamGuard::new();
        let cfg = cfg();
        assert!(g.admit(&signal("BTCUSDT", 80.0, 0), &cfg, 0).is_ok());
        // Very different confidence => different fingerprint bucket.
        let other = signal("BTCUSDT", 95.0, 100_000);
        assert_eq!(g.admit(&other, &cfg, 100_000), Err(DropReason::Cooldown));
        assert_eq!(g.counters.dropped_cooldown, 1);
    }

    #[test]
    fn different_symbols_do_not_share_cooldown() {
        let mut g = SpamGuard::new();
        let cfg = cfg();
        assert!(g.admit(&signal("BTCUSDT", 80.0, 0), &cfg, 0).is_ok());
        assert!(g.admit(&signal("ETHUSDT", 80.0, 1_000), &cfg, 1_000).is_ok());
    }

    #[test]
    fn hourly_cap_drops_with_rate_limited_reason() {
        let mut g = SpamGuard::new();
        let cfg = cfg();
        // 60 qualifying signals across 10 symbols spread over 55 minutes.
        let mut admitted = 0;
        let mut rate_limited = 0;
        for i in 0..60i64 {
            let sym = format!("SYM{}USDT", i % 10);
            let ts = i * 55_000; // within the hour, outside per-symbol cooldown
            let conf = 70.0 + (i % 7) as f64 * 5.0; // vary fingerprints
            let mut s = signal(&sym, conf, ts);
            s.fingerprint = format!("fp-{i}");
            match g.admit(&s, &cfg, ts) {
                Ok(()) => admitted += 1,
                Err(DropReason::RateLimited) => rate_limited += 1,
                Err(other) => panic!("unexpected drop: {other}"),
            }
        }
        assert_eq!(admitted, 50);
        assert_eq!(rate_limited, 10);
        assert_eq!(g.counters.dropped_rate_limited, 10);
    }

    #[test]
    fn rate_window_slides() {
        let mut g = SpamGuard::new();
        let cfg = cfg();
        for i in 0..50i64 {
            let mut s = signal(&format!("A{i}"), 80.0, i * 1_000);
            s.fingerprint = format!("fp-{i}");
            assert!(g.admit(&s, &cfg, i * 1_000).is_ok());
        }
        let blocked = signal("LATE", 80.0, 55_000);
        assert_eq!(g.admit(&blocked, &cfg, 55_000), Err(DropReason::RateLimited));
        // An hour after the first emission the window frees up.
        let ok = signal("LATER", 80.0, HOUR_MS + 1_000);
        assert!(g.admit(&ok, &cfg, HOUR_MS + 1_000).is_ok());
    }
}
