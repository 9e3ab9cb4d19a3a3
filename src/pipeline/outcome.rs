// =============================================================================
// Outcome Tracker — labels delivered signals at the check horizon
// =============================================================================
//
// Every delivered signal is parked with a due time of `ts + horizon`. A
// periodic monitor drains matured entries, reads the freshest trade for the
// symbol and labels the signal:
//
//   no trade in the last 60 s   -> one deferred retry, then Expired
//   progress-to-target >= frac  -> Win
//   otherwise                   -> Loss
//
// Progress is `(price - entry) / (target - entry)` for longs and the mirror
// for shorts. Outcomes are persisted and fed back into the confidence scorer
// under its single write lock.
// =============================================================================

use rust_decimal::prelude::*;

use crate::types::{Direction, OutcomeLabel, SignalOutcome, Trade, TradingSignal};

/// How fresh the reference trade must be at check time.
const PRICE_FRESHNESS_MS: i64 = 60_000;
/// Deferral before the single retry when no fresh price exists.
const RETRY_DELAY_MS: i64 = 60_000;

/// A delivered signal waiting for its horizon.
#[derive(Debug, Clone)]
pub struct PendingOutcome {
    pub signal: TradingSignal,
    pub due_ms: i64,
    pub retried: bool,
}

/// FIFO of signals awaiting their outcome check.
pub struct OutcomeTracker {
    pending: Vec<PendingOutcome>,
}

impl OutcomeTracker {
    pub fn new() -> Self {
        Self { pending: Vec::new() }
    }

    /// Park a delivered signal until `signal.ts + horizon_ms`.
    pub fn schedule(&mut self, signal: TradingSignal, horizon_ms: i64) {
        let due_ms = signal.ts + horizon_ms;
        self.pending.push(PendingOutcome {
            signal,
            due_ms,
            retried: false,
        });
    }

    /// Drain every entry whose due time has passed.
    pub fn due(&mut self, now_ms: i64) -> Vec<PendingOutcome> {
        let mut matured = Vec::new();
        let mut remaining = Vec::with_capacity(self.pending.len());
        for entry in self.pending.drain(..) {
            if entry.due_ms <= now_ms {
                matured.push(entry);
            } else {
                remaining.push(entry);
            }
        }
        self.pending = remaining;
        matured
    }

    /// Re-park an entry once after a missing price; the second miss expires.
    pub fn defer_once(&mut self, mut entry: PendingOutcome) {
        entry.due_ms += RETRY_DELAY_MS;
        entry.retried = true;
        self.pending.push(entry);
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}

impl Default for OutcomeTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// Label a matured signal against the freshest trade. `None` means no fresh
/// price was available — the caller decides between retry and Expired.
pub fn evaluate(
    signal: &TradingSignal,
    last_trade: Option<&Trade>,
    now_ms: i64,
    win_fraction: f64,
) -> Option<SignalOutcome> {
    let trade = last_trade.filter(|t| now_ms - t.ts <= PRICE_FRESHNESS_MS)?;
    let price = trade.price;

    let progress = progress_to_target(signal, price);
    let label = if progress >= win_fraction {
        OutcomeLabel::Win
    } else {
        OutcomeLabel::Loss
    };

    Some(SignalOutcome {
        signal_id: signal.id.clone(),
        ts: now_ms,
        price_at_check: price,
        pct_to_target: progress,
        label,
    })
}

/// An expired outcome for a signal that never got a fresh price.
pub fn expired(signal: &TradingSignal, now_ms: i64) -> SignalOutcome {
    SignalOutcome {
        signal_id: signal.id.clone(),
        ts: now_ms,
        price_at_check: signal.entry,
        pct_to_target: 0.0,
        label: OutcomeLabel::Expired,
    }
}

fn progress_to_target(signal: &TradingSignal, price: rust_decimal::Decimal) -> f64 {
    let denom = match signal.direction {
        Direction::Short => signal.entry - signal.target,
        _ => signal.target - signal.entry,
    };
    if denom <= rust_decimal::Decimal::ZERO {
        return 0.0;
    }
    let numer = match signal.direction {
        Direction::Short => signal.entry - price,
        _ => price - signal.entry,
    };
    (numer / denom).to_f64().unwrap_or(0.0)
}

// =============================================================================
// Tests
// =============================================================================
