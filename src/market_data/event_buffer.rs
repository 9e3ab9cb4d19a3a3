// =============================================================================
// Event Buffer Manager — per-symbol bounded, time-ordered event sequences
// =============================================================================
//
// Holds one liquidation deque and one trade deque per symbol. Writers append
// through the ingest task; analyzers read owned copies of the tail they care
// about and never observe a partially-mutated sequence.
//
// Ordering contract: entries are monotone by `ts`. A late arrival is accepted
// only if `ts >= last.ts - grace_ms`; anything older is dropped and counted.
// Each deque has a hard cap; the oldest entry is evicted on overflow.
// =============================================================================

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;
use serde::Serialize;

use crate::types::{Liquidation, Trade};

/// Drop/eviction counters, exposed on the dashboard snapshot.
#[derive(Debug, Default)]
pub struct BufferCounters {
    pub liquidations_appended: AtomicU64,
    pub trades_appended: AtomicU64,
    pub dropped_out_of_order: AtomicU64,
    pub evicted_capacity: AtomicU64,
    pub swept_retention: AtomicU64,
}

/// Serialisable view of [`BufferCounters`].
#[derive(Debug, Clone, Serialize)]
pub struct BufferCountersSnapshot {
    pub liquidations_appended: u64,
    pub trades_appended: u64,
    pub dropped_out_of_order: u64,
    pub evicted_capacity: u64,
    pub swept_retention: u64,
}

impl BufferCounters {
    pub fn snapshot(&self) -> BufferCountersSnapshot {
        BufferCountersSnapshot {
            liquidations_appended: self.liquidations_appended.load(Ordering::Relaxed),
            trades_appended: self.trades_appended.load(Ordering::Relaxed),
            dropped_out_of_order: self.dropped_out_of_order.load(Ordering::Relaxed),
            evicted_capacity: self.evicted_capacity.load(Ordering::Relaxed),
            swept_retention: self.swept_retention.load(Ordering::Relaxed),
        }
    }
}

struct SymbolBuffers {
    liquidations: VecDeque<Liquidation>,
    trades: VecDeque<Trade>,
}

impl SymbolBuffers {
    fn new(liquidation_cap: usize, trade_cap: usize) -> Self {
        Self {
            liquidations: VecDeque::with_capacity(liquidation_cap.min(64)),
            trades: VecDeque::with_capacity(trade_cap.min(64)),
        }
    }
}

/// Thread-safe per-symbol buffer manager. A single coarse `RwLock` serialises
/// all access; every read copies out, so locks are held only for O(slice).
pub struct EventBufferManager {
    buffers: RwLock<HashMap<String, SymbolBuffers>>,
    liquidation_cap: usize,
    trade_cap: usize,
    retention_ms: i64,
    grace_ms: i64,
    pub counters: BufferCounters,
}

impl EventBufferManager {
    pub fn new(liquidation_cap: usize, trade_cap: usize, retention_ms: i64, grace_ms: i64) -> Self {
        Self {
            buffers: RwLock::new(HashMap::new()),
            liquidation_cap,
            trade_cap,
            retention_ms,
            grace_ms,
            counters: BufferCounters::default(),
        }
    }

    /// Append a liquidation. Returns `false` if the entry was dropped for
    /// violating the ordering contract. Late arrivals within grace are
    /// inserted at their sorted position, keeping the deque monotone by `ts`.
    pub fn append_liquidation(&self, liq: Liquidation) -> bool {
        let mut map = self.buffers.write();
        let buf = map
            .entry(liq.symbol.clone())
            .or_insert_with(|| SymbolBuffers::new(self.liquidation_cap, self.trade_cap));

        if let Some(last) = buf.liquidations.back() {
            if liq.ts < last.ts - self.grace_ms {
                self.counters.dropped_out_of_order.fetch_add(1, Ordering::Relaxed);
                return false;
            }
        }

        let idx = insertion_index(&buf.liquidations, liq.ts, |l| l.ts);
        buf.liquidations.insert(idx, liq);
        while buf.liquidations.len() > self.liquidation_cap {
            buf.liquidations.pop_front();
            self.counters.evicted_capacity.fetch_add(1, Ordering::Relaxed);
        }
        self.counters.liquidations_appended.fetch_add(1, Ordering::Relaxed);
        true
    }

    /// Append a trade. Returns `false` if the entry was dropped for violating
    /// the ordering contract. Late arrivals within grace are inserted at
    /// their sorted position, keeping the deque monotone by `ts`.
    pub fn append_trade(&self, trade: Trade) -> bool {
        let mut map = self.buffers.write();
        let buf = map
            .entry(trade.symbol.clone())
            .or_insert_with(|| SymbolBuffers::new(self.liquidation_cap, self.trade_cap));

        if let Some(last) = buf.trades.back() {
            if trade.ts < last.ts - self.grace_ms {
                self.counters.dropped_out_of_order.fetch_add(1, Ordering::Relaxed);
                return false;
            }
        }

        let idx = insertion_index(&buf.trades, trade.ts, |t| t.ts);
        buf.trades.insert(idx, trade);
        while buf.trades.len() > self.trade_cap {
            buf.trades.pop_front();
            self.counters.evicted_capacity.fetch_add(1, Ordering::Relaxed);
        }
        self.counters.trades_appended.fetch_add(1, Ordering::Relaxed);
        true
    }

    /// Copy of the time-ordered liquidation tail with `ts >= since_ts`,
    /// oldest-first. Empty if the symbol was never seen.
    pub fn snapshot_liquidations(&self, symbol: &str, since_ts: i64) -> Vec<Liquidation> {
        let map = self.buffers.read();
        match map.get(symbol) {
            Some(buf) => buf
                .liquidations
                .iter()
                .filter(|l| l.ts >= since_ts)
                .cloned()
                .collect(),
            None => Vec::new(),
        }
    }

    /// Copy of the trade tail with `ts >= since_ts`, oldest-first.
    pub fn snapshot_trades(&self, symbol: &str, since_ts: i64) -> Vec<Trade> {
        let map = self.buffers.read();
        match map.get(symbol) {
            Some(buf) => buf
                .trades
                .iter()
                .filter(|t| t.ts >= since_ts)
                .cloned()
                .collect(),
            None => Vec::new(),
        }
    }

    /// Most recent trade for a symbol, if any.
    pub fn last_trade(&self, symbol: &str) -> Option<Trade> {
        let map = self.buffers.read();
        map.get(symbol).and_then(|buf| buf.trades.back().cloned())
    }

    /// Drop entries older than the retention horizon. Called periodically by
    /// the sweeper task.
    pub fn sweep(&self, now_ms: i64) {
        let cutoff = now_ms - self.retention_ms;
        let mut swept = 0u64;
        let mut map = self.buffers.write();
        for buf in map.values_mut() {
            while buf.liquidations.front().map(|l| l.ts < cutoff).unwrap_or(false) {
                buf.liquidations.pop_front();
                swept += 1;
            }
            while buf.trades.front().map(|t| t.ts < cutoff).unwrap_or(false) {
                buf.trades.pop_front();
                swept += 1;
            }
        }
        if swept > 0 {
            self.counters.swept_retention.fetch_add(swept, Ordering::Relaxed);
        }
    }

    /// Symbols currently holding any buffered data.
    pub fn symbols(&self) -> Vec<String> {
        self.buffers.read().keys().cloned().collect()
    }

    /// (liquidation_count, trade_count) for a symbol.
    pub fn depth(&self, symbol: &str) -> (usize, usize) {
        let map = self.buffers.read();
        map.get(symbol)
            .map(|b| (b.liquidations.len(), b.trades.len()))
            .unwrap_or((0, 0))
    }
}

/// Position at which an entry with `ts` keeps the deque sorted. Equal
/// timestamps land after existing entries, preserving arrival order. A late
/// arrival is at most `grace_ms` behind the tail, so the walk from the back
/// touches only a handful of entries.
fn insertion_index<T>(deque: &VecDeque<T>, ts: i64, key: impl Fn(&T) -> i64) -> usize {
    let mut idx = deque.len();
    while idx > 0 && key(&deque[idx - 1]) > ts {
        idx -= 1;
    }
    idx
}

// =============================================================================
// Tests
// =============================================================================
