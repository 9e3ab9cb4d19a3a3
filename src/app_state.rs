// =============================================================================
// Central Application State — Vigil intelligence pipeline
// =============================================================================
//
// The single source of truth for the whole pipeline. All tasks hold an
// `Arc<AppState>`; the dashboard REST/WS surface renders from the snapshot
// builder here.
//
// Thread safety:
//   - Atomic counters for lock-free statistics and version tracking.
//   - parking_lot locks for the mutable pipeline stages; each lock is held
//     only for O(1)/O(slice) work, never across I/O.
//   - The broadcast channel fans new signals out to WebSocket sessions with
//     an owned copy per subscriber.
// =============================================================================

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use rust_decimal::prelude::*;
use rust_decimal::Decimal;
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::warn;

use crate::market_context::ContextStore;
use crate::market_data::{BaselineTracker, EventBufferManager};
use crate::persistence::SignalStore;
use crate::pipeline::merger::SignalMerger;
use crate::pipeline::outcome::OutcomeTracker;
use crate::pipeline::scorer::{ConfidenceScorer, ConfidenceState};
use crate::pipeline::validator::{SpamGuard, ValidatorCounters};
use crate::runtime_config::RuntimeConfig;
use crate::types::{TradeSide, TradingSignal};

/// Recent-signal ring size for the dashboard.
const MAX_RECENT_SIGNALS: usize = 100;
/// Broadcast capacity for the WS push channel.
const SIGNAL_CHANNEL_CAPACITY: usize = 256;

/// State-blob keys in the signal store.
pub const BLOB_CONFIDENCE: &str = "confidence_state";
pub const BLOB_COIN_SET: &str = "coin_set";

// =============================================================================
// Counters
// =============================================================================

/// Lock-free pipeline statistics, exposed on the dashboard snapshot.
#[derive(Debug, Default)]
pub struct PipelineCounters {
    pub frames_total: AtomicU64,
    pub frames_rejected: AtomicU64,
    pub rejected_missing_symbol: AtomicU64,
    pub rejected_bad_price: AtomicU64,
    pub rejected_bad_notional: AtomicU64,
    pub rejected_unparseable: AtomicU64,
    pub candidates_emitted: AtomicU64,
    pub signals_merged: AtomicU64,
    pub dropped_low_confidence: AtomicU64,
    pub suppressed_by_context: AtomicU64,
    pub signals_delivered: AtomicU64,
    pub delivery_failed: AtomicU64,
    pub outcomes_win: AtomicU64,
    pub outcomes_loss: AtomicU64,
    pub outcomes_expired: AtomicU64,
}

/// Serialisable view of [`PipelineCounters`].
#[derive(Debug, Clone, Serialize)]
pub struct CountersSnapshot {
    pub frames_total: u64,
    pub frames_rejected: u64,
    pub rejected_missing_symbol: u64,
    pub rejected_bad_price: u64,
    pub rejected_bad_notional: u64,
    pub rejected_unparseable: u64,
    pub candidates_emitted: u64,
    pub signals_merged: u64,
    pub dropped_low_confidence: u64,
    pub suppressed_by_context: u64,
    pub signals_delivered: u64,
    pub delivery_failed: u64,
    pub outcomes_win: u64,
    pub outcomes_loss: u64,
    pub outcomes_expired: u64,
}

impl PipelineCounters {
    pub fn snapshot(&self) -> CountersSnapshot {
        CountersSnapshot {
            frames_total: self.frames_total.load(Ordering::Relaxed),
            frames_rejected: self.frames_rejected.load(Ordering::Relaxed),
            rejected_missing_symbol: self.rejected_missing_symbol.load(Ordering::Relaxed),
            rejected_bad_price: self.rejected_bad_price.load(Ordering::Relaxed),
            rejected_bad_notional: self.rejected_bad_notional.load(Ordering::Relaxed),
            rejected_unparseable: self.rejected_unparseable.load(Ordering::Relaxed),
            candidates_emitted: self.candidates_emitted.load(Ordering::Relaxed),
            signals_merged: self.signals_merged.load(Ordering::Relaxed),
            dropped_low_confidence: self.dropped_low_confidence.load(Ordering::Relaxed),
            suppressed_by_context: self.suppressed_by_context.load(Ordering::Relaxed),
            signals_delivered: self.signals_delivered.load(Ordering::Relaxed),
            delivery_failed: self.delivery_failed.load(Ordering::Relaxed),
            outcomes_win: self.outcomes_win.load(Ordering::Relaxed),
            outcomes_loss: self.outcomes_loss.load(Ordering::Relaxed),
            outcomes_expired: self.outcomes_expired.load(Ordering::Relaxed),
        }
    }
}

// =============================================================================
// AppState
// =============================================================================

/// Central application state shared across all async tasks via `Arc<AppState>`.
pub struct AppState {
    // ── Version tracking ────────────────────────────────────────────────
    /// Monotonically increasing version counter. Incremented on every
    /// meaningful state mutation; the WebSocket feed polls it to decide when
    /// to push.
    pub state_version: AtomicU64,
    pub ws_sequence_number: AtomicU64,

    // ── Configuration ───────────────────────────────────────────────────
    pub runtime_config: Arc<RwLock<RuntimeConfig>>,

    // ── Hot-path state ──────────────────────────────────────────────────
    pub buffers: Arc<EventBufferManager>,
    pub baselines: Arc<BaselineTracker>,

    // ── Pipeline stages ─────────────────────────────────────────────────
    pub merger: Mutex<SignalMerger>,
    pub guard: Mutex<SpamGuard>,
    pub scorer: Mutex<ConfidenceScorer>,
    pub outcomes: Mutex<OutcomeTracker>,

    // ── Market context ──────────────────────────────────────────────────
    pub context: Arc<ContextStore>,

    // ── Persistence ─────────────────────────────────────────────────────
    pub store: Arc<SignalStore>,

    // ── Dashboard feed ──────────────────────────────────────────────────
    pub recent_signals: RwLock<Vec<TradingSignal>>,
    pub signal_events: broadcast::Sender<TradingSignal>,

    // ── Feed health ─────────────────────────────────────────────────────
    pub feed_connected: RwLock<bool>,
    pub last_feed_event: RwLock<std::time::Instant>,

    // ── Statistics ──────────────────────────────────────────────────────
    pub counters: PipelineCounters,

    pub start_time: std::time::Instant,
}

impl AppState {
    /// Construct state from config and an opened store, restoring persisted
    /// confidence counters and the monitored coin set.
    pub fn new(mut config: RuntimeConfig, store: Arc<SignalStore>) -> Self {
        // Restore the monitored coin set saved by dashboard mutations.
        match store.load_state_blob(BLOB_COIN_SET) {
            Ok(Some(blob)) => {
                if let Ok(pairs) = serde_json::from_value::<Vec<String>>(blob) {
                    if !pairs.is_empty() {
                        config.pairs.primary = pairs;
                        config.pairs.secondary.clear();
                    }
                }
            }
            Ok(None) => {}
            Err(e) => warn!(error = %e, "failed to restore coin set — using config"),
        }

        // Restore scorer state so bias survives restarts.
        let scorer = match store.load_state_blob(BLOB_CONFIDENCE) {
            Ok(Some(blob)) => match serde_json::from_value::<ConfidenceState>(blob) {
                Ok(state) => ConfidenceScorer::from_state(state),
                Err(e) => {
                    warn!(error = %e, "corrupt confidence state blob — starting fresh");
                    ConfidenceScorer::new()
                }
            },
            Ok(None) => ConfidenceScorer::new(),
            Err(e) => {
                warn!(error = %e, "failed to load confidence state — starting fresh");
                ConfidenceScorer::new()
            }
        };

        let buffers = Arc::new(EventBufferManager::new(
            config.buffers.liquidation_cap,
            config.buffers.trade_cap,
            config.buffers.retention_ms(),
            config.buffers.grace_ms,
        ));
        let context = Arc::new(ContextStore::new(config.market_context.max_snapshots));
        let merger = SignalMerger::new(config.buffers.coalesce_ms);

        let (signal_events, _) = broadcast::channel(SIGNAL_CHANNEL_CAPACITY);

        Self {
            state_version: AtomicU64::new(1),
            ws_sequence_number: AtomicU64::new(0),
            runtime_config: Arc::new(RwLock::new(config)),
            buffers,
            baselines: Arc::new(BaselineTracker::new()),
            merger: Mutex::new(merger),
            guard: Mutex::new(SpamGuard::new()),
            scorer: Mutex::new(scorer),
            outcomes: Mutex::new(OutcomeTracker::new()),
            context,
            store,
            recent_signals: RwLock::new(Vec::new()),
            signal_events,
            feed_connected: RwLock::new(false),
            last_feed_event: RwLock::new(std::time::Instant::now()),
            counters: PipelineCounters::default(),
            start_time: std::time::Instant::now(),
        }
    }

    // ── Version management ──────────────────────────────────────────────

    pub fn increment_version(&self) -> u64 {
        self.state_version.fetch_add(1, Ordering::SeqCst)
    }

    pub fn current_state_version(&self) -> u64 {
        self.state_version.load(Ordering::SeqCst)
    }

    // ── Signal feed ─────────────────────────────────────────────────────

    /// Record an emitted signal in the dashboard ring and fan it out to
    /// WebSocket subscribers. Payloads are cloned before crossing the
    /// channel, so sessions never share mutable data.
    pub fn push_signal(&self, signal: &TradingSignal) {
        {
            let mut recent = self.recent_signals.write();
            recent.push(signal.clone());
            while recent.len() > MAX_RECENT_SIGNALS {
                recent.remove(0);
            }
        }
        let _ = self.signal_events.send(signal.clone());
        self.increment_version();
    }

    // ── Monitored symbols ───────────────────────────────────────────────

    /// Add a symbol to the monitored set; persists the coin set blob.
    pub fn add_symbol(&self, symbol: &str) -> bool {
        let upper = symbol.to_uppercase();
        let added = {
            let mut config = self.runtime_config.write();
            if config.pairs.all().contains(&upper) {
                false
            } else {
                config.pairs.secondary.push(upper.clone());
                true
            }
        };
        if added {
            self.persist_coin_set();
            self.increment_version();
        }
        added
    }

    /// Remove a symbol from the monitored set; persists the coin set blob.
    pub fn remove_symbol(&self, symbol: &str) -> bool {
        let upper = symbol.to_uppercase();
        let removed = {
            let mut config = self.runtime_config.write();
            let before = config.pairs.primary.len() + config.pairs.secondary.len();
            config.pairs.primary.retain(|s| !s.eq_ignore_ascii_case(&upper));
            config.pairs.secondary.retain(|s| !s.eq_ignore_ascii_case(&upper));
            before != config.pairs.primary.len() + config.pairs.secondary.len()
        };
        if removed {
            self.persist_coin_set();
            self.increment_version();
        }
        removed
    }

    fn persist_coin_set(&self) {
        let pairs = self.runtime_config.read().pairs.all();
        if let Err(e) = self
            .store
            .save_state_blob(BLOB_COIN_SET, &serde_json::json!(pairs))
        {
            warn!(error = %e, "failed to persist coin set");
        }
    }

    /// Persist the scorer's confidence state. Called by the outcome loop and
    /// on shutdown; failures degrade to a warning.
    pub fn persist_confidence_state(&self) {
        let blob = {
            let scorer = self.scorer.lock();
            match serde_json::to_value(scorer.state()) {
                Ok(v) => v,
                Err(e) => {
                    warn!(error = %e, "failed to serialise confidence state");
                    return;
                }
            }
        };
        if let Err(e) = self.store.save_state_blob(BLOB_CONFIDENCE, &blob) {
            warn!(error = %e, "failed to persist confidence state");
        }
    }

    // ── Snapshot builder ────────────────────────────────────────────────

    /// Build the dashboard snapshot: counters, per-symbol order-flow
    /// summaries, recent signals and feed health.
    pub fn build_snapshot(&self) -> StateSnapshot {
        let now = Utc::now();
        let now_ms = now.timestamp_millis();
        let config = self.runtime_config.read();

        let symbols = config.pairs.all();
        let order_flow = symbols
            .iter()
            .map(|s| (s.clone(), self.order_flow_summary(s, now_ms)))
            .collect();

        let win_rates = {
            let scorer = self.scorer.lock();
            scorer
                .state()
                .producers
                .iter()
                .map(|(name, record)| {
                    (
                        name.clone(),
                        ProducerStats {
                            wins: record.wins,
                            losses: record.losses,
                            win_rate: record.win_rate(),
                        },
                    )
                })
                .collect()
        };

        StateSnapshot {
            state_version: self.current_state_version(),
            server_time: now_ms,
            uptime_secs: self.start_time.elapsed().as_secs(),
            feed_connected: *self.feed_connected.read(),
            last_feed_event_age_ms: self.last_feed_event.read().elapsed().as_millis() as u64,
            monitored_symbols: symbols,
            filter_mode: config.market_context.filter_mode.to_string(),
            counters: self.counters.snapshot(),
            buffer_counters: self.buffers.counters.snapshot(),
            validator_counters: self.guard.lock().counters,
            pending_outcomes: self.outcomes.lock().pending_count(),
            order_flow,
            recent_signals: self.recent_signals.read().clone(),
            producer_stats: win_rates,
        }
    }

    /// Order-flow summary over the trailing five minutes for one symbol.
    pub fn order_flow_summary(&self, symbol: &str, now_ms: i64) -> OrderFlowSummary {
        let config = self.runtime_config.read();
        let large_floor = Decimal::from_f64(
            config
                .monitoring
                .large_order_threshold(config.monitoring.tier_of(symbol)),
        )
        .unwrap_or_default();
        drop(config);

        let trades = self.buffers.snapshot_trades(symbol, now_ms - 300_000);

        let mut buy_vol = Decimal::ZERO;
        let mut sell_vol = Decimal::ZERO;
        let mut large_buys = 0u32;
        let mut large_sells = 0u32;
        let mut last_ts = 0i64;

        for t in &trades {
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
            last_ts = last_ts.max(t.ts);
        }

        let total = buy_vol + sell_vol;
        let buy_ratio = if total > Decimal::ZERO {
            (buy_vol / total).to_f64().unwrap_or(0.5)
        } else {
            0.5
        };

        OrderFlowSummary {
            buy_ratio,
            sell_ratio: 1.0 - buy_ratio,
            large_buys,
            large_sells,
            last_update_ts: last_ts,
        }
    }
}

// =============================================================================
// Serialisable snapshot types
// =============================================================================

/// Per-symbol order-flow summary for the dashboard.
#[derive(Debug, Clone, Serialize)]
pub struct OrderFlowSummary {
    pub buy_ratio: f64,
    pub sell_ratio: f64,
    pub large_buys: u32,
    pub large_sells: u32,
    pub last_update_ts: i64,
}

/// Per-producer win/loss stats for the dashboard.
#[derive(Debug, Clone, Serialize)]
pub struct ProducerStats {
    pub wins: u32,
    pub losses: u32,
    pub win_rate: f64,
}

/// Full dashboard snapshot, sent on `GET /api/v1/state` and over the WS feed.
#[derive(Debug, Clone, Serialize)]
pub struct StateSnapshot {
    pub state_version: u64,
    pub server_time: i64,
    pub uptime_secs: u64,
    pub feed_connected: bool,
    pub last_feed_event_age_ms: u64,
    pub monitored_symbols: Vec<String>,
    pub filter_mode: String,
    pub counters: CountersSnapshot,
    pub buffer_counters: crate::market_data::event_buffer::BufferCountersSnapshot,
    pub validator_counters: ValidatorCounters,
    pub pending_outcomes: usize,
    pub order_flow: std::collections::HashMap<String, OrderFlowSummary>,
    pub recent_signals: Vec<TradingSignal>,
    pub producer_stats: std::collections::HashMap<String, ProducerStats>,
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{fingerprint, ContextAssessment, Direction, Priority, SignalKind, Tier, Trade};
    use rust_decimal_macros::dec;

    fn state() -> AppState {
        let store = Arc::new(SignalStore::open_in_memory().unwrap());
        AppState::new(RuntimeConfig::default(), store)
    }

    fn signal(id: &str) -> TradingSignal {
        TradingSignal {
            id: id.into(),
            symbol: "BTCUSDT".into(),
            kind: SignalKind::StopHunt,
            direction: Direction::Long,
            entry: dec!(96000),
            stop: dec!(95704),
            target: dec!(96592),
            confidence: 93.0,
            tier: Tier::Tier1,
            priority: Priority::Urgent,
            context: ContextAssessment::Neutral,
            context_stale: false,
            ts: 0,
            fingerprint: fingerprint("BTCUSDT", SignalKind::StopHunt, Direction::Long, 93.0),
        }
    }

    #[test]
    fn push_signal_caps_ring_and_bumps_version() {
        let s = state();
        let v0 = s.current_state_version();
        for i in 0..120 {
            s.push_signal(&signal(&format!("s{i}")));
        }
        assert_eq!(s.recent_signals.read().len(), 100);
        assert!(s.current_state_version() > v0);
    }

    #[test]
    fn add_and_remove_symbol_persist_coin_set() {
        let s = state();
        assert!(s.add_symbol("pepeusdt"));
        assert!(!s.add_symbol("PEPEUSDT")); // already present
        assert!(s.runtime_config.read().pairs.all().contains(&"PEPEUSDT".to_string()));

        let blob = s.store.load_state_blob(BLOB_COIN_SET).unwrap().unwrap();
        let pairs: Vec<String> = serde_json::from_value(blob).unwrap();
        assert!(pairs.contains(&"PEPEUSDT".to_string()));

        assert!(s.remove_symbol("PEPEUSDT"));
        assert!(!s.remove_symbol("PEPEUSDT"));
    }

    #[test]
    fn coin_set_restored_on_construction() {
        let store = Arc::new(SignalStore::open_in_memory().unwrap());
        store
            .save_state_blob(BLOB_COIN_SET, &serde_json::json!(["DOGEUSDT", "PEPEUSDT"]))
            .unwrap();
        let s = AppState::new(RuntimeConfig::default(), store);
        assert_eq!(
            s.runtime_config.read().pairs.all(),
            vec!["DOGEUSDT".to_string(), "PEPEUSDT".to_string()]
        );
    }

    #[test]
    fn confidence_state_persists_and_restores() {
        let store = Arc::new(SignalStore::open_in_memory().unwrap());
        {
            let s = AppState::new(RuntimeConfig::default(), store.clone());
            let mut scorer = s.scorer.lock();
            for _ in 0..25 {
                scorer.record_outcome(crate::types::Producer::StopHunt, crate::types::OutcomeLabel::Win);
            }
            drop(scorer);
            s.persist_confidence_state();
        }
        let restored = AppState::new(RuntimeConfig::default(), store);
        let bias = restored.scorer.lock().producer_bias(crate::types::Producer::StopHunt);
        assert_eq!(bias, 10.0);
    }

    #[test]
    fn order_flow_summary_reflects_buffer() {
        let s = state();
        let now = 1_000_000i64;
        for i in 0..4 {
            s.buffers.append_trade(Trade {
                symbol: "BTCUSDT".into(),
                exchange: "binance".into(),
                price: dec!(96000),
                side: TradeSide::Buy,
                notional_usd: dec!(15000),
                ts: now - 60_000 + i * 1_000,
            });
        }
        s.buffers.append_trade(Trade {
            symbol: "BTCUSDT".into(),
            exchange: "binance".into(),
            price: dec!(96000),
            side: TradeSide::Sell,
            notional_usd: dec!(20000),
            ts: now - 30_000,
        });

        let summary = s.order_flow_summary("BTCUSDT", now);
        assert!((summary.buy_ratio - 0.75).abs() < 1e-9);
        assert_eq!(summary.large_buys, 4);
        assert_eq!(summary.large_sells, 1);
        assert_eq!(summary.last_update_ts, now - 30_000);
    }

    #[test]
    fn snapshot_builds_without_panicking_on_empty_state() {
        let s = state();
        let snap = s.build_snapshot();
        assert!(!snap.feed_connected);
        assert_eq!(snap.recent_signals.len(), 0);
        assert!(snap.order_flow.contains_key("BTCUSDT"));
    }
}
