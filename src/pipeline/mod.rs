// =============================================================================
// Pipeline Module — ingest fan-in, analyzer triggers and the flush path
// =============================================================================
//
// The pipeline task is the single writer of the event buffers. It consumes
// canonical events from the feed channel, triggers analyzers (stop-hunt on
// every liquidation; order-flow and event-pattern on debounced trades and a
// periodic tick), and flushes matured work through:
//
//   merger -> validator -> scorer -> context filter -> store -> sinks
//
// Every step below the async shell is a synchronous function over snapshots
// with an explicit `now_ms`, so the whole path replays deterministically
// under a fixed clock.
// =============================================================================

pub mod merger;
pub mod outcome;
pub mod scorer;
pub mod validator;

use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::analyzers::{event_pattern, order_flow, StopHuntDetector};
use crate::app_state::AppState;
use crate::delivery::DeliverySignal;
use crate::ingest::FeedEvent;
use crate::market_context::filter as context_filter;
use crate::types::TradingSignal;

/// Cadence of the flush tick that matures coalescing windows and pending
/// absorption checks.
const FLUSH_INTERVAL_MS: u64 = 500;
/// Cadence of the outcome monitor.
const OUTCOME_INTERVAL_SECS: u64 = 30;
/// Cadence of the retention sweeper.
const SWEEP_INTERVAL_SECS: u64 = 60;

/// A signal that cleared every gate, plus its delivery routing.
#[derive(Debug, Clone)]
pub struct OutboundSignal {
    pub signal: TradingSignal,
    /// False when the context filter kept it off the messaging sink.
    pub deliver_to_sink: bool,
    /// Context was stale at assessment time.
    pub degraded: bool,
}

// =============================================================================
// Synchronous steps (deterministic under a fixed clock)
// =============================================================================

/// Fold one canonical event into the buffers and trigger analyzers.
/// Event time doubles as "now" so replayed traces behave identically.
pub fn ingest_event(
    state: &AppState,
    stop_hunts: &mut StopHuntDetector,
    debounce: &mut HashMap<String, i64>,
    event: FeedEvent,
) {
    match event {
        FeedEvent::Liquidation(liq) => {
            let symbol = liq.symbol.clone();
            let ts = liq.ts;
            if state.buffers.append_liquidation(liq) {
                let config = state.runtime_config.read();
                stop_hunts.on_liquidation(&state.buffers, &config.monitoring, &symbol, ts);
            }
        }
        FeedEvent::Trade(trade) => {
            let symbol = trade.symbol.clone();
            let ts = trade.ts;
            state.baselines.record_trade(&symbol, ts, trade.notional_usd);
            if !state.buffers.append_trade(trade) {
                return;
            }

            let debounce_ms = state.runtime_config.read().buffers.debounce_ms;
            let ready = debounce
                .get(&symbol)
                .map(|last| ts - last >= debounce_ms)
                .unwrap_or(true);
            if ready {
                debounce.insert(symbol.clone(), ts);
                run_symbol_analyzers(state, &symbol, ts);
            }
        }
    }
}

/// Run the periodic analyzers for one symbol and park any candidates.
pub fn run_symbol_analyzers(state: &AppState, symbol: &str, now_ms: i64) {
    let config = state.runtime_config.read();
    let trades = state.buffers.snapshot_trades(symbol, now_ms - 300_000);
    if trades.is_empty() {
        return;
    }

    let mut candidates = Vec::new();
    if let Some(c) = order_flow::analyze(&trades, &config.monitoring, symbol, now_ms) {
        candidates.push(c);
    }
    if let Some(c) = event_pattern::detect_whale(&trades, &config.monitoring, symbol, now_ms) {
        candidates.push(c);
    }
    let stats = state.baselines.stats(symbol, now_ms);
    if let Some(c) =
        event_pattern::detect_volume_spike(&trades, stats, &config.monitoring, symbol, now_ms)
    {
        candidates.push(c);
    }
    drop(config);

    if candidates.is_empty() {
        return;
    }

    let mut merger = state.merger.lock();
    for candidate in candidates {
        state.counters.candidates_emitted.fetch_add(1, Ordering::Relaxed);
        merger.add(candidate);
    }
}

/// Mature pending stop hunts and coalescing groups, then push every merged
/// signal through the gates. Returns the signals that survived, with their
/// sink routing.
pub fn flush(
    state: &AppState,
    stop_hunts: &mut StopHuntDetector,
    now_ms: i64,
) -> Vec<OutboundSignal> {
    // 1. Complete matured absorption windows.
    {
        let config = state.runtime_config.read();
        let mut merger = state.merger.lock();
        for symbol in stop_hunts.pending_symbols() {
            if let Some(candidate) =
                stop_hunts.poll(&state.buffers, &config.monitoring, &symbol, now_ms)
            {
                state.counters.candidates_emitted.fetch_add(1, Ordering::Relaxed);
                merger.add(candidate);
            }
        }
    }

    // 2. Flush coalescing windows.
    let merged = {
        let config = state.runtime_config.read();
        let mut merger = state.merger.lock();
        merger.flush_ready(&state.buffers, &config.monitoring, now_ms)
    };

    let mut out = Vec::new();
    for mut signal in merged {
        state.counters.signals_merged.fetch_add(1, Ordering::Relaxed);
        let config = state.runtime_config.read();

        // 3. Anti-spam gates.
        if let Err(reason) = state.guard.lock().admit(&signal, &config.signals, now_ms) {
            debug!(symbol = %signal.symbol, reason = %reason, "signal rejected by validator");
            continue;
        }

        // 4. Adaptive confidence.
        state.scorer.lock().score(&mut signal);
        if signal.confidence < config.signals.min_confidence {
            state.counters.dropped_low_confidence.fetch_add(1, Ordering::Relaxed);
            debug!(
                symbol = %signal.symbol,
                confidence = signal.confidence,
                "signal below minimum confidence"
            );
            continue;
        }

        // 5. Market context.
        let verdict =
            context_filter::apply(&state.context, &config.market_context, &mut signal, now_ms);
        if verdict.suppress_sink {
            state.counters.suppressed_by_context.fetch_add(1, Ordering::Relaxed);
        }
        drop(config);

        // 6. Persist (warn-and-continue) and publish to the dashboard.
        if let Err(e) = state.store.insert_signal(&signal) {
            warn!(signal_id = %signal.id, error = %e, "failed to persist signal");
        }
        state.push_signal(&signal);

        // 7. Park for the outcome check.
        let horizon_ms = state.runtime_config.read().outcome.horizon_ms();
        state.outcomes.lock().schedule(signal.clone(), horizon_ms);

        out.push(OutboundSignal {
            deliver_to_sink: !verdict.suppress_sink,
            degraded: verdict.stale,
            signal,
        });
    }
    out
}

/// One round of the outcome monitor at `now_ms`.
pub fn check_outcomes(state: &AppState, now_ms: i64) {
    let matured = state.outcomes.lock().due(now_ms);
    if matured.is_empty() {
        return;
    }

    let win_fraction = state.runtime_config.read().outcome.win_fraction;
    let mut state_dirty = false;

    for entry in matured {
        let last_trade = state.buffers.last_trade(&entry.signal.symbol);
        let result = outcome::evaluate(&entry.signal, last_trade.as_ref(), now_ms, win_fraction);

        let outcome_record = match result {
            Some(o) => o,
            None if !entry.retried => {
                debug!(signal_id = %entry.signal.id, "no fresh price — deferring outcome once");
                state.outcomes.lock().defer_once(entry);
                continue;
            }
            None => outcome::expired(&entry.signal, now_ms),
        };

        match outcome_record.label {
            crate::types::OutcomeLabel::Win => {
                state.counters.outcomes_win.fetch_add(1, Ordering::Relaxed)
            }
            crate::types::OutcomeLabel::Loss => {
                state.counters.outcomes_loss.fetch_add(1, Ordering::Relaxed)
            }
            crate::types::OutcomeLabel::Expired => {
                state.counters.outcomes_expired.fetch_add(1, Ordering::Relaxed)
            }
        };

        if let Err(e) = state.store.insert_outcome(&outcome_record) {
            warn!(signal_id = %outcome_record.signal_id, error = %e, "failed to persist outcome");
        }

        // Feed the scorer under its single write lock.
        let producer = scorer::producer_of(entry.signal.kind);
        state.scorer.lock().record_outcome(producer, outcome_record.label);
        state_dirty = true;

        info!(
            signal_id = %outcome_record.signal_id,
            label = %outcome_record.label,
            pct_to_target = format!("{:.2}", outcome_record.pct_to_target),
            "outcome recorded"
        );
    }

    if state_dirty {
        state.persist_confidence_state();
        state.increment_version();
    }
}

// =============================================================================
// Async shells
// =============================================================================

/// The pipeline task: owns buffer writes and the flush cadence.
pub async fn run_pipeline(
    state: Arc<AppState>,
    mut rx: mpsc::Receiver<FeedEvent>,
    delivery_tx: mpsc::Sender<DeliverySignal>,
) {
    let mut stop_hunts = StopHuntDetector::new();
    let mut debounce: HashMap<String, i64> = HashMap::new();

    let analyzer_tick_secs = state.runtime_config.read().buffers.analyzer_tick_secs;
    let mut flush_tick =
        tokio::time::interval(std::time::Duration::from_millis(FLUSH_INTERVAL_MS));
    let mut analyzer_tick =
        tokio::time::interval(std::time::Duration::from_secs(analyzer_tick_secs.max(1)));

    info!("pipeline task started");

    loop {
        tokio::select! {
            event = rx.recv() => {
                match event {
                    Some(event) => ingest_event(&state, &mut stop_hunts, &mut debounce, event),
                    None => {
                        info!("feed channel closed — pipeline exiting");
                        return;
                    }
                }
            }

            _ = flush_tick.tick() => {
                let now_ms = chrono::Utc::now().timestamp_millis();
                for outbound in flush(&state, &mut stop_hunts, now_ms) {
                    dispatch(&delivery_tx, outbound).await;
                }
            }

            _ = analyzer_tick.tick() => {
                let now_ms = chrono::Utc::now().timestamp_millis();
                let symbols = state.runtime_config.read().pairs.all();
                for symbol in symbols {
                    run_symbol_analyzers(&state, &symbol, now_ms);
                }
            }
        }
    }
}

async fn dispatch(delivery_tx: &mpsc::Sender<DeliverySignal>, outbound: OutboundSignal) {
    if !outbound.deliver_to_sink {
        debug!(
            symbol = %outbound.signal.symbol,
            context = %outbound.signal.context,
            "signal kept off messaging sink by context filter"
        );
        return;
    }
    let delivery = DeliverySignal {
        signal: outbound.signal,
        degraded: outbound.degraded,
    };
    if delivery_tx.send(delivery).await.is_err() {
        warn!("delivery queue closed — signal not sent");
    }
}

/// The outcome monitor task.
pub async fn run_outcome_loop(state: Arc<AppState>) {
    let mut ticker =
        tokio::time::interval(std::time::Duration::from_secs(OUTCOME_INTERVAL_SECS));
    info!(interval_secs = OUTCOME_INTERVAL_SECS, "outcome monitor started");
    loop {
        ticker.tick().await;
        let now_ms = chrono::Utc::now().timestamp_millis();
        check_outcomes(&state, now_ms);
    }
}

/// The retention sweeper: buffers hourly horizon, context tables at 7 days.
pub async fn run_sweeper(state: Arc<AppState>) {
    let mut ticker = tokio::time::interval(std::time::Duration::from_secs(SWEEP_INTERVAL_SECS));
    loop {
        ticker.tick().await;
        let now_ms = chrono::Utc::now().timestamp_millis();
        state.buffers.sweep(now_ms);
        if let Err(e) = state.store.prune_context(now_ms) {
            warn!(error = %e, "context prune failed");
        }
    }
}

// =============================================================================
// End-to-end scenarios under a fixed clock
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::SignalStore;
    use crate::runtime_config::RuntimeConfig;
    use crate::types::{
        ContextAssessment, ContextSnapshot, Direction, Liquidation, LiquidationSide, OutcomeLabel,
        Priority, SignalKind, Trade, TradeSide,
    };
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;

    fn test_state() -> AppState {
        let store = Arc::new(SignalStore::open_in_memory().unwrap());
        AppState::new(RuntimeConfig::default(), store)
    }

    fn short_liq(ts: i64, price: Decimal, notional: Decimal) -> FeedEvent {
        FeedEvent::Liquidation(Liquidation {
            symbol: "BTCUSDT".into(),
            exchange: "binance".into(),
            price,
            side: LiquidationSide::ShortLiquidated,
            notional_usd: notional,
            ts,
        })
    }

    fn trade(symbol: &str, side: TradeSide, price: Decimal, notional: Decimal, ts: i64) -> FeedEvent {
        FeedEvent::Trade(Trade {
            symbol: symbol.into(),
            exchange: "binance".into(),
            price,
            side,
            notional_usd: notional,
            ts,
        })
    }

    fn drive(
        state: &AppState,
        stop_hunts: &mut StopHuntDetector,
        debounce: &mut HashMap<String, i64>,
        events: Vec<FeedEvent>,
    ) {
        for event in events {
            ingest_event(state, stop_hunts, debounce, event);
        }
    }

    /// Scenario: a 2.4M short-liquidation cascade with buy-side absorption
    /// produces a single urgent LONG stop-hunt signal.
    #[test]
    fn cascade_with_absorption_emits_urgent_long() {
        let state = test_state();
        let mut stop_hunts = StopHuntDetector::new();
        let mut debounce = HashMap::new();
        let t0 = 1_000_000i64;

        // 12 short liquidations summing 2.4M over 20 s, prices 95,800–95,998.
        let liqs: Vec<FeedEvent> = (0..12)
            .map(|i| {
                short_liq(
                    t0 + i * 1_700,
                    dec!(95800) + Decimal::from(i * 18),
                    dec!(200000),
                )
            })
            .collect();
        drive(&state, &mut stop_hunts, &mut debounce, liqs);

        // 1.2M of buys in the following 20 s.
        let buys: Vec<FeedEvent> = (0..6)
            .map(|i| {
                trade(
                    "BTCUSDT",
                    TradeSide::Buy,
                    dec!(95990),
                    dec!(200000),
                    t0 + 20_000 + i * 3_000,
                )
            })
            .collect();
        drive(&state, &mut stop_hunts, &mut debounce, buys);

        // Flush once the absorption window has matured.
        let out = flush(&state, &mut stop_hunts, t0 + 50_000);
        assert_eq!(out.len(), 1);

        let s = &out[0].signal;
        assert_eq!(s.kind, SignalKind::StopHunt);
        assert_eq!(s.direction, Direction::Long);
        assert!(s.entry >= dec!(95990) && s.entry <= dec!(96000));
        assert!(s.stop < dec!(95800));
        assert!(s.target > s.entry);
        assert!(s.confidence >= 85.0);
        assert_eq!(s.priority, Priority::Urgent);
        assert!(out[0].deliver_to_sink);

        // Persisted and visible on the dashboard feed.
        assert_eq!(state.recent_signals.read().len(), 1);
        assert_eq!(state.store.recent_signals(10).unwrap().len(), 1);
    }

    /// Scenario: lopsided tier-3 buying with seven large orders produces an
    /// accumulation-family LONG with the tier-3 bias applied.
    fn run_pepe_accumulation(state: &AppState, t0: i64) -> Vec<OutboundSignal> {
        let mut stop_hunts = StopHuntDetector::new();
        let mut debounce = HashMap::new();

        let mut events = Vec::new();
        // 7 large buys (>= 2,000 USD tier-3 floor) spread over 5 minutes.
        for i in 0..7i64 {
            events.push(trade(
                "PEPEUSDT",
                TradeSide::Buy,
                dec!(0.00001234),
                dec!(100000),
                t0 + i * 40_000,
            ));
        }
        // Small buy filler and one large sell.
        events.push(trade(
            "PEPEUSDT",
            TradeSide::Buy,
            dec!(0.00001236),
            dec!(20000),
            t0 + 285_000,
        ));
        events.push(trade(
            "PEPEUSDT",
            TradeSide::Sell,
            dec!(0.00001238),
            dec!(280000),
            t0 + 288_000,
        ));
        // Final buy sets the expected entry price.
        events.push(trade(
            "PEPEUSDT",
            TradeSide::Buy,
            dec!(0.00001240),
            dec!(5000),
            t0 + 290_000,
        ));

        drive(state, &mut stop_hunts, &mut debounce, events);
        flush(state, &mut stop_hunts, t0 + 293_000)
    }

    #[test]
    fn tier3_accumulation_scores_with_small_cap_bias() {
        let state = test_state();
        let out = run_pepe_accumulation(&state, 1_000_000);
        assert_eq!(out.len(), 1);

        let s = &out[0].signal;
        assert_eq!(s.direction, Direction::Long);
        assert!(matches!(
            s.kind,
            SignalKind::Accumulation | SignalKind::WhaleAccumulation
        ));
        assert!(s.confidence >= 70.0);
        assert!(matches!(s.priority, Priority::Watch | Priority::Urgent));
        // Entry is the last trade price, sub-cent precision intact.
        assert_eq!(s.entry, dec!(0.00001240));
        assert!(crate::types::format_price(s.entry).contains("0.0000124"));
        assert!(out[0].deliver_to_sink);
    }

    /// Scenario: crowded-long context (positive funding, rising OI) keeps the
    /// signal off the messaging sink in normal mode but not off the dashboard,
    /// and costs it ten points of confidence.
    #[test]
    fn unfavorable_context_suppresses_messaging_only() {
        let favorable_state = test_state();
        let baseline = run_pepe_accumulation(&favorable_state, 1_000_000);
        let baseline_confidence = baseline[0].signal.confidence;

        let state = test_state();
        let t0 = 1_000_000i64;
        let flush_at = t0 + 293_000;
        // Funding +0.03%, ΔOI_1h +8%, fresh snapshot.
        state.context.push(ContextSnapshot {
            symbol: "PEPEUSDT".into(),
            ts: flush_at - 3_600_000,
            open_interest_usd: dec!(1000000),
            funding_rate: dec!(0.0003),
            source_exchange: "aggregated".into(),
        });
        state.context.push(ContextSnapshot {
            symbol: "PEPEUSDT".into(),
            ts: flush_at - 30_000,
            open_interest_usd: dec!(1080000),
            funding_rate: dec!(0.0003),
            source_exchange: "aggregated".into(),
        });

        let out = run_pepe_accumulation(&state, t0);
        assert_eq!(out.len(), 1);

        let s = &out[0].signal;
        assert_eq!(s.context, ContextAssessment::Unfavorable);
        assert!(!out[0].deliver_to_sink);
        assert!((baseline_confidence - s.confidence - 10.0).abs() < 1e-9);
        // Dashboard still carries the signal.
        assert_eq!(state.recent_signals.read().len(), 1);
        assert_eq!(
            state
                .counters
                .suppressed_by_context
                .load(Ordering::Relaxed),
            1
        );
    }

    /// Scenario: a delivered LONG at entry 100 / target 110 checked at the
    /// horizon with price 106 is a win and bumps the producer's tally.
    #[test]
    fn outcome_win_feeds_back_into_scorer() {
        let state = test_state();
        let t0 = 1_000_000i64;
        let horizon = state.runtime_config.read().outcome.horizon_ms();

        let kind = SignalKind::StopHunt;
        let signal = crate::types::TradingSignal {
            id: "sig-win".into(),
            symbol: "BTCUSDT".into(),
            kind,
            direction: Direction::Long,
            entry: dec!(100),
            stop: dec!(98),
            target: dec!(110),
            confidence: 90.0,
            tier: crate::types::Tier::Tier1,
            priority: Priority::Urgent,
            context: ContextAssessment::Neutral,
            context_stale: false,
            ts: t0,
            fingerprint: crate::types::fingerprint("BTCUSDT", kind, Direction::Long, 90.0),
        };
        state.outcomes.lock().schedule(signal, horizon);

        // Price at the horizon: 106 => 60% progress to target.
        let check_at = t0 + horizon;
        state.buffers.append_trade(Trade {
            symbol: "BTCUSDT".into(),
            exchange: "binance".into(),
            price: dec!(106),
            side: TradeSide::Buy,
            notional_usd: dec!(5000),
            ts: check_at - 5_000,
        });

        check_outcomes(&state, check_at);

        assert_eq!(state.store.outcome_count(OutcomeLabel::Win).unwrap(), 1);
        assert_eq!(state.counters.outcomes_win.load(Ordering::Relaxed), 1);
        let scorer = state.scorer.lock();
        let record = scorer.state().producers.get("stop_hunt").unwrap();
        assert_eq!(record.wins, 1);
        assert_eq!(record.losses, 0);
    }

    /// Scenario: no fresh price at the horizon defers once, then expires.
    #[test]
    fn outcome_without_price_expires_after_one_retry() {
        let state = test_state();
        let t0 = 1_000_000i64;
        let horizon = state.runtime_config.read().outcome.horizon_ms();

        let kind = SignalKind::Accumulation;
        let signal = crate::types::TradingSignal {
            id: "sig-exp".into(),
            symbol: "GHOSTUSDT".into(),
            kind,
            direction: Direction::Long,
            entry: dec!(1),
            stop: dec!(0.99),
            target: dec!(1.02),
            confidence: 75.0,
            tier: crate::types::Tier::Tier3,
            priority: Priority::Watch,
            context: ContextAssessment::Neutral,
            context_stale: false,
            ts: t0,
            fingerprint: crate::types::fingerprint("GHOSTUSDT", kind, Direction::Long, 75.0),
        };
        state.outcomes.lock().schedule(signal, horizon);

        let check_at = t0 + horizon;
        check_outcomes(&state, check_at);
        // Deferred, not yet expired.
        assert_eq!(state.counters.outcomes_expired.load(Ordering::Relaxed), 0);
        assert_eq!(state.outcomes.lock().pending_count(), 1);

        check_outcomes(&state, check_at + 120_000);
        assert_eq!(state.counters.outcomes_expired.load(Ordering::Relaxed), 1);
        assert_eq!(state.store.outcome_count(OutcomeLabel::Expired).unwrap(), 1);
        // Expired outcomes never touch the scorer.
        assert!(state.scorer.lock().state().producers.get("order_flow").is_none());
    }

    /// Scenario: after a restart, frames earlier than the buffered tail by
    /// more than the grace window are dropped and counted; nothing crashes.
    #[test]
    fn reconnect_monotonicity_drops_and_counts() {
        let state = test_state();
        let mut stop_hunts = StopHuntDetector::new();
        let mut debounce = HashMap::new();
        let t0 = 10_000_000i64;

        drive(
            &state,
            &mut stop_hunts,
            &mut debounce,
            vec![trade("BTCUSDT", TradeSide::Buy, dec!(96000), dec!(5000), t0)],
        );

        // "Reconnect" replays an old frame 5 s in the past.
        drive(
            &state,
            &mut stop_hunts,
            &mut debounce,
            vec![trade("BTCUSDT", TradeSide::Buy, dec!(95990), dec!(5000), t0 - 5_000)],
        );

        assert_eq!(
            state
                .buffers
                .counters
                .dropped_out_of_order
                .load(Ordering::Relaxed),
            1
        );
        assert_eq!(state.buffers.depth("BTCUSDT").1, 1);

        // Within grace is still accepted.
        drive(
            &state,
            &mut stop_hunts,
            &mut debounce,
            vec![trade("BTCUSDT", TradeSide::Buy, dec!(95995), dec!(5000), t0 - 1_000)],
        );
        assert_eq!(state.buffers.depth("BTCUSDT").1, 2);
    }

    /// Replaying already-ingested events produces no second signal.
    #[test]
    fn replay_is_idempotent_for_signals() {
        let state = test_state();
        let t0 = 1_000_000i64;
        let first = run_pepe_accumulation(&state, t0);
        assert_eq!(first.len(), 1);

        // Re-run the analyzers over the same buffer contents.
        let mut stop_hunts = StopHuntDetector::new();
        run_symbol_analyzers(&state, "PEPEUSDT", t0 + 295_000);
        let replay = flush(&state, &mut stop_hunts, t0 + 298_000);

        assert!(replay.is_empty());
        assert_eq!(state.recent_signals.read().len(), 1);
        let guard = state.guard.lock();
        assert!(guard.counters.dropped_cooldown + guard.counters.dropped_duplicate >= 1);
    }
}
