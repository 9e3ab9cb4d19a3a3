// =============================================================================
// Vigil — Main Entry Point
// =============================================================================
//
// Real-time market intelligence for crypto derivatives: liquidation and
// aggregated-trade ingest, cascade / order-flow / whale detection, context
// filtering, Telegram delivery and a local dashboard.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod analyzers;
mod api;
mod app_state;
mod delivery;
mod ingest;
mod market_context;
mod market_data;
mod persistence;
mod pipeline;
mod runtime_config;
mod types;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::app_state::AppState;
use crate::delivery::telegram::TelegramSink;
use crate::market_context::poller::ContextPoller;
use crate::persistence::SignalStore;
use crate::runtime_config::RuntimeConfig;

/// Reconnect delay after a feed task exit.
const FEED_RECONNECT_SECS: u64 = 5;
/// Bound on the delivery-queue drain during shutdown.
const SHUTDOWN_DRAIN_SECS: u64 = 30;

const CONFIG_PATH: &str = "vigil_config.json";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("Vigil market intelligence starting up");

    let mut config = RuntimeConfig::load(CONFIG_PATH).unwrap_or_else(|e| {
        warn!(error = %e, "failed to load config, using defaults");
        RuntimeConfig::default()
    });

    // Override monitored symbols from env if provided.
    if let Ok(syms) = std::env::var("VIGIL_SYMBOLS") {
        let parsed: Vec<String> = syms
            .split(',')
            .map(|s| s.trim().to_uppercase())
            .filter(|s| !s.is_empty())
            .collect();
        if !parsed.is_empty() {
            config.pairs.primary = parsed;
            config.pairs.secondary.clear();
        }
    }

    info!(
        pairs = ?config.pairs.all(),
        filter_mode = %config.market_context.filter_mode,
        "configured monitored pairs"
    );

    // ── 2. Persistence (fatal on failure) ────────────────────────────────
    let db_path = std::env::var("VIGIL_DB_PATH").unwrap_or_else(|_| "vigil.db".into());
    let store = Arc::new(SignalStore::open(&db_path).context("cannot open signal store")?);

    // ── 3. Shared state ──────────────────────────────────────────────────
    let state = Arc::new(AppState::new(config, store));

    // ── 4. Dashboard server (bind is fatal) ──────────────────────────────
    let bind_addr = std::env::var("VIGIL_BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:3001".into());
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("cannot bind dashboard to {bind_addr}"))?;
    info!(addr = %bind_addr, "dashboard listening");

    let api_state = state.clone();
    tokio::spawn(async move {
        let app = api::rest::router(api_state);
        if let Err(e) = axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        {
            error!(error = %e, "dashboard server failed");
        }
    });

    // ── 5. Channels ──────────────────────────────────────────────────────
    let (feed_tx, feed_rx) = tokio::sync::mpsc::channel(1024);
    let (delivery_tx, delivery_rx) = tokio::sync::mpsc::channel(256);

    // ── 6. Feed task with reconnect loop ─────────────────────────────────
    let feed_base =
        std::env::var("VIGIL_FEED_URL").unwrap_or_else(|_| "wss://open-ws.vendor.example/ws".into());
    let feed_key = std::env::var("VIGIL_FEED_API_KEY").unwrap_or_default();
    if feed_key.is_empty() {
        warn!("VIGIL_FEED_API_KEY is not set — the upstream feed will likely reject the connection");
    }
    let feed_url = ingest::feed::feed_url(&feed_base, &feed_key);

    let feed_state = state.clone();
    tokio::spawn(async move {
        loop {
            if let Err(e) = ingest::feed::run_feed(feed_state.clone(), feed_tx.clone(), feed_url.clone()).await
            {
                error!(error = %e, "feed task exited — reconnecting in {FEED_RECONNECT_SECS}s");
            }
            tokio::time::sleep(tokio::time::Duration::from_secs(FEED_RECONNECT_SECS)).await;
        }
    });

    // ── 7. Pipeline task ─────────────────────────────────────────────────
    let pipeline_state = state.clone();
    let pipeline_delivery_tx = delivery_tx.clone();
    let pipeline_handle = tokio::spawn(async move {
        pipeline::run_pipeline(pipeline_state, feed_rx, pipeline_delivery_tx).await;
    });

    // ── 8. Context pollers (one per monitored symbol) ────────────────────
    if state.runtime_config.read().market_context.enabled {
        let rest_base = std::env::var("VIGIL_REST_URL")
            .unwrap_or_else(|_| "https://open-api.vendor.example".into());
        let rest_key = std::env::var("VIGIL_FEED_API_KEY").unwrap_or_default();
        let poller = Arc::new(ContextPoller::new(rest_base, rest_key));

        for symbol in state.runtime_config.read().pairs.all() {
            tokio::spawn(market_context::poller::run_context_poller(
                state.clone(),
                poller.clone(),
                symbol,
            ));
        }
    } else {
        info!("market context polling disabled by config");
    }

    // ── 9. Outcome monitor & sweeper ─────────────────────────────────────
    tokio::spawn(pipeline::run_outcome_loop(state.clone()));
    tokio::spawn(pipeline::run_sweeper(state.clone()));

    // ── 10. Delivery worker ──────────────────────────────────────────────
    let tg_token = std::env::var("VIGIL_TELEGRAM_TOKEN").unwrap_or_default();
    let tg_chat = std::env::var("VIGIL_TELEGRAM_CHAT_ID").unwrap_or_default();
    let sink = Arc::new(TelegramSink::new(tg_token, tg_chat));
    if !sink.is_configured() {
        warn!("telegram credentials not set — signals will reach the dashboard only");
    }
    let delivery_handle = tokio::spawn(delivery::telegram::run_delivery_worker(
        state.clone(),
        sink,
        delivery_rx,
    ));

    info!("all subsystems running — press Ctrl+C to stop");

    // ── 11. Graceful shutdown ────────────────────────────────────────────
    tokio::signal::ctrl_c().await?;
    warn!("shutdown signal received — stopping gracefully");

    // Stop producing deliveries, then let the worker drain the queue.
    pipeline_handle.abort();
    drop(delivery_tx);
    if tokio::time::timeout(
        tokio::time::Duration::from_secs(SHUTDOWN_DRAIN_SECS),
        delivery_handle,
    )
    .await
    .is_err()
    {
        warn!("delivery queue drain timed out");
    }

    state.persist_confidence_state();
    if let Err(e) = state.runtime_config.read().save(CONFIG_PATH) {
        error!(error = %e, "failed to save runtime config on shutdown");
    }

    info!("Vigil shut down complete");
    Ok(())
}
