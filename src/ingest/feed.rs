// =============================================================================
// Feed Task — upstream WebSocket connection and subscription management
// =============================================================================
//
// Connects to the vendor feed (API key as a connection query parameter — the
// feed has no in-band login frame), subscribes the global liquidation channel
// and one aggregated-trade channel per monitored symbol, and pushes
// normalised events into the pipeline channel.
//
// The function returns on any terminal condition — read error, stream end,
// or three consecutive read timeouts of the heartbeat interval — and the
// outer loop in main.rs reconnects. Record-level problems are counted and
// never terminate the connection.
// =============================================================================

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use crate::app_state::AppState;
use crate::ingest::normalizer::{
    self, Frame, RejectReason, LIQUIDATION_CHANNEL, TRADE_CHANNEL,
};
use crate::ingest::FeedEvent;

/// Expected heartbeat cadence; also the per-read timeout.
const HEARTBEAT_INTERVAL_SECS: u64 = 30;
/// Consecutive read timeouts before the connection is considered dead.
const MAX_READ_TIMEOUTS: u32 = 3;
/// Minimum per-trade notional requested on the trade channels.
const TRADE_MIN_NOTIONAL_USD: u64 = 1_000;

/// Build the connection URL with the API key as a query parameter.
pub fn feed_url(base: &str, api_key: &str) -> String {
    if api_key.is_empty() {
        base.to_string()
    } else {
        let sep = if base.contains('?') { '&' } else { '?' };
        format!("{base}{sep}apiKey={api_key}")
    }
}

/// Run one connection lifetime. Returns so the caller can reconnect.
pub async fn run_feed(
    state: Arc<AppState>,
    tx: mpsc::Sender<FeedEvent>,
    url: String,
) -> Result<()> {
    info!("connecting to upstream feed");

    let (ws_stream, _response) = connect_async(&url)
        .await
        .context("failed to connect to upstream feed")?;

    info!("upstream feed connected");
    let (mut write, mut read) = ws_stream.split();

    // Subscribe: global liquidations, then per-symbol trades (primary pairs
    // first — the config keeps them ordered).
    let symbols = state.runtime_config.read().pairs.all();
    let subscribe_liq = serde_json::json!({
        "method": "subscribe",
        "channel": LIQUIDATION_CHANNEL,
    });
    write
        .send(Message::Text(subscribe_liq.to_string()))
        .await
        .context("failed to subscribe liquidation channel")?;

    for symbol in &symbols {
        let subscribe_trades = serde_json::json!({
            "method": "subscribe",
            "channel": TRADE_CHANNEL,
            "symbol": symbol,
            "minVolUsd": TRADE_MIN_NOTIONAL_USD,
        });
        write
            .send(Message::Text(subscribe_trades.to_string()))
            .await
            .with_context(|| format!("failed to subscribe trade channel for {symbol}"))?;
    }
    info!(symbols = symbols.len(), "feed subscriptions sent");

    *state.feed_connected.write() = true;
    *state.last_feed_event.write() = std::time::Instant::now();
    state.increment_version();

    let mut timeout_strikes: u32 = 0;

    let result = loop {
        let msg = tokio::time::timeout(
            Duration::from_secs(HEARTBEAT_INTERVAL_SECS),
            read.next(),
        )
        .await;

        match msg {
            Err(_) => {
                timeout_strikes += 1;
                warn!(timeout_strikes, "feed read timeout");
                if timeout_strikes >= MAX_READ_TIMEOUTS {
                    break Err(anyhow::anyhow!(
                        "feed idle: {MAX_READ_TIMEOUTS} consecutive read timeouts"
                    ));
                }
                // Nudge the feed; many vendors answer text pings.
                if write.send(Message::Text("ping".to_string())).await.is_err() {
                    break Err(anyhow::anyhow!("feed write failed during ping"));
                }
            }
            Ok(Some(Ok(Message::Text(text)))) => {
                timeout_strikes = 0;
                *state.last_feed_event.write() = std::time::Instant::now();
                if !handle_text_frame(&state, &tx, &text).await {
                    break Ok(()); // pipeline channel closed
                }
            }
            Ok(Some(Ok(Message::Ping(data)))) => {
                timeout_strikes = 0;
                if write.send(Message::Pong(data)).await.is_err() {
                    break Err(anyhow::anyhow!("feed write failed during pong"));
                }
            }
            Ok(Some(Ok(Message::Pong(_)))) => {
                timeout_strikes = 0;
            }
            Ok(Some(Ok(Message::Close(_)))) => {
                info!("feed sent close frame");
                break Ok(());
            }
            Ok(Some(Ok(_))) => {
                // Binary and frame-level noise — ignore.
            }
            Ok(Some(Err(e))) => {
                break Err(e).context("feed read error");
            }
            Ok(None) => {
                warn!("feed stream ended");
                break Ok(());
            }
        }
    };

    *state.feed_connected.write() = false;
    state.increment_version();
    result
}

/// Process one text frame. Returns `false` only when the pipeline channel is
/// closed and the feed should shut down.
async fn handle_text_frame(
    state: &Arc<AppState>,
    tx: &mpsc::Sender<FeedEvent>,
    text: &str,
) -> bool {
    state.counters.frames_total.fetch_add(1, Ordering::Relaxed);

    let frame = match normalizer::parse_frame(text) {
        Ok(frame) => frame,
        Err(reason) => {
            count_reject(state, reason);
            return true;
        }
    };

    match frame {
        Frame::Heartbeat => true,
        Frame::SubscriptionAck { channel } => {
            debug!(channel = %channel, "subscription acknowledged");
            true
        }
        Frame::Other => true,
        Frame::Data { channel, events } => {
            for event in &events {
                let normalized = if channel == LIQUIDATION_CHANNEL {
                    normalizer::normalize_liquidation(event).map(FeedEvent::Liquidation)
                } else if channel.starts_with(TRADE_CHANNEL) {
                    normalizer::normalize_trade(event).map(FeedEvent::Trade)
                } else {
                    continue;
                };

                match normalized {
                    Ok(event) => {
                        if tx.send(event).await.is_err() {
                            warn!("pipeline channel closed");
                            return false;
                        }
                    }
                    Err(reason) => count_reject(state, reason),
                }
            }
            true
        }
    }
}

fn count_reject(state: &Arc<AppState>, reason: RejectReason) {
    state.counters.frames_rejected.fetch_add(1, Ordering::Relaxed);
    let counter = match reason {
        RejectReason::MissingSymbol => &state.counters.rejected_missing_symbol,
        RejectReason::BadPrice => &state.counters.rejected_bad_price,
        RejectReason::BadNotional => &state.counters.rejected_bad_notional,
        RejectReason::Unparseable => &state.counters.rejected_unparseable,
    };
    counter.fetch_add(1, Ordering::Relaxed);
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_appends_api_key_as_query_param() {
        assert_eq!(
            feed_url("wss://feed.example.com/ws", "k123"),
            "wss://feed.example.com/ws?apiKey=k123"
        );
        assert_eq!(
            feed_url("wss://feed.example.com/ws?compress=1", "k123"),
            "wss://feed.example.com/ws?compress=1&apiKey=k123"
        );
        assert_eq!(feed_url("wss://feed.example.com/ws", ""), "wss://feed.example.com/ws");
    }
}
