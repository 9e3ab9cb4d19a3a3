// =============================================================================
// WebSocket Handler — incremental push channel for the dashboard
// =============================================================================
//
// Clients connect to `/api/v1/ws?token=<token>`. The token gates the upgrade
// and the first frame of the session is a full `stats_update` handshake.
// After that the session receives:
//
//   stats_update       counters + feed health, whenever state_version moved
//   order_flow_update  per-symbol flow summaries, piggybacked on the same tick
//   new_signal         fanned out from the pipeline broadcast channel
//
// Payloads are serialised per session — sessions never share mutable data.
// =============================================================================

use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use serde::Deserialize;
use tokio::time::{interval, Duration};
use tracing::{debug, info, warn};

use crate::api::auth::validate_token;
use crate::api::rest::ApiState;
use crate::app_state::AppState;
use crate::types::TradingSignal;

/// Push-check cadence.
const PUSH_INTERVAL_MS: u64 = 500;

#[derive(Deserialize)]
pub struct WsQuery {
    token: Option<String>,
}

// =============================================================================
// Upgrade handler
// =============================================================================

/// Validates the token from the `?token=` query parameter before upgrading.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<ApiState>,
    Query(query): Query<WsQuery>,
) -> impl IntoResponse {
    let token = query.token.unwrap_or_default();
    if !validate_token(&token) {
        warn!("WebSocket connection rejected: invalid token");
        return (
            axum::http::StatusCode::FORBIDDEN,
            "Invalid or missing token",
        )
            .into_response();
    }

    info!("WebSocket connection accepted — upgrading");
    ws.on_upgrade(move |socket| handle_ws_connection(socket, state.app))
        .into_response()
}

// =============================================================================
// Connection handler
// =============================================================================

async fn handle_ws_connection(socket: WebSocket, state: Arc<AppState>) {
    use futures_util::{SinkExt, StreamExt};

    let (mut sender, mut receiver) = socket.split();
    let mut signal_rx = state.signal_events.subscribe();

    // First-frame handshake: a full stats payload.
    let mut last_sent_version = state.current_state_version();
    if send_stats(&mut sender, &state).await.is_err() {
        warn!("failed to send WebSocket handshake frame");
        return;
    }

    let mut push_tick = interval(Duration::from_millis(PUSH_INTERVAL_MS));

    loop {
        tokio::select! {
            // ── Version-driven stats/order-flow push ────────────────────
            _ = push_tick.tick() => {
                let version = state.current_state_version();
                if version != last_sent_version {
                    if send_stats(&mut sender, &state).await.is_err() {
                        break;
                    }
                    if send_order_flow(&mut sender, &state).await.is_err() {
                        break;
                    }
                    last_sent_version = version;
                }
            }

            // ── New-signal fan-out ──────────────────────────────────────
            event = signal_rx.recv() => {
                match event {
                    Ok(signal) => {
                        if send_new_signal(&mut sender, &state, &signal).await.is_err() {
                            break;
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!(skipped, "WebSocket session lagged behind signal feed");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => {
                        info!("signal broadcast closed — ending WebSocket session");
                        break;
                    }
                }
            }

            // ── Client messages ─────────────────────────────────────────
            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        debug!(msg = %text, "WebSocket text message received (heartbeat)");
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if sender.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Pong(_))) => {}
                    Some(Ok(Message::Close(_))) => {
                        info!("WebSocket close frame received");
                        break;
                    }
                    Some(Ok(Message::Binary(_))) => {
                        debug!("WebSocket binary message ignored");
                    }
                    Some(Err(e)) => {
                        warn!(error = %e, "WebSocket receive error");
                        break;
                    }
                    None => break,
                }
            }
        }
    }

    info!("WebSocket connection closed");
}

// =============================================================================
// Frame builders
// =============================================================================

async fn send_stats<S>(sender: &mut S, state: &Arc<AppState>) -> Result<(), axum::Error>
where
    S: futures_util::Sink<Message, Error = axum::Error> + Unpin,
{
    let payload = serde_json::json!({
        "type": "stats_update",
        "seq": next_seq(state),
        "state_version": state.current_state_version(),
        "feed_connected": *state.feed_connected.read(),
        "counters": state.counters.snapshot(),
        "buffer_counters": state.buffers.counters.snapshot(),
        "validator_counters": state.guard.lock().counters,
    });
    send_json(sender, &payload).await
}

async fn send_order_flow<S>(sender: &mut S, state: &Arc<AppState>) -> Result<(), axum::Error>
where
    S: futures_util::Sink<Message, Error = axum::Error> + Unpin,
{
    let now_ms = chrono::Utc::now().timestamp_millis();
    let symbols = state.runtime_config.read().pairs.all();
    let flows: std::collections::HashMap<String, _> = symbols
        .into_iter()
        .map(|s| {
            let summary = state.order_flow_summary(&s, now_ms);
            (s, summary)
        })
        .collect();

    let payload = serde_json::json!({
        "type": "order_flow_update",
        "seq": next_seq(state),
        "flows": flows,
    });
    send_json(sender, &payload).await
}

async fn send_new_signal<S>(
    sender: &mut S,
    state: &Arc<AppState>,
    signal: &TradingSignal,
) -> Result<(), axum::Error>
where
    S: futures_util::Sink<Message, Error = axum::Error> + Unpin,
{
    let payload = serde_json::json!({
        "type": "new_signal",
        "seq": next_seq(state),
        "signal": signal,
    });
    send_json(sender, &payload).await
}

async fn send_json<S>(sender: &mut S, payload: &serde_json::Value) -> Result<(), axum::Error>
where
    S: futures_util::Sink<Message, Error = axum::Error> + Unpin,
{
    use futures_util::SinkExt;
    match serde_json::to_string(payload) {
        Ok(json) => sender.send(Message::Text(json)).await,
        Err(e) => {
            // Serialisation errors are not network errors; keep the session.
            warn!(error = %e, "failed to serialise WebSocket payload");
            Ok(())
        }
    }
}

fn next_seq(state: &Arc<AppState>) -> u64 {
    state
        .ws_sequence_number
        .fetch_add(1, std::sync::atomic::Ordering::Relaxed)
}
