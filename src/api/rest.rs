// =============================================================================
// REST API Endpoints — Axum 0.7
// =============================================================================
//
// All endpoints live under `/api/v1/`. The health check is public; everything
// else requires a valid Bearer token via the `AuthBearer` extractor. The
// monitored-symbol mutations are additionally rate-limited per remote
// address.
// =============================================================================

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{ConnectInfo, Json, Path, State},
    http::{HeaderValue, StatusCode},
    response::IntoResponse,
    routing::{delete, get, post},
    Router,
};
use serde::Deserialize;
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};

use crate::api::auth::AuthBearer;
use crate::api::rate_limit::{LimitCheck, MutationLimiter};
use crate::app_state::AppState;
use crate::types::format_price;

/// Router state: the engine state plus the mutation limiter.
#[derive(Clone)]
pub struct ApiState {
    pub app: Arc<AppState>,
    pub limiter: Arc<MutationLimiter>,
}

// =============================================================================
// Router construction
// =============================================================================

/// Build the full REST API router with CORS middleware and shared state.
pub fn router(app: Arc<AppState>) -> Router {
    let cors = build_cors(&app);
    let state = ApiState {
        app,
        limiter: Arc::new(MutationLimiter::new()),
    };

    Router::new()
        // ── Public ──────────────────────────────────────────────────
        .route("/api/v1/health", get(health))
        // ── Authenticated ───────────────────────────────────────────
        .route("/api/v1/state", get(full_state))
        .route("/api/v1/signals", get(signals))
        .route("/api/v1/signals.csv", get(signals_csv))
        .route("/api/v1/order-flow", get(order_flow))
        .route("/api/v1/symbols", get(get_symbols))
        .route("/api/v1/symbols", post(add_symbol))
        .route("/api/v1/symbols/:symbol", delete(remove_symbol))
        // ── WebSocket push channel ──────────────────────────────────
        .route("/api/v1/ws", get(crate::api::ws::ws_handler))
        // ── Middleware & state ──────────────────────────────────────
        .layer(cors)
        .with_state(state)
}

fn build_cors(app: &Arc<AppState>) -> CorsLayer {
    let origins = app.runtime_config.read().dashboard.cors_origins.clone();
    if origins.is_empty() {
        // Development default.
        CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any)
    } else {
        let parsed: Vec<HeaderValue> = origins
            .iter()
            .filter_map(|o| o.parse::<HeaderValue>().ok())
            .collect();
        CorsLayer::new()
            .allow_origin(tower_http::cors::AllowOrigin::list(parsed))
            .allow_methods(Any)
            .allow_headers(Any)
    }
}

// =============================================================================
// Health (public)
// =============================================================================

async fn health(State(state): State<ApiState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "feed_connected": *state.app.feed_connected.read(),
        "state_version": state.app.current_state_version(),
        "server_time": chrono::Utc::now().timestamp_millis(),
    }))
}

// =============================================================================
// Snapshot & signals (authenticated)
// =============================================================================

async fn full_state(_auth: AuthBearer, State(state): State<ApiState>) -> impl IntoResponse {
    Json(state.app.build_snapshot())
}

#[derive(Deserialize)]
struct SignalsQuery {
    #[serde(default = "default_signal_limit")]
    limit: usize,
}

fn default_signal_limit() -> usize {
    100
}

async fn signals(
    _auth: AuthBearer,
    State(state): State<ApiState>,
    axum::extract::Query(query): axum::extract::Query<SignalsQuery>,
) -> impl IntoResponse {
    match state.app.store.recent_signals(query.limit.min(1000)) {
        Ok(rows) => Json(rows).into_response(),
        Err(e) => {
            warn!(error = %e, "failed to read signals from store");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({ "error": "store read failed" })),
            )
                .into_response()
        }
    }
}

async fn signals_csv(
    _auth: AuthBearer,
    State(state): State<ApiState>,
    axum::extract::Query(query): axum::extract::Query<SignalsQuery>,
) -> impl IntoResponse {
    let rows = match state.app.store.recent_signals(query.limit.min(10_000)) {
        Ok(rows) => rows,
        Err(e) => {
            warn!(error = %e, "failed to read signals for CSV export");
            return (StatusCode::INTERNAL_SERVER_ERROR, "store read failed").into_response();
        }
    };

    let mut csv = String::from(
        "id,ts,symbol,kind,direction,entry,stop,target,confidence,tier,priority,context\n",
    );
    for s in rows {
        csv.push_str(&format!(
            "{},{},{},{},{},{},{},{},{:.1},{},{},{}\n",
            s.id,
            s.ts,
            s.symbol,
            s.kind,
            s.direction,
            format_price(s.entry),
            format_price(s.stop),
            format_price(s.target),
            s.confidence,
            s.tier,
            s.priority,
            s.context,
        ));
    }

    (
        StatusCode::OK,
        [(axum::http::header::CONTENT_TYPE, "text/csv; charset=utf-8")],
        csv,
    )
        .into_response()
}

// =============================================================================
// Order flow (authenticated)
// =============================================================================

async fn order_flow(_auth: AuthBearer, State(state): State<ApiState>) -> impl IntoResponse {
    let now_ms = chrono::Utc::now().timestamp_millis();
    let symbols = state.app.runtime_config.read().pairs.all();
    let summaries: std::collections::HashMap<String, _> = symbols
        .into_iter()
        .map(|s| {
            let summary = state.app.order_flow_summary(&s, now_ms);
            (s, summary)
        })
        .collect();
    Json(summaries)
}

// =============================================================================
// Monitored symbols (authenticated, mutations rate-limited)
// =============================================================================

async fn get_symbols(_auth: AuthBearer, State(state): State<ApiState>) -> impl IntoResponse {
    Json(state.app.runtime_config.read().pairs.all())
}

#[derive(Deserialize)]
struct SymbolRequest {
    symbol: String,
}

async fn add_symbol(
    _auth: AuthBearer,
    State(state): State<ApiState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Json(req): Json<SymbolRequest>,
) -> impl IntoResponse {
    if let Some(resp) = check_rate(&state, addr) {
        return resp;
    }

    let symbol = req.symbol.trim().to_uppercase();
    if symbol.is_empty() || !symbol.chars().all(|c| c.is_ascii_alphanumeric()) {
        return (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({ "error": "invalid symbol" })),
        )
            .into_response();
    }

    let added = state.app.add_symbol(&symbol);
    info!(symbol = %symbol, added, "symbol add requested via API");
    Json(serde_json::json!({
        "symbol": symbol,
        "added": added,
        "symbols": state.app.runtime_config.read().pairs.all(),
    }))
    .into_response()
}

async fn remove_symbol(
    _auth: AuthBearer,
    State(state): State<ApiState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Path(symbol): Path<String>,
) -> impl IntoResponse {
    if let Some(resp) = check_rate(&state, addr) {
        return resp;
    }

    let symbol = symbol.trim().to_uppercase();
    let removed = state.app.remove_symbol(&symbol);
    info!(symbol = %symbol, removed, "symbol remove requested via API");
    Json(serde_json::json!({
        "symbol": symbol,
        "removed": removed,
        "symbols": state.app.runtime_config.read().pairs.all(),
    }))
    .into_response()
}

fn check_rate(state: &ApiState, addr: SocketAddr) -> Option<axum::response::Response> {
    let budget = state.app.runtime_config.read().dashboard.rate_limit_per_min;
    match state.limiter.check(addr.ip(), budget) {
        LimitCheck::Allowed => None,
        LimitCheck::Exceeded { retry_after_secs } => {
            warn!(ip = %addr.ip(), "mutation rate limit exceeded");
            Some(
                (
                    StatusCode::TOO_MANY_REQUESTS,
                    [(axum::http::header::RETRY_AFTER, retry_after_secs.to_string())],
                    Json(serde_json::json!({
                        "error": "rate_limit_exceeded",
                        "retry_after_seconds": retry_after_secs,
                    })),
                )
                    .into_response(),
            )
        }
    }
}
