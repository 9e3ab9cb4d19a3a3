// =============================================================================
// Context Poller — periodic open-interest / funding-rate REST polling
// =============================================================================
//
// Two endpoints per monitored symbol, polled at the configured cadence:
//
//   open-interest aggregated history   (candle-shaped series)
//   funding-rate oi-weighted history   (candle-shaped series)
//
// Only the close of the most recent bar is consumed. Failures retry inside
// the tick with exponential backoff; three consecutive failed ticks for a
// symbol escalate to a warning. The poller never touches the hot path — it
// feeds the context ring and the persistence tables only.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use rust_decimal::Decimal;
use tracing::{debug, info, warn};

use crate::app_state::AppState;
use crate::types::ContextSnapshot;

/// Per-call timeout on REST requests.
const REQUEST_TIMEOUT_SECS: u64 = 10;
/// In-tick retry backoff schedule (seconds).
const RETRY_BACKOFF_SECS: [u64; 3] = [1, 2, 4];
/// Consecutive failed ticks before escalating to a warning.
const FAILURE_WARN_THRESHOLD: u32 = 3;

/// REST client for the vendor's futures statistics endpoints.
pub struct ContextPoller {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl ContextPoller {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
                .build()
                .expect("failed to build reqwest client for ContextPoller"),
            base_url: base_url.into(),
            api_key: api_key.into(),
        }
    }

    /// Fetch the close of the most recent aggregated open-interest bar.
    pub async fn fetch_open_interest(&self, symbol: &str) -> Result<(i64, Decimal)> {
        let url = format!(
            "{}/api/futures/open-interest/aggregated-history?symbol={}&interval=5m&limit=1",
            self.base_url, symbol
        );
        self.fetch_history_close(&url, symbol).await
    }

    /// Fetch the close of the most recent oi-weighted funding-rate bar.
    pub async fn fetch_funding_rate(&self, symbol: &str) -> Result<(i64, Decimal)> {
        let url = format!(
            "{}/api/futures/funding-rate/oi-weight-history?symbol={}&interval=5m&limit=1",
            self.base_url, symbol
        );
        self.fetch_history_close(&url, symbol).await
    }

    async fn fetch_history_close(&self, url: &str, symbol: &str) -> Result<(i64, Decimal)> {
        let resp = self
            .client
            .get(url)
            .header("CG-API-KEY", &self.api_key)
            .send()
            .await
            .with_context(|| format!("GET context history for {symbol}"))?;

        let status = resp.status();
        let body: serde_json::Value = resp
            .json()
            .await
            .context("failed to parse context history response")?;

        if !status.is_success() {
            anyhow::bail!("context history API returned {}: {}", status, body);
        }

        parse_history_close(&body)
    }
}

/// Extract `(ts, close)` of the last bar from a candle-shaped history payload.
///
/// Numeric fields arrive as either JSON numbers or numeric strings.
fn parse_history_close(body: &serde_json::Value) -> Result<(i64, Decimal)> {
    let data = body["data"]
        .as_array()
        .context("context history response has no data array")?;
    let bar = data.last().context("context history data array is empty")?;

    let ts = bar["time"]
        .as_i64()
        .or_else(|| bar["t"].as_i64())
        .context("context history bar missing time")?;

    let close = parse_decimal_field(&bar["close"]).context("context history bar missing close")?;
    Ok((ts, close))
}

fn parse_decimal_field(val: &serde_json::Value) -> Option<Decimal> {
    match val {
        serde_json::Value::String(s) => s.parse().ok(),
        serde_json::Value::Number(n) => n.to_string().parse().ok(),
        _ => None,
    }
}

/// Poll loop for one symbol. Spawned once per monitored symbol from main.
pub async fn run_context_poller(state: Arc<AppState>, poller: Arc<ContextPoller>, symbol: String) {
    let interval_secs = state.runtime_config.read().market_context.poll_interval_secs;
    let mut ticker = tokio::time::interval(Duration::from_secs(interval_secs.max(1)));
    let mut consecutive_failures: u32 = 0;

    info!(symbol = %symbol, interval_secs, "context poller started");

    loop {
        ticker.tick().await;

        if !state.runtime_config.read().market_context.enabled {
            continue;
        }

        match poll_once(&state, &poller, &symbol).await {
            Ok(snapshot) => {
                consecutive_failures = 0;
                debug!(
                    symbol = %symbol,
                    oi = %snapshot.open_interest_usd,
                    funding = %snapshot.funding_rate,
                    "context snapshot stored"
                );
            }
            Err(e) => {
                consecutive_failures += 1;
                if consecutive_failures >= FAILURE_WARN_THRESHOLD {
                    warn!(
                        symbol = %symbol,
                        consecutive_failures,
                        error = %e,
                        "context polling degraded"
                    );
                } else {
                    debug!(symbol = %symbol, error = %e, "context poll failed");
                }
            }
        }
    }
}

/// One polling round: both endpoints with in-tick retry, then store + persist.
async fn poll_once(
    state: &Arc<AppState>,
    poller: &Arc<ContextPoller>,
    symbol: &str,
) -> Result<ContextSnapshot> {
    let (_, oi) = fetch_with_backoff(|| poller.fetch_open_interest(symbol)).await?;
    let (_, funding) = fetch_with_backoff(|| poller.fetch_funding_rate(symbol)).await?;

    let snapshot = ContextSnapshot {
        symbol: symbol.to_string(),
        ts: chrono::Utc::now().timestamp_millis(),
        open_interest_usd: oi,
        funding_rate: funding,
        source_exchange: "aggregated".to_string(),
    };

    state.context.push(snapshot.clone());

    // Persistence failures degrade to warn-and-continue.
    if let Err(e) = state.store.insert_context(&snapshot) {
        warn!(symbol = %symbol, error = %e, "failed to persist context snapshot");
    }
    state.increment_version();

    Ok(snapshot)
}

async fn fetch_with_backoff<F, Fut>(mut fetch: F) -> Result<(i64, Decimal)>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<(i64, Decimal)>>,
{
    let mut last_err = None;
    for (attempt, backoff) in RETRY_BACKOFF_SECS.iter().enumerate() {
        match fetch().await {
            Ok(v) => return Ok(v),
            Err(e) => {
                debug!(attempt, error = %e, "context fetch attempt failed");
                last_err = Some(e);
                tokio::time::sleep(Duration::from_secs(*backoff)).await;
            }
        }
    }
    Err(last_err.unwrap_or_else(|| anyhow::anyhow!("context fetch failed")))
}

// =============================================================================
// Tests
// =============================================================================
