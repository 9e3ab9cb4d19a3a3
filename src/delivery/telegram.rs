// =============================================================================
// Telegram Sink — formats and delivers signals with bounded retry
// =============================================================================
//
// One worker task drains the delivery queue. The sink owns the whole
// messaging boundary: formatting, per-chat rate limiting, and transport
// retries. Per signal: format a summary, wait for a chat slot, then up to
// three send attempts with 1/2/4 s backoff inside a 30 s total budget.
// Exhausted retries mark the signal `delivery-failed` in the store and the
// worker moves on — a broken chat transport never stalls the pipeline.
//
// Shutdown: when the queue sender is dropped, the worker drains what is left
// and returns; main bounds the drain with a timeout.
// =============================================================================

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::app_state::AppState;
use crate::delivery::DeliverySignal;
use crate::types::{format_price, Direction, Priority};

/// Retry schedule within one delivery.
const RETRY_BACKOFF_SECS: [u64; 3] = [1, 2, 4];
/// Total budget for one signal's delivery.
const DELIVERY_TIMEOUT_SECS: u64 = 30;
/// Telegram tolerates roughly this many messages per minute into one chat.
const CHAT_MESSAGES_PER_MIN: usize = 20;
/// Sliding window for the per-chat limit.
const CHAT_WINDOW: Duration = Duration::from_secs(60);

// =============================================================================
// Per-chat rate limiter
// =============================================================================

/// Sliding-window limiter keyed by chat id. The worker waits for a free slot
/// rather than dropping — the anti-spam validator upstream already bounds the
/// overall signal rate.
struct ChatRateLimiter {
    sent: Mutex<HashMap<String, VecDeque<Instant>>>,
}

impl ChatRateLimiter {
    fn new() -> Self {
        Self {
            sent: Mutex::new(HashMap::new()),
        }
    }

    /// Claim a slot for `chat` at `now`. `None` means the slot was claimed;
    /// otherwise the wait until the oldest entry leaves the window.
    fn try_acquire(&self, chat: &str, now: Instant) -> Option<Duration> {
        let mut sent = self.sent.lock();
        let window = sent.entry(chat.to_string()).or_default();
        while window
            .front()
            .map(|t| now.duration_since(*t) >= CHAT_WINDOW)
            .unwrap_or(false)
        {
            window.pop_front();
        }
        if window.len() < CHAT_MESSAGES_PER_MIN {
            window.push_back(now);
            None
        } else {
            window
                .front()
                .map(|t| (*t + CHAT_WINDOW).saturating_duration_since(now))
        }
    }

    /// Block until a slot frees for `chat`.
    async fn acquire(&self, chat: &str) {
        loop {
            match self.try_acquire(chat, Instant::now()) {
                None => return,
                Some(wait) => {
                    debug!(chat = %chat, wait_ms = wait.as_millis() as u64, "chat rate limit — waiting for a slot");
                    tokio::time::sleep(wait.max(Duration::from_millis(50))).await;
                }
            }
        }
    }
}

// =============================================================================
// Sink
// =============================================================================

/// Thin Telegram Bot API client with a per-chat message budget.
pub struct TelegramSink {
    client: reqwest::Client,
    token: String,
    chat_id: String,
    limiter: ChatRateLimiter,
}

impl TelegramSink {
    pub fn new(token: impl Into<String>, chat_id: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(10))
                .build()
                .expect("failed to build reqwest client for TelegramSink"),
            token: token.into(),
            chat_id: chat_id.into(),
            limiter: ChatRateLimiter::new(),
        }
    }

    /// Whether credentials are configured at all.
    pub fn is_configured(&self) -> bool {
        !self.token.is_empty() && !self.chat_id.is_empty()
    }

    async fn send(&self, text: &str) -> Result<()> {
        // One slot per message, waited for before the HTTP call so retries
        // inside a delivery each respect the chat budget too.
        self.limiter.acquire(&self.chat_id).await;

        let url = format!("https://api.telegram.org/bot{}/sendMessage", self.token);
        let resp = self
            .client
            .post(&url)
            .json(&serde_json::json!({
                "chat_id": self.chat_id,
                "text": text,
                "parse_mode": "HTML",
                "disable_web_page_preview": true,
            }))
            .send()
            .await
            .context("telegram sendMessage request failed")?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            anyhow::bail!("telegram API returned {status}: {body}");
        }
        Ok(())
    }
}

/// Human-readable message for one signal. Precision follows the price's
/// order of magnitude so meme-coin entries keep their sub-cent digits.
pub fn format_message(delivery: &DeliverySignal) -> String {
    let s = &delivery.signal;
    let headline = match s.priority {
        Priority::Urgent => "🚨",
        Priority::Watch => "👀",
        Priority::Info => "ℹ️",
    };
    let arrow = match s.direction {
        Direction::Long => "▲ LONG",
        Direction::Short => "▼ SHORT",
        Direction::None => "◆",
    };
    let degraded = if delivery.degraded { " [degraded]" } else { "" };

    format!(
        "{headline} <b>{kind}</b> {arrow} <b>{symbol}</b>{degraded}\n\
         entry {entry} | stop {stop} | target {target}\n\
         confidence {confidence:.0} ({priority}) | context {context} | {tier}",
        kind = s.kind,
        symbol = s.symbol,
        entry = format_price(s.entry),
        stop = format_price(s.stop),
        target = format_price(s.target),
        confidence = s.confidence,
        priority = s.priority,
        context = s.context,
        tier = s.tier,
    )
}

/// Drain the delivery queue until the sender side closes.
pub async fn run_delivery_worker(
    state: Arc<AppState>,
    sink: Arc<TelegramSink>,
    mut rx: mpsc::Receiver<DeliverySignal>,
) {
    info!(configured = sink.is_configured(), "delivery worker started");

    while let Some(delivery) = rx.recv().await {
        let id = delivery.signal.id.clone();

        if !sink.is_configured() {
            debug!(signal_id = %id, "telegram not configured — delivery skipped");
            continue;
        }

        let text = format_message(&delivery);
        let attempt_all = async {
            for (attempt, backoff) in RETRY_BACKOFF_SECS.iter().enumerate() {
                match sink.send(&text).await {
                    Ok(()) => return true,
                    Err(e) => {
                        warn!(signal_id = %id, attempt, error = %e, "telegram delivery attempt failed");
                        tokio::time::sleep(Duration::from_secs(*backoff)).await;
                    }
                }
            }
            false
        };

        let delivered = tokio::time::timeout(
            Duration::from_secs(DELIVERY_TIMEOUT_SECS),
            attempt_all,
        )
        .await
        .unwrap_or(false);

        if delivered {
            state
                .counters
                .signals_delivered
                .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            if let Err(e) = state.store.mark_delivery(&id, "delivered") {
                warn!(signal_id = %id, error = %e, "failed to record delivery status");
            }
            debug!(signal_id = %id, "signal delivered");
        } else {
            state
                .counters
                .delivery_failed
                .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            if let Err(e) = state.store.mark_delivery(&id, "delivery-failed") {
                warn!(signal_id = %id, error = %e, "failed to record delivery failure");
            }
            warn!(signal_id = %id, "signal delivery failed after retries");
        }
        state.increment_version();
    }

    info!("delivery queue closed — worker exiting");
}

// =============================================================================
// Tests
// =============================================================================
