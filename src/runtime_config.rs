// =============================================================================
// Runtime Configuration — Hot-reloadable pipeline settings with atomic save
// =============================================================================
//
// Central configuration hub for the Vigil pipeline. Every tunable threshold
// lives here so the pipeline can be re-tuned without a rebuild.
//
// Persistence uses an atomic tmp + rename pattern to prevent corruption on
// crash. All fields carry `#[serde(default)]` so that adding new fields never
// breaks loading an older config file.
// =============================================================================

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::types::Tier;

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_primary_pairs() -> Vec<String> {
    vec!["BTCUSDT".to_string(), "ETHUSDT".to_string()]
}

fn default_secondary_pairs() -> Vec<String> {
    vec!["SOLUSDT".to_string(), "XRPUSDT".to_string()]
}

fn default_tier1_symbols() -> Vec<String> {
    vec!["BTCUSDT".to_string(), "ETHUSDT".to_string()]
}

fn default_tier2_symbols() -> Vec<String> {
    vec![
        "SOLUSDT".to_string(),
        "XRPUSDT".to_string(),
        "BNBUSDT".to_string(),
        "DOGEUSDT".to_string(),
    ]
}

fn default_tier1_cascade() -> f64 {
    2_000_000.0
}

fn default_tier2_cascade() -> f64 {
    200_000.0
}

fn default_tier3_cascade() -> f64 {
    50_000.0
}

fn default_tier1_large_order() -> f64 {
    10_000.0
}

fn default_tier2_large_order() -> f64 {
    5_000.0
}

fn default_tier3_large_order() -> f64 {
    2_000.0
}

fn default_absorption_min() -> f64 {
    5_000.0
}

fn default_tier1_absorption() -> f64 {
    100_000.0
}

fn default_tier2_absorption() -> f64 {
    20_000.0
}

fn default_tier3_absorption() -> f64 {
    5_000.0
}

fn default_whale_min() -> u32 {
    3
}

fn default_whale_event_min() -> u32 {
    5
}

fn default_min_confidence() -> f64 {
    70.0
}

fn default_max_signals_per_hour() -> u32 {
    50
}

fn default_cooldown_minutes() -> u64 {
    5
}

fn default_dedup_window_secs() -> u64 {
    300
}

fn default_true() -> bool {
    true
}

fn default_poll_interval_secs() -> u64 {
    300
}

fn default_max_snapshots() -> usize {
    72
}

fn default_filter_mode() -> FilterMode {
    FilterMode::Normal
}

fn default_context_age_max_secs() -> u64 {
    600
}

fn default_funding_hi() -> f64 {
    0.0001
}

fn default_funding_lo() -> f64 {
    0.0001
}

fn default_oi_threshold() -> f64 {
    0.02
}

fn default_favorable_bonus() -> f64 {
    5.0
}

fn default_neutral_bonus() -> f64 {
    2.0
}

fn default_unfavorable_penalty() -> f64 {
    10.0
}

fn default_cors_origins() -> Vec<String> {
    Vec::new()
}

fn default_rate_limit_per_min() -> u32 {
    30
}

fn default_horizon_minutes() -> u64 {
    15
}

fn default_win_fraction() -> f64 {
    0.5
}

fn default_liquidation_cap() -> usize {
    1000
}

fn default_trade_cap() -> usize {
    500
}

fn default_retention_secs() -> u64 {
    3600
}

fn default_grace_ms() -> i64 {
    2000
}

fn default_analyzer_tick_secs() -> u64 {
    15
}

fn default_debounce_ms() -> i64 {
    2000
}

fn default_coalesce_ms() -> i64 {
    2000
}

// =============================================================================
// Sections
// =============================================================================

/// Symbols subscribed on the upstream feed, with priority weighting: primary
/// pairs get their trade channel subscribed first.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PairsConfig {
    #[serde(default = "default_primary_pairs")]
    pub primary: Vec<String>,
    #[serde(default = "default_secondary_pairs")]
    pub secondary: Vec<String>,
}

impl Default for PairsConfig {
    fn default() -> Self {
        Self {
            primary: default_primary_pairs(),
            secondary: default_secondary_pairs(),
        }
    }
}

impl PairsConfig {
    /// All subscribed symbols, primary first, de-duplicated.
    pub fn all(&self) -> Vec<String> {
        let mut out: Vec<String> = Vec::new();
        for s in self.primary.iter().chain(self.secondary.iter()) {
            let upper = s.to_uppercase();
            if !out.contains(&upper) {
                out.push(upper);
            }
        }
        out
    }
}

/// Tier assignment and tier-scaled volume thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitoringConfig {
    #[serde(default = "default_tier1_symbols")]
    pub tier1_symbols: Vec<String>,
    #[serde(default = "default_tier2_symbols")]
    pub tier2_symbols: Vec<String>,

    /// Cascade volume thresholds in USD (strict `>` to trigger).
    #[serde(default = "default_tier1_cascade")]
    pub tier1_cascade: f64,
    #[serde(default = "default_tier2_cascade")]
    pub tier2_cascade: f64,
    #[serde(default = "default_tier3_cascade")]
    pub tier3_cascade: f64,

    /// "Large order" notional floor in USD, per tier.
    #[serde(default = "default_tier1_large_order")]
    pub tier1_large_order: f64,
    #[serde(default = "default_tier2_large_order")]
    pub tier2_large_order: f64,
    #[serde(default = "default_tier3_large_order")]
    pub tier3_large_order: f64,

    /// Minimum per-trade notional counted toward absorption, tier-1 basis.
    /// Lower tiers scale this down proportionally to their large-order floor.
    #[serde(default = "default_absorption_min")]
    pub absorption_min: f64,

    /// Absorption volume thresholds in USD, per tier.
    #[serde(default = "default_tier1_absorption")]
    pub tier1_absorption: f64,
    #[serde(default = "default_tier2_absorption")]
    pub tier2_absorption: f64,
    #[serde(default = "default_tier3_absorption")]
    pub tier3_absorption: f64,

    /// Minimum large-order count for an order-flow signal.
    #[serde(default = "default_whale_min")]
    pub whale_min: u32,

    /// Minimum distinct large orders for a whale accumulation/distribution.
    #[serde(default = "default_whale_event_min")]
    pub whale_event_min: u32,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            tier1_symbols: default_tier1_symbols(),
            tier2_symbols: default_tier2_symbols(),
            tier1_cascade: default_tier1_cascade(),
            tier2_cascade: default_tier2_cascade(),
            tier3_cascade: default_tier3_cascade(),
            tier1_large_order: default_tier1_large_order(),
            tier2_large_order: default_tier2_large_order(),
            tier3_large_order: default_tier3_large_order(),
            absorption_min: default_absorption_min(),
            tier1_absorption: default_tier1_absorption(),
            tier2_absorption: default_tier2_absorption(),
            tier3_absorption: default_tier3_absorption(),
            whale_min: default_whale_min(),
            whale_event_min: default_whale_event_min(),
        }
    }
}

impl MonitoringConfig {
    /// Resolve the static tier of a symbol. Unknown symbols are Tier3.
    pub fn tier_of(&self, symbol: &str) -> Tier {
        if self.tier1_symbols.iter().any(|s| s.eq_ignore_ascii_case(symbol)) {
            Tier::Tier1
        } else if self.tier2_symbols.iter().any(|s| s.eq_ignore_ascii_case(symbol)) {
            Tier::Tier2
        } else {
            Tier::Tier3
        }
    }

    pub fn cascade_threshold(&self, tier: Tier) -> f64 {
        match tier {
            Tier::Tier1 => self.tier1_cascade,
            Tier::Tier2 => self.tier2_cascade,
            Tier::Tier3 => self.tier3_cascade,
        }
    }

    pub fn large_order_threshold(&self, tier: Tier) -> f64 {
        match tier {
            Tier::Tier1 => self.tier1_large_order,
            Tier::Tier2 => self.tier2_large_order,
            Tier::Tier3 => self.tier3_large_order,
        }
    }

    pub fn absorption_threshold(&self, tier: Tier) -> f64 {
        match tier {
            Tier::Tier1 => self.tier1_absorption,
            Tier::Tier2 => self.tier2_absorption,
            Tier::Tier3 => self.tier3_absorption,
        }
    }

    /// Per-trade floor for absorption counting, scaled by tier like the
    /// large-order floor.
    pub fn absorption_min_order(&self, tier: Tier) -> f64 {
        let scale = self.large_order_threshold(tier) / self.tier1_large_order.max(1.0);
        self.absorption_min * scale
    }
}

/// Gates between the merger and delivery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalsConfig {
    #[serde(default = "default_min_confidence")]
    pub min_confidence: f64,
    #[serde(default = "default_max_signals_per_hour")]
    pub max_signals_per_hour: u32,
    #[serde(default = "default_cooldown_minutes")]
    pub cooldown_minutes: u64,
    #[serde(default = "default_dedup_window_secs")]
    pub dedup_window_secs: u64,
}

impl Default for SignalsConfig {
    fn default() -> Self {
        Self {
            min_confidence: default_min_confidence(),
            max_signals_per_hour: default_max_signals_per_hour(),
            cooldown_minutes: default_cooldown_minutes(),
            dedup_window_secs: default_dedup_window_secs(),
        }
    }
}

impl SignalsConfig {
    pub fn cooldown_ms(&self) -> i64 {
        (self.cooldown_minutes * 60_000) as i64
    }

    pub fn dedup_window_ms(&self) -> i64 {
        (self.dedup_window_secs * 1000) as i64
    }
}

/// What the context filter does with an unfavorable assessment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FilterMode {
    /// Only favorable signals reach the messaging sink.
    Strict,
    /// Unfavorable signals are kept off the messaging sink but still reach
    /// the dashboard.
    Normal,
    /// Nothing is suppressed; confidence is adjusted only.
    Permissive,
}

impl std::fmt::Display for FilterMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Strict => write!(f, "strict"),
            Self::Normal => write!(f, "normal"),
            Self::Permissive => write!(f, "permissive"),
        }
    }
}

/// Open-interest / funding-rate context subsystem.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketContextConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_max_snapshots")]
    pub max_snapshots: usize,
    #[serde(default = "default_filter_mode")]
    pub filter_mode: FilterMode,
    /// Snapshots older than this are treated as absent.
    #[serde(default = "default_context_age_max_secs")]
    pub age_max_secs: u64,
    /// Crowded-side funding threshold (signed fraction per funding period).
    #[serde(default = "default_funding_hi")]
    pub funding_hi: f64,
    /// Contrarian-side funding threshold.
    #[serde(default = "default_funding_lo")]
    pub funding_lo: f64,
    /// Minimum 1 h open-interest change fraction.
    #[serde(default = "default_oi_threshold")]
    pub oi_threshold: f64,
    #[serde(default = "default_favorable_bonus")]
    pub favorable_bonus: f64,
    #[serde(default = "default_neutral_bonus")]
    pub neutral_bonus: f64,
    #[serde(default = "default_unfavorable_penalty")]
    pub unfavorable_penalty: f64,
}

impl Default for MarketContextConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            poll_interval_secs: default_poll_interval_secs(),
            max_snapshots: default_max_snapshots(),
            filter_mode: default_filter_mode(),
            age_max_secs: default_context_age_max_secs(),
            funding_hi: default_funding_hi(),
            funding_lo: default_funding_lo(),
            oi_threshold: default_oi_threshold(),
            favorable_bonus: default_favorable_bonus(),
            neutral_bonus: default_neutral_bonus(),
            unfavorable_penalty: default_unfavorable_penalty(),
        }
    }
}

/// Dashboard HTTP/WS surface. The API token itself lives in the
/// `VIGIL_API_TOKEN` environment variable, never in this file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DashboardConfig {
    /// Allowed CORS origins; empty list means "any" (development).
    #[serde(default = "default_cors_origins")]
    pub cors_origins: Vec<String>,
    /// Mutation-endpoint rate limit per remote address.
    #[serde(default = "default_rate_limit_per_min")]
    pub rate_limit_per_min: u32,
}

impl Default for DashboardConfig {
    fn default() -> Self {
        Self {
            cors_origins: default_cors_origins(),
            rate_limit_per_min: default_rate_limit_per_min(),
        }
    }
}

/// Outcome tracking knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutcomeConfig {
    #[serde(default = "default_horizon_minutes")]
    pub horizon_minutes: u64,
    /// Progress-to-target fraction that counts as a win.
    #[serde(default = "default_win_fraction")]
    pub win_fraction: f64,
}

impl Default for OutcomeConfig {
    fn default() -> Self {
        Self {
            horizon_minutes: default_horizon_minutes(),
            win_fraction: default_win_fraction(),
        }
    }
}

impl OutcomeConfig {
    pub fn horizon_ms(&self) -> i64 {
        (self.horizon_minutes * 60_000) as i64
    }
}

/// Buffer caps, retention and cadences for the hot path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuffersConfig {
    #[serde(default = "default_liquidation_cap")]
    pub liquidation_cap: usize,
    #[serde(default = "default_trade_cap")]
    pub trade_cap: usize,
    #[serde(default = "default_retention_secs")]
    pub retention_secs: u64,
    /// Late-arrival tolerance before an event is dropped as out-of-order.
    #[serde(default = "default_grace_ms")]
    pub grace_ms: i64,
    /// Periodic analyzer cadence per symbol.
    #[serde(default = "default_analyzer_tick_secs")]
    pub analyzer_tick_secs: u64,
    /// Per-symbol debounce for trade-triggered analysis.
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: i64,
    /// Candidate coalescing window in the merger.
    #[serde(default = "default_coalesce_ms")]
    pub coalesce_ms: i64,
}

impl Default for BuffersConfig {
    fn default() -> Self {
        Self {
            liquidation_cap: default_liquidation_cap(),
            trade_cap: default_trade_cap(),
            retention_secs: default_retention_secs(),
            grace_ms: default_grace_ms(),
            analyzer_tick_secs: default_analyzer_tick_secs(),
            debounce_ms: default_debounce_ms(),
            coalesce_ms: default_coalesce_ms(),
        }
    }
}

impl BuffersConfig {
    pub fn retention_ms(&self) -> i64 {
        (self.retention_secs * 1000) as i64
    }
}

// =============================================================================
// RuntimeConfig
// =============================================================================

/// Top-level runtime configuration for the Vigil pipeline.
///
/// Every field has a serde default so older JSON files missing new sections
/// still deserialise correctly.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default)]
    pub pairs: PairsConfig,
    #[serde(default)]
    pub monitoring: MonitoringConfig,
    #[serde(default)]
    pub signals: SignalsConfig,
    #[serde(default)]
    pub market_context: MarketContextConfig,
    #[serde(default)]
    pub dashboard: DashboardConfig,
    #[serde(default)]
    pub outcome: OutcomeConfig,
    #[serde(default)]
    pub buffers: BuffersConfig,
}

impl RuntimeConfig {
    /// Load configuration from a JSON file at `path`.
    ///
    /// If the file does not exist, returns an error so the caller can fall
    /// back to defaults with a warning.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read runtime config from {}", path.display()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse runtime config from {}", path.display()))?;

        info!(
            path = %path.display(),
            pairs = ?config.pairs.all(),
            filter_mode = %config.market_context.filter_mode,
            "runtime config loaded"
        );

        Ok(config)
    }

    /// Persist the current configuration to `path` using an atomic write
    /// (write to `.tmp`, then rename).
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        let content = serde_json::to_string_pretty(self)
            .context("failed to serialise runtime config to JSON")?;

        let tmp_path = path.with_extension("json.tmp");

        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp config to {}", tmp_path.display()))?;

        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp config to {}", path.display()))?;

        info!(path = %path.display(), "runtime config saved (atomic)");
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================
