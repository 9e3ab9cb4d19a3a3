// =============================================================================
// Shared types used across the Vigil intelligence pipeline
// =============================================================================

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Which side of the market was forcibly closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LiquidationSide {
    /// Long positions were liquidated (forced sells).
    LongLiquidated,
    /// Short positions were liquidated (forced buys).
    ShortLiquidated,
}

impl std::fmt::Display for LiquidationSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::LongLiquidated => write!(f, "long"),
            Self::ShortLiquidated => write!(f, "short"),
        }
    }
}

/// Aggressor side of an aggregated trade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TradeSide {
    Buy,
    Sell,
}

impl std::fmt::Display for TradeSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Buy => write!(f, "buy"),
            Self::Sell => write!(f, "sell"),
        }
    }
}

/// Trade direction a signal argues for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    Long,
    Short,
    None,
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Long => write!(f, "LONG"),
            Self::Short => write!(f, "SHORT"),
            Self::None => write!(f, "NONE"),
        }
    }
}

/// Static liquidity classification of a symbol. Scales every volume threshold
/// in the pipeline. Symbols not listed in the config are Tier3.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Tier {
    Tier1,
    Tier2,
    Tier3,
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Tier1 => write!(f, "T1"),
            Self::Tier2 => write!(f, "T2"),
            Self::Tier3 => write!(f, "T3"),
        }
    }
}

// =============================================================================
// Canonical event records
// =============================================================================

/// A single forced-liquidation event after normalisation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Liquidation {
    pub symbol: String,
    pub exchange: String,
    pub price: Decimal,
    pub side: LiquidationSide,
    pub notional_usd: Decimal,
    /// UTC milliseconds.
    pub ts: i64,
}

/// A single aggregated trade after normalisation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trade {
    pub symbol: String,
    pub exchange: String,
    pub price: Decimal,
    pub side: TradeSide,
    pub notional_usd: Decimal,
    /// UTC milliseconds.
    pub ts: i64,
}

/// One open-interest + funding observation for a symbol.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextSnapshot {
    pub symbol: String,
    /// UTC milliseconds.
    pub ts: i64,
    pub open_interest_usd: Decimal,
    /// Signed fraction, e.g. 0.0001 = 0.01% per funding period.
    pub funding_rate: Decimal,
    pub source_exchange: String,
}

// =============================================================================
// Signal pipeline types
// =============================================================================

/// Which analyzer produced a candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Producer {
    StopHunt,
    OrderFlow,
    WhaleEvent,
    VolumeSpike,
}

impl Producer {
    /// Merge priority: stop-hunt > whale > order-flow > volume-spike.
    pub fn priority(self) -> u8 {
        match self {
            Self::StopHunt => 3,
            Self::WhaleEvent => 2,
            Self::OrderFlow => 1,
            Self::VolumeSpike => 0,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::StopHunt => "stop_hunt",
            Self::OrderFlow => "order_flow",
            Self::WhaleEvent => "whale_event",
            Self::VolumeSpike => "volume_spike",
        }
    }
}

impl std::fmt::Display for Producer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Price band a pattern played out in.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PriceZone {
    pub lower: Decimal,
    pub upper: Decimal,
}

/// One analyzer's vote, alive for a single pipeline step.
#[derive(Debug, Clone, Serialize)]
pub struct Candidate {
    pub producer: Producer,
    pub symbol: String,
    pub direction: Direction,
    /// 0..100 before scorer adjustments. 0 means "analyzer errored, discard".
    pub raw_score: f64,
    pub zone: Option<PriceZone>,
    /// Aggregate notional that drove the detection (cascade volume,
    /// dominant-side volume, spike volume — producer-dependent).
    pub notional_usd: Decimal,
    pub large_orders: u32,
    pub ts: i64,
}

/// Published signal kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SignalKind {
    StopHunt,
    WhaleAccumulation,
    WhaleDistribution,
    Accumulation,
    Distribution,
    VolumeSpike,
}

impl SignalKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::StopHunt => "STOP_HUNT",
            Self::WhaleAccumulation => "WHALE_ACCUMULATION",
            Self::WhaleDistribution => "WHALE_DISTRIBUTION",
            Self::Accumulation => "ACCUMULATION",
            Self::Distribution => "DISTRIBUTION",
            Self::VolumeSpike => "VOLUME_SPIKE",
        }
    }

    /// The kind a producer's candidate maps to, given its direction.
    pub fn from_candidate(producer: Producer, direction: Direction) -> Self {
        match (producer, direction) {
            (Producer::StopHunt, _) => Self::StopHunt,
            (Producer::WhaleEvent, Direction::Short) => Self::WhaleDistribution,
            (Producer::WhaleEvent, _) => Self::WhaleAccumulation,
            (Producer::OrderFlow, Direction::Short) => Self::Distribution,
            (Producer::OrderFlow, _) => Self::Accumulation,
            (Producer::VolumeSpike, _) => Self::VolumeSpike,
        }
    }
}

impl std::fmt::Display for SignalKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Delivery urgency, derived from final confidence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Priority {
    Urgent,
    Watch,
    Info,
}

impl Priority {
    pub fn from_confidence(confidence: f64) -> Self {
        if confidence >= 85.0 {
            Self::Urgent
        } else if confidence >= 70.0 {
            Self::Watch
        } else {
            Self::Info
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Urgent => "urgent",
            Self::Watch => "watch",
            Self::Info => "info",
        }
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Market-context verdict attached to a signal. Exactly one per signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ContextAssessment {
    Favorable,
    Neutral,
    Unfavorable,
}

impl ContextAssessment {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Favorable => "favorable",
            Self::Neutral => "neutral",
            Self::Unfavorable => "unfavorable",
        }
    }
}

impl std::fmt::Display for ContextAssessment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A fully scored, merge-complete trading signal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradingSignal {
    pub id: String,
    pub symbol: String,
    pub kind: SignalKind,
    pub direction: Direction,
    pub entry: Decimal,
    pub stop: Decimal,
    pub target: Decimal,
    /// Final confidence in [0, 100].
    pub confidence: f64,
    pub tier: Tier,
    pub priority: Priority,
    pub context: ContextAssessment,
    /// Context data was stale or absent when assessed.
    pub context_stale: bool,
    /// UTC milliseconds.
    pub ts: i64,
    pub fingerprint: String,
}

/// Outcome label assigned at the check horizon.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OutcomeLabel {
    Win,
    Loss,
    Expired,
}

impl OutcomeLabel {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Win => "win",
            Self::Loss => "loss",
            Self::Expired => "expired",
        }
    }
}

impl std::fmt::Display for OutcomeLabel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Realised outcome of a delivered signal, created exactly once.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalOutcome {
    pub signal_id: String,
    pub ts: i64,
    pub price_at_check: Decimal,
    pub pct_to_target: f64,
    pub label: OutcomeLabel,
}

// =============================================================================
// Fingerprints & price formatting
// =============================================================================

/// Dedup fingerprint over (symbol, kind, direction, round(confidence / 5)).
///
/// The tuple is digested so near-identical signals collapse to the same short
/// hex token regardless of symbol length.
pub fn fingerprint(symbol: &str, kind: SignalKind, direction: Direction, confidence: f64) -> String {
    let bucket = (confidence / 5.0).round() as i64;
    let mut hasher = Sha256::new();
    hasher.update(symbol.as_bytes());
    hasher.update(kind.as_str().as_bytes());
    hasher.update(direction.to_string().as_bytes());
    hasher.update(bucket.to_le_bytes());
    let digest = hasher.finalize();
    hex::encode(&digest[..8])
}

/// Format a price with precision chosen by order of magnitude, so both
/// BTC (~1e5) and meme coins (~1e-5) print without losing information.
pub fn format_price(price: Decimal) -> String {
    let abs = price.abs();
    let dp = if abs >= Decimal::from(100) {
        2
    } else if abs >= Decimal::ONE {
        4
    } else if abs >= Decimal::new(1, 2) {
        6
    } else {
        8
    };
    price.round_dp(dp).normalize().to_string()
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn priority_thresholds() {
        assert_eq!(Priority::from_confidence(85.0), Priority::Urgent);
        assert_eq!(Priority::from_confidence(84.9), Priority::Watch);
        assert_eq!(Priority::from_confidence(70.0), Priority::Watch);
        assert_eq!(Priority::from_confidence(69.9), Priority::Info);
    }

    #[test]
    fn fingerprint_buckets_confidence_by_five() {
        let a = fingerprint("BTCUSDT", SignalKind::StopHunt, Direction::Long, 86.0);
        let b = fingerprint("BTCUSDT", SignalKind::StopHunt, Direction::Long, 87.4);
        let c = fingerprint("BTCUSDT", SignalKind::StopHunt, Direction::Long, 91.0);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn fingerprint_distinguishes_symbol_and_direction() {
        let a = fingerprint("BTCUSDT", SignalKind::StopHunt, Direction::Long, 80.0);
        let b = fingerprint("ETHUSDT", SignalKind::StopHunt, Direction::Long, 80.0);
        let c = fingerprint("BTCUSDT", SignalKind::StopHunt, Direction::Short, 80.0);
        assert_ne!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn price_formatting_preserves_subcent_precision() {
        assert_eq!(format_price(dec!(96000.50)), "96000.5");
        assert_eq!(format_price(dec!(0.00001234)), "0.00001234");
        assert_eq!(format_price(dec!(1.23456789)), "1.2346");
    }

    #[test]
    fn kind_mapping_follows_direction() {
        assert_eq!(
            SignalKind::from_candidate(Producer::OrderFlow, Direction::Long),
            SignalKind::Accumulation
        );
        assert_eq!(
            SignalKind::from_candidate(Producer::OrderFlow, Direction::Short),
            SignalKind::Distribution
        );
        assert_eq!(
            SignalKind::from_candidate(Producer::WhaleEvent, Direction::Short),
            SignalKind::WhaleDistribution
        );
        assert_eq!(
            SignalKind::from_candidate(Producer::StopHunt, Direction::Long),
            SignalKind::StopHunt
        );
    }

    #[test]
    fn producer_merge_priority_ordering() {
        assert!(Producer::StopHunt.priority() > Producer::WhaleEvent.priority());
        assert!(Producer::WhaleEvent.priority() > Producer::OrderFlow.priority());
        assert!(Producer::OrderFlow.priority() > Producer::VolumeSpike.priority());
    }
}
