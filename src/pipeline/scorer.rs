// =============================================================================
// Confidence Scorer — adaptive, outcome-aware score adjustment
// =============================================================================
//
// Takes the merger's confidence and applies:
//
//   1. Producer bias   — once an analyzer has 20 recorded outcomes, its
//                        win rate shifts future scores by up to ±10
//   2. Tier bias       — +0 / +2 / +4 for T1 / T2 / T3 (small-cap boost)
//   3. Clamp to [0, 100] and priority assignment
//
// The win/loss table is the closed feedback loop of the pipeline: the
// outcome tracker is its only writer, and every update flows through
// `record_outcome` under a single lock.
// =============================================================================

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::types::{OutcomeLabel, Priority, Producer, SignalKind, Tier, TradingSignal};

/// Outcomes required before a producer's win rate starts biasing scores.
const BIAS_FLOOR: u32 = 20;

/// Win/loss tally for one producer.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct ProducerRecord {
    pub wins: u32,
    pub losses: u32,
}

impl ProducerRecord {
    pub fn total(&self) -> u32 {
        self.wins + self.losses
    }

    pub fn win_rate(&self) -> f64 {
        let total = self.total();
        if total == 0 {
            0.0
        } else {
            self.wins as f64 / total as f64
        }
    }
}

/// Persisted scorer state. Serialised to the state blob on shutdown and
/// periodically; restored on boot so bias survives restarts byte-for-byte.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConfidenceState {
    /// Keyed by `Producer::as_str()`.
    pub producers: HashMap<String, ProducerRecord>,
}

/// The scorer itself — a thin stateful wrapper over [`ConfidenceState`].
pub struct ConfidenceScorer {
    state: ConfidenceState,
}

impl ConfidenceScorer {
    pub fn new() -> Self {
        Self {
            state: ConfidenceState::default(),
        }
    }

    pub fn from_state(state: ConfidenceState) -> Self {
        Self { state }
    }

    pub fn state(&self) -> &ConfidenceState {
        &self.state
    }

    /// Bias contributed by a producer's historical win rate:
    /// `clamp(20·win_rate − 10, −10, +10)`, zero before the outcome floor.
    pub fn producer_bias(&self, producer: Producer) -> f64 {
        let record = match self.state.producers.get(producer.as_str()) {
            Some(r) => r,
            None => return 0.0,
        };
        if record.total() < BIAS_FLOOR {
            return 0.0;
        }
        (20.0 * record.win_rate() - 10.0).clamp(-10.0, 10.0)
    }

    /// Small-cap quality boost.
    pub fn tier_bias(tier: Tier) -> f64 {
        match tier {
            Tier::Tier1 => 0.0,
            Tier::Tier2 => 2.0,
            Tier::Tier3 => 4.0,
        }
    }

    /// Apply all adjustments in place and re-derive the priority.
    pub fn score(&self, signal: &mut TradingSignal) {
        let producer = producer_of(signal.kind);
        let bias = self.producer_bias(producer);
        let tier = Self::tier_bias(signal.tier);

        signal.confidence = (signal.confidence + bias + tier).clamp(0.0, 100.0);
        signal.priority = Priority::from_confidence(signal.confidence);

        debug!(
            symbol = %signal.symbol,
            producer = %producer,
            bias,
            tier_bias = tier,
            confidence = signal.confidence,
            "signal scored"
        );
    }

    /// Fold an outcome into the producer's tally. Expired outcomes carry no
    /// information about the analyzer and are ignored.
    pub fn record_outcome(&mut self, producer: Producer, label: OutcomeLabel) {
        let record = self
            .state
            .producers
            .entry(producer.as_str().to_string())
            .or_default();
        match label {
            OutcomeLabel::Win => record.wins += 1,
            OutcomeLabel::Loss => record.losses += 1,
            OutcomeLabel::Expired => {}
        }
    }
}

impl Default for ConfidenceScorer {
    fn default() -> Self {
        Self::new()
    }
}

/// The analyzer behind a published signal kind, for bias lookup and outcome
/// attribution.
pub fn producer_of(kind: SignalKind) -> Producer {
    match kind {
        SignalKind::StopHunt => Producer::StopHunt,
        SignalKind::WhaleAccumulation | SignalKind::WhaleDistribution => Producer::WhaleEvent,
        SignalKind::Accumulation | SignalKind::Distribution => Producer::OrderFlow,
        SignalKind::VolumeSpike => Producer::VolumeSpike,
    }
}

// =============================================================================
// Tests
// =============================================================================
