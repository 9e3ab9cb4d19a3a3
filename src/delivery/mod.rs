// =============================================================================
// Delivery Module
// =============================================================================
//
// The outbound messaging boundary. The pipeline enqueues `DeliverySignal`s;
// the worker owns formatting, bounded retry and the delivery-status amendment
// in the store. Transport failures never flow back into the pipeline.

pub mod telegram;

use crate::types::TradingSignal;

/// A signal bound for the messaging sink.
#[derive(Debug, Clone)]
pub struct DeliverySignal {
    pub signal: TradingSignal,
    /// Context data was stale when the signal was assessed.
    pub degraded: bool,
}
