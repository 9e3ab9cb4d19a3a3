// =============================================================================
// Ingestion Module
// =============================================================================
//
// The only place vendor naming exists. The feed task owns the WebSocket
// connection and hands canonical records to the pipeline over a channel;
// the normaliser owns the field-name and numeric-format rewrite.

pub mod feed;
pub mod normalizer;

use crate::types::{Liquidation, Trade};

/// Canonical event handed from the feed task to the pipeline.
#[derive(Debug, Clone)]
pub enum FeedEvent {
    Liquidation(Liquidation),
    Trade(Trade),
}
