// =============================================================================
// Market Data Module
// =============================================================================
//
// The sole shared mutable state of the hot path:
// - Per-symbol bounded, time-ordered event buffers (liquidations + trades)
// - Per-symbol rolling per-minute volume baselines (24 h mean / stddev)

pub mod baseline;
pub mod event_buffer;

pub use baseline::{BaselineStats, BaselineTracker};
pub use event_buffer::{BufferCounters, EventBufferManager};
