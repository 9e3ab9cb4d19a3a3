// =============================================================================
// API Module — dashboard REST + WebSocket surface
// =============================================================================

pub mod auth;
pub mod rate_limit;
pub mod rest;
pub mod ws;
