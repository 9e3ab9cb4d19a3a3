// =============================================================================
// Mutation Rate Limiter — per-remote-address sliding window
// =============================================================================
//
// Gates the monitored-symbol mutation endpoints. Each remote address gets a
// fixed window of requests per minute; excess requests get 429 with a
// Retry-After hint. Stale entries are swept opportunistically on check.
// =============================================================================

use std::collections::HashMap;
use std::net::IpAddr;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// One window per minute.
const WINDOW: Duration = Duration::from_secs(60);

struct WindowEntry {
    count: u32,
    window_start: Instant,
}

/// Per-IP mutation limiter shared by the router.
pub struct MutationLimiter {
    state: Mutex<HashMap<IpAddr, WindowEntry>>,
}

/// Result of a limiter check.
pub enum LimitCheck {
    Allowed,
    /// Seconds until the window resets.
    Exceeded { retry_after_secs: u64 },
}

impl MutationLimiter {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(HashMap::new()),
        }
    }

    /// Count one request from `ip` against a `max_per_min` budget.
    pub fn check(&self, ip: IpAddr, max_per_min: u32) -> LimitCheck {
        let mut state = self.state.lock();
        let now = Instant::now();

        // Opportunistic sweep of long-dead windows.
        if state.len() > 1024 {
            state.retain(|_, e| now.duration_since(e.window_start) < WINDOW * 2);
        }

        let entry = state.entry(ip).or_insert(WindowEntry {
            count: 0,
            window_start: now,
        });

        if now.duration_since(entry.window_start) >= WINDOW {
            entry.count = 0;
            entry.window_start = now;
        }

        entry.count += 1;
        if entry.count > max_per_min {
            let reset_at = entry.window_start + WINDOW;
            LimitCheck::Exceeded {
                retry_after_secs: reset_at.saturating_duration_since(now).as_secs(),
            }
        } else {
            LimitCheck::Allowed
        }
    }
}

impl Default for MutationLimiter {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Tests
// =============================================================================
