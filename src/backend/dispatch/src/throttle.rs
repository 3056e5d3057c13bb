//! Process-wide rate limiting for job claims.
//!
//! One token gate is shared by every worker, bounding total job throughput
//! regardless of pool size. The limiter is an injectable object rather than a
//! module-level singleton so tests can substitute a deterministic or
//! unlimited implementation.

use metrics::counter;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

// ═══════════════════════════════════════════════════════════════════════════════
// Configuration
// ═══════════════════════════════════════════════════════════════════════════════

/// Rate limiting configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Claims allowed per window
    #[serde(default = "default_max_claims")]
    pub max_claims: u64,
    /// Window duration
    #[serde(with = "humantime_serde", default = "default_window")]
    pub window: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_claims: default_max_claims(),
            window: default_window(),
        }
    }
}

fn default_max_claims() -> u64 {
    100
}

fn default_window() -> Duration {
    Duration::from_millis(1000)
}

// ═══════════════════════════════════════════════════════════════════════════════
// Limiter Contract
// ═══════════════════════════════════════════════════════════════════════════════

/// Shared gate bounding job claims across all workers.
pub trait RateLimiter: Send + Sync {
    /// Try to claim a token. Returns false when the window is exhausted.
    fn try_claim(&self) -> bool;

    /// How long until a token could become available.
    fn time_until_available(&self) -> Duration;
}

// ═══════════════════════════════════════════════════════════════════════════════
// Fixed Window Limiter
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug)]
struct Window {
    started_at: Instant,
    claims: u64,
}

/// Fixed-window limiter: at most `max_claims` tokens per window.
///
/// All state sits behind one mutex; each claim is a single atomic
/// check-and-increment.
pub struct FixedWindowLimiter {
    config: RateLimitConfig,
    window: Mutex<Window>,
}

impl FixedWindowLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            window: Mutex::new(Window {
                started_at: Instant::now(),
                claims: 0,
            }),
        }
    }

    fn rotate_if_elapsed(&self, window: &mut Window) {
        if window.started_at.elapsed() >= self.config.window {
            window.started_at = Instant::now();
            window.claims = 0;
        }
    }
}

impl RateLimiter for FixedWindowLimiter {
    fn try_claim(&self) -> bool {
        let mut window = self.window.lock();
        self.rotate_if_elapsed(&mut window);

        if window.claims < self.config.max_claims {
            window.claims += 1;
            true
        } else {
            counter!("dispatch_rate_limit_rejections_total").increment(1);
            false
        }
    }

    fn time_until_available(&self) -> Duration {
        let mut window = self.window.lock();
        self.rotate_if_elapsed(&mut window);

        if window.claims < self.config.max_claims {
            Duration::ZERO
        } else {
            self.config
                .window
                .saturating_sub(window.started_at.elapsed())
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Unlimited Limiter
// ═══════════════════════════════════════════════════════════════════════════════

/// A limiter that never rejects; for tests and development.
#[derive(Debug, Default)]
pub struct Unlimited;

impl RateLimiter for Unlimited {
    fn try_claim(&self) -> bool {
        true
    }

    fn time_until_available(&self) -> Duration {
        Duration::ZERO
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════
