//! Adaptive pacing: tune the inter-chunk delay from observed link health.
//!
//! The controller nudges the delay up when link-layer acknowledgements
//! start failing and trims it when the link runs clean. It never leaves
//! the configured window, and it holds judgement until enough attempts
//! have been observed to mean something.

use std::time::Duration;

/// Raise the delay when the attempt success rate falls below this.
pub const SUCCESS_LOW: f64 = 0.90;

/// Lower the delay when the attempt success rate exceeds this.
pub const SUCCESS_HIGH: f64 = 0.98;

/// Multiplier applied on a struggling link.
pub const INCREASE_FACTOR: f64 = 1.20;

/// Multiplier applied on a clean link.
pub const DECREASE_FACTOR: f64 = 0.95;

/// Minimum observed attempts before the controller reacts.
pub const MIN_SAMPLES: u64 = 5;

#[derive(Debug, Clone)]
pub struct AdaptiveDelay {
    current: f64,
    min: f64,
    max: f64,
    enabled: bool,
}

impl AdaptiveDelay {
    pub fn new(initial_secs: f64, min_secs: f64, max_secs: f64, enabled: bool) -> Self {
        Self {
            current: initial_secs.clamp(min_secs, max_secs),
            min: min_secs,
            max: max_secs,
            enabled,
        }
    }

    /// A controller pinned to a fixed delay (fast mode / opt-out).
    pub fn fixed(secs: f64) -> Self {
        Self {
            current: secs,
            min: secs,
            max: secs,
            enabled: false,
        }
    }

    /// Feed the running attempt counters. Returns true when the delay
    /// moved.
    pub fn observe(&mut self, successful: u64, failed: u64) -> bool {
        if !self.enabled || successful + failed < MIN_SAMPLES {
            return false;
        }
        let rate = successful as f64 / (successful + failed) as f64;
        let old = self.current;
        if rate < SUCCESS_LOW {
            self.current = (self.current * INCREASE_FACTOR).min(self.max);
        } else if rate > SUCCESS_HIGH {
            self.current = (self.current * DECREASE_FACTOR).max(self.min);
        }
        if (self.current - old).abs() > f64::EPSILON {
            tracing::debug!(
                success_rate = format!("{:.1}%", rate * 100.0),
                old_delay = format!("{old:.2}s"),
                new_delay = format!("{:.2}s", self.current),
                "adaptive delay adjusted"
            );
            true
        } else {
            false
        }
    }

    pub fn delay(&self) -> Duration {
        Duration::from_secs_f64(self.current)
    }

    pub fn secs(&self) -> f64 {
        self.current
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
