//! Restart backoff
//!
//! Bounded exponential delays between backend restarts.

use serde::{Deserialize, Serialize};
use std::time::Duration;

fn default_initial_delay_ms() -> u64 {
    200
}

fn default_max_delay_ms() -> u64 {
    30_000
}

fn default_multiplier() -> f64 {
    2.0
}

/// Configuration for backoff behavior
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackoffConfig {
    /// Delay before the first restart, in milliseconds
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    /// Upper bound for any delay, in milliseconds
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Growth factor per consecutive failure
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            multiplier: default_multiplier(),
        }
    }
}

impl BackoffConfig {
    pub fn new(initial_delay: Duration, max_delay: Duration, multiplier: f64) -> Self {
        Self {
            initial_delay_ms: initial_delay.as_millis() as u64,
            max_delay_ms: max_delay.as_millis() as u64,
            multiplier,
        }
    }

    /// No delay at all between restarts
    pub fn immediate() -> Self {
        Self::new(Duration::ZERO, Duration::ZERO, 1.0)
    }

    pub fn initial_delay(&self) -> Duration {
        Duration::from_millis(self.initial_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }

    /// Delay after the given number of consecutive failures
    ///
    /// Zero failures means no delay; the first failure waits the initial
    /// delay, and each further failure multiplies it, capped at the maximum.
    pub fn delay_for_failures(&self, failures: u32) -> Duration {
        if failures == 0 {
            return Duration::ZERO;
        }
        let exponent = (failures - 1).min(i32::MAX as u32) as i32;
        let base = self.initial_delay().as_secs_f64() * self.multiplier.powi(exponent);
        let capped = base.min(self.max_delay().as_secs_f64());

        if capped.is_finite() && capped > 0.0 {
            Duration::from_secs_f64(capped)
        } else {
            Duration::ZERO
        }
    }
}
