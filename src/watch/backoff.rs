//! Exponential reconnect backoff with additive jitter.
//!
//! Each watch session owns its own `Backoff`; nothing here is shared between
//! sessions. The attempt counter only goes back to zero through `reset`, which
//! the session calls once a watch has been established.

use crate::config::BackoffConfig;
use rand::Rng;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Backoff {
    attempt: u32,
    base: Duration,
    cap: Duration,
    jitter: f64,
}

impl Backoff {
    /// `jitter` is the fraction of the computed delay that may be added on top of it.
    #[must_use]
    pub fn new(base: Duration, cap: Duration, jitter: f64) -> Self {
        Self {
            attempt: 0,
            base,
            cap,
            jitter: jitter.clamp(0.0, 1.0),
        }
    }

    #[must_use]
    pub fn from_config(config: &BackoffConfig) -> Self {
        Self::new(config.initial(), config.max(), config.jitter)
    }

    /// Delay to wait before the next reconnect; advances the attempt counter.
    pub fn next_delay(&mut self) -> Duration {
        let delay = apply_jitter(self.undithered(self.attempt), self.jitter).min(self.cap);
        self.attempt = self.attempt.saturating_add(1);
        delay
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    #[must_use]
    pub const fn attempt(&self) -> u32 {
        self.attempt
    }

    /// `min(base * 2^attempt, cap)` without jitter
    fn undithered(&self, attempt: u32) -> Duration {
        let factor = 2u32.checked_pow(attempt).unwrap_or(u32::MAX);
        self.base.saturating_mul(factor).min(self.cap)
    }
}

/// Adds up to `jitter_factor` of `duration` on top of it. Never shortens the delay.
fn apply_jitter(duration: Duration, jitter_factor: f64) -> Duration {
    if jitter_factor <= 0.0 {
        return duration;
    }
    let extra = rand::rng().random_range(0.0..=jitter_factor);
    duration.mul_f64(1.0 + extra)
}
