//! Bounded exponential backoff used while waiting for a builder pod.

use std::time::Duration;

use crate::config::BackoffConfig;

/// Multiplier used when the configured one is not a finite value >= 1.
const FALLBACK_MULTIPLIER: f64 = 2.0;

#[derive(Debug, Clone)]
pub struct Backoff {
    current: Duration,
    max_interval: Duration,
    multiplier: f64,
    attempts: u32,
    max_attempts: u32,
}

impl Backoff {
    pub fn new(cfg: &BackoffConfig) -> Self {
        Self {
            current: cfg.initial_interval.min(cfg.max_interval),
            max_interval: cfg.max_interval,
            multiplier: if cfg.multiplier.is_finite() && cfg.multiplier >= 1.0 { cfg.multiplier } else { FALLBACK_MULTIPLIER },
            attempts: 0,
            max_attempts: cfg.max_attempts.max(1),
        }
    }

    /// Whether another attempt is left in the budget.
    pub fn next_exists(&self) -> bool { self.attempts < self.max_attempts }

    pub fn attempts(&self) -> u32 { self.attempts }

    /// Delay that the next call to [`Backoff::next`] will hand out.
    pub fn current(&self) -> Duration { self.current }

    /// Record a failed attempt. Returns the delay to wait before retrying, or
    /// `None` once the attempt budget is spent.
    pub fn next(&mut self) -> Option<Duration> {
        self.attempts = self.attempts.saturating_add(1);
        if !self.next_exists() {
            return None;
        }
        let delay = self.current;
        self.current = Duration::try_from_secs_f64(self.current.as_secs_f64() * self.multiplier)
            .unwrap_or(self.max_interval)
            .min(self.max_interval);
        Some(delay)
    }
}
