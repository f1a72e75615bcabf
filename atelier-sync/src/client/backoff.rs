//! Exponential reconnection backoff.

use std::time::Duration;

#[derive(Debug, Clone, PartialEq)]
pub struct BackoffConfig {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub factor: f64,
    /// `None` retries forever.
    pub max_attempts: Option<u32>,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            factor: 2.0,
            max_attempts: None,
        }
    }
}

impl BackoffConfig {
    /// Millisecond delays so reconnect tests finish quickly.
    pub fn for_testing() -> Self {
        Self {
            initial_delay: Duration::from_millis(20),
            max_delay: Duration::from_millis(200),
            factor: 2.0,
            max_attempts: None,
        }
    }
}

/// Iterator-like delay schedule, reset after every successful connect.
#[derive(Debug, Clone)]
pub struct Backoff {
    config: BackoffConfig,
    attempt: u32,
}

impl Backoff {
    pub fn new(config: BackoffConfig) -> Self {
        Self { config, attempt: 0 }
    }

    /// Advance to the next attempt. Returns `(attempt_number, delay)`, or
    /// `None` once `max_attempts` is exhausted.
    pub fn next_delay(&mut self) -> Option<(u32, Duration)> {
        if let Some(max) = self.config.max_attempts {
            if self.attempt >= max {
                return None;
            }
        }
        let exponent = self.attempt.min(32) as i32;
        let scaled = self.config.initial_delay.as_secs_f64() * self.config.factor.powi(exponent);
        let max = self.config.max_delay.as_secs_f64();
        // A negative or NaN factor must not reach `from_secs_f64`, which panics
        let secs = if scaled.is_nan() { max } else { scaled.clamp(0.0, max) };
        let delay = Duration::from_secs_f64(secs);
        self.attempt += 1;
        Some((self.attempt, delay))
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}
