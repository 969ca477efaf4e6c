//! Backoff between save attempts.
//!
//! Every failed attempt doubles the pause up to a cap. The pause is always
//! clipped to what remains of the save deadline so the last attempt still
//! gets a chance to run.

use std::time::{Duration, Instant};

use orch_core::config::StoreConfig;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub timeout: Duration,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &StoreConfig) -> Self {
        Self {
            timeout: config.save_timeout(),
            initial_backoff: Duration::from_millis(config.retry_initial_backoff_ms),
            max_backoff: Duration::from_millis(config.retry_max_backoff_ms),
        }
    }

    /// Start tracking one save call.
    pub fn start(&self) -> Backoff {
        let now = Instant::now();
        Backoff {
            deadline: now + self.timeout,
            started: now,
            current: self.initial_backoff,
            max: self.max_backoff.max(self.initial_backoff),
            attempts: 0,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&StoreConfig::default())
    }
}

#[derive(Debug)]
pub struct Backoff {
    deadline: Instant,
    started: Instant,
    current: Duration,
    max: Duration,
    attempts: u32,
}

impl Backoff {
    /// Count an attempt. Returns false once the deadline has passed.
    pub fn begin_attempt(&mut self) -> bool {
        if self.attempts > 0 && Instant::now() >= self.deadline {
            return false;
        }
        self.attempts += 1;
        true
    }

    /// Pause before the next attempt. `None` when the deadline has passed.
    pub fn next_delay(&mut self) -> Option<Duration> {
        let remaining = self.deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return None;
        }
        let delay = self.current.min(remaining);
        self.current = (self.current * 2).min(self.max);
        Some(delay)
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }
}
