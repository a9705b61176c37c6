//! Keyed rate limiter for repetitive error logs.
//!
//! Lease failures, heartbeat failures and bad-task reports can repeat many
//! times per second while the controller is unhealthy; callers gate those
//! log statements through [`RateLimiter::check`] so each key emits at most
//! once per window.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

#[derive(Debug)]
pub struct RateLimiter {
    every: Duration,
    last: Mutex<HashMap<String, Instant>>,
}

impl RateLimiter {
    pub fn new(every: Duration) -> Self {
        Self {
            every,
            last: Mutex::new(HashMap::new()),
        }
    }

    /// Returns `true` when the caller may emit for `key` now.
    ///
    /// The first call for a key always passes; later calls pass only after
    /// the configured window has elapsed since the last pass.
    pub fn check(&self, key: &str) -> bool {
        let now = Instant::now();
        let mut last = self.last.lock().expect("rate limiter lock poisoned");
        match last.get(key) {
            Some(prev) if now.duration_since(*prev) < self.every => false,
            _ => {
                last.insert(key.to_string(), now);
                true
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_emit_passes_then_suppresses() {
        let limiter = RateLimiter::new(Duration::from_secs(60));
        assert!(limiter.check("lease"));
        assert!(!limiter.check("lease"));
        assert!(!limiter.check("lease"));
    }

    #[test]
    fn keys_are_independent() {
        let limiter = RateLimiter::new(Duration::from_secs(60));
        assert!(limiter.check("lease"));
        assert!(limiter.check("result"));
        assert!(!limiter.check("lease"));
    }

    #[test]
    fn passes_again_after_window() {
        let limiter = RateLimiter::new(Duration::from_millis(0));
        assert!(limiter.check("exec"));
        assert!(limiter.check("exec"));
    }
}
