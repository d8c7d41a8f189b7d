//! Reconnect pacing: exponential backoff with jitter.

use std::time::Duration;

/// Configuration for reconnection pacing.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Delay before the first retry.
    pub initial_backoff: Duration,

    /// Ceiling for the delay between retries.
    pub max_backoff: Duration,

    /// Backoff multiplier.
    pub backoff_multiplier: f64,

    /// Jitter as a fraction of the computed delay (0.3 = plus or minus 30%).
    pub jitter_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(10),
            backoff_multiplier: 2.0,
            jitter_factor: 0.3,
        }
    }
}

/// Backoff calculator. Jitter keeps a fleet of clients from reconnecting in
/// lockstep after a shared outage.
#[derive(Debug)]
pub struct Backoff {
    policy: RetryPolicy,
    attempt: u32,
    rng_state: u64,
}

impl Backoff {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            attempt: 0,
            rng_state: std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .map(|d| d.as_nanos() as u64)
                .unwrap_or(0x9e3779b97f4a7c15),
        }
    }

    /// xorshift64; cheap and good enough for jitter.
    #[inline]
    fn next_random(&mut self) -> f64 {
        self.rng_state ^= self.rng_state << 13;
        self.rng_state ^= self.rng_state >> 7;
        self.rng_state ^= self.rng_state << 17;
        (self.rng_state as f64) / (u64::MAX as f64)
    }

    /// Compute the next delay and advance the attempt counter.
    pub fn next_delay(&mut self) -> Duration {
        let base = self.policy.initial_backoff.as_millis() as f64
            * self.policy.backoff_multiplier.powi(self.attempt as i32);
        let capped = base.min(self.policy.max_backoff.as_millis() as f64);

        let jitter_range = capped * self.policy.jitter_factor;
        let jitter = (self.next_random() * 2.0 - 1.0) * jitter_range;
        let final_ms = (capped + jitter).max(1.0);

        self.attempt = self.attempt.saturating_add(1);
        Duration::from_millis(final_ms as u64)
    }

    /// Reset to the base delay. Called on every successful connect.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    /// Number of delays handed out since the last reset.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(initial_ms: u64, max_ms: u64) -> RetryPolicy {
        RetryPolicy {
            initial_backoff: Duration::from_millis(initial_ms),
            max_backoff: Duration::from_millis(max_ms),
            backoff_multiplier: 2.0,
            jitter_factor: 0.3,
        }
    }

    #[test]
    fn grows_within_jitter_bounds() {
        let mut backoff = Backoff::new(policy(100, 30_000));

        let d1 = backoff.next_delay().as_millis();
        assert!((70..=130).contains(&d1), "first delay {d1}ms");

        let d2 = backoff.next_delay().as_millis();
        assert!((140..=260).contains(&d2), "second delay {d2}ms");
    }

    #[test]
    fn caps_at_max_plus_jitter() {
        let mut backoff = Backoff::new(policy(100, 5_000));
        for _ in 0..20 {
            assert!(backoff.next_delay().as_millis() <= 6_500);
        }
    }

    #[test]
    fn reset_returns_to_base() {
        let mut backoff = Backoff::new(policy(100, 30_000));
        for _ in 0..5 {
            backoff.next_delay();
        }
        backoff.reset();
        assert_eq!(backoff.attempt(), 0);
        let d = backoff.next_delay().as_millis();
        assert!((70..=130).contains(&d), "post-reset delay {d}ms");
    }
}
