//! Exponential backoff for reconnection

use std::time::Duration;

use sm_core::config::BackoffConfig;

/// Exponential backoff with jitter for reconnection attempts
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    /// Delay used after a reset
    initial: Duration,
    /// Current delay
    current: Duration,
    /// Maximum delay
    max: Duration,
    /// Multiplier
    multiplier: f64,
    /// Jitter factor (0.0 to 1.0)
    jitter: f64,
    /// Consecutive delays handed out since the last reset
    attempts: u32,
}

impl ExponentialBackoff {
    /// Create a new backoff from configuration
    pub fn from_config(config: &BackoffConfig) -> Self {
        Self::new(config.initial, config.max, config.multiplier, config.jitter)
    }

    /// Create a new backoff with custom parameters
    pub fn new(initial: Duration, max: Duration, multiplier: f64, jitter: f64) -> Self {
        Self {
            initial,
            current: initial.min(max),
            max,
            multiplier: multiplier.max(1.0),
            jitter: jitter.clamp(0.0, 1.0),
            attempts: 0,
        }
    }

    /// Get the next delay and advance the backoff
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.attempts = self.attempts.saturating_add(1);

        // Calculate next delay with multiplier
        let next = Duration::from_secs_f64(self.current.as_secs_f64() * self.multiplier);
        self.current = std::cmp::min(next, self.max);

        // Add jitter, never past the ceiling
        let jitter_amount = delay.as_secs_f64() * self.jitter * rand::random::<f64>();
        std::cmp::min(delay + Duration::from_secs_f64(jitter_amount), self.max)
    }

    /// Reset the backoff to the initial delay
    pub fn reset(&mut self) {
        self.current = self.initial.min(self.max);
        self.attempts = 0;
    }

    /// Delays handed out since the last reset
    pub fn attempts(&self) -> u32 {
        self.attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_increases() {
        let mut backoff = ExponentialBackoff::new(
            Duration::from_secs(1),
            Duration::from_secs(60),
            2.0,
            0.0, // No jitter for deterministic test
        );

        let d1 = backoff.next_delay();
        let d2 = backoff.next_delay();
        let d3 = backoff.next_delay();

        assert_eq!(d1, Duration::from_secs(1));
        assert_eq!(d2, Duration::from_secs(2));
        assert_eq!(d3, Duration::from_secs(4));
        assert_eq!(backoff.attempts(), 3);
    }

    #[test]
    fn test_backoff_max() {
        let mut backoff =
            ExponentialBackoff::new(Duration::from_secs(1), Duration::from_secs(5), 2.0, 0.0);

        let delays: Vec<Duration> = (0..6).map(|_| backoff.next_delay()).collect();
        assert_eq!(
            delays,
            [1, 2, 4, 5, 5, 5].map(Duration::from_secs).to_vec()
        );
    }

    #[test]
    fn test_backoff_non_decreasing_and_bounded() {
        let config = BackoffConfig::default();
        let mut backoff = ExponentialBackoff::from_config(&config);

        let mut previous = Duration::ZERO;
        for _ in 0..20 {
            let delay = backoff.next_delay();
            assert!(delay >= previous);
            assert!(delay <= config.max);
            previous = delay;
        }
    }

    #[test]
    fn test_reset_returns_to_initial() {
        let mut backoff =
            ExponentialBackoff::new(Duration::from_millis(100), Duration::from_secs(5), 2.0, 0.0);
        backoff.next_delay();
        backoff.next_delay();

        backoff.reset();
        assert_eq!(backoff.attempts(), 0);
        assert_eq!(backoff.next_delay(), Duration::from_millis(100));
    }

    #[test]
    fn test_jitter_stays_under_cap() {
        let mut backoff =
            ExponentialBackoff::new(Duration::from_secs(4), Duration::from_secs(5), 2.0, 1.0);
        for _ in 0..50 {
            assert!(backoff.next_delay() <= Duration::from_secs(5));
        }
    }
}
