//! Reconnect backoff
//!
//! Delay between reconnection attempts. Starts at a floor, doubles on each
//! consecutive failure up to a ceiling, and drops back to the floor after a
//! successful round-trip.

use std::time::Duration;

/// Exponential reconnect delay owned by one transport instance.
#[derive(Debug, Clone)]
pub struct Backoff {
    min: Duration,
    max: Duration,
    current: Duration,
    /// Number of consecutive failures since the last reset
    failures: u32,
}

impl Backoff {
    /// Create a backoff between `min` and `max` (inclusive).
    pub fn new(min: Duration, max: Duration) -> Self {
        let max = max.max(min);
        Self {
            min,
            max,
            current: min,
            failures: 0,
        }
    }

    /// Delay to wait before the next attempt. Each call counts as one failure.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.failures = self.failures.saturating_add(1);
        self.current = self.current.saturating_mul(2).min(self.max);
        delay
    }

    /// Forget previous failures.
    pub fn reset(&mut self) {
        self.current = self.min;
        self.failures = 0;
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }

    pub fn min(&self) -> Duration {
        self.min
    }

    pub fn max(&self) -> Duration {
        self.max
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_until_ceiling() {
        let mut backoff = Backoff::new(Duration::from_millis(100), Duration::from_millis(1000));

        let delays: Vec<_> = (0..7).map(|_| backoff.next_delay().as_millis()).collect();
        assert_eq!(delays, vec![100, 200, 400, 800, 1000, 1000, 1000]);
        assert_eq!(backoff.failures(), 7);
    }

    #[test]
    fn test_backoff_is_non_decreasing() {
        let mut backoff = Backoff::new(Duration::from_millis(3), Duration::from_millis(500));
        let mut last = Duration::ZERO;
        for _ in 0..20 {
            let delay = backoff.next_delay();
            assert!(delay >= last);
            assert!(delay <= backoff.max());
            last = delay;
        }
    }

    #[test]
    fn test_reset_returns_to_floor() {
        let mut backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(60));
        backoff.next_delay();
        backoff.next_delay();
        backoff.next_delay();

        backoff.reset();
        assert_eq!(backoff.failures(), 0);
        assert_eq!(backoff.next_delay(), Duration::from_secs(1));
    }

    #[test]
    fn test_ceiling_below_floor_is_clamped() {
        let mut backoff = Backoff::new(Duration::from_secs(5), Duration::from_secs(1));
        assert_eq!(backoff.next_delay(), Duration::from_secs(5));
        assert_eq!(backoff.next_delay(), Duration::from_secs(5));
    }
}
