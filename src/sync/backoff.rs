//! Reconnect backoff.

use std::time::Duration;

use rand::Rng;

use crate::config::SyncConfig;

/// Exponential reconnect delay with jitter, bounded by the configured
/// minimum and maximum.
#[derive(Debug, Clone)]
pub struct Backoff {
    min: Duration,
    max: Duration,
    multiplier: u32,
    current: Duration,
    attempts: u32,
}

impl Backoff {
    /// Backoff using the sync configuration bounds.
    pub fn new(config: &SyncConfig) -> Self {
        Self::with_bounds(config.backoff_min, config.backoff_max, config.backoff_multiplier)
    }

    /// Backoff with explicit bounds.
    pub fn with_bounds(min: Duration, max: Duration, multiplier: u32) -> Self {
        let max = max.max(min);
        Self {
            min,
            max,
            multiplier: multiplier.max(1),
            current: min,
            attempts: 0,
        }
    }

    /// Next delay before reconnecting.
    ///
    /// The base doubles (by `multiplier`) per attempt; up to 10% jitter is
    /// added and the result clamped to the bounds.
    pub fn next_delay(&mut self) -> Duration {
        self.next_delay_with(&mut rand::thread_rng())
    }

    /// [`next_delay`](Self::next_delay) with an explicit RNG.
    pub fn next_delay_with(&mut self, rng: &mut impl Rng) -> Duration {
        let base = self.current;
        self.current = base
            .checked_mul(self.multiplier)
            .unwrap_or(self.max)
            .min(self.max);
        self.attempts += 1;

        let jitter = base.mul_f64(rng.gen_range(0.0..0.1));
        (base + jitter).clamp(self.min, self.max)
    }

    /// Connection attempts since the last reset.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Back to the minimum delay after a successful session.
    pub fn reset(&mut self) {
        self.current = self.min;
        self.attempts = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    #[test]
    fn test_backoff_grows_within_bounds() {
        let mut rng = StdRng::seed_from_u64(7);
        let mut backoff =
            Backoff::with_bounds(Duration::from_millis(10), Duration::from_millis(40), 2);
        let delays: Vec<Duration> = (0..5).map(|_| backoff.next_delay_with(&mut rng)).collect();

        assert!(delays[0] >= Duration::from_millis(10) && delays[0] < Duration::from_millis(11));
        assert!(delays[1] >= Duration::from_millis(20) && delays[1] < Duration::from_millis(22));
        for delay in &delays[2..] {
            assert!(*delay >= Duration::from_millis(36) && *delay <= Duration::from_millis(40));
        }
        assert_eq!(backoff.attempts(), 5);
    }

    #[test]
    fn test_reset() {
        let mut backoff = Backoff::with_bounds(Duration::from_millis(5), Duration::from_secs(1), 3);
        backoff.next_delay();
        backoff.next_delay();
        backoff.reset();
        assert_eq!(backoff.attempts(), 0);
        assert!(backoff.next_delay() < Duration::from_millis(6));
    }

    #[test]
    fn test_from_config() {
        let config = SyncConfig::default();
        let mut backoff = Backoff::new(&config);
        let first = backoff.next_delay();
        assert!(first >= config.backoff_min);
        assert!(first <= config.backoff_max);
    }
}
