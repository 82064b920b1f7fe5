//! Exponential backoff with optional jitter.

use std::time::Duration;

use rand::Rng;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub base: Duration,
    pub max: Duration,
    /// Add up to a quarter of the capped delay, uniformly at random, so
    /// delays at the cap may reach `max + max / 4`.
    pub jitter: bool,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            jitter: false,
        }
    }

    pub fn with_jitter(mut self) -> Self {
        self.jitter = true;
        self
    }

    /// Delay before retry number `attempt` (0 = first retry).
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.min(31)).unwrap_or(u32::MAX);
        let delay = self.base.saturating_mul(factor).min(self.max);
        if !self.jitter || delay.is_zero() {
            return delay;
        }
        let spread = (delay.as_millis() as u64) / 4;
        let extra = rand::thread_rng().gen_range(0..=spread);
        delay + Duration::from_millis(extra)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn doubles_until_capped() {
        let b = Backoff::new(Duration::from_millis(100), Duration::from_millis(1000));
        assert_eq!(b.delay(0), Duration::from_millis(100));
        assert_eq!(b.delay(1), Duration::from_millis(200));
        assert_eq!(b.delay(3), Duration::from_millis(800));
        assert_eq!(b.delay(4), Duration::from_millis(1000));
        assert_eq!(b.delay(40), Duration::from_millis(1000));
    }

    #[test]
    fn jitter_stays_within_a_quarter() {
        let b = Backoff::new(Duration::from_millis(400), Duration::from_secs(60)).with_jitter();
        for _ in 0..100 {
            let d = b.delay(0);
            assert!(d >= Duration::from_millis(400));
            assert!(d <= Duration::from_millis(500));
        }
    }

    #[test]
    fn jitter_still_spreads_delays_at_the_cap() {
        let b = Backoff::new(Duration::from_millis(100), Duration::from_millis(800)).with_jitter();
        let delays: std::collections::HashSet<_> = (0..200).map(|_| b.delay(20)).collect();
        assert!(delays.len() > 1);
        assert!(delays
            .iter()
            .all(|d| *d >= Duration::from_millis(800) && *d <= Duration::from_millis(1000)));
    }
}
