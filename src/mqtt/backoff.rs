//! Bounded exponential backoff between reconnect attempts.
//!
//! The policy is a pure function of the retry count so it can be reasoned
//! about (and tested) without the event loop that sleeps on it.

use crate::config::BackoffConfig;
use rand::Rng;
use std::time::Duration;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    jitter: bool,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            jitter: false,
        }
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// `min(base * 2^retry_count, max)`
    pub fn delay(&self, retry_count: u32) -> Duration {
        let factor = 1u32.checked_shl(retry_count).unwrap_or(u32::MAX);
        self.base
            .checked_mul(factor)
            .map_or(self.max, |delay| delay.min(self.max))
    }

    /// The delay actually slept on. With jitter enabled the result is drawn
    /// uniformly from `[delay / 2, delay]`.
    pub fn sleep_duration(&self, delay: Duration) -> Duration {
        if !self.jitter || delay.is_zero() {
            return delay;
        }
        let half = delay / 2;
        let spread = delay - half;
        half + spread.mul_f64(rand::thread_rng().gen_range(0.0..=1.0))
    }

    pub fn base(&self) -> Duration {
        self.base
    }
}

impl From<&BackoffConfig> for Backoff {
    fn from(config: &BackoffConfig) -> Self {
        Backoff::new(config.base(), config.max()).with_jitter(config.jitter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> Backoff {
        Backoff::new(Duration::from_secs(1), Duration::from_secs(30))
    }

    #[test]
    fn doubles_from_base() {
        let backoff = policy();
        assert_eq!(backoff.delay(0), Duration::from_secs(1));
        assert_eq!(backoff.delay(1), Duration::from_secs(2));
        assert_eq!(backoff.delay(2), Duration::from_secs(4));
        assert_eq!(backoff.delay(4), Duration::from_secs(16));
    }

    #[test]
    fn monotone_until_cap_then_constant() {
        let backoff = policy();
        let delays: Vec<Duration> = (0..64).map(|n| backoff.delay(n)).collect();
        for pair in delays.windows(2) {
            assert!(pair[1] >= pair[0]);
        }
        assert_eq!(backoff.delay(5), Duration::from_secs(30));
        assert!(delays[5..].iter().all(|d| *d == Duration::from_secs(30)));
    }

    #[test]
    fn huge_retry_counts_do_not_overflow() {
        let backoff = Backoff::new(Duration::from_secs(u64::MAX / 2), Duration::from_secs(60));
        assert_eq!(backoff.delay(u32::MAX), Duration::from_secs(60));
        assert_eq!(backoff.delay(40), Duration::from_secs(60));
    }

    #[test]
    fn jitter_stays_within_half_and_full_delay() {
        let backoff = policy().with_jitter(true);
        let delay = Duration::from_secs(8);
        for _ in 0..200 {
            let slept = backoff.sleep_duration(delay);
            assert!(slept >= Duration::from_secs(4));
            assert!(slept <= delay);
        }
    }

    #[test]
    fn without_jitter_sleep_equals_delay() {
        let backoff = policy();
        assert_eq!(
            backoff.sleep_duration(Duration::from_secs(4)),
            Duration::from_secs(4)
        );
    }
}
