//! Delay before a crashed execution context is replaced
//!
//! The n-th replacement in a run waits `initial_delay` (fixed),
//! `initial_delay * n` (linear) or `initial_delay * 2^(n-1)` (exponential),
//! never more than `max_delay`. Jitter spreads the delay by up to 20% either
//! way so slots that crashed together do not respawn in lockstep.

use rand::Rng;
use std::time::Duration;
use trellis_config::{BackoffKind, RestartBackoffConfig};

#[derive(Debug, Clone)]
pub struct BackoffCalculator {
    kind: BackoffKind,
    initial_delay: Duration,
    max_delay: Duration,
    jitter: bool,
}

impl BackoffCalculator {
    pub fn new(kind: BackoffKind, initial_delay: Duration, max_delay: Duration) -> Self {
        Self {
            kind,
            initial_delay,
            max_delay,
            jitter: false,
        }
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn from_config(config: &RestartBackoffConfig) -> Self {
        Self::new(config.strategy, config.initial_delay, config.max_delay).with_jitter(config.jitter)
    }

    /// Delay before replacement number `restart` (1-based)
    pub fn calculate_delay(&self, restart: u32) -> Duration {
        let restart = restart.max(1);
        let delay = match self.kind {
            BackoffKind::Fixed => self.initial_delay,
            BackoffKind::Linear => self.initial_delay.saturating_mul(restart),
            BackoffKind::Exponential => {
                // Shifts past 31 saturate
                let factor = 1u32.checked_shl(restart - 1).unwrap_or(u32::MAX);
                self.initial_delay.saturating_mul(factor)
            }
        }
        .min(self.max_delay);

        if self.jitter {
            delay.mul_f64(rand::thread_rng().gen_range(0.8..1.2))
        } else {
            delay
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exponential_doubles_up_to_the_cap() {
        let backoff = BackoffCalculator::new(
            BackoffKind::Exponential,
            Duration::from_millis(100),
            Duration::from_millis(500),
        );
        let delays: Vec<u128> = (1..=4).map(|n| backoff.calculate_delay(n).as_millis()).collect();
        assert_eq!(delays, vec![100, 200, 400, 500]);
        assert_eq!(backoff.calculate_delay(60), Duration::from_millis(500));
    }

    #[test]
    fn test_linear_and_fixed() {
        let linear = BackoffCalculator::new(BackoffKind::Linear, Duration::from_millis(50), Duration::from_secs(1));
        assert_eq!(linear.calculate_delay(3), Duration::from_millis(150));

        let fixed = BackoffCalculator::new(BackoffKind::Fixed, Duration::from_millis(50), Duration::from_secs(1));
        assert_eq!(fixed.calculate_delay(7), Duration::from_millis(50));
    }

    #[test]
    fn test_jitter_stays_within_twenty_percent() {
        let backoff = BackoffCalculator::new(BackoffKind::Fixed, Duration::from_secs(1), Duration::from_secs(10))
            .with_jitter(true);
        for _ in 0..50 {
            let delay = backoff.calculate_delay(1);
            assert!(delay >= Duration::from_millis(800));
            assert!(delay <= Duration::from_millis(1200));
        }
    }

    #[test]
    fn test_default_config_is_exponential() {
        let backoff = BackoffCalculator::from_config(&RestartBackoffConfig::default());
        assert_eq!(backoff.calculate_delay(2), Duration::from_millis(200));
    }
}
