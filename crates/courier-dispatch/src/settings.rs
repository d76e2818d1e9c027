use std::time::Duration;

use rand::Rng;

/// Tunables for the dispatch pipeline.
#[derive(Debug, Clone)]
pub struct DispatchSettings {
    /// Recoverable-failure retries per record before FAILED.
    pub max_retries: i32,
    /// First retry delay; doubles per attempt.
    pub retry_base: Duration,
    /// Ceiling for the retry delay.
    pub retry_cap: Duration,
    /// Scheduler reaper cadence.
    pub scheduler_tick: Duration,
    /// Hard cap on the shutdown drain phase.
    pub shutdown_deadline: Duration,
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_base: Duration::from_secs(5),
            retry_cap: Duration::from_secs(60),
            scheduler_tick: Duration::from_secs(30),
            shutdown_deadline: Duration::from_secs(30),
        }
    }
}

impl DispatchSettings {
    /// Exponential backoff before retry `attempt` (1-based): base doubled
    /// per attempt, capped.
    pub fn backoff_raw(&self, attempt: i32) -> Duration {
        let exponent = attempt.max(1) - 1;
        let factor = 2u32.saturating_pow(exponent.min(16) as u32);
        self.retry_base.saturating_mul(factor).min(self.retry_cap)
    }

    /// `backoff_raw` with ±20% jitter so retry storms decorrelate.
    pub fn backoff_for(&self, attempt: i32) -> Duration {
        let raw = self.backoff_raw(attempt);
        let jitter = rand::rng().random_range(0.8..=1.2);
        raw.mul_f64(jitter).min(self.retry_cap)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_from_base_and_caps() {
        let settings = DispatchSettings::default();
        assert_eq!(settings.backoff_raw(1), Duration::from_secs(5));
        assert_eq!(settings.backoff_raw(2), Duration::from_secs(10));
        assert_eq!(settings.backoff_raw(3), Duration::from_secs(20));
        assert_eq!(settings.backoff_raw(5), Duration::from_secs(60));
        assert_eq!(settings.backoff_raw(30), Duration::from_secs(60));
    }

    #[test]
    fn jitter_stays_within_twenty_percent() {
        let settings = DispatchSettings::default();
        for _ in 0..100 {
            let delay = settings.backoff_for(1);
            assert!(delay >= Duration::from_secs(4));
            assert!(delay <= Duration::from_secs(6));
        }
    }
}
