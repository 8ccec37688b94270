use crate::config::PollingConfig;
use std::time::Duration;

/// Poll cadence: a base interval while queries succeed, and a fixed
/// escalation sequence (capped at its last step) while they fail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackoffPolicy {
    base: Duration,
    steps: Vec<Duration>,
}

impl BackoffPolicy {
    pub fn new(base: Duration, steps: Vec<Duration>) -> Self {
        Self { base, steps }
    }

    pub fn from_config(config: &PollingConfig) -> Self {
        Self::new(config.interval(), config.backoff_steps())
    }

    pub fn base(&self) -> Duration {
        self.base
    }

    /// Delay before the next attempt after `consecutive_failures` failed
    /// queries in a row. Zero failures means the base interval.
    pub fn delay(&self, consecutive_failures: u32) -> Duration {
        if consecutive_failures == 0 {
            return self.base;
        }
        let index = usize::try_from(consecutive_failures - 1).unwrap_or(usize::MAX);
        self.steps
            .get(index)
            .or_else(|| self.steps.last())
            .copied()
            .unwrap_or(self.base)
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::from_config(&PollingConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_escalation_sequence_caps_at_last_step() {
        let policy = BackoffPolicy::default();
        let delays: Vec<u64> = (0..9)
            .map(|n| u64::try_from(policy.delay(n).as_millis()).unwrap())
            .collect();
        assert_eq!(
            delays,
            vec![500, 1_000, 2_000, 4_000, 8_000, 16_000, 30_000, 30_000, 30_000]
        );
    }

    #[test]
    fn test_empty_sequence_falls_back_to_base() {
        let policy = BackoffPolicy::new(Duration::from_millis(250), Vec::new());
        assert_eq!(policy.delay(3), Duration::from_millis(250));
    }
}
