//! Reconnection delay policy.

use std::time::Duration;

/// How the delay grows between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackoffStrategy {
    /// `base × attempt`.
    Linear,
    /// `base × 2^(attempt - 1)`, capped.
    Exponential { cap: Duration },
}

/// Bounded retry schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    /// Delay unit.
    pub base: Duration,
    /// Attempts before giving up.
    pub max_attempts: u32,
    /// Growth strategy.
    pub strategy: BackoffStrategy,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(5),
            max_attempts: 5,
            strategy: BackoffStrategy::Linear,
        }
    }
}

impl BackoffPolicy {
    /// Exponential growth from `base`, never above `cap`.
    #[must_use]
    pub fn exponential(base: Duration, cap: Duration, max_attempts: u32) -> Self {
        Self {
            base,
            max_attempts,
            strategy: BackoffStrategy::Exponential { cap },
        }
    }

    /// Delay before the 1-based `attempt`, or `None` once attempts are
    /// exhausted.
    #[must_use]
    pub fn delay(&self, attempt: u32) -> Option<Duration> {
        if attempt == 0 || attempt > self.max_attempts {
            return None;
        }

        let delay = match self.strategy {
            BackoffStrategy::Linear => self.base.saturating_mul(attempt),
            BackoffStrategy::Exponential { cap } => {
                let shift = (attempt - 1).min(20);
                self.base.saturating_mul(1u32 << shift).min(cap)
            }
        };
        Some(delay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_linear_schedule() {
        let policy = BackoffPolicy::default();
        let delays: Vec<u64> = (1..=5)
            .map(|n| policy.delay(n).unwrap().as_secs())
            .collect();
        assert_eq!(delays, vec![5, 10, 15, 20, 25]);
        assert_eq!(policy.delay(6), None);
        assert_eq!(policy.delay(0), None);
    }

    #[test]
    fn test_exponential_schedule_is_capped() {
        let policy = BackoffPolicy::exponential(Duration::from_secs(1), Duration::from_secs(10), 8);
        let delays: Vec<u64> = (1..=6)
            .map(|n| policy.delay(n).unwrap().as_secs())
            .collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 10, 10]);
    }
}
