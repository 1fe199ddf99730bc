//! Bounded exponential backoff schedule for transient provider errors.

use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffPolicy {
    /// Total attempts, including the first call.
    pub attempts: u32,
    pub base_delay_ms: u64,
    pub factor: u32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            base_delay_ms: 1_000,
            factor: 2,
        }
    }
}

impl BackoffPolicy {
    /// Delay to wait after failed attempt `attempt` (1-based), or `None` when
    /// no attempts remain.
    pub fn delay_after(&self, attempt: u32) -> Option<Duration> {
        if attempt == 0 || attempt >= self.attempts {
            return None;
        }
        let multiplier = u64::from(self.factor).saturating_pow(attempt - 1);
        Some(Duration::from_millis(
            self.base_delay_ms.saturating_mul(multiplier),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_schedule_is_one_then_two_seconds() {
        let policy = BackoffPolicy::default();
        assert_eq!(policy.delay_after(1), Some(Duration::from_secs(1)));
        assert_eq!(policy.delay_after(2), Some(Duration::from_secs(2)));
        assert_eq!(policy.delay_after(3), None);
    }

    #[test]
    fn single_attempt_never_retries() {
        let policy = BackoffPolicy {
            attempts: 1,
            ..BackoffPolicy::default()
        };
        assert_eq!(policy.delay_after(1), None);
    }

    #[test]
    fn large_exponents_saturate() {
        let policy = BackoffPolicy {
            attempts: u32::MAX,
            base_delay_ms: u64::MAX / 2,
            factor: 10,
        };
        assert_eq!(
            policy.delay_after(40),
            Some(Duration::from_millis(u64::MAX))
        );
    }
}
