//! One backoff policy for every retry site.
//!
//! Fetch-level retries inside a cycle, embedding provider retries, and
//! task-level requeues all consult a [`RetryPolicy`] instead of carrying
//! their own loops and constants.

use std::time::Duration;

use crate::error::ErrorClass;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Retry { after: Duration },
    GiveUp,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            max_delay,
        }
    }

    /// Delay before the attempt following `attempt` (1-based): `base * 2^(attempt-1)`, capped.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(30);
        let factor = 1u32 << exp;
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Decide what happens after `attempt` failed with an error of `class`.
    pub fn decide(&self, class: ErrorClass, attempt: u32) -> RetryDecision {
        if !class.is_retryable() || attempt >= self.max_attempts {
            return RetryDecision::GiveUp;
        }
        RetryDecision::Retry {
            after: self.delay_for(attempt),
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(5, Duration::from_secs(30), Duration::from_secs(1800))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delays_double_until_capped() {
        let p = RetryPolicy::new(10, Duration::from_secs(30), Duration::from_secs(100));
        assert_eq!(p.delay_for(1), Duration::from_secs(30));
        assert_eq!(p.delay_for(2), Duration::from_secs(60));
        assert_eq!(p.delay_for(3), Duration::from_secs(100));
        assert_eq!(p.delay_for(40), Duration::from_secs(100));
    }

    #[test]
    fn gives_up_after_max_attempts() {
        let p = RetryPolicy::new(3, Duration::from_millis(1), Duration::from_secs(1));
        assert!(matches!(
            p.decide(ErrorClass::UpstreamTransient, 2),
            RetryDecision::Retry { .. }
        ));
        assert_eq!(p.decide(ErrorClass::UpstreamTransient, 3), RetryDecision::GiveUp);
    }

    #[test]
    fn permanent_classes_never_retry() {
        let p = RetryPolicy::default();
        assert_eq!(p.decide(ErrorClass::UpstreamPermanent, 1), RetryDecision::GiveUp);
        assert_eq!(p.decide(ErrorClass::CacheCorruption, 1), RetryDecision::GiveUp);
        assert!(matches!(
            p.decide(ErrorClass::TaskLost, 1),
            RetryDecision::Retry { .. }
        ));
    }
}
