//! Reconnect policy
//!
//! Linear backoff: the n-th consecutive failure waits `base_delay * n`, and
//! the policy gives up once `n` exceeds `max_attempts`.

use std::time::Duration;

use crate::defaults;

/// What to do after a failed or lost connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectDecision {
    /// Open a new channel after the given delay
    Retry(Duration),
    /// Stop reconnecting
    GiveUp,
}

/// Pure mapping from attempt count to reconnect decision
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// Delay unit multiplied by the attempt number
    pub base_delay: Duration,
    /// Last attempt number that is still retried
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(defaults::RECONNECT_BASE_DELAY_MS),
            max_attempts: defaults::RECONNECT_MAX_ATTEMPTS,
        }
    }
}

impl ReconnectPolicy {
    pub fn new(base_delay: Duration, max_attempts: u32) -> Self {
        Self {
            base_delay,
            max_attempts,
        }
    }

    /// Decide for the given 1-based count of consecutive failures
    pub fn decide(&self, attempt: u32) -> ReconnectDecision {
        if attempt > self.max_attempts {
            return ReconnectDecision::GiveUp;
        }
        ReconnectDecision::Retry(self.base_delay.saturating_mul(attempt))
    }

    /// Longest single wait the policy can produce
    pub fn max_delay(&self) -> Duration {
        self.base_delay.saturating_mul(self.max_attempts)
    }

    /// Total time spent waiting before the policy gives up
    pub fn worst_case_total(&self) -> Duration {
        (1..=self.max_attempts)
            .map(|attempt| self.base_delay.saturating_mul(attempt))
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_backoff_table() {
        let policy = ReconnectPolicy::default();
        let table: Vec<ReconnectDecision> = (1..=6).map(|a| policy.decide(a)).collect();

        assert_eq!(
            table,
            vec![
                ReconnectDecision::Retry(Duration::from_millis(3000)),
                ReconnectDecision::Retry(Duration::from_millis(6000)),
                ReconnectDecision::Retry(Duration::from_millis(9000)),
                ReconnectDecision::Retry(Duration::from_millis(12000)),
                ReconnectDecision::Retry(Duration::from_millis(15000)),
                ReconnectDecision::GiveUp,
            ]
        );
    }

    #[test]
    fn test_default_bounds() {
        let policy = ReconnectPolicy::default();
        assert_eq!(policy.max_delay(), Duration::from_secs(15));
        assert_eq!(policy.worst_case_total(), Duration::from_secs(45));
    }

    #[test]
    fn test_gives_up_well_past_limit() {
        let policy = ReconnectPolicy::new(Duration::from_millis(100), 2);
        assert_eq!(policy.decide(3), ReconnectDecision::GiveUp);
        assert_eq!(policy.decide(u32::MAX), ReconnectDecision::GiveUp);
    }

    #[test]
    fn test_zero_attempts_never_retries() {
        let policy = ReconnectPolicy::new(Duration::from_secs(1), 0);
        assert_eq!(policy.decide(1), ReconnectDecision::GiveUp);
        assert_eq!(policy.worst_case_total(), Duration::ZERO);
    }
}
