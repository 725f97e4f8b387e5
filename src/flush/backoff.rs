//! Exponential backoff over consecutive delivery failures.

use std::time::Duration;

/// Retry-interval policy with tunable base and cap.
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    /// Interval used while deliveries succeed (or nothing is queued).
    pub base: Duration,
    /// Ceiling for the grown interval.
    pub max: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(30),
            max: Duration::from_secs(300),
        }
    }
}

impl BackoffPolicy {
    /// Interval after `consecutive_failures` transient failures:
    /// `base * 2^max(0, n - 1)`, capped.
    pub fn interval_for(&self, consecutive_failures: u32) -> Duration {
        if consecutive_failures <= 1 {
            return self.base.min(self.max);
        }

        // Cap the exponent so the multiplication cannot overflow long before
        // the configured ceiling kicks in.
        let exponent = (consecutive_failures - 1).min(16);
        let grown = self.base.saturating_mul(1u32 << exponent);
        grown.min(self.max)
    }
}

/// Failure counter driving the policy. Reset by any success.
#[derive(Debug, Default)]
pub struct BackoffState {
    consecutive_failures: u32,
}

impl BackoffState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_failure(&mut self) {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
    }

    pub fn record_success(&mut self) {
        self.consecutive_failures = 0;
    }

    pub fn failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn next_interval(&self, policy: &BackoffPolicy) -> Duration {
        policy.interval_for(self.consecutive_failures)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interval_ladder_doubles_up_to_cap() {
        let policy = BackoffPolicy {
            base: Duration::from_secs(30),
            max: Duration::from_secs(300),
        };

        // 30s, 60s, 120s, 240s, then capped at 300s.
        assert_eq!(policy.interval_for(1), Duration::from_secs(30));
        assert_eq!(policy.interval_for(2), Duration::from_secs(60));
        assert_eq!(policy.interval_for(3), Duration::from_secs(120));
        assert_eq!(policy.interval_for(4), Duration::from_secs(240));
        assert_eq!(policy.interval_for(5), Duration::from_secs(300));
        assert_eq!(policy.interval_for(12), Duration::from_secs(300));
    }

    #[test]
    fn zero_failures_uses_base_interval() {
        let policy = BackoffPolicy::default();
        assert_eq!(policy.interval_for(0), policy.base);
    }

    #[test]
    fn success_resets_the_counter() {
        let policy = BackoffPolicy::default();
        let mut state = BackoffState::new();

        state.record_failure();
        state.record_failure();
        state.record_failure();
        assert_eq!(state.next_interval(&policy), Duration::from_secs(120));

        state.record_success();
        assert_eq!(state.failures(), 0);
        assert_eq!(state.next_interval(&policy), policy.base);
    }

    #[test]
    fn intervals_never_decrease_under_repeated_failure() {
        let policy = BackoffPolicy::default();
        let mut state = BackoffState::new();
        let mut previous = Duration::ZERO;

        for _ in 0..20 {
            state.record_failure();
            let interval = state.next_interval(&policy);
            assert!(interval >= previous);
            assert!(interval <= policy.max);
            previous = interval;
        }
    }

    #[test]
    fn huge_failure_counts_do_not_overflow() {
        let policy = BackoffPolicy::default();
        assert_eq!(policy.interval_for(u32::MAX), policy.max);
    }
}
