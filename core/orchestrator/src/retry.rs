//! Retry policy with exponential backoff for transient failures.

use std::time::Duration;

use tradesync_common::FailureClass;

/// Decides whether and when a failed attempt is retried.
///
/// `next_delay` and `should_retry` are pure; scheduling the delayed
/// re-enqueue is the worker's job.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum attempts in total, including the first.
    pub max_attempts: u32,
    /// Initial delay before the first retry.
    pub initial_delay: Duration,
    /// Maximum delay (cap for exponential growth).
    pub max_delay: Duration,
    /// Multiplier for exponential backoff.
    pub backoff_multiplier: f64,
    /// Whether to add random jitter to delays.
    pub jitter: bool,
}

impl RetryPolicy {
    /// Create a policy with the given attempt cap.
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }

    /// Set initial delay.
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Set maximum delay.
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Set backoff multiplier.
    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    /// Enable or disable jitter.
    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Whether a failure on the given attempt should be retried.
    ///
    /// False once the attempt cap is reached or the failure class is not
    /// transient.
    pub fn should_retry(&self, attempt: u32, class: FailureClass) -> bool {
        class == FailureClass::Transient && attempt < self.max_attempts
    }

    /// Backoff delay after the given (1-indexed) failed attempt.
    pub fn next_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1);
        let base_delay = self.initial_delay.as_millis() as f64
            * self.backoff_multiplier.powi(exponent as i32);

        let capped_delay = base_delay.min(self.max_delay.as_millis() as f64);

        let final_delay = if self.jitter {
            // Add random jitter of +/- 25%
            let jitter_factor = 0.75 + (rand::random::<f64>() * 0.5);
            capped_delay * jitter_factor
        } else {
            capped_delay
        };

        Duration::from_millis(final_delay as u64)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delay_grows_exponentially() {
        let policy = RetryPolicy::new(3)
            .with_initial_delay(Duration::from_secs(1))
            .with_backoff_multiplier(2.0)
            .with_jitter(false);

        assert_eq!(policy.next_delay(1), Duration::from_secs(1));
        assert_eq!(policy.next_delay(2), Duration::from_secs(2));
        assert_eq!(policy.next_delay(3), Duration::from_secs(4));
    }

    #[test]
    fn delay_is_capped() {
        let policy = RetryPolicy::new(10)
            .with_initial_delay(Duration::from_secs(1))
            .with_max_delay(Duration::from_secs(10))
            .with_backoff_multiplier(10.0)
            .with_jitter(false);

        // 1 * 10^5 = 100000 seconds, but should be capped at 10
        assert_eq!(policy.next_delay(6), Duration::from_secs(10));
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let policy = RetryPolicy::new(3)
            .with_initial_delay(Duration::from_secs(4))
            .with_jitter(true);

        for _ in 0..50 {
            let delay = policy.next_delay(1);
            assert!(delay >= Duration::from_secs(3));
            assert!(delay <= Duration::from_secs(6));
        }
    }

    #[test]
    fn retries_stop_at_the_attempt_cap() {
        let policy = RetryPolicy::new(3);

        assert!(policy.should_retry(1, FailureClass::Transient));
        assert!(policy.should_retry(2, FailureClass::Transient));
        assert!(!policy.should_retry(3, FailureClass::Transient));
        assert!(!policy.should_retry(4, FailureClass::Transient));
    }

    #[test]
    fn permanent_failures_are_never_retried() {
        let policy = RetryPolicy::new(3);
        assert!(!policy.should_retry(1, FailureClass::Permanent));
    }
}
