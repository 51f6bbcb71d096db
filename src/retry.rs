//! Retry policy shared by the pipeline components. One policy value per
//! component instead of ad-hoc retry loops scattered through the services.

use std::time::Duration;

/// What to do once the attempts are spent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OnExhausted {
    /// Return the message to its queue (bounded by the bus's delivery
    /// attempts).
    Requeue,
    /// Hand the work to the operator review channel.
    ToReview,
    /// Give up and terminate the process.
    FailProcess,
}

/// Bounded exponential backoff.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub multiplier: f64,
    pub on_exhausted: OnExhausted,
}

impl RetryPolicy {
    /// Delay before the given retry; `attempt` is 1-based, so the first
    /// retry waits `base_delay`, the second `base_delay * multiplier`, and
    /// so on.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.powi(attempt.saturating_sub(1) as i32);
        self.base_delay.mul_f64(factor)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            multiplier: 2.0,
            on_exhausted: OnExhausted::ToReview,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delays_double_per_attempt() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for(1), Duration::from_secs(1));
        assert_eq!(policy.delay_for(2), Duration::from_secs(2));
        assert_eq!(policy.delay_for(3), Duration::from_secs(4));
    }
}
