//! Reconnection backoff policy
//!
//! Retries follow a fixed schedule of increasing delays rather than a
//! computed exponential curve, so scheduled delays are exactly predictable.
//! The attempt counter is incremented before a timer is armed; incrementing
//! past the schedule length means the session is out of retries.

use std::time::Duration;

/// Fixed retry delay schedule in milliseconds.
pub const RETRY_SCHEDULE_MS: [u64; 6] = [1000, 2000, 4000, 8000, 16000, 30000];

/// Fixed-schedule retry policy shared by the disconnected and failed paths.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    schedule_ms: &'static [u64],
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            schedule_ms: &RETRY_SCHEDULE_MS,
        }
    }
}

impl RetryPolicy {
    /// Number of attempts before a session is declared Failed.
    pub fn max_attempts(&self) -> u32 {
        self.schedule_ms.len() as u32
    }

    /// Delay before the given attempt fires.
    ///
    /// Attempts are 1-indexed (the counter is incremented before the timer
    /// is armed); indexes past the end clamp to the last slot.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let index = (attempt.saturating_sub(1) as usize).min(self.schedule_ms.len() - 1);
        Duration::from_millis(self.schedule_ms[index])
    }

    /// Whether a counter value means the schedule is used up.
    pub fn is_exhausted(&self, attempts: u32) -> bool {
        attempts > self.max_attempts()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schedule_delays() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for(1), Duration::from_millis(1000));
        assert_eq!(policy.delay_for(2), Duration::from_millis(2000));
        assert_eq!(policy.delay_for(3), Duration::from_millis(4000));
        assert_eq!(policy.delay_for(4), Duration::from_millis(8000));
        assert_eq!(policy.delay_for(5), Duration::from_millis(16000));
        assert_eq!(policy.delay_for(6), Duration::from_millis(30000));
    }

    #[test]
    fn test_delay_clamps_to_last_slot() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for(7), Duration::from_millis(30000));
        assert_eq!(policy.delay_for(100), Duration::from_millis(30000));
    }

    #[test]
    fn test_exhaustion_boundary() {
        let policy = RetryPolicy::default();
        assert!(!policy.is_exhausted(0));
        assert!(!policy.is_exhausted(6));
        assert!(policy.is_exhausted(7));
    }

    #[test]
    fn test_delays_are_deterministic() {
        let policy = RetryPolicy::default();
        for attempt in 1..=6 {
            assert_eq!(policy.delay_for(attempt), policy.delay_for(attempt));
        }
    }
}
