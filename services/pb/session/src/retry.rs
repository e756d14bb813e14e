//! Bounded reconnection policy for client managers

use parking_lot::Mutex;
use std::time::Duration;
use tracing::{debug, warn};

/// Counts consecutive failed connections and decides whether to try again.
///
/// The bound counts reconnections, not connections: with a bound of N the
/// client dials N + 1 times and gives up on failure N + 1.
#[derive(Debug)]
pub struct RetryPolicy {
    /// Retries allowed per campaign
    bound: u32,
    /// Fixed wait before each retry
    delay: Duration,
    state: Mutex<RetryState>,
}

#[derive(Debug, Default)]
struct RetryState {
    /// Retries made since the last established session
    attempts: u32,
    /// Whether exhaustion has been reported for this campaign
    exhausted: bool,
}

impl RetryPolicy {
    /// Allow `bound` retries, each after `delay`
    pub fn new(bound: u32, delay: Duration) -> Self {
        Self {
            bound,
            delay,
            state: Mutex::new(RetryState::default()),
        }
    }

    /// Record a failure.
    ///
    /// Returns the delay before the next attempt, or `None` once the bound is
    /// reached; from then on every call returns `None` until [`reset`](Self::reset).
    pub fn next_attempt(&self) -> Option<Duration> {
        let mut state = self.state.lock();
        if state.attempts >= self.bound {
            if !state.exhausted {
                state.exhausted = true;
                warn!("Retry bound of {} reached", self.bound);
            }
            return None;
        }

        state.attempts += 1;
        debug!("Retry {}/{} in {:?}", state.attempts, self.bound, self.delay);
        Some(self.delay)
    }

    /// A session was established; start counting afresh.
    ///
    /// Returns the number of retries it took.
    pub fn reset(&self) -> u32 {
        let mut state = self.state.lock();
        let attempts = state.attempts;
        if attempts > 0 {
            debug!("Recovered after {} retries", attempts);
        }
        *state = RetryState::default();
        attempts
    }

    /// Retries made since the last reset
    pub fn attempts(&self) -> u32 {
        self.state.lock().attempts
    }

    /// Retries allowed
    pub fn bound(&self) -> u32 {
        self.bound
    }

    /// Whether the bound has been reached
    pub fn is_exhausted(&self) -> bool {
        self.state.lock().attempts >= self.bound
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bounded_attempts() {
        let policy = RetryPolicy::new(3, Duration::from_millis(10));

        for expected in 1..=3 {
            assert_eq!(policy.next_attempt(), Some(Duration::from_millis(10)));
            assert_eq!(policy.attempts(), expected);
        }
        assert!(policy.is_exhausted());
        assert_eq!(policy.next_attempt(), None);
        assert_eq!(policy.next_attempt(), None);
        assert_eq!(policy.attempts(), 3);
    }

    #[test]
    fn test_reset_after_session() {
        let policy = RetryPolicy::new(2, Duration::ZERO);
        policy.next_attempt();
        policy.next_attempt();
        assert_eq!(policy.next_attempt(), None);

        assert_eq!(policy.reset(), 2);
        assert_eq!(policy.attempts(), 0);
        assert!(policy.next_attempt().is_some());
    }

    #[test]
    fn test_bound_counts_reconnections() {
        let policy = RetryPolicy::new(10, Duration::ZERO);
        let mut connections = 1;
        let mut failures = 0;
        loop {
            failures += 1;
            if policy.next_attempt().is_none() {
                break;
            }
            connections += 1;
        }
        assert_eq!(connections, 11);
        assert_eq!(failures, 11);
        assert_eq!(policy.attempts(), 10);
    }

    #[test]
    fn test_zero_bound_never_retries() {
        let policy = RetryPolicy::new(0, Duration::from_secs(5));
        assert_eq!(policy.next_attempt(), None);
        assert_eq!(policy.bound(), 0);
    }
}
