//! Brute-force brake for logins
//!
//! Shared by all connections of a node. A failed login makes the next
//! login attempt wait; consecutive failures double the wait up to a
//! ceiling, a successful login resets it. The attempt that failed is not
//! delayed itself.

use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// Wait after the first failure
pub const MIN_LOGIN_DELAY: Duration = Duration::from_secs(1);

/// Ceiling for consecutive failures
pub const MAX_LOGIN_DELAY: Duration = Duration::from_secs(5);

#[derive(Debug)]
struct ThrottleState {
    delay: Duration,
    not_before: Option<Instant>,
}

/// Global login throttler
#[derive(Debug)]
pub struct LoginThrottler {
    min: Duration,
    max: Duration,
    state: Mutex<ThrottleState>,
}

impl LoginThrottler {
    pub fn new(min: Duration, max: Duration) -> Self {
        LoginThrottler {
            min,
            max: max.max(min),
            state: Mutex::new(ThrottleState {
                delay: Duration::ZERO,
                not_before: None,
            }),
        }
    }

    /// Record the outcome of a login
    pub fn record(&self, success: bool) {
        let mut state = self.state.lock();
        if success {
            state.delay = Duration::ZERO;
            state.not_before = None;
        } else {
            state.delay = if state.delay.is_zero() {
                self.min
            } else {
                (state.delay * 2).min(self.max)
            };
            state.not_before = Some(Instant::now() + state.delay);
        }
    }

    /// How long the next login attempt has to wait
    pub fn pending_delay(&self) -> Duration {
        let state = self.state.lock();
        state
            .not_before
            .map(|t| t.saturating_duration_since(Instant::now()))
            .unwrap_or(Duration::ZERO)
    }

    /// Current back-off step
    pub fn current_step(&self) -> Duration {
        self.state.lock().delay
    }
}

impl Default for LoginThrottler {
    fn default() -> Self {
        Self::new(MIN_LOGIN_DELAY, MAX_LOGIN_DELAY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_delay_initially() {
        let throttler = LoginThrottler::default();
        assert_eq!(throttler.pending_delay(), Duration::ZERO);
    }

    #[test]
    fn test_failures_back_off() {
        let throttler = LoginThrottler::default();
        throttler.record(false);
        assert_eq!(throttler.current_step(), MIN_LOGIN_DELAY);
        assert!(throttler.pending_delay() > Duration::ZERO);
        assert!(throttler.pending_delay() <= MIN_LOGIN_DELAY);

        for _ in 0..5 {
            throttler.record(false);
        }
        assert_eq!(throttler.current_step(), MAX_LOGIN_DELAY);
    }

    #[test]
    fn test_success_resets() {
        let throttler = LoginThrottler::default();
        throttler.record(false);
        throttler.record(false);
        throttler.record(true);
        assert_eq!(throttler.current_step(), Duration::ZERO);
        assert_eq!(throttler.pending_delay(), Duration::ZERO);
    }
}
