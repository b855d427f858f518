//! Reconnect timing for outgoing connections.
//!
//! A [`ReconnectPolicy`] retries a failed connect at a fixed interval until a
//! total time budget, measured from the first failure, runs out.

use std::time::{Duration, Instant};

/// Retry interval and total budget.
///
/// # Example
///
/// ```rust
/// use streamconn_core::reconnect::{ReconnectAction, ReconnectPolicy, ReconnectState};
/// use std::time::{Duration, Instant};
///
/// let policy = ReconnectPolicy::every(Duration::from_millis(100))
///     .with_total_duration(Duration::from_secs(1));
/// let mut state = ReconnectState::new(policy);
///
/// let t0 = Instant::now();
/// state.record_failure(t0);
/// assert_eq!(state.next_action(t0), ReconnectAction::Wait);
/// assert_eq!(state.next_action(t0 + Duration::from_millis(100)), ReconnectAction::Attempt);
/// assert_eq!(state.next_action(t0 + Duration::from_secs(2)), ReconnectAction::GiveUp);
/// ```
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// Delay between attempts. `None` disables reconnecting.
    pub interval: Option<Duration>,
    /// Budget from the first failure. `None` retries forever.
    pub total_duration: Option<Duration>,
}

impl ReconnectPolicy {
    /// No reconnect; the first failure is final.
    #[must_use]
    pub const fn disabled() -> Self {
        Self {
            interval: None,
            total_duration: None,
        }
    }

    /// Retry every `interval` without a budget.
    #[must_use]
    pub const fn every(interval: Duration) -> Self {
        Self {
            interval: Some(interval),
            total_duration: None,
        }
    }

    #[must_use]
    pub const fn with_total_duration(mut self, total: Duration) -> Self {
        self.total_duration = Some(total);
        self
    }

    #[inline]
    #[must_use]
    pub const fn is_enabled(&self) -> bool {
        self.interval.is_some()
    }
}

/// What a reconnect check decided.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectAction {
    /// Interval not elapsed yet.
    Wait,
    /// Try to connect again now.
    Attempt,
    /// Budget exhausted or reconnect disabled.
    GiveUp,
}

/// Reconnect bookkeeping of one connection.
#[derive(Debug, Clone)]
pub struct ReconnectState {
    policy: ReconnectPolicy,
    /// Attempts since the first failure
    attempt: u32,
    first_failure: Option<Instant>,
    last_failure: Option<Instant>,
}

impl ReconnectState {
    #[must_use]
    pub const fn new(policy: ReconnectPolicy) -> Self {
        Self {
            policy,
            attempt: 0,
            first_failure: None,
            last_failure: None,
        }
    }

    /// Note a failed or lost connect at `now`.
    pub fn record_failure(&mut self, now: Instant) {
        self.first_failure.get_or_insert(now);
        self.last_failure = Some(now);
    }

    /// Note that an attempt was started.
    pub fn record_attempt(&mut self) {
        self.attempt += 1;
    }

    /// Decide what to do at `now`.
    #[must_use]
    pub fn next_action(&self, now: Instant) -> ReconnectAction {
        let Some(interval) = self.policy.interval else {
            return ReconnectAction::GiveUp;
        };
        let (Some(first), Some(last)) = (self.first_failure, self.last_failure) else {
            return ReconnectAction::Wait;
        };
        if let Some(total) = self.policy.total_duration {
            if now.saturating_duration_since(first) > total {
                return ReconnectAction::GiveUp;
            }
        }
        if now.saturating_duration_since(last) >= interval {
            ReconnectAction::Attempt
        } else {
            ReconnectAction::Wait
        }
    }

    /// Whether a failure at `now` may still be retried.
    #[must_use]
    pub fn can_retry(&self, now: Instant) -> bool {
        self.next_action(now) != ReconnectAction::GiveUp
    }

    /// Forget failures after a successful connect.
    pub fn reset(&mut self) {
        self.attempt = 0;
        self.first_failure = None;
        self.last_failure = None;
    }

    #[inline]
    #[must_use]
    pub const fn attempt(&self) -> u32 {
        self.attempt
    }

    #[inline]
    #[must_use]
    pub const fn policy(&self) -> ReconnectPolicy {
        self.policy
    }

    /// Time of the first failure since the last reset.
    #[inline]
    #[must_use]
    pub const fn first_failure(&self) -> Option<Instant> {
        self.first_failure
    }
}
