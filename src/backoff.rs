//! Bounded retry policies.
//!
//! Control connect retries and would-block on the data socket are driven by
//! a [`BackoffPolicy`], so neither can spin forever. The server's relisten
//! pause after a failed session is the fixed
//! [`Config::relisten_delay`](crate::Config::relisten_delay).

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// How long to wait between attempts, and how many attempts to make.
///
/// # Examples
///
/// ```
/// use nperf3::backoff::BackoffPolicy;
/// use std::time::Duration;
///
/// let policy = BackoffPolicy::exponential(Duration::from_millis(10), Duration::from_millis(40), 4);
/// assert_eq!(policy.delay_for(0), Some(Duration::from_millis(10)));
/// assert_eq!(policy.delay_for(1), Some(Duration::from_millis(20)));
/// assert_eq!(policy.delay_for(3), Some(Duration::from_millis(40)));
/// assert_eq!(policy.delay_for(4), None);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BackoffPolicy {
    /// Same delay after every failure.
    Fixed { delay: Duration, max_retries: u32 },
    /// Delay doubles after every failure, capped at `max_delay`.
    Exponential {
        initial: Duration,
        max_delay: Duration,
        max_retries: u32,
    },
}

impl BackoffPolicy {
    pub fn fixed(delay: Duration, max_retries: u32) -> Self {
        BackoffPolicy::Fixed { delay, max_retries }
    }

    pub fn exponential(initial: Duration, max_delay: Duration, max_retries: u32) -> Self {
        BackoffPolicy::Exponential {
            initial,
            max_delay,
            max_retries,
        }
    }

    pub fn max_retries(&self) -> u32 {
        match *self {
            BackoffPolicy::Fixed { max_retries, .. } => max_retries,
            BackoffPolicy::Exponential { max_retries, .. } => max_retries,
        }
    }

    /// Delay before retry number `attempt` (zero-based), or `None` once the
    /// budget is spent.
    pub fn delay_for(&self, attempt: u32) -> Option<Duration> {
        if attempt >= self.max_retries() {
            return None;
        }
        Some(match *self {
            BackoffPolicy::Fixed { delay, .. } => delay,
            BackoffPolicy::Exponential {
                initial, max_delay, ..
            } => {
                let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
                initial.saturating_mul(factor).min(max_delay)
            }
        })
    }

    /// Starts a fresh attempt counter against this policy.
    pub fn tracker(&self) -> Backoff {
        Backoff {
            policy: *self,
            attempt: 0,
        }
    }
}

/// Attempt counter for one retry loop.
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: BackoffPolicy,
    attempt: u32,
}

impl Backoff {
    /// Records a failure and returns how long to wait, or `None` when the
    /// caller should give up.
    pub fn next_delay(&mut self) -> Option<Duration> {
        let delay = self.policy.delay_for(self.attempt)?;
        self.attempt += 1;
        Some(delay)
    }

    /// Clears the counter after a success.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    pub fn attempts(&self) -> u32 {
        self.attempt
    }
}
