//! # Retry/backoff policy
//!
//! [`BackoffPolicy::decide`] turns a handler outcome and the transport-reported
//! delivery count into a [`RetryDecision`]. It holds no state, so the full retry
//! ladder can be exercised without a transport:
//!
//! ```rust
//! use std::time::Duration;
//! use sentinel_bus::{BackoffPolicy, RetryAction};
//!
//! let policy = BackoffPolicy::new(5, Duration::from_secs(1), Duration::from_secs(30));
//!
//! assert_eq!(policy.decide(true, 9).action, RetryAction::Ack);
//! assert_eq!(
//!     policy.decide(false, 3).action,
//!     RetryAction::NakWithDelay(Duration::from_secs(4))
//! );
//! assert_eq!(policy.decide(false, 5).action, RetryAction::DeadLetter);
//! ```

use std::fmt;
use std::time::Duration;

use crate::config::BusConfig;

/// What the consumer does with a delivery once its handler has returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryAction {
    Ack,
    /// Ask the transport to redeliver after the delay
    NakWithDelay(Duration),
    DeadLetter,
}

/// Why a [`RetryAction`] was chosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryReason {
    Succeeded,
    RetryBudgetRemaining { num_delivered: u32, max_deliver: u32 },
    RetryBudgetExhausted { num_delivered: u32, max_deliver: u32 },
}

impl fmt::Display for RetryReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Succeeded => write!(f, "handler succeeded"),
            Self::RetryBudgetRemaining {
                num_delivered,
                max_deliver,
            } => write!(f, "attempt {num_delivered} of {max_deliver} failed"),
            Self::RetryBudgetExhausted {
                num_delivered,
                max_deliver,
            } => write!(
                f,
                "attempt {num_delivered} failed, max_deliver {max_deliver} reached"
            ),
        }
    }
}

/// Output of [`BackoffPolicy::decide`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryDecision {
    pub action: RetryAction,
    pub reason: RetryReason,
}

/// Exponential backoff with a dead-letter threshold.
///
/// The redelivery delay after attempt `n` is `base × 2^(n-1)`, clamped to `max`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub max_deliver: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl BackoffPolicy {
    pub fn new(max_deliver: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_deliver,
            base_delay,
            max_delay,
        }
    }

    pub fn from_config(config: &BusConfig) -> Self {
        Self::new(
            config.max_deliver,
            config.retry_base_delay,
            config.retry_max_delay,
        )
    }

    /// Decide the fate of a delivery.
    ///
    /// `num_delivered` is 1-based; a transport reporting 0 is treated as a first delivery.
    pub fn decide(&self, succeeded: bool, num_delivered: u32) -> RetryDecision {
        let num_delivered = num_delivered.max(1);

        if succeeded {
            return RetryDecision {
                action: RetryAction::Ack,
                reason: RetryReason::Succeeded,
            };
        }

        if num_delivered >= self.max_deliver {
            return RetryDecision {
                action: RetryAction::DeadLetter,
                reason: RetryReason::RetryBudgetExhausted {
                    num_delivered,
                    max_deliver: self.max_deliver,
                },
            };
        }

        RetryDecision {
            action: RetryAction::NakWithDelay(self.delay_for(num_delivered)),
            reason: RetryReason::RetryBudgetRemaining {
                num_delivered,
                max_deliver: self.max_deliver,
            },
        }
    }

    /// Delay to wait after the `attempt`-th failure (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.max(1).saturating_sub(1).min(i32::MAX as u32) as i32;
        let secs = self.base_delay.as_secs_f64() * 2f64.powi(exponent);

        if !secs.is_finite() || secs > self.max_delay.as_secs_f64() {
            self.max_delay
        } else {
            Duration::from_secs_f64(secs)
        }
    }
}
