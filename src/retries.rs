use serde::{Deserialize, Serialize};
use std::cmp;
use std::time::Duration;

/// This struct represents the policy to execute retries of side effects.
///
/// Backoff delays are journaled as ordinary sleep entries, so a replayed
/// invocation reproduces the exact retry schedule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RetryPolicy {
    /// # Fixed delay
    ///
    /// Retry with a fixed delay strategy.
    FixedDelay {
        /// # Interval
        ///
        /// Interval between retries.
        interval: Duration,

        /// # Max attempts
        ///
        /// Gives up retrying when this number of attempts is reached.
        /// Infinite retries if unset.
        max_attempts: Option<u32>,
    },
    /// # Exponential
    ///
    /// Retry with an exponential strategy. The next retry is computed as `min(last_retry_interval * factor, max_interval)`.
    Exponential {
        /// # Initial Interval
        ///
        /// Initial interval for the first retry attempt.
        initial_interval: Duration,

        /// # Factor
        ///
        /// The factor to use to compute the next retry attempt. This value should be higher than 1.0
        factor: f32,

        /// # Max interval
        ///
        /// Maximum interval between retries.
        max_interval: Option<Duration>,

        /// # Max attempts
        ///
        /// Gives up retrying when this number of attempts is reached.
        /// Infinite retries if unset.
        max_attempts: Option<u32>,
    },
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::Exponential {
            initial_interval: Duration::from_millis(50),
            factor: 2.0,
            max_interval: Some(Duration::from_secs(10)),
            max_attempts: None,
        }
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub(crate) enum NextRetry {
    Retry(Duration),
    DoNotRetry,
}

impl RetryPolicy {
    pub fn fixed_delay(interval: Duration, max_attempts: Option<u32>) -> Self {
        Self::FixedDelay {
            interval,
            max_attempts,
        }
    }

    pub fn exponential(
        initial_interval: Duration,
        factor: f32,
        max_interval: Option<Duration>,
        max_attempts: Option<u32>,
    ) -> Self {
        Self::Exponential {
            initial_interval,
            factor,
            max_interval,
            max_attempts,
        }
    }

    /// Next backoff for the given number of failed attempts so far (>= 1).
    pub(crate) fn next_retry(&self, attempts: u32) -> NextRetry {
        debug_assert!(attempts >= 1);
        match self {
            RetryPolicy::FixedDelay {
                interval,
                max_attempts,
            } => {
                if max_attempts.is_some_and(|max_attempts| attempts >= max_attempts) {
                    return NextRetry::DoNotRetry;
                }
                NextRetry::Retry(*interval)
            }
            RetryPolicy::Exponential {
                initial_interval,
                factor,
                max_interval,
                max_attempts,
            } => {
                if max_attempts.is_some_and(|max_attempts| attempts >= max_attempts) {
                    return NextRetry::DoNotRetry;
                }

                NextRetry::Retry(cmp::min(
                    max_interval.unwrap_or(Duration::MAX),
                    initial_interval.mul_f32(factor.powi((attempts - 1) as i32)),
                ))
            }
        }
    }
}
