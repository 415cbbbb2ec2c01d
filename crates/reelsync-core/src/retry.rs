//! Bounded retry with exponential backoff for network handshakes
//!
//! Only the freshness probe and the opening of a download go through here.
//! Once a body is being streamed, failures are final for the run.

use std::time::Duration;

use crate::stream::{StreamError, http_config};

/// Fixed attempt budget with `base * 2^(attempt-1)` delays, no jitter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first one
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    /// Policy using the global [`HttpConfig`](crate::HttpConfig) attempt budget.
    pub fn from_http_config() -> Self {
        Self {
            max_attempts: http_config().max_retries.max(1),
            ..Self::default()
        }
    }

    /// No waiting between attempts (tests).
    pub const fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            base_delay: Duration::ZERO,
        }
    }

    /// Delay before retry number `attempt` (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        self.base_delay * 2u32.saturating_pow(attempt.saturating_sub(1))
    }
}

/// Run `op` until it succeeds, fails permanently, or the budget is spent.
///
/// Returns the final error on exhaustion / non-retryable error.
pub fn retry<T>(
    label: &str,
    policy: &RetryPolicy,
    mut op: impl FnMut() -> Result<T, StreamError>,
) -> Result<T, StreamError> {
    let mut attempt = 1u32;
    loop {
        match op() {
            Ok(v) => return Ok(v),
            Err(e) if attempt < policy.max_attempts && e.is_retryable() => {
                let delay = policy.backoff(attempt);
                log::warn!(
                    "{label}: attempt {attempt}/{} failed: {e}, retrying in {delay:?}",
                    policy.max_attempts
                );
                std::thread::sleep(delay);
                attempt += 1;
            }
            Err(e) => {
                log::debug!("{label}: giving up after {attempt} attempt(s): {e}");
                return Err(e);
            }
        }
    }
}
