//! Opt-in retry with fixed attempts and linear or exponential backoff
//!
//! Nothing in the transfer or lock paths retries on its own; callers wrap
//! an operation in [`with_retry`] when they want it.

use crate::error::{Error, Result};
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;

/// How the delay grows between attempts
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Backoff {
    /// No delay between attempts
    None,
    /// `delay * (attempt - 1) * factor`
    Linear(f64),
    /// `delay * factor^(attempt - 1)`
    Exponential(f64),
}

/// Retry configuration
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Total attempts, including the first
    pub max_attempts: u32,
    /// Base delay
    pub delay: Duration,
    /// Growth of the delay
    pub backoff: Backoff,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            delay: Duration::from_millis(100),
            backoff: Backoff::Linear(1.0),
        }
    }
}

impl RetryConfig {
    /// A single attempt, no retry
    pub fn once() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    /// Delay to wait after `attempt` (1-based) failed
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let base = self.delay.as_secs_f64();
        let secs = match self.backoff {
            Backoff::None => 0.0,
            Backoff::Linear(factor) => base * f64::from(attempt.saturating_sub(1)) * factor,
            Backoff::Exponential(factor) => {
                let exp = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
                base * factor.powi(exp)
            }
        };
        if secs.is_finite() && secs > 0.0 {
            Duration::from_secs_f64(secs)
        } else {
            Duration::ZERO
        }
    }
}

/// Execute an async operation, retrying on any error until attempts run out
pub async fn with_retry<F, Fut, T>(config: &RetryConfig, mut operation: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut last_error = None;

    for attempt in 1..=config.max_attempts.max(1) {
        match operation().await {
            Ok(result) => return Ok(result),
            Err(e) => {
                if attempt < config.max_attempts {
                    let delay = config.delay_after(attempt);
                    tracing::warn!(
                        attempt,
                        max_attempts = config.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Operation failed, retrying"
                    );
                    sleep(delay).await;
                }
                last_error = Some(e);
            }
        }
    }

    Err(last_error.unwrap_or_else(|| Error::worker("retry loop ran zero attempts")))
}
