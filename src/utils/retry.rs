// Retry utilities

use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::warn;

use crate::types::{AppError, AppResult};

/// Exponential backoff for service invocations. `max_attempts == 1` disables retrying.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl RetryPolicy {
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            base_delay: Duration::ZERO,
        }
    }

    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
        }
    }

    /// Delay before retry number `attempt` (1-based), capped at 32x the base delay.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.base_delay * 2u32.pow(attempt.saturating_sub(1).min(5))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::none()
    }
}

/// Run `operation` until it succeeds, fails with a non-retryable error, or the
/// policy's attempts are exhausted.
pub async fn with_retry<F, Fut, T>(policy: RetryPolicy, mut operation: F) -> AppResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = AppResult<T>>,
{
    let mut attempt = 0;

    loop {
        match operation().await {
            Ok(result) => return Ok(result),
            Err(error) => {
                attempt += 1;
                if attempt >= policy.max_attempts || !error.is_retryable() {
                    return Err(error);
                }

                let delay = policy.delay_for(attempt);
                warn!(attempt, delay_ms = delay.as_millis() as u64, error = %error, "Retrying service call");
                sleep(delay).await;
            }
        }
    }
}

/// User-facing wording for a failed service call.
pub fn describe(error: &AppError) -> String {
    match error {
        AppError::ServiceRejected(msg) => format!("The completion service rejected the request ({})", msg),
        AppError::ServiceInvocation(msg) => format!("The completion service is unavailable ({})", msg),
        AppError::Http(e) => format!("The completion service is unavailable ({})", e),
        other => other.to_string(),
    }
}
