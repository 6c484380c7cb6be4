//! Fixed-count retry with doubling backoff.

use std::future::Future;
use std::time::Duration;

use crate::error::{AppError, Result};

/// Bounded retry schedule: `attempts` tries, waiting `initial_delay`, then twice that, and so on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub initial_delay: Duration,
}

impl RetryPolicy {
    /// Pack and agent downloads: 3 attempts, 5 s initial delay.
    pub const DOWNLOAD: Self = Self {
        attempts: 3,
        initial_delay: Duration::from_secs(5),
    };

    /// Identity changes propagate slowly; retry the dependent call a few times.
    pub const IDENTITY_PROPAGATION: Self = Self {
        attempts: 4,
        initial_delay: Duration::from_secs(2),
    };

    /// Delay after failed attempt number `attempt` (1-based).
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(16);
        self.initial_delay * (1u32 << shift)
    }
}

/// Run `op` until it succeeds or the policy is exhausted. Only errors accepted by
/// `transient` are retried; any other error, or the last one, is returned.
pub async fn retry_when<T, F, Fut, P>(
    policy: RetryPolicy,
    label: &str,
    transient: P,
    mut op: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
    P: Fn(&AppError) -> bool,
{
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if attempt < policy.attempts && transient(&e) => {
                let delay = policy.delay_after(attempt);
                log::warn!(
                    "{} failed (attempt {}/{}): {}; retrying in {}s",
                    label,
                    attempt,
                    policy.attempts,
                    e,
                    delay.as_secs()
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}
