use std::future::Future;
use std::time::Duration;

use rfp_common::backoff::backoff_delay;
use tracing::warn;

/// Attempts, backoff curve and retryable predicate for one call path.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    pub fn delay_for(&self, attempt: u32) -> Duration {
        backoff_delay(
            self.initial_backoff,
            self.max_backoff,
            attempt.saturating_sub(1),
        )
    }

    /// Longest a full retry sequence can take when every attempt runs to `call_timeout`:
    /// all attempts plus the largest possible backoff (jitter included) between them.
    pub fn worst_case(&self, call_timeout: Duration) -> Duration {
        let attempts = self.max_attempts.max(1);
        let backoff: Duration = (1..attempts)
            .map(|attempt| {
                let factor = 1u32.checked_shl(attempt - 1).unwrap_or(u32::MAX);
                let capped = self.initial_backoff.saturating_mul(factor).min(self.max_backoff);
                capped + capped / 4
            })
            .sum();
        call_timeout * attempts + backoff
    }

    /// Runs `f` until it succeeds, returns a non-retryable error, or attempts run out.
    /// The last error is returned unchanged.
    pub async fn run<T, E, F, Fut, P>(&self, label: &str, mut f: F, retryable: P) -> Result<T, E>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        P: Fn(&E) -> bool,
        E: std::fmt::Display,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            match f(attempt).await {
                Ok(value) => return Ok(value),
                Err(err) if attempt < max_attempts && retryable(&err) => {
                    let delay = self.delay_for(attempt);
                    warn!(
                        call = label,
                        attempt,
                        max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "transient failure, backing off"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(err) => return Err(err),
            }
        }
    }
}
