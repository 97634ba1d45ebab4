use std::{future::Future, time::Duration};

use anyhow::anyhow;
use tracing::debug;

use crate::error::PipelineError;

/// Fixed attempt count with capped exponential backoff between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, initial_backoff: Duration, max_backoff: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            initial_backoff,
            max_backoff: max_backoff.max(initial_backoff),
        }
    }

    /// Delay after the `attempt`-th failure, starting at 1:
    /// `initial * 2^(attempt - 1)`, capped at `max_backoff`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(20);
        self.initial_backoff
            .saturating_mul(2_u32.saturating_pow(exponent))
            .min(self.max_backoff)
    }

    /// Runs `op` until it succeeds, bounding each attempt by `timeout`.
    /// Exhaustion is reported as [`PipelineError::TransientIo`] carrying the
    /// last failure.
    pub async fn run<T, F, Fut>(
        &self,
        operation: &'static str,
        key: &str,
        timeout: Duration,
        mut op: F,
    ) -> Result<T, PipelineError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let err = match tokio::time::timeout(timeout, op()).await {
                Ok(Ok(value)) => return Ok(value),
                Ok(Err(err)) => err,
                Err(_) => anyhow!("timed out after {:?}", timeout),
            };
            if attempt >= self.max_attempts {
                return Err(PipelineError::TransientIo {
                    operation,
                    key: key.to_string(),
                    source: err.context(format!("giving up after {} attempts", attempt)),
                });
            }
            let delay = self.backoff(attempt);
            debug!(
                operation,
                key,
                attempt,
                ?delay,
                error = %format!("{:#}", err),
                "retrying"
            );
            tokio::time::sleep(delay).await;
        }
    }
}
