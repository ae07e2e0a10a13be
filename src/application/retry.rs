use crate::error::StageError;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tracing::warn;

const MAX_BACKOFF: Duration = Duration::from_secs(3600);

/// A stage's retry declaration: how often transient failures are re-invoked
/// and how the wait grows between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    pub interval: Duration,
    pub backoff_rate: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            interval: Duration::from_secs(1),
            backoff_rate: 2.0,
        }
    }
}

impl RetryPolicy {
    /// A single attempt; failures surface immediately.
    pub fn once() -> Self {
        Self {
            max_attempts: 1,
            interval: Duration::ZERO,
            backoff_rate: 1.0,
        }
    }

    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            interval: Duration::ZERO,
            backoff_rate: 1.0,
        }
    }

    /// Wait before retry number `retry` (1-based).
    pub fn delay_for(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1).min(i32::MAX as u32) as i32;
        let nanos = self.interval.as_nanos() as f64 * self.backoff_rate.powi(exponent);
        if !nanos.is_finite() || nanos >= MAX_BACKOFF.as_nanos() as f64 {
            MAX_BACKOFF
        } else {
            Duration::from_nanos(nanos.max(0.0) as u64)
        }
    }

    /// Runs `op`, re-invoking it while it fails with a retryable error and
    /// attempts remain. Non-retryable errors are returned as-is.
    pub async fn run<T, F, Fut>(&self, label: &str, mut op: F) -> Result<T, StageError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, StageError>>,
    {
        let mut attempt = 1;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() && attempt < self.max_attempts => {
                    let delay = self.delay_for(attempt);
                    warn!(
                        stage = label,
                        attempt,
                        max_attempts = self.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Transient stage failure, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
