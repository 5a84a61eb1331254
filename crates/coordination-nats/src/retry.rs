use crate::Error;

use std::time::Duration;

use tracing::{debug, error, warn};

/// Timeout and exponential backoff applied to individual NATS operations.
#[derive(Clone, Copy, Debug)]
pub struct RetryPolicy {
    /// Timeout for a single attempt.
    pub operation_timeout: Duration,

    /// Maximum number of attempts.
    pub max_retries: usize,

    /// Delay before the first retry.
    pub base_delay: Duration,

    /// Upper bound on the delay between retries.
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            operation_timeout: Duration::from_secs(5),
            max_retries: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
        }
    }
}

pub fn is_retriable(error: &str) -> bool {
    let error = error.to_lowercase();

    error.contains("timeout")
        || error.contains("timed out")
        || error.contains("connection")
        || error.contains("refused")
        || error.contains("unavailable")
        || error.contains("temporary")
        || error.contains("stream not found") // Can happen during cluster failover
}

impl RetryPolicy {
    /// Executes an operation with retry logic and exponential backoff.
    pub async fn run<F, Fut, R, E>(&self, operation_name: &str, operation: F) -> Result<R, Error>
    where
        F: Fn() -> Fut + Send + Sync,
        Fut: Future<Output = Result<R, E>> + Send,
        E: std::fmt::Display + std::fmt::Debug,
    {
        let mut attempts = 0;
        let mut delay = self.base_delay;

        loop {
            attempts += 1;

            match tokio::time::timeout(self.operation_timeout, operation()).await {
                Ok(Ok(result)) => {
                    if attempts > 1 {
                        debug!(
                            operation = operation_name,
                            attempts, "operation succeeded after retry"
                        );
                    }
                    return Ok(result);
                }
                Ok(Err(e)) => {
                    let error_str = e.to_string();

                    if !is_retriable(&error_str) {
                        debug!(operation = operation_name, error = ?e, "operation failed with non-retriable error");
                        return Err(Error::MaxRetriesExceeded {
                            max_attempts: 1,
                            last_error: error_str,
                        });
                    }

                    if attempts >= self.max_retries {
                        error!(operation = operation_name, attempts, error = ?e, "operation failed after maximum retries");
                        return Err(Error::MaxRetriesExceeded {
                            max_attempts: self.max_retries,
                            last_error: error_str,
                        });
                    }

                    warn!(operation = operation_name, attempt = attempts, max_attempts = self.max_retries, delay = ?delay, error = ?e, "operation failed, retrying");
                }
                Err(_elapsed) => {
                    if attempts >= self.max_retries {
                        error!(operation = operation_name, attempts, timeout = ?self.operation_timeout, "operation timed out after maximum retries");
                        return Err(Error::Timeout {
                            attempts,
                            last_error: format!(
                                "operation timed out after {:?}",
                                self.operation_timeout
                            ),
                        });
                    }

                    warn!(operation = operation_name, attempt = attempts, timeout = ?self.operation_timeout, delay = ?delay, "operation timed out, retrying");
                }
            }

            tokio::time::sleep(delay).await;

            // Exponential backoff with 0-10% jitter
            delay = std::cmp::min(
                delay.mul_f64(fastrand::f64().mul_add(0.1, 2.0)),
                self.max_delay,
            );
        }
    }
}
