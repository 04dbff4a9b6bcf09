//! Retry policy with exponential backoff for gateway transport failures.
//!
//! Only transport failures (connect, handshake, write) are retried here.
//! Rejections reported by the gateway are handled by the dispatcher's resume
//! protocol and never consume this budget.

use std::future::Future;
use std::time::Duration;

use tokio::time::sleep;
use tracing::warn;

use crate::error::Result;

/// Default maximum number of retry attempts.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Default initial backoff duration.
pub const DEFAULT_INITIAL_BACKOFF: Duration = Duration::from_millis(100);

/// Maximum backoff duration cap.
pub const MAX_BACKOFF: Duration = Duration::from_secs(10);

/// Configuration for retry behavior.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of retry attempts.
    pub max_retries: u32,
    /// Initial backoff duration (doubles with each retry).
    pub initial_backoff: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            initial_backoff: DEFAULT_INITIAL_BACKOFF,
        }
    }
}

impl RetryConfig {
    /// Backoff before retry number `retry` (1-based), capped at [`MAX_BACKOFF`].
    #[must_use]
    pub fn backoff(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1).min(16);
        self.initial_backoff
            .saturating_mul(1u32 << exponent)
            .min(MAX_BACKOFF)
    }
}

/// Execute an async operation, retrying transport failures with backoff.
///
/// Errors for which [`crate::error::Error::is_transport`] is false are
/// returned immediately.
pub async fn with_retry<T, F, Fut>(config: &RetryConfig, operation_name: &str, mut operation: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut retries = 0;

    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transport() && retries < config.max_retries => {
                retries += 1;
                let wait_duration = config.backoff(retries);

                warn!(
                    operation = operation_name,
                    error = %e,
                    retry = retries,
                    max_retries = config.max_retries,
                    backoff_ms = wait_duration.as_millis() as u64,
                    "Retrying gateway operation"
                );

                sleep(wait_duration).await;
            }
            Err(e) => {
                if e.is_transport() {
                    warn!(
                        operation = operation_name,
                        retries = retries,
                        "Max retries exceeded for gateway operation"
                    );
                }
                return Err(e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_default_config() {
        let config = RetryConfig::default();
        assert_eq!(config.max_retries, DEFAULT_MAX_RETRIES);
        assert_eq!(config.initial_backoff, DEFAULT_INITIAL_BACKOFF);
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let config = RetryConfig {
            max_retries: 10,
            initial_backoff: Duration::from_millis(100),
        };
        assert_eq!(config.backoff(1), Duration::from_millis(100));
        assert_eq!(config.backoff(2), Duration::from_millis(200));
        assert_eq!(config.backoff(3), Duration::from_millis(400));
        assert_eq!(config.backoff(10), MAX_BACKOFF);
        assert_eq!(config.backoff(u32::MAX), MAX_BACKOFF);
    }

    #[test]
    fn test_backoff_zero_retry_uses_initial() {
        let config = RetryConfig::default();
        assert_eq!(config.backoff(0), DEFAULT_INITIAL_BACKOFF);
    }

    #[tokio::test]
    async fn test_with_retry_success_first_attempt() {
        let config = RetryConfig::default();
        let attempt_count = Arc::new(AtomicU32::new(0));
        let attempt_count_clone = attempt_count.clone();

        let result = with_retry(&config, "test", || {
            let count = attempt_count_clone.clone();
            async move {
                count.fetch_add(1, Ordering::SeqCst);
                Ok(7u32)
            }
        })
        .await;

        assert_eq!(result.unwrap(), 7);
        assert_eq!(attempt_count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_with_retry_success_after_retries() {
        let config = RetryConfig {
            max_retries: 3,
            initial_backoff: Duration::from_millis(1),
        };
        let attempt_count = Arc::new(AtomicU32::new(0));
        let attempt_count_clone = attempt_count.clone();

        let result = with_retry(&config, "test", || {
            let count = attempt_count_clone.clone();
            async move {
                let attempts = count.fetch_add(1, Ordering::SeqCst) + 1;
                if attempts < 3 {
                    Err(Error::Connection("connection refused".to_string()))
                } else {
                    Ok(())
                }
            }
        })
        .await;

        assert!(result.is_ok());
        assert_eq!(attempt_count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_with_retry_max_retries_exceeded() {
        let config = RetryConfig {
            max_retries: 2,
            initial_backoff: Duration::from_millis(1),
        };
        let attempt_count = Arc::new(AtomicU32::new(0));
        let attempt_count_clone = attempt_count.clone();

        let result: Result<()> = with_retry(&config, "test", || {
            let count = attempt_count_clone.clone();
            async move {
                count.fetch_add(1, Ordering::SeqCst);
                Err(Error::Connection("connection reset".to_string()))
            }
        })
        .await;

        assert!(matches!(result, Err(Error::Connection(_))));
        // Initial attempt + max_retries = 1 + 2 = 3
        assert_eq!(attempt_count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_with_retry_non_transport_error() {
        let config = RetryConfig::default();
        let attempt_count = Arc::new(AtomicU32::new(0));
        let attempt_count_clone = attempt_count.clone();

        let result: Result<()> = with_retry(&config, "test", || {
            let count = attempt_count_clone.clone();
            async move {
                count.fetch_add(1, Ordering::SeqCst);
                Err(Error::Tls("bad certificate".to_string()))
            }
        })
        .await;

        assert!(matches!(result, Err(Error::Tls(_))));
        assert_eq!(attempt_count.load(Ordering::SeqCst), 1);
    }
}
