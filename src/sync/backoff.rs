//! Retry with exponential backoff for provider throttling
//!
//! Only errors that classify themselves as retryable are retried. The
//! policy comes from `sync.backoff` in the config file.

use crate::config::BackoffConfig;
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

/// Configuration for retry behavior
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of retry attempts (not including the initial attempt)
    pub max_retries: u32,

    /// Initial backoff duration
    pub initial_backoff: Duration,

    /// Maximum backoff duration; also caps provider-supplied retry-after
    pub max_backoff: Duration,

    /// Backoff multiplier
    pub multiplier: f64,

    /// Add up to 25% random jitter
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::from(&BackoffConfig::default())
    }
}

impl From<&BackoffConfig> for RetryConfig {
    fn from(config: &BackoffConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            initial_backoff: Duration::from_millis(config.initial_backoff_ms),
            max_backoff: Duration::from_millis(config.max_backoff_ms),
            multiplier: config.multiplier,
            jitter: config.jitter,
        }
    }
}

impl RetryConfig {
    /// Short delays, used by tests and manual runs
    pub fn quick() -> Self {
        Self {
            max_retries: 3,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(10),
            multiplier: 2.0,
            jitter: false,
        }
    }

    /// Calculate backoff duration for a given attempt
    pub fn backoff_duration(&self, attempt: u32) -> Duration {
        let base = self.initial_backoff.as_secs_f64() * self.multiplier.powi(attempt as i32);
        let capped = base.min(self.max_backoff.as_secs_f64());

        let final_duration = if self.jitter {
            let jitter_factor = 1.0 + (rand_jitter() * 0.25);
            (capped * jitter_factor).min(self.max_backoff.as_secs_f64())
        } else {
            capped
        };

        Duration::from_secs_f64(final_duration.max(0.0))
    }
}

/// Jitter in 0.0..1.0 from the ring RNG
fn rand_jitter() -> f64 {
    use ring::rand::{SecureRandom, SystemRandom};
    let mut buf = [0u8; 2];
    if SystemRandom::new().fill(&mut buf).is_err() {
        return 0.0;
    }
    u16::from_le_bytes(buf) as f64 / (u16::MAX as f64 + 1.0)
}

/// Retry classification for errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Retry the operation
    Retry,
    /// Retry after a specific duration (e.g., a provider retry-after hint)
    RetryAfter(Duration),
    /// Don't retry, the error is permanent
    NoRetry,
}

/// Trait for errors that can indicate whether to retry
pub trait RetryableError {
    /// Determine if this error should be retried
    fn retry_decision(&self) -> RetryDecision;
}

/// How a retried operation ended
#[derive(Debug)]
pub struct RetryOutcome<T, E> {
    pub result: Result<T, E>,
    /// Retries performed (0 when the first attempt settled it)
    pub retries: u32,
}

/// Execute an async operation with retry logic
///
/// # Arguments
/// * `config` - Retry configuration
/// * `operation_name` - Name for logging purposes
/// * `operation` - The async operation to execute; receives the attempt number
///
/// # Returns
/// The result of the operation (or the last error) and the retry count
pub async fn with_retry<F, Fut, T, E>(
    config: &RetryConfig,
    operation_name: &str,
    mut operation: F,
) -> RetryOutcome<T, E>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: RetryableError + std::fmt::Display,
{
    let mut attempt = 0;

    loop {
        match operation(attempt).await {
            Ok(result) => {
                return RetryOutcome {
                    result: Ok(result),
                    retries: attempt,
                }
            }
            Err(e) => {
                let decision = e.retry_decision();

                match decision {
                    RetryDecision::NoRetry => {
                        debug!(
                            operation = operation_name,
                            attempt = attempt,
                            "Operation failed with non-retryable error: {}",
                            e
                        );
                        return RetryOutcome {
                            result: Err(e),
                            retries: attempt,
                        };
                    }
                    RetryDecision::Retry | RetryDecision::RetryAfter(_) => {
                        if attempt >= config.max_retries {
                            warn!(
                                operation = operation_name,
                                attempts = attempt + 1,
                                "Operation failed after {} attempts: {}",
                                attempt + 1,
                                e
                            );
                            return RetryOutcome {
                                result: Err(e),
                                retries: attempt,
                            };
                        }

                        let backoff = match decision {
                            RetryDecision::RetryAfter(d) => d.min(config.max_backoff),
                            _ => config.backoff_duration(attempt),
                        };

                        warn!(
                            operation = operation_name,
                            attempt = attempt + 1,
                            max_attempts = config.max_retries + 1,
                            backoff_ms = backoff.as_millis() as u64,
                            "Retrying after error: {}",
                            e
                        );

                        sleep(backoff).await;
                        attempt += 1;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_duration() {
        let config = RetryConfig {
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(16),
            multiplier: 2.0,
            jitter: false,
            ..Default::default()
        };

        assert_eq!(config.backoff_duration(0), Duration::from_secs(1));
        assert_eq!(config.backoff_duration(1), Duration::from_secs(2));
        assert_eq!(config.backoff_duration(3), Duration::from_secs(8));
        assert_eq!(config.backoff_duration(6), Duration::from_secs(16));
    }

    #[test]
    fn test_jitter_never_exceeds_cap() {
        let config = RetryConfig {
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(4),
            multiplier: 2.0,
            jitter: true,
            ..Default::default()
        };

        let first = config.backoff_duration(0);
        assert!(first >= Duration::from_secs(1));
        assert!(first <= Duration::from_millis(1250));
        assert!(config.backoff_duration(5) <= Duration::from_secs(4));
    }

    #[test]
    fn test_from_backoff_config() {
        let config = RetryConfig::from(&BackoffConfig::default());
        assert_eq!(config.max_retries, 4);
        assert_eq!(config.initial_backoff, Duration::from_secs(1));
        assert_eq!(config.max_backoff, Duration::from_secs(16));
    }

    #[derive(Debug)]
    struct TestError {
        retryable: bool,
    }

    impl std::fmt::Display for TestError {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "TestError(retryable={})", self.retryable)
        }
    }

    impl RetryableError for TestError {
        fn retry_decision(&self) -> RetryDecision {
            if self.retryable {
                RetryDecision::RetryAfter(Duration::from_secs(3600))
            } else {
                RetryDecision::NoRetry
            }
        }
    }

    #[tokio::test]
    async fn test_retry_succeeds_eventually() {
        let config = RetryConfig::quick();

        let outcome: RetryOutcome<&str, TestError> = with_retry(&config, "test", |attempt| async move {
            if attempt < 2 {
                Err(TestError { retryable: true })
            } else {
                Ok("success")
            }
        })
        .await;

        // The hour-long retry-after hint is capped by max_backoff
        assert_eq!(outcome.result.unwrap(), "success");
        assert_eq!(outcome.retries, 2);
    }

    #[tokio::test]
    async fn test_retry_gives_up() {
        let config = RetryConfig {
            max_retries: 2,
            ..RetryConfig::quick()
        };
        let mut calls = 0;

        let outcome: RetryOutcome<&str, TestError> = with_retry(&config, "test", |_| {
            calls += 1;
            async move { Err(TestError { retryable: true }) }
        })
        .await;

        assert!(outcome.result.is_err());
        assert_eq!(calls, 3);
        assert_eq!(outcome.retries, 2);
    }

    #[tokio::test]
    async fn test_no_retry_on_permanent_error() {
        let config = RetryConfig::quick();
        let mut calls = 0;

        let outcome: RetryOutcome<&str, TestError> = with_retry(&config, "test", |_| {
            calls += 1;
            async move { Err(TestError { retryable: false }) }
        })
        .await;

        assert!(outcome.result.is_err());
        assert_eq!(calls, 1);
    }
}
