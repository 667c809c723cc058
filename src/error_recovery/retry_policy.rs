//! Retry handler with exponential backoff and jitter
//!
//! The handler re-runs an operation while it fails with a retryable error,
//! sleeping between attempts according to the shared backoff function. It knows
//! nothing about circuit state; compose it around a breaker when needed.

use super::backoff::{self, BackoffParams};
use crate::error::{ErrorCategory, ErrorCode, ResilienceError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::sleep;
use tracing::{debug, info, warn};

/// Retry configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Total attempts including the first call; must be at least 1
    pub max_attempts: u32,
    #[serde(with = "humantime_serde")]
    pub base_delay: Duration,
    #[serde(with = "humantime_serde")]
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
    pub jitter: bool,
    /// Error codes that are retried
    pub retryable_errors: HashSet<ErrorCode>,
    /// Error categories that are retried
    pub retryable_categories: HashSet<ErrorCategory>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            jitter: true,
            retryable_errors: [
                ErrorCode::NetworkError,
                ErrorCode::ConnectionTimeout,
                ErrorCode::ConnectionRefused,
                ErrorCode::DatabaseConnectionLost,
                ErrorCode::ExternalServiceTimeout,
                ErrorCode::ServiceUnavailable,
                ErrorCode::RateLimitExceeded,
            ]
            .into_iter()
            .collect(),
            retryable_categories: [ErrorCategory::Network, ErrorCategory::ExternalService]
                .into_iter()
                .collect(),
        }
    }
}

impl RetryConfig {
    /// Configuration for latency-sensitive calls
    pub fn critical() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
            backoff_multiplier: 1.5,
            ..Default::default()
        }
    }

    /// Configuration for background work that can wait
    pub fn background() -> Self {
        Self {
            max_attempts: 10,
            base_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(300),
            ..Default::default()
        }
    }

    /// Backoff parameters derived from this configuration
    pub fn backoff(&self) -> BackoffParams {
        BackoffParams {
            base_delay: self.base_delay,
            max_delay: self.max_delay,
            multiplier: self.backoff_multiplier,
            jitter: self.jitter,
        }
    }
}

/// Retry statistics
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RetryStats {
    /// Total operations executed
    pub total_operations: u64,
    /// Operations that succeeded on first attempt
    pub successful_first_attempt: u64,
    /// Operations that succeeded after retry
    pub successful_after_retry: u64,
    /// Operations that failed after exhausting all attempts
    pub failed_after_retries: u64,
    /// Operations that stopped on a non-retryable error
    pub non_retryable_failures: u64,
    /// Total retry attempts across all operations
    pub total_retry_attempts: u64,
    /// Last retry timestamp
    pub last_retry: Option<DateTime<Utc>>,
}

/// Retry handler
pub struct RetryHandler {
    config: RetryConfig,
    label: String,
    stats: Arc<RwLock<RetryStats>>,
}

impl RetryHandler {
    pub fn new(config: RetryConfig) -> Self {
        Self {
            config,
            label: "default".to_string(),
            stats: Arc::new(RwLock::new(RetryStats::default())),
        }
    }

    /// Name used in log events, usually the service key
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Delay to wait after failed attempt `attempt` (1-indexed)
    pub fn calculate_delay(&self, attempt: u32) -> Duration {
        backoff::calculate_delay(attempt, &self.config.backoff())
    }

    /// Whether `error` qualifies for another attempt.
    ///
    /// A circuit-open rejection never does.
    pub fn is_retryable(&self, error: &ResilienceError) -> bool {
        if error.is_circuit_open() {
            return false;
        }

        let explicit = match error {
            ResilienceError::Application(app) => app.retryable == Some(true),
            ResilienceError::Http(_) => error.is_retryable(),
            _ => false,
        };

        explicit
            || self.config.retryable_errors.contains(&error.code())
            || self.config.retryable_categories.contains(&error.category())
    }

    /// Execute operation with retries.
    ///
    /// Fails with [`ResilienceError::InvalidRetryConfig`] without calling
    /// `operation` when `max_attempts` is 0.
    pub async fn execute<F, Fut, T>(&self, mut operation: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        if self.config.max_attempts == 0 {
            return Err(ResilienceError::InvalidRetryConfig(
                "max_attempts must be at least 1".to_string(),
            ));
        }

        self.stats.write().await.total_operations += 1;

        let mut attempt = 1;
        loop {
            match operation().await {
                Ok(result) => {
                    let mut stats = self.stats.write().await;
                    if attempt == 1 {
                        stats.successful_first_attempt += 1;
                    } else {
                        stats.successful_after_retry += 1;
                        info!(
                            event = "retry.succeeded",
                            service = %self.label,
                            attempt,
                            "Operation succeeded after {} attempts",
                            attempt
                        );
                    }
                    return Ok(result);
                }
                Err(error) => {
                    if !self.is_retryable(&error) {
                        self.stats.write().await.non_retryable_failures += 1;
                        debug!(
                            event = "retry.not_retryable",
                            service = %self.label,
                            attempt,
                            error = %error,
                            "Error not retryable"
                        );
                        return Err(error);
                    }

                    if attempt >= self.config.max_attempts {
                        self.stats.write().await.failed_after_retries += 1;
                        warn!(
                            event = "retry.exhausted",
                            service = %self.label,
                            attempts = attempt,
                            error = %error,
                            "Operation failed after {} attempts",
                            attempt
                        );
                        return Err(error);
                    }

                    let delay = self.calculate_delay(attempt);
                    {
                        let mut stats = self.stats.write().await;
                        stats.total_retry_attempts += 1;
                        stats.last_retry = Some(Utc::now());
                    }

                    warn!(
                        event = "retry.scheduled",
                        service = %self.label,
                        attempt,
                        max_attempts = self.config.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %error,
                        "Retrying after failure"
                    );

                    sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }

    /// Get retry statistics
    pub async fn get_stats(&self) -> RetryStats {
        self.stats.read().await.clone()
    }

    /// Reset statistics
    pub async fn reset_stats(&self) {
        *self.stats.write().await = RetryStats::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ApplicationError;
    use crate::error_recovery::circuit_breaker::CircuitState;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_config(max_attempts: u32) -> RetryConfig {
        RetryConfig {
            max_attempts,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(1),
            jitter: false,
            ..Default::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_until_success() {
        let handler = RetryHandler::new(fast_config(3));
        let calls = AtomicU32::new(0);

        let started = tokio::time::Instant::now();
        let result = handler
            .execute(|| async {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                if n < 3 {
                    Err(ResilienceError::network("flaky"))
                } else {
                    Ok(n)
                }
            })
            .await;

        assert_eq!(result.unwrap(), 3);
        // 100ms after attempt 1, 200ms after attempt 2
        assert!(started.elapsed() >= Duration::from_millis(300));

        let stats = handler.get_stats().await;
        assert_eq!(stats.successful_after_retry, 1);
        assert_eq!(stats.total_retry_attempts, 2);
        assert!(stats.last_retry.is_some());
    }

    #[tokio::test]
    async fn test_zero_attempts_is_config_error() {
        let handler = RetryHandler::new(fast_config(0));
        let calls = AtomicU32::new(0);

        let err = handler
            .execute(|| async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .await
            .unwrap_err();

        assert!(matches!(err, ResilienceError::InvalidRetryConfig(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_non_retryable_fails_fast() {
        let handler = RetryHandler::new(fast_config(5));
        let calls = AtomicU32::new(0);

        let err = handler
            .execute(|| async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(ResilienceError::validation("missing field"))
            })
            .await
            .unwrap_err();

        assert!(matches!(err, ResilienceError::Validation(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(handler.get_stats().await.non_retryable_failures, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausts_attempts() {
        let handler = RetryHandler::new(fast_config(4));
        let calls = AtomicU32::new(0);

        let err = handler
            .execute(|| async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(ResilienceError::timeout("upstream"))
            })
            .await
            .unwrap_err();

        assert!(matches!(err, ResilienceError::Timeout(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert_eq!(handler.get_stats().await.failed_after_retries, 1);
    }

    #[test]
    fn test_retryable_classification() {
        let handler = RetryHandler::new(RetryConfig::default());

        assert!(handler.is_retryable(&ResilienceError::network("reset")));
        assert!(handler.is_retryable(&ResilienceError::database_connection_lost("gone")));
        assert!(!handler.is_retryable(&ResilienceError::database("constraint")));
        assert!(!handler.is_retryable(&ResilienceError::authorization("nope")));

        let flagged: ResilienceError = ApplicationError::new(ErrorCode::BusinessRuleViolation, "lock held")
            .retryable(true)
            .into();
        assert!(handler.is_retryable(&flagged));

        let by_category: ResilienceError = ApplicationError::new(ErrorCode::InternalError, "bad gateway")
            .with_category(ErrorCategory::ExternalService)
            .into();
        assert!(handler.is_retryable(&by_category));

        let open = ResilienceError::CircuitOpen {
            circuit: "db".to_string(),
            state: CircuitState::Open,
            failure_count: 5,
            next_attempt: None,
        };
        assert!(!handler.is_retryable(&open));
    }

    #[test]
    fn test_delay_follows_backoff() {
        let handler = RetryHandler::new(RetryConfig {
            jitter: false,
            ..Default::default()
        });
        assert_eq!(handler.calculate_delay(1), Duration::from_secs(1));
        assert_eq!(handler.calculate_delay(3), Duration::from_secs(4));
        assert_eq!(handler.calculate_delay(6), Duration::from_secs(30));
    }
}
