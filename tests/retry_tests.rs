//! Retry handler tests

mod common;

use common::retry_config;
use pretty_assertions::assert_eq;
use resilience_core::error::{ApplicationError, ErrorCategory, ErrorCode};
use resilience_core::error_recovery::{CircuitBreaker, RetryConfig, RetryHandler};
use resilience_core::ResilienceError;
use rstest::rstest;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tokio::time::Instant;

#[rstest]
#[case(1, 1_000)]
#[case(2, 2_000)]
#[case(3, 4_000)]
#[case(6, 30_000)]
fn test_documented_delay_table(#[case] attempt: u32, #[case] expected_ms: u64) {
    let handler = RetryHandler::new(RetryConfig {
        jitter: false,
        ..Default::default()
    });
    assert_eq!(handler.calculate_delay(attempt), Duration::from_millis(expected_ms));
}

#[test]
fn test_jittered_delay_bounded_and_non_decreasing_cap() {
    let handler = RetryHandler::new(RetryConfig::default());
    for attempt in 1..=20 {
        let delay = handler.calculate_delay(attempt);
        assert!(delay <= Duration::from_secs(30), "attempt {attempt}: {delay:?}");
        assert!(delay > Duration::ZERO);
    }
}

#[tokio::test(start_paused = true)]
async fn test_zero_attempts_never_calls_operation() {
    let handler = RetryHandler::new(RetryConfig {
        max_attempts: 0,
        ..Default::default()
    });
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

#[tokio::test(start_paused = true)]
async fn test_retries_transient_errors_with_backoff() {
    let handler = RetryHandler::new(retry_config(4));
    let calls = AtomicU32::new(0);
    let started = Instant::now();

    let value = handler
        .execute(|| {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(ResilienceError::network("connection reset"))
                } else {
                    Ok(n)
                }
            }
        })
        .await
        .unwrap();

    assert_eq!(value, 2);
    // 100ms + 200ms of backoff
    assert!(started.elapsed() >= Duration::from_millis(300));

    let stats = handler.get_stats().await;
    assert_eq!(stats.successful_after_retry, 1);
    assert_eq!(stats.total_retry_attempts, 2);
}

#[tokio::test(start_paused = true)]
async fn test_stops_on_non_retryable_error() {
    let handler = RetryHandler::new(retry_config(5));
    let calls = AtomicU32::new(0);

    let err = handler
        .execute(|| async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err::<(), _>(ResilienceError::validation("amount must be positive"))
        })
        .await
        .unwrap_err();

    assert!(matches!(err, ResilienceError::Validation(_)));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(handler.get_stats().await.non_retryable_failures, 1);
}

#[tokio::test(start_paused = true)]
async fn test_exhausts_after_max_attempts() {
    let handler = RetryHandler::new(retry_config(3));
    let calls = AtomicU32::new(0);

    let err = handler
        .execute(|| async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err::<(), _>(ResilienceError::external_service("503"))
        })
        .await
        .unwrap_err();

    assert!(matches!(err, ResilienceError::ExternalService(_)));
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert_eq!(handler.get_stats().await.failed_after_retries, 1);
}

#[test]
fn test_retryability_rules() {
    let handler = RetryHandler::new(RetryConfig::default());

    let flagged: ResilienceError = ApplicationError::new(ErrorCode::BusinessRuleViolation, "locked")
        .retryable(true)
        .into();
    assert!(handler.is_retryable(&flagged));

    let by_category: ResilienceError = ApplicationError::new(ErrorCode::InternalError, "gateway")
        .with_category(ErrorCategory::ExternalService)
        .into();
    assert!(handler.is_retryable(&by_category));

    assert!(handler.is_retryable(&ResilienceError::database_connection_lost("gone")));
    assert!(!handler.is_retryable(&ResilienceError::authorization("forbidden")));
}

#[tokio::test(start_paused = true)]
async fn test_open_circuit_stops_retry_loop() {
    let breaker = CircuitBreaker::new("ledger", common::breaker_config(2, Duration::from_secs(60)));
    let handler = RetryHandler::new(retry_config(5));
    let calls = AtomicU32::new(0);

    let err = handler
        .execute(|| {
            breaker.execute(|| async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(ResilienceError::network("timeout"))
            })
        })
        .await
        .unwrap_err();

    assert!(err.is_circuit_open());
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}
