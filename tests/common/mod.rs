//! Shared fixtures for integration tests
//!
//! Each test binary uses a different subset of these helpers.
#![allow(dead_code)]

use chrono::Utc;
use resilience_core::dead_letter::{DeadLetterConfig, DeadLetterJob};
use resilience_core::error_recovery::{
    CircuitBreakerConfig, FallbackConfig, RecoveryManagerConfig, RetryConfig,
    ServiceResilienceConfig,
};
use rstest::fixture;
use std::time::Duration;
use uuid::Uuid;

/// Breaker opening after `threshold` failures and probing after `recovery`
pub fn breaker_config(threshold: u32, recovery: Duration) -> CircuitBreakerConfig {
    CircuitBreakerConfig {
        failure_threshold: threshold,
        success_threshold: 1,
        recovery_timeout: recovery,
        ..Default::default()
    }
}

/// Deterministic retry configuration
pub fn retry_config(max_attempts: u32) -> RetryConfig {
    RetryConfig {
        max_attempts,
        base_delay: Duration::from_millis(100),
        max_delay: Duration::from_secs(2),
        jitter: false,
        ..Default::default()
    }
}

#[fixture]
pub fn manager_config() -> RecoveryManagerConfig {
    RecoveryManagerConfig {
        defaults: ServiceResilienceConfig {
            circuit_breaker: breaker_config(3, Duration::from_secs(60)),
            retry: retry_config(3),
            fallback: FallbackConfig::default(),
        },
    }
}

#[fixture]
pub fn dead_letter_config() -> DeadLetterConfig {
    DeadLetterConfig {
        max_retry_attempts: 3,
        base_retry_delay: Duration::from_secs(10),
        max_retry_delay: Duration::from_secs(600),
        jitter: false,
        ..Default::default()
    }
}

/// A job that is due now
pub fn due_job(job_type: &str, priority: i32) -> DeadLetterJob {
    let now = Utc::now();
    DeadLetterJob {
        id: Uuid::new_v4(),
        original_job_id: format!("orig-{}", Uuid::new_v4()),
        job_type: job_type.to_string(),
        job_data: serde_json::json!({}),
        failure_reason: "NETWORK_ERROR".to_string(),
        error_message: "connection reset".to_string(),
        retry_count: 0,
        max_retries: 3,
        first_failed_at: now,
        last_failed_at: now,
        next_retry_at: now - chrono::Duration::seconds(1),
        priority,
        company_id: None,
        recovery_attempts: 0,
        auto_recovery_enabled: true,
        metadata: serde_json::json!({ "error_category": "network" }),
        created_at: now,
        updated_at: now,
    }
}
