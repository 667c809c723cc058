//! Pluggable recovery strategies for the live recovery path
//!
//! Strategies run after the breaker, retry and fallback layers have all
//! failed. The manager walks them in registration order and stops at the
//! first one that reports `recovered`.

use crate::error::{ErrorCategory, ErrorCode, ResilienceError, Result};
use futures::future::BoxFuture;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Shared async callable injected into strategies
pub type AsyncCallback<T> = Arc<dyn Fn() -> BoxFuture<'static, Result<T>> + Send + Sync>;

/// Wrap a closure into an [`AsyncCallback`]
pub fn async_callback<F, Fut, T>(f: F) -> AsyncCallback<T>
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T>> + Send + 'static,
{
    Arc::new(move || f().boxed())
}

/// Caller-supplied information about the operation being recovered
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RecoveryContext {
    pub service: String,
    pub operation_type: Option<String>,
    pub company_id: Option<String>,
    pub user_id: Option<String>,
    pub request_id: Option<String>,
    pub metadata: HashMap<String, serde_json::Value>,
}

impl RecoveryContext {
    pub fn new(operation_type: impl Into<String>) -> Self {
        Self {
            operation_type: Some(operation_type.into()),
            ..Default::default()
        }
    }

    pub fn with_company(mut self, company_id: impl Into<String>) -> Self {
        self.company_id = Some(company_id.into());
        self
    }

    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// Outcome of one recovery attempt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoveryResult {
    /// The strategy itself ran without internal error
    pub success: bool,
    /// The failure was repaired
    pub recovered: bool,
    /// Substitute value for the failed operation, if the strategy produced one
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
    pub action: String,
    #[serde(with = "humantime_serde")]
    pub duration: Duration,
    pub attempts: u32,
}

impl RecoveryResult {
    pub fn recovered(action: impl Into<String>) -> Self {
        Self {
            success: true,
            recovered: true,
            result: None,
            error: None,
            action: action.into(),
            duration: Duration::ZERO,
            attempts: 1,
        }
    }

    pub fn not_recovered(action: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            success: true,
            recovered: false,
            result: None,
            error: Some(error.into()),
            action: action.into(),
            duration: Duration::ZERO,
            attempts: 1,
        }
    }

    pub fn failed(action: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            success: false,
            ..Self::not_recovered(action, error)
        }
    }

    pub fn with_result(mut self, value: serde_json::Value) -> Self {
        self.result = Some(value);
        self
    }

    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts;
        self
    }

    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration = duration;
        self
    }
}

/// Recovery strategy for live-path failures
#[async_trait::async_trait]
pub trait RecoveryStrategy: Send + Sync {
    fn name(&self) -> &str;

    /// Structural match on the error, typically by category or retryability
    fn can_handle(&self, error: &ResilienceError) -> bool;

    async fn execute(&self, error: &ResilienceError, context: &RecoveryContext) -> RecoveryResult;
}

/// Re-establishes a database connection after a connection-class failure
pub struct DatabaseReconnectionStrategy {
    reconnect: AsyncCallback<()>,
    max_attempts: u32,
    retry_delay: Duration,
}

impl DatabaseReconnectionStrategy {
    pub fn new(reconnect: AsyncCallback<()>) -> Self {
        Self {
            reconnect,
            max_attempts: 3,
            retry_delay: Duration::from_secs(1),
        }
    }

    pub fn with_attempts(mut self, max_attempts: u32, retry_delay: Duration) -> Self {
        self.max_attempts = max_attempts.max(1);
        self.retry_delay = retry_delay;
        self
    }
}

#[async_trait::async_trait]
impl RecoveryStrategy for DatabaseReconnectionStrategy {
    fn name(&self) -> &str {
        "database_reconnection"
    }

    fn can_handle(&self, error: &ResilienceError) -> bool {
        error.category() == ErrorCategory::Database
            && (error.code() == ErrorCode::DatabaseConnectionLost || error.is_retryable())
    }

    async fn execute(&self, error: &ResilienceError, context: &RecoveryContext) -> RecoveryResult {
        let started = Instant::now();
        let mut last_error = error.to_string();

        for attempt in 1..=self.max_attempts {
            match (self.reconnect)().await {
                Ok(()) => {
                    info!(
                        event = "recovery.database_reconnected",
                        service = %context.service,
                        attempt,
                        "Database connection re-established"
                    );
                    return RecoveryResult::recovered("database_reconnected")
                        .with_attempts(attempt)
                        .with_duration(started.elapsed());
                }
                Err(e) => {
                    debug!(service = %context.service, attempt, error = %e, "Reconnect attempt failed");
                    last_error = e.to_string();
                    if attempt < self.max_attempts {
                        tokio::time::sleep(self.retry_delay).await;
                    }
                }
            }
        }

        warn!(
            service = %context.service,
            attempts = self.max_attempts,
            "Database reconnection failed"
        );
        RecoveryResult::not_recovered("database_reconnect_failed", last_error)
            .with_attempts(self.max_attempts)
            .with_duration(started.elapsed())
    }
}

/// Checks whether a failing external dependency is healthy again
pub struct ExternalServiceHealthCheckStrategy {
    health_check: AsyncCallback<bool>,
}

impl ExternalServiceHealthCheckStrategy {
    pub fn new(health_check: AsyncCallback<bool>) -> Self {
        Self { health_check }
    }
}

#[async_trait::async_trait]
impl RecoveryStrategy for ExternalServiceHealthCheckStrategy {
    fn name(&self) -> &str {
        "external_service_health_check"
    }

    fn can_handle(&self, error: &ResilienceError) -> bool {
        matches!(
            error.category(),
            ErrorCategory::ExternalService | ErrorCategory::Network
        ) && error.is_retryable()
    }

    async fn execute(&self, _error: &ResilienceError, context: &RecoveryContext) -> RecoveryResult {
        let started = Instant::now();
        match (self.health_check)().await {
            Ok(true) => {
                info!(
                    event = "recovery.service_healthy",
                    service = %context.service,
                    "External service reports healthy"
                );
                RecoveryResult::recovered("service_healthy").with_duration(started.elapsed())
            }
            Ok(false) => RecoveryResult::not_recovered("service_unhealthy", "health check reported unhealthy")
                .with_duration(started.elapsed()),
            Err(e) => {
                warn!(service = %context.service, error = %e, "Health check failed");
                RecoveryResult::failed("health_check_error", e.to_string()).with_duration(started.elapsed())
            }
        }
    }
}
