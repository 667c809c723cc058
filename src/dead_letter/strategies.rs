//! Job-type specific recovery strategies for dead-lettered jobs
//!
//! Each strategy decides from the job type and the recorded error category
//! whether it applies, prepares the dependency where that makes sense, and
//! replays the job through an injected [`JobReplayer`].

use super::models::DeadLetterJob;
use crate::error::{ErrorCategory, Result};
use crate::error_recovery::strategies::{AsyncCallback, RecoveryResult};
use futures::future::BoxFuture;
use futures::FutureExt;
use std::future::Future;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Re-executes the business operation behind a dead-lettered job
#[async_trait::async_trait]
pub trait JobReplayer: Send + Sync {
    async fn replay(&self, job: &DeadLetterJob) -> Result<()>;
}

type ReplayFn = dyn Fn(DeadLetterJob) -> BoxFuture<'static, Result<()>> + Send + Sync;

/// [`JobReplayer`] backed by a closure
pub struct FnReplayer {
    replay: Box<ReplayFn>,
}

#[async_trait::async_trait]
impl JobReplayer for FnReplayer {
    async fn replay(&self, job: &DeadLetterJob) -> Result<()> {
        (self.replay)(job.clone()).await
    }
}

/// Build a shared replayer from a closure receiving an owned copy of the job
pub fn replay_with<F, Fut>(f: F) -> Arc<dyn JobReplayer>
where
    F: Fn(DeadLetterJob) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    Arc::new(FnReplayer {
        replay: Box::new(move |job| f(job).boxed()),
    })
}

/// Recovery strategy for the dead-letter path
#[async_trait::async_trait]
pub trait DeadLetterStrategy: Send + Sync {
    fn name(&self) -> &str;

    fn can_handle(&self, job: &DeadLetterJob) -> bool;

    async fn execute(&self, job: &DeadLetterJob) -> RecoveryResult;
}

async fn replay(
    replayer: &dyn JobReplayer,
    job: &DeadLetterJob,
    action: &str,
    started: Instant,
) -> RecoveryResult {
    match replayer.replay(job).await {
        Ok(()) => RecoveryResult::recovered(action).with_duration(started.elapsed()),
        Err(e) => {
            debug!(job_id = %job.id, error = %e, "Replay failed");
            RecoveryResult::not_recovered(format!("{action}_failed"), e.to_string())
                .with_duration(started.elapsed())
        }
    }
}

/// Re-processes failed webhook deliveries (`webhook*` job types)
pub struct WebhookRetryStrategy {
    replayer: Arc<dyn JobReplayer>,
}

impl WebhookRetryStrategy {
    pub fn new(replayer: Arc<dyn JobReplayer>) -> Self {
        Self { replayer }
    }
}

#[async_trait::async_trait]
impl DeadLetterStrategy for WebhookRetryStrategy {
    fn name(&self) -> &str {
        "webhook_retry"
    }

    fn can_handle(&self, job: &DeadLetterJob) -> bool {
        job.job_type.starts_with("webhook")
    }

    async fn execute(&self, job: &DeadLetterJob) -> RecoveryResult {
        info!(job_id = %job.id, job_type = %job.job_type, "Replaying webhook job");
        replay(self.replayer.as_ref(), job, "webhook_replayed", Instant::now()).await
    }
}

/// Reconnects to the database, then replays (`database*` job types or database errors)
pub struct DatabaseRetryStrategy {
    reconnect: AsyncCallback<()>,
    replayer: Arc<dyn JobReplayer>,
}

impl DatabaseRetryStrategy {
    pub fn new(reconnect: AsyncCallback<()>, replayer: Arc<dyn JobReplayer>) -> Self {
        Self {
            reconnect,
            replayer,
        }
    }
}

#[async_trait::async_trait]
impl DeadLetterStrategy for DatabaseRetryStrategy {
    fn name(&self) -> &str {
        "database_retry"
    }

    fn can_handle(&self, job: &DeadLetterJob) -> bool {
        job.error_category() == Some(ErrorCategory::Database) || job.job_type.starts_with("database")
    }

    async fn execute(&self, job: &DeadLetterJob) -> RecoveryResult {
        let started = Instant::now();
        if let Err(e) = (self.reconnect)().await {
            warn!(job_id = %job.id, error = %e, "Database still unreachable");
            return RecoveryResult::not_recovered("database_reconnect_failed", e.to_string())
                .with_duration(started.elapsed());
        }
        replay(self.replayer.as_ref(), job, "database_replayed", started).await
    }
}

/// Health-checks the external API, then replays
/// (`external_api*` job types or network / external-service errors)
pub struct ExternalApiRetryStrategy {
    health_check: Option<AsyncCallback<bool>>,
    replayer: Arc<dyn JobReplayer>,
}

impl ExternalApiRetryStrategy {
    pub fn new(replayer: Arc<dyn JobReplayer>) -> Self {
        Self {
            health_check: None,
            replayer,
        }
    }

    pub fn with_health_check(mut self, health_check: AsyncCallback<bool>) -> Self {
        self.health_check = Some(health_check);
        self
    }
}

#[async_trait::async_trait]
impl DeadLetterStrategy for ExternalApiRetryStrategy {
    fn name(&self) -> &str {
        "external_api_retry"
    }

    fn can_handle(&self, job: &DeadLetterJob) -> bool {
        matches!(
            job.error_category(),
            Some(ErrorCategory::Network) | Some(ErrorCategory::ExternalService)
        ) || job.job_type.starts_with("external_api")
    }

    async fn execute(&self, job: &DeadLetterJob) -> RecoveryResult {
        let started = Instant::now();
        if let Some(health_check) = &self.health_check {
            match health_check().await {
                Ok(true) => {}
                Ok(false) => {
                    return RecoveryResult::not_recovered("service_unhealthy", "health check reported unhealthy")
                        .with_duration(started.elapsed());
                }
                Err(e) => {
                    return RecoveryResult::failed("health_check_error", e.to_string())
                        .with_duration(started.elapsed());
                }
            }
        }
        replay(self.replayer.as_ref(), job, "external_api_replayed", started).await
    }
}
