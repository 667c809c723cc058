//! Persisted dead-letter queue with batch recovery
//!
//! Jobs whose own processing loop gave up are stored with a next-attempt time.
//! [`DeadLetterQueueService::process_jobs`] periodically picks up due jobs in
//! priority order and hands each to the first registered strategy that claims
//! it. Failed attempts are rescheduled with exponential backoff until the
//! job's retry budget is spent, after which only a manual
//! [`retry_job`](DeadLetterQueueService::retry_job) will run it again.
//!
//! The `processing` flag only prevents overlapping batches inside this
//! process. Several processes sharing one database can pick up the same job.

use super::models::{
    AddJobOptions, DeadLetterJob, DeadLetterStats, JobFilter, JobRecoveryOutcome, ProcessOptions,
    ProcessSummary, StatsFilter,
};
use super::strategies::DeadLetterStrategy;
use crate::error::{ErrorReporter, ResilienceError, Result};
use crate::error_recovery::backoff::{calculate_delay, BackoffParams};
use crate::storage::DeadLetterStore;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

const CLEANUP_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);

/// Dead-letter queue configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeadLetterConfig {
    pub max_retry_attempts: u32,
    #[serde(with = "humantime_serde")]
    pub base_retry_delay: Duration,
    #[serde(with = "humantime_serde")]
    pub max_retry_delay: Duration,
    pub backoff_multiplier: f64,
    pub jitter: bool,
    pub recovery_batch_size: usize,
    pub retention_days: u32,
    #[serde(with = "humantime_serde")]
    pub processing_interval: Duration,
}

impl Default for DeadLetterConfig {
    fn default() -> Self {
        Self {
            max_retry_attempts: 5,
            base_retry_delay: Duration::from_secs(60),
            max_retry_delay: Duration::from_secs(3600),
            backoff_multiplier: 2.0,
            jitter: true,
            recovery_batch_size: 10,
            retention_days: 30,
            processing_interval: Duration::from_secs(300),
        }
    }
}

impl DeadLetterConfig {
    fn backoff(&self) -> BackoffParams {
        BackoffParams {
            base_delay: self.base_retry_delay,
            max_delay: self.max_retry_delay,
            multiplier: self.backoff_multiplier,
            jitter: self.jitter,
        }
    }
}

/// Clears the processing flag when a batch ends, including on early return
struct ProcessingGuard<'a>(&'a AtomicBool);

impl Drop for ProcessingGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

#[derive(Default)]
struct Counters {
    processed: AtomicU64,
    recovered: AtomicU64,
    failed: AtomicU64,
}

/// Dead-letter queue service
pub struct DeadLetterQueueService {
    store: Arc<dyn DeadLetterStore>,
    config: DeadLetterConfig,
    strategies: RwLock<Vec<Arc<dyn DeadLetterStrategy>>>,
    processing: AtomicBool,
    counters: Counters,
}

impl DeadLetterQueueService {
    pub fn new(store: Arc<dyn DeadLetterStore>, config: DeadLetterConfig) -> Self {
        Self {
            store,
            config,
            strategies: RwLock::new(Vec::new()),
            processing: AtomicBool::new(false),
            counters: Counters::default(),
        }
    }

    pub fn config(&self) -> &DeadLetterConfig {
        &self.config
    }

    /// Append a strategy; earlier registrations are tried first
    pub async fn register_strategy(&self, strategy: Arc<dyn DeadLetterStrategy>) {
        info!(strategy = strategy.name(), "Registered dead-letter strategy");
        self.strategies.write().await.push(strategy);
    }

    fn next_retry_at(&self, now: DateTime<Utc>, retry_count: u32) -> DateTime<Utc> {
        let delay = calculate_delay(retry_count.saturating_add(1), &self.config.backoff());
        chrono::Duration::from_std(delay)
            .map(|d| now + d)
            .unwrap_or(now)
    }

    /// Durably enqueue a job that exhausted its own retries
    pub async fn add_job(
        &self,
        original_job_id: impl Into<String>,
        job_type: impl Into<String>,
        job_data: serde_json::Value,
        error: &ResilienceError,
        options: AddJobOptions,
    ) -> Result<Uuid> {
        let now = Utc::now();
        let mut metadata = options.metadata;
        metadata.extend(ErrorReporter::error_metadata(error));

        let job = DeadLetterJob {
            id: Uuid::new_v4(),
            original_job_id: original_job_id.into(),
            job_type: job_type.into(),
            job_data,
            failure_reason: error.code().as_str().to_string(),
            error_message: error.to_string(),
            retry_count: 0,
            max_retries: options.max_retries.unwrap_or(self.config.max_retry_attempts),
            first_failed_at: now,
            last_failed_at: now,
            next_retry_at: self.next_retry_at(now, 0),
            priority: options.priority,
            company_id: options.company_id,
            recovery_attempts: 0,
            auto_recovery_enabled: true,
            metadata: serde_json::Value::Object(metadata),
            created_at: now,
            updated_at: now,
        };

        self.store.insert_job(&job).await?;

        info!(
            event = "dead_letter.job_added",
            job_id = %job.id,
            original_job_id = %job.original_job_id,
            job_type = %job.job_type,
            failure_reason = %job.failure_reason,
            next_retry_at = %job.next_retry_at,
            "Job moved to dead-letter queue"
        );
        Ok(job.id)
    }

    /// Run one batch of due jobs.
    ///
    /// Returns immediately with `skipped = true` when another batch is
    /// already running in this process.
    pub async fn process_jobs(&self, options: ProcessOptions) -> Result<ProcessSummary> {
        if self
            .processing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("Dead-letter batch already running, skipping");
            return Ok(ProcessSummary {
                skipped: true,
                ..Default::default()
            });
        }
        let _guard = ProcessingGuard(&self.processing);

        let batch_size = options.batch_size.unwrap_or(self.config.recovery_batch_size);
        let jobs = self.store.fetch_pending(Utc::now(), batch_size).await?;
        if jobs.is_empty() {
            debug!("No dead-letter jobs due");
            return Ok(ProcessSummary::default());
        }

        info!(
            event = "dead_letter.batch_started",
            jobs = jobs.len(),
            "Processing dead-letter batch"
        );

        let mut summary = ProcessSummary::default();
        for job in jobs {
            let job_id = job.id;
            summary.processed += 1;
            match self.recover_job(job).await {
                Ok(outcome) if outcome.is_recovered() => summary.recovered += 1,
                Ok(_) => summary.failed += 1,
                Err(e) => {
                    error!(job_id = %job_id, error = %e, "Dead-letter bookkeeping failed");
                    summary.failed += 1;
                }
            }
        }

        info!(
            event = "dead_letter.batch_completed",
            processed = summary.processed,
            recovered = summary.recovered,
            failed = summary.failed,
            "Dead-letter batch finished"
        );
        Ok(summary)
    }

    /// Reset a job's retry budget and attempt it now, regardless of state
    pub async fn retry_job(&self, job_id: Uuid) -> Result<JobRecoveryOutcome> {
        let mut job = self
            .store
            .get_job(job_id)
            .await?
            .ok_or_else(|| ResilienceError::not_found(format!("dead-letter job {job_id}")))?;

        let now = Utc::now();
        job.retry_count = 0;
        job.auto_recovery_enabled = true;
        job.next_retry_at = now;
        job.updated_at = now;
        self.store.update_job(&job).await?;

        info!(event = "dead_letter.manual_retry", job_id = %job_id, "Manual retry requested");
        self.recover_job(job).await
    }

    async fn recover_job(&self, mut job: DeadLetterJob) -> Result<JobRecoveryOutcome> {
        self.counters.processed.fetch_add(1, Ordering::Relaxed);
        let strategies = self.strategies.read().await.clone();

        let mut last_error = None;
        for strategy in strategies.iter().filter(|s| s.can_handle(&job)) {
            let result = strategy.execute(&job).await;
            if result.recovered {
                self.store.delete_job(job.id).await?;
                self.counters.recovered.fetch_add(1, Ordering::Relaxed);
                info!(
                    event = "dead_letter.job_recovered",
                    job_id = %job.id,
                    job_type = %job.job_type,
                    strategy = strategy.name(),
                    retry_count = job.retry_count,
                    "Dead-letter job recovered"
                );
                return Ok(JobRecoveryOutcome::Recovered {
                    strategy: strategy.name().to_string(),
                });
            }

            debug!(
                job_id = %job.id,
                strategy = strategy.name(),
                action = %result.action,
                "Strategy did not recover job"
            );
            last_error = result.error.or(Some(result.action));
        }

        self.counters.failed.fetch_add(1, Ordering::Relaxed);

        let now = Utc::now();
        job.retry_count += 1;
        job.recovery_attempts += 1;
        job.last_failed_at = now;
        job.updated_at = now;
        if let serde_json::Value::Object(map) = &mut job.metadata {
            map.insert(
                "last_recovery_error".to_string(),
                last_error
                    .clone()
                    .map(serde_json::Value::String)
                    .unwrap_or_else(|| serde_json::Value::String("no matching strategy".to_string())),
            );
        }

        let outcome = if job.is_exhausted() {
            job.auto_recovery_enabled = false;
            warn!(
                event = "dead_letter.job_exhausted",
                job_id = %job.id,
                job_type = %job.job_type,
                retry_count = job.retry_count,
                "Dead-letter job exhausted its retries, auto recovery disabled"
            );
            JobRecoveryOutcome::Exhausted {
                retry_count: job.retry_count,
            }
        } else {
            job.next_retry_at = self.next_retry_at(now, job.retry_count);
            info!(
                event = "dead_letter.job_rescheduled",
                job_id = %job.id,
                retry_count = job.retry_count,
                next_retry_at = %job.next_retry_at,
                error = ?last_error,
                "Dead-letter job rescheduled"
            );
            JobRecoveryOutcome::Rescheduled {
                retry_count: job.retry_count,
                next_retry_at: job.next_retry_at,
            }
        };

        self.store.update_job(&job).await?;
        Ok(outcome)
    }

    /// Delete jobs older than the retention period
    pub async fn cleanup(&self) -> Result<u64> {
        let cutoff = Utc::now() - chrono::Duration::days(i64::from(self.config.retention_days));
        let removed = self.store.delete_older_than(cutoff).await?;
        info!(
            event = "dead_letter.cleanup",
            removed,
            retention_days = self.config.retention_days,
            "Removed expired dead-letter jobs"
        );
        Ok(removed)
    }

    /// Queue statistics, optionally scoped by tenant or job type
    pub async fn get_stats(&self, filter: StatsFilter) -> Result<DeadLetterStats> {
        let store_stats = self.store.stats(&filter, Utc::now()).await?;
        let processed = self.counters.processed.load(Ordering::Relaxed);
        let recovered = self.counters.recovered.load(Ordering::Relaxed);

        Ok(DeadLetterStats {
            total: store_stats.total,
            pending: store_stats.pending,
            scheduled: store_stats.scheduled,
            exhausted: store_stats.exhausted,
            by_job_type: store_stats.by_job_type,
            average_retry_count: store_stats.average_retry_count,
            oldest_failed_at: store_stats.oldest_failed_at,
            processed_since_start: processed,
            recovered_since_start: recovered,
            failed_since_start: self.counters.failed.load(Ordering::Relaxed),
            recovery_rate: if processed == 0 {
                0.0
            } else {
                recovered as f64 / processed as f64
            },
        })
    }

    pub async fn get_job(&self, job_id: Uuid) -> Result<Option<DeadLetterJob>> {
        self.store.get_job(job_id).await
    }

    pub async fn list_jobs(&self, filter: JobFilter) -> Result<Vec<DeadLetterJob>> {
        self.store.list_jobs(&filter).await
    }

    pub fn is_processing(&self) -> bool {
        self.processing.load(Ordering::Acquire)
    }

    /// Run batches every `interval` and cleanup once a day until `shutdown` fires
    pub fn spawn_processor(
        self: Arc<Self>,
        interval: Duration,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            let mut last_cleanup = tokio::time::Instant::now();

            info!(interval_ms = interval.as_millis() as u64, "Dead-letter processor started");
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        info!("Dead-letter processor stopping");
                        break;
                    }
                    _ = ticker.tick() => {
                        if let Err(e) = self.process_jobs(ProcessOptions::default()).await {
                            error!(error = %e, "Dead-letter batch failed");
                        }
                        if last_cleanup.elapsed() >= CLEANUP_INTERVAL {
                            if let Err(e) = self.cleanup().await {
                                error!(error = %e, "Dead-letter cleanup failed");
                            }
                            last_cleanup = tokio::time::Instant::now();
                        }
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dead_letter::strategies::{replay_with, WebhookRetryStrategy};
    use crate::storage::{MemoryStore, MockDeadLetterStore};
    use pretty_assertions::assert_eq;
    use std::sync::atomic::AtomicU32;

    fn config() -> DeadLetterConfig {
        DeadLetterConfig {
            max_retry_attempts: 2,
            base_retry_delay: Duration::from_secs(60),
            jitter: false,
            ..Default::default()
        }
    }

    async fn make_due(store: &MemoryStore, id: Uuid) {
        let mut job = store.get_job(id).await.unwrap().unwrap();
        job.next_retry_at = Utc::now() - chrono::Duration::seconds(1);
        store.update_job(&job).await.unwrap();
    }

    #[tokio::test]
    async fn test_add_job_records_error_details() {
        let store = Arc::new(MemoryStore::new());
        let service = DeadLetterQueueService::new(store.clone(), config());

        let before = Utc::now();
        let id = service
            .add_job(
                "job-7",
                "webhook.stripe",
                serde_json::json!({ "url": "http://localhost" }),
                &ResilienceError::network("connection reset"),
                AddJobOptions::default().priority(3).company("acme").metadata("source", "queue"),
            )
            .await
            .unwrap();

        let job = service.get_job(id).await.unwrap().unwrap();
        assert_eq!(job.failure_reason, "NETWORK_ERROR");
        assert_eq!(job.retry_count, 0);
        assert_eq!(job.max_retries, 2);
        assert_eq!(job.metadata["error_category"], "network");
        assert_eq!(job.metadata["source"], "queue");
        assert!(job.next_retry_at >= before + chrono::Duration::seconds(60));
        assert!(!job.is_eligible(Utc::now()));
    }

    #[tokio::test]
    async fn test_failed_attempts_reschedule_then_exhaust() {
        let store = Arc::new(MemoryStore::new());
        let service = DeadLetterQueueService::new(store.clone(), config());
        service
            .register_strategy(Arc::new(WebhookRetryStrategy::new(replay_with(|_| async {
                Err(ResilienceError::external_service("502"))
            }))))
            .await;

        let id = service
            .add_job("j", "webhook", serde_json::json!({}), &ResilienceError::network("x"), AddJobOptions::default())
            .await
            .unwrap();

        make_due(&store, id).await;
        let summary = service.process_jobs(ProcessOptions::default()).await.unwrap();
        assert_eq!((summary.processed, summary.failed), (1, 1));
        let job = service.get_job(id).await.unwrap().unwrap();
        assert_eq!(job.retry_count, 1);
        assert!(job.auto_recovery_enabled);
        // retry_count 1 -> delay for attempt 2 = 120s
        assert!(job.next_retry_at > Utc::now() + chrono::Duration::seconds(110));

        make_due(&store, id).await;
        service.process_jobs(ProcessOptions::default()).await.unwrap();
        let job = service.get_job(id).await.unwrap().unwrap();
        assert_eq!(job.retry_count, 2);
        assert!(!job.auto_recovery_enabled);

        let summary = service.process_jobs(ProcessOptions::default()).await.unwrap();
        assert_eq!(summary.processed, 0);

        let stats = service.get_stats(StatsFilter::default()).await.unwrap();
        assert_eq!(stats.exhausted, 1);
        assert_eq!(stats.failed_since_start, 2);
    }

    #[tokio::test]
    async fn test_manual_retry_recovers_exhausted_job() {
        let store = Arc::new(MemoryStore::new());
        let service = DeadLetterQueueService::new(store.clone(), config());
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = attempts.clone();
        service
            .register_strategy(Arc::new(WebhookRetryStrategy::new(replay_with(move |_| {
                let n = counter.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n == 0 {
                        Err(ResilienceError::external_service("502"))
                    } else {
                        Ok(())
                    }
                }
            }))))
            .await;

        let id = service
            .add_job(
                "j",
                "webhook",
                serde_json::json!({}),
                &ResilienceError::network("x"),
                AddJobOptions::default().max_retries(1),
            )
            .await
            .unwrap();

        let outcome = service.retry_job(id).await.unwrap();
        assert_eq!(outcome, JobRecoveryOutcome::Exhausted { retry_count: 1 });

        let outcome = service.retry_job(id).await.unwrap();
        assert!(outcome.is_recovered());
        assert!(service.get_job(id).await.unwrap().is_none());

        let stats = service.get_stats(StatsFilter::default()).await.unwrap();
        assert_eq!(stats.recovered_since_start, 1);
        assert!((stats.recovery_rate - 0.5).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_retry_unknown_job_is_not_found() {
        let service = DeadLetterQueueService::new(Arc::new(MemoryStore::new()), config());
        let err = service.retry_job(Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, ResilienceError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_store_failure_releases_processing_flag() {
        let mut store = MockDeadLetterStore::new();
        store
            .expect_fetch_pending()
            .times(2)
            .returning(|_, _| Err(ResilienceError::storage("database is locked")));

        let service = DeadLetterQueueService::new(Arc::new(store), config());
        assert!(service.process_jobs(ProcessOptions::default()).await.is_err());
        assert!(!service.is_processing());
        assert!(service.process_jobs(ProcessOptions::default()).await.is_err());
    }

    #[tokio::test]
    async fn test_cleanup_uses_retention() {
        let mut store = MockDeadLetterStore::new();
        store
            .expect_delete_older_than()
            .withf(|cutoff| *cutoff < Utc::now() - chrono::Duration::days(29))
            .returning(|_| Ok(4));

        let service = DeadLetterQueueService::new(Arc::new(store), config());
        assert_eq!(service.cleanup().await.unwrap(), 4);
    }
}
