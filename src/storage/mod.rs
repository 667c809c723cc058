//! Storage layer for dead-lettered jobs, breaker transitions and recovery metrics
//!
//! This module provides storage implementations for:
//! - The dead-letter job table
//! - The append-only circuit breaker transition log
//! - Append-only recovery metrics
//!
//! Available implementations:
//! - In-memory storage (default, tests)
//! - Turso / SQLite storage (with "turso" feature)

pub mod memory;

#[cfg(feature = "turso")]
pub mod turso_client;

pub use memory::MemoryStore;

#[cfg(feature = "turso")]
pub use turso_client::{TursoConfig, TursoStore};

use crate::dead_letter::models::{DeadLetterJob, JobFilter, StatsFilter, StoreStats};
use crate::error::Result;
use crate::error_recovery::circuit_breaker::CircuitState;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One persisted circuit breaker state transition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitBreakerEventRecord {
    pub circuit_name: String,
    pub previous_state: CircuitState,
    pub new_state: CircuitState,
    pub trigger_reason: String,
    pub failure_count: u32,
    pub success_count: u32,
    pub timeout_ms: Option<u64>,
    pub recovery_timeout_ms: u64,
    pub metadata: serde_json::Value,
    pub company_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// One persisted live-path recovery attempt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoveryMetricRecord {
    pub service_name: String,
    pub operation_type: Option<String>,
    pub error_category: Option<String>,
    pub error_code: Option<String>,
    /// What finally served (or failed) the call, e.g. `retry`, `cache`, `database_reconnection`
    pub recovery_strategy: String,
    pub success: bool,
    pub attempts: u32,
    pub duration_ms: u64,
    pub circuit_breaker_state: Option<CircuitState>,
    pub error_message: Option<String>,
    pub metadata: serde_json::Value,
    pub company_id: Option<String>,
    pub user_id: Option<String>,
    pub request_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Durable dead-letter job table
#[cfg_attr(test, mockall::automock)]
#[async_trait::async_trait]
pub trait DeadLetterStore: Send + Sync {
    async fn insert_job(&self, job: &DeadLetterJob) -> Result<()>;

    async fn get_job(&self, id: Uuid) -> Result<Option<DeadLetterJob>>;

    /// Overwrite an existing job row; fails with not-found when it is missing
    async fn update_job(&self, job: &DeadLetterJob) -> Result<()>;

    async fn delete_job(&self, id: Uuid) -> Result<bool>;

    /// Jobs with auto recovery enabled and `next_retry_at <= now`,
    /// ordered by priority desc then age asc
    async fn fetch_pending(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<DeadLetterJob>>;

    async fn list_jobs(&self, filter: &JobFilter) -> Result<Vec<DeadLetterJob>>;

    /// Delete jobs created before `cutoff`, returning the number removed
    async fn delete_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64>;

    async fn stats(&self, filter: &StatsFilter, now: DateTime<Utc>) -> Result<StoreStats>;
}

/// Append-only circuit breaker transition log
#[cfg_attr(test, mockall::automock)]
#[async_trait::async_trait]
pub trait CircuitEventStore: Send + Sync {
    async fn record_transition(&self, event: CircuitBreakerEventRecord) -> Result<()>;
}

/// Append-only recovery metrics
#[cfg_attr(test, mockall::automock)]
#[async_trait::async_trait]
pub trait RecoveryMetricsStore: Send + Sync {
    async fn record_metric(&self, metric: RecoveryMetricRecord) -> Result<()>;
}

/// Aggregate jobs already filtered by scope; shared by the backends
pub(crate) fn aggregate_stats<'a, I>(jobs: I, now: DateTime<Utc>) -> StoreStats
where
    I: IntoIterator<Item = &'a DeadLetterJob>,
{
    let mut stats = StoreStats::default();
    let mut retry_total: u64 = 0;

    for job in jobs {
        stats.total += 1;
        retry_total += u64::from(job.retry_count);
        if !job.auto_recovery_enabled {
            stats.exhausted += 1;
        } else if job.next_retry_at <= now {
            stats.pending += 1;
        } else {
            stats.scheduled += 1;
        }
        *stats.by_job_type.entry(job.job_type.clone()).or_insert(0) += 1;
        stats.oldest_failed_at = Some(match stats.oldest_failed_at {
            Some(oldest) if oldest <= job.first_failed_at => oldest,
            _ => job.first_failed_at,
        });
    }

    if stats.total > 0 {
        stats.average_retry_count = retry_total as f64 / stats.total as f64;
    }
    stats
}
