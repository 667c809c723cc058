//! Simple in-memory storage
//!
//! Implements every storage trait without external dependencies. Data is lost
//! when the process exits; used by tests and offline tooling.

use super::{
    aggregate_stats, CircuitBreakerEventRecord, CircuitEventStore, DeadLetterStore,
    RecoveryMetricRecord, RecoveryMetricsStore,
};
use crate::dead_letter::models::{DeadLetterJob, JobFilter, StatsFilter, StoreStats};
use crate::error::{ResilienceError, Result};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;
use uuid::Uuid;

/// In-memory store for jobs, transitions and metrics
#[derive(Clone, Default)]
pub struct MemoryStore {
    jobs: Arc<RwLock<HashMap<Uuid, DeadLetterJob>>>,
    transitions: Arc<RwLock<Vec<CircuitBreakerEventRecord>>>,
    metrics: Arc<RwLock<Vec<RecoveryMetricRecord>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Recorded transitions, oldest first
    pub async fn transitions(&self) -> Vec<CircuitBreakerEventRecord> {
        self.transitions.read().await.clone()
    }

    /// Recorded recovery metrics, oldest first
    pub async fn metrics(&self) -> Vec<RecoveryMetricRecord> {
        self.metrics.read().await.clone()
    }

    pub async fn job_count(&self) -> usize {
        self.jobs.read().await.len()
    }
}

fn queue_order(a: &DeadLetterJob, b: &DeadLetterJob) -> std::cmp::Ordering {
    b.priority
        .cmp(&a.priority)
        .then_with(|| a.created_at.cmp(&b.created_at))
}

#[async_trait::async_trait]
impl DeadLetterStore for MemoryStore {
    async fn insert_job(&self, job: &DeadLetterJob) -> Result<()> {
        self.jobs.write().await.insert(job.id, job.clone());
        debug!(job_id = %job.id, "Stored dead-letter job in memory");
        Ok(())
    }

    async fn get_job(&self, id: Uuid) -> Result<Option<DeadLetterJob>> {
        Ok(self.jobs.read().await.get(&id).cloned())
    }

    async fn update_job(&self, job: &DeadLetterJob) -> Result<()> {
        let mut jobs = self.jobs.write().await;
        match jobs.get_mut(&job.id) {
            Some(existing) => {
                *existing = job.clone();
                Ok(())
            }
            None => Err(ResilienceError::not_found(format!(
                "dead-letter job {}",
                job.id
            ))),
        }
    }

    async fn delete_job(&self, id: Uuid) -> Result<bool> {
        Ok(self.jobs.write().await.remove(&id).is_some())
    }

    async fn fetch_pending(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<DeadLetterJob>> {
        let jobs = self.jobs.read().await;
        let mut pending: Vec<_> = jobs.values().filter(|j| j.is_eligible(now)).cloned().collect();
        pending.sort_by(queue_order);
        pending.truncate(limit);
        Ok(pending)
    }

    async fn list_jobs(&self, filter: &JobFilter) -> Result<Vec<DeadLetterJob>> {
        let jobs = self.jobs.read().await;
        let mut listed: Vec<_> = jobs.values().filter(|j| filter.matches(j)).cloned().collect();
        listed.sort_by(queue_order);
        if let Some(limit) = filter.limit {
            listed.truncate(limit);
        }
        Ok(listed)
    }

    async fn delete_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let mut jobs = self.jobs.write().await;
        let before = jobs.len();
        jobs.retain(|_, job| job.created_at >= cutoff);
        Ok((before - jobs.len()) as u64)
    }

    async fn stats(&self, filter: &StatsFilter, now: DateTime<Utc>) -> Result<StoreStats> {
        let jobs = self.jobs.read().await;
        Ok(aggregate_stats(jobs.values().filter(|j| filter.matches(j)), now))
    }
}

#[async_trait::async_trait]
impl CircuitEventStore for MemoryStore {
    async fn record_transition(&self, event: CircuitBreakerEventRecord) -> Result<()> {
        self.transitions.write().await.push(event);
        Ok(())
    }
}

#[async_trait::async_trait]
impl RecoveryMetricsStore for MemoryStore {
    async fn record_metric(&self, metric: RecoveryMetricRecord) -> Result<()> {
        self.metrics.write().await.push(metric);
        Ok(())
    }
}
