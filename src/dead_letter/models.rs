//! Dead-letter job model and query types

use crate::error::ErrorCategory;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// A background job that exhausted its in-process retries
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterJob {
    pub id: Uuid,
    pub original_job_id: String,
    pub job_type: String,
    /// Opaque payload needed to replay the job
    pub job_data: serde_json::Value,
    /// Error code string of the failure that dead-lettered the job
    pub failure_reason: String,
    pub error_message: String,
    pub retry_count: u32,
    pub max_retries: u32,
    pub first_failed_at: DateTime<Utc>,
    pub last_failed_at: DateTime<Utc>,
    pub next_retry_at: DateTime<Utc>,
    /// Higher runs first
    pub priority: i32,
    pub company_id: Option<String>,
    pub recovery_attempts: u32,
    pub auto_recovery_enabled: bool,
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl DeadLetterJob {
    /// Whether the batch processor may pick this job up at `now`
    pub fn is_eligible(&self, now: DateTime<Utc>) -> bool {
        self.auto_recovery_enabled && self.next_retry_at <= now
    }

    /// Retry budget used up
    pub fn is_exhausted(&self) -> bool {
        self.retry_count >= self.max_retries
    }

    /// Category of the original error, as recorded in metadata
    pub fn error_category(&self) -> Option<ErrorCategory> {
        self.metadata
            .get("error_category")
            .cloned()
            .and_then(|v| serde_json::from_value(v).ok())
    }
}

/// Options for [`add_job`](super::DeadLetterQueueService::add_job)
#[derive(Debug, Clone, Default)]
pub struct AddJobOptions {
    pub priority: i32,
    pub company_id: Option<String>,
    /// Overrides the configured maximum retry attempts
    pub max_retries: Option<u32>,
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

impl AddJobOptions {
    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn company(mut self, company_id: impl Into<String>) -> Self {
        self.company_id = Some(company_id.into());
        self
    }

    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    pub fn metadata(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// Options for one batch run
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessOptions {
    /// Overrides the configured batch size
    pub batch_size: Option<usize>,
}

/// Result of one batch run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessSummary {
    pub processed: usize,
    pub recovered: usize,
    pub failed: usize,
    /// Another batch was already running; nothing was done
    pub skipped: bool,
}

/// Outcome of a single job recovery attempt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum JobRecoveryOutcome {
    /// Job was replayed successfully and removed
    Recovered { strategy: String },
    /// Job failed again and is scheduled for another attempt
    Rescheduled {
        retry_count: u32,
        next_retry_at: DateTime<Utc>,
    },
    /// Retry budget exhausted; automatic recovery disabled
    Exhausted { retry_count: u32 },
}

impl JobRecoveryOutcome {
    pub fn is_recovered(&self) -> bool {
        matches!(self, JobRecoveryOutcome::Recovered { .. })
    }
}

/// Filter for listing jobs
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobFilter {
    pub company_id: Option<String>,
    pub job_type: Option<String>,
    pub auto_recovery_enabled: Option<bool>,
    pub limit: Option<usize>,
}

impl JobFilter {
    pub fn matches(&self, job: &DeadLetterJob) -> bool {
        self.company_id
            .as_ref()
            .map_or(true, |c| job.company_id.as_ref() == Some(c))
            && self.job_type.as_ref().map_or(true, |t| &job.job_type == t)
            && self
                .auto_recovery_enabled
                .map_or(true, |a| job.auto_recovery_enabled == a)
    }
}

/// Scope for aggregate statistics
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StatsFilter {
    pub company_id: Option<String>,
    pub job_type: Option<String>,
}

impl StatsFilter {
    pub fn matches(&self, job: &DeadLetterJob) -> bool {
        JobFilter {
            company_id: self.company_id.clone(),
            job_type: self.job_type.clone(),
            ..Default::default()
        }
        .matches(job)
    }
}

/// Aggregates computed by the store
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StoreStats {
    pub total: u64,
    /// Eligible for pickup now
    pub pending: u64,
    /// Auto-recovery enabled but not yet due
    pub scheduled: u64,
    /// Auto-recovery disabled
    pub exhausted: u64,
    pub by_job_type: BTreeMap<String, u64>,
    pub average_retry_count: f64,
    pub oldest_failed_at: Option<DateTime<Utc>>,
}

/// Queue statistics including this process's recovery counters
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterStats {
    pub total: u64,
    pub pending: u64,
    pub scheduled: u64,
    pub exhausted: u64,
    pub by_job_type: BTreeMap<String, u64>,
    pub average_retry_count: f64,
    pub oldest_failed_at: Option<DateTime<Utc>>,
    pub processed_since_start: u64,
    pub recovered_since_start: u64,
    pub failed_since_start: u64,
    /// recovered / processed since start, 0 when nothing was processed
    pub recovery_rate: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job(job_type: &str) -> DeadLetterJob {
        let now = Utc::now();
        DeadLetterJob {
            id: Uuid::new_v4(),
            original_job_id: "orig-1".to_string(),
            job_type: job_type.to_string(),
            job_data: serde_json::json!({}),
            failure_reason: "NETWORK_ERROR".to_string(),
            error_message: "boom".to_string(),
            retry_count: 0,
            max_retries: 3,
            first_failed_at: now,
            last_failed_at: now,
            next_retry_at: now,
            priority: 0,
            company_id: Some("acme".to_string()),
            recovery_attempts: 0,
            auto_recovery_enabled: true,
            metadata: serde_json::json!({ "error_category": "network" }),
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn test_eligibility() {
        let mut job = job("webhook");
        let now = Utc::now();
        assert!(job.is_eligible(now));

        job.next_retry_at = now + chrono::Duration::minutes(5);
        assert!(!job.is_eligible(now));

        job.next_retry_at = now;
        job.auto_recovery_enabled = false;
        assert!(!job.is_eligible(now));
    }

    #[test]
    fn test_filters_and_category() {
        let job = job("webhook.stripe");
        assert_eq!(job.error_category(), Some(ErrorCategory::Network));

        assert!(JobFilter::default().matches(&job));
        assert!(!JobFilter {
            company_id: Some("other".to_string()),
            ..Default::default()
        }
        .matches(&job));
        assert!(StatsFilter {
            job_type: Some("webhook.stripe".to_string()),
            ..Default::default()
        }
        .matches(&job));
    }
}
