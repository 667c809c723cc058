//! Durable recovery of jobs that exhausted their in-process retries
//!
//! Jobs are persisted through a [`DeadLetterStore`](crate::storage::DeadLetterStore),
//! picked up in batches by [`DeadLetterQueueService`] and replayed by
//! job-type specific [`DeadLetterStrategy`] implementations.

pub mod http_replay;
pub mod models;
pub mod service;
pub mod strategies;

pub use http_replay::{HttpReplayer, ReplayRequest};
pub use models::{
    AddJobOptions, DeadLetterJob, DeadLetterStats, JobFilter, JobRecoveryOutcome, ProcessOptions,
    ProcessSummary, StatsFilter, StoreStats,
};
pub use service::{DeadLetterConfig, DeadLetterQueueService};
pub use strategies::{
    replay_with, DatabaseRetryStrategy, DeadLetterStrategy, ExternalApiRetryStrategy, JobReplayer,
    WebhookRetryStrategy,
};
