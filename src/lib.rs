//! Resilience core for calls against unreliable dependencies
//!
//! This crate wraps fallible async operations with failure isolation and
//! recovery, and durably recovers work that exhausted its in-process retries.
//!
//! # Features
//!
//! - Per-dependency circuit breakers (CLOSED / OPEN / HALF_OPEN)
//! - Exponential-backoff retries with bounded jitter
//! - TTL cache, fallback operation and static fallback data
//! - Ordered recovery strategies composed by [`RecoveryManager`]
//! - Persisted dead-letter queue with job-type specific replay
//! - In-memory and Turso / SQLite storage

// Core modules
pub mod config;
pub mod dead_letter;
pub mod error;
pub mod error_recovery;
pub mod logging;
pub mod storage;

// Re-export main types for convenience
pub use config::ResilienceSettings;
pub use dead_letter::{DeadLetterConfig, DeadLetterQueueService};
pub use error::{ErrorCategory, ErrorCode, ErrorSeverity, ResilienceError, Result};
pub use error_recovery::{
    CircuitBreaker, CircuitBreakerConfig, CircuitState, FallbackHandler, RecoveryManager,
    RecoveryOptions, RetryHandler,
};
