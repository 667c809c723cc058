//! Error recovery patterns for calls against unreliable dependencies
//!
//! This module provides circuit breakers, retries with exponential backoff,
//! cache and fallback substitution, pluggable recovery strategies and the
//! [`RecoveryManager`] composing them.

pub mod backoff;
pub mod circuit_breaker;
pub mod fallback;
pub mod recovery_manager;
pub mod retry_policy;
pub mod strategies;

// Re-export commonly used types
pub use backoff::{calculate_delay, BackoffParams};
pub use circuit_breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerEvent, CircuitBreakerListener,
    CircuitBreakerMetrics, CircuitBreakerRegistry, CircuitBreakerStats, CircuitState,
    EventStoreListener,
};
pub use fallback::{
    fallback_operation, CacheMode, FallbackConfig, FallbackHandler, FallbackOperation,
    FallbackSource,
};
pub use recovery_manager::{
    RecoveryManager, RecoveryManagerBuilder, RecoveryManagerConfig, RecoveryOptions,
    ServiceResilienceConfig,
};
pub use retry_policy::{RetryConfig, RetryHandler, RetryStats};
pub use strategies::{
    async_callback, AsyncCallback, DatabaseReconnectionStrategy, ExternalServiceHealthCheckStrategy,
    RecoveryContext, RecoveryResult, RecoveryStrategy,
};
