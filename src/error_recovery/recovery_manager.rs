//! Recovery manager coordinating breakers, retries, fallbacks and strategies
//!
//! Every call goes through `fallback(retry(breaker(op)))`: each retry
//! attempt passes through the service's circuit breaker, and the fallback
//! chain only engages once retries are exhausted. If the wrapped call still
//! fails, registered [`RecoveryStrategy`] implementations are tried in order.
//!
//! Breakers and fallback handlers are created lazily per service name and
//! owned by the manager instance.

use super::circuit_breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerListener, CircuitBreakerRegistry,
    CircuitBreakerStats, CircuitState, EventStoreListener,
};
use super::fallback::{FallbackConfig, FallbackHandler, FallbackOperation, FallbackSource};
use super::retry_policy::{RetryConfig, RetryHandler};
use super::strategies::{RecoveryContext, RecoveryStrategy};
use crate::error::{ErrorContext, ErrorReporter, ResilienceError, Result};
use crate::storage::{CircuitEventStore, RecoveryMetricRecord, RecoveryMetricsStore};
use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{debug, info, warn};

pub const DEFAULT_SERVICE: &str = "default";

/// Breaker, retry and fallback settings for one service
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceResilienceConfig {
    pub circuit_breaker: CircuitBreakerConfig,
    pub retry: RetryConfig,
    pub fallback: FallbackConfig,
}

impl ServiceResilienceConfig {
    /// Configuration for services on the critical path
    pub fn critical_service() -> Self {
        Self {
            circuit_breaker: CircuitBreakerConfig::critical_service(),
            retry: RetryConfig::critical(),
            fallback: FallbackConfig::default(),
        }
    }

    /// Configuration for background services
    pub fn background_service() -> Self {
        Self {
            circuit_breaker: CircuitBreakerConfig::non_critical_service(),
            retry: RetryConfig::background(),
            fallback: FallbackConfig::default(),
        }
    }
}

/// Manager-wide defaults used for services without a registration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoveryManagerConfig {
    pub defaults: ServiceResilienceConfig,
}

/// Per-call options for [`RecoveryManager::execute_with_recovery`]
pub struct RecoveryOptions<T> {
    pub service: String,
    pub circuit_breaker: bool,
    pub retry: bool,
    /// Overrides the service's retry configuration for this call only
    pub retry_config: Option<RetryConfig>,
    pub fallback: bool,
    pub fallback_operation: Option<FallbackOperation<T>>,
    pub cache_key: Option<String>,
    pub context: RecoveryContext,
}

impl<T> Default for RecoveryOptions<T> {
    fn default() -> Self {
        Self {
            service: DEFAULT_SERVICE.to_string(),
            circuit_breaker: true,
            retry: true,
            retry_config: None,
            fallback: true,
            fallback_operation: None,
            cache_key: None,
            context: RecoveryContext::default(),
        }
    }
}

impl<T> RecoveryOptions<T> {
    pub fn for_service(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            ..Default::default()
        }
    }

    pub fn without_circuit_breaker(mut self) -> Self {
        self.circuit_breaker = false;
        self
    }

    pub fn without_retry(mut self) -> Self {
        self.retry = false;
        self
    }

    pub fn without_fallback(mut self) -> Self {
        self.fallback = false;
        self
    }

    pub fn retry_config(mut self, config: RetryConfig) -> Self {
        self.retry = true;
        self.retry_config = Some(config);
        self
    }

    pub fn fallback_operation(mut self, operation: FallbackOperation<T>) -> Self {
        self.fallback_operation = Some(operation);
        self
    }

    pub fn cache_key(mut self, key: impl Into<String>) -> Self {
        self.cache_key = Some(key.into());
        self
    }

    pub fn context(mut self, context: RecoveryContext) -> Self {
        self.context = context;
        self
    }
}

/// Builder for [`RecoveryManager`]
#[derive(Default)]
pub struct RecoveryManagerBuilder {
    config: RecoveryManagerConfig,
    strategies: Vec<Arc<dyn RecoveryStrategy>>,
    listeners: Vec<Arc<dyn CircuitBreakerListener>>,
    metrics_store: Option<Arc<dyn RecoveryMetricsStore>>,
}

impl RecoveryManagerBuilder {
    pub fn config(mut self, config: RecoveryManagerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn strategy(mut self, strategy: Arc<dyn RecoveryStrategy>) -> Self {
        self.strategies.push(strategy);
        self
    }

    /// Persist every breaker transition to `store`
    pub fn event_store(mut self, store: Arc<dyn CircuitEventStore>) -> Self {
        self.listeners.push(Arc::new(EventStoreListener::new(store)));
        self
    }

    pub fn listener(mut self, listener: Arc<dyn CircuitBreakerListener>) -> Self {
        self.listeners.push(listener);
        self
    }

    pub fn metrics_store(mut self, store: Arc<dyn RecoveryMetricsStore>) -> Self {
        self.metrics_store = Some(store);
        self
    }

    pub fn build(self) -> RecoveryManager {
        RecoveryManager {
            defaults: self.config.defaults,
            services: RwLock::new(HashMap::new()),
            breakers: CircuitBreakerRegistry::new(self.listeners),
            fallbacks: RwLock::new(HashMap::new()),
            strategies: RwLock::new(self.strategies),
            metrics_store: self.metrics_store,
        }
    }
}

/// Last error seen by the guarded operation, kept for metrics
#[derive(Default)]
struct ObservedError {
    code: String,
    category: String,
    message: String,
}

impl ObservedError {
    fn from_error(error: &ResilienceError) -> Self {
        Self {
            code: error.code().as_str().to_string(),
            category: error.category().as_str().to_string(),
            message: error.to_string(),
        }
    }
}

struct MetricOutcome<'a> {
    strategy: &'a str,
    success: bool,
    attempts: u32,
    duration: Duration,
    error: Option<ObservedError>,
}

/// Resilience coordinator owning its breakers, fallback caches and strategies
pub struct RecoveryManager {
    defaults: ServiceResilienceConfig,
    services: RwLock<HashMap<String, ServiceResilienceConfig>>,
    breakers: CircuitBreakerRegistry,
    fallbacks: RwLock<HashMap<String, Arc<FallbackHandler>>>,
    strategies: RwLock<Vec<Arc<dyn RecoveryStrategy>>>,
    metrics_store: Option<Arc<dyn RecoveryMetricsStore>>,
}

impl Default for RecoveryManager {
    fn default() -> Self {
        Self::new(RecoveryManagerConfig::default())
    }
}

impl RecoveryManager {
    pub fn new(config: RecoveryManagerConfig) -> Self {
        Self::builder().config(config).build()
    }

    pub fn builder() -> RecoveryManagerBuilder {
        RecoveryManagerBuilder::default()
    }

    /// Register service-specific settings.
    ///
    /// Breakers and caches that already exist for `name` keep their settings
    /// until [`reset_service`](Self::reset_service) or [`shutdown`](Self::shutdown).
    pub async fn register_service(&self, name: &str, config: ServiceResilienceConfig) {
        self.services.write().await.insert(name.to_string(), config);
        info!(service = name, "Registered resilience configuration");
    }

    /// Append a strategy; earlier registrations are tried first
    pub async fn register_strategy(&self, strategy: Arc<dyn RecoveryStrategy>) {
        info!(strategy = strategy.name(), "Registered recovery strategy");
        self.strategies.write().await.push(strategy);
    }

    async fn service_config(&self, service: &str) -> ServiceResilienceConfig {
        self.services
            .read()
            .await
            .get(service)
            .cloned()
            .unwrap_or_else(|| self.defaults.clone())
    }

    async fn fallback_handler(&self, service: &str, config: FallbackConfig) -> Arc<FallbackHandler> {
        if let Some(handler) = self.fallbacks.read().await.get(service) {
            return handler.clone();
        }

        self.fallbacks
            .write()
            .await
            .entry(service.to_string())
            .or_insert_with(|| Arc::new(FallbackHandler::new(service, config)))
            .clone()
    }

    /// Breaker for `service`, if one has been created
    pub async fn circuit_breaker(&self, service: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers.get(service).await
    }

    /// Run `operation` with the full recovery chain.
    ///
    /// Returns a substitute value from the cache, a fallback, or a strategy
    /// when one is available; otherwise the original error.
    pub async fn execute_with_recovery<F, Fut, T>(
        &self,
        operation: F,
        mut options: RecoveryOptions<T>,
    ) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T>>,
        T: Serialize + DeserializeOwned,
    {
        let started = Instant::now();
        let service = options.service.clone();
        let config = self.service_config(&service).await;

        let breaker = if options.circuit_breaker {
            Some(
                self.breakers
                    .get_or_create(&service, config.circuit_breaker.clone())
                    .await,
            )
        } else {
            None
        };
        let retry_handler = if options.retry {
            let retry_config = options.retry_config.take().unwrap_or(config.retry.clone());
            Some(RetryHandler::new(retry_config).with_label(service.clone()))
        } else {
            None
        };

        let attempts = AtomicU32::new(0);
        let last_error: Mutex<Option<ObservedError>> = Mutex::new(None);

        let operation_ref = &operation;
        let breaker_ref = breaker.as_deref();
        let attempts_ref = &attempts;
        let last_error_ref = &last_error;
        let guarded = move || {
            attempts_ref.fetch_add(1, Ordering::Relaxed);
            async move {
                let result = match breaker_ref {
                    Some(breaker) => breaker.execute(operation_ref).await,
                    None => operation_ref().await,
                };
                if let Err(error) = &result {
                    if let Ok(mut slot) = last_error_ref.lock() {
                        *slot = Some(ObservedError::from_error(error));
                    }
                }
                result
            }
        };

        let guarded_ref = &guarded;
        let retry_ref = retry_handler.as_ref();
        let primary = move || async move {
            match retry_ref {
                Some(handler) => handler.execute(guarded_ref).await,
                None => guarded_ref().await,
            }
        };

        let outcome = if options.fallback {
            let handler = self.fallback_handler(&service, config.fallback.clone()).await;
            handler
                .execute_with_source(
                    primary,
                    options.fallback_operation.take(),
                    options.cache_key.as_deref(),
                )
                .await
        } else {
            primary().await.map(|value| (value, FallbackSource::Primary))
        };

        let take_error = || last_error.lock().ok().and_then(|mut slot| slot.take());

        let error = match outcome {
            Ok((value, source)) => {
                let used = attempts.load(Ordering::Relaxed);
                if source != FallbackSource::Primary || used > 1 {
                    let strategy = if source == FallbackSource::Primary {
                        "retry"
                    } else {
                        source.as_str()
                    };
                    self.record_metric(
                        &service,
                        &options.context,
                        breaker.as_deref(),
                        MetricOutcome {
                            strategy,
                            success: true,
                            attempts: used,
                            duration: started.elapsed(),
                            error: take_error(),
                        },
                    )
                    .await;
                }
                return Ok(value);
            }
            Err(error) => error,
        };

        let mut context = options.context.clone();
        context.service = service.clone();

        if let Some((value, strategy)) = self
            .dispatch_strategies(&error, &context, breaker.as_deref(), &guarded)
            .await
        {
            self.record_metric(
                &service,
                &context,
                breaker.as_deref(),
                MetricOutcome {
                    strategy: &strategy,
                    success: true,
                    attempts: attempts.load(Ordering::Relaxed),
                    duration: started.elapsed(),
                    error: Some(ObservedError::from_error(&error)),
                },
            )
            .await;
            return Ok(value);
        }

        let mut error_context = ErrorContext::new(
            &service,
            context.operation_type.as_deref().unwrap_or("execute_with_recovery"),
        )
        .with_metadata("event", "recovery.failed")
        .with_metadata("attempts", attempts.load(Ordering::Relaxed));
        if let Some(request_id) = &context.request_id {
            error_context = error_context.with_correlation_id(request_id.as_str());
        }
        ErrorReporter::log_error(&error, Some(error_context));
        self.record_metric(
            &service,
            &context,
            breaker.as_deref(),
            MetricOutcome {
                strategy: "none",
                success: false,
                attempts: attempts.load(Ordering::Relaxed),
                duration: started.elapsed(),
                error: Some(ObservedError::from_error(&error)),
            },
        )
        .await;
        Err(error)
    }

    /// First strategy that handles `error` and recovers wins
    async fn dispatch_strategies<G, Fut, T>(
        &self,
        error: &ResilienceError,
        context: &RecoveryContext,
        breaker: Option<&CircuitBreaker>,
        reinvoke: &G,
    ) -> Option<(T, String)>
    where
        G: Fn() -> Fut,
        Fut: Future<Output = Result<T>>,
        T: DeserializeOwned,
    {
        let strategies = self.strategies.read().await.clone();

        for strategy in strategies.iter().filter(|s| s.can_handle(error)) {
            let result = strategy.execute(error, context).await;
            if !result.success {
                warn!(
                    service = %context.service,
                    strategy = strategy.name(),
                    error = ?result.error,
                    "Recovery strategy failed internally"
                );
                continue;
            }
            if !result.recovered {
                debug!(
                    service = %context.service,
                    strategy = strategy.name(),
                    action = %result.action,
                    "Recovery strategy did not recover"
                );
                continue;
            }

            match result.result {
                Some(value) => match serde_json::from_value(value) {
                    Ok(value) => {
                        info!(
                            event = "recovery.strategy_succeeded",
                            service = %context.service,
                            strategy = strategy.name(),
                            action = %result.action,
                            "Strategy supplied a substitute result"
                        );
                        return Some((value, strategy.name().to_string()));
                    }
                    Err(e) => {
                        warn!(
                            strategy = strategy.name(),
                            error = %e,
                            "Strategy result does not match the expected type"
                        );
                    }
                },
                None => {
                    // The dependency was repaired; an open circuit would reject the re-run
                    if let Some(breaker) = breaker {
                        breaker.allow_probe(strategy.name()).await;
                    }
                    match reinvoke().await {
                        Ok(value) => {
                            info!(
                                event = "recovery.strategy_succeeded",
                                service = %context.service,
                                strategy = strategy.name(),
                                action = %result.action,
                                "Operation succeeded after strategy repaired dependency"
                            );
                            return Some((value, strategy.name().to_string()));
                        }
                        Err(e) => {
                            warn!(
                                service = %context.service,
                                strategy = strategy.name(),
                                error = %e,
                                "Operation still failing after recovery strategy"
                            );
                        }
                    }
                }
            }
        }

        None
    }

    async fn record_metric(
        &self,
        service: &str,
        context: &RecoveryContext,
        breaker: Option<&CircuitBreaker>,
        outcome: MetricOutcome<'_>,
    ) {
        let Some(store) = &self.metrics_store else {
            return;
        };

        let circuit_breaker_state: Option<CircuitState> = match breaker {
            Some(breaker) => Some(breaker.state().await),
            None => None,
        };
        let error = outcome.error.unwrap_or_default();
        let non_empty = |s: String| if s.is_empty() { None } else { Some(s) };

        let record = RecoveryMetricRecord {
            service_name: service.to_string(),
            operation_type: context.operation_type.clone(),
            error_category: non_empty(error.category),
            error_code: non_empty(error.code),
            recovery_strategy: outcome.strategy.to_string(),
            success: outcome.success,
            attempts: outcome.attempts,
            duration_ms: outcome.duration.as_millis() as u64,
            circuit_breaker_state,
            error_message: non_empty(error.message),
            metadata: serde_json::to_value(&context.metadata).unwrap_or_default(),
            company_id: context.company_id.clone(),
            user_id: context.user_id.clone(),
            request_id: context.request_id.clone(),
            created_at: Utc::now(),
        };

        if let Err(e) = store.record_metric(record).await {
            warn!(service, error = %e, "Failed to record recovery metric");
        }
    }

    /// Breaker statistics per service
    pub async fn get_health(&self) -> HashMap<String, CircuitBreakerStats> {
        self.breakers.get_all_stats().await
    }

    /// Close the service's breaker and drop its cached fallbacks
    pub async fn reset_service(&self, service: &str) -> bool {
        let mut found = false;
        if let Some(breaker) = self.breakers.get(service).await {
            breaker.reset().await;
            found = true;
        }
        if let Some(handler) = self.fallbacks.read().await.get(service) {
            handler.clear().await;
            found = true;
        }
        if found {
            info!(service, "Reset service recovery state");
        }
        found
    }

    /// Drop expired fallback cache entries across all services
    pub async fn cleanup(&self) -> usize {
        let handlers: Vec<_> = self.fallbacks.read().await.values().cloned().collect();
        let mut removed = 0;
        for handler in handlers {
            removed += handler.cleanup_expired().await;
        }
        debug!(removed, "Cleaned up expired fallback cache entries");
        removed
    }

    /// Drop every registry
    pub async fn shutdown(&self) {
        self.breakers.clear().await;
        self.fallbacks.write().await.clear();
        self.services.write().await.clear();
        self.strategies.write().await.clear();
        info!("Recovery manager shut down");
    }
}
