//! Circuit breaker pattern implementation for resilient error recovery
//!
//! A breaker guards one named dependency. After `failure_threshold`
//! consecutive failures it opens and rejects calls without invoking them
//! until `recovery_timeout` has elapsed; the first call after that is let
//! through as a half-open probe.
//!
//! State checks and transitions happen under the breaker's lock, but the lock
//! is not held while the wrapped operation runs. Several callers can therefore
//! be in flight during `HalfOpen`; the breaker does not limit probes to one.

use crate::error::{ResilienceError, Result};
use crate::storage::{CircuitBreakerEventRecord, CircuitEventStore};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    /// Circuit is closed - normal operation
    Closed,
    /// Circuit is open - operations blocked
    Open,
    /// Circuit is half-open - testing if service recovered
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "CLOSED",
            CircuitState::Open => "OPEN",
            CircuitState::HalfOpen => "HALF_OPEN",
        }
    }
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Circuit breaker configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures in `Closed` before opening
    pub failure_threshold: u32,
    /// Consecutive half-open successes before closing
    pub success_threshold: u32,
    /// Cool-down after the last failure before a probe is allowed
    #[serde(with = "humantime_serde")]
    pub recovery_timeout: Duration,
    /// Window over which the rolling failure rate is computed
    #[serde(with = "humantime_serde")]
    pub monitoring_window: Duration,
    /// Force-fail calls running longer than this
    #[serde(with = "humantime_serde")]
    pub call_timeout: Option<Duration>,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 3,
            recovery_timeout: Duration::from_secs(60),
            monitoring_window: Duration::from_secs(300),
            call_timeout: None,
        }
    }
}

impl CircuitBreakerConfig {
    /// Create configuration for critical services
    pub fn critical_service() -> Self {
        Self {
            failure_threshold: 3,
            success_threshold: 5,
            recovery_timeout: Duration::from_secs(10),
            monitoring_window: Duration::from_secs(30),
            call_timeout: Some(Duration::from_secs(5)),
        }
    }

    /// Create configuration for non-critical services
    pub fn non_critical_service() -> Self {
        Self {
            failure_threshold: 10,
            success_threshold: 2,
            recovery_timeout: Duration::from_secs(120),
            monitoring_window: Duration::from_secs(600),
            call_timeout: None,
        }
    }
}

/// Per-call metrics maintained by the breaker
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CircuitBreakerMetrics {
    /// Every call presented to the breaker, rejected ones included
    pub requests: u64,
    pub successes: u64,
    pub failures: u64,
    /// Failures caused by the call timeout
    pub timeouts: u64,
    /// Calls refused while open
    pub rejections: u64,
    /// Failure share over the monitoring window
    pub failure_rate: f64,
    pub average_response_time_ms: f64,
    pub last_failure: Option<DateTime<Utc>>,
    pub last_success: Option<DateTime<Utc>>,
    pub next_attempt_time: Option<DateTime<Utc>>,
    pub circuit_open_count: u64,
}

/// Circuit breaker statistics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerStats {
    pub name: String,
    pub state: CircuitState,
    /// Consecutive failures in the current closed period
    pub failure_count: u32,
    /// Consecutive successes in the current half-open period
    pub success_count: u32,
    pub metrics: CircuitBreakerMetrics,
}

/// State transition event
#[derive(Debug, Clone, Serialize)]
pub struct CircuitBreakerEvent {
    pub circuit: String,
    pub previous_state: CircuitState,
    pub new_state: CircuitState,
    pub trigger_reason: String,
    pub failure_count: u32,
    pub success_count: u32,
    pub call_timeout: Option<Duration>,
    pub recovery_timeout: Duration,
    pub timestamp: DateTime<Utc>,
    pub metadata: serde_json::Value,
}

/// Circuit breaker listener trait
#[async_trait::async_trait]
pub trait CircuitBreakerListener: Send + Sync {
    /// Called after every state transition
    async fn on_transition(&self, event: &CircuitBreakerEvent);
}

/// Internal circuit breaker state
struct BreakerState {
    current_state: CircuitState,
    failure_count: u32,
    success_count: u32,
    next_attempt_at: Option<Instant>,
    outcomes: VecDeque<(Instant, bool)>,
    total_response_time: Duration,
    completed_calls: u64,
    metrics: CircuitBreakerMetrics,
}

impl BreakerState {
    fn new() -> Self {
        Self {
            current_state: CircuitState::Closed,
            failure_count: 0,
            success_count: 0,
            next_attempt_at: None,
            outcomes: VecDeque::new(),
            total_response_time: Duration::ZERO,
            completed_calls: 0,
            metrics: CircuitBreakerMetrics::default(),
        }
    }
}

/// Circuit breaker implementation
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    state: RwLock<BreakerState>,
    listeners: RwLock<Vec<Arc<dyn CircuitBreakerListener>>>,
}

impl CircuitBreaker {
    /// Create new circuit breaker
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self::with_listeners(name, config, Vec::new())
    }

    /// Create a breaker with listeners already attached
    pub fn with_listeners(
        name: impl Into<String>,
        config: CircuitBreakerConfig,
        listeners: Vec<Arc<dyn CircuitBreakerListener>>,
    ) -> Self {
        Self {
            name: name.into(),
            config,
            state: RwLock::new(BreakerState::new()),
            listeners: RwLock::new(listeners),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Run `operation` through the breaker.
    ///
    /// Returns [`ResilienceError::CircuitOpen`] without calling `operation`
    /// while the circuit is open and the recovery timeout has not elapsed.
    pub async fn execute<F, Fut, T>(&self, operation: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.run(operation, self.config.call_timeout).await
    }

    /// Run `operation` and force a failure if it takes longer than `timeout`.
    ///
    /// The operation future is dropped when the timer fires.
    pub async fn execute_with_timeout<F, Fut, T>(&self, operation: F, timeout: Duration) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.run(operation, Some(timeout)).await
    }

    async fn run<F, Fut, T>(&self, operation: F, timeout: Option<Duration>) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.acquire_permit().await?;

        let started = Instant::now();
        let mut timed_out = false;
        let outcome = match timeout {
            Some(limit) => match tokio::time::timeout(limit, operation()).await {
                Ok(result) => result,
                Err(_) => {
                    timed_out = true;
                    Err(ResilienceError::timeout(format!(
                        "circuit '{}' call exceeded {}ms",
                        self.name,
                        limit.as_millis()
                    )))
                }
            },
            None => operation().await,
        };
        let elapsed = started.elapsed();

        match &outcome {
            Ok(_) => self.on_success(elapsed).await,
            Err(error) => self.on_failure(error, elapsed, timed_out).await,
        }

        outcome
    }

    /// Admit or reject a call, moving `Open` to `HalfOpen` once eligible
    async fn acquire_permit(&self) -> Result<()> {
        let mut events = Vec::new();
        let verdict = {
            let mut state = self.state.write().await;
            state.metrics.requests += 1;

            match state.current_state {
                CircuitState::Closed | CircuitState::HalfOpen => Ok(()),
                CircuitState::Open => {
                    let eligible = state
                        .next_attempt_at
                        .map(|at| Instant::now() >= at)
                        .unwrap_or(true);
                    if eligible {
                        events.push(self.transition(
                            &mut state,
                            CircuitState::HalfOpen,
                            "recovery timeout elapsed",
                        ));
                        info!(
                            event = "circuit_breaker.probe",
                            circuit = %self.name,
                            "Circuit breaker half-open, allowing probe request"
                        );
                        Ok(())
                    } else {
                        state.metrics.rejections += 1;
                        debug!(
                            event = "circuit_breaker.rejected",
                            circuit = %self.name,
                            failure_count = state.failure_count,
                            "Circuit breaker open, rejecting request"
                        );
                        Err(ResilienceError::CircuitOpen {
                            circuit: self.name.clone(),
                            state: state.current_state,
                            failure_count: state.failure_count,
                            next_attempt: state.metrics.next_attempt_time,
                        })
                    }
                }
            }
        };

        self.notify(events).await;
        verdict
    }

    async fn on_success(&self, elapsed: Duration) {
        let mut events = Vec::new();
        {
            let mut state = self.state.write().await;
            self.record_outcome(&mut state, true, elapsed);
            state.metrics.successes += 1;
            state.metrics.last_success = Some(Utc::now());

            match state.current_state {
                CircuitState::Closed => {
                    state.failure_count = 0;
                }
                CircuitState::HalfOpen => {
                    state.success_count += 1;
                    debug!(
                        circuit = %self.name,
                        success_count = state.success_count,
                        threshold = self.config.success_threshold,
                        "Half-open probe succeeded"
                    );
                    if state.success_count >= self.config.success_threshold {
                        events.push(self.transition(
                            &mut state,
                            CircuitState::Closed,
                            "success threshold reached",
                        ));
                        info!(
                            event = "circuit_breaker.closed",
                            circuit = %self.name,
                            "Circuit breaker closed after successful recovery"
                        );
                    }
                }
                CircuitState::Open => {
                    debug!(circuit = %self.name, "Success recorded for a call admitted before opening");
                }
            }
        }
        self.notify(events).await;
    }

    async fn on_failure(&self, error: &ResilienceError, elapsed: Duration, timed_out: bool) {
        let mut events = Vec::new();
        {
            let mut state = self.state.write().await;
            self.record_outcome(&mut state, false, elapsed);
            state.metrics.failures += 1;
            if timed_out {
                state.metrics.timeouts += 1;
            }
            state.metrics.last_failure = Some(Utc::now());

            match state.current_state {
                CircuitState::Closed => {
                    state.failure_count += 1;
                    if state.failure_count >= self.config.failure_threshold {
                        let failures = state.failure_count;
                        events.push(self.transition(
                            &mut state,
                            CircuitState::Open,
                            &format!("failure threshold reached: {error}"),
                        ));
                        state.failure_count = failures;
                        error!(
                            event = "circuit_breaker.opened",
                            circuit = %self.name,
                            failure_count = failures,
                            "Circuit breaker opened after {} failures",
                            failures
                        );
                    }
                }
                CircuitState::HalfOpen => {
                    state.failure_count += 1;
                    let failures = state.failure_count;
                    events.push(self.transition(
                        &mut state,
                        CircuitState::Open,
                        &format!("half-open probe failed: {error}"),
                    ));
                    state.failure_count = failures;
                    warn!(
                        event = "circuit_breaker.reopened",
                        circuit = %self.name,
                        "Circuit breaker reopened after failed probe"
                    );
                }
                CircuitState::Open => {
                    // Probe eligibility counts from the latest failure
                    state.next_attempt_at = Some(Instant::now() + self.config.recovery_timeout);
                    state.metrics.next_attempt_time =
                        chrono::Duration::from_std(self.config.recovery_timeout)
                            .ok()
                            .map(|d| Utc::now() + d);
                    debug!(circuit = %self.name, "Failure recorded while circuit is open");
                }
            }
        }
        self.notify(events).await;
    }

    fn record_outcome(&self, state: &mut BreakerState, success: bool, elapsed: Duration) {
        let now = Instant::now();
        state.outcomes.push_back((now, success));
        while let Some((at, _)) = state.outcomes.front() {
            if now.duration_since(*at) > self.config.monitoring_window {
                state.outcomes.pop_front();
            } else {
                break;
            }
        }
        let failed = state.outcomes.iter().filter(|(_, ok)| !ok).count();
        state.metrics.failure_rate = if state.outcomes.is_empty() {
            0.0
        } else {
            failed as f64 / state.outcomes.len() as f64
        };

        state.completed_calls += 1;
        state.total_response_time += elapsed;
        state.metrics.average_response_time_ms =
            state.total_response_time.as_secs_f64() * 1000.0 / state.completed_calls as f64;
    }

    /// Apply a transition and build the event describing it
    fn transition(
        &self,
        state: &mut BreakerState,
        new_state: CircuitState,
        reason: &str,
    ) -> CircuitBreakerEvent {
        let previous_state = state.current_state;
        let event = CircuitBreakerEvent {
            circuit: self.name.clone(),
            previous_state,
            new_state,
            trigger_reason: reason.to_string(),
            failure_count: state.failure_count,
            success_count: state.success_count,
            call_timeout: self.config.call_timeout,
            recovery_timeout: self.config.recovery_timeout,
            timestamp: Utc::now(),
            metadata: serde_json::json!({
                "failure_rate": state.metrics.failure_rate,
                "requests": state.metrics.requests,
            }),
        };

        state.current_state = new_state;
        state.success_count = 0;
        state.failure_count = 0;
        match new_state {
            CircuitState::Open => {
                state.next_attempt_at = Some(Instant::now() + self.config.recovery_timeout);
                state.metrics.next_attempt_time = chrono::Duration::from_std(
                    self.config.recovery_timeout,
                )
                .ok()
                .map(|d| Utc::now() + d);
                state.metrics.circuit_open_count += 1;
            }
            CircuitState::Closed | CircuitState::HalfOpen => {
                state.next_attempt_at = None;
                state.metrics.next_attempt_time = None;
            }
        }

        info!(
            event = "circuit_breaker.state_changed",
            circuit = %self.name,
            from = %previous_state,
            to = %new_state,
            reason,
            "State transition: {} -> {}",
            previous_state,
            new_state
        );
        event
    }

    async fn notify(&self, events: Vec<CircuitBreakerEvent>) {
        if events.is_empty() {
            return;
        }
        let listeners = self.listeners.read().await.clone();
        for event in &events {
            for listener in &listeners {
                listener.on_transition(event).await;
            }
        }
    }

    /// Current state
    pub async fn state(&self) -> CircuitState {
        self.state.read().await.current_state
    }

    /// Get current statistics
    pub async fn get_stats(&self) -> CircuitBreakerStats {
        let state = self.state.read().await;
        CircuitBreakerStats {
            name: self.name.clone(),
            state: state.current_state,
            failure_count: state.failure_count,
            success_count: state.success_count,
            metrics: state.metrics.clone(),
        }
    }

    /// Get current metrics
    pub async fn get_metrics(&self) -> CircuitBreakerMetrics {
        self.state.read().await.metrics.clone()
    }

    /// Reset circuit breaker to closed, keeping cumulative metrics
    pub async fn reset(&self) {
        let mut events = Vec::new();
        {
            let mut state = self.state.write().await;
            if state.current_state != CircuitState::Closed {
                events.push(self.transition(&mut state, CircuitState::Closed, "manual reset"));
            }
            state.failure_count = 0;
            state.success_count = 0;
            state.outcomes.clear();
            state.metrics.failure_rate = 0.0;
        }
        info!(circuit = %self.name, "Circuit breaker reset to closed state");
        self.notify(events).await;
    }

    /// Open the circuit manually
    pub async fn force_open(&self, reason: &str) {
        let mut events = Vec::new();
        {
            let mut state = self.state.write().await;
            let failures = state.failure_count;
            events.push(self.transition(
                &mut state,
                CircuitState::Open,
                &format!("forced open: {reason}"),
            ));
            state.failure_count = failures;
        }
        warn!(circuit = %self.name, reason, "Circuit breaker forced open");
        self.notify(events).await;
    }

    /// Move an open circuit to half-open without waiting for the recovery
    /// timeout, so the next call runs as a probe. Returns whether it was open.
    pub async fn allow_probe(&self, reason: &str) -> bool {
        let mut events = Vec::new();
        {
            let mut state = self.state.write().await;
            if state.current_state != CircuitState::Open {
                return false;
            }
            events.push(self.transition(
                &mut state,
                CircuitState::HalfOpen,
                &format!("probe requested: {reason}"),
            ));
        }
        info!(
            event = "circuit_breaker.probe",
            circuit = %self.name,
            reason,
            "Circuit breaker half-open on request"
        );
        self.notify(events).await;
        true
    }

    /// Add event listener
    pub async fn add_listener(&self, listener: Arc<dyn CircuitBreakerListener>) {
        self.listeners.write().await.push(listener);
    }
}

/// Listener persisting every transition to a [`CircuitEventStore`]
pub struct EventStoreListener {
    store: Arc<dyn CircuitEventStore>,
    company_id: Option<String>,
}

impl EventStoreListener {
    pub fn new(store: Arc<dyn CircuitEventStore>) -> Self {
        Self {
            store,
            company_id: None,
        }
    }

    /// Scope persisted events to a tenant
    pub fn for_company(mut self, company_id: impl Into<String>) -> Self {
        self.company_id = Some(company_id.into());
        self
    }
}

#[async_trait::async_trait]
impl CircuitBreakerListener for EventStoreListener {
    async fn on_transition(&self, event: &CircuitBreakerEvent) {
        let record = CircuitBreakerEventRecord {
            circuit_name: event.circuit.clone(),
            previous_state: event.previous_state,
            new_state: event.new_state,
            trigger_reason: event.trigger_reason.clone(),
            failure_count: event.failure_count,
            success_count: event.success_count,
            timeout_ms: event.call_timeout.map(|d| d.as_millis() as u64),
            recovery_timeout_ms: event.recovery_timeout.as_millis() as u64,
            metadata: event.metadata.clone(),
            company_id: self.company_id.clone(),
            created_at: event.timestamp,
        };

        if let Err(e) = self.store.record_transition(record).await {
            warn!(
                circuit = %event.circuit,
                error = %e,
                "Failed to persist circuit breaker transition"
            );
        }
    }
}

/// Named circuit breakers, created lazily
pub struct CircuitBreakerRegistry {
    breakers: RwLock<HashMap<String, Arc<CircuitBreaker>>>,
    listeners: Vec<Arc<dyn CircuitBreakerListener>>,
}

impl CircuitBreakerRegistry {
    pub fn new(listeners: Vec<Arc<dyn CircuitBreakerListener>>) -> Self {
        Self {
            breakers: RwLock::new(HashMap::new()),
            listeners,
        }
    }

    /// Get or create circuit breaker for service
    pub async fn get_or_create(&self, name: &str, config: CircuitBreakerConfig) -> Arc<CircuitBreaker> {
        if let Some(breaker) = self.breakers.read().await.get(name) {
            return breaker.clone();
        }

        let mut breakers = self.breakers.write().await;
        breakers
            .entry(name.to_string())
            .or_insert_with(|| {
                info!("Created new circuit breaker for service: {}", name);
                Arc::new(CircuitBreaker::with_listeners(
                    name,
                    config,
                    self.listeners.clone(),
                ))
            })
            .clone()
    }

    pub async fn get(&self, name: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers.read().await.get(name).cloned()
    }

    /// Get all circuit breaker statistics
    pub async fn get_all_stats(&self) -> HashMap<String, CircuitBreakerStats> {
        let breakers: Vec<_> = self
            .breakers
            .read()
            .await
            .iter()
            .map(|(name, breaker)| (name.clone(), breaker.clone()))
            .collect();

        let mut stats = HashMap::new();
        for (name, breaker) in breakers {
            stats.insert(name, breaker.get_stats().await);
        }
        stats
    }

    /// Reset all circuit breakers
    pub async fn reset_all(&self) {
        let breakers: Vec<_> = self.breakers.read().await.values().cloned().collect();
        for breaker in breakers {
            breaker.reset().await;
        }
    }

    /// Drop every breaker
    pub async fn clear(&self) {
        self.breakers.write().await.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn config(threshold: u32, recovery: Duration) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: threshold,
            success_threshold: 2,
            recovery_timeout: recovery,
            ..Default::default()
        }
    }

    async fn fail(breaker: &CircuitBreaker) -> ResilienceError {
        breaker
            .execute(|| async { Err::<(), _>(ResilienceError::connection("refused")) })
            .await
            .unwrap_err()
    }

    async fn succeed(breaker: &CircuitBreaker) -> Result<()> {
        breaker.execute(|| async { Ok(()) }).await
    }

    #[tokio::test(start_paused = true)]
    async fn test_circuit_breaker_basic() {
        let breaker = CircuitBreaker::new("db", config(3, Duration::from_millis(100)));

        for _ in 0..3 {
            let err = fail(&breaker).await;
            assert!(!err.is_circuit_open());
        }
        assert_eq!(breaker.state().await, CircuitState::Open);

        let calls = AtomicU32::new(0);
        let err = breaker
            .execute(|| async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .await
            .unwrap_err();
        assert!(err.is_circuit_open());
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        tokio::time::advance(Duration::from_millis(150)).await;

        succeed(&breaker).await.unwrap();
        assert_eq!(breaker.state().await, CircuitState::HalfOpen);
        succeed(&breaker).await.unwrap();
        assert_eq!(breaker.state().await, CircuitState::Closed);

        let stats = breaker.get_stats().await;
        assert_eq!(stats.metrics.rejections, 1);
        assert_eq!(stats.metrics.circuit_open_count, 1);
        assert_eq!(stats.failure_count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_failure_reopens() {
        let breaker = CircuitBreaker::new("api", config(1, Duration::from_secs(10)));
        fail(&breaker).await;
        tokio::time::advance(Duration::from_secs(10)).await;

        succeed(&breaker).await.unwrap();
        assert_eq!(breaker.get_stats().await.success_count, 1);

        fail(&breaker).await;
        let stats = breaker.get_stats().await;
        assert_eq!(stats.state, CircuitState::Open);
        assert_eq!(stats.success_count, 0);
        assert!(succeed(&breaker).await.unwrap_err().is_circuit_open());
    }

    #[tokio::test]
    async fn test_success_in_closed_resets_consecutive_failures() {
        let breaker = CircuitBreaker::new("svc", config(3, Duration::from_secs(60)));
        fail(&breaker).await;
        fail(&breaker).await;
        succeed(&breaker).await.unwrap();
        fail(&breaker).await;
        fail(&breaker).await;

        let stats = breaker.get_stats().await;
        assert_eq!(stats.state, CircuitState::Closed);
        assert_eq!(stats.failure_count, 2);
        assert_eq!(stats.metrics.failures, 4);
        assert!((stats.metrics.failure_rate - 0.8).abs() < f64::EPSILON);
    }

    #[tokio::test(start_paused = true)]
    async fn test_call_timeout_counts_as_failure() {
        let breaker = CircuitBreaker::new(
            "slow",
            CircuitBreakerConfig {
                failure_threshold: 1,
                call_timeout: Some(Duration::from_millis(50)),
                ..Default::default()
            },
        );

        let err = breaker
            .execute(|| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            })
            .await
            .unwrap_err();

        assert!(matches!(err, ResilienceError::Timeout(_)));
        let stats = breaker.get_stats().await;
        assert_eq!(stats.metrics.timeouts, 1);
        assert_eq!(stats.state, CircuitState::Open);
    }

    #[tokio::test]
    async fn test_transitions_are_persisted() {
        let store = Arc::new(MemoryStore::new());
        let listener: Arc<dyn CircuitBreakerListener> =
            Arc::new(EventStoreListener::new(store.clone()).for_company("acme"));
        let breaker = CircuitBreaker::with_listeners("mail", config(1, Duration::ZERO), vec![listener]);

        fail(&breaker).await;
        breaker.reset().await;

        let events = store.transitions().await;
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].new_state, CircuitState::Open);
        assert_eq!(events[0].failure_count, 1);
        assert_eq!(events[0].company_id.as_deref(), Some("acme"));
        assert_eq!(events[1].trigger_reason, "manual reset");
    }

    #[tokio::test]
    async fn test_force_open_and_registry() {
        let registry = CircuitBreakerRegistry::new(Vec::new());
        let a = registry.get_or_create("a", CircuitBreakerConfig::default()).await;
        let again = registry.get_or_create("a", CircuitBreakerConfig::critical_service()).await;
        assert!(Arc::ptr_eq(&a, &again));

        a.force_open("maintenance").await;
        assert!(succeed(&a).await.unwrap_err().is_circuit_open());

        registry.reset_all().await;
        assert_eq!(a.state().await, CircuitState::Closed);
        assert_eq!(registry.get_all_stats().await.len(), 1);
    }
}
