//! Recovery manager composition tests

mod common;

use common::{manager_config, retry_config};
use pretty_assertions::assert_eq;
use resilience_core::error_recovery::{
    async_callback, fallback_operation, CircuitState, DatabaseReconnectionStrategy,
    ExternalServiceHealthCheckStrategy, FallbackConfig, RecoveryContext, RecoveryManager,
    RecoveryManagerConfig, RecoveryOptions, RecoveryResult, RecoveryStrategy,
    ServiceResilienceConfig,
};
use resilience_core::storage::MemoryStore;
use resilience_core::ResilienceError;
use rstest::rstest;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Records the order in which strategies were consulted
struct RecordingStrategy {
    name: &'static str,
    recovers: bool,
    log: Arc<std::sync::Mutex<Vec<&'static str>>>,
}

#[async_trait::async_trait]
impl RecoveryStrategy for RecordingStrategy {
    fn name(&self) -> &str {
        self.name
    }

    fn can_handle(&self, error: &ResilienceError) -> bool {
        matches!(error, ResilienceError::BusinessRule(_))
    }

    async fn execute(&self, _error: &ResilienceError, _context: &RecoveryContext) -> RecoveryResult {
        self.log.lock().unwrap().push(self.name);
        if self.recovers {
            RecoveryResult::recovered("substituted").with_result(serde_json::json!(self.name))
        } else {
            RecoveryResult::not_recovered("skipped", "cannot help")
        }
    }
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn test_every_retry_attempt_passes_through_breaker(manager_config: RecoveryManagerConfig) {
    let manager = RecoveryManager::new(manager_config);
    let calls = AtomicU32::new(0);

    // threshold 3, retries 3: the breaker opens on the last attempt
    let err = manager
        .execute_with_recovery(
            || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<u32, _>(ResilienceError::network("reset"))
            },
            RecoveryOptions::for_service("crm"),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, ResilienceError::Network(_)));
    assert_eq!(calls.load(Ordering::SeqCst), 3);

    let breaker = manager.circuit_breaker("crm").await.unwrap();
    assert_eq!(breaker.state().await, CircuitState::Open);
    assert_eq!(breaker.get_metrics().await.failures, 3);

    // Next call is rejected without invoking the operation
    let err = manager
        .execute_with_recovery(
            || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(1u32)
            },
            RecoveryOptions::for_service("crm"),
        )
        .await
        .unwrap_err();
    assert!(err.is_circuit_open());
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn test_fallback_serves_open_circuit(manager_config: RecoveryManagerConfig) {
    let manager = RecoveryManager::new(manager_config);

    let value = manager
        .execute_with_recovery(
            || async { Ok("fresh".to_string()) },
            RecoveryOptions::for_service("catalog").cache_key("item:1"),
        )
        .await
        .unwrap();
    assert_eq!(value, "fresh");

    manager
        .circuit_breaker("catalog")
        .await
        .unwrap()
        .force_open("maintenance")
        .await;

    let value = manager
        .execute_with_recovery(
            || async { Ok("never".to_string()) },
            RecoveryOptions::for_service("catalog").cache_key("item:1"),
        )
        .await
        .unwrap();
    assert_eq!(value, "fresh");
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn test_strategy_order_first_recovering_wins(manager_config: RecoveryManagerConfig) {
    let log = Arc::new(std::sync::Mutex::new(Vec::new()));
    let strategy = |name: &'static str, recovers: bool| {
        Arc::new(RecordingStrategy {
            name,
            recovers,
            log: log.clone(),
        })
    };

    let manager = RecoveryManager::builder()
        .config(manager_config)
        .strategy(strategy("first", false))
        .strategy(strategy("second", true))
        .strategy(strategy("third", true))
        .build();

    let value: String = manager
        .execute_with_recovery(
            || async { Err(ResilienceError::business_rule("quota exceeded")) },
            RecoveryOptions::for_service("billing").without_fallback(),
        )
        .await
        .unwrap();

    assert_eq!(value, "second");
    assert_eq!(*log.lock().unwrap(), vec!["first", "second"]);
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn test_reconnection_strategy_reinvokes_operation(manager_config: RecoveryManagerConfig) {
    let connected = Arc::new(AtomicBool::new(false));
    let flag = connected.clone();
    let manager = RecoveryManager::builder()
        .config(manager_config)
        .strategy(Arc::new(
            DatabaseReconnectionStrategy::new(async_callback(move || {
                let flag = flag.clone();
                async move {
                    flag.store(true, Ordering::SeqCst);
                    Ok(())
                }
            }))
            .with_attempts(1, Duration::from_millis(10)),
        ))
        .build();

    let value = manager
        .execute_with_recovery(
            || {
                let up = connected.load(Ordering::SeqCst);
                async move {
                    if up {
                        Ok(7u32)
                    } else {
                        Err(ResilienceError::database_connection_lost("socket closed"))
                    }
                }
            },
            RecoveryOptions::for_service("postgres").retry_config(retry_config(1)),
        )
        .await
        .unwrap();

    assert_eq!(value, 7);
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn test_reconnection_after_breaker_tripped_by_retries(manager_config: RecoveryManagerConfig) {
    let connected = Arc::new(AtomicBool::new(false));
    let flag = connected.clone();
    let store = MemoryStore::new();
    let manager = RecoveryManager::builder()
        .config(manager_config)
        .metrics_store(Arc::new(store.clone()))
        .strategy(Arc::new(
            DatabaseReconnectionStrategy::new(async_callback(move || {
                let flag = flag.clone();
                async move {
                    flag.store(true, Ordering::SeqCst);
                    Ok(())
                }
            }))
            .with_attempts(1, Duration::from_millis(10)),
        ))
        .build();
    let calls = AtomicU32::new(0);

    // threshold 3, retries 3: the retry loop opens the breaker before the strategy runs
    let value = manager
        .execute_with_recovery(
            || {
                calls.fetch_add(1, Ordering::SeqCst);
                let up = connected.load(Ordering::SeqCst);
                async move {
                    if up {
                        Ok(7u32)
                    } else {
                        Err(ResilienceError::database_connection_lost("socket closed"))
                    }
                }
            },
            RecoveryOptions::for_service("postgres").without_fallback(),
        )
        .await
        .unwrap();

    assert_eq!(value, 7);
    assert_eq!(calls.load(Ordering::SeqCst), 4);

    let breaker = manager.circuit_breaker("postgres").await.unwrap();
    assert_eq!(breaker.state().await, CircuitState::Closed);
    assert_eq!(breaker.get_metrics().await.circuit_open_count, 1);

    let metrics = store.metrics().await;
    assert_eq!(metrics.len(), 1);
    assert!(metrics[0].success);
    assert_eq!(metrics[0].recovery_strategy, "database_reconnection");
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn test_unhealthy_service_propagates_original_error(manager_config: RecoveryManagerConfig) {
    let store = MemoryStore::new();
    let manager = RecoveryManager::builder()
        .config(manager_config)
        .metrics_store(Arc::new(store.clone()))
        .strategy(Arc::new(ExternalServiceHealthCheckStrategy::new(async_callback(
            || async { Ok(false) },
        ))))
        .build();

    let err = manager
        .execute_with_recovery(
            || async { Err::<u32, _>(ResilienceError::external_service("502")) },
            RecoveryOptions::for_service("crm")
                .without_circuit_breaker()
                .context(RecoveryContext::new("sync_contacts").with_request_id("req-9")),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, ResilienceError::ExternalService(_)));

    let metrics = store.metrics().await;
    assert_eq!(metrics.len(), 1);
    let metric = &metrics[0];
    assert!(!metric.success);
    assert_eq!(metric.recovery_strategy, "none");
    assert_eq!(metric.attempts, 3);
    assert_eq!(metric.error_category.as_deref(), Some("external_service"));
    assert_eq!(metric.operation_type.as_deref(), Some("sync_contacts"));
    assert_eq!(metric.request_id.as_deref(), Some("req-9"));
    assert_eq!(metric.circuit_breaker_state, None);
}

#[tokio::test(start_paused = true)]
async fn test_registered_service_overrides_defaults() {
    let manager = RecoveryManager::default();
    manager
        .register_service(
            "reports",
            ServiceResilienceConfig {
                retry: retry_config(1),
                fallback: FallbackConfig {
                    fallback_data: Some(serde_json::json!([])),
                    ..Default::default()
                },
                ..Default::default()
            },
        )
        .await;
    let calls = AtomicU32::new(0);

    let rows: Vec<String> = manager
        .execute_with_recovery(
            || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(ResilienceError::network("reset"))
            },
            RecoveryOptions::for_service("reports"),
        )
        .await
        .unwrap();

    assert!(rows.is_empty());
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_fallback_operation_option() {
    let manager = RecoveryManager::default();
    let value = manager
        .execute_with_recovery(
            || async { Err(ResilienceError::validation("bad")) },
            RecoveryOptions::default()
                .without_retry()
                .fallback_operation(fallback_operation(|| async { Ok(3u8) })),
        )
        .await
        .unwrap();
    assert_eq!(value, 3);

    let health = manager.get_health().await;
    assert_eq!(health["default"].metrics.failures, 1);
}
