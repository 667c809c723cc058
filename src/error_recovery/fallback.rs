//! Fallback chain: TTL cache, alternate operation, static data
//!
//! On primary failure the handler tries, in order, a fresh cached value for the
//! cache key, the caller's fallback operation, then configured static data, and
//! finally returns the original error. Only primary successes write the cache.
//!
//! The cache holds one entry per key with no capacity bound; expired entries
//! are dropped by [`FallbackHandler::cleanup_expired`].

use crate::error::{ResilienceError, Result};
use futures::future::BoxFuture;
use futures::FutureExt;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Where the cache sits relative to the primary operation
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheMode {
    /// Call the primary first; consult the cache only on failure
    #[default]
    PrimaryFirst,
    /// Serve a fresh cache hit without calling the primary
    CacheFirst,
}

/// Fallback configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FallbackConfig {
    pub enabled: bool,
    /// Static value returned when everything else failed
    pub fallback_data: Option<serde_json::Value>,
    pub cache_enabled: bool,
    #[serde(with = "humantime_serde")]
    pub cache_ttl: Duration,
    pub mode: CacheMode,
}

impl Default for FallbackConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            fallback_data: None,
            cache_enabled: true,
            cache_ttl: Duration::from_secs(300),
            mode: CacheMode::PrimaryFirst,
        }
    }
}

/// What produced the value returned by [`FallbackHandler::execute_with_source`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FallbackSource {
    Primary,
    Cache,
    FallbackOperation,
    StaticData,
}

impl FallbackSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            FallbackSource::Primary => "primary",
            FallbackSource::Cache => "cache",
            FallbackSource::FallbackOperation => "fallback_operation",
            FallbackSource::StaticData => "static_data",
        }
    }
}

/// Alternate operation tried when the primary fails
pub type FallbackOperation<T> = Box<dyn FnOnce() -> BoxFuture<'static, Result<T>> + Send>;

/// Box a closure into a [`FallbackOperation`]
pub fn fallback_operation<F, Fut, T>(f: F) -> FallbackOperation<T>
where
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = Result<T>> + Send + 'static,
{
    Box::new(move || f().boxed())
}

#[derive(Debug, Clone)]
struct CachedValue {
    value: serde_json::Value,
    cached_at: Instant,
}

/// Fallback handler owning one TTL cache
pub struct FallbackHandler {
    name: String,
    config: FallbackConfig,
    cache: RwLock<HashMap<String, CachedValue>>,
}

impl FallbackHandler {
    pub fn new(name: impl Into<String>, config: FallbackConfig) -> Self {
        Self {
            name: name.into(),
            config,
            cache: RwLock::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &FallbackConfig {
        &self.config
    }

    /// Run `operation`, substituting a fallback value on failure
    pub async fn execute<F, Fut, T>(
        &self,
        operation: F,
        fallback_operation: Option<FallbackOperation<T>>,
        cache_key: Option<&str>,
    ) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
        T: Serialize + DeserializeOwned,
    {
        self.execute_with_source(operation, fallback_operation, cache_key)
            .await
            .map(|(value, _)| value)
    }

    /// Like [`execute`](Self::execute), also reporting what served the value
    pub async fn execute_with_source<F, Fut, T>(
        &self,
        operation: F,
        fallback_operation: Option<FallbackOperation<T>>,
        cache_key: Option<&str>,
    ) -> Result<(T, FallbackSource)>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
        T: Serialize + DeserializeOwned,
    {
        if !self.config.enabled {
            return operation().await.map(|value| (value, FallbackSource::Primary));
        }

        if self.config.mode == CacheMode::CacheFirst {
            if let Some(key) = cache_key {
                if let Some(value) = self.cached(key).await {
                    debug!(
                        event = "fallback.cache_hit",
                        service = %self.name,
                        cache_key = key,
                        "Serving cached value without calling primary"
                    );
                    return Ok((value, FallbackSource::Cache));
                }
            }
        }

        match operation().await {
            Ok(value) => {
                if let Some(key) = cache_key {
                    self.store(key, &value).await;
                }
                Ok((value, FallbackSource::Primary))
            }
            Err(error) => self.resolve(error, fallback_operation, cache_key).await,
        }
    }

    async fn resolve<T>(
        &self,
        error: ResilienceError,
        fallback_operation: Option<FallbackOperation<T>>,
        cache_key: Option<&str>,
    ) -> Result<(T, FallbackSource)>
    where
        T: DeserializeOwned,
    {
        if let Some(key) = cache_key {
            if let Some(value) = self.cached(key).await {
                info!(
                    event = "fallback.cache_hit",
                    service = %self.name,
                    cache_key = key,
                    error = %error,
                    "Using cached fallback"
                );
                return Ok((value, FallbackSource::Cache));
            }
        }

        if let Some(fallback) = fallback_operation {
            match fallback().await {
                Ok(value) => {
                    info!(
                        event = "fallback.operation_used",
                        service = %self.name,
                        error = %error,
                        "Fallback operation succeeded"
                    );
                    return Ok((value, FallbackSource::FallbackOperation));
                }
                Err(fallback_error) => {
                    warn!(
                        service = %self.name,
                        error = %fallback_error,
                        "Fallback operation failed"
                    );
                }
            }
        }

        if let Some(data) = self.config.fallback_data.as_ref().filter(|d| !d.is_null()) {
            match serde_json::from_value(data.clone()) {
                Ok(value) => {
                    info!(
                        event = "fallback.static_data",
                        service = %self.name,
                        error = %error,
                        "Using static fallback data"
                    );
                    return Ok((value, FallbackSource::StaticData));
                }
                Err(e) => {
                    warn!(
                        service = %self.name,
                        error = %e,
                        "Static fallback data does not match the expected type"
                    );
                }
            }
        }

        debug!(
            event = "fallback.exhausted",
            service = %self.name,
            error = %error,
            "No fallback available"
        );
        Err(error)
    }

    async fn cached<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        if !self.config.cache_enabled {
            return None;
        }

        let value = {
            let cache = self.cache.read().await;
            let entry = cache.get(key)?;
            if entry.cached_at.elapsed() >= self.config.cache_ttl {
                return None;
            }
            entry.value.clone()
        };

        match serde_json::from_value(value) {
            Ok(value) => Some(value),
            Err(e) => {
                warn!(
                    service = %self.name,
                    cache_key = key,
                    error = %e,
                    "Failed to deserialize cached value"
                );
                None
            }
        }
    }

    async fn store<T: Serialize>(&self, key: &str, value: &T) {
        if !self.config.cache_enabled {
            return;
        }

        let value = match serde_json::to_value(value) {
            Ok(v) => v,
            Err(e) => {
                warn!("Failed to serialize value for caching: {}", e);
                return;
            }
        };

        self.cache.write().await.insert(
            key.to_string(),
            CachedValue {
                value,
                cached_at: Instant::now(),
            },
        );
        debug!(service = %self.name, cache_key = key, "Cached primary result");
    }

    /// Drop expired entries, returning how many were removed
    pub async fn cleanup_expired(&self) -> usize {
        let ttl = self.config.cache_ttl;
        let mut cache = self.cache.write().await;
        let before = cache.len();
        cache.retain(|_, entry| entry.cached_at.elapsed() < ttl);
        before - cache.len()
    }

    pub async fn invalidate(&self, key: &str) -> bool {
        self.cache.write().await.remove(key).is_some()
    }

    pub async fn clear(&self) {
        self.cache.write().await.clear();
    }

    pub async fn cache_len(&self) -> usize {
        self.cache.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn failing() -> impl Future<Output = Result<u32>> {
        async { Err(ResilienceError::external_service("down")) }
    }

    #[tokio::test]
    async fn test_cache_served_after_primary_failure() {
        let handler = FallbackHandler::new("rates", FallbackConfig::default());

        let value = handler
            .execute(|| async { Ok(7u32) }, None, Some("eur"))
            .await
            .unwrap();
        assert_eq!(value, 7);

        let (value, source) = handler
            .execute_with_source(failing, None, Some("eur"))
            .await
            .unwrap();
        assert_eq!((value, source), (7, FallbackSource::Cache));
    }

    #[tokio::test]
    async fn test_cache_first_skips_primary() {
        let handler = FallbackHandler::new(
            "rates",
            FallbackConfig {
                mode: CacheMode::CacheFirst,
                ..Default::default()
            },
        );
        handler.execute(|| async { Ok(1u32) }, None, Some("k")).await.unwrap();

        let calls = AtomicU32::new(0);
        let (value, source) = handler
            .execute_with_source(
                || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(2u32)
                },
                None,
                Some("k"),
            )
            .await
            .unwrap();

        assert_eq!((value, source), (1, FallbackSource::Cache));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_fallback_operation_does_not_populate_cache() {
        let handler = FallbackHandler::new("svc", FallbackConfig::default());

        let (value, source) = handler
            .execute_with_source(
                failing,
                Some(fallback_operation(|| async { Ok(42u32) })),
                Some("key"),
            )
            .await
            .unwrap();

        assert_eq!((value, source), (42, FallbackSource::FallbackOperation));
        assert_eq!(handler.cache_len().await, 0);
    }

    #[tokio::test]
    async fn test_static_data_then_rethrow() {
        let handler = FallbackHandler::new(
            "svc",
            FallbackConfig {
                fallback_data: Some(serde_json::json!(99)),
                ..Default::default()
            },
        );
        let (value, source) = handler
            .execute_with_source(
                failing,
                Some(fallback_operation(|| async {
                    Err::<u32, _>(ResilienceError::network("also down"))
                })),
                None,
            )
            .await
            .unwrap();
        assert_eq!((value, source), (99, FallbackSource::StaticData));

        let bare = FallbackHandler::new("svc", FallbackConfig::default());
        let err = bare.execute(failing, None, Some("missing")).await.unwrap_err();
        assert!(matches!(err, ResilienceError::ExternalService(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_entries_are_ignored_and_cleaned() {
        let handler = FallbackHandler::new(
            "svc",
            FallbackConfig {
                cache_ttl: Duration::from_secs(60),
                ..Default::default()
            },
        );
        handler.execute(|| async { Ok(5u32) }, None, Some("a")).await.unwrap();

        tokio::time::advance(Duration::from_secs(61)).await;

        assert!(handler.execute(failing, None, Some("a")).await.is_err());
        assert_eq!(handler.cleanup_expired().await, 1);
        assert_eq!(handler.cache_len().await, 0);
    }

    #[tokio::test]
    async fn test_disabled_is_pass_through() {
        let handler = FallbackHandler::new(
            "svc",
            FallbackConfig {
                enabled: false,
                fallback_data: Some(serde_json::json!(1)),
                ..Default::default()
            },
        );
        assert!(handler.execute(failing, None, Some("a")).await.is_err());
        assert!(!handler.invalidate("a").await);
    }
}
