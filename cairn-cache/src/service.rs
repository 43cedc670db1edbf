//! Cache service facade.
//!
//! [`CacheService`] fronts an optional external distributed backend and the
//! in-process [`MemoryCacheBackend`]. Each call checks the external backend's
//! health and falls back to memory when it is unset or unhealthy. State is
//! never merged between the two: a value written to the external backend is
//! not visible through the memory backend after a fallback, and vice versa.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use cairn_core::{CacheConfig, CairnError, CairnResult, ResourceCategory, StorageError};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::memory::MemoryCacheBackend;
use crate::traits::{BackendStats, CacheBackend};

/// Which backend served a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Memory,
    External,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendKind::Memory => write!(f, "memory"),
            BackendKind::External => write!(f, "external"),
        }
    }
}

/// Facade that routes every backend call to the external backend when it is
/// healthy, else to the memory backend.
///
/// # Example
///
/// ```ignore
/// let service = CacheService::from_config(&config).with_external(redis);
/// service.set_for(ResourceCategory::Hero, "hero:axe", json!({"id": 2})).await?;
/// let kind = service.active_backend_kind().await;
/// ```
pub struct CacheService {
    memory: Arc<MemoryCacheBackend>,
    external: Option<Arc<dyn CacheBackend>>,
    config: CacheConfig,
    degraded: AtomicBool,
}

impl CacheService {
    /// Create a service over an existing memory backend.
    pub fn new(memory: Arc<MemoryCacheBackend>, config: CacheConfig) -> Self {
        Self {
            memory,
            external: None,
            config,
            degraded: AtomicBool::new(false),
        }
    }

    /// Create a service with a memory backend sized from `config`.
    ///
    /// When `config.sweep_interval` is set and a tokio runtime is running,
    /// the memory backend's expiry sweep is started.
    pub fn from_config(config: &CacheConfig) -> Self {
        let memory = Arc::new(MemoryCacheBackend::from_config(config));
        if let Some(interval) = config.sweep_interval {
            if let Err(e) = memory.start_sweeper(interval) {
                tracing::warn!(error = %e, "Expiry sweep not started");
            }
        }
        Self::new(memory, config.clone())
    }

    /// Attach an external backend, preferred while it reports healthy.
    pub fn with_external(mut self, backend: Arc<dyn CacheBackend>) -> Self {
        tracing::info!(backend = backend.name(), "External cache backend configured");
        self.external = Some(backend);
        self
    }

    /// The memory backend used as the fallback.
    pub fn memory(&self) -> &Arc<MemoryCacheBackend> {
        &self.memory
    }

    /// The external backend, if configured.
    pub fn external(&self) -> Option<&Arc<dyn CacheBackend>> {
        self.external.as_ref()
    }

    /// Configuration the service was built with.
    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    async fn active(&self) -> (&dyn CacheBackend, BackendKind) {
        if let Some(external) = &self.external {
            if external.is_healthy().await {
                if self.degraded.swap(false, Ordering::Relaxed) {
                    tracing::info!(backend = external.name(), "External cache backend recovered");
                }
                let external: &dyn CacheBackend = external.as_ref();
                return (external, BackendKind::External);
            }
            if !self.degraded.swap(true, Ordering::Relaxed) {
                tracing::warn!(
                    backend = external.name(),
                    "External cache backend unhealthy, falling back to memory"
                );
            }
        }
        let memory: &dyn CacheBackend = self.memory.as_ref();
        (memory, BackendKind::Memory)
    }

    /// The backend the next call would be routed to.
    pub async fn active_backend_kind(&self) -> BackendKind {
        self.active().await.1
    }

    /// Get a value and decode it into `T`.
    ///
    /// # Errors
    ///
    /// [`StorageError::Serialization`] if the stored value does not decode.
    pub async fn get_json<T: DeserializeOwned>(&self, key: &str) -> CairnResult<Option<T>> {
        let Some(raw) = self.get(key).await? else {
            return Ok(None);
        };
        serde_json::from_value(raw)
            .map(Some)
            .map_err(|e| serialization(key, e))
    }

    /// Encode `value` as JSON and store it.
    pub async fn set_json<T: Serialize + ?Sized>(
        &self,
        key: &str,
        value: &T,
        ttl: Option<Duration>,
    ) -> CairnResult<()> {
        let raw = serde_json::to_value(value).map_err(|e| serialization(key, e))?;
        self.set(key, raw, ttl).await
    }

    /// Store a value with the TTL configured for `category`.
    pub async fn set_for(
        &self,
        category: ResourceCategory,
        key: &str,
        value: Value,
    ) -> CairnResult<()> {
        self.set(key, value, Some(self.config.ttl_for(category))).await
    }

    /// Stop the memory backend's background sweep. Idempotent. The service
    /// remains usable.
    pub fn destroy(&self) {
        self.memory.destroy();
    }
}

fn serialization(key: &str, e: serde_json::Error) -> CairnError {
    StorageError::Serialization {
        key: key.to_string(),
        reason: e.to_string(),
    }
    .into()
}

#[async_trait]
impl CacheBackend for CacheService {
    fn name(&self) -> &str {
        "service"
    }

    async fn get(&self, key: &str) -> CairnResult<Option<Value>> {
        self.active().await.0.get(key).await
    }

    async fn set(&self, key: &str, value: Value, ttl: Option<Duration>) -> CairnResult<()> {
        self.active().await.0.set(key, value, ttl).await
    }

    async fn delete(&self, key: &str) -> CairnResult<bool> {
        self.active().await.0.delete(key).await
    }

    async fn exists(&self, key: &str) -> CairnResult<bool> {
        self.active().await.0.exists(key).await
    }

    async fn mget(&self, keys: &[String]) -> CairnResult<Vec<Option<Value>>> {
        self.active().await.0.mget(keys).await
    }

    async fn mset(&self, entries: Vec<(String, Value)>, ttl: Option<Duration>) -> CairnResult<()> {
        self.active().await.0.mset(entries, ttl).await
    }

    async fn mdelete(&self, keys: &[String]) -> CairnResult<u64> {
        self.active().await.0.mdelete(keys).await
    }

    async fn invalidate_pattern(&self, pattern: &str) -> CairnResult<u64> {
        self.active().await.0.invalidate_pattern(pattern).await
    }

    async fn stats(&self) -> CairnResult<BackendStats> {
        self.active().await.0.stats().await
    }

    async fn clear(&self) -> CairnResult<()> {
        self.active().await.0.clear().await
    }

    async fn is_healthy(&self) -> bool {
        self.active().await.0.is_healthy().await
    }
}
