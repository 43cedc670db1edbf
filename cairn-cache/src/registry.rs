//! Composition root.
//!
//! A [`CacheRegistry`] is built once at startup and passed by reference. It
//! owns the validated configuration, the key builder, and the cache service,
//! and hands out one [`Coordinator`] per resource category.

use std::sync::Arc;

use cairn_core::{CacheConfig, CairnResult, ResourceCategory};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::coordinator::{Coordinator, CoordinatorConfig};
use crate::key::{CacheKey, CacheKeyBuilder};
use crate::loader::NetworkLoader;
use crate::persisted::{BackendPersistedTier, PersistedTier};
use crate::service::CacheService;
use crate::traits::CacheBackend;

/// Owns the cache subsystem's shared pieces.
pub struct CacheRegistry {
    config: CacheConfig,
    keys: CacheKeyBuilder,
    service: Arc<CacheService>,
}

impl CacheRegistry {
    /// Validate `config` and build a memory-backed registry.
    pub fn new(config: CacheConfig) -> CairnResult<Self> {
        config.validate()?;
        let service = CacheService::from_config(&config);
        Self::assemble(config, service)
    }

    /// Validate `config` and build a registry preferring `external` while it
    /// is healthy.
    pub fn with_external(config: CacheConfig, external: Arc<dyn CacheBackend>) -> CairnResult<Self> {
        config.validate()?;
        let service = CacheService::from_config(&config).with_external(external);
        Self::assemble(config, service)
    }

    /// Build from `CAIRN_*` environment variables.
    pub fn from_env() -> CairnResult<Self> {
        Self::new(CacheConfig::from_env())
    }

    fn assemble(config: CacheConfig, service: CacheService) -> CairnResult<Self> {
        let keys = CacheKeyBuilder::from_config(&config)?;
        tracing::info!(
            max_memory_bytes = config.max_memory_bytes,
            schema_version = %config.schema_version,
            "Cache registry initialized"
        );
        Ok(Self {
            keys,
            service: Arc::new(service),
            config,
        })
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn keys(&self) -> &CacheKeyBuilder {
        &self.keys
    }

    pub fn service(&self) -> &Arc<CacheService> {
        &self.service
    }

    /// Build a key in a category's namespace.
    pub fn key(&self, category: ResourceCategory, identifier: &str, parts: &[&str]) -> CairnResult<CacheKey> {
        self.keys.build_for(category, identifier, parts)
    }

    /// Delete every service entry in a category's namespace.
    pub async fn invalidate_category(&self, category: ResourceCategory) -> CairnResult<u64> {
        let pattern = self.keys.namespace_pattern(category.as_str())?;
        let removed = self.service.invalidate_pattern(&pattern).await?;
        tracing::debug!(category = %category, removed, "Category invalidated");
        Ok(removed)
    }

    /// Build a coordinator for `category` with the configured TTL, memory
    /// cap, and version string.
    pub fn coordinator<V>(
        &self,
        category: ResourceCategory,
        loader: Arc<dyn NetworkLoader<V>>,
        persisted: Arc<dyn PersistedTier<V>>,
    ) -> CairnResult<Coordinator<V>>
    where
        V: Clone + Send + Sync + 'static,
    {
        let settings = CoordinatorConfig::for_category(category, &self.config)?;
        let coordinator = Coordinator::new(settings, loader, persisted)?;
        tracing::debug!(
            category = %category,
            version = coordinator.version(),
            ttl_secs = coordinator.ttl().as_secs(),
            "Coordinator created"
        );
        Ok(coordinator)
    }

    /// Build a coordinator whose persisted tier is this registry's cache
    /// service.
    pub fn service_backed_coordinator<V>(
        &self,
        category: ResourceCategory,
        loader: Arc<dyn NetworkLoader<V>>,
    ) -> CairnResult<Coordinator<V>>
    where
        V: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
    {
        let backend: Arc<dyn CacheBackend> = self.service.clone();
        self.coordinator(category, loader, Arc::new(BackendPersistedTier::new(backend)))
    }

    /// Stop background work. The registry stays usable.
    pub fn shutdown(&self) {
        self.service.destroy();
    }
}
