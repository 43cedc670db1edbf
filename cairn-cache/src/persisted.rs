//! Persisted tier contract.
//!
//! The persisted tier is slower than memory but survives restarts. Its medium
//! is not owned here: callers hand the coordinator anything implementing
//! [`PersistedTier`]. Two implementations ship with the crate:
//!
//! - [`InMemoryPersistedTier`] for tests and hosts without durable storage
//! - [`BackendPersistedTier`], which stores records in any [`CacheBackend`]

use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use cairn_core::{CairnResult, DurationMs, StorageError, Timestamp};
use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::traits::CacheBackend;

/// A record as stored in the persisted tier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedRecord<V> {
    pub value: V,
    /// Namespace/version string the record was written under, e.g. `hero:v3`.
    pub version: String,
    pub ttl_ms: DurationMs,
    pub written_at: Timestamp,
}

impl<V> PersistedRecord<V> {
    /// Create a record stamped with the current time.
    pub fn new(value: V, version: impl Into<String>, ttl: Duration) -> Self {
        Self {
            value,
            version: version.into(),
            ttl_ms: ttl.as_millis().min(u64::MAX as u128) as u64,
            written_at: Utc::now(),
        }
    }

    /// Whether the record's TTL has elapsed at `now`.
    pub fn is_expired(&self, now: Timestamp) -> bool {
        let age_ms = now
            .signed_duration_since(self.written_at)
            .num_milliseconds()
            .max(0) as u64;
        age_ms >= self.ttl_ms
    }

    /// Whether the record is unexpired and was written under `version`.
    pub fn is_valid_for(&self, version: &str, now: Timestamp) -> bool {
        self.version == version && !self.is_expired(now)
    }

    /// TTL as a `Duration`.
    pub fn ttl(&self) -> Duration {
        Duration::from_millis(self.ttl_ms)
    }
}

/// Slower persisted storage consulted after memory and before the network.
///
/// Reads and writes are awaited but expected to be quick; the coordinator
/// neither retries nor times them out. Implementations may drop records on
/// their own when the version or TTL no longer matches.
#[async_trait]
pub trait PersistedTier<V>: Send + Sync
where
    V: Send + Sync + 'static,
{
    /// Fetch the record stored under `key`.
    async fn get(&self, key: &str) -> CairnResult<Option<PersistedRecord<V>>>;

    /// Store a record under `key`.
    async fn set(&self, key: &str, record: PersistedRecord<V>) -> CairnResult<()>;

    /// Drop the record under `key`. Tiers that cannot delete may ignore this.
    async fn remove(&self, key: &str) -> CairnResult<()> {
        let _ = key;
        Ok(())
    }
}

/// A tier that stores nothing. Every read misses.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoPersistence;

#[async_trait]
impl<V> PersistedTier<V> for NoPersistence
where
    V: Send + Sync + 'static,
{
    async fn get(&self, _key: &str) -> CairnResult<Option<PersistedRecord<V>>> {
        Ok(None)
    }

    async fn set(&self, _key: &str, _record: PersistedRecord<V>) -> CairnResult<()> {
        Ok(())
    }
}

/// In-memory persisted tier for testing.
///
/// Uses tokio::sync::RwLock for safe async access. Expired records are
/// dropped when read.
#[derive(Debug)]
pub struct InMemoryPersistedTier<V> {
    records: tokio::sync::RwLock<HashMap<String, PersistedRecord<V>>>,
}

impl<V> Default for InMemoryPersistedTier<V> {
    fn default() -> Self {
        Self {
            records: tokio::sync::RwLock::new(HashMap::new()),
        }
    }
}

impl<V> InMemoryPersistedTier<V> {
    /// Create an empty tier.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of records currently held, expired or not.
    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    /// Whether the tier holds no records.
    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }
}

impl<V: Clone> InMemoryPersistedTier<V> {
    /// Insert a record directly, bypassing the coordinator.
    pub async fn insert(&self, key: impl Into<String>, record: PersistedRecord<V>) {
        self.records.write().await.insert(key.into(), record);
    }

    /// Read a record without the expiry check.
    pub async fn peek(&self, key: &str) -> Option<PersistedRecord<V>> {
        self.records.read().await.get(key).cloned()
    }
}

#[async_trait]
impl<V> PersistedTier<V> for InMemoryPersistedTier<V>
where
    V: Clone + Send + Sync + 'static,
{
    async fn get(&self, key: &str) -> CairnResult<Option<PersistedRecord<V>>> {
        let now = Utc::now();
        let mut records = self.records.write().await;
        match records.get(key) {
            Some(record) if record.is_expired(now) => {
                records.remove(key);
                Ok(None)
            }
            Some(record) => Ok(Some(record.clone())),
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, record: PersistedRecord<V>) -> CairnResult<()> {
        self.records.write().await.insert(key.to_string(), record);
        Ok(())
    }

    async fn remove(&self, key: &str) -> CairnResult<()> {
        self.records.write().await.remove(key);
        Ok(())
    }
}

/// Persisted tier that stores JSON-encoded records in a [`CacheBackend`].
///
/// The backend's own TTL is set from the record, so the backend expires
/// records on its own schedule as well.
pub struct BackendPersistedTier<V> {
    backend: Arc<dyn CacheBackend>,
    _value: PhantomData<fn() -> V>,
}

impl<V> BackendPersistedTier<V> {
    /// Wrap a backend.
    pub fn new(backend: Arc<dyn CacheBackend>) -> Self {
        Self {
            backend,
            _value: PhantomData,
        }
    }
}

#[async_trait]
impl<V> PersistedTier<V> for BackendPersistedTier<V>
where
    V: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    async fn get(&self, key: &str) -> CairnResult<Option<PersistedRecord<V>>> {
        let Some(raw) = self.backend.get(key).await? else {
            return Ok(None);
        };
        let record = serde_json::from_value(raw).map_err(|e| StorageError::Serialization {
            key: key.to_string(),
            reason: e.to_string(),
        })?;
        Ok(Some(record))
    }

    async fn set(&self, key: &str, record: PersistedRecord<V>) -> CairnResult<()> {
        let ttl = record.ttl();
        let raw = serde_json::to_value(&record).map_err(|e| StorageError::Serialization {
            key: key.to_string(),
            reason: e.to_string(),
        })?;
        self.backend.set(key, raw, Some(ttl)).await
    }

    async fn remove(&self, key: &str) -> CairnResult<()> {
        self.backend.delete(key).await.map(|_| ())
    }
}
