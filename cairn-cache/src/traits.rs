//! Cache backend contract and statistics.
//!
//! Both the in-process [`MemoryCacheBackend`](crate::MemoryCacheBackend) and
//! any external distributed store plugged into the
//! [`CacheService`](crate::CacheService) implement [`CacheBackend`], so the
//! service can swap them at call time without callers noticing.

use std::time::Duration;

use async_trait::async_trait;
use cairn_core::CairnResult;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Cache backend trait for pluggable cache implementations.
///
/// Values are opaque JSON payloads. Implementations must be thread-safe and
/// must never return an error for an ordinary miss, expiry, or eviction;
/// errors are reserved for misuse or a backend that cannot serve at all.
///
/// # TTL
///
/// `ttl = None` means "use the backend's default TTL".
#[async_trait]
pub trait CacheBackend: Send + Sync {
    /// Short name used in logs and stats.
    fn name(&self) -> &str;

    /// Get a value. Counts exactly one hit or miss.
    async fn get(&self, key: &str) -> CairnResult<Option<Value>>;

    /// Store a value. A value too large to ever fit is dropped silently.
    async fn set(&self, key: &str, value: Value, ttl: Option<Duration>) -> CairnResult<()>;

    /// Delete a value, returning whether it existed.
    async fn delete(&self, key: &str) -> CairnResult<bool>;

    /// Whether a live value exists. Does not count as a hit or miss.
    async fn exists(&self, key: &str) -> CairnResult<bool>;

    /// Get several values, preserving the order of `keys`.
    async fn mget(&self, keys: &[String]) -> CairnResult<Vec<Option<Value>>>;

    /// Store several values with the same TTL.
    async fn mset(&self, entries: Vec<(String, Value)>, ttl: Option<Duration>) -> CairnResult<()>;

    /// Delete several values, returning how many actually existed.
    async fn mdelete(&self, keys: &[String]) -> CairnResult<u64>;

    /// Delete every key matching a glob pattern (`*` matches any run of
    /// characters, across separators). Returns the number deleted.
    async fn invalidate_pattern(&self, pattern: &str) -> CairnResult<u64>;

    /// Snapshot of backend statistics.
    async fn stats(&self) -> CairnResult<BackendStats>;

    /// Remove every entry. Cumulative hit/miss counters are kept.
    async fn clear(&self) -> CairnResult<()>;

    /// False only when the backend cannot serve requests at all.
    async fn is_healthy(&self) -> bool;
}

/// Statistics about cache usage.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BackendStats {
    /// Number of live entries currently stored.
    pub entry_count: u64,
    /// Cumulative hits since creation.
    pub hits: u64,
    /// Cumulative misses since creation.
    pub misses: u64,
    /// `hits / (hits + misses)`, or 0 before any lookup.
    pub hit_rate: f64,
    /// Complement of `hit_rate`, or 0 before any lookup.
    pub miss_rate: f64,
    /// Seconds since the backend was created.
    pub uptime_seconds: u64,
    /// Approximate bytes held.
    pub memory_bytes: u64,
    /// Entries removed to make room or because they expired.
    pub evictions: u64,
    /// Values refused because they alone exceed the byte budget.
    pub rejections: u64,
}

impl BackendStats {
    /// Build a snapshot, deriving the hit and miss rates from the counters.
    pub fn new(entry_count: u64, hits: u64, misses: u64, uptime_seconds: u64) -> Self {
        let (hit_rate, miss_rate) = rates(hits, misses);
        Self {
            entry_count,
            hits,
            misses,
            hit_rate,
            miss_rate,
            uptime_seconds,
            ..Default::default()
        }
    }

    /// Attach memory accounting to a snapshot.
    pub fn with_memory(mut self, memory_bytes: u64, evictions: u64, rejections: u64) -> Self {
        self.memory_bytes = memory_bytes;
        self.evictions = evictions;
        self.rejections = rejections;
        self
    }

    /// Total lookups recorded.
    pub fn lookups(&self) -> u64 {
        self.hits + self.misses
    }
}

fn rates(hits: u64, misses: u64) -> (f64, f64) {
    let total = hits + misses;
    if total == 0 {
        (0.0, 0.0)
    } else {
        let hit_rate = hits as f64 / total as f64;
        (hit_rate, 1.0 - hit_rate)
    }
}
