//! In-process memory cache backend.
//!
//! A bounded, TTL-aware key/value store. Size is tracked as an estimate per
//! entry (key length + serialized JSON length + a fixed overhead) and the
//! aggregate is kept under a byte budget by evicting the oldest insertions
//! first.
//!
//! # Expiry
//!
//! Expiry is lazy: an entry past its `expires_at` is removed the moment a
//! lookup observes it. An optional background sweep
//! ([`MemoryCacheBackend::start_sweeper`]) additionally purges expired
//! entries so `entry_count` stays accurate between lookups.
//!
//! # Thread Safety
//!
//! All state sits behind one `std::sync::Mutex`. No operation suspends, and
//! the lock is never held across an `.await`.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use cairn_core::constants::{DEFAULT_MAX_MEMORY_BYTES, DEFAULT_TTL_SECS, ENTRY_OVERHEAD_BYTES};
use cairn_core::{CacheConfig, CairnResult, StorageError, Timestamp};
use chrono::{DateTime, Utc};
use regex::Regex;
use serde_json::Value;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};

use crate::traits::{BackendStats, CacheBackend};

const BACKEND_NAME: &str = "memory";

/// A stored value plus its bookkeeping. Never leaves the backend.
#[derive(Debug, Clone)]
struct CacheEntry {
    value: Value,
    inserted_at: Timestamp,
    expires_at: Timestamp,
    approx_size_bytes: usize,
    last_accessed_at: Timestamp,
    /// Insertion sequence; orders eviction even when timestamps tie.
    sequence: u64,
}

impl CacheEntry {
    fn is_expired(&self, now: Timestamp) -> bool {
        now >= self.expires_at
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    entries: HashMap<String, CacheEntry>,
    /// sequence -> key, oldest first.
    insertion_order: BTreeMap<u64, String>,
    next_sequence: u64,
    total_bytes: usize,
    hits: u64,
    misses: u64,
    evictions: u64,
    rejections: u64,
}

impl MemoryState {
    fn remove_entry(&mut self, key: &str) -> Option<CacheEntry> {
        let entry = self.entries.remove(key)?;
        self.insertion_order.remove(&entry.sequence);
        self.total_bytes = self.total_bytes.saturating_sub(entry.approx_size_bytes);
        Some(entry)
    }

    /// Evict the oldest insertion. Returns false when nothing is left.
    fn evict_oldest(&mut self) -> bool {
        let Some((_, key)) = self.insertion_order.pop_first() else {
            return false;
        };
        if let Some(entry) = self.entries.remove(&key) {
            self.total_bytes = self.total_bytes.saturating_sub(entry.approx_size_bytes);
            self.evictions += 1;
            tracing::debug!(
                key = %key,
                size_bytes = entry.approx_size_bytes,
                inserted_at = %entry.inserted_at,
                "Evicted cache entry to stay within byte budget"
            );
        }
        true
    }

    fn insert(&mut self, key: String, entry_value: Value, size: usize, ttl: Duration) {
        let now = Utc::now();
        let sequence = self.next_sequence;
        self.next_sequence += 1;

        self.insertion_order.insert(sequence, key.clone());
        self.total_bytes += size;
        self.entries.insert(
            key,
            CacheEntry {
                value: entry_value,
                inserted_at: now,
                expires_at: expiry(now, ttl),
                approx_size_bytes: size,
                last_accessed_at: now,
                sequence,
            },
        );
    }

    fn purge_expired(&mut self, now: Timestamp) -> u64 {
        let expired: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, entry)| entry.is_expired(now))
            .map(|(key, _)| key.clone())
            .collect();

        for key in &expired {
            self.remove_entry(key);
        }
        self.evictions += expired.len() as u64;
        expired.len() as u64
    }
}

/// Handle to the background expiry sweep.
struct Sweeper {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// Bounded, TTL-aware in-process cache backend.
///
/// # Example
///
/// ```ignore
/// let backend = MemoryCacheBackend::new(50 * 1024 * 1024, Duration::from_secs(300));
/// backend.set("hero:anti_mage", json!({"id": 1}), None)?;
/// assert!(backend.get("hero:anti_mage")?.is_some());
/// ```
pub struct MemoryCacheBackend {
    state: Arc<Mutex<MemoryState>>,
    max_bytes: usize,
    default_ttl: Duration,
    created_at: Instant,
    sweeper: Mutex<Option<Sweeper>>,
    sweeps: Arc<AtomicU64>,
}

impl Default for MemoryCacheBackend {
    fn default() -> Self {
        Self::new(
            DEFAULT_MAX_MEMORY_BYTES,
            Duration::from_secs(DEFAULT_TTL_SECS),
        )
    }
}

impl MemoryCacheBackend {
    /// Create a backend with a byte budget and a default TTL.
    pub fn new(max_bytes: usize, default_ttl: Duration) -> Self {
        Self {
            state: Arc::new(Mutex::new(MemoryState::default())),
            max_bytes,
            default_ttl,
            created_at: Instant::now(),
            sweeper: Mutex::new(None),
            sweeps: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Create a backend from a [`CacheConfig`]. The sweep is not started;
    /// call [`start_sweeper`](Self::start_sweeper) from inside a runtime.
    pub fn from_config(config: &CacheConfig) -> Self {
        Self::new(config.max_memory_bytes, config.default_ttl)
    }

    /// The configured byte budget.
    pub fn max_bytes(&self) -> usize {
        self.max_bytes
    }

    /// The TTL used when a caller passes none.
    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    fn lock(&self) -> CairnResult<MutexGuard<'_, MemoryState>> {
        self.state
            .lock()
            .map_err(|_| StorageError::LockPoisoned.into())
    }

    /// Get a value. Counts exactly one hit or miss; an expired entry is
    /// evicted and counted as a miss.
    pub fn get(&self, key: &str) -> CairnResult<Option<Value>> {
        let now = Utc::now();
        let mut guard = self.lock()?;
        let state = &mut *guard;

        match state.entries.get(key).map(|entry| !entry.is_expired(now)) {
            Some(true) => {
                let value = state.entries.get_mut(key).map(|entry| {
                    entry.last_accessed_at = now;
                    entry.value.clone()
                });
                state.hits += 1;
                Ok(value)
            }
            Some(false) => {
                state.remove_entry(key);
                state.evictions += 1;
                state.misses += 1;
                Ok(None)
            }
            None => {
                state.misses += 1;
                Ok(None)
            }
        }
    }

    /// Store a value for `ttl` (or the default TTL).
    ///
    /// A value whose estimated size alone exceeds the byte budget is not
    /// stored, and any previous value under the same key is dropped. This is
    /// not an error.
    pub fn set(&self, key: &str, value: Value, ttl: Option<Duration>) -> CairnResult<()> {
        let size = estimate_size(key, &value)?;
        let ttl = ttl.unwrap_or(self.default_ttl);
        let mut state = self.lock()?;

        state.remove_entry(key);

        if size > self.max_bytes {
            state.rejections += 1;
            tracing::debug!(
                key = %key,
                size_bytes = size,
                max_bytes = self.max_bytes,
                "Value exceeds byte budget, not cached"
            );
            return Ok(());
        }

        while state.total_bytes + size > self.max_bytes {
            if !state.evict_oldest() {
                break;
            }
        }

        state.insert(key.to_string(), value, size, ttl);
        Ok(())
    }

    /// Delete a value, returning whether it existed.
    pub fn delete(&self, key: &str) -> CairnResult<bool> {
        let mut state = self.lock()?;
        Ok(state.remove_entry(key).is_some())
    }

    /// Whether a live value exists. Leaves hit/miss counters alone.
    pub fn exists(&self, key: &str) -> CairnResult<bool> {
        let now = Utc::now();
        let mut state = self.lock()?;

        let expired = match state.entries.get(key) {
            Some(entry) => entry.is_expired(now),
            None => return Ok(false),
        };

        if expired {
            state.remove_entry(key);
            state.evictions += 1;
            return Ok(false);
        }
        Ok(true)
    }

    /// Get several values in order.
    pub fn mget(&self, keys: &[String]) -> CairnResult<Vec<Option<Value>>> {
        keys.iter().map(|key| self.get(key)).collect()
    }

    /// Store several values with the same TTL.
    pub fn mset(&self, entries: Vec<(String, Value)>, ttl: Option<Duration>) -> CairnResult<()> {
        for (key, value) in entries {
            self.set(&key, value, ttl)?;
        }
        Ok(())
    }

    /// Delete several values, returning how many existed.
    pub fn mdelete(&self, keys: &[String]) -> CairnResult<u64> {
        let mut state = self.lock()?;
        Ok(keys
            .iter()
            .filter(|key| state.remove_entry(key).is_some())
            .count() as u64)
    }

    /// Delete every key matching a glob pattern.
    pub fn invalidate_pattern(&self, pattern: &str) -> CairnResult<u64> {
        let matcher = glob_to_regex(pattern)?;
        let mut state = self.lock()?;

        let matching: Vec<String> = state
            .entries
            .keys()
            .filter(|key| matcher.is_match(key))
            .cloned()
            .collect();

        for key in &matching {
            state.remove_entry(key);
        }

        tracing::debug!(pattern = %pattern, deleted = matching.len(), "Invalidated cache pattern");
        Ok(matching.len() as u64)
    }

    /// Snapshot of backend statistics.
    pub fn stats(&self) -> CairnResult<BackendStats> {
        let state = self.lock()?;
        Ok(BackendStats::new(
            state.entries.len() as u64,
            state.hits,
            state.misses,
            self.created_at.elapsed().as_secs(),
        )
        .with_memory(
            state.total_bytes as u64,
            state.evictions,
            state.rejections,
        ))
    }

    /// Remove every entry, keeping cumulative counters.
    pub fn clear(&self) -> CairnResult<()> {
        let mut state = self.lock()?;
        state.entries.clear();
        state.insertion_order.clear();
        state.total_bytes = 0;
        Ok(())
    }

    /// Purge every expired entry now. Returns how many were removed.
    pub fn purge_expired(&self) -> CairnResult<u64> {
        let mut state = self.lock()?;
        Ok(state.purge_expired(Utc::now()))
    }

    /// When a live entry was last read (or written, if never read).
    pub fn last_accessed(&self, key: &str) -> CairnResult<Option<Timestamp>> {
        let now = Utc::now();
        let state = self.lock()?;
        Ok(state
            .entries
            .get(key)
            .filter(|entry| !entry.is_expired(now))
            .map(|entry| entry.last_accessed_at))
    }

    /// True unless the state lock has been poisoned by a panic.
    pub fn is_healthy(&self) -> bool {
        !self.state.is_poisoned()
    }

    /// Number of completed background sweeps.
    pub fn sweep_count(&self) -> u64 {
        self.sweeps.load(Ordering::Relaxed)
    }

    /// Whether a background sweep is running.
    pub fn is_sweeping(&self) -> bool {
        self.sweeper
            .lock()
            .map(|s| s.as_ref().is_some_and(|s| !s.handle.is_finished()))
            .unwrap_or(false)
    }

    /// Start the background expiry sweep on the current tokio runtime.
    ///
    /// Replaces any sweep already running. The task only holds a weak
    /// reference to the store, so dropping the backend also ends it.
    pub fn start_sweeper(&self, period: Duration) -> CairnResult<()> {
        let runtime = tokio::runtime::Handle::try_current().map_err(|e| {
            StorageError::BackendFailed {
                backend: BACKEND_NAME.to_string(),
                reason: format!("cannot start sweeper: {}", e),
            }
        })?;

        self.stop_sweeper();

        let (shutdown, shutdown_rx) = watch::channel(false);
        let state = Arc::downgrade(&self.state);
        let sweeps = Arc::clone(&self.sweeps);
        let handle = runtime.spawn(run_sweeper(state, sweeps, period, shutdown_rx));

        tracing::info!(period_ms = period.as_millis() as u64, "Cache sweeper started");

        let mut slot = self
            .sweeper
            .lock()
            .map_err(|_| StorageError::LockPoisoned)?;
        *slot = Some(Sweeper { shutdown, handle });
        Ok(())
    }

    fn stop_sweeper(&self) {
        let sweeper = match self.sweeper.lock() {
            Ok(mut slot) => slot.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(sweeper) = sweeper {
            let _ = sweeper.shutdown.send(true);
            sweeper.handle.abort();
            tracing::info!("Cache sweeper stopped");
        }
    }

    /// Release the background sweep. Safe to call any number of times.
    pub fn destroy(&self) {
        self.stop_sweeper();
    }
}

impl Drop for MemoryCacheBackend {
    fn drop(&mut self) {
        self.stop_sweeper();
    }
}

async fn run_sweeper(
    state: Weak<Mutex<MemoryState>>,
    sweeps: Arc<AtomicU64>,
    period: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    // The first tick completes immediately.
    ticker.tick().await;

    loop {
        tokio::select! {
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    break;
                }
            }
            _ = ticker.tick() => {
                let Some(store) = state.upgrade() else {
                    break;
                };
                let purged = match store.lock() {
                    Ok(mut guard) => guard.purge_expired(Utc::now()),
                    Err(_) => {
                        tracing::warn!("Cache state poisoned, sweeper exiting");
                        break;
                    }
                };
                sweeps.fetch_add(1, Ordering::Relaxed);
                if purged > 0 {
                    tracing::debug!(purged, "Swept expired cache entries");
                } else {
                    tracing::trace!("Cache sweep found nothing to purge");
                }
            }
        }
    }
}

#[async_trait]
impl CacheBackend for MemoryCacheBackend {
    fn name(&self) -> &str {
        BACKEND_NAME
    }

    async fn get(&self, key: &str) -> CairnResult<Option<Value>> {
        MemoryCacheBackend::get(self, key)
    }

    async fn set(&self, key: &str, value: Value, ttl: Option<Duration>) -> CairnResult<()> {
        MemoryCacheBackend::set(self, key, value, ttl)
    }

    async fn delete(&self, key: &str) -> CairnResult<bool> {
        MemoryCacheBackend::delete(self, key)
    }

    async fn exists(&self, key: &str) -> CairnResult<bool> {
        MemoryCacheBackend::exists(self, key)
    }

    async fn mget(&self, keys: &[String]) -> CairnResult<Vec<Option<Value>>> {
        MemoryCacheBackend::mget(self, keys)
    }

    async fn mset(&self, entries: Vec<(String, Value)>, ttl: Option<Duration>) -> CairnResult<()> {
        MemoryCacheBackend::mset(self, entries, ttl)
    }

    async fn mdelete(&self, keys: &[String]) -> CairnResult<u64> {
        MemoryCacheBackend::mdelete(self, keys)
    }

    async fn invalidate_pattern(&self, pattern: &str) -> CairnResult<u64> {
        MemoryCacheBackend::invalidate_pattern(self, pattern)
    }

    async fn stats(&self) -> CairnResult<BackendStats> {
        MemoryCacheBackend::stats(self)
    }

    async fn clear(&self) -> CairnResult<()> {
        MemoryCacheBackend::clear(self)
    }

    async fn is_healthy(&self) -> bool {
        MemoryCacheBackend::is_healthy(self)
    }
}

/// Estimated footprint of an entry.
pub fn estimate_size(key: &str, value: &Value) -> CairnResult<usize> {
    let payload = serde_json::to_vec(value).map_err(|e| StorageError::Serialization {
        key: key.to_string(),
        reason: e.to_string(),
    })?;
    Ok(key.len() + payload.len() + ENTRY_OVERHEAD_BYTES)
}

/// Translate a glob (`*` = any run of characters) into an anchored regex.
pub fn glob_to_regex(pattern: &str) -> CairnResult<Regex> {
    let literal_runs: Vec<String> = pattern.split('*').map(regex::escape).collect();
    let source = format!("(?s)^{}$", literal_runs.join(".*"));
    Regex::new(&source).map_err(|e| {
        StorageError::InvalidPattern {
            pattern: pattern.to_string(),
            reason: e.to_string(),
        }
        .into()
    })
}

fn expiry(now: Timestamp, ttl: Duration) -> Timestamp {
    chrono::Duration::from_std(ttl)
        .ok()
        .and_then(|ttl| now.checked_add_signed(ttl))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn backend(max_bytes: usize) -> MemoryCacheBackend {
        MemoryCacheBackend::new(max_bytes, Duration::from_secs(60))
    }

    #[test]
    fn test_get_missing_counts_one_miss() {
        let cache = backend(1024);
        assert_eq!(cache.get("hero:1").unwrap(), None);

        let stats = cache.stats().unwrap();
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.hits, 0);
    }

    #[test]
    fn test_set_then_get_hits() {
        let cache = backend(1024);
        cache.set("hero:1", json!({"name": "Anti-Mage"}), None).unwrap();

        assert_eq!(
            cache.get("hero:1").unwrap(),
            Some(json!({"name": "Anti-Mage"}))
        );
        let stats = cache.stats().unwrap();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.entry_count, 1);
        assert!((stats.hit_rate - 1.0).abs() < 0.001);
    }

    #[test]
    fn test_expired_entry_is_evicted_on_get() {
        let cache = backend(1024);
        cache
            .set("hero:1", json!(1), Some(Duration::from_millis(20)))
            .unwrap();
        std::thread::sleep(Duration::from_millis(40));

        assert_eq!(cache.get("hero:1").unwrap(), None);
        let stats = cache.stats().unwrap();
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.entry_count, 0);
        assert_eq!(stats.memory_bytes, 0);
    }

    #[test]
    fn test_zero_ttl_expires_immediately() {
        let cache = backend(1024);
        cache.set("hero:1", json!(1), Some(Duration::ZERO)).unwrap();
        assert!(!cache.exists("hero:1").unwrap());
    }

    #[test]
    fn test_oversize_value_rejected_silently() {
        let cache = backend(100);
        let big = json!("x".repeat(200));

        cache.set("big", big, None).unwrap();
        assert!(!cache.exists("big").unwrap());
        assert!(cache.is_healthy());
        assert_eq!(cache.stats().unwrap().rejections, 1);
    }

    #[test]
    fn test_oversize_replacement_drops_previous_value() {
        let cache = backend(100);
        cache.set("k", json!("small"), None).unwrap();
        cache.set("k", json!("y".repeat(200)), None).unwrap();
        assert_eq!(cache.get("k").unwrap(), None);
    }

    #[test]
    fn test_byte_budget_scenario_keeps_newest() {
        let cache = backend(200);
        cache.set("key1", json!("value1"), None).unwrap();
        cache.set("key2", json!("value2"), None).unwrap();
        cache.set("key3", json!("value3"), None).unwrap();

        let stats = cache.stats().unwrap();
        assert!(stats.entry_count < 3);
        assert!(stats.memory_bytes <= 200);
        assert!(!cache.exists("key1").unwrap());
        assert!(cache.exists("key2").unwrap());
        assert!(cache.exists("key3").unwrap());
        assert_eq!(stats.evictions, 1);
    }

    #[test]
    fn test_overwrite_releases_old_size() {
        let cache = backend(1024);
        cache.set("k", json!("a".repeat(100)), None).unwrap();
        let before = cache.stats().unwrap().memory_bytes;
        cache.set("k", json!("b"), None).unwrap();
        let after = cache.stats().unwrap().memory_bytes;

        assert!(after < before);
        assert_eq!(cache.stats().unwrap().entry_count, 1);
        assert_eq!(after as usize, estimate_size("k", &json!("b")).unwrap());
    }

    #[test]
    fn test_overwrite_moves_key_to_newest() {
        let cache = backend(200);
        cache.set("key1", json!("value1"), None).unwrap();
        cache.set("key2", json!("value2"), None).unwrap();
        cache.set("key1", json!("value1"), None).unwrap();
        cache.set("key3", json!("value3"), None).unwrap();

        assert!(cache.exists("key1").unwrap());
        assert!(!cache.exists("key2").unwrap());
        assert!(cache.exists("key3").unwrap());
    }

    #[test]
    fn test_hit_refreshes_last_accessed() {
        let cache = backend(1024);
        cache.set("k", json!(1), None).unwrap();
        let written = cache.last_accessed("k").unwrap().expect("live entry");
        std::thread::sleep(Duration::from_millis(5));
        cache.get("k").unwrap();
        let read = cache.last_accessed("k").unwrap().expect("live entry");
        assert!(read > written);
        assert_eq!(cache.last_accessed("missing").unwrap(), None);
    }

    #[test]
    fn test_delete_reports_existence() {
        let cache = backend(1024);
        cache.set("k", json!(1), None).unwrap();
        assert!(cache.delete("k").unwrap());
        assert!(!cache.delete("k").unwrap());
    }

    #[test]
    fn test_exists_does_not_touch_counters() {
        let cache = backend(1024);
        cache.set("k", json!(1), None).unwrap();
        assert!(cache.exists("k").unwrap());
        assert!(!cache.exists("missing").unwrap());

        let stats = cache.stats().unwrap();
        assert_eq!(stats.hits, 0);
        assert_eq!(stats.misses, 0);
    }

    #[test]
    fn test_mget_preserves_order() {
        let cache = backend(1024);
        cache
            .mset(
                vec![("a".to_string(), json!(1)), ("c".to_string(), json!(3))],
                None,
            )
            .unwrap();

        let values = cache
            .mget(&["c".to_string(), "b".to_string(), "a".to_string()])
            .unwrap();
        assert_eq!(values, vec![Some(json!(3)), None, Some(json!(1))]);
    }

    #[test]
    fn test_mdelete_counts_only_existing() {
        let cache = backend(1024);
        cache
            .mset(
                vec![("a".to_string(), json!(1)), ("b".to_string(), json!(2))],
                None,
            )
            .unwrap();
        let deleted = cache
            .mdelete(&["a".to_string(), "b".to_string(), "zzz".to_string()])
            .unwrap();
        assert_eq!(deleted, 2);
    }

    #[test]
    fn test_invalidate_pattern_scoped_to_namespace() {
        let cache = backend(4096);
        cache.set("user:1", json!(1), None).unwrap();
        cache.set("user:2:profile", json!(2), None).unwrap();
        cache.set("users:3", json!(3), None).unwrap();
        cache.set("hero:1", json!(4), None).unwrap();

        assert_eq!(cache.invalidate_pattern("user:*").unwrap(), 2);
        assert!(!cache.exists("user:1").unwrap());
        assert!(!cache.exists("user:2:profile").unwrap());
        assert!(cache.exists("users:3").unwrap());
        assert!(cache.exists("hero:1").unwrap());
    }

    #[test]
    fn test_glob_treats_regex_metacharacters_literally() {
        let matcher = glob_to_regex("item.(1)*").unwrap();
        assert!(matcher.is_match("item.(1)"));
        assert!(matcher.is_match("item.(1):stats"));
        assert!(!matcher.is_match("itemx(1)"));

        let exact = glob_to_regex("hero:1").unwrap();
        assert!(exact.is_match("hero:1"));
        assert!(!exact.is_match("hero:10"));
    }

    #[test]
    fn test_clear_keeps_counters() {
        let cache = backend(1024);
        cache.set("k", json!(1), None).unwrap();
        cache.get("k").unwrap();
        cache.get("missing").unwrap();
        cache.clear().unwrap();

        let stats = cache.stats().unwrap();
        assert_eq!(stats.entry_count, 0);
        assert_eq!(stats.memory_bytes, 0);
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
    }

    #[test]
    fn test_purge_expired() {
        let cache = backend(1024);
        cache
            .set("short", json!(1), Some(Duration::from_millis(10)))
            .unwrap();
        cache.set("long", json!(2), None).unwrap();
        std::thread::sleep(Duration::from_millis(30));

        assert_eq!(cache.purge_expired().unwrap(), 1);
        assert_eq!(cache.stats().unwrap().entry_count, 1);
    }

    #[test]
    fn test_destroy_without_sweeper_is_idempotent() {
        let cache = backend(1024);
        cache.destroy();
        cache.destroy();
        assert!(cache.is_healthy());
    }

    #[tokio::test]
    async fn test_sweeper_purges_and_destroy_stops_it() {
        let cache = backend(1024);
        cache
            .set("short", json!(1), Some(Duration::from_millis(10)))
            .unwrap();
        cache.start_sweeper(Duration::from_millis(20)).unwrap();
        assert!(cache.is_sweeping());

        tokio::time::sleep(Duration::from_millis(120)).await;
        assert_eq!(cache.stats().unwrap().entry_count, 0);
        assert!(cache.sweep_count() > 0);

        cache.destroy();
        cache.destroy();
        tokio::task::yield_now().await;
        assert!(!cache.is_sweeping());
    }

    #[test]
    fn test_start_sweeper_outside_runtime_errors() {
        let cache = backend(1024);
        assert!(cache.start_sweeper(Duration::from_secs(1)).is_err());
    }

    #[tokio::test]
    async fn test_trait_object_dispatch() {
        let cache: Arc<dyn CacheBackend> = Arc::new(backend(1024));
        cache.set("k", json!("v"), None).await.unwrap();
        assert_eq!(cache.get("k").await.unwrap(), Some(json!("v")));
        assert_eq!(cache.name(), "memory");
        assert!(cache.is_healthy().await);
    }
}
