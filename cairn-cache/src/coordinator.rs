//! Request coalescing coordinator.
//!
//! A [`Coordinator`] answers "give me resource `id`" from the fastest tier
//! that holds a valid copy, and makes sure that concurrent callers asking for
//! the same id share a single network load.
//!
//! # Resolution order
//!
//! 1. Memory tier (skipped when forced)
//! 2. An in-flight load for the same id, which the caller joins
//! 3. Persisted tier, if the record is unexpired and version-matching
//!    (skipped when forced)
//! 4. A new network load, registered before the loader is invoked
//!
//! The load runs on its own tokio task. Callers that stop waiting do not
//! cancel it; the tiers and the in-flight registry are updated either way.
//!
//! # Eviction races
//!
//! Every registration carries a generation number. [`Coordinator::evict`]
//! drops the registration along with the cached copies. A load stays
//! registered until its persisted write lands; if it then finds a different
//! (or no) generation in the registry, it skips the memory tier and removes
//! the record it just wrote. Its waiters still receive the value.
//!
//! Persisted reads happen with the lock released. Evictions bump an epoch
//! when they start and when they finish, and a read that overlapped one is
//! discarded in favor of a network load.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use cairn_core::constants::{
    DEFAULT_COORDINATOR_MAX_ENTRIES, DEFAULT_SCHEMA_VERSION, DEFAULT_TTL_SECS,
};
use cairn_core::{
    CacheConfig, CairnResult, ConfigError, LoadError, ResourceCategory, StorageError,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::key::{CacheKey, CacheKeyBuilder};
use crate::loader::NetworkLoader;
use crate::persisted::{PersistedRecord, PersistedTier};

/// Outcome slot shared between a load task and its waiters. `None` until the
/// load settles.
type Outcome<V> = Option<CairnResult<V>>;

// ============================================================================
// CONFIGURATION
// ============================================================================

/// Settings for a single coordinator.
#[derive(Debug, Clone, PartialEq)]
pub struct CoordinatorConfig {
    /// Key namespace, e.g. `hero`.
    pub namespace: String,
    /// Schema version combined with the namespace into the record version.
    pub schema_version: String,
    /// TTL for memory entries and persisted records.
    pub ttl: Duration,
    /// Cap on memory tier entries; the oldest insertion goes first.
    pub max_memory_entries: usize,
    /// Builder for persisted-tier keys and the version string.
    pub key_builder: CacheKeyBuilder,
}

impl CoordinatorConfig {
    /// Defaults for an arbitrary namespace.
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            schema_version: DEFAULT_SCHEMA_VERSION.to_string(),
            ttl: Duration::from_secs(DEFAULT_TTL_SECS),
            max_memory_entries: DEFAULT_COORDINATOR_MAX_ENTRIES,
            key_builder: CacheKeyBuilder::default(),
        }
    }

    /// Settings for a resource category, taken from the cache configuration.
    pub fn for_category(category: ResourceCategory, config: &CacheConfig) -> CairnResult<Self> {
        Ok(Self {
            namespace: category.as_str().to_string(),
            schema_version: config.schema_version.clone(),
            ttl: config.ttl_for(category),
            max_memory_entries: config.coordinator_max_entries,
            key_builder: CacheKeyBuilder::from_config(config)?,
        })
    }

    pub fn with_schema_version(mut self, version: impl Into<String>) -> Self {
        self.schema_version = version.into();
        self
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn with_max_memory_entries(mut self, max: usize) -> Self {
        self.max_memory_entries = max;
        self
    }

    pub fn with_key_builder(mut self, key_builder: CacheKeyBuilder) -> Self {
        self.key_builder = key_builder;
        self
    }
}

// ============================================================================
// STATISTICS
// ============================================================================

/// Snapshot of coordinator activity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoordinatorStats {
    /// Resolves answered by the memory tier.
    pub memory_hits: u64,
    /// Resolves answered by the persisted tier.
    pub persisted_hits: u64,
    /// Network loads started.
    pub loads: u64,
    /// Resolves that attached to a load another caller started.
    pub joins: u64,
    /// Network loads that returned an error or ended without a result.
    pub load_failures: u64,
    /// Loads currently registered.
    pub in_flight: u64,
    /// Entries currently in the memory tier, expired or not.
    pub memory_entries: u64,
}

#[derive(Debug, Default)]
struct Counters {
    memory_hits: AtomicU64,
    persisted_hits: AtomicU64,
    loads: AtomicU64,
    joins: AtomicU64,
    load_failures: AtomicU64,
}

impl Counters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

// ============================================================================
// STATE
// ============================================================================

struct MemoryEntry<V> {
    value: V,
    /// `None` when the TTL is too large to represent.
    expires_at: Option<Instant>,
    sequence: u64,
}

impl<V> MemoryEntry<V> {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |at| now < at)
    }
}

struct InFlight<V> {
    generation: u64,
    outcome: watch::Receiver<Outcome<V>>,
}

/// Memory tier plus in-flight registry, guarded by one mutex. Both maps are
/// keyed by the sanitized cache key, not the caller's raw id.
struct CoordinatorState<V> {
    memory: HashMap<String, MemoryEntry<V>>,
    insertion_order: BTreeMap<u64, String>,
    next_sequence: u64,
    in_flight: HashMap<String, InFlight<V>>,
    next_generation: u64,
    /// Bumped when an eviction starts and again when it finishes.
    eviction_epoch: u64,
    /// Evictions whose persisted remove has not finished.
    evictions_running: usize,
}

impl<V> Default for CoordinatorState<V> {
    fn default() -> Self {
        Self {
            memory: HashMap::new(),
            insertion_order: BTreeMap::new(),
            next_sequence: 0,
            in_flight: HashMap::new(),
            next_generation: 0,
            eviction_epoch: 0,
            evictions_running: 0,
        }
    }
}

impl<V> CoordinatorState<V> {
    fn is_live(&self, slot: &str, now: Instant) -> bool {
        self.memory.get(slot).is_some_and(|entry| entry.is_live(now))
    }

    /// A persisted read that began at `epoch` may be used only if no
    /// eviction started, finished, or is still running since.
    fn persisted_read_usable(&self, epoch: u64) -> bool {
        self.eviction_epoch == epoch && self.evictions_running == 0
    }

    fn remove_memory(&mut self, slot: &str) -> bool {
        match self.memory.remove(slot) {
            Some(entry) => {
                self.insertion_order.remove(&entry.sequence);
                true
            }
            None => false,
        }
    }

    fn insert_memory(&mut self, slot: &str, value: V, ttl: Duration, max_entries: usize) {
        self.remove_memory(slot);
        while self.memory.len() >= max_entries {
            let Some((_, oldest)) = self.insertion_order.pop_first() else {
                break;
            };
            self.memory.remove(&oldest);
        }

        let sequence = self.next_sequence;
        self.next_sequence += 1;
        self.insertion_order.insert(sequence, slot.to_string());
        self.memory.insert(
            slot.to_string(),
            MemoryEntry {
                value,
                expires_at: Instant::now().checked_add(ttl),
                sequence,
            },
        );
    }

    fn clear(&mut self) {
        self.memory.clear();
        self.insertion_order.clear();
        self.in_flight.clear();
    }
}

impl<V: Clone> CoordinatorState<V> {
    /// Live memory value. An expired entry is dropped when observed.
    fn memory_value(&mut self, slot: &str, now: Instant) -> Option<V> {
        let live = self.memory.get(slot)?.is_live(now);
        if live {
            self.memory.get(slot).map(|entry| entry.value.clone())
        } else {
            self.remove_memory(slot);
            None
        }
    }
}

// ============================================================================
// COORDINATOR
// ============================================================================

struct Shared<V> {
    namespace: String,
    version: String,
    ttl: Duration,
    max_memory_entries: usize,
    keys: CacheKeyBuilder,
    loader: Arc<dyn NetworkLoader<V>>,
    persisted: Arc<dyn PersistedTier<V>>,
    state: Mutex<CoordinatorState<V>>,
    counters: Counters,
}

impl<V> Shared<V> {
    fn lock(&self) -> CairnResult<MutexGuard<'_, CoordinatorState<V>>> {
        self.state
            .lock()
            .map_err(|_| StorageError::LockPoisoned.into())
    }

    /// Lock for bookkeeping that must happen even after a panic elsewhere.
    fn lock_for_cleanup(&self) -> MutexGuard<'_, CoordinatorState<V>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Canonical key for `id`. Memory, the registry, and the persisted tier
    /// all use it, so `Anti-Mage` and `anti mage` are one resource.
    fn key_for(&self, id: &str) -> CairnResult<CacheKey> {
        self.keys.build(&self.namespace, id, &[])
    }

    fn deregister(&self, slot: &str, generation: u64) {
        let mut state = self.lock_for_cleanup();
        if state
            .in_flight
            .get(slot)
            .is_some_and(|flight| flight.generation == generation)
        {
            state.in_flight.remove(slot);
        }
    }
}

/// Removes an in-flight registration when the load task ends, including by
/// panic or abort.
struct Registration<V> {
    shared: Arc<Shared<V>>,
    slot: String,
    generation: u64,
    succeeded: bool,
}

impl<V> Drop for Registration<V> {
    fn drop(&mut self) {
        if !self.succeeded {
            Counters::bump(&self.shared.counters.load_failures);
        }
        self.shared.deregister(&self.slot, self.generation);
    }
}

/// Marks an eviction as running until its persisted remove is done, even
/// when the evicting caller stops waiting part way.
struct EvictionInProgress<'a, V> {
    shared: &'a Shared<V>,
}

impl<V> Drop for EvictionInProgress<'_, V> {
    fn drop(&mut self) {
        let mut state = self.shared.lock_for_cleanup();
        state.evictions_running = state.evictions_running.saturating_sub(1);
        state.eviction_epoch += 1;
    }
}

impl<V> Shared<V>
where
    V: Clone + Send + Sync + 'static,
{
    async fn read_persisted(&self, key: &CacheKey) -> Option<V> {
        match self.persisted.get(key.as_str()).await {
            Ok(Some(record)) if record.is_valid_for(&self.version, Utc::now()) => {
                Some(record.value)
            }
            Ok(Some(record)) => {
                tracing::debug!(
                    key = %key,
                    stored_version = %record.version,
                    expected_version = %self.version,
                    "Ignoring stale persisted record"
                );
                None
            }
            Ok(None) => None,
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "Persisted tier read failed, treating as miss");
                None
            }
        }
    }

    async fn write_persisted(&self, key: &CacheKey, value: V) {
        let record = PersistedRecord::new(value, self.version.clone(), self.ttl);
        if let Err(e) = self.persisted.set(key.as_str(), record).await {
            tracing::warn!(key = %key, error = %e, "Persisted tier write failed");
        }
    }

    async fn remove_persisted(&self, key: &CacheKey) {
        if let Err(e) = self.persisted.remove(key.as_str()).await {
            tracing::warn!(key = %key, error = %e, "Persisted tier remove failed");
        }
    }

    /// Register a load for `key` and spawn it. Must be called with the state
    /// lock held so that check-then-register is atomic.
    fn start_load(
        self: &Arc<Self>,
        state: &mut CoordinatorState<V>,
        id: &str,
        key: CacheKey,
        force: bool,
    ) -> watch::Receiver<Outcome<V>> {
        let generation = state.next_generation;
        state.next_generation += 1;

        let (sender, outcome) = watch::channel(None);
        state.in_flight.insert(
            key.as_str().to_string(),
            InFlight {
                generation,
                outcome: outcome.clone(),
            },
        );
        Counters::bump(&self.counters.loads);

        tracing::debug!(
            key = %key,
            generation,
            force,
            "Starting network load"
        );

        let shared = Arc::clone(self);
        let id = id.to_string();
        tokio::spawn(async move {
            shared.run_load(id, key, force, generation, sender).await;
        });

        outcome
    }

    async fn run_load(
        self: Arc<Self>,
        id: String,
        key: CacheKey,
        force: bool,
        generation: u64,
        sender: watch::Sender<Outcome<V>>,
    ) {
        let mut registration = Registration {
            shared: Arc::clone(&self),
            slot: key.as_str().to_string(),
            generation,
            succeeded: false,
        };

        let outcome = self.loader.load(&id, force).await;
        registration.succeeded = outcome.is_ok();

        match &outcome {
            Ok(value) => {
                // Still registered during the write, so an evict that lands
                // meanwhile shows up as a generation change below.
                self.write_persisted(&key, value.clone()).await;
                if !self.settle_success(key.as_str(), generation, value) {
                    tracing::debug!(
                        key = %key,
                        generation,
                        "Load finished after eviction, result not cached"
                    );
                    self.remove_persisted(&key).await;
                }
            }
            Err(e) => {
                tracing::warn!(
                    key = %key,
                    error = %e,
                    "Network load failed"
                );
            }
        }

        drop(registration);
        // No receivers left just means every caller stopped waiting.
        let _ = sender.send(Some(outcome));
    }

    /// Cache a loaded value in memory if the registration is still current.
    /// Returns false when the id was evicted or cleared during the load.
    fn settle_success(&self, slot: &str, generation: u64, value: &V) -> bool {
        let mut state = self.lock_for_cleanup();
        let current = state
            .in_flight
            .get(slot)
            .is_some_and(|flight| flight.generation == generation);
        if !current {
            return false;
        }

        state.in_flight.remove(slot);
        state.insert_memory(slot, value.clone(), self.ttl, self.max_memory_entries);
        true
    }
}

async fn wait_for_outcome<V: Clone>(
    id: &str,
    mut outcome: watch::Receiver<Outcome<V>>,
) -> CairnResult<V> {
    let settled = match outcome.wait_for(Option::is_some).await {
        Ok(settled) => settled.clone(),
        // Sender dropped without a result: the load task panicked or was aborted.
        Err(_) => None,
    };
    settled.unwrap_or_else(|| {
        Err(LoadError::Aborted {
            resource: id.to_string(),
        }
        .into())
    })
}

/// Tiered, coalescing front for one category of remote resource.
///
/// Cloning is cheap and clones share state.
///
/// # Example
///
/// ```ignore
/// let heroes = Coordinator::new(
///     CoordinatorConfig::for_category(ResourceCategory::Hero, &config)?,
///     Arc::new(loader_fn(|id, force| async move { api.hero(&id, force).await })),
///     Arc::new(InMemoryPersistedTier::new()),
/// )?;
///
/// // Ten concurrent calls, one network request.
/// let hero = heroes.resolve("1", false).await?;
/// ```
pub struct Coordinator<V> {
    shared: Arc<Shared<V>>,
}

impl<V> Clone for Coordinator<V> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<V> Coordinator<V>
where
    V: Clone + Send + Sync + 'static,
{
    /// Create a coordinator.
    ///
    /// # Errors
    ///
    /// - [`ConfigError::InvalidValue`] if `max_memory_entries` is zero
    /// - [`KeyError`](cairn_core::KeyError) if the namespace or schema
    ///   version cannot form a key
    pub fn new(
        config: CoordinatorConfig,
        loader: Arc<dyn NetworkLoader<V>>,
        persisted: Arc<dyn PersistedTier<V>>,
    ) -> CairnResult<Self> {
        if config.max_memory_entries == 0 {
            return Err(ConfigError::InvalidValue {
                field: "max_memory_entries".to_string(),
                value: "0".to_string(),
                reason: "must be greater than 0".to_string(),
            }
            .into());
        }

        let version = config
            .key_builder
            .build_version(&config.namespace, &config.schema_version)?
            .into_string();

        Ok(Self {
            shared: Arc::new(Shared {
                namespace: config.namespace,
                version,
                ttl: config.ttl,
                max_memory_entries: config.max_memory_entries,
                keys: config.key_builder,
                loader,
                persisted,
                state: Mutex::new(CoordinatorState::default()),
                counters: Counters::default(),
            }),
        })
    }

    /// The key namespace this coordinator serves.
    pub fn namespace(&self) -> &str {
        &self.shared.namespace
    }

    /// The version string stamped on persisted records, e.g. `hero:v1`.
    pub fn version(&self) -> &str {
        &self.shared.version
    }

    /// TTL applied to memory entries and persisted records.
    pub fn ttl(&self) -> Duration {
        self.shared.ttl
    }

    /// Resolve `id` from the fastest tier holding a valid copy.
    ///
    /// With `force`, both cache tiers are skipped, but a load already in
    /// flight for `id` is joined rather than duplicated. Ids that sanitize
    /// to the same key share one entry and one load; the loader receives the
    /// id of the caller that started it. Must be called from within a tokio
    /// runtime.
    ///
    /// # Errors
    ///
    /// - [`KeyError`](cairn_core::KeyError) if `id` cannot form a key
    /// - the loader's error, unchanged, if the load fails
    /// - [`LoadError::Aborted`] if the load task ends without a result
    pub async fn resolve(&self, id: &str, force: bool) -> CairnResult<V> {
        let shared = &self.shared;
        let key = shared.key_for(id)?;

        let (pending, epoch) = {
            let mut state = shared.lock()?;
            if !force {
                if let Some(value) = state.memory_value(key.as_str(), Instant::now()) {
                    Counters::bump(&shared.counters.memory_hits);
                    return Ok(value);
                }
            }
            let pending = state
                .in_flight
                .get(key.as_str())
                .map(|flight| flight.outcome.clone());
            (pending, state.eviction_epoch)
        };
        if let Some(outcome) = pending {
            return self.join(id, outcome).await;
        }

        if !force {
            if let Some(value) = shared.read_persisted(&key).await {
                let mut state = shared.lock()?;
                if state.persisted_read_usable(epoch) {
                    Counters::bump(&shared.counters.persisted_hits);
                    // A concurrent load or prime may already hold something newer.
                    if !state.is_live(key.as_str(), Instant::now())
                        && !state.in_flight.contains_key(key.as_str())
                    {
                        state.insert_memory(
                            key.as_str(),
                            value.clone(),
                            shared.ttl,
                            shared.max_memory_entries,
                        );
                    }
                    return Ok(value);
                }
                tracing::debug!(key = %key, "Eviction overlapped persisted read, record discarded");
            }
        }

        // The lock was released for the persisted read, so check again.
        let (outcome, joined) = {
            let mut state = shared.lock()?;
            if !force {
                if let Some(value) = state.memory_value(key.as_str(), Instant::now()) {
                    Counters::bump(&shared.counters.memory_hits);
                    return Ok(value);
                }
            }
            let pending = state
                .in_flight
                .get(key.as_str())
                .map(|flight| flight.outcome.clone());
            match pending {
                Some(outcome) => (outcome, true),
                None => (shared.start_load(&mut state, id, key.clone(), force), false),
            }
        };

        if joined {
            self.join(id, outcome).await
        } else {
            wait_for_outcome(id, outcome).await
        }
    }

    async fn join(&self, id: &str, outcome: watch::Receiver<Outcome<V>>) -> CairnResult<V> {
        Counters::bump(&self.shared.counters.joins);
        tracing::debug!(namespace = %self.shared.namespace, id = %id, "Joined in-flight load");
        wait_for_outcome(id, outcome).await
    }

    /// Memory tier lookup only. Never suspends on a load or touches the
    /// persisted tier.
    pub fn peek(&self, id: &str) -> CairnResult<Option<V>> {
        let key = self.shared.key_for(id)?;
        let mut state = self.shared.lock()?;
        Ok(state.memory_value(key.as_str(), Instant::now()))
    }

    /// Write a value through to the memory and persisted tiers without
    /// calling the loader. A load in flight for `id` is left running.
    pub async fn prime(&self, id: &str, value: V) -> CairnResult<()> {
        let shared = &self.shared;
        let key = shared.key_for(id)?;
        {
            let mut state = shared.lock()?;
            state.insert_memory(key.as_str(), value.clone(), shared.ttl, shared.max_memory_entries);
        }
        shared.write_persisted(&key, value).await;
        Ok(())
    }

    /// Drop every trace of `id`: the memory entry, any in-flight
    /// registration, and the persisted record.
    ///
    /// A load still running for `id` completes for its waiters but is not
    /// cached in either tier, and a persisted read overlapping the eviction
    /// is discarded. Returns whether a memory entry or registration existed.
    pub async fn evict(&self, id: &str) -> CairnResult<bool> {
        let shared = &self.shared;
        let key = shared.key_for(id)?;
        let removed = {
            let mut state = shared.lock()?;
            let in_memory = state.remove_memory(key.as_str());
            let in_flight = state.in_flight.remove(key.as_str()).is_some();
            state.eviction_epoch += 1;
            state.evictions_running += 1;
            in_memory || in_flight
        };
        let running = EvictionInProgress {
            shared: shared.as_ref(),
        };

        shared.remove_persisted(&key).await;
        drop(running);

        tracing::debug!(key = %key, removed, "Evicted");
        Ok(removed)
    }

    /// Empty the memory tier and the in-flight registry. Records already in
    /// the persisted tier are left alone; loads still running finish for
    /// their waiters but are not cached.
    pub fn clear(&self) -> CairnResult<()> {
        self.shared.lock()?.clear();
        Ok(())
    }

    /// Number of loads currently registered.
    pub fn in_flight_count(&self) -> usize {
        self.shared.lock_for_cleanup().in_flight.len()
    }

    /// Whether a load for `id` is currently registered.
    pub fn is_in_flight(&self, id: &str) -> bool {
        match self.shared.key_for(id) {
            Ok(key) => self
                .shared
                .lock_for_cleanup()
                .in_flight
                .contains_key(key.as_str()),
            Err(_) => false,
        }
    }

    /// Snapshot of counters and current sizes.
    pub fn stats(&self) -> CoordinatorStats {
        let counters = &self.shared.counters;
        let (in_flight, memory_entries) = {
            let state = self.shared.lock_for_cleanup();
            (state.in_flight.len() as u64, state.memory.len() as u64)
        };
        CoordinatorStats {
            memory_hits: counters.memory_hits.load(Ordering::Relaxed),
            persisted_hits: counters.persisted_hits.load(Ordering::Relaxed),
            loads: counters.loads.load(Ordering::Relaxed),
            joins: counters.joins.load(Ordering::Relaxed),
            load_failures: counters.load_failures.load(Ordering::Relaxed),
            in_flight,
            memory_entries,
        }
    }
}
