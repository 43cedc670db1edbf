//! cairn Test Utilities
//!
//! Shared test infrastructure for the cairn workspace:
//! - Mock loaders, backends, and persisted tiers
//! - Proptest generators for keys, values, and configuration
//! - Fixtures for common scenarios
//! - Assertions for cairn error variants

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Semaphore;

// Re-export the crates under test for convenience
pub use cairn_cache::{
    BackendStats, CacheBackend, CacheKeyBuilder, Coordinator, CoordinatorConfig,
    InMemoryPersistedTier, MemoryCacheBackend, NetworkLoader, PersistedRecord, PersistedTier,
};
pub use cairn_core::{
    CacheConfig, CairnError, CairnResult, ConfigError, KeyError, LoadError, ResourceCategory,
    StorageError,
};

// ============================================================================
// TRACING
// ============================================================================

/// Install a fmt subscriber that writes through the test harness.
///
/// Honors `RUST_LOG`, defaulting to `warn`. Safe to call from every test;
/// only the first call installs anything.
pub fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .try_init();
}

// ============================================================================
// MOCK LOADERS
// ============================================================================

type Responder<V> = Box<dyn Fn(&str, u64) -> V + Send + Sync>;

/// Loader that records every call and answers from a response function.
///
/// Optionally gated: each load then waits for a permit handed out by
/// [`release`](Self::release), which lets a test hold a load in flight.
pub struct MockLoader<V> {
    respond: Responder<V>,
    calls: AtomicU64,
    forced_calls: AtomicU64,
    requested: Mutex<Vec<String>>,
    failure: Mutex<Option<LoadError>>,
    gate: Option<Semaphore>,
    delay: Option<Duration>,
}

impl MockLoader<String> {
    /// Answers `"{id}#{call}"`, where `call` counts from 1 across all ids.
    pub fn new() -> Self {
        Self::with_response(|id, call| format!("{}#{}", id, call))
    }
}

impl Default for MockLoader<String> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V> MockLoader<V> {
    /// Answer with `respond(id, call_number)`.
    pub fn with_response(respond: impl Fn(&str, u64) -> V + Send + Sync + 'static) -> Self {
        Self {
            respond: Box::new(respond),
            calls: AtomicU64::new(0),
            forced_calls: AtomicU64::new(0),
            requested: Mutex::new(Vec::new()),
            failure: Mutex::new(None),
            gate: None,
            delay: None,
        }
    }

    /// Make every load wait for a permit from [`release`](Self::release).
    pub fn gated(mut self) -> Self {
        self.gate = Some(Semaphore::new(0));
        self
    }

    /// Sleep before answering.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Let `loads` waiting (or future) loads proceed. No-op when not gated.
    pub fn release(&self, loads: usize) {
        if let Some(gate) = &self.gate {
            gate.add_permits(loads);
        }
    }

    /// Fail every subsequent load with `error`.
    pub fn fail_with(&self, error: LoadError) {
        *self.failure.lock().unwrap_or_else(PoisonError::into_inner) = Some(error);
    }

    /// Stop failing.
    pub fn succeed(&self) {
        *self.failure.lock().unwrap_or_else(PoisonError::into_inner) = None;
    }

    /// Loads started so far.
    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }

    /// Loads started with `force = true`.
    pub fn forced_calls(&self) -> u64 {
        self.forced_calls.load(Ordering::SeqCst)
    }

    /// Ids requested, in call order.
    pub fn requested_ids(&self) -> Vec<String> {
        self.requested
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl<V: Send + 'static> NetworkLoader<V> for MockLoader<V> {
    async fn load(&self, id: &str, force: bool) -> CairnResult<V> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if force {
            self.forced_calls.fetch_add(1, Ordering::SeqCst);
        }
        self.requested
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(id.to_string());

        if let Some(gate) = &self.gate {
            if let Ok(permit) = gate.acquire().await {
                permit.forget();
            }
        }
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let failure = self
            .failure
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        match failure {
            Some(error) => Err(error.into()),
            None => Ok((self.respond)(id, call)),
        }
    }
}

/// Loader that always fails with the same error.
pub struct FailingLoader {
    error: LoadError,
    calls: AtomicU64,
}

impl FailingLoader {
    pub fn new(error: LoadError) -> Self {
        Self {
            error,
            calls: AtomicU64::new(0),
        }
    }

    /// Fails with `LoadError::Failed` for whatever id is requested.
    pub fn upstream_down() -> Self {
        Self::new(LoadError::Failed {
            resource: "upstream".to_string(),
            reason: "service unavailable".to_string(),
        })
    }

    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl<V: Send + 'static> NetworkLoader<V> for FailingLoader {
    async fn load(&self, _id: &str, _force: bool) -> CairnResult<V> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(self.error.clone().into())
    }
}

// ============================================================================
// MOCK BACKENDS
// ============================================================================

/// External backend stand-in whose health can be switched off.
///
/// Storage is a private [`MemoryCacheBackend`], so it behaves like a real
/// backend while healthy. Calls keep working while unhealthy; only
/// `is_healthy` changes.
pub struct FlakyBackend {
    inner: MemoryCacheBackend,
    healthy: AtomicBool,
    health_checks: AtomicU64,
}

impl FlakyBackend {
    pub fn new() -> Self {
        Self {
            inner: MemoryCacheBackend::default(),
            healthy: AtomicBool::new(true),
            health_checks: AtomicU64::new(0),
        }
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::SeqCst);
    }

    /// Direct access to the stored entries, bypassing the health switch.
    pub fn inner(&self) -> &MemoryCacheBackend {
        &self.inner
    }

    /// How many times `is_healthy` has been asked.
    pub fn health_checks(&self) -> u64 {
        self.health_checks.load(Ordering::SeqCst)
    }
}

impl Default for FlakyBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CacheBackend for FlakyBackend {
    fn name(&self) -> &str {
        "flaky"
    }

    async fn get(&self, key: &str) -> CairnResult<Option<Value>> {
        self.inner.get(key)
    }

    async fn set(&self, key: &str, value: Value, ttl: Option<Duration>) -> CairnResult<()> {
        self.inner.set(key, value, ttl)
    }

    async fn delete(&self, key: &str) -> CairnResult<bool> {
        self.inner.delete(key)
    }

    async fn exists(&self, key: &str) -> CairnResult<bool> {
        self.inner.exists(key)
    }

    async fn mget(&self, keys: &[String]) -> CairnResult<Vec<Option<Value>>> {
        self.inner.mget(keys)
    }

    async fn mset(&self, entries: Vec<(String, Value)>, ttl: Option<Duration>) -> CairnResult<()> {
        self.inner.mset(entries, ttl)
    }

    async fn mdelete(&self, keys: &[String]) -> CairnResult<u64> {
        self.inner.mdelete(keys)
    }

    async fn invalidate_pattern(&self, pattern: &str) -> CairnResult<u64> {
        self.inner.invalidate_pattern(pattern)
    }

    async fn stats(&self) -> CairnResult<BackendStats> {
        self.inner.stats()
    }

    async fn clear(&self) -> CairnResult<()> {
        self.inner.clear()
    }

    async fn is_healthy(&self) -> bool {
        self.health_checks.fetch_add(1, Ordering::SeqCst);
        self.healthy.load(Ordering::SeqCst)
    }
}

/// Persisted tier whose every call fails.
#[derive(Debug, Default)]
pub struct FailingPersistedTier {
    reads: AtomicU64,
    writes: AtomicU64,
}

impl FailingPersistedTier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reads(&self) -> u64 {
        self.reads.load(Ordering::SeqCst)
    }

    pub fn writes(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }

    fn unavailable() -> CairnError {
        StorageError::BackendUnavailable {
            backend: "failing-persisted".to_string(),
        }
        .into()
    }
}

#[async_trait]
impl<V> PersistedTier<V> for FailingPersistedTier
where
    V: Send + Sync + 'static,
{
    async fn get(&self, _key: &str) -> CairnResult<Option<PersistedRecord<V>>> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        Err(Self::unavailable())
    }

    async fn set(&self, _key: &str, _record: PersistedRecord<V>) -> CairnResult<()> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        Err(Self::unavailable())
    }

    async fn remove(&self, _key: &str) -> CairnResult<()> {
        Err(Self::unavailable())
    }
}

/// Persisted tier over an [`InMemoryPersistedTier`] whose reads or writes
/// are held open until released.
///
/// A gated read fetches its record first and then waits, so the caller gets
/// whatever was stored when the read began. A gated write waits before it
/// stores anything. Removes are never gated.
pub struct GatedPersistedTier<V> {
    inner: InMemoryPersistedTier<V>,
    read_gate: Option<Semaphore>,
    write_gate: Option<Semaphore>,
    waiting_reads: AtomicU64,
    waiting_writes: AtomicU64,
}

impl<V> GatedPersistedTier<V> {
    fn with_gates(read_gate: Option<Semaphore>, write_gate: Option<Semaphore>) -> Self {
        Self {
            inner: InMemoryPersistedTier::new(),
            read_gate,
            write_gate,
            waiting_reads: AtomicU64::new(0),
            waiting_writes: AtomicU64::new(0),
        }
    }

    /// Reads wait for [`release_reads`](Self::release_reads).
    pub fn gated_reads() -> Self {
        Self::with_gates(Some(Semaphore::new(0)), None)
    }

    /// Writes wait for [`release_writes`](Self::release_writes).
    pub fn gated_writes() -> Self {
        Self::with_gates(None, Some(Semaphore::new(0)))
    }

    pub fn release_reads(&self, reads: usize) {
        if let Some(gate) = &self.read_gate {
            gate.add_permits(reads);
        }
    }

    pub fn release_writes(&self, writes: usize) {
        if let Some(gate) = &self.write_gate {
            gate.add_permits(writes);
        }
    }

    /// Reads currently held at the gate.
    pub fn waiting_reads(&self) -> u64 {
        self.waiting_reads.load(Ordering::SeqCst)
    }

    /// Writes currently held at the gate.
    pub fn waiting_writes(&self) -> u64 {
        self.waiting_writes.load(Ordering::SeqCst)
    }

    /// The underlying records, for seeding and inspection.
    pub fn inner(&self) -> &InMemoryPersistedTier<V> {
        &self.inner
    }
}

async fn pass_gate(gate: &Option<Semaphore>, waiting: &AtomicU64) {
    let Some(gate) = gate else {
        return;
    };
    waiting.fetch_add(1, Ordering::SeqCst);
    if let Ok(permit) = gate.acquire().await {
        permit.forget();
    }
    waiting.fetch_sub(1, Ordering::SeqCst);
}

#[async_trait]
impl<V> PersistedTier<V> for GatedPersistedTier<V>
where
    V: Clone + Send + Sync + 'static,
{
    async fn get(&self, key: &str) -> CairnResult<Option<PersistedRecord<V>>> {
        let record = self.inner.get(key).await?;
        pass_gate(&self.read_gate, &self.waiting_reads).await;
        Ok(record)
    }

    async fn set(&self, key: &str, record: PersistedRecord<V>) -> CairnResult<()> {
        pass_gate(&self.write_gate, &self.waiting_writes).await;
        self.inner.set(key, record).await
    }

    async fn remove(&self, key: &str) -> CairnResult<()> {
        self.inner.remove(key).await
    }
}

// ============================================================================
// PROPTEST GENERATORS
// ============================================================================

pub mod generators {
    //! Proptest strategies for keys, values, and configuration.

    use super::*;
    use proptest::prelude::*;

    /// A raw key component as a caller might pass it: mixed case,
    /// whitespace, punctuation. Always has at least one alphanumeric.
    pub fn arb_raw_component() -> impl Strategy<Value = String> {
        "[a-zA-Z0-9][a-zA-Z0-9 _.-]{0,23}"
    }

    /// A component that is already sanitized.
    pub fn arb_clean_component() -> impl Strategy<Value = String> {
        "[a-z0-9]{1,12}"
    }

    /// Any resource category.
    pub fn arb_category() -> impl Strategy<Value = ResourceCategory> {
        prop::sample::select(ResourceCategory::ALL.to_vec())
    }

    /// A small JSON leaf value.
    pub fn arb_json_value() -> impl Strategy<Value = Value> {
        prop_oneof![
            Just(Value::Null),
            any::<bool>().prop_map(Value::Bool),
            any::<i64>().prop_map(Value::from),
            "[a-zA-Z0-9 ]{0,32}".prop_map(Value::String),
        ]
    }

    /// Entries with distinct keys, in insertion order.
    pub fn arb_distinct_entries(max: usize) -> impl Strategy<Value = Vec<(String, Value)>> {
        prop::collection::vec(arb_json_value(), 1..=max).prop_map(|values| {
            values
                .into_iter()
                .enumerate()
                .map(|(i, value)| (format!("entry:{}", i), value))
                .collect()
        })
    }

    /// A TTL between one second and a day.
    pub fn arb_ttl() -> impl Strategy<Value = Duration> {
        (1u64..86_400).prop_map(Duration::from_secs)
    }

    /// A configuration that passes validation.
    pub fn arb_valid_config() -> impl Strategy<Value = CacheConfig> {
        (
            1usize..(64 * 1024 * 1024),
            arb_ttl(),
            prop::sample::select(vec![":", "/", "|", "::"]),
            16usize..512,
            1usize..10_000,
            "[a-z0-9]{1,6}",
        )
            .prop_map(
                |(bytes, ttl, separator, max_key_length, coordinator_max, version)| {
                    CacheConfig::default()
                        .with_max_memory_bytes(bytes)
                        .with_default_ttl(ttl)
                        .with_key_separator(separator)
                        .with_max_key_length(max_key_length)
                        .with_coordinator_max_entries(coordinator_max)
                        .with_schema_version(version)
                },
            )
    }
}

// ============================================================================
// TEST FIXTURES
// ============================================================================

pub mod fixtures {
    //! Pre-built fixtures for common scenarios.

    use super::*;
    use std::sync::Arc;

    /// Configuration with a small byte budget and short TTLs.
    pub fn small_config(max_memory_bytes: usize) -> CacheConfig {
        CacheConfig::default()
            .with_max_memory_bytes(max_memory_bytes)
            .with_default_ttl(Duration::from_secs(60))
    }

    /// Memory backend with the given budget and a one-minute default TTL.
    pub fn memory_backend(max_memory_bytes: usize) -> MemoryCacheBackend {
        MemoryCacheBackend::new(max_memory_bytes, Duration::from_secs(60))
    }

    /// Hero coordinator over the given loader and persisted tier, with
    /// default settings.
    pub fn hero_coordinator<V>(
        loader: Arc<dyn NetworkLoader<V>>,
        persisted: Arc<dyn PersistedTier<V>>,
    ) -> CairnResult<Coordinator<V>>
    where
        V: Clone + Send + Sync + 'static,
    {
        let config = CoordinatorConfig::for_category(ResourceCategory::Hero, &CacheConfig::default())?;
        Coordinator::new(config, loader, persisted)
    }
}

// ============================================================================
// CUSTOM ASSERTIONS
// ============================================================================

pub mod assertions {
    //! Assertions for cairn error variants.

    use super::*;

    /// Assert that a result is a loader failure of any kind.
    pub fn assert_load_error<T: std::fmt::Debug>(result: &CairnResult<T>) {
        match result {
            Err(e) if e.is_load_failure() => {}
            other => panic!("Expected load error, got {:?}", other),
        }
    }

    /// Assert that a load ended without a result.
    pub fn assert_aborted<T: std::fmt::Debug>(result: &CairnResult<T>) {
        assert!(
            matches!(result, Err(CairnError::Load(LoadError::Aborted { .. }))),
            "Expected aborted load, got {:?}",
            result
        );
    }

    /// Assert a key-too-long error with the given lengths.
    pub fn assert_key_too_long<T: std::fmt::Debug>(result: &CairnResult<T>, length: usize, max: usize) {
        assert_eq!(
            result.as_ref().err(),
            Some(&CairnError::Key(KeyError::TooLong { length, max })),
            "Expected KeyTooLong({}, {}), got {:?}",
            length,
            max,
            result
        );
    }

    /// Assert that a result is a configuration error.
    pub fn assert_config_error<T: std::fmt::Debug>(result: &CairnResult<T>) {
        assert!(
            matches!(result, Err(CairnError::Config(_))),
            "Expected config error, got {:?}",
            result
        );
    }
}
