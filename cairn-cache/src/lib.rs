//! cairn Cache - Tiered Caching and Request Coalescing
//!
//! Keeps a rate-limited remote API from being hit more than necessary:
//!
//! - [`key`]: structured, sanitized cache keys and invalidation patterns
//! - [`memory`]: bounded, TTL-aware in-process backend with hit/miss accounting
//! - [`service`]: facade choosing an external backend when healthy, else memory
//! - [`coordinator`]: memory → in-flight → persisted → network resolution with
//!   at most one outstanding load per id
//! - [`registry`]: composition root that wires the pieces from one config
//!
//! Shared types (errors, configuration, resource categories) live in
//! `cairn-core`.

pub mod coordinator;
pub mod key;
pub mod loader;
pub mod memory;
pub mod persisted;
pub mod registry;
pub mod service;
pub mod traits;

pub use coordinator::{Coordinator, CoordinatorConfig, CoordinatorStats};
pub use key::{CacheKey, CacheKeyBuilder, ParsedKey, WILDCARD};
pub use loader::{loader_fn, FnLoader, NetworkLoader};
pub use memory::{estimate_size, glob_to_regex, MemoryCacheBackend};
pub use persisted::{
    BackendPersistedTier, InMemoryPersistedTier, NoPersistence, PersistedRecord, PersistedTier,
};
pub use registry::CacheRegistry;
pub use service::{BackendKind, CacheService};
pub use traits::{BackendStats, CacheBackend};

// Re-export core types for convenience
pub use cairn_core::{
    CacheConfig, CairnError, CairnResult, ConfigError, KeyError, LoadError, ResourceCategory,
    StorageError,
};
