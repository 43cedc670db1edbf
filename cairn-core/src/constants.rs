//! Constants for cairn
//!
//! Defaults for every configurable knob live here so they are easy to find
//! and share between `CacheConfig::default()` and `CacheConfig::from_env()`.

// ============================================================================
// MEMORY BACKEND
// ============================================================================

/// Default byte budget for the memory backend (50 MiB)
pub const DEFAULT_MAX_MEMORY_BYTES: usize = 50 * 1024 * 1024;

/// Default entry TTL in seconds (5 minutes)
pub const DEFAULT_TTL_SECS: u64 = 300;

/// Fixed bookkeeping overhead added to every entry's size estimate
pub const ENTRY_OVERHEAD_BYTES: usize = 64;

// ============================================================================
// KEYS
// ============================================================================

/// Default separator between key components
pub const DEFAULT_KEY_SEPARATOR: &str = ":";

/// Default maximum length of an assembled key
pub const DEFAULT_MAX_KEY_LENGTH: usize = 250;

// ============================================================================
// COORDINATOR
// ============================================================================

/// Default cap on entries held in a coordinator's memory tier
pub const DEFAULT_COORDINATOR_MAX_ENTRIES: usize = 1000;

/// Default schema version stamped on persisted records
pub const DEFAULT_SCHEMA_VERSION: &str = "v1";

// ============================================================================
// PER-CATEGORY TTLS
// ============================================================================

/// Heroes change only with game patches (24 hours)
pub const HERO_TTL_SECS: u64 = 86_400;

/// Item data changes only with game patches (24 hours)
pub const ITEM_TTL_SECS: u64 = 86_400;

/// Finished matches are immutable (1 hour)
pub const MATCH_TTL_SECS: u64 = 3_600;

/// Player profiles update after every game (5 minutes)
pub const PLAYER_TTL_SECS: u64 = 300;

/// Team rosters change occasionally (30 minutes)
pub const TEAM_TTL_SECS: u64 = 1_800;
