//! Configuration types

use crate::constants::*;
use crate::*;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// Master configuration for the cache subsystem.
///
/// Every knob the subsystem owns lives here: the memory byte budget, TTLs
/// (a default plus optional per-category overrides), key shape, the optional
/// background sweep, and coordinator sizing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Maximum aggregate estimated size held by the memory backend.
    pub max_memory_bytes: usize,
    /// TTL applied when a caller does not pass one.
    pub default_ttl: Duration,
    /// Per-category TTL overrides. Categories without an override use
    /// [`ResourceCategory::default_ttl`].
    pub category_ttls: BTreeMap<ResourceCategory, Duration>,
    /// Separator between key components.
    pub key_separator: String,
    /// Maximum length of an assembled key.
    pub max_key_length: usize,
    /// Interval of the background expiry sweep, if enabled.
    pub sweep_interval: Option<Duration>,
    /// Cap on entries held in each coordinator's memory tier.
    pub coordinator_max_entries: usize,
    /// Schema version stamped on persisted records.
    pub schema_version: String,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_memory_bytes: DEFAULT_MAX_MEMORY_BYTES,
            default_ttl: Duration::from_secs(DEFAULT_TTL_SECS),
            category_ttls: BTreeMap::new(),
            key_separator: DEFAULT_KEY_SEPARATOR.to_string(),
            max_key_length: DEFAULT_MAX_KEY_LENGTH,
            sweep_interval: None,
            coordinator_max_entries: DEFAULT_COORDINATOR_MAX_ENTRIES,
            schema_version: DEFAULT_SCHEMA_VERSION.to_string(),
        }
    }
}

impl CacheConfig {
    /// Create a new config with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create from environment variables with fallback to defaults.
    ///
    /// Environment variables:
    /// - `CAIRN_MAX_MEMORY_BYTES`: Memory byte budget (default: 50 MiB)
    /// - `CAIRN_DEFAULT_TTL_SECS`: Default TTL (default: 300)
    /// - `CAIRN_KEY_SEPARATOR`: Key separator (default: `:`)
    /// - `CAIRN_MAX_KEY_LENGTH`: Maximum key length (default: 250)
    /// - `CAIRN_SWEEP_INTERVAL_SECS`: Enables the expiry sweep (default: off)
    /// - `CAIRN_COORDINATOR_MAX_ENTRIES`: Coordinator memory cap (default: 1000)
    /// - `CAIRN_SCHEMA_VERSION`: Persisted schema version (default: `v1`)
    /// - `CAIRN_{HERO,ITEM,MATCH,PLAYER,TEAM}_TTL_SECS`: Per-category TTLs
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let mut category_ttls = BTreeMap::new();
        for category in ResourceCategory::ALL {
            let var = format!("CAIRN_{}_TTL_SECS", category.as_str().to_uppercase());
            if let Some(secs) = env_parse::<u64>(&var) {
                category_ttls.insert(category, Duration::from_secs(secs));
            }
        }

        Self {
            max_memory_bytes: env_parse("CAIRN_MAX_MEMORY_BYTES")
                .unwrap_or(defaults.max_memory_bytes),
            default_ttl: env_parse("CAIRN_DEFAULT_TTL_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.default_ttl),
            category_ttls,
            key_separator: std::env::var("CAIRN_KEY_SEPARATOR")
                .unwrap_or(defaults.key_separator),
            max_key_length: env_parse("CAIRN_MAX_KEY_LENGTH").unwrap_or(defaults.max_key_length),
            sweep_interval: env_parse("CAIRN_SWEEP_INTERVAL_SECS").map(Duration::from_secs),
            coordinator_max_entries: env_parse("CAIRN_COORDINATOR_MAX_ENTRIES")
                .unwrap_or(defaults.coordinator_max_entries),
            schema_version: std::env::var("CAIRN_SCHEMA_VERSION")
                .unwrap_or(defaults.schema_version),
        }
    }

    /// Set the memory byte budget.
    pub fn with_max_memory_bytes(mut self, bytes: usize) -> Self {
        self.max_memory_bytes = bytes;
        self
    }

    /// Set the default TTL.
    pub fn with_default_ttl(mut self, ttl: Duration) -> Self {
        self.default_ttl = ttl;
        self
    }

    /// Override the TTL for one resource category.
    pub fn with_category_ttl(mut self, category: ResourceCategory, ttl: Duration) -> Self {
        self.category_ttls.insert(category, ttl);
        self
    }

    /// Set the key separator.
    pub fn with_key_separator(mut self, separator: impl Into<String>) -> Self {
        self.key_separator = separator.into();
        self
    }

    /// Set the maximum key length.
    pub fn with_max_key_length(mut self, max: usize) -> Self {
        self.max_key_length = max;
        self
    }

    /// Enable the background expiry sweep.
    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = Some(interval);
        self
    }

    /// Set the coordinator memory tier cap.
    pub fn with_coordinator_max_entries(mut self, max: usize) -> Self {
        self.coordinator_max_entries = max;
        self
    }

    /// Set the persisted schema version.
    pub fn with_schema_version(mut self, version: impl Into<String>) -> Self {
        self.schema_version = version.into();
        self
    }

    /// TTL for a resource category, honoring overrides.
    pub fn ttl_for(&self, category: ResourceCategory) -> Duration {
        self.category_ttls
            .get(&category)
            .copied()
            .unwrap_or_else(|| category.default_ttl())
    }

    /// Validate the configuration.
    /// Returns Ok(()) if valid, Err(CairnError::Config) if invalid.
    ///
    /// Validates:
    /// - max_memory_bytes > 0
    /// - every TTL and the sweep interval are positive
    /// - the separator is non-empty and cannot appear inside a sanitized component
    /// - max_key_length leaves room for at least a namespace and identifier
    /// - coordinator_max_entries > 0 and schema_version is non-empty
    pub fn validate(&self) -> CairnResult<()> {
        if self.max_memory_bytes == 0 {
            return Err(invalid(
                "max_memory_bytes",
                self.max_memory_bytes.to_string(),
                "max_memory_bytes must be greater than 0",
            ));
        }

        if self.default_ttl.is_zero() {
            return Err(invalid(
                "default_ttl",
                format!("{:?}", self.default_ttl),
                "default_ttl must be positive",
            ));
        }

        for (category, ttl) in &self.category_ttls {
            if ttl.is_zero() {
                return Err(invalid(
                    &format!("category_ttls.{}", category.as_str()),
                    format!("{:?}", ttl),
                    "category TTL must be positive",
                ));
            }
        }

        validate_key_separator(&self.key_separator)?;

        let min_length = self.key_separator.len() + 2;
        if self.max_key_length < min_length {
            return Err(CairnError::Config(ConfigError::IncompatibleOptions {
                option_a: format!("max_key_length={}", self.max_key_length),
                option_b: format!("key_separator={:?}", self.key_separator),
            }));
        }

        if let Some(interval) = self.sweep_interval {
            if interval.is_zero() {
                return Err(invalid(
                    "sweep_interval",
                    format!("{:?}", interval),
                    "sweep_interval must be positive",
                ));
            }
        }

        if self.coordinator_max_entries == 0 {
            return Err(invalid(
                "coordinator_max_entries",
                "0".to_string(),
                "coordinator_max_entries must be greater than 0",
            ));
        }

        if self.schema_version.trim().is_empty() {
            return Err(invalid(
                "schema_version",
                self.schema_version.clone(),
                "schema_version must not be empty",
            ));
        }

        Ok(())
    }
}

fn invalid(field: &str, value: String, reason: &str) -> CairnError {
    CairnError::Config(ConfigError::InvalidValue {
        field: field.to_string(),
        value,
        reason: reason.to_string(),
    })
}

fn env_parse<T: std::str::FromStr>(var: &str) -> Option<T> {
    std::env::var(var).ok().and_then(|s| s.parse().ok())
}

/// Check that a key separator is non-empty and cannot appear inside a
/// sanitized key component, so built keys always split back apart.
pub fn validate_key_separator(separator: &str) -> CairnResult<()> {
    if separator.is_empty() {
        return Err(invalid(
            "key_separator",
            String::new(),
            "key_separator must not be empty",
        ));
    }

    if separator
        .chars()
        .any(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '*')
    {
        return Err(invalid(
            "key_separator",
            separator.to_string(),
            "key_separator must not contain [a-z0-9_*]",
        ));
    }
    Ok(())
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(CacheConfig::default().validate().is_ok());
    }

    #[test]
    fn test_zero_budget_rejected() {
        let config = CacheConfig::new().with_max_memory_bytes(0);
        let err = config.validate().unwrap_err();
        assert!(matches!(
            err,
            CairnError::Config(ConfigError::InvalidValue { ref field, .. }) if field == "max_memory_bytes"
        ));
    }

    #[test]
    fn test_zero_ttl_rejected() {
        let config = CacheConfig::new().with_default_ttl(Duration::ZERO);
        assert!(config.validate().is_err());

        let config = CacheConfig::new().with_category_ttl(ResourceCategory::Hero, Duration::ZERO);
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("category_ttls.hero"));
    }

    #[test]
    fn test_separator_rules() {
        assert!(CacheConfig::new().with_key_separator("").validate().is_err());
        assert!(CacheConfig::new().with_key_separator("_").validate().is_err());
        assert!(CacheConfig::new().with_key_separator("a").validate().is_err());
        assert!(CacheConfig::new().with_key_separator("*").validate().is_err());
        assert!(CacheConfig::new().with_key_separator("|").validate().is_ok());
        assert!(CacheConfig::new().with_key_separator("::").validate().is_ok());
    }

    #[test]
    fn test_max_key_length_must_fit_separator() {
        let config = CacheConfig::new()
            .with_key_separator("::")
            .with_max_key_length(3);
        let err = config.validate().unwrap_err();
        assert!(matches!(
            err,
            CairnError::Config(ConfigError::IncompatibleOptions { .. })
        ));
    }

    #[test]
    fn test_zero_sweep_interval_rejected() {
        let config = CacheConfig::new().with_sweep_interval(Duration::ZERO);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_ttl_for_uses_override_then_category_default() {
        let config = CacheConfig::new()
            .with_category_ttl(ResourceCategory::Player, Duration::from_secs(42));

        assert_eq!(
            config.ttl_for(ResourceCategory::Player),
            Duration::from_secs(42)
        );
        assert_eq!(
            config.ttl_for(ResourceCategory::Hero),
            ResourceCategory::Hero.default_ttl()
        );
        assert_ne!(
            config.ttl_for(ResourceCategory::Hero),
            config.ttl_for(ResourceCategory::Player)
        );
    }

    #[test]
    fn test_config_builder() {
        let config = CacheConfig::new()
            .with_max_memory_bytes(1024)
            .with_default_ttl(Duration::from_secs(10))
            .with_key_separator("|")
            .with_max_key_length(64)
            .with_sweep_interval(Duration::from_secs(1))
            .with_coordinator_max_entries(16)
            .with_schema_version("v7");

        assert_eq!(config.max_memory_bytes, 1024);
        assert_eq!(config.default_ttl, Duration::from_secs(10));
        assert_eq!(config.key_separator, "|");
        assert_eq!(config.max_key_length, 64);
        assert_eq!(config.sweep_interval, Some(Duration::from_secs(1)));
        assert_eq!(config.coordinator_max_entries, 16);
        assert_eq!(config.schema_version, "v7");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_serde_roundtrip_with_category_overrides() {
        let config = CacheConfig::new()
            .with_category_ttl(ResourceCategory::Match, Duration::from_secs(90));
        let json = serde_json::to_string(&config).expect("serialize config");
        let back: CacheConfig = serde_json::from_str(&json).expect("deserialize config");
        assert_eq!(back, config);
    }
}
