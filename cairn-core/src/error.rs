//! Error types for cairn operations

use thiserror::Error;

/// Cache backend errors.
///
/// Ordinary misses, expiry and evictions are never errors. These variants
/// only cover misuse or a backend that cannot serve requests at all.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StorageError {
    #[error("Storage lock poisoned")]
    LockPoisoned,

    #[error("Backend unavailable: {backend}")]
    BackendUnavailable { backend: String },

    #[error("Backend {backend} failed: {reason}")]
    BackendFailed { backend: String, reason: String },

    #[error("Serialization failed for key {key}: {reason}")]
    Serialization { key: String, reason: String },

    #[error("Invalid glob pattern {pattern}: {reason}")]
    InvalidPattern { pattern: String, reason: String },
}

/// Cache key construction errors.
///
/// These are caller bugs and are meant to fail loudly.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum KeyError {
    #[error("Cache key too long: {length} characters exceeds maximum of {max}")]
    TooLong { length: usize, max: usize },

    #[error("Cache key component {component} is empty after sanitizing")]
    EmptyComponent { component: String },
}

/// Network loader errors.
///
/// A loader failure is handed unchanged to every caller waiting on the same
/// load, which is why every variant is cheap to clone.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LoadError {
    #[error("Load failed for {resource}: {reason}")]
    Failed { resource: String, reason: String },

    #[error("Resource not found upstream: {resource}")]
    NotFound { resource: String },

    #[error("Rate limited while loading {resource}, retry after {retry_after_ms}ms")]
    RateLimited {
        resource: String,
        retry_after_ms: u64,
    },

    #[error("Load for {resource} ended without a result")]
    Aborted { resource: String },
}

/// Configuration errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid value for {field}: {value} - {reason}")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },

    #[error("Incompatible options: {option_a} and {option_b}")]
    IncompatibleOptions { option_a: String, option_b: String },
}

/// Master error type for all cairn errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CairnError {
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Key error: {0}")]
    Key(#[from] KeyError),

    #[error("Load error: {0}")]
    Load(#[from] LoadError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),
}

impl CairnError {
    /// Returns true if this error came from the network loader.
    pub fn is_load_failure(&self) -> bool {
        matches!(self, Self::Load(_))
    }
}

/// Result type alias for cairn operations.
pub type CairnResult<T> = Result<T, CairnError>;

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_error_display_too_long() {
        let err = KeyError::TooLong {
            length: 300,
            max: 250,
        };
        let msg = format!("{}", err);
        assert!(msg.contains("too long"));
        assert!(msg.contains("300"));
        assert!(msg.contains("250"));
    }

    #[test]
    fn test_load_error_display_rate_limited() {
        let err = LoadError::RateLimited {
            resource: "hero:42".to_string(),
            retry_after_ms: 1500,
        };
        let msg = format!("{}", err);
        assert!(msg.contains("Rate limited"));
        assert!(msg.contains("hero:42"));
        assert!(msg.contains("1500"));
    }

    #[test]
    fn test_config_error_display_invalid_value() {
        let err = ConfigError::InvalidValue {
            field: "max_memory_bytes".to_string(),
            value: "0".to_string(),
            reason: "must be positive".to_string(),
        };
        let msg = format!("{}", err);
        assert!(msg.contains("max_memory_bytes"));
        assert!(msg.contains("must be positive"));
    }

    #[test]
    fn test_storage_error_display_lock_poisoned() {
        let msg = format!("{}", StorageError::LockPoisoned);
        assert!(msg.contains("lock poisoned"));
    }

    #[test]
    fn test_cairn_error_from_variants() {
        let storage = CairnError::from(StorageError::LockPoisoned);
        assert!(matches!(storage, CairnError::Storage(_)));

        let key = CairnError::from(KeyError::EmptyComponent {
            component: "namespace".to_string(),
        });
        assert!(matches!(key, CairnError::Key(_)));

        let load = CairnError::from(LoadError::NotFound {
            resource: "item:7".to_string(),
        });
        assert!(matches!(load, CairnError::Load(_)));
        assert!(load.is_load_failure());

        let config = CairnError::from(ConfigError::IncompatibleOptions {
            option_a: "separator".to_string(),
            option_b: "max_key_length".to_string(),
        });
        assert!(matches!(config, CairnError::Config(_)));
        assert!(!config.is_load_failure());
    }

    #[test]
    fn test_cloned_load_error_compares_equal() {
        let err = CairnError::from(LoadError::Failed {
            resource: "match:1".to_string(),
            reason: "502 from upstream".to_string(),
        });
        assert_eq!(err.clone(), err);
    }
}
