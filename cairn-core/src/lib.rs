//! cairn Core - Shared Types
//!
//! Error taxonomy, configuration, and resource categories shared by every
//! cairn crate. This crate contains no caching logic.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

pub mod config;
pub mod constants;
pub mod error;

pub use config::{validate_key_separator, CacheConfig};
pub use error::{CairnError, CairnResult, ConfigError, KeyError, LoadError, StorageError};

// ============================================================================
// TYPE ALIASES
// ============================================================================

/// Timestamp type using UTC timezone.
pub type Timestamp = DateTime<Utc>;

/// Duration in milliseconds, as stored on persisted records.
pub type DurationMs = u64;

// ============================================================================
// RESOURCE CATEGORIES
// ============================================================================

/// Category of remote resource a cache entry belongs to.
///
/// Each category gets its own key namespace, its own TTL, and its own
/// coordinator instance.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum ResourceCategory {
    Hero,
    Item,
    Match,
    Player,
    Team,
}

impl ResourceCategory {
    /// Every category, in declaration order.
    pub const ALL: [ResourceCategory; 5] = [
        ResourceCategory::Hero,
        ResourceCategory::Item,
        ResourceCategory::Match,
        ResourceCategory::Player,
        ResourceCategory::Team,
    ];

    /// Key namespace for this category.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Hero => "hero",
            Self::Item => "item",
            Self::Match => "match",
            Self::Player => "player",
            Self::Team => "team",
        }
    }

    /// Built-in TTL used when the config carries no override.
    pub fn default_ttl(&self) -> Duration {
        let secs = match self {
            Self::Hero => constants::HERO_TTL_SECS,
            Self::Item => constants::ITEM_TTL_SECS,
            Self::Match => constants::MATCH_TTL_SECS,
            Self::Player => constants::PLAYER_TTL_SECS,
            Self::Team => constants::TEAM_TTL_SECS,
        };
        Duration::from_secs(secs)
    }
}

impl fmt::Display for ResourceCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResourceCategory {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|c| c.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| ConfigError::InvalidValue {
                field: "resource_category".to_string(),
                value: s.to_string(),
                reason: "expected one of hero, item, match, player, team".to_string(),
            })
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_category_from_str_is_case_insensitive() {
        assert_eq!(
            "HERO".parse::<ResourceCategory>().ok(),
            Some(ResourceCategory::Hero)
        );
        assert_eq!(
            " team ".parse::<ResourceCategory>().ok(),
            Some(ResourceCategory::Team)
        );
        assert!("guild".parse::<ResourceCategory>().is_err());
    }

    #[test]
    fn test_categories_have_distinct_namespaces() {
        let mut names: Vec<_> = ResourceCategory::ALL.iter().map(|c| c.as_str()).collect();
        names.sort();
        names.dedup();
        assert_eq!(names.len(), ResourceCategory::ALL.len());
    }

    #[test]
    fn test_serde_uses_lowercase_names() {
        let json = serde_json::to_string(&ResourceCategory::Player).expect("serialize");
        assert_eq!(json, "\"player\"");
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        /// Property: Display output parses back to the same category.
        #[test]
        fn prop_display_parse_roundtrip(index in 0usize..5) {
            let category = ResourceCategory::ALL[index];
            let parsed: ResourceCategory = category.to_string().parse().expect("parse");
            prop_assert_eq!(parsed, category);
        }
    }
}
