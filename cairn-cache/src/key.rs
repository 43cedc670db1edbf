//! Structured cache keys.
//!
//! Keys have the shape `namespace SEP identifier (SEP part)*`. Every component
//! is sanitized to `[a-z0-9_]` before assembly, so two spellings of the same
//! logical resource ("Anti-Mage", "anti mage ") land on the same key, and the
//! separator can never appear inside a component.
//!
//! A [`CacheKey`] can only be produced by [`CacheKeyBuilder::build`], so any
//! key that reaches a backend has already been sanitized and length-checked.

use std::fmt;

use cairn_core::constants::{DEFAULT_KEY_SEPARATOR, DEFAULT_MAX_KEY_LENGTH};
use cairn_core::{validate_key_separator, CacheConfig, CairnResult, KeyError, ResourceCategory};

/// Wildcard accepted by [`CacheKeyBuilder::build_pattern`].
pub const WILDCARD: char = '*';

/// A sanitized, length-checked cache key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey {
    /// Private so keys cannot be assembled outside the builder.
    inner: String,
}

impl CacheKey {
    /// Borrow the key as a string slice.
    pub fn as_str(&self) -> &str {
        &self.inner
    }

    /// Consume the key and return the owned string.
    pub fn into_string(self) -> String {
        self.inner
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.inner)
    }
}

impl AsRef<str> for CacheKey {
    fn as_ref(&self) -> &str {
        &self.inner
    }
}

impl From<CacheKey> for String {
    fn from(key: CacheKey) -> Self {
        key.inner
    }
}

/// Structure recovered from a key by [`CacheKeyBuilder::parse`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedKey {
    pub namespace: String,
    pub identifier: String,
    pub parts: Vec<String>,
}

/// Builds, parses, and pattern-matches structured cache keys.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheKeyBuilder {
    separator: String,
    max_length: usize,
}

impl Default for CacheKeyBuilder {
    fn default() -> Self {
        Self {
            separator: DEFAULT_KEY_SEPARATOR.to_string(),
            max_length: DEFAULT_MAX_KEY_LENGTH,
        }
    }
}

impl CacheKeyBuilder {
    /// Create a builder with an explicit separator and maximum key length.
    ///
    /// # Errors
    ///
    /// [`ConfigError::InvalidValue`](cairn_core::ConfigError) if the separator
    /// is empty or could appear inside a sanitized component.
    pub fn new(separator: impl Into<String>, max_length: usize) -> CairnResult<Self> {
        let separator = separator.into();
        validate_key_separator(&separator)?;
        Ok(Self {
            separator,
            max_length,
        })
    }

    /// Create a builder from the key settings of a [`CacheConfig`].
    pub fn from_config(config: &CacheConfig) -> CairnResult<Self> {
        Self::new(config.key_separator.clone(), config.max_key_length)
    }

    /// The separator placed between components.
    pub fn separator(&self) -> &str {
        &self.separator
    }

    /// The maximum assembled key length, in characters.
    pub fn max_length(&self) -> usize {
        self.max_length
    }

    /// Build a key from a namespace, an identifier, and optional extra parts.
    ///
    /// # Errors
    ///
    /// - [`KeyError::EmptyComponent`] if any component sanitizes to nothing
    /// - [`KeyError::TooLong`] if the assembled key exceeds the maximum length
    pub fn build(&self, namespace: &str, identifier: &str, parts: &[&str]) -> CairnResult<CacheKey> {
        let mut components = Vec::with_capacity(2 + parts.len());
        components.push(required(namespace, "namespace", false)?);
        components.push(required(identifier, "identifier", false)?);
        for (i, part) in parts.iter().enumerate() {
            components.push(required(part, &format!("part[{}]", i), false)?);
        }

        let key = components.join(&self.separator);
        self.check_length(&key)?;
        Ok(CacheKey { inner: key })
    }

    /// Build a key for a resource category's namespace.
    pub fn build_for(
        &self,
        category: ResourceCategory,
        identifier: &str,
        parts: &[&str],
    ) -> CairnResult<CacheKey> {
        self.build(category.as_str(), identifier, parts)
    }

    /// Build a glob pattern for bulk invalidation, e.g. `hero:*`.
    ///
    /// The pattern is sanitized like a key component except that `*` is kept.
    pub fn build_pattern(&self, namespace: &str, pattern: &str) -> CairnResult<String> {
        let namespace = required(namespace, "namespace", false)?;
        let pattern = required(pattern, "pattern", true)?;

        let assembled = format!("{}{}{}", namespace, self.separator, pattern);
        self.check_length(&assembled)?;
        Ok(assembled)
    }

    /// Pattern matching every key in a namespace.
    pub fn namespace_pattern(&self, namespace: &str) -> CairnResult<String> {
        self.build_pattern(namespace, "*")
    }

    /// Derive the namespace/version string handed to a persisted tier so it
    /// can drop records written under an older schema.
    pub fn build_version(&self, namespace: &str, version: &str) -> CairnResult<CacheKey> {
        self.build(namespace, version, &[])
    }

    /// Split a key back into its components.
    ///
    /// Returns `None` for anything that is not a well-formed key: no separator,
    /// an empty string, or an empty component. This is a normal outcome for
    /// defensive callers, not an error.
    pub fn parse(&self, key: &str) -> Option<ParsedKey> {
        if key.is_empty() || !key.contains(self.separator.as_str()) {
            return None;
        }

        let mut segments = key.split(self.separator.as_str());
        let namespace = segments.next()?;
        let identifier = segments.next()?;
        let parts: Vec<&str> = segments.collect();

        if namespace.is_empty() || identifier.is_empty() || parts.iter().any(|p| p.is_empty()) {
            return None;
        }

        Some(ParsedKey {
            namespace: namespace.to_string(),
            identifier: identifier.to_string(),
            parts: parts.into_iter().map(str::to_string).collect(),
        })
    }

    fn check_length(&self, key: &str) -> CairnResult<()> {
        let length = key.chars().count();
        if length > self.max_length {
            tracing::error!(
                length,
                max = self.max_length,
                "Cache key exceeds maximum length"
            );
            return Err(KeyError::TooLong {
                length,
                max: self.max_length,
            }
            .into());
        }
        Ok(())
    }
}

/// Sanitize a component and reject it if nothing is left.
fn required(raw: &str, component: &str, keep_wildcard: bool) -> CairnResult<String> {
    let cleaned = sanitize(raw, keep_wildcard);
    if cleaned.is_empty() {
        return Err(KeyError::EmptyComponent {
            component: component.to_string(),
        }
        .into());
    }
    Ok(cleaned)
}

/// Lowercase, map everything outside `[a-z0-9_]` to `_`, collapse runs of `_`,
/// and trim `_` from both ends.
fn sanitize(raw: &str, keep_wildcard: bool) -> String {
    let trimmed = raw.trim().trim_matches('_');
    let mut out = String::with_capacity(trimmed.len());
    let mut last_was_underscore = false;

    for c in trimmed.chars().flat_map(char::to_lowercase) {
        let mapped = if c.is_ascii_lowercase() || c.is_ascii_digit() {
            c
        } else if keep_wildcard && c == WILDCARD {
            c
        } else {
            '_'
        };

        if mapped == '_' {
            if last_was_underscore {
                continue;
            }
            last_was_underscore = true;
        } else {
            last_was_underscore = false;
        }
        out.push(mapped);
    }

    out.trim_matches('_').to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use cairn_core::CairnError;

    fn builder() -> CacheKeyBuilder {
        CacheKeyBuilder::default()
    }

    #[test]
    fn test_build_sanitizes_identifier() {
        let key = builder().build("hero", "Anti-Mage", &[]).expect("valid key");
        assert_eq!(key.as_str(), "hero:anti_mage");
    }

    #[test]
    fn test_build_collapses_and_trims() {
        let key = builder().build("hero", "Anti--Mage  ", &[]).expect("valid key");
        assert_eq!(key.as_str(), "hero:anti_mage");

        let key = builder().build("  HERO_", "__Queen of Pain!!", &[]).expect("valid key");
        assert_eq!(key.as_str(), "hero:queen_of_pain");
    }

    #[test]
    fn test_build_with_parts() {
        let key = builder()
            .build("player", "86745912", &["Recent Matches", "page-2"])
            .expect("valid key");
        assert_eq!(key.as_str(), "player:86745912:recent_matches:page_2");
    }

    #[test]
    fn test_build_with_custom_separator() {
        let key = CacheKeyBuilder::new("|", 250)
            .expect("valid separator")
            .build("item", "Black King Bar", &["stats"])
            .expect("valid key");
        assert_eq!(key.as_str(), "item|black_king_bar|stats");
    }

    #[test]
    fn test_build_for_category_uses_namespace() {
        let key = builder()
            .build_for(ResourceCategory::Team, "Team Spirit", &[])
            .expect("valid key");
        assert_eq!(key.as_str(), "team:team_spirit");
    }

    #[test]
    fn test_build_too_long_fails_loudly() {
        let long_id = "x".repeat(300);
        let err = builder().build("hero", &long_id, &[]).unwrap_err();
        assert_eq!(
            err,
            CairnError::Key(KeyError::TooLong {
                length: 305,
                max: 250
            })
        );
    }

    #[test]
    fn test_build_exactly_max_length_is_ok() {
        let builder = CacheKeyBuilder::new(":", 10).expect("valid separator");
        let key = builder.build("hero", "12345", &[]).expect("10 chars fits");
        assert_eq!(key.as_str().len(), 10);
        assert!(builder.build("hero", "123456", &[]).is_err());
    }

    #[test]
    fn test_new_rejects_separators_parse_cannot_split() {
        for separator in ["", "_", "a", "*", "x_"] {
            let err = CacheKeyBuilder::new(separator, 250).unwrap_err();
            assert!(matches!(err, CairnError::Config(_)), "separator {:?}", separator);
        }
        assert!(CacheKeyBuilder::new("::", 250).is_ok());
    }

    #[test]
    fn test_build_empty_component_rejected() {
        let err = builder().build("hero", "  --  ", &[]).unwrap_err();
        assert!(matches!(
            err,
            CairnError::Key(KeyError::EmptyComponent { ref component }) if component == "identifier"
        ));
        assert!(builder().build("", "1", &[]).is_err());
        assert!(builder().build("hero", "1", &["!!"]).is_err());
    }

    #[test]
    fn test_build_pattern_keeps_wildcard() {
        assert_eq!(builder().build_pattern("User", "*").expect("pattern"), "user:*");
        assert_eq!(
            builder().build_pattern("hero", "Anti*Mage*").expect("pattern"),
            "hero:anti*mage*"
        );
        assert_eq!(builder().namespace_pattern("match").expect("pattern"), "match:*");
    }

    #[test]
    fn test_build_version() {
        let version = builder().build_version("hero", "V3").expect("version");
        assert_eq!(version.as_str(), "hero:v3");
    }

    #[test]
    fn test_parse_with_parts() {
        let parsed = builder().parse("hero:123:stats").expect("well formed");
        assert_eq!(
            parsed,
            ParsedKey {
                namespace: "hero".to_string(),
                identifier: "123".to_string(),
                parts: vec!["stats".to_string()],
            }
        );
    }

    #[test]
    fn test_parse_malformed_returns_none() {
        let b = builder();
        assert_eq!(b.parse("no-separator"), None);
        assert_eq!(b.parse(""), None);
        assert_eq!(b.parse(":123"), None);
        assert_eq!(b.parse("hero:"), None);
        assert_eq!(b.parse("hero:1::x"), None);
    }

    #[test]
    fn test_parse_inverts_build() {
        let b = builder();
        let key = b.build("match", "7200001234", &["players", "radiant"]).expect("key");
        let parsed = b.parse(key.as_str()).expect("parse");
        assert_eq!(parsed.namespace, "match");
        assert_eq!(parsed.identifier, "7200001234");
        assert_eq!(parsed.parts, vec!["players", "radiant"]);
    }

    #[test]
    fn test_cache_key_conversions() {
        let key = builder().build("item", "blink", &[]).expect("key");
        assert_eq!(key.to_string(), "item:blink");
        assert_eq!(AsRef::<str>::as_ref(&key), "item:blink");
        let owned: String = key.into();
        assert_eq!(owned, "item:blink");
    }
}
