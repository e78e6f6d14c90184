//! Cacheability rules.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// TTL classes.
pub struct CacheTtl;

impl CacheTtl {
    pub const SHORT: Duration = Duration::from_secs(5 * 60);
    pub const MEDIUM: Duration = Duration::from_secs(30 * 60);
    pub const LONG: Duration = Duration::from_secs(60 * 60);
    pub const VERY_LONG: Duration = Duration::from_secs(24 * 60 * 60);
}

/// Whether to cache a prompt's response, and for how long.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheDecision {
    pub cache: bool,
    pub ttl: Duration,
}

/// Rule table evaluated in order: personalized phrasing, then recency
/// markers, then definitional phrasing, then the default.
///
/// Cache keys carry no user id, so a personalized prompt is never cached
/// whatever else it matches.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CachePolicy {
    /// Time-sensitive markers; matching prompts get the short TTL.
    pub recency_markers: Vec<String>,
    /// Definitional phrasing; matching prompts get the very long TTL.
    pub definitional_markers: Vec<String>,
    /// Personalized phrasing; matching prompts are never cached.
    pub personal_markers: Vec<String>,
    /// TTL for everything else, in seconds.
    pub default_ttl_secs: u64,
}

impl Default for CachePolicy {
    fn default() -> Self {
        let owned = |words: &[&str]| words.iter().map(|w| (*w).to_owned()).collect();
        Self {
            recency_markers: owned(&["today", "now", "current", "latest", "recent"]),
            definitional_markers: owned(&["what is", "define", "explain", "how to"]),
            personal_markers: owned(&["my ", "i ", "for me"]),
            default_ttl_secs: CacheTtl::MEDIUM.as_secs(),
        }
    }
}

impl CachePolicy {
    pub fn classify(&self, prompt: &str) -> CacheDecision {
        let lower = prompt.to_lowercase();
        let matches = |markers: &[String]| markers.iter().any(|m| lower.contains(m.as_str()));

        if matches(&self.personal_markers) {
            return CacheDecision {
                cache: false,
                ttl: Duration::ZERO,
            };
        }
        if matches(&self.recency_markers) {
            return CacheDecision {
                cache: true,
                ttl: CacheTtl::SHORT,
            };
        }
        if matches(&self.definitional_markers) {
            return CacheDecision {
                cache: true,
                ttl: CacheTtl::VERY_LONG,
            };
        }
        CacheDecision {
            cache: true,
            ttl: Duration::from_secs(self.default_ttl_secs),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recency_gets_short_ttl() {
        let d = CachePolicy::default().classify("What is the latest Trichoderma research?");
        assert!(d.cache);
        assert_eq!(d.ttl, CacheTtl::SHORT);
    }

    #[test]
    fn definitions_get_very_long_ttl() {
        let d = CachePolicy::default().classify("What is Trichoderma?");
        assert!(d.cache);
        assert_eq!(d.ttl, CacheTtl::VERY_LONG);
    }

    #[test]
    fn personal_queries_are_not_cached() {
        let d = CachePolicy::default().classify("Check my grow tent humidity");
        assert!(!d.cache);
    }

    #[test]
    fn personal_phrasing_wins_over_other_markers() {
        let policy = CachePolicy::default();
        for prompt in [
            "What is my substrate moisture today?",
            "Explain my results",
            "my latest orders",
            "How to fix this for me",
        ] {
            let d = policy.classify(prompt);
            assert!(!d.cache, "{prompt:?} should not be cached");
            assert_eq!(d.ttl, Duration::ZERO);
        }
    }

    #[test]
    fn default_is_medium() {
        let d = CachePolicy::default().classify("Oyster mushroom substrate ratios");
        assert!(d.cache);
        assert_eq!(d.ttl, CacheTtl::MEDIUM);
    }
}
