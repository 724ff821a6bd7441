use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

use super::defaults::{DEFAULT_MAX_EMBEDDING_DEPTH, DEFAULT_SLOW_CANCEL_LIMIT_MS, DEFAULT_STALE_RETRY_LIMIT};

/// A regex-driven embedding rule for one host language.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct InjectionPattern {
    /// Regex; the `content` group selects the embedded region
    pub pattern: String,
    /// Embedded language, unless the pattern captures a `language` group
    pub language: Option<String>,
    /// Merge all matches of the same language into one document
    pub join: bool,
    pub start_skip: usize,
    pub end_skip: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LanguageSettings {
    /// Set to false to skip embedding discovery for this language
    pub embeddings: Option<bool>,
    pub injections: Option<Vec<InjectionPattern>>,
}

/// Cache configuration as read from one layer.
///
/// Unset fields fall back to lower layers and finally to the built-in
/// defaults, see [`CacheSettings::slow_cancel_limit`] and friends.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CacheSettings {
    pub slow_cancel_limit_ms: Option<u64>,
    pub stale_retry_limit: Option<usize>,
    pub max_embedding_depth: Option<usize>,
    pub languages: HashMap<String, LanguageSettings>,
}

impl CacheSettings {
    pub fn from_toml_str(contents: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(contents)
    }

    /// How long a cancelled request may keep running before a warning.
    pub fn slow_cancel_limit(&self) -> Duration {
        Duration::from_millis(self.slow_cancel_limit_ms.unwrap_or(DEFAULT_SLOW_CANCEL_LIMIT_MS))
    }

    /// Recomputations attempted when a result goes stale while computing.
    pub fn stale_retry_limit(&self) -> usize {
        self.stale_retry_limit.unwrap_or(DEFAULT_STALE_RETRY_LIMIT)
    }

    /// Snapshots nested deeper than this report no embeddings.
    pub fn max_embedding_depth(&self) -> usize {
        self.max_embedding_depth.unwrap_or(DEFAULT_MAX_EMBEDDING_DEPTH)
    }

    /// Whether embedding discovery runs for `language` (wildcard aware).
    pub fn embeddings_enabled(&self, language: &str) -> bool {
        super::resolve_language_with_wildcard(&self.languages, language)
            .and_then(|settings| settings.embeddings)
            .unwrap_or(true)
    }
}
