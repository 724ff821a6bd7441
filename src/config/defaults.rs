//! Built-in configuration values.
//!
//! These form the lowest layer of the settings stack; user and project files
//! override them field by field.

use super::settings::CacheSettings;
use std::collections::HashMap;

pub const DEFAULT_SLOW_CANCEL_LIMIT_MS: u64 = 50;
pub const DEFAULT_STALE_RETRY_LIMIT: usize = 3;
pub const DEFAULT_MAX_EMBEDDING_DEPTH: usize = 8;

/// Returns the default CacheSettings layer.
pub fn default_settings() -> CacheSettings {
    CacheSettings {
        slow_cancel_limit_ms: Some(DEFAULT_SLOW_CANCEL_LIMIT_MS),
        stale_retry_limit: Some(DEFAULT_STALE_RETRY_LIMIT),
        max_embedding_depth: Some(DEFAULT_MAX_EMBEDDING_DEPTH),
        languages: HashMap::new(),
    }
}
