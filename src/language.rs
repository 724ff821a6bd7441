//! Language plugins: parsers and embedding providers keyed by language id.

pub mod plugin;
pub mod regex_provider;
pub mod registry;
pub mod text_stats;

pub use plugin::{
    DiscoveryMode, EmbeddingProvider, LanguagePlugin, Parser, ParserFactory, ParserOutput,
};
pub use regex_provider::RegexEmbeddingProvider;
pub use registry::LanguageRegistry;
pub use text_stats::{TextStats, TextStatsParser};

use std::borrow::Borrow;
use std::fmt;
use std::sync::Arc;

/// Identifier of a language, e.g. `"html"` or `"javascript"`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LanguageId(Arc<str>);

impl LanguageId {
    pub fn new(id: impl AsRef<str>) -> Self {
        Self(Arc::from(id.as_ref()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for LanguageId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for LanguageId {
    fn from(id: String) -> Self {
        Self(Arc::from(id))
    }
}

impl From<&LanguageId> for LanguageId {
    fn from(id: &LanguageId) -> Self {
        id.clone()
    }
}

impl Borrow<str> for LanguageId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for LanguageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
