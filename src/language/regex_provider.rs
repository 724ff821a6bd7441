//! Configuration-driven embedding provider.
//!
//! Each match of the pattern yields one embedding. The `content` capture
//! group (or the whole match when absent) selects the embedded region, and a
//! `language` capture group, when present, names the embedded language
//! dynamically.

use std::sync::Arc;

use regex::Regex;

use super::plugin::{DiscoveryMode, EmbeddingProvider};
use super::LanguageId;
use crate::cache::ParserResult;
use crate::config::InjectionPattern;
use crate::embedding::Embedding;
use crate::error::{BoxError, ParseError, ParseResult};
use crate::source::Snapshot;

const CONTENT_GROUP: &str = "content";
const LANGUAGE_GROUP: &str = "language";

#[derive(Debug, Clone)]
pub struct RegexEmbeddingProvider {
    regex: Regex,
    language: Option<LanguageId>,
    join_sections: bool,
    start_skip: usize,
    end_skip: usize,
    name: String,
}

impl RegexEmbeddingProvider {
    /// Provider embedding every match as `language`.
    pub fn new(pattern: &str, language: impl Into<LanguageId>) -> ParseResult<Self> {
        Self::build(pattern, Some(language.into()))
    }

    /// Provider described by an injection entry from the settings.
    pub fn from_pattern(pattern: &InjectionPattern) -> ParseResult<Self> {
        let mut provider = Self::build(&pattern.pattern, pattern.language.as_deref().map(LanguageId::from))?;
        provider.join_sections = pattern.join;
        provider.start_skip = pattern.start_skip;
        provider.end_skip = pattern.end_skip;
        Ok(provider)
    }

    fn build(pattern: &str, language: Option<LanguageId>) -> ParseResult<Self> {
        let regex = Regex::new(pattern)
            .map_err(|e| ParseError::config(format!("invalid injection pattern {pattern:?}: {e}")))?;
        let has_language_group = regex
            .capture_names()
            .any(|name| name == Some(LANGUAGE_GROUP));
        if language.is_none() && !has_language_group {
            return Err(ParseError::config(format!(
                "injection pattern {pattern:?} needs a language or a (?P<language>...) group"
            )));
        }
        Ok(Self {
            name: format!("regex:{pattern}"),
            regex,
            language,
            join_sections: false,
            start_skip: 0,
            end_skip: 0,
        })
    }

    pub fn with_join_sections(mut self, join: bool) -> Self {
        self.join_sections = join;
        self
    }

    pub fn with_skip(mut self, start_skip: usize, end_skip: usize) -> Self {
        self.start_skip = start_skip;
        self.end_skip = end_skip;
        self
    }
}

impl EmbeddingProvider for RegexEmbeddingProvider {
    fn mode(&self) -> DiscoveryMode {
        DiscoveryMode::Lexical
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn embeddings(
        &self,
        snapshot: &Arc<Snapshot>,
        _host: Option<&ParserResult>,
    ) -> Result<Vec<Embedding>, BoxError> {
        let mut embeddings = Vec::new();
        for captures in self.regex.captures_iter(snapshot.text()) {
            let Some(region) = captures.name(CONTENT_GROUP).or_else(|| captures.get(0)) else {
                continue;
            };
            let language = match captures.name(LANGUAGE_GROUP) {
                Some(name) if !name.as_str().is_empty() => LanguageId::from(name.as_str()),
                _ => match &self.language {
                    Some(language) => language.clone(),
                    None => continue,
                },
            };
            let embedding = Embedding::builder(snapshot, language)
                .source_with_skip(region.range(), self.start_skip, self.end_skip)
                .join_sections(self.join_sections)
                .build()?;
            embeddings.push(embedding);
        }
        Ok(embeddings)
    }
}
