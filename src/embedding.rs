//! Embedded regions and the child snapshots derived from them.
//!
//! An [`Embedding`] is built against its host snapshot and derives its child
//! snapshot (text plus offset table) immediately. Embeddings are immutable;
//! a recomputed host produces fresh embeddings rather than edited ones.

pub(crate) mod discovery;

use std::fmt;
use std::ops::Range;
use std::sync::Arc;

use crate::error::{ParseError, ParseResult};
use crate::language::LanguageId;
use crate::source::Snapshot;
use crate::text::{Fnv1a, OffsetMapBuilder};

/// One piece of an embedding's text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Section {
    /// Bytes copied from the host snapshot, in host coordinates
    Source(Range<usize>),
    /// Virtual text that exists only in the embedded snapshot
    Generated(String),
}

/// Stable identity of an embedding across host recomputations.
///
/// Two embeddings share a key when they have the same language, the same
/// section geometry and the same child text, so a cache slot survives a
/// rediscovery only if nothing it depends on changed.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EmbeddingKey {
    language: LanguageId,
    geometry: Vec<(usize, usize)>,
    content: u64,
}

/// A declared sub-region of a snapshot in another language.
#[derive(Clone)]
pub struct Embedding {
    inner: Arc<EmbeddingInner>,
}

struct EmbeddingInner {
    host: Arc<Snapshot>,
    language: LanguageId,
    sections: Vec<Section>,
    join_sections: bool,
    snapshot: Arc<Snapshot>,
    key: EmbeddingKey,
}

impl Embedding {
    pub fn builder(host: &Arc<Snapshot>, language: impl Into<LanguageId>) -> EmbeddingBuilder {
        EmbeddingBuilder {
            host: Arc::clone(host),
            language: language.into(),
            sections: Vec::new(),
            join_sections: false,
        }
    }

    /// Embedding of a single host region.
    pub fn region(
        host: &Arc<Snapshot>,
        language: impl Into<LanguageId>,
        range: Range<usize>,
    ) -> ParseResult<Self> {
        Self::builder(host, language).source(range).build()
    }

    pub fn language(&self) -> &LanguageId {
        &self.inner.language
    }

    pub fn sections(&self) -> &[Section] {
        &self.inner.sections
    }

    /// The snapshot this embedding was discovered in.
    pub fn host(&self) -> &Arc<Snapshot> {
        &self.inner.host
    }

    /// The derived child snapshot.
    pub fn snapshot(&self) -> &Arc<Snapshot> {
        &self.inner.snapshot
    }

    /// True if any of the child text is generated.
    pub fn is_generated(&self) -> bool {
        self.inner
            .sections
            .iter()
            .any(|section| matches!(section, Section::Generated(_)))
    }

    /// True if sections of the same language are merged into one document.
    pub fn joins_sections(&self) -> bool {
        self.inner.join_sections
    }

    pub fn key(&self) -> &EmbeddingKey {
        &self.inner.key
    }

    /// Envelope of the copied sections, in host coordinates.
    pub fn host_range(&self) -> Option<Range<usize>> {
        let mut ranges = self.inner.sections.iter().filter_map(|section| match section {
            Section::Source(range) => Some(range.clone()),
            Section::Generated(_) => None,
        });
        let first = ranges.next()?;
        Some(ranges.fold(first, |acc, r| acc.start.min(r.start)..acc.end.max(r.end)))
    }

    /// Envelope of the copied sections, in root document coordinates.
    pub fn original_range(&self) -> Option<Range<usize>> {
        self.inner.snapshot.original_range()
    }

    /// True if the root offset falls on text copied into this embedding.
    ///
    /// Section ends are inclusive, so touching embeddings both contain their
    /// shared boundary; callers resolve that tie by discovery order.
    pub fn contains_original(&self, offset: usize) -> bool {
        self.inner.snapshot.embedded_offset(offset).is_some()
    }

    /// Identity comparison: both handles refer to the same discovered embedding.
    pub fn ptr_eq(a: &Embedding, b: &Embedding) -> bool {
        Arc::ptr_eq(&a.inner, &b.inner)
    }

    /// Address-based identity, valid while a clone of this embedding is alive.
    pub(crate) fn identity(&self) -> usize {
        Arc::as_ptr(&self.inner) as usize
    }
}

impl fmt::Debug for Embedding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Embedding")
            .field("language", &self.inner.language)
            .field("sections", &self.inner.sections)
            .field("join_sections", &self.inner.join_sections)
            .finish()
    }
}

/// Builder for [`Embedding`]; sections are concatenated in call order.
#[derive(Debug)]
pub struct EmbeddingBuilder {
    host: Arc<Snapshot>,
    language: LanguageId,
    sections: Vec<Section>,
    join_sections: bool,
}

impl EmbeddingBuilder {
    /// Copy a host region.
    pub fn source(mut self, range: Range<usize>) -> Self {
        self.sections.push(Section::Source(range));
        self
    }

    /// Copy a host region after skipping bytes at both ends.
    ///
    /// Typical for delimiters that a provider matches but does not want in
    /// the child text. Skips larger than the region collapse it to an empty
    /// region at its start.
    pub fn source_with_skip(self, range: Range<usize>, start_skip: usize, end_skip: usize) -> Self {
        let start = range.start.saturating_add(start_skip).min(range.end);
        let end = range.end.saturating_sub(end_skip).max(start);
        self.source(start..end)
    }

    /// Append virtual text that has no position in the host.
    pub fn generated(mut self, text: impl Into<String>) -> Self {
        self.sections.push(Section::Generated(text.into()));
        self
    }

    pub fn join_sections(mut self, join: bool) -> Self {
        self.join_sections = join;
        self
    }

    pub(crate) fn sections(mut self, sections: impl IntoIterator<Item = Section>) -> Self {
        self.sections.extend(sections);
        self
    }

    pub fn build(self) -> ParseResult<Embedding> {
        let host_text = self.host.text();
        let mut text = String::new();
        let mut offsets = OffsetMapBuilder::new();
        let mut geometry = Vec::with_capacity(self.sections.len());

        for section in &self.sections {
            match section {
                Section::Source(range) => {
                    let valid = range.start <= range.end
                        && range.end <= host_text.len()
                        && host_text.is_char_boundary(range.start)
                        && host_text.is_char_boundary(range.end);
                    if !valid {
                        return Err(ParseError::InvalidEmbedding {
                            language: self.language.to_string(),
                            start: range.start,
                            end: range.end,
                            len: host_text.len(),
                        });
                    }
                    text.push_str(&host_text[range.clone()]);
                    offsets.push_projected(self.host.offset_map(), range.clone());
                    geometry.push((range.start, range.end));
                }
                Section::Generated(generated) => {
                    text.push_str(generated);
                    offsets.push_unmapped(generated.len());
                    // Generated sections have no host position
                    geometry.push((usize::MAX, generated.len()));
                }
            }
        }

        let mut hasher = Fnv1a::new();
        hasher.write_str(&text);
        let key = EmbeddingKey {
            language: self.language.clone(),
            geometry,
            content: hasher.finish(),
        };
        let snapshot = Arc::new(Snapshot::embedded(
            &self.host,
            self.language.clone(),
            text,
            offsets.build(),
        ));

        Ok(Embedding {
            inner: Arc::new(EmbeddingInner {
                host: self.host,
                language: self.language,
                sections: self.sections,
                join_sections: self.join_sections,
                snapshot,
                key,
            }),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::Source;
    use url::Url;

    const HTML: &str = "<html><script>var x=1;</script></html>";

    fn host() -> Arc<Snapshot> {
        Source::new(Url::parse("file:///index.html").unwrap(), "html", HTML).snapshot()
    }

    fn script_range() -> Range<usize> {
        let start = HTML.find("var").unwrap();
        start..start + "var x=1;".len()
    }

    #[test]
    fn test_region_derives_child_snapshot() {
        let host = host();
        let embedding = Embedding::region(&host, "javascript", script_range()).unwrap();
        let child = embedding.snapshot();

        assert_eq!(child.text(), "var x=1;");
        assert_eq!(child.language().as_str(), "javascript");
        assert_eq!(child.original_offset(4), Some(HTML.find('x').unwrap()));
        assert_eq!(embedding.host_range(), Some(script_range()));
        assert!(!embedding.is_generated());
    }

    #[test]
    fn test_skip_lengths_trim_delimiters() {
        let host = host();
        let tag = HTML.find("<script>").unwrap();
        let close = HTML.find("</script>").unwrap();
        let embedding = Embedding::builder(&host, "javascript")
            .source_with_skip(tag..close, "<script>".len(), 0)
            .build()
            .unwrap();
        assert_eq!(embedding.snapshot().text(), "var x=1;");
    }

    #[test]
    fn test_oversized_skip_collapses_region() {
        let host = host();
        let embedding = Embedding::builder(&host, "javascript")
            .source_with_skip(10..12, 5, 5)
            .build()
            .unwrap();
        assert!(embedding.snapshot().is_empty());
        assert_eq!(embedding.host_range(), Some(12..12));
    }

    #[test]
    fn test_generated_padding_is_unmapped() {
        let host = host();
        let embedding = Embedding::builder(&host, "javascript")
            .generated("(function(){")
            .source(script_range())
            .generated("})")
            .build()
            .unwrap();
        let child = embedding.snapshot();

        assert!(embedding.is_generated());
        assert_eq!(child.text(), "(function(){var x=1;})");
        assert_eq!(child.original_offset(0), None);
        assert_eq!(child.original_offset(12), Some(script_range().start));
        assert_eq!(child.original_offset(child.len()), None);
    }

    #[test]
    fn test_zero_length_embedding_is_valid() {
        let source = Source::new(
            Url::parse("file:///empty.html").unwrap(),
            "html",
            "<script></script>",
        );
        let host = source.snapshot();
        let embedding = Embedding::region(&host, "javascript", 8..8).unwrap();

        assert!(embedding.snapshot().is_empty());
        assert!(embedding.contains_original(8));
        assert!(!embedding.contains_original(9));
    }

    #[test]
    fn test_out_of_bounds_region_is_rejected() {
        let host = host();
        let err = Embedding::region(&host, "javascript", 30..100).unwrap_err();
        assert!(matches!(err, ParseError::InvalidEmbedding { end: 100, .. }));

        #[allow(clippy::reversed_empty_ranges)]
        let reversed = Embedding::region(&host, "javascript", 20..10);
        assert!(reversed.is_err());
    }

    #[test]
    fn test_keys_follow_content_and_geometry() {
        let host = host();
        let a = Embedding::region(&host, "javascript", script_range()).unwrap();
        let b = Embedding::region(&host, "javascript", script_range()).unwrap();
        let c = Embedding::region(&host, "typescript", script_range()).unwrap();

        assert_eq!(a.key(), b.key());
        assert!(!Embedding::ptr_eq(&a, &b));
        assert_ne!(a.key(), c.key());

        let changed = Source::new(
            Url::parse("file:///index.html").unwrap(),
            "html",
            "<html><script>var y=2;</script></html>",
        )
        .snapshot();
        let d = Embedding::region(&changed, "javascript", script_range()).unwrap();
        assert_ne!(a.key(), d.key());
    }

    #[test]
    fn test_nested_embedding_maps_to_root() {
        let host = host();
        let script = Embedding::region(&host, "javascript", script_range()).unwrap();
        // "x=1" inside the script snapshot
        let nested = Embedding::region(script.snapshot(), "expr", 4..7).unwrap();

        assert_eq!(nested.snapshot().text(), "x=1");
        assert_eq!(nested.snapshot().depth(), 2);
        assert_eq!(
            nested.snapshot().original_offset(0),
            Some(HTML.find('x').unwrap())
        );
        assert_eq!(nested.original_range(), Some(18..21));
    }
}
