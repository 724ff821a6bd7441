use std::fmt;
use std::ops::Range;
use std::sync::Arc;
use std::sync::atomic::Ordering;

use url::Url;

use super::Origin;
use crate::language::LanguageId;
use crate::text::OffsetMap;

/// Immutable, versioned view of a source's text.
///
/// Root snapshots map every offset to itself; embedded snapshots carry the
/// table built by their embedding. Two snapshots with equal text and equal
/// tables are interchangeable even when they are distinct allocations.
pub struct Snapshot {
    text: String,
    language: LanguageId,
    version: u64,
    depth: usize,
    offsets: OffsetMap,
    origin: Arc<Origin>,
}

impl Snapshot {
    pub(crate) fn root(origin: Arc<Origin>, language: LanguageId, text: String, version: u64) -> Self {
        let offsets = OffsetMap::identity(text.len());
        Self {
            text,
            language,
            version,
            depth: 0,
            offsets,
            origin,
        }
    }

    pub(crate) fn embedded(
        host: &Snapshot,
        language: LanguageId,
        text: String,
        offsets: OffsetMap,
    ) -> Self {
        debug_assert_eq!(text.len(), offsets.len());
        Self {
            text,
            language,
            version: host.version,
            depth: host.depth + 1,
            offsets,
            origin: Arc::clone(&host.origin),
        }
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn language(&self) -> &LanguageId {
        &self.language
    }

    /// Version of the source this snapshot was taken from.
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Nesting depth: 0 for the document itself.
    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn source_id(&self) -> &Url {
        &self.origin.id
    }

    pub fn len(&self) -> usize {
        self.text.len()
    }

    pub fn is_empty(&self) -> bool {
        self.text.is_empty()
    }

    pub fn offset_map(&self) -> &OffsetMap {
        &self.offsets
    }

    /// Offset in the root document, or None inside generated text.
    pub fn original_offset(&self, embedded: usize) -> Option<usize> {
        self.offsets.to_original(embedded)
    }

    /// Offset in this snapshot, or None if the root offset is not covered.
    pub fn embedded_offset(&self, original: usize) -> Option<usize> {
        self.offsets.to_embedded(original)
    }

    /// Envelope of the root document covered by this snapshot.
    pub fn original_range(&self) -> Option<Range<usize>> {
        self.offsets.original_range()
    }

    /// True once the owning source has moved past this snapshot's version.
    pub fn is_stale(&self) -> bool {
        self.origin.version.load(Ordering::Acquire) != self.version
    }

    /// Same text, language and offset table, regardless of version.
    pub fn is_equivalent(&self, other: &Snapshot) -> bool {
        self.text == other.text && self.language == other.language && self.offsets == other.offsets
    }
}

impl fmt::Debug for Snapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Snapshot")
            .field("source", &self.origin.id.as_str())
            .field("language", &self.language)
            .field("version", &self.version)
            .field("depth", &self.depth)
            .field("len", &self.text.len())
            .finish()
    }
}
