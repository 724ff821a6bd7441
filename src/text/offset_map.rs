//! Offset translation between an embedded snapshot and the root document.
//!
//! An [`OffsetMap`] is built once, when an embedding derives its child
//! snapshot, and answers both directions with a binary search. Offsets that
//! fall inside generated text have no original position.

use std::ops::Range;

/// A run of embedded text copied verbatim from the root document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct MappedSpan {
    embedded: usize,
    original: usize,
    len: usize,
}

impl MappedSpan {
    fn embedded_end(&self) -> usize {
        self.embedded + self.len
    }

    fn original_end(&self) -> usize {
        self.original + self.len
    }
}

/// Precomputed mapping table for one snapshot.
///
/// The offset just past a span's last byte maps only when nothing
/// generated starts there: at the end of the text, at a zero-length span,
/// or where the next span begins (the later span wins).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OffsetMap {
    /// Sorted by embedded offset
    spans: Vec<MappedSpan>,
    /// Indices into `spans`, sorted by original offset
    by_original: Vec<usize>,
    /// Length of the embedded text
    len: usize,
}

impl OffsetMap {
    /// Map for a root snapshot: every offset maps to itself.
    pub fn identity(len: usize) -> Self {
        let mut builder = OffsetMapBuilder::new();
        builder.push_mapped(0, len);
        builder.build()
    }

    pub fn builder() -> OffsetMapBuilder {
        OffsetMapBuilder::new()
    }

    /// Length of the embedded text this map describes.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// True when no embedded offset maps back to the root document.
    pub fn is_fully_generated(&self) -> bool {
        self.spans.is_empty()
    }

    /// Translate an embedded offset into the root document.
    pub fn to_original(&self, embedded: usize) -> Option<usize> {
        if embedded > self.len {
            return None;
        }
        let idx = self.spans.partition_point(|s| s.embedded <= embedded);
        let span = self.spans.get(idx.checked_sub(1)?)?;
        let inside = embedded < span.embedded_end()
            || (embedded == span.embedded_end() && self.closes_text(span));
        inside.then(|| span.original + (embedded - span.embedded))
    }

    /// Translate a root document offset into this snapshot.
    pub fn to_embedded(&self, original: usize) -> Option<usize> {
        let idx = self
            .by_original
            .partition_point(|&i| self.spans[i].original <= original);
        let span = &self.spans[*self.by_original.get(idx.checked_sub(1)?)?];
        let inside = original < span.original_end()
            || (original == span.original_end() && self.closes_text(span));
        inside.then(|| span.embedded + (original - span.original))
    }

    /// Whether the position just past `span` is a real boundary rather than
    /// the start of generated text.
    fn closes_text(&self, span: &MappedSpan) -> bool {
        span.len == 0
            || span.embedded_end() == self.len
            || self
                .spans
                .iter()
                .any(|other| other.embedded == span.embedded_end())
    }

    /// Envelope of all mapped spans in root coordinates.
    pub fn original_range(&self) -> Option<Range<usize>> {
        let start = self.spans[*self.by_original.first()?].original;
        let end = self.spans.iter().map(MappedSpan::original_end).max()?;
        Some(start..end)
    }
}

/// Incremental builder used while an embedding assembles its child text.
#[derive(Debug, Default)]
pub struct OffsetMapBuilder {
    spans: Vec<MappedSpan>,
    len: usize,
}

impl OffsetMapBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current length of the embedded text being assembled.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Append `len` bytes copied from `original` in the root document.
    pub fn push_mapped(&mut self, original: usize, len: usize) {
        if let Some(last) = self.spans.last_mut()
            && last.embedded_end() == self.len
            && last.original_end() == original
        {
            // Contiguous in both spaces: extend instead of fragmenting
            if len > 0 && last.len > 0 {
                last.len += len;
                self.len += len;
                return;
            }
            if len == 0 {
                return;
            }
        }
        self.spans.push(MappedSpan {
            embedded: self.len,
            original,
            len,
        });
        self.len += len;
    }

    /// Append `len` bytes of generated text with no original position.
    pub fn push_unmapped(&mut self, len: usize) {
        self.len += len;
    }

    /// Append the host range `range`, translated through the host's own map.
    ///
    /// Pieces of the range that are generated text in the host stay unmapped.
    pub fn push_projected(&mut self, host: &OffsetMap, range: Range<usize>) {
        if range.is_empty() {
            if let Some(original) = host.to_original(range.start) {
                self.push_mapped(original, 0);
            }
            return;
        }

        let mut cursor = range.start;
        let first = host.spans.partition_point(|s| s.embedded_end() <= range.start);
        for span in &host.spans[first..] {
            if span.embedded >= range.end {
                break;
            }
            if span.len == 0 {
                continue;
            }
            let piece_start = span.embedded.max(range.start);
            let piece_end = span.embedded_end().min(range.end);
            if piece_start > cursor {
                self.push_unmapped(piece_start - cursor);
            }
            if piece_end > piece_start {
                self.push_mapped(
                    span.original + (piece_start - span.embedded),
                    piece_end - piece_start,
                );
            }
            cursor = cursor.max(piece_end);
        }
        if range.end > cursor {
            self.push_unmapped(range.end - cursor);
        }
    }

    pub fn build(self) -> OffsetMap {
        let mut by_original: Vec<usize> = (0..self.spans.len()).collect();
        by_original.sort_by_key(|&i| (self.spans[i].original, self.spans[i].embedded));
        OffsetMap {
            spans: self.spans,
            by_original,
            len: self.len,
        }
    }
}
