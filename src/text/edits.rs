//! Modification events handed to parsers.
//!
//! All changes between two snapshots are merged into one edit:
//! `[start, old_end)` in the old text became `[start, new_end)` in the new
//! text. Parsers that reparse incrementally use it; others ignore it.

use similar::{ChangeTag, TextDiff};

use crate::source::Snapshot;

/// A single merged edit, in byte offsets of the snapshot's own text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TextEdit {
    pub start: usize,
    pub old_end: usize,
    pub new_end: usize,
}

impl TextEdit {
    /// Byte delta (positive for insertion, negative for deletion).
    pub fn delta(&self) -> i64 {
        self.new_end as i64 - self.old_end as i64
    }

    /// True for a pure insertion (nothing was deleted).
    pub fn is_insertion_only(&self) -> bool {
        self.start == self.old_end
    }

    /// Reconstruct the merged edit turning `old_text` into `new_text`.
    ///
    /// Returns None if the texts are identical. The diff runs over
    /// characters, so the edit never splits a UTF-8 sequence; all changes
    /// are merged into `[first change, last change)`.
    pub fn between(old_text: &str, new_text: &str) -> Option<Self> {
        if old_text == new_text {
            return None;
        }

        let diff = TextDiff::from_chars(old_text, new_text);

        let mut start: Option<usize> = None;
        let mut old_end = 0;
        let mut new_end = 0;
        let mut old_byte = 0;
        let mut new_byte = 0;

        for change in diff.iter_all_changes() {
            let len = change.value().len();
            match change.tag() {
                ChangeTag::Equal => {
                    old_byte += len;
                    new_byte += len;
                    continue;
                }
                ChangeTag::Delete => {
                    start.get_or_insert(old_byte);
                    old_byte += len;
                }
                ChangeTag::Insert => {
                    start.get_or_insert(old_byte);
                    new_byte += len;
                }
            }
            old_end = old_byte;
            new_end = new_byte;
        }

        start.map(|start| Self {
            start,
            old_end,
            new_end,
        })
    }
}

/// Describes what changed since the parser last saw this cache node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceModificationEvent {
    previous_version: Option<u64>,
    version: u64,
    edit: Option<TextEdit>,
}

impl SourceModificationEvent {
    /// Event for the first parse of a node.
    pub fn initial(snapshot: &Snapshot) -> Self {
        Self {
            previous_version: None,
            version: snapshot.version(),
            edit: None,
        }
    }

    /// Event between the last parsed snapshot (if any) and the current one.
    pub fn between(previous: Option<&Snapshot>, current: &Snapshot) -> Self {
        match previous {
            None => Self::initial(current),
            Some(previous) => Self {
                previous_version: Some(previous.version()),
                version: current.version(),
                edit: TextEdit::between(previous.text(), current.text()),
            },
        }
    }

    pub fn previous_version(&self) -> Option<u64> {
        self.previous_version
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    /// The merged edit, or None for a first parse or unchanged text.
    pub fn edit(&self) -> Option<TextEdit> {
        self.edit
    }

    /// True when the text differs from what the parser saw last time.
    pub fn is_text_changed(&self) -> bool {
        self.previous_version.is_none() || self.edit.is_some()
    }
}
