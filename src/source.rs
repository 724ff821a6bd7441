//! Sources (open documents) and their snapshots.
//!
//! A [`Source`] is mutated only by the text-editing collaborator. Every
//! mutation bumps its version and publishes a new immutable [`Snapshot`].

pub mod snapshot;
pub mod store;

pub use snapshot::Snapshot;
pub use store::{SourceEntry, SourceStore};

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use arc_swap::ArcSwap;
use url::Url;

use crate::error::LockResultExt;
use crate::language::LanguageId;

/// Identity and version counter shared by a source and all its snapshots.
pub(crate) struct Origin {
    pub(crate) id: Url,
    pub(crate) version: AtomicU64,
}

/// One logical document.
pub struct Source {
    origin: Arc<Origin>,
    language: LanguageId,
    snapshot: ArcSwap<Snapshot>,
    /// Serializes writers so the version counter and snapshot stay paired
    write_lock: Mutex<()>,
}

impl Source {
    /// Open a source at version 1.
    pub fn new(id: Url, language: impl Into<LanguageId>, text: impl Into<String>) -> Arc<Self> {
        let language = language.into();
        let origin = Arc::new(Origin {
            id,
            version: AtomicU64::new(1),
        });
        let snapshot = Snapshot::root(Arc::clone(&origin), language.clone(), text.into(), 1);
        Arc::new(Self {
            origin,
            language,
            snapshot: ArcSwap::from_pointee(snapshot),
            write_lock: Mutex::new(()),
        })
    }

    pub fn id(&self) -> &Url {
        &self.origin.id
    }

    pub fn language(&self) -> &LanguageId {
        &self.language
    }

    /// Current version; bumped by every [`Source::set_text`].
    pub fn version(&self) -> u64 {
        self.origin.version.load(Ordering::Acquire)
    }

    /// The most recent snapshot.
    pub fn snapshot(&self) -> Arc<Snapshot> {
        self.snapshot.load_full()
    }

    /// Replace the text and return the new snapshot.
    ///
    /// The version is bumped before the snapshot is published, so a parse
    /// running against the previous snapshot observes staleness at its next
    /// checkpoint. Callers are still responsible for invalidating caches.
    pub fn set_text(&self, text: impl Into<String>) -> Arc<Snapshot> {
        let _guard = self.write_lock.lock().recover_poison("source::set_text");
        let version = self.origin.version.load(Ordering::Acquire) + 1;
        let snapshot = Arc::new(Snapshot::root(
            Arc::clone(&self.origin),
            self.language.clone(),
            text.into(),
            version,
        ));
        self.origin.version.store(version, Ordering::Release);
        self.snapshot.store(Arc::clone(&snapshot));
        log::debug!(
            target: "nestcache::source",
            "{} moved to version {}",
            self.origin.id,
            version
        );
        snapshot
    }
}

impl fmt::Debug for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Source")
            .field("id", &self.origin.id.as_str())
            .field("language", &self.language)
            .field("version", &self.version())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_source_starts_at_version_one() {
        let source = Source::new(Url::parse("file:///a.txt").unwrap(), "text", "hello");
        assert_eq!(source.version(), 1);
        assert_eq!(source.snapshot().version(), 1);
        assert_eq!(source.snapshot().text(), "hello");
        assert_eq!(source.language().as_str(), "text");
    }

    #[test]
    fn test_set_text_bumps_version_monotonically() {
        let source = Source::new(Url::parse("file:///a.txt").unwrap(), "text", "a");
        let second = source.set_text("ab");
        let third = source.set_text("abc");

        assert_eq!(second.version(), 2);
        assert_eq!(third.version(), 3);
        assert_eq!(source.version(), 3);
        assert!(Arc::ptr_eq(&source.snapshot(), &third));
    }

    #[test]
    fn test_concurrent_writers_keep_version_and_snapshot_paired() {
        let source = Source::new(Url::parse("file:///a.txt").unwrap(), "text", "");
        std::thread::scope(|scope| {
            for i in 0..8 {
                let source = &source;
                scope.spawn(move || {
                    for j in 0..25 {
                        source.set_text(format!("{i}-{j}"));
                    }
                });
            }
        });

        assert_eq!(source.version(), 201);
        assert_eq!(source.snapshot().version(), 201);
    }
}
