use std::sync::Arc;

use dashmap::DashMap;
use url::Url;

use super::Source;
use crate::cache::SourceCache;

/// An open source together with the root of its cache tree.
#[derive(Clone)]
pub struct SourceEntry {
    pub source: Arc<Source>,
    pub cache: Arc<SourceCache>,
}

// The central store for all open sources.
#[derive(Default)]
pub struct SourceStore {
    sources: DashMap<Url, SourceEntry>,
}

impl SourceStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert an entry, returning the one it replaced.
    pub fn insert(&self, entry: SourceEntry) -> Option<SourceEntry> {
        let uri = entry.source.id().clone();
        self.sources.insert(uri, entry)
    }

    pub fn get(&self, uri: &Url) -> Option<SourceEntry> {
        self.sources.get(uri).map(|entry| entry.clone())
    }

    pub fn contains(&self, uri: &Url) -> bool {
        self.sources.contains_key(uri)
    }

    pub fn remove(&self, uri: &Url) -> Option<SourceEntry> {
        self.sources.remove(uri).map(|(_, entry)| entry)
    }

    pub fn uris(&self) -> Vec<Url> {
        self.sources.iter().map(|entry| entry.key().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.sources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }
}
