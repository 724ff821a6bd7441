//! Navigation over the cache tree.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::cache::{ParserResult, SourceCache};
use crate::embedding::Embedding;
use crate::error::ParseResult;
use crate::serializer::TaskSerializer;
use crate::source::Snapshot;
use crate::task::Task;

/// A navigation handle over one [`SourceCache`] for one task.
///
/// The iterator remembers the result it handed out and the child iterators
/// it created, so repeated navigation within a session is stable. That
/// memory is private to the iterator; other iterators over the same caches
/// are unaffected by [`ResultIterator::invalidate`].
pub struct ResultIterator {
    cache: Arc<SourceCache>,
    task: Task,
    serializer: Arc<TaskSerializer>,
    result: Option<Arc<ParserResult>>,
    /// Keyed by embedding identity; the embedding is kept alive with its entry
    children: HashMap<usize, (Embedding, ResultIterator)>,
}

impl ResultIterator {
    pub fn new(cache: Arc<SourceCache>, task: Task, serializer: Arc<TaskSerializer>) -> Self {
        Self {
            cache,
            task,
            serializer,
            result: None,
            children: HashMap::new(),
        }
    }

    pub fn snapshot(&self) -> Arc<Snapshot> {
        self.cache.snapshot()
    }

    pub fn task(&self) -> &Task {
        &self.task
    }

    pub fn cache(&self) -> &Arc<SourceCache> {
        &self.cache
    }

    /// The result for this iterator's cache, parsing if necessary.
    ///
    /// The remembered result is handed out again only while the cache is
    /// still in the generation it was published in and its snapshot is
    /// current.
    pub fn parser_result(&mut self) -> ParseResult<Arc<ParserResult>> {
        if let Some(result) = &self.result {
            if self.is_current(result) {
                return Ok(Arc::clone(result));
            }
            self.result = None;
            self.children.retain(|_, (embedding, _)| !embedding.snapshot().is_stale());
        }
        let result = self.cache.result(&self.task, &self.serializer)?;
        self.result = Some(Arc::clone(&result));
        Ok(result)
    }

    fn is_current(&self, result: &ParserResult) -> bool {
        result.generation() == self.cache.generation() && !result.snapshot().is_stale()
    }

    /// The result of the deepest embedding containing `offset`.
    ///
    /// `offset` is in root document coordinates. When several embeddings
    /// contain it, the first in discovery order wins; when none does, this
    /// level's own result is returned.
    pub fn parser_result_at(&mut self, offset: usize) -> ParseResult<Arc<ParserResult>> {
        let embeddings = self.embeddings()?;
        self.retain_children(&embeddings);
        match embeddings
            .iter()
            .find(|embedding| embedding.contains_original(offset))
        {
            Some(embedding) => self.result_iterator(embedding).parser_result_at(offset),
            None => self.parser_result(),
        }
    }

    /// Embeddings of this iterator's snapshot, in discovery order.
    pub fn embeddings(&self) -> ParseResult<Arc<[Embedding]>> {
        self.cache.embeddings(&self.task, &self.serializer)
    }

    /// The child iterator for `embedding`, created on first use.
    ///
    /// Iterators of embeddings from outdated snapshots are dropped here.
    pub fn result_iterator(&mut self, embedding: &Embedding) -> &mut ResultIterator {
        self.children
            .retain(|identity, (kept, _)| *identity == embedding.identity() || !kept.snapshot().is_stale());
        let (_, iterator) = self.children.entry(embedding.identity()).or_insert_with(|| {
            let child = ResultIterator::new(
                self.cache.child(embedding),
                self.task.clone(),
                Arc::clone(&self.serializer),
            );
            (embedding.clone(), child)
        });
        iterator
    }

    /// Keep only the child iterators of `live` embeddings.
    fn retain_children(&mut self, live: &[Embedding]) {
        let before = self.children.len();
        self.children
            .retain(|identity, _| live.iter().any(|embedding| embedding.identity() == *identity));
        if self.children.len() < before {
            log::trace!(
                target: "nestcache::iterator",
                "Dropped {} child iterators of {}",
                before - self.children.len(),
                self.cache.language()
            );
        }
    }

    /// Forget the result and child iterators reached through this iterator.
    ///
    /// The shared caches are left alone; use [`SourceCache::invalidate`] to
    /// drop cached values for everyone.
    pub fn invalidate(&mut self) {
        self.result = None;
        for (_, (_, child)) in self.children.iter_mut() {
            child.invalidate();
        }
        self.children.clear();
    }
}

impl fmt::Debug for ResultIterator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResultIterator")
            .field("language", self.cache.language())
            .field("task", &self.task)
            .field("has_result", &self.result.is_some())
            .field("children", &self.children.len())
            .finish()
    }
}
