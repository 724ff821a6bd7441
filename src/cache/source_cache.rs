//! A node of the cache tree.
//!
//! Each node is bound to one snapshot. It caches the parser results for that
//! snapshot (one slot per task), the embeddings discovered in it, and one
//! child node per embedding. Every cached value carries the generation it was
//! computed in and is ignored once the node's generation moves on.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use super::result::ParserResult;
use super::versioned::Versioned;
use crate::config::CacheSettings;
use crate::embedding::discovery::{self, ProviderBatch};
use crate::embedding::{Embedding, EmbeddingKey};
use crate::error::{BoxError, LockResultExt, ParseError, ParseResult};
use crate::language::{DiscoveryMode, LanguageId, LanguagePlugin, LanguageRegistry, Parser};
use crate::serializer::{Cancelled, ParseContext, SerializerGuard, TaskSerializer};
use crate::source::{Snapshot, Source};
use crate::task::{CancelReason, Task};
use crate::text::SourceModificationEvent;

struct CacheState {
    snapshot: Arc<Snapshot>,
    results: HashMap<Task, Versioned<Arc<ParserResult>>>,
    embeddings: Option<Versioned<Arc<[Embedding]>>>,
    children: HashMap<EmbeddingKey, Arc<SourceCache>>,
    /// Generation in which the parser last completed `parse`
    parsed: Option<u64>,
    /// Snapshot the parser last completed `parse` on
    last_parsed: Option<Arc<Snapshot>>,
}

#[derive(Default)]
struct ParserSlot {
    parser: Option<Box<dyn Parser>>,
    leased: bool,
}

pub struct SourceCache {
    /// Set for root nodes, which follow the source's current snapshot
    source: Option<Arc<Source>>,
    language: LanguageId,
    plugin: Option<Arc<LanguagePlugin>>,
    registry: LanguageRegistry,
    settings: Arc<CacheSettings>,
    generation: AtomicU64,
    state: Mutex<CacheState>,
    parser: Mutex<ParserSlot>,
}

impl SourceCache {
    /// Root node following the current snapshot of `source`.
    pub fn root(
        source: Arc<Source>,
        registry: &LanguageRegistry,
        settings: Arc<CacheSettings>,
    ) -> Arc<Self> {
        let snapshot = source.snapshot();
        Arc::new(Self::new(Some(source), snapshot, registry, settings))
    }

    fn embedded(
        snapshot: Arc<Snapshot>,
        registry: &LanguageRegistry,
        settings: Arc<CacheSettings>,
    ) -> Arc<Self> {
        Arc::new(Self::new(None, snapshot, registry, settings))
    }

    fn new(
        source: Option<Arc<Source>>,
        snapshot: Arc<Snapshot>,
        registry: &LanguageRegistry,
        settings: Arc<CacheSettings>,
    ) -> Self {
        let language = snapshot.language().clone();
        Self {
            source,
            plugin: registry.get(&language),
            language,
            registry: registry.clone(),
            settings,
            generation: AtomicU64::new(0),
            state: Mutex::new(CacheState {
                snapshot,
                results: HashMap::new(),
                embeddings: None,
                children: HashMap::new(),
                parsed: None,
                last_parsed: None,
            }),
            parser: Mutex::new(ParserSlot::default()),
        }
    }

    /// The snapshot this node is currently bound to.
    pub fn snapshot(&self) -> Arc<Snapshot> {
        Arc::clone(&self.state.lock().recover_poison("cache::snapshot").snapshot)
    }

    pub fn language(&self) -> &LanguageId {
        &self.language
    }

    pub fn is_root(&self) -> bool {
        self.source.is_some()
    }

    pub fn source(&self) -> Option<&Arc<Source>> {
        self.source.as_ref()
    }

    /// Incremented by every invalidation.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    pub fn is_result_cached(&self, task: &Task) -> bool {
        self.cached_result(task).is_some()
    }

    pub fn child_count(&self) -> usize {
        self.state.lock().recover_poison("cache::child_count").children.len()
    }

    /// The child node for `embedding`.
    ///
    /// Repeated calls with embeddings of the same key return the same node.
    /// An embedding from an outdated snapshot gets a detached node, whose
    /// results report cancellation instead of polluting the tree.
    ///
    /// Lookup and insertion happen in one critical section of the state
    /// mutex, and creating a node parses nothing, so callers need not hold
    /// the task serializer.
    pub fn child(&self, embedding: &Embedding) -> Arc<SourceCache> {
        let target = embedding.snapshot();
        if target.is_stale() {
            return Self::embedded(Arc::clone(target), &self.registry, Arc::clone(&self.settings));
        }

        let (child, created) = {
            let mut state = self.state.lock().recover_poison("cache::child");
            match state.children.get(embedding.key()) {
                Some(child) => (Arc::clone(child), false),
                None => {
                    let child =
                        Self::embedded(Arc::clone(target), &self.registry, Arc::clone(&self.settings));
                    state.children.insert(embedding.key().clone(), Arc::clone(&child));
                    (child, true)
                }
            }
        };

        if !created && target.version() > child.snapshot().version() {
            child.rebind(Arc::clone(target));
        }
        child
    }

    /// Drop all cached values of this node and its descendants.
    ///
    /// Root nodes also rebind to their source's current snapshot. No parsing
    /// happens until the next request.
    pub fn invalidate(&self) {
        self.reset(None);
    }

    /// Bind this node to `snapshot` and invalidate it.
    pub fn rebind(&self, snapshot: Arc<Snapshot>) {
        self.reset(Some(snapshot));
    }

    fn reset(&self, snapshot: Option<Arc<Snapshot>>) {
        let children: Vec<Arc<SourceCache>> = {
            let mut state = self.state.lock().recover_poison("cache::invalidate");
            match (snapshot, &self.source) {
                (Some(snapshot), _) => state.snapshot = snapshot,
                (None, Some(source)) => state.snapshot = source.snapshot(),
                (None, None) => {}
            }
            let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
            state.results.clear();
            state.embeddings = None;
            state.parsed = None;
            log::trace!(
                target: "nestcache::cache",
                "Invalidated {} cache at version {} (generation {})",
                self.language,
                state.snapshot.version(),
                generation
            );
            state.children.values().cloned().collect()
        };
        for child in children {
            child.invalidate();
        }
    }

    /// Embeddings of the bound snapshot, in discovery order.
    pub fn embeddings(&self, task: &Task, serializer: &TaskSerializer) -> ParseResult<Arc<[Embedding]>> {
        if let Some(embeddings) = self.cached_embeddings() {
            return Ok(embeddings);
        }
        let guard = serializer.lock(task);
        self.embeddings_locked(&guard)
    }

    /// The parser result for `task`, computing it if necessary.
    pub fn result(&self, task: &Task, serializer: &TaskSerializer) -> ParseResult<Arc<ParserResult>> {
        if let Some(result) = self.cached_result(task) {
            return Ok(result);
        }
        let guard = serializer.lock(task);
        self.result_locked(task, &guard)
    }

    fn cached_result(&self, task: &Task) -> Option<Arc<ParserResult>> {
        let state = self.state.lock().recover_poison("cache::cached_result");
        if state.snapshot.is_stale() {
            return None;
        }
        let generation = self.generation();
        state
            .results
            .get(task)
            .and_then(|cached| cached.current(generation))
            .cloned()
    }

    fn cached_embeddings(&self) -> Option<Arc<[Embedding]>> {
        let state = self.state.lock().recover_poison("cache::cached_embeddings");
        if state.snapshot.is_stale() {
            return None;
        }
        let generation = self.generation();
        state
            .embeddings
            .as_ref()
            .and_then(|cached| cached.current(generation))
            .cloned()
    }

    /// Snapshot and generation to compute against.
    ///
    /// Root nodes catch up with their source; embedded nodes bound to an
    /// outdated snapshot cannot, and report the modification instead.
    fn prepare(&self) -> ParseResult<(Arc<Snapshot>, u64)> {
        let snapshot = self.snapshot();
        if snapshot.is_stale() {
            if self.source.is_none() {
                return Err(ParseError::cancelled(CancelReason::SourceModification));
            }
            log::debug!(
                target: "nestcache::cache",
                "Root cache for {} is behind its source; resynchronizing",
                snapshot.source_id()
            );
            self.invalidate();
            return Ok((self.snapshot(), self.generation()));
        }
        Ok((snapshot, self.generation()))
    }

    fn result_locked(&self, task: &Task, guard: &SerializerGuard<'_>) -> ParseResult<Arc<ParserResult>> {
        for _ in 0..=self.settings.stale_retry_limit() {
            let (snapshot, generation) = self.prepare()?;
            if let Some(result) = self.cached_result(task) {
                return Ok(result);
            }
            match self.compute_result(task, &snapshot, generation, guard) {
                Ok(result) => {
                    if let Some(published) = self.publish_result(task, result, &snapshot, generation) {
                        return Ok(published);
                    }
                }
                Err(ParseError::StaleResult { generation, .. }) => {
                    log::debug!(
                        target: "nestcache::cache",
                        "Result for {} went stale in generation {}; retrying",
                        self.language,
                        generation
                    );
                }
                Err(err) => return Err(err),
            }
        }
        Err(ParseError::cancelled(CancelReason::SourceModification))
    }

    fn compute_result(
        &self,
        task: &Task,
        snapshot: &Arc<Snapshot>,
        generation: u64,
        guard: &SerializerGuard<'_>,
    ) -> ParseResult<ParserResult> {
        let mut lease = self.lease_parser()?;
        let cx = guard.context(snapshot).with_generation(&self.generation, generation);
        cx.checkpoint()?;

        let (parsed, last_parsed) = {
            let state = self.state.lock().recover_poison("cache::compute_result");
            (state.parsed, state.last_parsed.clone())
        };
        if lease.fresh || parsed != Some(generation) {
            let event = match last_parsed {
                Some(previous) if !lease.fresh => SourceModificationEvent::between(Some(&previous), snapshot),
                _ => SourceModificationEvent::initial(snapshot),
            };
            log::debug!(
                target: "nestcache::cache",
                "Parsing {} (version {}, depth {}) for task {}",
                self.language,
                snapshot.version(),
                snapshot.depth(),
                task
            );
            lease
                .parser()?
                .parse(snapshot, task, &event, &cx)
                .map_err(|err| self.classify(err, &cx, generation))?;

            let mut state = self.state.lock().recover_poison("cache::compute_result");
            if self.generation() != generation {
                return Err(self.stale(generation));
            }
            state.parsed = Some(generation);
            state.last_parsed = Some(Arc::clone(snapshot));
        }

        let payload = lease
            .parser()?
            .result(task)
            .map_err(|err| self.classify(err, &cx, generation))?;
        Ok(ParserResult::new(Arc::clone(snapshot), task.clone(), generation, payload))
    }

    fn publish_result(
        &self,
        task: &Task,
        result: ParserResult,
        snapshot: &Arc<Snapshot>,
        generation: u64,
    ) -> Option<Arc<ParserResult>> {
        let mut state = self.state.lock().recover_poison("cache::publish_result");
        if self.generation() != generation || !Arc::ptr_eq(&state.snapshot, snapshot) {
            return None;
        }
        let result = Arc::new(result);
        state
            .results
            .insert(task.clone(), Versioned::new(Arc::clone(&result), generation));
        Some(result)
    }

    fn embeddings_locked(&self, guard: &SerializerGuard<'_>) -> ParseResult<Arc<[Embedding]>> {
        for _ in 0..=self.settings.stale_retry_limit() {
            let (snapshot, generation) = self.prepare()?;
            if let Some(embeddings) = self.cached_embeddings() {
                return Ok(embeddings);
            }
            match self.discover(&snapshot, generation, guard) {
                Ok(embeddings) => {
                    if let Some(published) = self.publish_embeddings(embeddings, &snapshot, generation) {
                        return Ok(published);
                    }
                }
                Err(ParseError::StaleResult { .. }) => {}
                Err(err) => return Err(err),
            }
        }
        Err(ParseError::cancelled(CancelReason::SourceModification))
    }

    fn discover(
        &self,
        snapshot: &Arc<Snapshot>,
        generation: u64,
        guard: &SerializerGuard<'_>,
    ) -> ParseResult<Vec<Embedding>> {
        let Some(plugin) = self.plugin.as_ref().filter(|plugin| !plugin.embedders().is_empty()) else {
            return Ok(Vec::new());
        };
        if !self.settings.embeddings_enabled(self.language.as_str()) {
            return Ok(Vec::new());
        }
        if snapshot.depth() >= self.settings.max_embedding_depth() {
            log::debug!(
                target: "nestcache::embedding",
                "Skipping discovery in {} at depth {}",
                self.language,
                snapshot.depth()
            );
            return Ok(Vec::new());
        }

        let needs_host = plugin
            .embedders()
            .iter()
            .any(|provider| provider.mode() == DiscoveryMode::ParserBased);
        let host = if needs_host {
            match self.result_locked(&Task::discovery(), guard) {
                Ok(result) => Some(result),
                Err(err) if err.is_cancellation() => return Err(err),
                Err(err) => {
                    log::warn!(
                        target: "nestcache::embedding",
                        "Host parse of {} failed; parser-based providers skipped: {}",
                        self.language,
                        err
                    );
                    None
                }
            }
        } else {
            None
        };

        let cx = guard.context(snapshot).with_generation(&self.generation, generation);
        let mut batches = Vec::with_capacity(plugin.embedders().len());
        for provider in plugin.embedders() {
            let host_result = match provider.mode() {
                DiscoveryMode::Lexical => None,
                DiscoveryMode::ParserBased => match &host {
                    Some(result) => Some(result.as_ref()),
                    None => continue,
                },
            };
            match provider.embeddings(snapshot, host_result) {
                Ok(embeddings) => batches.push(ProviderBatch {
                    provider: provider.name().to_string(),
                    embeddings,
                }),
                Err(err) => {
                    if cx.checkpoint().is_err() {
                        return Err(self.classify(err, &cx, generation));
                    }
                    log::warn!(
                        target: "nestcache::embedding",
                        "Embedding provider {} failed on {}: {}",
                        provider.name(),
                        self.language,
                        err
                    );
                }
            }
        }
        if let Err(cancelled) = cx.checkpoint() {
            return Err(self.classify(Box::new(cancelled), &cx, generation));
        }

        Ok(discovery::normalize(snapshot, batches))
    }

    fn publish_embeddings(
        &self,
        embeddings: Vec<Embedding>,
        snapshot: &Arc<Snapshot>,
        generation: u64,
    ) -> Option<Arc<[Embedding]>> {
        let embeddings: Arc<[Embedding]> = embeddings.into();
        let rebinds = {
            let mut state = self.state.lock().recover_poison("cache::publish_embeddings");
            if self.generation() != generation || !Arc::ptr_eq(&state.snapshot, snapshot) {
                return None;
            }

            let live: HashMap<&EmbeddingKey, &Embedding> =
                embeddings.iter().map(|embedding| (embedding.key(), embedding)).collect();
            let before = state.children.len();
            let mut rebinds = Vec::new();
            state.children.retain(|key, child| match live.get(key) {
                Some(embedding) => {
                    rebinds.push((Arc::clone(child), Arc::clone(embedding.snapshot())));
                    true
                }
                None => false,
            });
            if state.children.len() < before {
                log::debug!(
                    target: "nestcache::cache",
                    "Dropped {} child cache(s) of {}",
                    before - state.children.len(),
                    self.language
                );
            }
            state.embeddings = Some(Versioned::new(Arc::clone(&embeddings), generation));
            rebinds
        };

        for (child, snapshot) in rebinds {
            if !Arc::ptr_eq(&child.snapshot(), &snapshot) {
                child.rebind(snapshot);
            }
        }
        Some(embeddings)
    }

    /// Map a plugin error to the error reported to callers.
    fn classify(&self, err: BoxError, cx: &ParseContext<'_>, generation: u64) -> ParseError {
        if let Some(reason) = cx.cancellation() {
            return ParseError::cancelled(reason);
        }
        if cx.checkpoint().is_err() {
            return self.stale(generation);
        }
        let err = match err.downcast::<Cancelled>() {
            Ok(cancelled) => return ParseError::cancelled(cancelled.reason),
            Err(err) => err,
        };
        // Cache errors a plugin propagated with `?` are reported unchanged
        match err.downcast::<ParseError>() {
            Ok(err) => *err,
            Err(err) => ParseError::parse_failure(self.language.as_str(), err),
        }
    }

    fn stale(&self, generation: u64) -> ParseError {
        ParseError::StaleResult {
            language: self.language.to_string(),
            generation,
        }
    }

    fn lease_parser(&self) -> ParseResult<ParserLease<'_>> {
        let factory = self
            .plugin
            .as_ref()
            .and_then(|plugin| plugin.parser_factory())
            .ok_or_else(|| ParseError::parser_not_found(self.language.as_str()))?;

        let existing = {
            let mut slot = self.parser.lock().recover_poison("cache::lease_parser");
            if slot.leased {
                return Err(ParseError::RecursiveParse {
                    language: self.language.to_string(),
                });
            }
            slot.leased = true;
            slot.parser.take()
        };

        let fresh = existing.is_none();
        let parser = existing.unwrap_or_else(|| factory.create_parser());
        Ok(ParserLease {
            slot: &self.parser,
            parser: Some(parser),
            fresh,
        })
    }
}

impl fmt::Debug for SourceCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SourceCache")
            .field("language", &self.language)
            .field("root", &self.is_root())
            .field("generation", &self.generation())
            .finish_non_exhaustive()
    }
}

/// A parser checked out of its node; returned on drop.
struct ParserLease<'a> {
    slot: &'a Mutex<ParserSlot>,
    parser: Option<Box<dyn Parser>>,
    /// Created for this lease, so it has parsed nothing yet
    fresh: bool,
}

impl ParserLease<'_> {
    fn parser(&mut self) -> ParseResult<&mut (dyn Parser + 'static)> {
        self.parser
            .as_deref_mut()
            .ok_or_else(|| ParseError::internal("parser lease already returned"))
    }
}

impl Drop for ParserLease<'_> {
    fn drop(&mut self) {
        let mut slot = self.slot.lock().recover_poison("cache::return_parser");
        slot.leased = false;
        // A parser that panicked mid-call may hold inconsistent state
        if !std::thread::panicking() {
            slot.parser = self.parser.take();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::language::{
        EmbeddingProvider, LanguagePlugin, ParserFactory, ParserOutput, RegexEmbeddingProvider,
    };
    use std::sync::atomic::AtomicUsize;
    use std::sync::{OnceLock, Weak};
    use url::Url;

    const HTML: &str = "<html><script>var x=1;</script></html>";

    /// Parser echoing its snapshot text and counting parse calls.
    struct EchoParser {
        parses: Arc<AtomicUsize>,
        events: Arc<Mutex<Vec<SourceModificationEvent>>>,
        text: Option<String>,
        fail: bool,
    }

    impl Parser for EchoParser {
        fn parse(
            &mut self,
            snapshot: &Arc<Snapshot>,
            _task: &Task,
            event: &SourceModificationEvent,
            cx: &ParseContext<'_>,
        ) -> Result<(), BoxError> {
            cx.checkpoint()?;
            self.parses.fetch_add(1, Ordering::SeqCst);
            self.events.lock().unwrap().push(event.clone());
            if self.fail {
                return Err("syntax error".into());
            }
            self.text = Some(snapshot.text().to_string());
            Ok(())
        }

        fn result(&mut self, task: &Task) -> Result<ParserOutput, BoxError> {
            let text = self.text.clone().ok_or("not parsed")?;
            Ok(Box::new(format!("{}:{}", task.kind(), text)))
        }
    }

    struct Fixture {
        source: Arc<Source>,
        cache: Arc<SourceCache>,
        serializer: TaskSerializer,
        parses: Arc<AtomicUsize>,
        events: Arc<Mutex<Vec<SourceModificationEvent>>>,
    }

    fn fixture_with(text: &str, fail: bool) -> Fixture {
        let parses = Arc::new(AtomicUsize::new(0));
        let events = Arc::new(Mutex::new(Vec::new()));
        let factory = {
            let parses = Arc::clone(&parses);
            let events = Arc::clone(&events);
            move || {
                Box::new(EchoParser {
                    parses: Arc::clone(&parses),
                    events: Arc::clone(&events),
                    text: None,
                    fail,
                }) as Box<dyn Parser>
            }
        };
        let registry = LanguageRegistry::new();
        registry.set_fallback_parser(factory);
        registry.add_embedder(
            "html",
            RegexEmbeddingProvider::new("<script>(?P<content>.*?)</script>", "javascript").unwrap(),
        );

        let source = Source::new(Url::parse("file:///index.html").unwrap(), "html", text);
        let cache = SourceCache::root(Arc::clone(&source), &registry, Arc::new(CacheSettings::default()));
        Fixture {
            source,
            cache,
            serializer: TaskSerializer::new(),
            parses,
            events,
        }
    }

    fn fixture(text: &str) -> Fixture {
        fixture_with(text, false)
    }

    fn echo_factory() -> impl ParserFactory + 'static {
        || {
            Box::new(EchoParser {
                parses: Arc::new(AtomicUsize::new(0)),
                events: Arc::new(Mutex::new(Vec::new())),
                text: None,
                fail: false,
            }) as Box<dyn Parser>
        }
    }

    fn payload(result: &ParserResult) -> &str {
        result.payload::<String>().unwrap()
    }

    #[test]
    fn test_result_is_cached_per_task() {
        let f = fixture(HTML);
        let first = f.cache.result(&Task::user(), &f.serializer).unwrap();
        let second = f.cache.result(&Task::user(), &f.serializer).unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(f.parses.load(Ordering::SeqCst), 1);

        // A second task reuses the parse but gets its own slot
        let other = f.cache.result(&Task::new("outline"), &f.serializer).unwrap();
        assert_eq!(payload(&other), format!("outline:{HTML}"));
        assert_eq!(f.parses.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_invalidate_forces_recomputation() {
        let f = fixture(HTML);
        let before = f.cache.result(&Task::user(), &f.serializer).unwrap();
        let generation = f.cache.generation();

        f.cache.invalidate();
        assert!(f.cache.generation() > generation);
        assert!(!f.cache.is_result_cached(&Task::user()));

        let after = f.cache.result(&Task::user(), &f.serializer).unwrap();
        assert!(!Arc::ptr_eq(&before, &after));
        assert_eq!(f.parses.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_root_resynchronizes_with_source() {
        let f = fixture(HTML);
        f.cache.result(&Task::user(), &f.serializer).unwrap();

        f.source.set_text("<html></html>");
        let result = f.cache.result(&Task::user(), &f.serializer).unwrap();

        assert_eq!(payload(&result), "user:<html></html>");
        assert_eq!(result.snapshot().version(), 2);
        let events = f.events.lock().unwrap();
        assert_eq!(events.last().unwrap().previous_version(), Some(1));
        assert!(events.last().unwrap().is_text_changed());
    }

    #[test]
    fn test_embeddings_and_children() {
        let f = fixture(HTML);
        let embeddings = f.cache.embeddings(&Task::user(), &f.serializer).unwrap();
        assert_eq!(embeddings.len(), 1);
        assert_eq!(embeddings[0].snapshot().text(), "var x=1;");

        let child = f.cache.child(&embeddings[0]);
        assert!(Arc::ptr_eq(&child, &f.cache.child(&embeddings[0])));
        assert_eq!(f.cache.child_count(), 1);

        let result = child.result(&Task::user(), &f.serializer).unwrap();
        assert_eq!(payload(&result), "user:var x=1;");
        assert_eq!(result.language().as_str(), "javascript");
    }

    #[test]
    fn test_unchanged_embedding_keeps_child_node() {
        let f = fixture(HTML);
        let first = f.cache.embeddings(&Task::user(), &f.serializer).unwrap();
        let child = f.cache.child(&first[0]);

        // Edit after the script; the script geometry and text stay the same
        f.source.set_text("<html><script>var x=1;</script></html><!-- -->");
        f.cache.invalidate();
        let second = f.cache.embeddings(&Task::user(), &f.serializer).unwrap();

        assert!(!Embedding::ptr_eq(&first[0], &second[0]));
        let again = f.cache.child(&second[0]);
        assert!(Arc::ptr_eq(&child, &again));
        assert_eq!(again.snapshot().version(), 2);
    }

    #[test]
    fn test_changed_embedding_drops_child_node() {
        let f = fixture(HTML);
        let first = f.cache.embeddings(&Task::user(), &f.serializer).unwrap();
        let old_child = f.cache.child(&first[0]);
        old_child.result(&Task::user(), &f.serializer).unwrap();

        f.source.set_text("<html><script>var y=2;</script></html>");
        f.cache.invalidate();
        let second = f.cache.embeddings(&Task::user(), &f.serializer).unwrap();
        assert_eq!(f.cache.child_count(), 0);

        let new_child = f.cache.child(&second[0]);
        assert!(!Arc::ptr_eq(&old_child, &new_child));
        // The orphaned node still points at the old snapshot
        let err = old_child.result(&Task::user(), &f.serializer).unwrap_err();
        assert!(matches!(
            err,
            ParseError::Cancelled {
                reason: CancelReason::SourceModification
            }
        ));
    }

    #[test]
    fn test_parse_failure_leaves_cache_empty() {
        let f = fixture_with(HTML, true);
        let err = f.cache.result(&Task::user(), &f.serializer).unwrap_err();
        assert!(matches!(err, ParseError::ParseFailure { .. }));
        assert!(!f.cache.is_result_cached(&Task::user()));

        // Next request retries the parse
        assert!(f.cache.result(&Task::user(), &f.serializer).is_err());
        assert_eq!(f.parses.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_missing_parser_is_reported() {
        let registry = LanguageRegistry::new();
        registry.register("html", LanguagePlugin::new());
        let source = Source::new(Url::parse("file:///a.html").unwrap(), "html", "<p>");
        let cache = SourceCache::root(source, &registry, Arc::new(CacheSettings::default()));

        let err = cache.result(&Task::user(), &TaskSerializer::new()).unwrap_err();
        assert!(matches!(err, ParseError::ParserNotFound { .. }));
        // Discovery still works without a parser
        assert!(cache.embeddings(&Task::user(), &TaskSerializer::new()).unwrap().is_empty());
    }

    #[test]
    fn test_stale_embedding_gets_detached_node() {
        let f = fixture(HTML);
        let embeddings = f.cache.embeddings(&Task::user(), &f.serializer).unwrap();
        f.source.set_text("<html></html>");

        let detached = f.cache.child(&embeddings[0]);
        assert_eq!(f.cache.child_count(), 0);
        assert!(detached.result(&Task::user(), &f.serializer).is_err());
    }

    #[test]
    fn test_concurrent_child_requests_share_one_node() {
        let f = fixture(HTML);
        let embeddings = f.cache.embeddings(&Task::user(), &f.serializer).unwrap();

        let children: Vec<Arc<SourceCache>> = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..8)
                .map(|_| scope.spawn(|| f.cache.child(&embeddings[0])))
                .collect();
            handles.into_iter().map(|handle| handle.join().unwrap()).collect()
        });

        assert!(children.iter().all(|child| Arc::ptr_eq(child, &children[0])));
        assert_eq!(f.cache.child_count(), 1);
    }

    /// Embeds the text between quotes, recording the host payload it saw.
    struct QuotedStrings {
        seen: Arc<Mutex<Vec<String>>>,
    }

    impl EmbeddingProvider for QuotedStrings {
        fn mode(&self) -> DiscoveryMode {
            DiscoveryMode::ParserBased
        }

        fn embeddings(
            &self,
            snapshot: &Arc<Snapshot>,
            host: Option<&ParserResult>,
        ) -> Result<Vec<Embedding>, BoxError> {
            let host = host.ok_or("host result missing")?;
            self.seen.lock().unwrap().push(payload(host).to_string());
            let start = snapshot.text().find('"').ok_or("no string")? + 1;
            let end = start + snapshot.text()[start..].find('"').ok_or("unterminated")?;
            Ok(vec![Embedding::region(snapshot, "sql", start..end)?])
        }
    }

    #[test]
    fn test_parser_based_provider_receives_host_result() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let registry = LanguageRegistry::new();
        registry.set_fallback_parser(echo_factory());
        registry.add_embedder("python", QuotedStrings { seen: Arc::clone(&seen) });
        let source = Source::new(Url::parse("file:///q.py").unwrap(), "python", "q = \"select 1\"");
        let cache = SourceCache::root(source, &registry, Arc::new(CacheSettings::default()));

        let embeddings = cache.embeddings(&Task::user(), &TaskSerializer::new()).unwrap();

        assert_eq!(embeddings.len(), 1);
        assert_eq!(embeddings[0].snapshot().text(), "select 1");
        assert_eq!(*seen.lock().unwrap(), vec!["embedding-discovery:q = \"select 1\"".to_string()]);
        // The host parse is cached in the discovery slot
        assert!(cache.is_result_cached(&Task::discovery()));
        assert!(!cache.is_result_cached(&Task::user()));
    }

    #[test]
    fn test_self_embedding_stops_at_depth_limit() {
        let registry = LanguageRegistry::new();
        registry.set_fallback_parser(echo_factory());
        registry.add_embedder("html", RegexEmbeddingProvider::new("(?P<content>.+)", "html").unwrap());
        let settings = CacheSettings {
            max_embedding_depth: Some(3),
            ..CacheSettings::default()
        };
        let source = Source::new(Url::parse("file:///loop.html").unwrap(), "html", "<div></div>");
        let serializer = TaskSerializer::new();
        let mut node = SourceCache::root(source, &registry, Arc::new(settings));

        let mut depth = 0;
        loop {
            let embeddings = node.embeddings(&Task::user(), &serializer).unwrap();
            let Some(embedding) = embeddings.first() else {
                break;
            };
            assert_eq!(embedding.language().as_str(), "html");
            node = node.child(embedding);
            depth += 1;
        }

        assert_eq!(depth, 3);
        assert_eq!(node.snapshot().depth(), 3);
        assert_eq!(node.snapshot().text(), "<div></div>");
    }

    /// Parser that asks its own node for a result while parsing.
    struct ReentrantParser {
        cache: Arc<OnceLock<Weak<SourceCache>>>,
        serializer: Arc<TaskSerializer>,
    }

    impl Parser for ReentrantParser {
        fn parse(
            &mut self,
            _snapshot: &Arc<Snapshot>,
            _task: &Task,
            _event: &SourceModificationEvent,
            _cx: &ParseContext<'_>,
        ) -> Result<(), BoxError> {
            let cache = self.cache.get().and_then(Weak::upgrade).ok_or("cache gone")?;
            cache.result(&Task::new("inner"), &self.serializer)?;
            Ok(())
        }

        fn result(&mut self, _task: &Task) -> Result<ParserOutput, BoxError> {
            Ok(Box::new(()))
        }
    }

    #[test]
    fn test_parser_requesting_its_own_node_is_rejected() {
        let slot: Arc<OnceLock<Weak<SourceCache>>> = Arc::new(OnceLock::new());
        let serializer = Arc::new(TaskSerializer::new());
        let registry = LanguageRegistry::new();
        registry.register_parser("lisp", {
            let slot = Arc::clone(&slot);
            let serializer = Arc::clone(&serializer);
            move || {
                Box::new(ReentrantParser {
                    cache: Arc::clone(&slot),
                    serializer: Arc::clone(&serializer),
                }) as Box<dyn Parser>
            }
        });
        let source = Source::new(Url::parse("file:///a.lisp").unwrap(), "lisp", "(f)");
        let cache = SourceCache::root(source, &registry, Arc::new(CacheSettings::default()));
        slot.set(Arc::downgrade(&cache)).unwrap();

        let err = cache.result(&Task::user(), &serializer).unwrap_err();

        assert!(matches!(err, ParseError::RecursiveParse { ref language } if language == "lisp"));
        assert!(!cache.is_result_cached(&Task::user()));
        assert!(!serializer.holds_lock());
    }
}
