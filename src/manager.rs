//! Entry point wiring sources, caches, plugins and the parser lock together.

use std::fmt;
use std::sync::Arc;

use arc_swap::ArcSwap;
use url::Url;

use crate::cache::SourceCache;
use crate::config::CacheSettings;
use crate::error::{ParseError, ParseResult};
use crate::iterator::ResultIterator;
use crate::language::{LanguageId, LanguageRegistry};
use crate::scheduler::{Priority, ResultTaskQueue};
use crate::serializer::TaskSerializer;
use crate::source::{Snapshot, Source, SourceEntry, SourceStore};
use crate::task::{CancelReason, Task};

/// Owns the open sources and runs tasks against them.
///
/// Requests made through [`ParserManager::parse`] are user tasks. They never
/// cancel each other, but they preempt a running background result task,
/// which is then run again once the lock is free.
pub struct ParserManager {
    store: SourceStore,
    registry: LanguageRegistry,
    serializer: Arc<TaskSerializer>,
    settings: ArcSwap<CacheSettings>,
    result_tasks: ResultTaskQueue,
}

impl ParserManager {
    /// Manager using the process-wide serializer and default settings.
    pub fn new(registry: LanguageRegistry) -> Self {
        Self::with_serializer(registry, TaskSerializer::global())
    }

    pub fn with_serializer(registry: LanguageRegistry, serializer: Arc<TaskSerializer>) -> Self {
        Self {
            store: SourceStore::new(),
            registry,
            serializer,
            settings: ArcSwap::from_pointee(CacheSettings::default()),
            result_tasks: ResultTaskQueue::new(),
        }
    }

    /// Manager on the process-wide serializer, configured from `settings`.
    ///
    /// Injection patterns are registered on `registry`. The configured
    /// slow-cancel limit is applied to the shared serializer.
    pub fn from_settings(registry: LanguageRegistry, settings: CacheSettings) -> ParseResult<Self> {
        registry.apply_settings(&settings)?;
        let manager = Self::new(registry);
        manager.serializer.set_slow_cancel_limit(settings.slow_cancel_limit());
        manager.settings.store(Arc::new(settings));
        Ok(manager)
    }

    pub fn registry(&self) -> &LanguageRegistry {
        &self.registry
    }

    pub fn serializer(&self) -> &Arc<TaskSerializer> {
        &self.serializer
    }

    pub fn settings(&self) -> Arc<CacheSettings> {
        self.settings.load_full()
    }

    /// Replace the settings and rebuild the cache trees of open sources.
    ///
    /// Injection patterns are only registered by [`ParserManager::from_settings`];
    /// this affects limits and per-language discovery switches.
    pub fn reload_settings(&self, settings: CacheSettings) {
        let settings = Arc::new(settings);
        self.settings.store(Arc::clone(&settings));
        self.serializer.set_slow_cancel_limit(settings.slow_cancel_limit());

        let _guard = self.serializer.lock(&Task::invalidation());
        for uri in self.store.uris() {
            let Some(entry) = self.store.get(&uri) else {
                continue;
            };
            let cache = SourceCache::root(Arc::clone(&entry.source), &self.registry, Arc::clone(&settings));
            self.store.insert(SourceEntry {
                source: entry.source,
                cache,
            });
        }
        log::info!(
            target: "nestcache::config",
            "Reloaded settings for {} open source(s)",
            self.store.len()
        );
    }

    /// Open (or reopen) a source at version 1.
    pub fn open(&self, uri: Url, language: impl Into<LanguageId>, text: impl Into<String>) -> Arc<SourceCache> {
        let source = Source::new(uri, language, text);
        let cache = SourceCache::root(Arc::clone(&source), &self.registry, self.settings());
        if self
            .store
            .insert(SourceEntry {
                source: Arc::clone(&source),
                cache: Arc::clone(&cache),
            })
            .is_some()
        {
            log::debug!(target: "nestcache::source", "Reopened {}", source.id());
        }
        cache
    }

    /// Forget a source along with its pending result tasks.
    pub fn close(&self, uri: &Url) -> bool {
        self.result_tasks.remove_source(uri);
        self.store.remove(uri).is_some()
    }

    pub fn source(&self, uri: &Url) -> Option<Arc<Source>> {
        self.store.get(uri).map(|entry| entry.source)
    }

    pub fn cache(&self, uri: &Url) -> Option<Arc<SourceCache>> {
        self.store.get(uri).map(|entry| entry.cache)
    }

    pub fn uris(&self) -> Vec<Url> {
        self.store.uris()
    }

    /// Replace the text of an open source.
    ///
    /// The running request is cancelled first so the lock frees up quickly,
    /// then the new version is published and the cache tree invalidated
    /// under the lock.
    pub fn update(&self, uri: &Url, text: impl Into<String>) -> ParseResult<Arc<Snapshot>> {
        let entry = self.entry(uri)?;
        self.serializer.cancel_current(CancelReason::SourceModification);
        let snapshot = entry.source.set_text(text);

        let _guard = self.serializer.lock(&Task::invalidation());
        entry.cache.invalidate();
        Ok(snapshot)
    }

    /// Run `f` with an iterator over `uri`, holding the parser lock throughout.
    pub fn parse<R>(
        &self,
        uri: &Url,
        task: &Task,
        f: impl FnOnce(&mut ResultIterator) -> ParseResult<R>,
    ) -> ParseResult<R> {
        let entry = self.entry(uri)?;
        if self.is_outermost() {
            self.preempt_result_task();
        }
        self.run_locked(entry, task, f)
    }

    fn run_locked<R>(
        &self,
        entry: SourceEntry,
        task: &Task,
        f: impl FnOnce(&mut ResultIterator) -> ParseResult<R>,
    ) -> ParseResult<R> {
        let outermost = self.is_outermost();
        let _guard = self.serializer.lock(task);
        if outermost {
            Self::catch_up(&entry);
        }
        let mut iterator = ResultIterator::new(entry.cache, task.clone(), Arc::clone(&self.serializer));
        f(&mut iterator)
    }

    /// Run `f` over several sources within a single lock acquisition.
    pub fn parse_all<R>(
        &self,
        uris: &[Url],
        task: &Task,
        f: impl FnOnce(&mut [ResultIterator]) -> ParseResult<R>,
    ) -> ParseResult<R> {
        let entries = uris
            .iter()
            .map(|uri| self.entry(uri))
            .collect::<ParseResult<Vec<_>>>()?;
        let outermost = self.is_outermost();
        if outermost {
            self.preempt_result_task();
        }
        let _guard = self.serializer.lock(task);
        let mut iterators: Vec<ResultIterator> = entries
            .into_iter()
            .map(|entry| {
                if outermost {
                    Self::catch_up(&entry);
                }
                ResultIterator::new(entry.cache, task.clone(), Arc::clone(&self.serializer))
            })
            .collect();
        f(&mut iterators)
    }

    /// [`ParserManager::parse`] on the blocking thread pool.
    pub async fn parse_async<R, F>(self: &Arc<Self>, uri: Url, task: Task, f: F) -> ParseResult<R>
    where
        R: Send + 'static,
        F: FnOnce(&mut ResultIterator) -> ParseResult<R> + Send + 'static,
    {
        let manager = Arc::clone(self);
        tokio::task::spawn_blocking(move || manager.parse(&uri, &task, f))
            .await
            .map_err(|err| ParseError::internal(format!("parse task failed: {err}")))?
    }

    /// Queue a background result task for `uri`.
    ///
    /// A pending run of the same task is replaced. If a less urgent result
    /// task is running it is cancelled with
    /// [`CancelReason::ParserResultTask`] and queued again.
    pub fn schedule<F>(&self, uri: Url, task: Task, priority: Priority, f: F)
    where
        F: Fn(&mut ResultIterator) -> ParseResult<()> + Send + Sync + 'static,
    {
        log::debug!(
            target: "nestcache::scheduler",
            "Scheduling task {} for {} at priority {}",
            task,
            uri,
            priority
        );
        self.result_tasks.push(uri, task, priority, Arc::new(f));
        if let Some(running) = self.result_tasks.running()
            && running.priority > priority
        {
            self.serializer
                .cancel_current_if(CancelReason::ParserResultTask, |current| *current == running.task);
        }
    }

    /// Drop the pending runs of `task` for `uri`.
    pub fn unschedule(&self, uri: &Url, task: &Task) -> bool {
        self.result_tasks.remove(uri, task) > 0
    }

    pub fn pending_result_tasks(&self) -> usize {
        self.result_tasks.len()
    }

    /// Run queued result tasks until the queue is empty.
    ///
    /// Cancelled runs are queued again; failed runs are logged and dropped.
    /// Returns the number of runs that completed.
    pub fn run_result_tasks(&self) -> usize {
        let mut completed = 0;
        while let Some(scheduled) = self.result_tasks.pop() {
            let outcome = self
                .entry(&scheduled.uri)
                .and_then(|entry| self.run_locked(entry, &scheduled.task, |iterator| (scheduled.run)(iterator)));
            self.result_tasks.finish();
            match outcome {
                Ok(()) => completed += 1,
                Err(err) if err.is_cancellation() && self.store.get(&scheduled.uri).is_some() => {
                    log::debug!(
                        target: "nestcache::scheduler",
                        "Rescheduling cancelled task {} for {}: {}",
                        scheduled.task,
                        scheduled.uri,
                        err
                    );
                    self.result_tasks.requeue(scheduled);
                }
                Err(err) => {
                    log::warn!(
                        target: "nestcache::scheduler",
                        "Task {} for {} failed: {}",
                        scheduled.task,
                        scheduled.uri,
                        err
                    );
                }
            }
        }
        completed
    }

    /// [`ParserManager::run_result_tasks`] on the blocking thread pool.
    pub async fn run_result_tasks_async(self: &Arc<Self>) -> ParseResult<usize> {
        let manager = Arc::clone(self);
        tokio::task::spawn_blocking(move || manager.run_result_tasks())
            .await
            .map_err(|err| ParseError::internal(format!("result tasks failed: {err}")))
    }

    fn preempt_result_task(&self) {
        if let Some(running) = self.result_tasks.running() {
            self.serializer
                .cancel_current_if(CancelReason::UserTask, |current| *current == running.task);
        }
    }

    fn entry(&self, uri: &Url) -> ParseResult<SourceEntry> {
        self.store
            .get(uri)
            .ok_or_else(|| ParseError::source_not_found(uri.as_str()))
    }

    /// Whether this call is the outermost lock acquisition on this thread.
    fn is_outermost(&self) -> bool {
        !self.serializer.holds_lock()
    }

    fn catch_up(entry: &SourceEntry) {
        if entry.cache.snapshot().is_stale() {
            entry.cache.invalidate();
        }
    }
}

impl fmt::Debug for ParserManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ParserManager")
            .field("sources", &self.store.len())
            .field("languages", &self.registry.language_ids())
            .finish_non_exhaustive()
    }
}
