//! Process-wide parser lock with cooperative cancellation.
//!
//! All parser and embedding provider calls happen while holding the
//! [`TaskSerializer`]. The lock is fair (threads are served in arrival order)
//! and re-entrant per thread, so a parser that asks for an embedded result
//! while parsing does not deadlock against itself.

use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, OnceLock};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

use crate::error::{LockResultExt, ParseError};
use crate::source::Snapshot;
use crate::task::{CancelReason, Task};

/// Default delay after which an ignored cancellation is reported.
pub const DEFAULT_SLOW_CANCEL_LIMIT: Duration = Duration::from_millis(50);

/// Error returned by [`ParseContext::checkpoint`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("cancelled: {reason}")]
pub struct Cancelled {
    pub reason: CancelReason,
}

impl From<Cancelled> for ParseError {
    fn from(cancelled: Cancelled) -> Self {
        ParseError::Cancelled {
            reason: cancelled.reason,
        }
    }
}

/// Cancellation state of one outermost lock acquisition.
#[derive(Debug, Default)]
struct RequestState {
    token: CancellationToken,
    cancelled: OnceLock<(CancelReason, Instant)>,
}

impl RequestState {
    fn cancel(&self, reason: CancelReason) -> bool {
        let first = self.cancelled.set((reason, Instant::now())).is_ok();
        self.token.cancel();
        first
    }

    fn reason(&self) -> Option<CancelReason> {
        self.cancelled.get().map(|(reason, _)| *reason)
    }
}

struct ActiveRequest {
    task: Task,
    state: Arc<RequestState>,
}

#[derive(Default)]
struct LockState {
    next_ticket: u64,
    serving: u64,
    owner: Option<ThreadId>,
    depth: usize,
    active: Option<ActiveRequest>,
}

/// Fair, re-entrant lock serializing all parser work.
///
/// Instances are injectable; [`TaskSerializer::global`] provides the shared
/// process-wide instance.
pub struct TaskSerializer {
    state: Mutex<LockState>,
    available: Condvar,
    /// Milliseconds; read on every release so reloads apply immediately
    slow_cancel_limit_ms: AtomicU64,
    slow_cancels: AtomicUsize,
}

impl Default for TaskSerializer {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskSerializer {
    pub fn new() -> Self {
        Self::with_slow_cancel_limit(DEFAULT_SLOW_CANCEL_LIMIT)
    }

    pub fn with_slow_cancel_limit(slow_cancel_limit: Duration) -> Self {
        let serializer = Self {
            state: Mutex::new(LockState::default()),
            available: Condvar::new(),
            slow_cancel_limit_ms: AtomicU64::new(0),
            slow_cancels: AtomicUsize::new(0),
        };
        serializer.set_slow_cancel_limit(slow_cancel_limit);
        serializer
    }

    /// Delay after which an ignored cancellation is reported.
    pub fn slow_cancel_limit(&self) -> Duration {
        Duration::from_millis(self.slow_cancel_limit_ms.load(Ordering::Relaxed))
    }

    pub fn set_slow_cancel_limit(&self, limit: Duration) {
        let millis = u64::try_from(limit.as_millis()).unwrap_or(u64::MAX);
        self.slow_cancel_limit_ms.store(millis, Ordering::Relaxed);
    }

    /// Number of requests that kept the lock past the slow-cancel limit
    /// after being cancelled.
    pub fn slow_cancel_count(&self) -> usize {
        self.slow_cancels.load(Ordering::Relaxed)
    }

    /// The process-wide serializer.
    pub fn global() -> Arc<TaskSerializer> {
        static GLOBAL: OnceLock<Arc<TaskSerializer>> = OnceLock::new();
        Arc::clone(GLOBAL.get_or_init(|| Arc::new(TaskSerializer::new())))
    }

    /// Block until this thread owns the lock.
    ///
    /// Re-entrant acquisitions return immediately and share the cancellation
    /// state of the outermost one.
    pub fn lock(&self, task: &Task) -> SerializerGuard<'_> {
        let me = thread::current().id();
        let mut state = self.state.lock().recover_poison("serializer::lock");

        if state.owner == Some(me) {
            state.depth += 1;
            let request = match &state.active {
                Some(active) => Arc::clone(&active.state),
                None => Arc::new(RequestState::default()),
            };
            return SerializerGuard::new(self, request);
        }

        let ticket = state.next_ticket;
        state.next_ticket += 1;
        while state.serving != ticket {
            state = self
                .available
                .wait(state)
                .recover_poison("serializer::lock");
        }

        let request = Arc::new(RequestState::default());
        state.owner = Some(me);
        state.depth = 1;
        state.active = Some(ActiveRequest {
            task: task.clone(),
            state: Arc::clone(&request),
        });
        log::trace!(target: "nestcache::serializer", "Acquired parser lock for task {}", task);
        SerializerGuard::new(self, request)
    }

    /// Run `f` while holding the lock.
    pub fn run<R>(&self, task: &Task, f: impl FnOnce(&SerializerGuard<'_>) -> R) -> R {
        let guard = self.lock(task);
        f(&guard)
    }

    /// True if the calling thread currently owns the lock.
    pub fn holds_lock(&self) -> bool {
        self.state.lock().recover_poison("serializer::holds_lock").owner == Some(thread::current().id())
    }

    /// Number of threads queued behind the current owner.
    pub fn waiting(&self) -> usize {
        let state = self.state.lock().recover_poison("serializer::waiting");
        let queued = state.next_ticket - state.serving;
        usize::try_from(queued.saturating_sub(u64::from(state.owner.is_some()))).unwrap_or(usize::MAX)
    }

    /// The task of the request currently holding the lock.
    pub fn current_task(&self) -> Option<Task> {
        self.state
            .lock()
            .recover_poison("serializer::current_task")
            .active
            .as_ref()
            .map(|active| active.task.clone())
    }

    /// Ask the running request to stop at its next checkpoint.
    ///
    /// Returns false when nothing is running or the request was already
    /// cancelled. Requests that start afterwards are unaffected.
    pub fn cancel_current(&self, reason: CancelReason) -> bool {
        self.cancel_current_if(reason, |_| true)
    }

    /// [`TaskSerializer::cancel_current`], limited to running requests whose
    /// task satisfies `predicate`.
    pub fn cancel_current_if(&self, reason: CancelReason, predicate: impl FnOnce(&Task) -> bool) -> bool {
        let state = self.state.lock().recover_poison("serializer::cancel_current");
        let Some(active) = state.active.as_ref().filter(|active| predicate(&active.task)) else {
            return false;
        };
        let first = active.state.cancel(reason);
        if first {
            log::debug!(
                target: "nestcache::serializer",
                "Cancelling task {}: {}",
                active.task,
                reason
            );
        }
        first
    }

    fn release(&self) {
        let mut state = self.state.lock().recover_poison("serializer::release");
        state.depth = state.depth.saturating_sub(1);
        if state.depth > 0 {
            return;
        }

        if let Some(active) = state.active.take()
            && let Some((_, cancelled_at)) = active.state.cancelled.get()
        {
            let ignored = cancelled_at.elapsed();
            if ignored > self.slow_cancel_limit() {
                self.slow_cancels.fetch_add(1, Ordering::Relaxed);
                log::warn!(
                    target: "nestcache::serializer",
                    "Task {} ignored cancel for {} ms",
                    active.task,
                    ignored.as_millis()
                );
            }
        }
        state.owner = None;
        state.serving += 1;
        drop(state);
        self.available.notify_all();
    }
}

/// Proof of holding the [`TaskSerializer`]; releases it on drop.
///
/// The guard is bound to the acquiring thread.
pub struct SerializerGuard<'a> {
    serializer: &'a TaskSerializer,
    request: Arc<RequestState>,
    _not_send: PhantomData<*const ()>,
}

impl<'a> SerializerGuard<'a> {
    fn new(serializer: &'a TaskSerializer, request: Arc<RequestState>) -> Self {
        Self {
            serializer,
            request,
            _not_send: PhantomData,
        }
    }

    /// Cancellation context for parsing `snapshot` under this guard.
    pub fn context<'s>(&self, snapshot: &'s Arc<Snapshot>) -> ParseContext<'s> {
        ParseContext {
            request: Arc::clone(&self.request),
            snapshot,
            generation: None,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.request.token.is_cancelled()
    }

    /// Token that is cancelled together with the running request.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.request.token.clone()
    }
}

impl Drop for SerializerGuard<'_> {
    fn drop(&mut self) {
        self.serializer.release();
    }
}

/// Handed to parsers so long computations can stop early.
pub struct ParseContext<'a> {
    request: Arc<RequestState>,
    snapshot: &'a Arc<Snapshot>,
    generation: Option<(&'a AtomicU64, u64)>,
}

impl<'a> ParseContext<'a> {
    /// Also fail checkpoints once `counter` moves past `expected`.
    pub(crate) fn with_generation(mut self, counter: &'a AtomicU64, expected: u64) -> Self {
        self.generation = Some((counter, expected));
        self
    }

    pub fn snapshot(&self) -> &Arc<Snapshot> {
        self.snapshot
    }

    /// Fails if the request was cancelled or the work became stale.
    pub fn checkpoint(&self) -> Result<(), Cancelled> {
        if let Some(reason) = self.cancellation() {
            return Err(Cancelled { reason });
        }
        if self.snapshot.is_stale() {
            return Err(Cancelled {
                reason: CancelReason::SourceModification,
            });
        }
        if let Some((counter, expected)) = self.generation
            && counter.load(Ordering::Acquire) != expected
        {
            return Err(Cancelled {
                reason: CancelReason::SourceModification,
            });
        }
        Ok(())
    }

    pub fn is_cancelled(&self) -> bool {
        self.checkpoint().is_err()
    }

    /// Reason of an explicit cancellation, ignoring staleness.
    pub(crate) fn cancellation(&self) -> Option<CancelReason> {
        self.request
            .token
            .is_cancelled()
            .then(|| self.request.reason().unwrap_or(CancelReason::UserTask))
    }
}
