//! Background result tasks, run one at a time in priority order.
//!
//! A result task is a callback that reads parser results of one source. The
//! queue only orders and tracks them; [`crate::ParserManager`] runs them
//! under the task serializer and decides who may preempt whom.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::fmt;
use std::sync::{Arc, Mutex};

use url::Url;

use crate::error::{LockResultExt, ParseResult};
use crate::iterator::ResultIterator;
use crate::task::Task;

/// Lower values run first.
pub type Priority = u32;

/// Callback of a scheduled result task.
pub type ResultTaskFn = Arc<dyn Fn(&mut ResultIterator) -> ParseResult<()> + Send + Sync>;

/// One queued run of a result task.
#[derive(Clone)]
pub struct ScheduledTask {
    pub uri: Url,
    pub task: Task,
    pub priority: Priority,
    pub run: ResultTaskFn,
    seq: u64,
}

impl ScheduledTask {
    fn same_target(&self, uri: &Url, task: &Task) -> bool {
        self.uri == *uri && self.task == *task
    }
}

impl fmt::Debug for ScheduledTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScheduledTask")
            .field("uri", &self.uri.as_str())
            .field("task", &self.task)
            .field("priority", &self.priority)
            .finish_non_exhaustive()
    }
}

impl PartialEq for ScheduledTask {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for ScheduledTask {}

impl PartialOrd for ScheduledTask {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

// BinaryHeap pops the greatest element: lowest priority value, then oldest.
impl Ord for ScheduledTask {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .priority
            .cmp(&self.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// The task currently taken off the queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunningTask {
    pub uri: Url,
    pub task: Task,
    pub priority: Priority,
}

#[derive(Default)]
struct QueueState {
    pending: BinaryHeap<ScheduledTask>,
    next_seq: u64,
    running: Option<RunningTask>,
}

/// Priority queue of result tasks.
#[derive(Default)]
pub struct ResultTaskQueue {
    state: Mutex<QueueState>,
}

impl ResultTaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue `task` for `uri`, replacing a pending run of the same task.
    pub fn push(&self, uri: Url, task: Task, priority: Priority, run: ResultTaskFn) {
        let mut state = self.state.lock().recover_poison("scheduler::push");
        state.pending.retain(|queued| !queued.same_target(&uri, &task));
        let seq = state.next_seq;
        state.next_seq += 1;
        state.pending.push(ScheduledTask {
            uri,
            task,
            priority,
            run,
            seq,
        });
    }

    /// Put a cancelled run back, keeping its place among equal priorities.
    pub(crate) fn requeue(&self, scheduled: ScheduledTask) {
        let mut state = self.state.lock().recover_poison("scheduler::requeue");
        if !state
            .pending
            .iter()
            .any(|queued| queued.same_target(&scheduled.uri, &scheduled.task))
        {
            state.pending.push(scheduled);
        }
    }

    /// Remove pending runs of `task` for `uri`; returns how many were dropped.
    pub fn remove(&self, uri: &Url, task: &Task) -> usize {
        self.remove_where(|queued| queued.same_target(uri, task))
    }

    /// Remove every pending task of `uri`.
    pub fn remove_source(&self, uri: &Url) -> usize {
        self.remove_where(|queued| queued.uri == *uri)
    }

    fn remove_where(&self, matches: impl Fn(&ScheduledTask) -> bool) -> usize {
        let mut state = self.state.lock().recover_poison("scheduler::remove");
        let before = state.pending.len();
        state.pending.retain(|queued| !matches(queued));
        before - state.pending.len()
    }

    /// Take the most urgent task and mark it running.
    pub(crate) fn pop(&self) -> Option<ScheduledTask> {
        let mut state = self.state.lock().recover_poison("scheduler::pop");
        let next = state.pending.pop()?;
        state.running = Some(RunningTask {
            uri: next.uri.clone(),
            task: next.task.clone(),
            priority: next.priority,
        });
        Some(next)
    }

    pub(crate) fn finish(&self) {
        self.state.lock().recover_poison("scheduler::finish").running = None;
    }

    pub fn running(&self) -> Option<RunningTask> {
        self.state.lock().recover_poison("scheduler::running").running.clone()
    }

    pub fn len(&self) -> usize {
        self.state.lock().recover_poison("scheduler::len").pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl fmt::Debug for ResultTaskQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock().recover_poison("scheduler::debug");
        f.debug_struct("ResultTaskQueue")
            .field("pending", &state.pending.len())
            .field("running", &state.running)
            .finish()
    }
}
