use std::any::Any;
use std::fmt;
use std::sync::Arc;

use crate::language::{LanguageId, ParserOutput};
use crate::source::Snapshot;
use crate::task::Task;

/// Output of a parser for one snapshot and task.
pub struct ParserResult {
    snapshot: Arc<Snapshot>,
    task: Task,
    generation: u64,
    payload: ParserOutput,
}

impl ParserResult {
    pub(crate) fn new(snapshot: Arc<Snapshot>, task: Task, generation: u64, payload: ParserOutput) -> Self {
        Self {
            snapshot,
            task,
            generation,
            payload,
        }
    }

    /// The snapshot this result was computed from.
    pub fn snapshot(&self) -> &Arc<Snapshot> {
        &self.snapshot
    }

    pub fn task(&self) -> &Task {
        &self.task
    }

    pub fn language(&self) -> &LanguageId {
        self.snapshot.language()
    }

    /// Cache generation the result was published in.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Downcast the parser payload.
    pub fn payload<T: Any>(&self) -> Option<&T> {
        self.payload.downcast_ref::<T>()
    }

    pub fn raw_payload(&self) -> &(dyn Any + Send + Sync) {
        self.payload.as_ref()
    }
}

impl fmt::Debug for ParserResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ParserResult")
            .field("language", self.snapshot.language())
            .field("version", &self.snapshot.version())
            .field("task", &self.task)
            .field("generation", &self.generation)
            .finish_non_exhaustive()
    }
}
