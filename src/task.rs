//! Correlation tokens for parse passes.
//!
//! A [`Task`] selects the cache slot a result is stored under, so that a
//! completion pass and a full syntax check never share results meant for
//! different purposes.

use std::fmt;
use std::sync::Arc;

/// Opaque correlation token threaded through every parse request.
///
/// Two tasks are the same slot when their kinds are equal.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Task {
    kind: Arc<str>,
}

impl Task {
    const USER: &'static str = "user";
    const DISCOVERY: &'static str = "embedding-discovery";
    const INVALIDATION: &'static str = "invalidation";

    pub fn new(kind: impl AsRef<str>) -> Self {
        Self {
            kind: Arc::from(kind.as_ref()),
        }
    }

    /// Task used for ad-hoc user requests.
    pub fn user() -> Self {
        Self::new(Self::USER)
    }

    /// Task used to parse hosts for parser-based embedding providers.
    pub fn discovery() -> Self {
        Self::new(Self::DISCOVERY)
    }

    /// Task that holds the serializer while caches are invalidated.
    pub fn invalidation() -> Self {
        Self::new(Self::INVALIDATION)
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }
}

impl fmt::Display for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.kind)
    }
}

/// Why an in-flight request was cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CancelReason {
    /// A user task preempted the running request
    UserTask,
    /// A higher priority result task preempted the running request
    ParserResultTask,
    /// The source text changed underneath the request
    SourceModification,
}

impl fmt::Display for CancelReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            CancelReason::UserTask => "preempted by user task",
            CancelReason::ParserResultTask => "preempted by parser result task",
            CancelReason::SourceModification => "source modified",
        };
        f.write_str(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_tasks_with_equal_kind_share_a_slot() {
        let mut slots = HashSet::new();
        slots.insert(Task::new("completion"));
        slots.insert(Task::new("completion"));
        slots.insert(Task::user());
        assert_eq!(slots.len(), 2);
    }

    #[test]
    fn test_builtin_tasks_are_distinct() {
        assert_ne!(Task::user(), Task::discovery());
        assert_ne!(Task::discovery(), Task::invalidation());
        assert_eq!(Task::discovery().kind(), "embedding-discovery");
    }

    #[test]
    fn test_cancel_reason_display() {
        assert_eq!(
            CancelReason::SourceModification.to_string(),
            "source modified"
        );
    }
}
