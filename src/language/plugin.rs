//! Capability interfaces implemented by language plugins.
//!
//! The cache never interprets language syntax. It asks a [`Parser`] for
//! results and an [`EmbeddingProvider`] for embedded regions, and calls both
//! only from inside the task serializer's critical section.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use crate::cache::ParserResult;
use crate::embedding::Embedding;
use crate::error::BoxError;
use crate::serializer::ParseContext;
use crate::source::Snapshot;
use crate::task::Task;
use crate::text::SourceModificationEvent;

/// Payload a parser hands back for one task.
pub type ParserOutput = Box<dyn Any + Send + Sync>;

/// A language parser bound to one cache node.
///
/// `parse` is called at most once per snapshot generation; `result` may be
/// called several times afterwards, once per task slot. Both must be
/// deterministic for identical text and task. Long parses should call
/// [`ParseContext::checkpoint`] and propagate its error with `?`.
pub trait Parser: Send {
    fn parse(
        &mut self,
        snapshot: &Arc<Snapshot>,
        task: &Task,
        event: &SourceModificationEvent,
        cx: &ParseContext<'_>,
    ) -> Result<(), BoxError>;

    fn result(&mut self, task: &Task) -> Result<ParserOutput, BoxError>;
}

/// Creates parser instances for a language.
pub trait ParserFactory: Send + Sync {
    fn create_parser(&self) -> Box<dyn Parser>;
}

impl<F> ParserFactory for F
where
    F: Fn() -> Box<dyn Parser> + Send + Sync,
{
    fn create_parser(&self) -> Box<dyn Parser> {
        self()
    }
}

/// How an embedding provider inspects its host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DiscoveryMode {
    /// Works on the snapshot text alone
    #[default]
    Lexical,
    /// Needs the host's parse result
    ParserBased,
}

/// Discovers the embedded regions of a snapshot.
///
/// Output must be reproducible for identical text; ordering by start offset
/// and non-overlap are expected but repaired if violated.
pub trait EmbeddingProvider: Send + Sync {
    fn mode(&self) -> DiscoveryMode {
        DiscoveryMode::Lexical
    }

    /// Name used in log messages.
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }

    fn embeddings(
        &self,
        snapshot: &Arc<Snapshot>,
        host: Option<&ParserResult>,
    ) -> Result<Vec<Embedding>, BoxError>;
}

/// Everything registered for one language.
#[derive(Clone, Default)]
pub struct LanguagePlugin {
    parser: Option<Arc<dyn ParserFactory>>,
    embedders: Vec<Arc<dyn EmbeddingProvider>>,
}

impl LanguagePlugin {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_parser(mut self, factory: impl ParserFactory + 'static) -> Self {
        self.parser = Some(Arc::new(factory));
        self
    }

    /// Append a provider; earlier providers win overlapping regions.
    pub fn with_embedder(mut self, provider: impl EmbeddingProvider + 'static) -> Self {
        self.embedders.push(Arc::new(provider));
        self
    }

    pub(crate) fn set_parser(&mut self, factory: Arc<dyn ParserFactory>) {
        self.parser = Some(factory);
    }

    pub(crate) fn push_embedder(&mut self, provider: Arc<dyn EmbeddingProvider>) {
        self.embedders.push(provider);
    }

    pub fn parser_factory(&self) -> Option<&Arc<dyn ParserFactory>> {
        self.parser.as_ref()
    }

    pub fn embedders(&self) -> &[Arc<dyn EmbeddingProvider>] {
        &self.embedders
    }

    pub fn has_parser(&self) -> bool {
        self.parser.is_some()
    }
}

impl fmt::Debug for LanguagePlugin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LanguagePlugin")
            .field("parser", &self.parser.is_some())
            .field(
                "embedders",
                &self.embedders.iter().map(|e| e.name()).collect::<Vec<_>>(),
            )
            .finish()
    }
}
