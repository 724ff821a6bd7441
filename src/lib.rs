pub mod cache;
pub mod config;
pub mod embedding;
pub mod error;
pub mod iterator;
pub mod language;
pub mod manager;
pub mod scheduler;
pub mod serializer;
pub mod source;
pub mod task;
pub mod text;

pub use cache::{ParserResult, SourceCache};
pub use config::{CacheSettings, InjectionPattern, LanguageSettings, load_settings};
pub use embedding::{Embedding, EmbeddingBuilder, EmbeddingKey, Section};
pub use error::{ParseError, ParseResult};
pub use iterator::ResultIterator;
pub use language::{
    DiscoveryMode, EmbeddingProvider, LanguageId, LanguagePlugin, LanguageRegistry, Parser,
    ParserFactory, ParserOutput,
};
pub use manager::ParserManager;
pub use scheduler::{Priority, ResultTaskFn};
pub use serializer::{Cancelled, ParseContext, SerializerGuard, TaskSerializer};
pub use source::{Snapshot, Source};
pub use task::{CancelReason, Task};
pub use text::{SourceModificationEvent, TextEdit};
