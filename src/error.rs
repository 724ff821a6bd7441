//! Error handling types for nestcache
//!
//! This module provides the error types returned by the cache tree, the
//! task serializer and the language plugin boundary.

use std::sync::PoisonError;
use thiserror::Error;

use crate::task::CancelReason;

/// Boxed error produced by parser and embedding plugins.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Comprehensive error type for cache and parse operations
#[derive(Debug, Error)]
pub enum ParseError {
    /// The parser plugin failed while computing a result
    #[error("Parser for language '{language}' failed: {source}")]
    ParseFailure {
        language: String,
        #[source]
        source: BoxError,
    },

    /// The parse was cancelled cooperatively or its snapshot went stale
    #[error("Parse cancelled: {reason}")]
    Cancelled { reason: CancelReason },

    /// A result was computed against a superseded generation.
    ///
    /// Only used to drive retries inside the cache; callers receive
    /// `Cancelled` once the retry budget is exhausted.
    #[error("Result for language '{language}' is stale (generation {generation})")]
    StaleResult { language: String, generation: u64 },

    /// No parser factory is registered for the language
    #[error("Parser not found for language: {language}")]
    ParserNotFound { language: String },

    /// A parser asked for its own node's result while parsing it
    #[error("Recursive parse requested for language: {language}")]
    RecursiveParse { language: String },

    /// An embedding region does not fit its host snapshot
    #[error("Invalid embedding for language '{language}': {start}..{end} in text of length {len}")]
    InvalidEmbedding {
        language: String,
        start: usize,
        end: usize,
        len: usize,
    },

    /// Source not found in store
    #[error("Source not found: {uri}")]
    SourceNotFound { uri: String },

    /// Configuration error
    #[error("Invalid configuration: {message}")]
    Config { message: String },

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type for parse operations
pub type ParseResult<T> = Result<T, ParseError>;

/// Helper trait to convert PoisonError into a recovered guard
pub trait LockResultExt<T> {
    /// Recover the inner value of a poisoned lock, logging the context.
    ///
    /// The context parameter identifies which operation triggered lock recovery,
    /// helping developers debug thread safety issues.
    fn recover_poison(self, context: &str) -> T;
}

impl<T> LockResultExt<T> for Result<T, PoisonError<T>> {
    fn recover_poison(self, context: &str) -> T {
        match self {
            Ok(guard) => guard,
            Err(poisoned) => {
                log::warn!(
                    target: "nestcache::lock_recovery",
                    "Recovered from poisoned lock in {}",
                    context
                );
                poisoned.into_inner()
            }
        }
    }
}

/// Helper functions for common error patterns
impl ParseError {
    /// Create a parse failure from a plugin error
    pub fn parse_failure(language: impl Into<String>, source: BoxError) -> Self {
        ParseError::ParseFailure {
            language: language.into(),
            source,
        }
    }

    /// Create a cancellation error
    pub fn cancelled(reason: CancelReason) -> Self {
        ParseError::Cancelled { reason }
    }

    /// Create a parser not found error
    pub fn parser_not_found(language: impl Into<String>) -> Self {
        ParseError::ParserNotFound {
            language: language.into(),
        }
    }

    /// Create a source not found error
    pub fn source_not_found(uri: impl Into<String>) -> Self {
        ParseError::SourceNotFound { uri: uri.into() }
    }

    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        ParseError::Config {
            message: message.into(),
        }
    }

    /// Create an internal error
    pub fn internal(message: impl Into<String>) -> Self {
        ParseError::Internal(message.into())
    }

    /// True for errors that a later retry may resolve on its own.
    pub fn is_cancellation(&self) -> bool {
        matches!(
            self,
            ParseError::Cancelled { .. } | ParseError::StaleResult { .. }
        )
    }
}
