//! The cache tree: one [`SourceCache`] per snapshot, children per embedding.

mod result;
mod source_cache;
mod versioned;

pub use result::ParserResult;
pub use source_cache::SourceCache;
