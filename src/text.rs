//! Text utilities shared by snapshots and embeddings.
//!
//! - Offset mapping between embedded snapshots and the root document
//! - Merged edit reconstruction for modification events
//! - Content hashing for embedding keys

pub mod edits;
mod hash;
pub mod offset_map;

pub use edits::{SourceModificationEvent, TextEdit};
pub use hash::{Fnv1a, fnv1a_hash};
pub use offset_map::{OffsetMap, OffsetMapBuilder};
