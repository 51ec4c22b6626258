//! Vector index client and bootstrap seeding.

pub mod index;
pub mod seed;

pub use index::{ChunkPayload, IndexPoint, MemoryIndex, ScoredPoint, VectorIndex};
