//! Heap bookkeeping: the chunk tables, the quarantine and the custom pools,
//! plus the allocators we can draw backing memory from.

pub mod chunk;
pub mod dlmalloc;
pub mod heap;
pub mod pool;
pub mod quarantine;
pub mod registry;

pub use chunk::{AllocKind, CallSite, Chunk, ChunkTable};
