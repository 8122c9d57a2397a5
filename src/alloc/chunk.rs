use std::fmt;

use hashbrown::HashMap;
use serde::{Deserialize, Serialize};

use crate::{serialize::serde_hex, Addr};

/// Which family of allocation function produced a chunk. Freeing with a
/// function from a different family is a mismatch.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum AllocKind {
    /// `malloc()`, `calloc()`, `memalign()`, `realloc()`
    Malloc = 0,
    /// `operator new`
    New = 1,
    /// `operator new[]`
    NewVec = 2,
    /// A chunk carved out of a custom memory pool
    PoolCustom = 3,
}

impl AllocKind {
    pub const fn name(self) -> &'static str {
        match self {
            AllocKind::Malloc => "malloc",
            AllocKind::New => "operator new",
            AllocKind::NewVec => "operator new[]",
            AllocKind::PoolCustom => "pool allocation",
        }
    }
}

impl fmt::Display for AllocKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Opaque token naming where an allocation happened. The instrumentation
/// layer decides what it means (a stack hash, an instruction address...), we
/// only compare and group by it.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CallSite(pub u64);

impl CallSite {
    pub const UNKNOWN: CallSite = CallSite(0);
}

/// A tracked heap block.
///
/// ```plaintext
///   backing                base                  base + size
///      |                     |                        |
///      v                     v                        v
///      +---------+-----------+------------------------+-----------+
///      | padding | redzone   | payload                | redzone   |
///      +---------+-----------+------------------------+-----------+
/// ```
///
/// `backing` is only present when we asked the client heap for the memory
/// ourselves; pool chunks and client-supplied blocks have none. `redzone` is
/// the width of each guard band, so the whole footprint is
/// `[base - redzone, base + size + redzone)`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    #[serde(with = "serde_hex")]
    pub base: Addr,
    pub size: usize,
    pub kind: AllocKind,
    pub callsite: CallSite,
    #[serde(default)]
    pub redzone: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backing: Option<Addr>,
}

impl Chunk {
    /// One past the last payload byte.
    pub fn end(&self) -> Addr {
        self.base.saturating_add(self.size)
    }

    /// `[base - redzone, base + size + redzone)`, clipped to the address
    /// space.
    pub fn footprint(&self) -> (Addr, Addr) {
        (
            self.base.saturating_sub(self.redzone),
            self.end().saturating_add(self.redzone),
        )
    }

    /// `true` if `addr` lies within the payload. A zero-sized chunk contains
    /// exactly its base, so that a pointer to it still counts as a pointer
    /// *to* it.
    pub fn contains(&self, addr: Addr) -> bool {
        if self.size == 0 {
            addr == self.base
        } else {
            (self.base..self.end()).contains(&addr)
        }
    }
}

/// Address-keyed table of chunks. The global registry and every pool own one
/// each, and a chunk lives in exactly one of them.
#[derive(Clone, Debug, Default)]
pub struct ChunkTable {
    chunks: HashMap<Addr, Chunk, ahash::RandomState>,
}

impl ChunkTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert `chunk`, returning whatever was previously keyed at its base.
    pub fn insert(&mut self, chunk: Chunk) -> Option<Chunk> {
        self.chunks.insert(chunk.base, chunk)
    }

    pub fn remove(&mut self, base: Addr) -> Option<Chunk> {
        self.chunks.remove(&base)
    }

    pub fn get(&self, base: Addr) -> Option<&Chunk> {
        self.chunks.get(&base)
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Chunk> {
        self.chunks.values()
    }

    /// Sum of payload sizes.
    pub fn total_bytes(&self) -> usize {
        self.iter().map(|chunk| chunk.size).sum()
    }

    /// All chunks ordered by base address.
    pub fn sorted(&self) -> Vec<&Chunk> {
        let mut chunks: Vec<&Chunk> = self.iter().collect();
        chunks.sort_unstable_by_key(|chunk| chunk.base);
        chunks
    }

    /// The chunk whose payload contains `addr`. This is a linear scan, it is
    /// only used when describing addresses for error reports.
    pub fn find_containing(&self, addr: Addr) -> Option<&Chunk> {
        self.iter().find(|chunk| chunk.contains(addr))
    }

    /// Remove and return every chunk.
    pub fn drain(&mut self) -> impl Iterator<Item = Chunk> + '_ {
        self.chunks.drain().map(|(_, chunk)| chunk)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(base: Addr, size: usize) -> Chunk {
        Chunk {
            base,
            size,
            kind: AllocKind::Malloc,
            callsite: CallSite::UNKNOWN,
            redzone: 0,
            backing: None,
        }
    }

    #[test]
    fn zero_sized_chunk_contains_only_its_base() {
        let c = chunk(0x100, 0);
        assert!(c.contains(0x100));
        assert!(!c.contains(0x101));
        assert!(!c.contains(0xff));
    }

    #[test]
    fn table_sorts_by_base() {
        let mut table = ChunkTable::new();
        table.insert(chunk(0x300, 8));
        table.insert(chunk(0x100, 8));
        table.insert(chunk(0x200, 8));
        let bases: Vec<Addr> = table.sorted().iter().map(|c| c.base).collect();
        assert_eq!(bases, [0x100, 0x200, 0x300]);
        assert_eq!(table.total_bytes(), 24);
        assert_eq!(table.find_containing(0x207).map(|c| c.base), Some(0x200));
    }

    #[test]
    fn chunk_serializes_base_as_hex() {
        let json = serde_json::to_string(&chunk(0x1000, 4)).unwrap();
        assert!(json.contains("\"base\":\"0x1000\""), "{json}");
        let back: Chunk = serde_json::from_str(&json).unwrap();
        assert_eq!(back, chunk(0x1000, 4));
    }
}
