//! Custom memory pools.
//!
//! Programs with their own allocators carve chunks out of arenas we never
//! see being allocated. The program tells us (through client requests) when
//! a pool comes and goes and when it hands out or takes back a chunk, and we
//! track those chunks exactly like heap blocks, except that we never own
//! their memory and never quarantine them.

use hashbrown::HashMap;

use super::{
    chunk::{AllocKind, CallSite, Chunk, ChunkTable},
    heap::ClientHeap,
};
use crate::{
    engine::Engine,
    error::EngineError,
    shadow::ShadowState,
    util::num::{intersect, is_silly_size},
    Addr,
};

/// Pool sanity checks between two statistics lines.
const STATS_INTERVAL: u64 = 10_000;

#[derive(Clone, Debug)]
pub struct Pool {
    /// Whatever address the program uses to name the pool.
    pub id: Addr,
    pub redzone: usize,
    /// Chunks come back zeroed.
    pub zero: bool,
    pub chunks: ChunkTable,
    /// An overlap has been reported and the pool has not been sane since.
    pub(crate) reported_insane: bool,
}

#[derive(Debug, Default)]
pub struct PoolTable {
    pools: HashMap<Addr, Pool, ahash::RandomState>,
    checks: u64,
}

impl PoolTable {
    pub fn get(&self, id: Addr) -> Option<&Pool> {
        self.pools.get(&id)
    }

    pub fn contains(&self, id: Addr) -> bool {
        self.pools.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.pools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pools.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Pool> {
        self.pools.values()
    }

    /// Chunks across every pool.
    pub fn total_chunks(&self) -> usize {
        self.iter().map(|pool| pool.chunks.len()).sum()
    }
}

/// `Some((first, second))` for the first pair of chunks that overlap, in
/// address order.
fn first_overlap<'a>(sorted: &[&'a Chunk]) -> Option<(&'a Chunk, &'a Chunk)> {
    sorted
        .windows(2)
        .find(|pair| pair[0].end() > pair[1].base)
        .map(|pair| (pair[0], pair[1]))
}

impl<H> Engine<H>
where
    H: ClientHeap,
{
    pub fn pools(&self) -> &PoolTable {
        &self.pools
    }

    pub fn pool_exists(&self, id: Addr) -> bool {
        self.pools.contains(id)
    }

    fn trace_pool(&self, what: &str, id: Addr, args: std::fmt::Arguments<'_>) {
        if self.config.verbosity > 2 {
            log::debug!("{what}({id:#x}, {args})");
        }
    }

    fn illegal_pool(&mut self, pool: Addr) -> EngineError {
        self.errors.record(EngineError::IllegalPool { pool })
    }

    pub fn create_pool(&mut self, id: Addr, redzone: usize, zero: bool) -> Result<(), EngineError> {
        self.trace_pool("create_mempool", id, format_args!("rz={redzone}, zero={zero}"));
        if self.pools.contains(id) {
            return Err(self.errors.record(EngineError::DuplicatePool { pool: id }));
        }
        self.pools.pools.insert(
            id,
            Pool {
                id,
                redzone,
                zero,
                chunks: ChunkTable::new(),
                reported_insane: false,
            },
        );
        Ok(())
    }

    /// Forget the pool. All of its chunks, redzones included, become
    /// no-access: the program is about to recycle the arena.
    pub fn destroy_pool(&mut self, id: Addr) -> Result<(), EngineError> {
        self.trace_pool("destroy_mempool", id, format_args!(""));
        let Some(mut pool) = self.pools.pools.remove(&id) else {
            return Err(self.illegal_pool(id));
        };
        for chunk in pool.chunks.drain() {
            let (lo, hi) = chunk.footprint();
            self.shadow.set_range(lo, hi - lo, ShadowState::NoAccess);
        }
        Ok(())
    }

    /// Start tracking `[addr, addr + size)` as a chunk of the pool. The
    /// memory belongs to the pool's arena, so it is never written; with the
    /// pool's zero flag set it is simply known to be zero.
    pub fn pool_alloc(
        &mut self,
        id: Addr,
        addr: Addr,
        size: usize,
        site: CallSite,
    ) -> Result<(), EngineError> {
        self.trace_pool("mempool_alloc", id, format_args!("{addr:#x}, {size}"));
        if is_silly_size(size) {
            return Err(self.errors.record(EngineError::SillyArgs {
                func: "mempool_alloc".to_owned(),
                size,
            }));
        }
        let Some(pool) = self.pools.pools.get_mut(&id) else {
            return Err(self.illegal_pool(id));
        };
        let redzone = pool.redzone;
        let displaced = pool.chunks.insert(Chunk {
            base: addr,
            size,
            kind: AllocKind::PoolCustom,
            callsite: site,
            redzone,
            backing: None,
        });
        if displaced.is_some() {
            log::debug!("mempool {id:#x}: chunk {addr:#x} allocated again without a free");
        }
        self.paint_chunk(addr, size, redzone);
        self.check_pool(id);
        Ok(())
    }

    /// Give a chunk back to its pool. Freed immediately, never quarantined.
    pub fn pool_free(&mut self, id: Addr, addr: Addr) -> Result<(), EngineError> {
        self.trace_pool("mempool_free", id, format_args!("{addr:#x}"));
        let Some(pool) = self.pools.pools.get_mut(&id) else {
            return Err(self.illegal_pool(id));
        };
        let redzone = pool.redzone;
        let Some(chunk) = pool.chunks.remove(addr) else {
            return Err(self.errors.record(EngineError::InvalidFree { addr }));
        };
        self.retire(chunk, redzone);
        self.check_pool(id);
        Ok(())
    }

    /// Keep only what lies inside `[addr, addr + size)`: chunks outside are
    /// freed, chunks straddling an edge shrink to the overlap and lose their
    /// margins to no-access.
    pub fn pool_trim(&mut self, id: Addr, addr: Addr, size: usize) -> Result<(), EngineError> {
        self.trace_pool("mempool_trim", id, format_args!("{addr:#x}, {size}"));
        let Some(pool) = self.pools.pools.get_mut(&id) else {
            return Err(self.illegal_pool(id));
        };
        let redzone = pool.redzone;
        let end = addr.saturating_add(size);
        let bases: Vec<Addr> = pool.chunks.iter().map(|chunk| chunk.base).collect();

        let mut freed = Vec::new();
        let mut margins = Vec::new();
        for base in bases {
            let Some(chunk) = pool.chunks.get(base) else {
                continue;
            };
            let kept = if chunk.size == 0 {
                (addr..end).contains(&chunk.base).then_some((chunk.base, chunk.base))
            } else {
                intersect(chunk.base, chunk.end(), addr, end)
            };
            match kept {
                None => freed.extend(pool.chunks.remove(base)),
                Some((lo, hi)) if lo == chunk.base && hi == chunk.end() => {}
                Some((lo, hi)) => {
                    let Some(mut chunk) = pool.chunks.remove(base) else {
                        continue;
                    };
                    margins.push((chunk.base, lo));
                    margins.push((hi, chunk.end()));
                    chunk.base = lo;
                    chunk.size = hi - lo;
                    pool.chunks.insert(chunk);
                }
            }
        }

        for chunk in freed {
            self.retire(chunk, redzone);
        }
        for (lo, hi) in margins {
            self.shadow.set_range(lo, hi - lo, ShadowState::NoAccess);
        }
        self.check_pool(id);
        Ok(())
    }

    /// The program now calls pool `old` by the name `new`.
    pub fn move_pool(&mut self, old: Addr, new: Addr) -> Result<(), EngineError> {
        self.trace_pool("mempool_move", old, format_args!("{new:#x}"));
        if !self.pools.contains(old) {
            return Err(self.illegal_pool(old));
        }
        if old == new {
            return Ok(());
        }
        if self.pools.contains(new) {
            return Err(self.errors.record(EngineError::DuplicatePool { pool: new }));
        }
        if let Some(mut pool) = self.pools.pools.remove(&old) {
            pool.id = new;
            self.pools.pools.insert(new, pool);
        }
        self.check_pool(new);
        Ok(())
    }

    /// The pool's allocator moved (or resized) a chunk behind our back.
    /// Only the bookkeeping changes; the program is responsible for the
    /// contents.
    pub fn change_chunk(
        &mut self,
        id: Addr,
        old_addr: Addr,
        new_addr: Addr,
        new_size: usize,
    ) -> Result<(), EngineError> {
        self.trace_pool(
            "mempool_change",
            id,
            format_args!("{old_addr:#x}, {new_addr:#x}, {new_size}"),
        );
        if is_silly_size(new_size) {
            return Err(self.errors.record(EngineError::SillyArgs {
                func: "mempool_change".to_owned(),
                size: new_size,
            }));
        }
        let Some(pool) = self.pools.pools.get_mut(&id) else {
            return Err(self.illegal_pool(id));
        };
        let Some(mut chunk) = pool.chunks.remove(old_addr) else {
            return Err(self.errors.record(EngineError::InvalidFree { addr: old_addr }));
        };
        chunk.base = new_addr;
        chunk.size = new_size;
        pool.chunks.insert(chunk);
        self.check_pool(id);
        Ok(())
    }

    /// Complain (without failing the operation) if the pool's chunks overlap.
    /// Only done when asked for: it sorts the whole pool every time.
    fn check_pool(&mut self, id: Addr) {
        if !self.config.paranoid_pools && self.config.verbosity < 2 {
            return;
        }
        self.pools.checks += 1;
        if self.config.verbosity > 1 && self.pools.checks % STATS_INTERVAL == 0 {
            log::info!(
                "sanity check: {} live pools, {} chunks",
                self.pools.len(),
                self.pools.total_chunks()
            );
        }
        let Some(pool) = self.pools.pools.get_mut(&id) else {
            return;
        };
        let sorted = pool.chunks.sorted();
        let Some((a, b)) = first_overlap(&sorted) else {
            pool.reported_insane = false;
            return;
        };
        log::error!(
            "mempool {id:#x}: chunk {:#x}+{} overlaps {:#x}+{}",
            a.base,
            a.size,
            b.base,
            b.size
        );
        // The full dump goes out once per breakage, not once per operation
        // on a pool that stays broken.
        if pool.reported_insane {
            return;
        }
        let chunks = sorted.into_iter().cloned().collect();
        pool.reported_insane = true;
        self.errors.record(EngineError::PoolInsane { pool: id, chunks });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{alloc::heap::ArenaHeap, config::Config};

    const POOL: Addr = 0xbeef;
    const ARENA: Addr = 0x40_0000;

    fn engine_with_pool(redzone: usize) -> Engine<ArenaHeap> {
        let mut engine = Engine::new(Config::default(), ArenaHeap::default());
        engine.create_pool(POOL, redzone, false).unwrap();
        engine
    }

    fn bases(engine: &Engine<ArenaHeap>) -> Vec<(Addr, usize)> {
        engine
            .pools()
            .get(POOL)
            .unwrap()
            .chunks
            .sorted()
            .iter()
            .map(|c| (c.base, c.size))
            .collect()
    }

    #[test]
    fn duplicate_and_unknown_pools_are_illegal() {
        let mut engine = engine_with_pool(0);
        assert_eq!(
            engine.create_pool(POOL, 0, false),
            Err(EngineError::DuplicatePool { pool: POOL })
        );
        assert_eq!(
            engine.pool_alloc(1, ARENA, 8, CallSite::UNKNOWN),
            Err(EngineError::IllegalPool { pool: 1 })
        );
        assert_eq!(engine.destroy_pool(1), Err(EngineError::IllegalPool { pool: 1 }));
        assert_eq!(engine.errors().len(), 3);
        assert!(engine.pool_exists(POOL));
    }

    #[test]
    fn pool_alloc_paints_redzones_and_free_is_immediate() {
        let mut engine = engine_with_pool(8);
        engine.pool_alloc(POOL, ARENA, 32, CallSite::UNKNOWN).unwrap();
        assert_eq!(engine.is_range_no_access(ARENA - 8, 8), None);
        assert_eq!(engine.is_range_no_access(ARENA + 32, 8), None);
        assert_eq!(engine.check_no_access(ARENA, 32), None);

        engine.pool_free(POOL, ARENA).unwrap();
        assert!(engine.shadow().all(ARENA - 8, 48, ShadowState::Untainted));
        assert!(engine.quarantine().is_empty());
        assert_eq!(
            engine.pool_free(POOL, ARENA),
            Err(EngineError::InvalidFree { addr: ARENA })
        );
    }

    #[test]
    fn destroy_makes_every_chunk_no_access() {
        let mut engine = engine_with_pool(4);
        engine.pool_alloc(POOL, ARENA, 16, CallSite::UNKNOWN).unwrap();
        engine.pool_alloc(POOL, ARENA + 64, 16, CallSite::UNKNOWN).unwrap();
        engine.destroy_pool(POOL).unwrap();
        assert_eq!(engine.is_range_no_access(ARENA - 4, 24), None);
        assert_eq!(engine.is_range_no_access(ARENA + 60, 24), None);
        assert!(!engine.pool_exists(POOL));
    }

    #[test]
    fn trim_to_exact_chunk_is_a_no_op() {
        let mut engine = engine_with_pool(0);
        engine.pool_alloc(POOL, ARENA, 64, CallSite::UNKNOWN).unwrap();
        engine.pool_trim(POOL, ARENA, 64).unwrap();
        engine.pool_trim(POOL, ARENA, 64).unwrap();
        assert_eq!(bases(&engine), [(ARENA, 64)]);
        assert_eq!(engine.check_no_access(ARENA, 64), None);
    }

    #[test]
    fn trim_to_disjoint_range_empties_pool() {
        let mut engine = engine_with_pool(0);
        engine.pool_alloc(POOL, ARENA, 64, CallSite::UNKNOWN).unwrap();
        engine.pool_alloc(POOL, ARENA + 128, 64, CallSite::UNKNOWN).unwrap();
        engine.pool_trim(POOL, ARENA + 0x1000, 64).unwrap();
        assert!(bases(&engine).is_empty());
    }

    #[test]
    fn trim_splits_straddling_chunks() {
        let mut engine = engine_with_pool(0);
        engine.pool_alloc(POOL, ARENA, 64, CallSite::UNKNOWN).unwrap();
        engine.pool_alloc(POOL, ARENA + 64, 64, CallSite::UNKNOWN).unwrap();
        engine.pool_alloc(POOL, ARENA + 128, 64, CallSite::UNKNOWN).unwrap();
        engine.pool_alloc(POOL, ARENA + 512, 64, CallSite::UNKNOWN).unwrap();
        // Cuts the first chunk at 32 and the third at 160.
        engine.pool_trim(POOL, ARENA + 32, 128).unwrap();
        assert_eq!(
            bases(&engine),
            [(ARENA + 32, 32), (ARENA + 64, 64), (ARENA + 128, 32)]
        );
        assert_eq!(engine.is_range_no_access(ARENA, 32), None);
        assert_eq!(engine.is_range_no_access(ARENA + 160, 32), None);
        assert_eq!(engine.check_no_access(ARENA + 32, 128), None);
    }

    #[test]
    fn chunk_enclosing_trim_extent_keeps_the_extent() {
        let mut engine = engine_with_pool(0);
        engine.pool_alloc(POOL, ARENA, 256, CallSite::UNKNOWN).unwrap();
        engine.pool_trim(POOL, ARENA + 16, 32).unwrap();
        assert_eq!(bases(&engine), [(ARENA + 16, 32)]);
        assert_eq!(engine.is_range_no_access(ARENA, 16), None);
        assert_eq!(engine.is_range_no_access(ARENA + 48, 208), None);
    }

    #[test]
    fn move_rebinds_chunks() {
        let mut engine = engine_with_pool(0);
        engine.pool_alloc(POOL, ARENA, 8, CallSite::UNKNOWN).unwrap();
        engine.create_pool(0x1234, 0, false).unwrap();
        assert_eq!(
            engine.move_pool(POOL, 0x1234),
            Err(EngineError::DuplicatePool { pool: 0x1234 })
        );
        engine.destroy_pool(0x1234).unwrap();
        engine.move_pool(POOL, 0x1234).unwrap();
        assert!(!engine.pool_exists(POOL));
        let moved = engine.pools().get(0x1234).unwrap();
        assert_eq!(moved.id, 0x1234);
        assert!(moved.chunks.get(ARENA).is_some());
        assert_eq!(
            engine.move_pool(POOL, 0x9999),
            Err(EngineError::IllegalPool { pool: POOL })
        );
    }

    #[test]
    fn change_rekeys_without_touching_shadow() {
        let mut engine = engine_with_pool(0);
        engine.pool_alloc(POOL, ARENA, 8, CallSite::UNKNOWN).unwrap();
        engine.mark_undefined(ARENA, 8);
        engine.change_chunk(POOL, ARENA, ARENA + 256, 24).unwrap();
        assert_eq!(bases(&engine), [(ARENA + 256, 24)]);
        assert!(engine.shadow().all(ARENA, 8, ShadowState::Tainted));
        assert_eq!(
            engine.change_chunk(POOL, ARENA, ARENA, 8),
            Err(EngineError::InvalidFree { addr: ARENA })
        );
    }

    #[test]
    fn overlapping_chunks_are_reported_in_paranoid_mode() {
        let config = Config {
            paranoid_pools: true,
            ..Config::default()
        };
        let mut engine = Engine::new(config, ArenaHeap::default());
        engine.create_pool(POOL, 0, false).unwrap();
        engine.pool_alloc(POOL, ARENA, 64, CallSite::UNKNOWN).unwrap();
        assert!(engine.errors().is_empty());
        // Still succeeds: the pool is broken, not us.
        engine.pool_alloc(POOL, ARENA + 32, 64, CallSite::UNKNOWN).unwrap();
        match engine.errors() {
            [EngineError::PoolInsane { pool, chunks }] => {
                assert_eq!(*pool, POOL);
                assert_eq!(chunks.len(), 2);
            }
            other => panic!("unexpected errors: {other:?}"),
        }
    }

    #[test]
    fn a_pool_that_stays_broken_is_reported_once() {
        let config = Config {
            paranoid_pools: true,
            ..Config::default()
        };
        let mut engine = Engine::new(config, ArenaHeap::default());
        engine.create_pool(POOL, 0, false).unwrap();
        for i in 0..200 {
            engine.pool_alloc(POOL, ARENA + i, 16, CallSite::UNKNOWN).unwrap();
        }
        assert_eq!(engine.errors().len(), 1);
        assert_eq!(engine.error_count(), 1);

        for i in 1..200 {
            engine.pool_free(POOL, ARENA + i).unwrap();
        }
        assert_eq!(engine.errors().len(), 1);
        // Sane again, so the next overlap is a new breakage.
        engine.pool_alloc(POOL, ARENA + 4, 8, CallSite::UNKNOWN).unwrap();
        assert_eq!(engine.errors().len(), 2);
        assert!(matches!(
            &engine.errors()[1],
            EngineError::PoolInsane { chunks, .. } if chunks.len() == 2
        ));
    }
}
