//! The global table of live heap blocks: `malloc()`, `operator new` and
//! friends.
//!
//! Every block we hand out is laid out as
//!
//! ```plaintext
//! backing    base - redzone   base              base + size
//!    |             |            |                    |
//!    [  padding    [  redzone   [  payload           [  redzone  ]
//! ```
//!
//! with `base - backing` rounded up to the requested alignment. The redzones
//! are real memory we own, so nothing else can be placed there while the
//! block is alive.

use serde::{Deserialize, Serialize};

use super::{
    chunk::{AllocKind, CallSite, Chunk},
    heap::ClientHeap,
};
use crate::{
    engine::Engine,
    error::EngineError,
    shadow::ShadowState,
    util::num::{is_silly_size, round_up},
    Addr,
};

/// Everything `register()` needs to know.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AllocRequest {
    /// Track a block the program already owns instead of allocating one.
    pub addr: Option<Addr>,
    pub size: usize,
    pub align: usize,
    pub redzone: usize,
    /// The payload starts out zeroed.
    pub zero: bool,
    pub kind: AllocKind,
    pub site: CallSite,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub(crate) struct MallocCounters {
    pub(crate) n_mallocs: u64,
    pub(crate) n_frees: u64,
    pub(crate) bytes_allocated: u64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MallocStats {
    pub bytes_in_use: usize,
    pub blocks_in_use: usize,
    pub n_mallocs: u64,
    pub n_frees: u64,
    pub bytes_allocated: u64,
}

impl<H> Engine<H>
where
    H: ClientHeap,
{
    /// Start tracking a heap block, allocating it first unless the request
    /// names an address. Returns the payload address, or `None` if the
    /// arguments are silly or the heap is exhausted.
    pub fn register(&mut self, req: AllocRequest) -> Option<Addr> {
        if is_silly_size(req.size) {
            self.errors.record(EngineError::SillyArgs {
                func: req.kind.name().to_owned(),
                size: req.size,
            });
            return None;
        }
        let align = req.align.max(1).checked_next_power_of_two()?;
        let (base, backing) = match req.addr {
            Some(addr) => (addr, None),
            None => {
                let Some((backing, base)) = self.obtain(req.size, align, req.redzone) else {
                    log::debug!("client heap exhausted allocating {} bytes", req.size);
                    return None;
                };
                if req.zero {
                    self.heap.fill(base, req.size, 0);
                }
                (base, Some(backing))
            }
        };
        self.paint_chunk(base, req.size, req.redzone);
        let chunk = Chunk {
            base,
            size: req.size,
            kind: req.kind,
            callsite: req.site,
            redzone: req.redzone,
            backing,
        };
        if let Some(stale) = self.chunks.insert(chunk) {
            log::debug!("{:#x} registered twice, forgetting the older block", stale.base);
            self.free_backing(&stale);
        }
        self.counters.n_mallocs += 1;
        self.counters.bytes_allocated += req.size as u64;
        Some(base)
    }

    /// Stop tracking the block at `addr`.
    ///
    /// An unknown address is reported and otherwise ignored. Freeing with the
    /// wrong kind of deallocator is reported but the block is freed anyway.
    pub fn release(
        &mut self,
        addr: Addr,
        expected: AllocKind,
        redzone: usize,
    ) -> Result<(), EngineError> {
        let Some(chunk) = self.chunks.remove(addr) else {
            return Err(self.report_bad_free(addr));
        };
        if chunk.kind != expected {
            self.errors.record(EngineError::FreeMismatch {
                addr,
                allocated: chunk.kind,
                freed: expected,
            });
        }
        self.counters.n_frees += 1;
        self.retire(chunk, redzone);
        Ok(())
    }

    /// `realloc()`. Shrinking happens in place; growing always moves the
    /// block, and the old one goes through quarantine like any other free.
    pub fn resize(
        &mut self,
        addr: Addr,
        new_size: usize,
        site: CallSite,
    ) -> Result<Addr, EngineError> {
        if is_silly_size(new_size) {
            return Err(self.errors.record(EngineError::SillyArgs {
                func: "realloc".to_owned(),
                size: new_size,
            }));
        }
        let Some(mut old) = self.chunks.remove(addr) else {
            return Err(self.report_bad_free(addr));
        };
        if old.kind != AllocKind::Malloc {
            self.errors.record(EngineError::FreeMismatch {
                addr,
                allocated: old.kind,
                freed: AllocKind::Malloc,
            });
        }

        // The dropped tail stays no-access, even after a later free: release
        // only clears the footprint of the size the chunk has at that point.
        if new_size <= old.size {
            self.shadow
                .set_range(old.base + new_size, old.size - new_size, ShadowState::NoAccess);
            old.size = new_size;
            self.chunks.insert(old);
            return Ok(addr);
        }

        let redzone = old.redzone;
        let Some((backing, base)) = self.obtain(new_size, self.config.alignment, redzone) else {
            self.chunks.insert(old);
            return Err(EngineError::OutOfMemory { size: new_size });
        };
        self.paint_chunk(base, new_size, redzone);
        self.shadow.copy_range(old.base, base, old.size);
        self.heap.copy(old.base, base, old.size);

        self.counters.n_frees += 1;
        self.counters.n_mallocs += 1;
        self.counters.bytes_allocated += new_size as u64;
        self.retire(old, redzone);
        self.chunks.insert(Chunk {
            base,
            size: new_size,
            kind: AllocKind::Malloc,
            callsite: site,
            redzone,
            backing: Some(backing),
        });
        Ok(base)
    }

    /// `(backing, base)` for a fresh block with room for both redzones.
    fn obtain(&mut self, size: usize, align: usize, redzone: usize) -> Option<(Addr, Addr)> {
        let lead = round_up(redzone, align)?;
        let total = lead.checked_add(size)?.checked_add(redzone)?;
        let backing = self.heap.allocate(total, align)?;
        Some((backing, backing + lead))
    }

    /// Redzones no-access, payload defined.
    pub(crate) fn paint_chunk(&mut self, base: Addr, size: usize, redzone: usize) {
        let lo = base.saturating_sub(redzone);
        self.shadow.set_range(lo, base - lo, ShadowState::NoAccess);
        self.shadow.set_range(base, size, ShadowState::Untainted);
        self.shadow
            .set_range(base.saturating_add(size), redzone, ShadowState::NoAccess);
    }

    /// Shadow bookkeeping for a chunk that has just left its table. Pool
    /// chunks are gone for good; everything else is quarantined.
    pub(crate) fn retire(&mut self, mut chunk: Chunk, redzone: usize) {
        chunk.redzone = redzone;
        let (lo, hi) = chunk.footprint();
        self.shadow.set_range(lo, hi - lo, ShadowState::NoAccess);
        if chunk.kind == AllocKind::PoolCustom {
            self.shadow.set_range(lo, hi - lo, ShadowState::Untainted);
            self.free_backing(&chunk);
            return;
        }
        if !self.config.poison_freed {
            self.shadow.set_range(lo, hi - lo, ShadowState::Untainted);
        }
        for evicted in self.quarantine.enqueue(chunk) {
            if self.config.poison_freed {
                let (lo, hi) = evicted.footprint();
                self.shadow.set_range(lo, hi - lo, ShadowState::Untainted);
            }
            self.free_backing(&evicted);
        }
    }

    fn free_backing(&mut self, chunk: &Chunk) {
        if let Some(backing) = chunk.backing {
            self.heap.deallocate(backing);
        }
    }

    fn report_bad_free(&mut self, addr: Addr) -> EngineError {
        let err = if self.quarantine.contains(addr) {
            EngineError::DoubleFree { addr }
        } else {
            EngineError::InvalidFree { addr }
        };
        self.errors.record(err)
    }

    // The malloc family. Sizes, alignment and redzones come from the config.

    fn alloc_with(
        &mut self,
        kind: AllocKind,
        size: usize,
        align: usize,
        zero: bool,
        site: CallSite,
    ) -> Option<Addr> {
        self.register(AllocRequest {
            addr: None,
            size,
            align,
            redzone: self.config.malloc_redzone,
            zero,
            kind,
            site,
        })
    }

    pub fn malloc(&mut self, size: usize, site: CallSite) -> Option<Addr> {
        self.alloc_with(AllocKind::Malloc, size, self.config.alignment, false, site)
    }

    pub fn builtin_new(&mut self, size: usize, site: CallSite) -> Option<Addr> {
        self.alloc_with(AllocKind::New, size, self.config.alignment, false, site)
    }

    pub fn builtin_vec_new(&mut self, size: usize, site: CallSite) -> Option<Addr> {
        self.alloc_with(AllocKind::NewVec, size, self.config.alignment, false, site)
    }

    /// Alignments below the configured minimum are raised to it, and
    /// anything that is not a power of two is rounded up to one.
    pub fn memalign(&mut self, align: usize, size: usize, site: CallSite) -> Option<Addr> {
        let align = align.max(self.config.alignment);
        self.alloc_with(AllocKind::Malloc, size, align, false, site)
    }

    pub fn calloc(&mut self, nmemb: usize, size: usize, site: CallSite) -> Option<Addr> {
        if let Some(silly) = [nmemb, size].into_iter().find(|&n| is_silly_size(n)) {
            self.errors.record(EngineError::SillyArgs {
                func: "calloc".to_owned(),
                size: silly,
            });
            return None;
        }
        let Some(total) = nmemb.checked_mul(size) else {
            self.errors.record(EngineError::SizeOverflow {
                func: "calloc".to_owned(),
                nmemb,
                size,
            });
            return None;
        };
        self.alloc_with(AllocKind::Malloc, total, self.config.alignment, true, site)
    }

    /// `free(NULL)` is fine.
    pub fn free(&mut self, addr: Addr) -> Result<(), EngineError> {
        if addr == 0 {
            return Ok(());
        }
        self.release(addr, AllocKind::Malloc, self.config.malloc_redzone)
    }

    pub fn builtin_delete(&mut self, addr: Addr) -> Result<(), EngineError> {
        if addr == 0 {
            return Ok(());
        }
        self.release(addr, AllocKind::New, self.config.malloc_redzone)
    }

    pub fn builtin_vec_delete(&mut self, addr: Addr) -> Result<(), EngineError> {
        if addr == 0 {
            return Ok(());
        }
        self.release(addr, AllocKind::NewVec, self.config.malloc_redzone)
    }

    /// C `realloc()`: a null `addr` allocates, a zero `size` frees and
    /// returns null.
    pub fn realloc(&mut self, addr: Addr, size: usize, site: CallSite) -> Option<Addr> {
        if addr == 0 {
            return self.malloc(size, site);
        }
        if size == 0 {
            _ = self.free(addr);
            return None;
        }
        self.resize(addr, size, site).ok()
    }

    pub fn malloc_stats(&self) -> MallocStats {
        MallocStats {
            bytes_in_use: self.chunks.total_bytes(),
            blocks_in_use: self.chunks.len(),
            n_mallocs: self.counters.n_mallocs,
            n_frees: self.counters.n_frees,
            bytes_allocated: self.counters.bytes_allocated,
        }
    }

    pub fn log_malloc_stats(&self) {
        if self.config.verbosity == 0 {
            return;
        }
        let stats = self.malloc_stats();
        log::info!(
            "malloc/free: in use at exit: {} bytes in {} blocks",
            stats.bytes_in_use,
            stats.blocks_in_use
        );
        log::info!(
            "malloc/free: {} allocs, {} frees, {} bytes allocated",
            stats.n_mallocs,
            stats.n_frees,
            stats.bytes_allocated
        );
    }
}
