//! The [`Engine`]: every piece of state the hooks share, and the hooks the
//! instrumentation layer calls.
//!
//! Allocation and pool hooks live next to their tables in
//! [`crate::alloc::registry`] and [`crate::alloc::pool`]; this module has the
//! shadow-memory primitives, the syscall hook and the leak check.

use serde::{Deserialize, Serialize};

use crate::{
    alloc::{
        heap::ClientHeap,
        pool::PoolTable,
        quarantine::Quarantine,
        registry::{AllocRequest, MallocCounters},
        AllocKind, CallSite, Chunk, ChunkTable,
    },
    config::{Config, LeakCheckMode},
    error::{EngineError, ErrorLog},
    graph::leak::{self, LeakReport},
    serialize::serde_hex,
    shadow::{ShadowMap, ShadowState},
    taint::{fd::ThreadId, Syscall, TaintPolicy},
    Addr,
};

/// What we know about an address, for error reports.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum AddrDescription {
    /// Inside a live heap block.
    Live { chunk: Chunk, offset: usize },
    /// In the guard band before (`offset < 0`) or after a live block.
    Redzone { chunk: Chunk, offset: isize },
    /// Inside a block that has been freed but is still quarantined.
    Freed { chunk: Chunk, offset: usize },
    /// Inside a chunk of a custom pool.
    PoolChunk {
        #[serde(with = "serde_hex")]
        pool: Addr,
        chunk: Chunk,
        offset: usize,
    },
    Unknown,
}

pub struct Engine<H> {
    pub(crate) config: Config,
    pub(crate) shadow: ShadowMap,
    pub(crate) heap: H,
    pub(crate) chunks: ChunkTable,
    pub(crate) quarantine: Quarantine,
    pub(crate) pools: PoolTable,
    pub(crate) taint: TaintPolicy,
    pub(crate) errors: ErrorLog,
    pub(crate) counters: MallocCounters,
}

impl<H> Engine<H>
where
    H: ClientHeap,
{
    pub fn new(mut config: Config, heap: H) -> Self {
        if !config.alignment.is_power_of_two() {
            let fixed = config.alignment.max(1).next_power_of_two();
            log::warn!("alignment {} is not a power of two, using {fixed}", config.alignment);
            config.alignment = fixed;
        }
        Self {
            shadow: ShadowMap::new(),
            heap,
            chunks: ChunkTable::new(),
            quarantine: Quarantine::new(config.freelist_vol),
            pools: PoolTable::default(),
            taint: TaintPolicy::new(&config),
            errors: ErrorLog::default(),
            counters: MallocCounters::default(),
            config,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn shadow(&self) -> &ShadowMap {
        &self.shadow
    }

    pub fn heap(&self) -> &H {
        &self.heap
    }

    /// The client heap, for simulating the program's own loads and stores.
    pub fn heap_mut(&mut self) -> &mut H {
        &mut self.heap
    }

    /// Live `malloc()`-family blocks.
    pub fn chunks(&self) -> &ChunkTable {
        &self.chunks
    }

    pub fn quarantine(&self) -> &Quarantine {
        &self.quarantine
    }

    pub fn taint(&self) -> &TaintPolicy {
        &self.taint
    }

    /// Every error reported so far.
    pub fn errors(&self) -> &[EngineError] {
        self.errors.errors()
    }

    /// Every error ever reported, including those [`Engine::errors`] no
    /// longer holds.
    pub fn error_count(&self) -> u64 {
        self.errors.total()
    }

    pub fn take_errors(&mut self) -> Vec<EngineError> {
        self.errors.take()
    }

    // allocation hooks

    /// A fresh block from the client heap, guarded by the configured
    /// redzone.
    pub fn on_alloc(
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

    pub fn on_calloc(&mut self, nmemb: usize, size: usize, site: CallSite) -> Option<Addr> {
        self.calloc(nmemb, size, site)
    }

    pub fn on_free(&mut self, addr: Addr, kind: AllocKind) -> Result<(), EngineError> {
        self.release(addr, kind, self.config.malloc_redzone)
    }

    pub fn on_realloc(
        &mut self,
        addr: Addr,
        new_size: usize,
        site: CallSite,
    ) -> Result<Addr, EngineError> {
        self.resize(addr, new_size, site)
    }

    // pool hooks

    pub fn on_pool_create(&mut self, pool: Addr, redzone: usize, zero: bool) -> Result<(), EngineError> {
        self.create_pool(pool, redzone, zero)
    }

    pub fn on_pool_destroy(&mut self, pool: Addr) -> Result<(), EngineError> {
        self.destroy_pool(pool)
    }

    pub fn on_pool_alloc(
        &mut self,
        pool: Addr,
        addr: Addr,
        size: usize,
        site: CallSite,
    ) -> Result<(), EngineError> {
        self.pool_alloc(pool, addr, size, site)
    }

    pub fn on_pool_free(&mut self, pool: Addr, addr: Addr) -> Result<(), EngineError> {
        self.pool_free(pool, addr)
    }

    pub fn on_pool_trim(&mut self, pool: Addr, addr: Addr, size: usize) -> Result<(), EngineError> {
        self.pool_trim(pool, addr, size)
    }

    pub fn on_pool_move(&mut self, old: Addr, new: Addr) -> Result<(), EngineError> {
        self.move_pool(old, new)
    }

    pub fn on_pool_change(
        &mut self,
        pool: Addr,
        old_addr: Addr,
        new_addr: Addr,
        new_size: usize,
    ) -> Result<(), EngineError> {
        self.change_chunk(pool, old_addr, new_addr, new_size)
    }

    // memory-access hooks

    pub fn mark_defined(&mut self, addr: Addr, len: usize) {
        self.shadow.set_range(addr, len, ShadowState::Untainted);
    }

    pub fn mark_undefined(&mut self, addr: Addr, len: usize) {
        self.shadow.set_range(addr, len, ShadowState::Tainted);
    }

    pub fn mark_no_access(&mut self, addr: Addr, len: usize) {
        self.shadow.set_range(addr, len, ShadowState::NoAccess);
    }

    pub fn shadow_state(&self, addr: Addr) -> ShadowState {
        self.shadow.get(addr)
    }

    /// The first byte of `[addr, addr + len)` the program may not touch.
    /// `None` means the access is fine.
    pub fn check_no_access(&self, addr: Addr, len: usize) -> Option<Addr> {
        self.shadow.find_no_access(addr, len)
    }

    /// The first byte of `[addr, addr + len)` that *is* accessible. `None`
    /// means the whole range is no-access, which is what a redzone should
    /// look like.
    pub fn is_range_no_access(&self, addr: Addr, len: usize) -> Option<Addr> {
        self.shadow.find_accessible(addr, len)
    }

    /// `true` if any byte of the range is tainted.
    pub fn is_tainted(&self, addr: Addr, len: usize) -> bool {
        self.shadow
            .find(addr, len, |state| state == ShadowState::Tainted)
            .is_some()
    }

    // syscall hook

    /// A syscall made by thread `tid` returned `result`.
    pub fn on_syscall_return(&mut self, tid: ThreadId, syscall: &Syscall<'_>, result: isize) {
        self.taint
            .on_syscall_return(&mut self.shadow, tid, syscall, result);
    }

    // leak check

    /// Classify every live block by how it can be reached from `roots`
    /// (register values, stack and globals, as collected by the caller).
    /// `None` when leak checking is off.
    pub fn check_leaks(&self, roots: &[usize]) -> Option<LeakReport> {
        if self.config.leak_check == LeakCheckMode::Off {
            return None;
        }
        let report = leak::check(
            self.leak_candidates(),
            roots,
            &self.shadow,
            &self.heap,
            self.config.leak_check,
        );
        if self.config.verbosity > 0 {
            report.log();
        }
        Some(report)
    }

    /// Registry blocks plus pool chunks. A registry block that holds pool
    /// chunks is a pool's superblock: its chunks stand in for it, otherwise
    /// everything inside would be counted twice.
    fn leak_candidates(&self) -> Vec<&Chunk> {
        let mut pool_chunks: Vec<&Chunk> =
            self.pools.iter().flat_map(|pool| pool.chunks.iter()).collect();
        pool_chunks.sort_unstable_by_key(|chunk| chunk.base);
        let mut candidates: Vec<&Chunk> = self
            .chunks
            .iter()
            .filter(|block| {
                let first = pool_chunks.partition_point(|chunk| chunk.base < block.base);
                !pool_chunks
                    .get(first)
                    .is_some_and(|chunk| chunk.base < block.end() && chunk.end() <= block.end())
            })
            .collect();
        candidates.extend(pool_chunks);
        candidates
    }

    /// Where `addr` lives, as far as we can tell.
    pub fn describe_addr(&self, addr: Addr) -> AddrDescription {
        if let Some(chunk) = self.chunks.find_containing(addr) {
            return AddrDescription::Live {
                chunk: chunk.clone(),
                offset: addr - chunk.base,
            };
        }
        for pool in self.pools.iter() {
            if let Some(chunk) = pool.chunks.find_containing(addr) {
                return AddrDescription::PoolChunk {
                    pool: pool.id,
                    chunk: chunk.clone(),
                    offset: addr - chunk.base,
                };
            }
        }
        if let Some(chunk) = self.quarantine.find_containing(addr) {
            return AddrDescription::Freed {
                chunk: chunk.clone(),
                offset: addr - chunk.base,
            };
        }
        let in_redzone = |chunk: &&Chunk| {
            let (lo, hi) = chunk.footprint();
            (lo..hi).contains(&addr)
        };
        if let Some(chunk) = self.chunks.iter().find(in_redzone) {
            let offset = if addr < chunk.base {
                -((chunk.base - addr) as isize)
            } else {
                (addr - chunk.end()) as isize
            };
            return AddrDescription::Redzone {
                chunk: chunk.clone(),
                offset,
            };
        }
        AddrDescription::Unknown
    }
}
