//! The shadow state store: one [`ShadowState`] for every byte of the target's
//! address space.
//!
//! Flat shadow memory for a 64-bit address space is obviously out of the
//! question, so this is a two-level sparse map:
//!
//! ```plaintext
//! addr = [ region index (high bits) | offset (low 16 bits) ]
//!              |
//!              v
//!   primary: region index -> Region::Uniform(state)   (no backing at all)
//!                          | Region::Mixed(id) -----> arena[id]: 2 bits/byte
//! ```
//!
//! A region with no primary entry is uniformly [`ShadowState::Untainted`], so
//! a program that taints nothing costs us nothing. Uniform regions are the
//! shared immutable singletons; a partial write into one materialises a
//! secondary (copy-on-write), and a secondary that becomes uniform again is
//! handed back to the arena.

mod secondary;

use hashbrown::HashMap;
use serde::{Deserialize, Serialize};

use crate::{util::cold, Addr};

use self::secondary::{SecondaryArena, SecondaryId};

pub const REGION_BITS: u32 = 16;
pub const REGION_SIZE: usize = 1 << REGION_BITS;
const REGION_MASK: usize = REGION_SIZE - 1;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum ShadowState {
    /// Defined, not derived from a monitored source.
    Untainted = 0,
    /// Derived from a monitored source and not yet validated.
    Tainted = 1,
    /// Not addressable: redzones, released pool memory.
    NoAccess = 2,
}

impl ShadowState {
    pub const ALL: [ShadowState; 3] = [
        ShadowState::Untainted,
        ShadowState::Tainted,
        ShadowState::NoAccess,
    ];

    #[inline]
    fn from_bits(bits: u64) -> Self {
        match bits {
            0 => ShadowState::Untainted,
            1 => ShadowState::Tainted,
            2 => ShadowState::NoAccess,
            _ => unreachable!("corrupted shadow lane {bits:#b}"),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Region {
    Uniform(ShadowState),
    Mixed(SecondaryId),
}

/// Split `[addr, addr + len)` into per-region pieces of
/// `(region index, lo offset, hi offset)`. Ranges that would run off the end
/// of the address space are clipped.
fn region_spans(addr: Addr, len: usize) -> impl Iterator<Item = (usize, usize, usize)> {
    let end = addr.saturating_add(len);
    let mut cursor = addr;
    std::iter::from_fn(move || {
        if cursor >= end {
            return None;
        }
        let index = cursor >> REGION_BITS;
        let lo = cursor & REGION_MASK;
        let hi = (end - (cursor - lo)).min(REGION_SIZE);
        cursor += hi - lo;
        Some((index, lo, hi))
    })
}

#[inline]
fn region_base(index: usize) -> Addr {
    index << REGION_BITS
}

#[derive(Default)]
pub struct ShadowMap {
    primary: HashMap<usize, Region, ahash::RandomState>,
    arena: SecondaryArena,
}

impl ShadowMap {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    fn region(&self, index: usize) -> Region {
        self.primary
            .get(&index)
            .copied()
            .unwrap_or(Region::Uniform(ShadowState::Untainted))
    }

    fn put_region(&mut self, index: usize, region: Region) {
        match self.primary.insert(index, region) {
            Some(Region::Mixed(old)) if region != Region::Mixed(old) => self.arena.release(old),
            _ => {}
        }
        if region == Region::Uniform(ShadowState::Untainted) {
            self.primary.remove(&index);
        }
    }

    /// The state of a single byte.
    #[inline]
    pub fn get(&self, addr: Addr) -> ShadowState {
        match self.region(addr >> REGION_BITS) {
            Region::Uniform(state) => state,
            Region::Mixed(id) => self.arena.get(id).get(addr & REGION_MASK),
        }
    }

    /// Set every byte of `[addr, addr + len)` to `state`.
    pub fn set_range(&mut self, addr: Addr, len: usize, state: ShadowState) {
        for (index, lo, hi) in region_spans(addr, len) {
            if lo == 0 && hi == REGION_SIZE {
                self.put_region(index, Region::Uniform(state));
                continue;
            }
            let id = match self.region(index) {
                Region::Uniform(current) if current == state => continue,
                Region::Uniform(current) => cold(|| {
                    let id = self.arena.alloc(current);
                    self.primary.insert(index, Region::Mixed(id));
                    id
                }),
                Region::Mixed(id) => id,
            };
            let secondary = self.arena.get_mut(id);
            secondary.set_range(lo, hi, state);
            if let Some(uniform) = secondary.uniform() {
                self.put_region(index, Region::Uniform(uniform));
            }
        }
    }

    /// The first address in `[addr, addr + len)` whose state satisfies `pred`.
    /// Uniform regions are decided with a single test, mixed ones a word of
    /// lanes at a time.
    pub fn find<P>(&self, addr: Addr, len: usize, pred: P) -> Option<Addr>
    where
        P: Fn(ShadowState) -> bool,
    {
        let wanted = ShadowState::ALL.map(&pred);
        for (index, lo, hi) in region_spans(addr, len) {
            match self.region(index) {
                Region::Uniform(state) => {
                    if pred(state) {
                        return Some(region_base(index) + lo);
                    }
                }
                Region::Mixed(id) => {
                    if let Some(offset) = self.arena.get(id).find_in(lo, hi, wanted) {
                        return Some(region_base(index) + offset);
                    }
                }
            }
        }
        None
    }

    /// The first byte in the range that is [`ShadowState::NoAccess`], if any.
    /// `None` means the whole range may be accessed.
    pub fn find_no_access(&self, addr: Addr, len: usize) -> Option<Addr> {
        self.find(addr, len, |state| state == ShadowState::NoAccess)
    }

    /// The first byte in the range that is *not* [`ShadowState::NoAccess`].
    /// `None` means the whole range is off limits.
    pub fn find_accessible(&self, addr: Addr, len: usize) -> Option<Addr> {
        self.find(addr, len, |state| state != ShadowState::NoAccess)
    }

    /// `true` if every byte in the range is in `state`.
    pub fn all(&self, addr: Addr, len: usize, state: ShadowState) -> bool {
        self.find(addr, len, |s| s != state).is_none()
    }

    /// How many bytes of the range are in `state`.
    pub fn count(&self, addr: Addr, len: usize, state: ShadowState) -> usize {
        region_spans(addr, len)
            .map(|(index, lo, hi)| match self.region(index) {
                Region::Uniform(s) if s == state => hi - lo,
                Region::Uniform(_) => 0,
                Region::Mixed(id) => {
                    let secondary = self.arena.get(id);
                    if lo == 0 && hi == REGION_SIZE {
                        secondary.count(state)
                    } else {
                        secondary.count_in(lo, hi, state)
                    }
                }
            })
            .sum()
    }

    /// Copy the state of `[src, src + len)` onto `[dst, dst + len)`. The
    /// ranges may overlap.
    pub fn copy_range(&mut self, src: Addr, dst: Addr, len: usize) {
        if src == dst || len == 0 {
            return;
        }
        // Runs of equal state are written with one `set_range` each, which
        // keeps whole-block copies of uniform memory cheap.
        let mut runs: Vec<(usize, usize, ShadowState)> = Vec::new();
        for i in 0..len {
            let state = self.get(src.wrapping_add(i));
            match runs.last_mut() {
                Some((_, run_len, run_state)) if *run_state == state => *run_len += 1,
                _ => runs.push((i, 1, state)),
            }
        }
        for (offset, run_len, state) in runs {
            self.set_range(dst.wrapping_add(offset), run_len, state);
        }
    }

    /// Number of regions currently backed by a secondary table.
    pub fn mixed_regions(&self) -> usize {
        self.arena.live()
    }
}
