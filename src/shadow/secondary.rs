//! Backing tables for regions of mixed state.
//!
//! A secondary covers exactly one [`REGION_SIZE`] region with two bits per
//! byte, so a fully materialised region costs 16KiB. We keep a running count
//! of each state so the owner can tell, without rescanning, when a region has
//! become uniform again and can fall back to a singleton.

use super::{ShadowState, REGION_SIZE};

const BITS_PER_STATE: usize = 2;
const STATES_PER_WORD: usize = u64::BITS as usize / BITS_PER_STATE;
const WORDS: usize = REGION_SIZE / STATES_PER_WORD;
/// `0b0101...01` -- the low bit of every 2-bit lane.
const LOW_LANES: u64 = 0x5555_5555_5555_5555;

fn lane_pattern(state: ShadowState) -> u64 {
    LOW_LANES * state as u64
}

/// How many lanes of `word` hold each state, indexed by `ShadowState as usize`.
fn lane_counts(word: u64) -> [u32; 3] {
    let lo = word & LOW_LANES;
    let hi = (word >> 1) & LOW_LANES;
    [
        (!(lo | hi) & LOW_LANES).count_ones(),
        (lo & !hi).count_ones(),
        (hi & !lo).count_ones(),
    ]
}

/// Handle to a [`Secondary`] inside a [`SecondaryArena`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct SecondaryId(u32);

pub(crate) struct Secondary {
    words: Box<[u64; WORDS]>,
    counts: [u32; 3],
}

impl Secondary {
    fn filled(state: ShadowState) -> Self {
        let mut counts = [0; 3];
        counts[state as usize] = REGION_SIZE as u32;
        Self {
            words: Box::new([lane_pattern(state); WORDS]),
            counts,
        }
    }

    fn refill(&mut self, state: ShadowState) {
        self.words.fill(lane_pattern(state));
        self.counts = [0; 3];
        self.counts[state as usize] = REGION_SIZE as u32;
    }

    #[inline]
    pub(crate) fn get(&self, offset: usize) -> ShadowState {
        let word = self.words[offset / STATES_PER_WORD];
        let shift = (offset % STATES_PER_WORD) * BITS_PER_STATE;
        ShadowState::from_bits((word >> shift) & 0b11)
    }

    fn set(&mut self, offset: usize, state: ShadowState) {
        let old = self.get(offset);
        if old == state {
            return;
        }
        let word = &mut self.words[offset / STATES_PER_WORD];
        let shift = (offset % STATES_PER_WORD) * BITS_PER_STATE;
        *word = (*word & !(0b11 << shift)) | ((state as u64) << shift);
        self.counts[old as usize] -= 1;
        self.counts[state as usize] += 1;
    }

    /// Set every byte in `[lo, hi)` (offsets into the region) to `state`.
    pub(crate) fn set_range(&mut self, lo: usize, hi: usize, state: ShadowState) {
        debug_assert!(lo <= hi && hi <= REGION_SIZE);
        let mut offset = lo;
        while offset < hi && offset % STATES_PER_WORD != 0 {
            self.set(offset, state);
            offset += 1;
        }
        let pattern = lane_pattern(state);
        while offset + STATES_PER_WORD <= hi {
            let word = &mut self.words[offset / STATES_PER_WORD];
            let old = lane_counts(*word);
            for (count, removed) in self.counts.iter_mut().zip(old) {
                *count -= removed;
            }
            self.counts[state as usize] += STATES_PER_WORD as u32;
            *word = pattern;
            offset += STATES_PER_WORD;
        }
        while offset < hi {
            self.set(offset, state);
            offset += 1;
        }
    }

    /// The first offset in `[lo, hi)` whose state is marked in `wanted`
    /// (indexed by `ShadowState as usize`). Whole words holding none of the
    /// wanted states are skipped without looking at their lanes.
    pub(crate) fn find_in(&self, lo: usize, hi: usize, wanted: [bool; 3]) -> Option<usize> {
        debug_assert!(lo <= hi && hi <= REGION_SIZE);
        let mut offset = lo;
        while offset < hi {
            if offset % STATES_PER_WORD == 0 && offset + STATES_PER_WORD <= hi {
                let counts = lane_counts(self.words[offset / STATES_PER_WORD]);
                if !counts.iter().zip(wanted).any(|(&n, want)| want && n > 0) {
                    offset += STATES_PER_WORD;
                    continue;
                }
            }
            if wanted[self.get(offset) as usize] {
                return Some(offset);
            }
            offset += 1;
        }
        None
    }

    /// How many bytes of `[lo, hi)` are in `state`.
    pub(crate) fn count_in(&self, lo: usize, hi: usize, state: ShadowState) -> usize {
        debug_assert!(lo <= hi && hi <= REGION_SIZE);
        let mut count = 0;
        let mut offset = lo;
        while offset < hi {
            if offset % STATES_PER_WORD == 0 && offset + STATES_PER_WORD <= hi {
                count += lane_counts(self.words[offset / STATES_PER_WORD])[state as usize] as usize;
                offset += STATES_PER_WORD;
            } else {
                count += usize::from(self.get(offset) == state);
                offset += 1;
            }
        }
        count
    }

    /// `Some(state)` if every byte in the region has the same state.
    pub(crate) fn uniform(&self) -> Option<ShadowState> {
        ShadowState::ALL
            .into_iter()
            .find(|&state| self.counts[state as usize] == REGION_SIZE as u32)
    }

    /// How many bytes in the region are in `state`.
    pub(crate) fn count(&self, state: ShadowState) -> usize {
        self.counts[state as usize] as usize
    }
}

/// Slab of secondaries. Released slots are kept and recycled so a workload
/// that keeps splitting and merging the same regions does not keep hitting
/// the allocator.
#[derive(Default)]
pub(crate) struct SecondaryArena {
    slots: Vec<Secondary>,
    free: Vec<SecondaryId>,
}

impl SecondaryArena {
    /// Materialise a secondary with every byte set to `state`.
    pub(crate) fn alloc(&mut self, state: ShadowState) -> SecondaryId {
        match self.free.pop() {
            Some(id) => {
                self.slots[id.0 as usize].refill(state);
                id
            }
            None => {
                let id = SecondaryId(self.slots.len() as u32);
                self.slots.push(Secondary::filled(state));
                id
            }
        }
    }

    pub(crate) fn release(&mut self, id: SecondaryId) {
        debug_assert!(!self.free.contains(&id), "secondary released twice");
        self.free.push(id);
    }

    #[inline]
    pub(crate) fn get(&self, id: SecondaryId) -> &Secondary {
        &self.slots[id.0 as usize]
    }

    #[inline]
    pub(crate) fn get_mut(&mut self, id: SecondaryId) -> &mut Secondary {
        &mut self.slots[id.0 as usize]
    }

    /// Number of secondaries currently handed out.
    pub(crate) fn live(&self) -> usize {
        self.slots.len() - self.free.len()
    }
}
