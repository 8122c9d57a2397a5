//! The allocator underneath the registry.
//!
//! The engine never owns the monitored program's memory. When it has to hand
//! out a fresh block (`malloc()` and friends) it asks a [`ClientHeap`], and the
//! only way a freed block ever becomes reusable is by being handed back to the
//! same heap when it leaves quarantine.

use std::collections::BTreeMap;

use crate::{util::num::round_up, Addr};

pub const WORD: usize = std::mem::size_of::<usize>();

/// Backing memory for the monitored program's heap.
///
/// Every method is safe: implementations keep their own ledger of the blocks
/// they handed out and refuse (returning `false`/`None`) to touch anything
/// else. The engine relies on that when it scans memory for the leak check.
pub trait ClientHeap {
    /// Allocate at least `size` bytes aligned to `align` (a power of two).
    fn allocate(&mut self, size: usize, align: usize) -> Option<Addr>;

    /// Give back a block returned by `allocate()`. Unknown addresses are
    /// ignored.
    fn deallocate(&mut self, addr: Addr);

    /// Set `len` bytes at `addr` to `byte`.
    fn fill(&mut self, addr: Addr, len: usize, byte: u8) -> bool;

    /// `memmove()` within live blocks.
    fn copy(&mut self, src: Addr, dst: Addr, len: usize) -> bool;

    /// Read a native-endian pointer-sized value.
    fn read_word(&self, addr: Addr) -> Option<usize>;
}

/// A simulated address space: one contiguous arena mapped at a fixed
/// synthetic base, carved up first-fit. Nothing here is a real pointer, which
/// makes it the heap of choice for tests and for replaying recorded traces.
pub struct ArenaHeap {
    base: Addr,
    mem: Vec<u8>,
    /// start -> len, coalesced
    free: BTreeMap<Addr, usize>,
    /// start -> len of every live block
    live: BTreeMap<Addr, usize>,
}

impl ArenaHeap {
    pub const DEFAULT_BASE: Addr = 0x1000_0000;
    pub const DEFAULT_CAPACITY: usize = 16 << 20;

    /// An arena of (at least) `capacity` bytes, rounded up to whole host
    /// pages, starting at `base`.
    pub fn new(base: Addr, capacity: usize) -> Self {
        let page = page_size::get();
        let capacity = round_up(capacity.max(1), page).unwrap_or(capacity);
        Self {
            base,
            mem: vec![0; capacity],
            free: BTreeMap::from([(base, capacity)]),
            live: BTreeMap::new(),
        }
    }

    pub fn base(&self) -> Addr {
        self.base
    }

    pub fn capacity(&self) -> usize {
        self.mem.len()
    }

    /// Bytes currently handed out.
    pub fn in_use(&self) -> usize {
        self.live.values().sum()
    }

    /// Offset into `mem` of `[addr, addr + len)`, if the whole range is
    /// inside one live block.
    fn offset_of(&self, addr: Addr, len: usize) -> Option<usize> {
        let (&start, &block_len) = self.live.range(..=addr).next_back()?;
        let end = addr.checked_add(len)?;
        (end <= start + block_len).then(|| addr - self.base)
    }

    /// Simulate the program writing `bytes` at `addr`.
    pub fn write(&mut self, addr: Addr, bytes: &[u8]) -> bool {
        match self.offset_of(addr, bytes.len()) {
            Some(offset) => {
                self.mem[offset..offset + bytes.len()].copy_from_slice(bytes);
                true
            }
            None => false,
        }
    }

    /// Simulate the program storing a pointer at `addr`.
    pub fn store_word(&mut self, addr: Addr, value: usize) -> bool {
        self.write(addr, &value.to_ne_bytes())
    }

    pub fn read(&self, addr: Addr, len: usize) -> Option<&[u8]> {
        let offset = self.offset_of(addr, len)?;
        Some(&self.mem[offset..offset + len])
    }

    fn release_range(&mut self, mut start: Addr, mut len: usize) {
        if let Some((&prev, &prev_len)) = self.free.range(..start).next_back() {
            if prev + prev_len == start {
                self.free.remove(&prev);
                start = prev;
                len += prev_len;
            }
        }
        if let Some(&next_len) = self.free.get(&(start + len)) {
            self.free.remove(&(start + len));
            len += next_len;
        }
        self.free.insert(start, len);
    }
}

impl Default for ArenaHeap {
    fn default() -> Self {
        Self::new(Self::DEFAULT_BASE, Self::DEFAULT_CAPACITY)
    }
}

impl ClientHeap for ArenaHeap {
    fn allocate(&mut self, size: usize, align: usize) -> Option<Addr> {
        debug_assert!(align.is_power_of_two());
        // Zero-byte requests still get a distinct address.
        let size = size.max(1);
        let (free_start, free_len, addr) = self.free.iter().find_map(|(&start, &len)| {
            let addr = round_up(start, align)?;
            let end = addr.checked_add(size)?;
            (end <= start + len).then_some((start, len, addr))
        })?;
        self.free.remove(&free_start);
        if addr > free_start {
            self.free.insert(free_start, addr - free_start);
        }
        let tail = free_start + free_len - (addr + size);
        if tail > 0 {
            self.free.insert(addr + size, tail);
        }
        self.live.insert(addr, size);
        Some(addr)
    }

    fn deallocate(&mut self, addr: Addr) {
        if let Some(len) = self.live.remove(&addr) {
            self.release_range(addr, len);
        }
    }

    fn fill(&mut self, addr: Addr, len: usize, byte: u8) -> bool {
        match self.offset_of(addr, len) {
            Some(offset) => {
                self.mem[offset..offset + len].fill(byte);
                true
            }
            None => false,
        }
    }

    fn copy(&mut self, src: Addr, dst: Addr, len: usize) -> bool {
        match (self.offset_of(src, len), self.offset_of(dst, len)) {
            (Some(src), Some(dst)) => {
                self.mem.copy_within(src..src + len, dst);
                true
            }
            _ => false,
        }
    }

    fn read_word(&self, addr: Addr) -> Option<usize> {
        let bytes = self.read(addr, WORD)?;
        Some(usize::from_ne_bytes(bytes.try_into().ok()?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocations_are_aligned_and_disjoint() {
        let mut heap = ArenaHeap::default();
        let a = heap.allocate(10, 8).unwrap();
        let b = heap.allocate(100, 64).unwrap();
        assert_eq!(a % 8, 0);
        assert_eq!(b % 64, 0);
        assert!(b >= a + 10);
        assert_eq!(heap.in_use(), 110);
    }

    #[test]
    fn freed_space_is_coalesced_and_reused() {
        let mut heap = ArenaHeap::default();
        let a = heap.allocate(64, 16).unwrap();
        let b = heap.allocate(64, 16).unwrap();
        heap.deallocate(a);
        heap.deallocate(b);
        assert_eq!(heap.free.len(), 1);
        assert_eq!(heap.allocate(128, 16), Some(a));
    }

    #[test]
    fn accesses_outside_live_blocks_are_refused() {
        let mut heap = ArenaHeap::default();
        let a = heap.allocate(16, 8).unwrap();
        assert!(heap.store_word(a + 8, 0xdead_beef));
        assert_eq!(heap.read_word(a + 8), Some(0xdead_beef));
        assert!(!heap.store_word(a + 12, 1));
        assert_eq!(heap.read_word(a + 16), None);
        heap.deallocate(a);
        assert_eq!(heap.read_word(a), None);
        assert!(!heap.fill(a, 1, 0));
    }

    #[test]
    fn exhausted_arena_returns_none() {
        let mut heap = ArenaHeap::new(0x1000, 1);
        let capacity = heap.capacity();
        assert!(heap.allocate(capacity + 1, 8).is_none());
        assert!(heap.allocate(capacity, 1).is_some());
        assert!(heap.allocate(1, 1).is_none());
    }
}
