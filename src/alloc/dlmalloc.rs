use std::{collections::BTreeMap, ptr};

use dlmalloc::Dlmalloc;

use super::heap::{ClientHeap, WORD};
use crate::Addr;

// https://gee.cs.oswego.edu/dl/html/malloc.html

pub const DLMALLOC_MIN_ALIGN: usize = 8;

#[derive(Clone, Copy)]
struct Block {
    size: usize,
    align: usize,
}

/// A [`ClientHeap`] backed by real memory from a private `dlmalloc` instance.
///
/// The heap keeps a ledger of every block it handed out, and every raw access
/// is checked against it first, so nothing the monitored program passes in
/// can make us touch memory we do not own.
pub struct DlmallocHeap {
    dlmalloc: Dlmalloc,
    live: BTreeMap<Addr, Block>,
}

// SAFETY: `Dlmalloc` owns its arena outright and nothing in here is shared;
// every access goes through `&mut self` (or `&self` for reads of blocks that
// cannot be freed while the borrow lasts).
unsafe impl Send for DlmallocHeap {}

impl DlmallocHeap {
    pub const fn new() -> Self {
        Self {
            dlmalloc: Dlmalloc::new(),
            live: BTreeMap::new(),
        }
    }

    /// `true` if `[addr, addr + len)` lies inside one block we handed out.
    fn owns(&self, addr: Addr, len: usize) -> bool {
        let Some((&start, block)) = self.live.range(..=addr).next_back() else {
            return false;
        };
        match addr.checked_add(len) {
            Some(end) => end <= start + block.size,
            None => false,
        }
    }
}

impl Default for DlmallocHeap {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for DlmallocHeap {
    fn drop(&mut self) {
        for (addr, block) in std::mem::take(&mut self.live) {
            // SAFETY: every ledger entry came from `self.dlmalloc.malloc()`
            // with exactly this size and alignment, and is freed once.
            unsafe { self.dlmalloc.free(addr as *mut u8, block.size, block.align) };
        }
    }
}

impl ClientHeap for DlmallocHeap {
    fn allocate(&mut self, size: usize, align: usize) -> Option<Addr> {
        let block = Block {
            size: size.max(1),
            align: align.max(DLMALLOC_MIN_ALIGN),
        };
        // SAFETY: size is non-zero and align is a power of two (the registry
        // only ever passes powers of two, and `max` preserves that).
        let data = unsafe { self.dlmalloc.malloc(block.size, block.align) };
        if data.is_null() {
            return None;
        }
        self.live.insert(data as Addr, block);
        Some(data as Addr)
    }

    fn deallocate(&mut self, addr: Addr) {
        if let Some(block) = self.live.remove(&addr) {
            // SAFETY: `addr` was returned by `malloc()` with this layout and
            // has just been removed from the ledger, so it is freed only once.
            unsafe { self.dlmalloc.free(addr as *mut u8, block.size, block.align) };
        }
    }

    fn fill(&mut self, addr: Addr, len: usize, byte: u8) -> bool {
        if !self.owns(addr, len) {
            return false;
        }
        // SAFETY: the range lies within a live block we allocated.
        unsafe { ptr::write_bytes(addr as *mut u8, byte, len) };
        true
    }

    fn copy(&mut self, src: Addr, dst: Addr, len: usize) -> bool {
        if !self.owns(src, len) || !self.owns(dst, len) {
            return false;
        }
        // SAFETY: both ranges lie within live blocks; `ptr::copy` tolerates
        // overlap.
        unsafe { ptr::copy(src as *const u8, dst as *mut u8, len) };
        true
    }

    fn read_word(&self, addr: Addr) -> Option<usize> {
        if !self.owns(addr, WORD) {
            return None;
        }
        // SAFETY: in bounds of a live block; the read may be unaligned.
        Some(unsafe { ptr::read_unaligned(addr as *const usize) })
    }
}
