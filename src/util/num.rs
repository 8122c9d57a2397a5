use crate::Addr;

/// Round up `n` to the nearest multiple of `to`. `None` on overflow.
pub fn round_up(n: usize, to: usize) -> Option<usize> {
    debug_assert!(to != 0);
    Some(n.checked_add(to - 1)? / to * to)
}

/// Reinterpret a size as signed and check that it is not negative. The
/// monitored program can hand us anything, and a "size" with the top bit set
/// is almost certainly a negative number that got cast.
pub fn is_silly_size(n: usize) -> bool {
    (n as isize) < 0
}

/// `[addr, addr + len)`, or `None` if the range would wrap the address space.
pub fn range_end(addr: Addr, len: usize) -> Option<Addr> {
    addr.checked_add(len)
}

/// The intersection of `[a_lo, a_hi)` and `[b_lo, b_hi)`, if it is non-empty.
pub fn intersect(a_lo: Addr, a_hi: Addr, b_lo: Addr, b_hi: Addr) -> Option<(Addr, Addr)> {
    let lo = a_lo.max(b_lo);
    let hi = a_hi.min(b_hi);
    (lo < hi).then_some((lo, hi))
}
