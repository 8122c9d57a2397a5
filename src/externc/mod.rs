//! C entry points for instrumentation written outside Rust.
//!
//! There is one process-wide engine backed by [`DlmallocHeap`], configured
//! from `TAINTHEAP_*` environment variables on first use. Pointers cross the
//! boundary as plain addresses; null stands for "no block" and `0` for "no
//! offending byte".

use std::{
    ffi::{c_char, c_int, CStr},
    ptr,
};

use libc::{c_void, size_t};
use once_cell::sync::Lazy;

use crate::{
    alloc::{dlmalloc::DlmallocHeap, CallSite},
    sync::SharedEngine,
    taint::{IoBuf, Syscall},
    Addr, Config,
};

pub static ENGINE: Lazy<SharedEngine<DlmallocHeap>> = Lazy::new(|| {
    crate::init_logging();
    let config = Config::from_env().unwrap_or_else(|err| {
        log::error!("bad taintheap configuration ({err}), using defaults");
        Config::default()
    });
    SharedEngine::new(config, DlmallocHeap::new())
});

fn to_ptr(addr: Option<Addr>) -> *mut c_void {
    addr.map_or(ptr::null_mut(), |addr| addr as *mut c_void)
}

fn status<E>(result: Result<(), E>) -> c_int {
    match result {
        Ok(()) => 0,
        Err(_) => -1,
    }
}

#[no_mangle]
pub extern "C" fn taintheap_malloc(size: size_t, site: u64) -> *mut c_void {
    to_ptr(ENGINE.with(|e| e.malloc(size, CallSite(site))))
}

#[no_mangle]
pub extern "C" fn taintheap_calloc(nmemb: size_t, size: size_t, site: u64) -> *mut c_void {
    to_ptr(ENGINE.with(|e| e.calloc(nmemb, size, CallSite(site))))
}

/// Returns `-1` when the free was reported as an error.
#[no_mangle]
pub extern "C" fn taintheap_free(ptr: *mut c_void) -> c_int {
    status(ENGINE.with(|e| e.free(ptr as Addr)))
}

#[no_mangle]
pub extern "C" fn taintheap_realloc(ptr: *mut c_void, size: size_t, site: u64) -> *mut c_void {
    to_ptr(ENGINE.with(|e| e.realloc(ptr as Addr, size, CallSite(site))))
}

#[no_mangle]
pub extern "C" fn taintheap_create_pool(pool: *mut c_void, redzone: size_t, zero: bool) -> c_int {
    status(ENGINE.with(|e| e.on_pool_create(pool as Addr, redzone, zero)))
}

#[no_mangle]
pub extern "C" fn taintheap_destroy_pool(pool: *mut c_void) -> c_int {
    status(ENGINE.with(|e| e.on_pool_destroy(pool as Addr)))
}

#[no_mangle]
pub extern "C" fn taintheap_pool_alloc(
    pool: *mut c_void,
    addr: *mut c_void,
    size: size_t,
    site: u64,
) -> c_int {
    status(ENGINE.with(|e| e.on_pool_alloc(pool as Addr, addr as Addr, size, CallSite(site))))
}

#[no_mangle]
pub extern "C" fn taintheap_pool_free(pool: *mut c_void, addr: *mut c_void) -> c_int {
    status(ENGINE.with(|e| e.on_pool_free(pool as Addr, addr as Addr)))
}

#[no_mangle]
pub extern "C" fn taintheap_mark_defined(addr: *const c_void, len: size_t) {
    ENGINE.with(|e| e.mark_defined(addr as Addr, len))
}

#[no_mangle]
pub extern "C" fn taintheap_mark_undefined(addr: *const c_void, len: size_t) {
    ENGINE.with(|e| e.mark_undefined(addr as Addr, len))
}

#[no_mangle]
pub extern "C" fn taintheap_mark_no_access(addr: *const c_void, len: size_t) {
    ENGINE.with(|e| e.mark_no_access(addr as Addr, len))
}

/// The first byte of the range the program may not touch, or `0`.
#[no_mangle]
pub extern "C" fn taintheap_check_no_access(addr: *const c_void, len: size_t) -> usize {
    ENGINE
        .with(|e| e.check_no_access(addr as Addr, len))
        .unwrap_or(0)
}

#[no_mangle]
pub extern "C" fn taintheap_is_tainted(addr: *const c_void, len: size_t) -> bool {
    ENGINE.with(|e| e.is_tainted(addr as Addr, len))
}

/// # Safety
///
/// `path` must be null or point to a NUL-terminated string.
#[no_mangle]
pub unsafe extern "C" fn taintheap_syscall_open(tid: u32, path: *const c_char, result: isize) {
    let path = if path.is_null() {
        &[][..]
    } else {
        // SAFETY: non-null and NUL-terminated per the contract above.
        unsafe { CStr::from_ptr(path) }.to_bytes()
    };
    ENGINE.with(|e| e.on_syscall_return(tid, &Syscall::Open { path }, result))
}

/// # Safety
///
/// When `result > 0`, `buf` must be valid for reads of `result` bytes.
#[no_mangle]
pub unsafe extern "C" fn taintheap_syscall_read(
    tid: u32,
    fd: c_int,
    buf: *const c_void,
    result: isize,
) {
    let data: &[u8] = match usize::try_from(result) {
        Ok(len) if len > 0 && !buf.is_null() => {
            // SAFETY: the kernel just wrote `len` bytes there.
            unsafe { std::slice::from_raw_parts(buf.cast::<u8>(), len) }
        }
        _ => &[],
    };
    let buf = IoBuf::new(buf as Addr, data);
    ENGINE.with(|e| e.on_syscall_return(tid, &Syscall::Read { fd, buf }, result))
}

#[no_mangle]
pub extern "C" fn taintheap_syscall_close(tid: u32, fd: c_int, result: isize) {
    ENGINE.with(|e| e.on_syscall_return(tid, &Syscall::Close { fd }, result))
}

/// Errors reported so far.
#[no_mangle]
pub extern "C" fn taintheap_error_count() -> size_t {
    let count = ENGINE.with(|e| e.error_count());
    size_t::try_from(count).unwrap_or(size_t::MAX)
}
