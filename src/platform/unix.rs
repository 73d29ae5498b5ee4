//! Unix backend: `sysconf`/`mmap`/`mprotect` via `libc`.
//!
//! Grounded in `bus1-sys`'s use of `libc` for its Linux/x86 syscall
//! surface — this crate uses the same dependency for the same purpose, a
//! thin safe-ish wrapper around a handful of raw syscalls.

use core::ptr::NonNull;

/// The platform's natural page size, queried once and cached by the caller.
pub(crate) fn page_size() -> usize {
    // SAFETY: `sysconf` with a valid name is always safe to call.
    let value = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if value <= 0 {
        4096
    } else {
        value as usize
    }
}

/// Reserve and commit one anonymous page, mapped `RWX`. Returns `None` on
/// OS allocation failure.
pub(crate) fn map_rwx_page(len: usize) -> Option<NonNull<u8>> {
    // SAFETY: the arguments describe a valid anonymous, non-fixed mapping.
    let addr = unsafe {
        libc::mmap(
            core::ptr::null_mut(),
            len,
            libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
            -1,
            0,
        )
    };
    if addr == libc::MAP_FAILED {
        return None;
    }
    NonNull::new(addr.cast())
}

/// Toggle write permission on the page containing `page_base` (already
/// page-aligned). Returns `false` on failure.
pub(crate) fn set_page_writable(page_base: NonNull<u8>, len: usize, writable: bool) -> bool {
    let prot = if writable {
        libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC
    } else {
        libc::PROT_READ | libc::PROT_EXEC
    };
    // SAFETY: `page_base` is the start of a page this process owns, mapped
    // with at least `len` bytes, per the caller's contract.
    let rc = unsafe { libc::mprotect(page_base.as_ptr().cast(), len, prot) };
    rc == 0
}
