//! Windows backend: `VirtualAlloc`/`VirtualProtect`/`GetSystemInfo`.
//!
//! No `windows-sys`/`winapi` dependency is pulled in for three functions —
//! they're hand-declared here against the stable Win32 ABI, the same way a
//! narrow FFI surface would be declared in any crate that doesn't otherwise
//! need a full Windows bindings crate.

use core::ffi::c_void;
use core::ptr::NonNull;

use bitflags::bitflags;

bitflags! {
    /// `VirtualAlloc`'s `flAllocationType` bits this module needs.
    struct AllocType: u32 {
        const COMMIT = 0x1000;
        const RESERVE = 0x2000;
    }
}

const PAGE_EXECUTE_READ: u32 = 0x20;
const PAGE_EXECUTE_READWRITE: u32 = 0x40;

#[repr(C)]
struct SystemInfo {
    processor_architecture: u16,
    reserved: u16,
    page_size: u32,
    min_app_addr: *mut c_void,
    max_app_addr: *mut c_void,
    active_processor_mask: usize,
    number_of_processors: u32,
    processor_type: u32,
    alloc_granularity: u32,
    processor_level: u16,
    processor_revision: u16,
}

extern "system" {
    fn GetSystemInfo(info: *mut SystemInfo);
    fn VirtualAlloc(addr: *mut c_void, size: usize, alloc_type: u32, protect: u32) -> *mut c_void;
    fn VirtualProtect(addr: *mut c_void, size: usize, new_protect: u32, old_protect: *mut u32) -> i32;
}

pub(crate) fn page_size() -> usize {
    // SAFETY: `info` is a valid, fully-initialized out parameter.
    unsafe {
        let mut info: SystemInfo = core::mem::zeroed();
        GetSystemInfo(&mut info);
        info.page_size as usize
    }
}

pub(crate) fn map_rwx_page(len: usize) -> Option<NonNull<u8>> {
    // SAFETY: requesting a fresh anonymous RWX region.
    let addr = unsafe {
        VirtualAlloc(
            core::ptr::null_mut(),
            len,
            (AllocType::COMMIT | AllocType::RESERVE).bits(),
            PAGE_EXECUTE_READWRITE,
        )
    };
    NonNull::new(addr.cast())
}

pub(crate) fn set_page_writable(page_base: NonNull<u8>, len: usize, writable: bool) -> bool {
    let protect = if writable {
        PAGE_EXECUTE_READWRITE
    } else {
        PAGE_EXECUTE_READ
    };
    let mut old_protect: u32 = 0;
    // SAFETY: `page_base` is the start of a page this process owns.
    let ok = unsafe {
        VirtualProtect(page_base.as_ptr().cast(), len, protect, &mut old_protect)
    };
    ok != 0
}
