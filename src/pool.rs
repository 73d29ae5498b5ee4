//! Code-memory pool: growable collection of RWX pages sliced into 16- or
//! 32-byte allocatable units.
//!
//! [`CodePool`] is a plain value type with no internal synchronization —
//! this pool is single-threaded by design, and [`global`] exposes a
//! process-wide singleton only for callers who accept that restriction
//! themselves.

use core::ptr::NonNull;
use std::sync::OnceLock;

use crate::platform;

/// Bytes per allocatable unit.
const UNIT_SIZE: usize = 16;
/// Bits in the bitfield word type (`u32`), fixed regardless of host
/// pointer width so a double slice's "never spans a word" behavior is
/// deterministic across targets.
const BITS_PER_WORD: u32 = 32;
/// Two bits (`free`, `double`) per unit.
const UNITS_PER_WORD: usize = (BITS_PER_WORD / 2) as usize;
/// `0b0101...0101`: the free-bit of every unit in a word, all else zero.
const FREE_MASK: u32 = 0x5555_5555;

fn unit_free(word: u32, index: usize) -> bool {
    word & (1 << (index * 2)) != 0
}

fn unit_double(word: u32, index: usize) -> bool {
    word & (1 << (index * 2 + 1)) != 0
}

fn mark_allocated(word: &mut u32, index: usize, double: bool) {
    let pair_mask = 0b11u32 << (index * 2);
    *word &= !pair_mask;
    if double {
        *word |= 1 << (index * 2 + 1);
    }
}

fn mark_free(word: &mut u32, index: usize) {
    let pair_mask = 0b11u32 << (index * 2);
    *word &= !pair_mask;
    *word |= 1 << (index * 2);
}

struct Page {
    base: NonNull<u8>,
    bitfield: Vec<u32>,
}

/// A growable pool of RWX code pages, carved into 16-/32-byte slices.
///
/// Pages are never destroyed or shrunk, so every pointer this pool hands
/// out stays valid for the process's lifetime. `CodePool` itself holds raw
/// pointers and is therefore `!Send`/`!Sync`; nothing here prevents two
/// `CodePool` values from managing entirely separate sets of pages.
pub struct CodePool {
    page_size: usize,
    units_per_page: usize,
    words_per_page: usize,
    pages: Vec<Page>,
}

impl CodePool {
    /// Create an empty pool. No page is reserved until the first
    /// [`alloc`](Self::alloc) call (lazy initialization).
    pub const fn new() -> Self {
        Self {
            page_size: 0,
            units_per_page: 0,
            words_per_page: 0,
            pages: Vec::new(),
        }
    }

    fn ensure_initialized(&mut self) -> bool {
        if self.page_size != 0 {
            return true;
        }
        let page_size = platform::page_size();
        self.page_size = page_size;
        self.units_per_page = page_size / UNIT_SIZE;
        self.words_per_page = self.units_per_page / UNITS_PER_WORD;
        self.add_page()
    }

    fn add_page(&mut self) -> bool {
        let Some(base) = platform::map_rwx_page(self.page_size) else {
            log::debug!("pool: OS page allocation failed");
            return false;
        };
        // SAFETY: `base` is a fresh mapping of `page_size` writable bytes.
        unsafe { core::ptr::write_bytes(base.as_ptr(), 0xCC, self.page_size) };
        let bitfield = vec![FREE_MASK; self.words_per_page];
        platform::set_page_writable(base, self.page_size, false);
        log::trace!(
            "pool: added page at {base:p} ({} units)",
            self.units_per_page
        );
        self.pages.push(Page { base, bitfield });
        true
    }

    /// Allocate a slice of `size` bytes (`0 < size <= 32`). Sizes above 16
    /// consume a double (32-byte) unit pair. Returns `None` if `size` is
    /// out of range or every page (including one freshly added) is full.
    pub fn alloc(&mut self, size: usize) -> Option<NonNull<u8>> {
        if size == 0 || size > 32 {
            return None;
        }
        let need = if size > 16 { 2 } else { 1 };

        if !self.ensure_initialized() {
            return None;
        }

        if let Some(ptr) = self.find_and_mark(need) {
            log::trace!("pool: allocated {need} unit(s) at {ptr:p}");
            return Some(ptr);
        }

        // Exactly one retry after growing a fresh page.
        if !self.add_page() {
            return None;
        }
        let ptr = self.find_and_mark(need);
        if ptr.is_none() {
            log::debug!("pool: allocation failed immediately after growing");
        }
        ptr
    }

    /// Scan pages most-recently-created first, then one bitfield word at a
    /// time, for `need` consecutive free units that don't straddle a word
    /// boundary. A slice that would span two words is skipped rather than
    /// granted, trading some fragmentation for a branch-free bit layout.
    fn find_and_mark(&mut self, need: usize) -> Option<NonNull<u8>> {
        for page in self.pages.iter_mut().rev() {
            for w in 0..self.words_per_page {
                let word = page.bitfield[w];
                if word & FREE_MASK == 0 {
                    continue;
                }
                let limit = UNITS_PER_WORD - need + 1;
                for i in 0..limit {
                    let fits = unit_free(word, i) && (need == 1 || unit_free(word, i + 1));
                    if !fits {
                        continue;
                    }
                    let word_mut = &mut page.bitfield[w];
                    mark_allocated(word_mut, i, need == 2);
                    if need == 2 {
                        mark_allocated(word_mut, i + 1, false);
                    }
                    let offset = (w * UNITS_PER_WORD + i) * UNIT_SIZE;
                    // SAFETY: offset is within this page's mapped length.
                    let addr = unsafe { page.base.as_ptr().add(offset) };
                    return NonNull::new(addr);
                }
            }
        }
        None
    }

    /// Return `ptr`'s memory to the pool. A no-op if `ptr` does not belong
    /// to this pool, or if it names an already-free slice (double-free).
    pub fn free(&mut self, ptr: NonNull<u8>) {
        let Some((page_idx, unit_index)) = self.locate(ptr) else {
            log::trace!("pool: free of unrecognized pointer {ptr:p} ignored");
            return;
        };

        let w = unit_index / UNITS_PER_WORD;
        let i = unit_index % UNITS_PER_WORD;
        let page_base = self.pages[page_idx].base;
        let page_size = self.page_size;

        let word = self.pages[page_idx].bitfield[w];
        if unit_free(word, i) {
            log::trace!("pool: double free of {ptr:p} ignored");
            return;
        }
        let is_double = unit_double(word, i);
        let byte_len = if is_double { 32 } else { 16 };

        // SAFETY: `addr` is the start of a live, pool-owned slice.
        let addr = unsafe { page_base.as_ptr().add(unit_index * UNIT_SIZE) };
        platform::set_page_writable(page_base, page_size, true);
        unsafe { core::ptr::write_bytes(addr, 0xCC, byte_len) };
        platform::set_page_writable(page_base, page_size, false);

        let bitfield = &mut self.pages[page_idx].bitfield;
        mark_free(&mut bitfield[w], i);
        if is_double {
            mark_free(&mut bitfield[w], i + 1);
        }
        log::trace!("pool: freed {byte_len}-byte slice at {ptr:p}");
    }

    /// Allow writes to the page containing `ptr`.
    pub fn unlock(&mut self, ptr: NonNull<u8>) {
        self.set_page_writable(ptr, true);
    }

    /// Write-protect the page containing `ptr`.
    pub fn lock(&mut self, ptr: NonNull<u8>) {
        self.set_page_writable(ptr, false);
    }

    fn set_page_writable(&mut self, ptr: NonNull<u8>, writable: bool) {
        if let Some((idx, _)) = self.locate(ptr) {
            platform::set_page_writable(self.pages[idx].base, self.page_size, writable);
        }
    }

    fn locate(&self, ptr: NonNull<u8>) -> Option<(usize, usize)> {
        let addr = ptr.as_ptr() as usize;
        let page_mask = !(self.page_size.wrapping_sub(1));
        let aligned = addr & page_mask;
        for (idx, page) in self.pages.iter().enumerate().rev() {
            if page.base.as_ptr() as usize == aligned {
                return Some((idx, (addr - aligned) / UNIT_SIZE));
            }
        }
        None
    }
}

impl Default for CodePool {
    fn default() -> Self {
        Self::new()
    }
}

struct GlobalCell(std::cell::UnsafeCell<CodePool>);

// SAFETY: this is an explicit, documented escape hatch (see `global`'s
// safety doc) rather than an accidental property — the pool carries no
// real synchronization and callers opting into the singleton accept that.
unsafe impl Send for GlobalCell {}
unsafe impl Sync for GlobalCell {}

static GLOBAL: OnceLock<GlobalCell> = OnceLock::new();

/// The process-wide pool singleton, for call sites that want the classic
/// `bridge_create`/`bridge_destroy`-style single entry point instead of
/// threading a `CodePool` value through their own state.
///
/// # Safety
///
/// The returned reference is not synchronized. The caller must not call
/// any `CodePool` method on it concurrently from more than one thread.
pub unsafe fn global() -> &'static mut CodePool {
    let cell = GLOBAL.get_or_init(|| GlobalCell(std::cell::UnsafeCell::new(CodePool::new())));
    // SAFETY: forwarding the caller's single-threaded-use contract.
    unsafe { &mut *cell.0.get() }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Guards tests that touch the process-global singleton so they don't
    /// interfere with each other across the test binary's worker threads.
    static GLOBAL_TEST_GUARD: Mutex<()> = Mutex::new(());

    /// Run with `RUST_LOG=trace` to see the pool's trace/debug lines.
    fn init_logging() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    fn read_slice(ptr: NonNull<u8>, len: usize) -> Vec<u8> {
        unsafe { core::slice::from_raw_parts(ptr.as_ptr(), len) }.to_vec()
    }

    #[test]
    fn alloc_rejects_out_of_range_sizes() {
        init_logging();
        let mut pool = CodePool::new();
        assert!(pool.alloc(0).is_none());
        assert!(pool.alloc(33).is_none());
    }

    #[test]
    fn single_and_double_slices_are_disjoint() {
        let mut pool = CodePool::new();
        let a = pool.alloc(16).unwrap();
        let b = pool.alloc(32).unwrap();
        let c = pool.alloc(1).unwrap();

        let a_range = a.as_ptr() as usize..a.as_ptr() as usize + 16;
        let b_range = b.as_ptr() as usize..b.as_ptr() as usize + 32;
        let c_range = c.as_ptr() as usize..c.as_ptr() as usize + 16;

        assert!(!a_range.contains(&(b_range.start)));
        assert!(!b_range.contains(&(a_range.start)));
        assert!(!a_range.contains(&(c_range.start)));
        assert!(!c_range.contains(&(a_range.start)));
        assert!(!b_range.contains(&(c_range.start)));
    }

    #[test]
    fn freed_bytes_read_back_as_int3() {
        let mut pool = CodePool::new();
        let ptr = pool.alloc(16).unwrap();
        pool.unlock(ptr);
        unsafe { core::ptr::write_bytes(ptr.as_ptr(), 0x90, 16) };
        pool.lock(ptr);

        pool.free(ptr);
        assert_eq!(read_slice(ptr, 16), vec![0xCCu8; 16]);
    }

    #[test]
    fn recycle_returns_pool_to_initial_state() {
        let mut pool = CodePool::new();
        let first = pool.alloc(16).unwrap();
        pool.free(first);
        let second = pool.alloc(16).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn page_grows_when_full() {
        let mut pool = CodePool::new();
        let page_size = platform::page_size();
        let units = page_size / UNIT_SIZE;

        let mut seen_pages = std::collections::HashSet::new();
        for _ in 0..units {
            let ptr = pool.alloc(16).unwrap();
            seen_pages.insert(ptr.as_ptr() as usize & !(page_size - 1));
        }
        assert_eq!(seen_pages.len(), 1);

        let overflow = pool.alloc(16).unwrap();
        let overflow_page = overflow.as_ptr() as usize & !(page_size - 1);
        assert!(!seen_pages.contains(&overflow_page));
    }

    #[test]
    fn free_of_unrecognized_pointer_is_a_no_op() {
        let mut pool = CodePool::new();
        let known = pool.alloc(16).unwrap();

        let mut stray = 0u8;
        let stray_ptr = NonNull::new(&mut stray as *mut u8).unwrap();
        pool.free(stray_ptr); // must not panic, must not touch `known`.

        assert!(read_slice(known, 16).iter().all(|&b| b == 0xCC));
    }

    #[test]
    fn double_free_is_silent() {
        let mut pool = CodePool::new();
        let ptr = pool.alloc(16).unwrap();
        pool.free(ptr);
        pool.free(ptr); // second free must not panic or corrupt state.
        let again = pool.alloc(16).unwrap();
        assert_eq!(ptr, again);
    }

    #[test]
    fn global_singleton_round_trips() {
        let _guard = GLOBAL_TEST_GUARD.lock().unwrap();
        // SAFETY: serialized by `GLOBAL_TEST_GUARD` for the duration of
        // this test.
        let pool = unsafe { global() };
        let ptr = pool.alloc(16).unwrap();
        pool.free(ptr);
    }
}
