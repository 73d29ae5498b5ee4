//! Bridge builder: glues the decoder and pool together to build trampoline
//! stubs for 32-bit x86 function hooking.
//!
//! A bridge is a small block of pool-owned executable memory that replays a
//! victim function's original prologue and then jumps back into the victim
//! past that prologue, so the original behavior stays callable after the
//! victim has been hooked at its entry point.

use core::ptr::NonNull;

use crate::decoder::{self, DecodeOutcome};
use crate::pool::{self, CodePool};

/// Byte length of the trailing near JMP (`E9 disp32`).
const JMP_LEN: usize = 5;
/// Minimum prologue length a bridge must copy, so the trailing JMP has room.
const MIN_PROLOGUE_LEN: usize = JMP_LEN;

/// The `mov edi, edi / push ebp / mov ebp, esp / pop ebp` sequence some
/// compilers emit at the start of hot-patchable functions. When present, the
/// bridge is just "skip past it" — no slice needed.
const HOTPATCH_PROLOGUE: [u8; 6] = [0x8B, 0xFF, 0x55, 0x8B, 0xEC, 0x5D];

/// Builds and tears down bridges against a particular [`CodePool`].
pub struct Builder<'p> {
    pool: &'p mut CodePool,
}

impl<'p> Builder<'p> {
    /// Borrow `pool` for the lifetime of this builder.
    pub fn new(pool: &'p mut CodePool) -> Self {
        Self { pool }
    }

    /// Build a bridge for `victim`, returning the address callers should
    /// invoke in its place, or `None` if no bridge could be built.
    ///
    /// # Safety
    ///
    /// `victim` must point to the start of a live, executable instruction
    /// stream at least [`MAX_INSTRUCTION_LENGTH`](crate::decoder::MAX_INSTRUCTION_LENGTH)
    /// bytes past its last consumed byte, readable for that entire span.
    pub unsafe fn create(&mut self, victim: *const u8) -> Option<NonNull<u8>> {
        // SAFETY: forwarded from the caller's contract on `victim`.
        if let Some(skip) = unsafe { fast_path(victim) } {
            log::trace!("bridge: hotpatch fast path at {victim:p}");
            return NonNull::new(skip as *mut u8);
        }

        // SAFETY: forwarded from the caller's contract on `victim`.
        let prologue_len = unsafe { measure_prologue(victim) }?;
        let bridge_len = prologue_len + JMP_LEN;

        let bridge = self.pool.alloc(bridge_len)?;

        // SAFETY: `victim` is readable for `prologue_len` bytes (just
        // measured); `bridge` was just allocated with room for `bridge_len`.
        unsafe { emit(self.pool, victim, bridge, prologue_len, bridge_len) };

        log::debug!("bridge: built {bridge_len}-byte bridge at {bridge:p} for victim {victim:p}");
        Some(bridge)
    }

    /// Tear down a bridge previously returned by [`create`](Self::create).
    /// A no-op for fast-path pointers, which the pool never recognizes.
    pub fn destroy(&mut self, ptr: NonNull<u8>) {
        self.pool.free(ptr);
    }
}

/// # Safety
/// `victim` must be readable for at least 6 bytes.
unsafe fn fast_path(victim: *const u8) -> Option<*const u8> {
    // SAFETY: forwarded from the caller.
    let head = unsafe { core::slice::from_raw_parts(victim, HOTPATCH_PROLOGUE.len()) };
    if head == HOTPATCH_PROLOGUE {
        // SAFETY: `victim` is readable for 6 bytes, so `victim + 6` is a
        // valid (one-past-end-of-read) pointer.
        Some(unsafe { victim.add(HOTPATCH_PROLOGUE.len()) })
    } else {
        None
    }
}

/// Sum instruction lengths at `victim` until they reach [`MIN_PROLOGUE_LEN`],
/// stopping and returning `None` on the first `Undecodable` or
/// `Unrelocatable` instruction (this release does not rewrite PC-relative
/// prologues).
///
/// # Safety
/// `victim` must be readable for at least `MIN_PROLOGUE_LEN` instructions'
/// worth of bytes (conservatively,
/// `MIN_PROLOGUE_LEN + crate::decoder::MAX_INSTRUCTION_LENGTH` bytes).
unsafe fn measure_prologue(victim: *const u8) -> Option<usize> {
    let mut total = 0usize;
    while total < MIN_PROLOGUE_LEN {
        // SAFETY: `cursor` stays within the readable span the caller
        // promised, since `total` never exceeds previously decoded lengths.
        let cursor = unsafe { victim.add(total) };
        // SAFETY: forwarded from the caller's contract.
        match unsafe { decoder::decode(cursor, true) } {
            DecodeOutcome::Length(n) => total += n as usize,
            DecodeOutcome::Unrelocatable | DecodeOutcome::Undecodable => return None,
        }
    }
    Some(total)
}

/// # Safety
/// `victim` must be readable for `prologue_len` bytes; `bridge` must be a
/// pool-owned, writable-when-unlocked allocation of at least `bridge_len`
/// bytes.
unsafe fn emit(
    pool: &mut CodePool,
    victim: *const u8,
    bridge: NonNull<u8>,
    prologue_len: usize,
    bridge_len: usize,
) {
    // `disp = victim + prologue_len - (bridge + bridge_len)`: the JMP lands
    // exactly at `victim + prologue_len`, the first victim instruction the
    // bridge didn't copy.
    let disp = (victim as i64)
        .wrapping_add(prologue_len as i64)
        .wrapping_sub(bridge.as_ptr() as i64)
        .wrapping_sub(bridge_len as i64) as i32;

    pool.unlock(bridge);
    // SAFETY: `victim` readable for `prologue_len`, `bridge` writable (just
    // unlocked) for `bridge_len >= prologue_len + JMP_LEN`, and the two
    // spans don't overlap (pool memory is never aliased with victim code).
    unsafe {
        core::ptr::copy_nonoverlapping(victim, bridge.as_ptr(), prologue_len);
        let jmp_at = bridge.as_ptr().add(prologue_len);
        jmp_at.write(0xE9);
        jmp_at.add(1).cast::<i32>().write_unaligned(disp);
    }
    pool.lock(bridge);
}

/// Build a bridge against the process-wide pool singleton.
///
/// # Safety
/// See [`Builder::create`].
pub unsafe fn bridge_create(victim: *const u8) -> Option<NonNull<u8>> {
    // SAFETY: caller accepts the single-threaded-use contract of `global`.
    let pool = unsafe { pool::global() };
    // SAFETY: forwarded from the caller's contract on `victim`.
    unsafe { Builder::new(pool).create(victim) }
}

/// Tear down a bridge built by [`bridge_create`].
///
/// # Safety
/// See [`pool::global`]'s single-threaded-use contract.
pub unsafe fn bridge_destroy(ptr: NonNull<u8>) {
    // SAFETY: caller accepts the single-threaded-use contract of `global`.
    let pool = unsafe { pool::global() };
    Builder::new(pool).destroy(ptr);
}
