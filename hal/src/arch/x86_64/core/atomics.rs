//! # Atomic Primitives
//!
//! Sequentially consistent atomics on raw memory cells, plus the full
//! memory fence and the bulk memory operations. Every read-modify-write
//! returns the value the cell held *before* the operation.
//!
//! These operate on raw pointers because the callers (handler table
//! publication, AP alive flags, trampoline mailboxes) own cells that are
//! not declared as `Atomic*` types.

use core::arch::asm;
use core::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize};

// =============================================================================
// Compare-Exchange
// =============================================================================

/// CAS on a 32-bit cell. Returns the pre-operation value; the swap
/// happened iff the return equals `expected`.
///
/// # Safety
///
/// `cell` must be valid, 4-byte aligned and only accessed atomically.
#[inline]
pub unsafe fn compare_exchange_u32(cell: *mut u32, expected: u32, desired: u32) -> u32 {
    let atomic = unsafe { AtomicU32::from_ptr(cell) };
    match atomic.compare_exchange(
        expected,
        desired,
        core::sync::atomic::Ordering::SeqCst,
        core::sync::atomic::Ordering::SeqCst,
    ) {
        Ok(prev) | Err(prev) => prev,
    }
}

/// CAS on a 64-bit cell. Returns the pre-operation value.
///
/// # Safety
///
/// `cell` must be valid, 8-byte aligned and only accessed atomically.
#[inline]
pub unsafe fn compare_exchange_u64(cell: *mut u64, expected: u64, desired: u64) -> u64 {
    let atomic = unsafe { AtomicU64::from_ptr(cell) };
    match atomic.compare_exchange(
        expected,
        desired,
        core::sync::atomic::Ordering::SeqCst,
        core::sync::atomic::Ordering::SeqCst,
    ) {
        Ok(prev) | Err(prev) => prev,
    }
}

/// CAS on a pointer-sized cell. Returns the pre-operation value.
///
/// # Safety
///
/// `cell` must be valid, pointer-aligned and only accessed atomically.
#[inline]
pub unsafe fn compare_exchange_ptr(cell: *mut usize, expected: usize, desired: usize) -> usize {
    let atomic = unsafe { AtomicUsize::from_ptr(cell) };
    match atomic.compare_exchange(
        expected,
        desired,
        core::sync::atomic::Ordering::SeqCst,
        core::sync::atomic::Ordering::SeqCst,
    ) {
        Ok(prev) | Err(prev) => prev,
    }
}

// =============================================================================
// Exchange
// =============================================================================

/// Unconditional swap on a 32-bit cell. Returns the pre-operation value.
///
/// # Safety
///
/// `cell` must be valid, 4-byte aligned and only accessed atomically.
#[inline]
pub unsafe fn exchange_u32(cell: *mut u32, value: u32) -> u32 {
    unsafe { AtomicU32::from_ptr(cell) }.swap(value, core::sync::atomic::Ordering::SeqCst)
}

/// Unconditional swap on a 64-bit cell. Returns the pre-operation value.
///
/// # Safety
///
/// `cell` must be valid, 8-byte aligned and only accessed atomically.
#[inline]
pub unsafe fn exchange_u64(cell: *mut u64, value: u64) -> u64 {
    unsafe { AtomicU64::from_ptr(cell) }.swap(value, core::sync::atomic::Ordering::SeqCst)
}

/// Unconditional swap on a pointer-sized cell. Returns the pre-operation
/// value.
///
/// # Safety
///
/// `cell` must be valid, pointer-aligned and only accessed atomically.
#[inline]
pub unsafe fn exchange_ptr(cell: *mut usize, value: usize) -> usize {
    unsafe { AtomicUsize::from_ptr(cell) }.swap(value, core::sync::atomic::Ordering::SeqCst)
}

// =============================================================================
// Fetch-Add / Increment / Decrement
// =============================================================================

/// Atomic add on a 32-bit cell. Returns the pre-operation value.
///
/// # Safety
///
/// `cell` must be valid, 4-byte aligned and only accessed atomically.
#[inline]
pub unsafe fn fetch_add_u32(cell: *mut u32, value: u32) -> u32 {
    unsafe { AtomicU32::from_ptr(cell) }.fetch_add(value, core::sync::atomic::Ordering::SeqCst)
}

/// Atomic add on a 64-bit cell. Returns the pre-operation value.
///
/// # Safety
///
/// `cell` must be valid, 8-byte aligned and only accessed atomically.
#[inline]
pub unsafe fn fetch_add_u64(cell: *mut u64, value: u64) -> u64 {
    unsafe { AtomicU64::from_ptr(cell) }.fetch_add(value, core::sync::atomic::Ordering::SeqCst)
}

/// Atomic increment of a 32-bit cell. Returns the pre-operation value.
///
/// # Safety
///
/// Same requirements as [`fetch_add_u32`].
#[inline]
pub unsafe fn increment_u32(cell: *mut u32) -> u32 {
    unsafe { fetch_add_u32(cell, 1) }
}

/// Atomic increment of a 64-bit cell. Returns the pre-operation value.
///
/// # Safety
///
/// Same requirements as [`fetch_add_u64`].
#[inline]
pub unsafe fn increment_u64(cell: *mut u64) -> u64 {
    unsafe { fetch_add_u64(cell, 1) }
}

/// Atomic decrement of a 32-bit cell. Returns the pre-operation value.
///
/// # Safety
///
/// Same requirements as [`fetch_add_u32`].
#[inline]
pub unsafe fn decrement_u32(cell: *mut u32) -> u32 {
    unsafe { AtomicU32::from_ptr(cell) }.fetch_sub(1, core::sync::atomic::Ordering::SeqCst)
}

/// Atomic decrement of a 64-bit cell. Returns the pre-operation value.
///
/// # Safety
///
/// Same requirements as [`fetch_add_u64`].
#[inline]
pub unsafe fn decrement_u64(cell: *mut u64) -> u64 {
    unsafe { AtomicU64::from_ptr(cell) }.fetch_sub(1, core::sync::atomic::Ordering::SeqCst)
}

// =============================================================================
// Fences
// =============================================================================

/// Full memory fence with MFENCE semantics.
#[inline]
pub fn memory_barrier() {
    unsafe {
        asm!("mfence", options(nostack, preserves_flags));
    }
}

// =============================================================================
// Bulk Memory
// =============================================================================

/// Copy `len` bytes. Regions must not overlap.
///
/// # Safety
///
/// Both pointers must be valid for `len` bytes and must not alias.
#[inline]
pub unsafe fn copy(dst: *mut u8, src: *const u8, len: usize) {
    unsafe { core::ptr::copy_nonoverlapping(src, dst, len) }
}

/// Fill `len` bytes with `value`.
///
/// # Safety
///
/// `dst` must be valid for `len` bytes.
#[inline]
pub unsafe fn fill(dst: *mut u8, value: u8, len: usize) {
    unsafe { core::ptr::write_bytes(dst, value, len) }
}

/// Zero `len` bytes.
///
/// # Safety
///
/// `dst` must be valid for `len` bytes.
#[inline]
pub unsafe fn zero(dst: *mut u8, len: usize) {
    unsafe { core::ptr::write_bytes(dst, 0, len) }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cas_returns_pre_value() {
        let mut cell: u64 = 5;
        let prev = unsafe { compare_exchange_u64(&mut cell, 5, 9) };
        assert_eq!(prev, 5);
        assert_eq!(cell, 9);

        let prev = unsafe { compare_exchange_u64(&mut cell, 5, 1) };
        assert_eq!(prev, 9);
        assert_eq!(cell, 9);
    }

    #[test]
    fn test_exchange_and_fetch_add() {
        let mut cell: u32 = 3;
        assert_eq!(unsafe { exchange_u32(&mut cell, 7) }, 3);
        assert_eq!(unsafe { fetch_add_u32(&mut cell, 10) }, 7);
        assert_eq!(unsafe { increment_u32(&mut cell) }, 17);
        assert_eq!(unsafe { decrement_u32(&mut cell) }, 18);
        assert_eq!(cell, 17);
    }

    #[test]
    fn test_bulk_memory() {
        let src = [1u8, 2, 3, 4];
        let mut dst = [0u8; 4];
        unsafe {
            copy(dst.as_mut_ptr(), src.as_ptr(), 4);
        }
        assert_eq!(dst, src);
        unsafe {
            fill(dst.as_mut_ptr(), 0xAA, 2);
        }
        assert_eq!(dst, [0xAA, 0xAA, 3, 4]);
        unsafe {
            zero(dst.as_mut_ptr(), 4);
        }
        assert_eq!(dst, [0; 4]);
    }

    #[test]
    fn test_cas_contention_no_lost_updates() {
        use std::sync::atomic::{AtomicU64, Ordering};
        use std::sync::Arc;

        const ITERS: u64 = 10_000;
        let cell = Arc::new(AtomicU64::new(0));

        let workers: Vec<_> = (0..2)
            .map(|_| {
                let cell = Arc::clone(&cell);
                std::thread::spawn(move || {
                    for _ in 0..ITERS {
                        loop {
                            let ptr = cell.as_ptr();
                            let current = cell.load(Ordering::SeqCst);
                            let prev = unsafe {
                                compare_exchange_u64(ptr, current, current + 1)
                            };
                            if prev == current {
                                break;
                            }
                        }
                    }
                })
            })
            .collect();

        for w in workers {
            w.join().unwrap();
        }
        // Every successful swap accounts for exactly one increment.
        assert_eq!(cell.load(Ordering::SeqCst), 2 * ITERS);
    }
}
