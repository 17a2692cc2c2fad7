//! # Segmentation
//!
//! GDT and TSS setup. All storage is static and zero-initialized; nothing
//! here touches the heap, which is what allows this module to run in
//! stage 1.
//!
//! The bootstrap processor owns all writes. Application processors load
//! the already-built table from their startup path and treat it as
//! read-only from then on.

pub mod gdt;
pub mod selectors;
pub mod tss;

pub use gdt::{Gdt, GdtEntry, GdtPointer};
pub use selectors::{Rpl, SegmentSelector, KERNEL_CS, KERNEL_DS, TSS_SELECTOR, USER_CS, USER_DS};
pub use tss::{Tss, TssDescriptor, IST_COUNT, TSS_SIZE};

use crate::arch::x86_64::cell::BootCell;

// =============================================================================
// Static Storage
// =============================================================================

static GDT: BootCell<Gdt> = BootCell::new(Gdt::new());
static TSS: BootCell<Tss> = BootCell::new(Tss::new());

// =============================================================================
// Initialization
// =============================================================================

/// Build and load the GDT/TSS on the bootstrap processor.
///
/// Clears the TSS, fills the descriptor slots, loads the table, reloads
/// every segment register and loads the task register.
///
/// # Safety
///
/// Stage 1 only, single-threaded, interrupts disabled.
pub unsafe fn init() {
    unsafe {
        let tss = TSS.get_mut();
        *tss = Tss::new();

        let gdt = GDT.get_mut();
        *gdt = Gdt::new();
        gdt.set_tss(tss);

        gdt.load();
        tss::load_tss(TSS_SELECTOR);
    }

    log::debug!("segmentation: GDT and TSS loaded");
}

/// Load the shared GDT on an application processor.
///
/// The task register stays unloaded on APs: the single TSS descriptor is
/// busy once the BSP owns it, and nothing on an AP takes a ring
/// transition.
///
/// # Safety
///
/// Must run on an AP during its bring-up path, interrupts disabled.
pub unsafe fn load_on_ap() {
    unsafe {
        GDT.get().load();
    }
}

/// LGDT operand for the shared table, needed by the SMP trampoline.
pub fn gdt_pointer() -> GdtPointer {
    unsafe { GDT.get() }.pointer()
}

// =============================================================================
// TSS Mutation
// =============================================================================

/// Point RSP0 at a new ring-0 stack top.
///
/// Called by the scheduler on every context switch.
pub fn set_kernel_stack(stack_top: u64) {
    // Single 64-bit store into live, published storage.
    unsafe {
        TSS.get_mut().set_kernel_stack(stack_top);
    }
}

/// Install an alternate interrupt stack in IST slot `index` (1-7).
///
/// Out-of-range slots are ignored.
pub fn set_ist(index: usize, stack_top: u64) {
    unsafe {
        TSS.get_mut().set_ist(index, stack_top);
    }
}

#[cfg(test)]
pub(crate) fn tss_snapshot() -> Tss {
    *unsafe { TSS.get() }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_kernel_stack_updates_rsp0() {
        set_kernel_stack(0xFFFF_8000_0010_0000);
        let tss = tss_snapshot();
        assert_eq!({ tss.rsp0 }, 0xFFFF_8000_0010_0000);
    }

    #[test]
    fn test_set_ist_round_trip() {
        set_ist(2, 0xFFFF_8000_0020_0000);
        assert_eq!(tss_snapshot().ist(2), 0xFFFF_8000_0020_0000);
    }
}
