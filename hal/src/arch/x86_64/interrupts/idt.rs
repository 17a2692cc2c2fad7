//! # IDT Management
//!
//! The single IDT: 256 gates, 4 KiB, built once in stage 1 and never
//! rebuilt. Every entry is an interrupt gate through the kernel code
//! segment, pointing at the matching ISR stub. Individual vectors can be
//! upgraded onto an IST stack afterwards; nothing else is ever rewritten.

use core::mem::size_of;

use super::entries::{GateOptions, IdtEntry};
use super::stubs;
use crate::arch::x86_64::cell::BootCell;
use crate::arch::x86_64::segmentation::KERNEL_CS;

// =============================================================================
// IDT Structure
// =============================================================================

/// Number of gates.
pub const IDT_ENTRIES: usize = 256;

/// The Interrupt Descriptor Table.
#[repr(C, align(16))]
pub struct Idt {
    entries: [IdtEntry; IDT_ENTRIES],
}

impl Idt {
    /// Empty table, no gate present.
    pub const fn new() -> Self {
        Self {
            entries: [IdtEntry::empty(); IDT_ENTRIES],
        }
    }

    /// Gate for `vector`.
    #[inline]
    pub fn entry(&self, vector: u8) -> &IdtEntry {
        &self.entries[vector as usize]
    }

    /// Point every gate at its stub.
    fn fill_from_stub_table(&mut self) {
        let selector = KERNEL_CS.raw();
        for vector in 0..IDT_ENTRIES {
            self.entries[vector] = IdtEntry::new(
                stubs::stub_for(vector as u8),
                selector,
                GateOptions::interrupt(),
            );
        }
    }

    /// Operand for LIDT.
    pub fn pointer(&self) -> IdtPointer {
        IdtPointer {
            limit: (size_of::<Self>() - 1) as u16,
            base: self as *const Self as u64,
        }
    }

    /// Load this table.
    ///
    /// # Safety
    ///
    /// The table must stay at a stable address for the process lifetime.
    pub unsafe fn load(&self) {
        let pointer = self.pointer();
        unsafe {
            core::arch::asm!(
                "lidt [{}]",
                in(reg) &pointer,
                options(readonly, nostack, preserves_flags),
            );
        }
    }
}

impl Default for Idt {
    fn default() -> Self {
        Self::new()
    }
}

impl core::fmt::Debug for Idt {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let present = self.entries.iter().filter(|e| e.is_present()).count();
        f.debug_struct("Idt").field("present", &present).finish()
    }
}

/// Operand for the LIDT instruction.
#[repr(C, packed)]
#[derive(Clone, Copy)]
pub struct IdtPointer {
    /// Table size minus one.
    pub limit: u16,
    /// Table base address.
    pub base: u64,
}

impl core::fmt::Debug for IdtPointer {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("IdtPointer")
            .field("limit", &{ self.limit })
            .field("base", &format_args!("{:#018x}", { self.base }))
            .finish()
    }
}

static_assertions::const_assert_eq!(size_of::<Idt>(), 4096);

// =============================================================================
// Static IDT
// =============================================================================

static IDT: BootCell<Idt> = BootCell::new(Idt::new());

/// Build the IDT from the stub table and load it on the BSP.
///
/// # Safety
///
/// Stage 1 only, single-threaded, interrupts disabled.
pub unsafe fn init() {
    unsafe {
        let idt = IDT.get_mut();
        idt.fill_from_stub_table();
        idt.load();
    }
    log::debug!("interrupts: IDT loaded ({} gates)", IDT_ENTRIES);
}

/// Load the already-built IDT on an application processor.
///
/// # Safety
///
/// Must run on an AP during bring-up, after the BSP finished stage 1.
pub unsafe fn load_on_ap() {
    unsafe {
        IDT.get().load();
    }
}

/// Move `vector` onto IST stack `ist` (1-7).
///
/// Used to give the double fault and NMI gates a known-good stack. Must
/// happen before interrupts are enabled; the gate is otherwise immutable.
pub fn set_vector_ist(vector: u8, ist: u8) {
    unsafe {
        IDT.get_mut().entries[vector as usize].set_ist(ist);
    }
}

/// LIDT operand for the shared table, needed by the SMP trampoline.
pub fn idt_pointer() -> IdtPointer {
    unsafe { IDT.get() }.pointer()
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_idt_size() {
        assert_eq!(size_of::<Idt>(), 4096);
    }

    #[test]
    fn test_fill_builds_every_gate() {
        let mut idt = Idt::new();
        idt.fill_from_stub_table();
        for vector in 0..=255u8 {
            let entry = idt.entry(vector);
            assert!(entry.is_present(), "vector {vector} not present");
            assert_eq!(entry.selector(), 0x08);
            assert_eq!(entry.type_attr(), 0x8E);
            assert_eq!(entry.ist(), 0);
            assert_eq!(entry.handler(), stubs::stub_for(vector));
        }
    }

    #[test]
    fn test_pointer_covers_table() {
        let idt = Idt::new();
        let pointer = idt.pointer();
        assert_eq!({ pointer.limit }, 4095);
        assert_eq!({ pointer.base }, &idt as *const Idt as u64);
    }

    #[test]
    fn test_ist_upgrade_preserves_gate() {
        let mut idt = Idt::new();
        idt.fill_from_stub_table();
        idt.entries[8].set_ist(1);
        let entry = idt.entry(8);
        assert_eq!(entry.ist(), 1);
        assert_eq!(entry.handler(), stubs::stub_for(8));
        assert_eq!(entry.type_attr(), 0x8E);
    }
}
