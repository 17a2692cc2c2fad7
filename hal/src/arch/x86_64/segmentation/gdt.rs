//! # Global Descriptor Table
//!
//! In long mode segmentation is mostly vestigial, but the CPU still
//! requires a valid code segment (L=1), a data segment for SS/DS/ES and a
//! TSS descriptor. The layout is fixed; see [`super::selectors`].
//!
//! Exactly one GDT exists. The bootstrap processor builds and loads it in
//! stage 1; application processors load the same table from their
//! trampoline and never write it.

use core::mem::size_of;

use bitflags::bitflags;

use super::selectors::{KERNEL_CS, KERNEL_DS};
use super::tss::{Tss, TssDescriptor};

// =============================================================================
// Constants
// =============================================================================

/// Total descriptor slots (null + 4 segments + 2 for the TSS).
pub const GDT_SLOT_COUNT: usize = 7;

/// Size of one descriptor slot.
pub const GDT_SLOT_SIZE: usize = 8;

// =============================================================================
// Access Byte and Flags
// =============================================================================

bitflags! {
    /// Descriptor access byte.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct AccessByte: u8 {
        /// Segment present
        const PRESENT = 1 << 7;
        /// DPL bit 0
        const DPL_LOW = 1 << 5;
        /// DPL bit 1
        const DPL_HIGH = 1 << 6;
        /// Code/data (vs. system) descriptor
        const CODE_DATA = 1 << 4;
        /// Executable
        const EXECUTABLE = 1 << 3;
        /// Readable code / writable data
        const READ_WRITE = 1 << 1;
    }
}

bitflags! {
    /// Upper flags nibble of a descriptor.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DescriptorFlags: u8 {
        /// 4 KiB granularity
        const GRANULARITY = 1 << 7;
        /// 32-bit default size (must stay clear for 64-bit code)
        const SIZE_32 = 1 << 6;
        /// 64-bit code segment
        const LONG_MODE = 1 << 5;
    }
}

// =============================================================================
// GDT Entry
// =============================================================================

/// One 8-byte descriptor.
#[repr(transparent)]
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct GdtEntry(u64);

impl GdtEntry {
    /// The mandatory null descriptor.
    pub const fn null() -> Self {
        Self(0)
    }

    /// Kernel code: present, ring 0, executable, readable, long mode.
    /// Access byte 0x9A, flags 0x20.
    pub const fn kernel_code() -> Self {
        Self::from_parts(0x9A, DescriptorFlags::LONG_MODE.bits())
    }

    /// Kernel data: present, ring 0, writable. Access byte 0x92.
    pub const fn kernel_data() -> Self {
        Self::from_parts(0x92, 0)
    }

    /// User data: present, ring 3, writable. Access byte 0xF2.
    pub const fn user_data() -> Self {
        Self::from_parts(0xF2, 0)
    }

    /// User code: present, ring 3, executable, readable, long mode.
    /// Access byte 0xFA, flags 0x20.
    pub const fn user_code() -> Self {
        Self::from_parts(0xFA, DescriptorFlags::LONG_MODE.bits())
    }

    /// Base and limit are zero: long-mode descriptors ignore both.
    const fn from_parts(access: u8, flags: u8) -> Self {
        Self(((access as u64) << 40) | (((flags & 0xF0) as u64) << 48))
    }

    /// Raw descriptor value.
    pub const fn raw(self) -> u64 {
        self.0
    }

    /// Access byte (bits 40-47).
    pub const fn access(self) -> u8 {
        (self.0 >> 40) as u8
    }

    /// Flags nibble (bits 52-55), left-aligned in a byte.
    pub const fn flags(self) -> u8 {
        ((self.0 >> 48) & 0xF0) as u8
    }
}

impl core::fmt::Debug for GdtEntry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "GdtEntry({:#018x})", self.0)
    }
}

// =============================================================================
// GDT Table
// =============================================================================

/// The complete descriptor table.
#[repr(C, align(8))]
pub struct Gdt {
    pub null: GdtEntry,
    pub kernel_code: GdtEntry,
    pub kernel_data: GdtEntry,
    /// Placed before user code; SYSRET derives both user selectors from
    /// one STAR field and expects this ordering.
    pub user_data: GdtEntry,
    pub user_code: GdtEntry,
    pub tss: TssDescriptor,
}

impl Gdt {
    /// Table with the standard segments and a null TSS descriptor.
    pub const fn new() -> Self {
        Self {
            null: GdtEntry::null(),
            kernel_code: GdtEntry::kernel_code(),
            kernel_data: GdtEntry::kernel_data(),
            user_data: GdtEntry::user_data(),
            user_code: GdtEntry::user_code(),
            tss: TssDescriptor::null(),
        }
    }

    /// Point the TSS descriptor at `tss`.
    pub fn set_tss(&mut self, tss: *const Tss) {
        self.tss = TssDescriptor::from_tss(tss);
    }

    /// Descriptor for LGDT.
    pub fn pointer(&self) -> GdtPointer {
        GdtPointer {
            limit: (size_of::<Self>() - 1) as u16,
            base: self as *const Self as u64,
        }
    }

    /// Load this GDT and reload every segment register to the kernel
    /// selectors.
    ///
    /// # Safety
    ///
    /// The table must stay at a stable address for the lifetime of the
    /// kernel. Must run with interrupts disabled.
    pub unsafe fn load(&self) {
        let pointer = self.pointer();
        unsafe {
            core::arch::asm!(
                "lgdt [{}]",
                in(reg) &pointer,
                options(readonly, nostack, preserves_flags),
            );

            // Far return to reload CS.
            core::arch::asm!(
                "push {kcs}",
                "lea {tmp}, [rip + 55f]",
                "push {tmp}",
                "retfq",
                "55:",
                kcs = in(reg) KERNEL_CS.raw() as u64,
                tmp = lateout(reg) _,
                options(preserves_flags),
            );

            // Data segments, plus null FS/GS (their bases come from MSRs).
            core::arch::asm!(
                "mov ds, {kds:x}",
                "mov es, {kds:x}",
                "mov ss, {kds:x}",
                "xor {zero:e}, {zero:e}",
                "mov fs, {zero:x}",
                "mov gs, {zero:x}",
                kds = in(reg) KERNEL_DS.raw(),
                zero = lateout(reg) _,
                options(preserves_flags),
            );
        }
    }
}

impl Default for Gdt {
    fn default() -> Self {
        Self::new()
    }
}

impl core::fmt::Debug for Gdt {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Gdt")
            .field("kernel_code", &self.kernel_code)
            .field("kernel_data", &self.kernel_data)
            .field("user_data", &self.user_data)
            .field("user_code", &self.user_code)
            .field("tss", &self.tss)
            .finish()
    }
}

/// Operand for the LGDT instruction.
#[repr(C, packed)]
#[derive(Clone, Copy)]
pub struct GdtPointer {
    /// Table size minus one.
    pub limit: u16,
    /// Table base address.
    pub base: u64,
}

impl core::fmt::Debug for GdtPointer {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("GdtPointer")
            .field("limit", &{ self.limit })
            .field("base", &format_args!("{:#018x}", { self.base }))
            .finish()
    }
}

// 5 slots of 8 bytes plus the 16-byte TSS descriptor.
static_assertions::const_assert_eq!(size_of::<Gdt>(), GDT_SLOT_COUNT * GDT_SLOT_SIZE);

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_size() {
        assert_eq!(size_of::<GdtEntry>(), 8);
        assert_eq!(size_of::<Gdt>(), 56);
    }

    #[test]
    fn test_access_bytes_match_layout() {
        assert_eq!(GdtEntry::kernel_code().access(), 0x9A);
        assert_eq!(GdtEntry::kernel_data().access(), 0x92);
        assert_eq!(GdtEntry::user_data().access(), 0xF2);
        assert_eq!(GdtEntry::user_code().access(), 0xFA);
    }

    #[test]
    fn test_long_mode_flag_on_code_only() {
        assert_eq!(GdtEntry::kernel_code().flags(), 0x20);
        assert_eq!(GdtEntry::user_code().flags(), 0x20);
        assert_eq!(GdtEntry::kernel_data().flags(), 0);
        assert_eq!(GdtEntry::user_data().flags(), 0);
    }

    #[test]
    fn test_table_layout() {
        let gdt = Gdt::new();
        assert_eq!(gdt.null.raw(), 0);
        let pointer = gdt.pointer();
        assert_eq!({ pointer.limit }, 55);
        assert_eq!({ pointer.base }, &gdt as *const Gdt as u64);
    }

    #[test]
    fn test_tss_descriptor_wires_base() {
        let tss = Tss::new();
        let mut gdt = Gdt::new();
        gdt.set_tss(&tss);
        assert_eq!(gdt.tss.base(), &tss as *const Tss as u64);
    }
}
