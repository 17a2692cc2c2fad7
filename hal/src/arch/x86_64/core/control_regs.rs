//! # Control Registers
//!
//! CR0-CR4 and XCR0 access, RFLAGS, interrupt-flag control and TLB
//! maintenance.
//!
//! CR2 is special: it is read-only in practice, latched by the CPU with
//! the faulting linear address on every page fault. CR3 writes flush all
//! non-global TLB entries as an architectural side effect, which is what
//! [`flush_tlb`] relies on.

use core::arch::asm;

use bitflags::bitflags;

// =============================================================================
// CR0
// =============================================================================

bitflags! {
    /// CR0 control bits
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Cr0: u64 {
        /// Protected mode enable
        const PROTECTED_MODE = 1 << 0;
        /// Monitor coprocessor (#NM on WAIT/FWAIT when TS set)
        const MONITOR_COPROCESSOR = 1 << 1;
        /// x87 emulation
        const EMULATE_COPROCESSOR = 1 << 2;
        /// Task switched
        const TASK_SWITCHED = 1 << 3;
        /// Numeric error reporting (native #MF)
        const NUMERIC_ERROR = 1 << 5;
        /// Supervisor write protection
        const WRITE_PROTECT = 1 << 16;
        /// Alignment checking (with RFLAGS.AC)
        const ALIGNMENT_MASK = 1 << 18;
        /// Global write-through disable
        const NOT_WRITE_THROUGH = 1 << 29;
        /// Global cache disable
        const CACHE_DISABLE = 1 << 30;
        /// Paging enable
        const PAGING = 1 << 31;
    }
}

impl Cr0 {
    /// Read CR0
    #[inline]
    pub fn read() -> Self {
        let value: u64;
        unsafe {
            asm!("mov {}, cr0", out(reg) value, options(nomem, nostack, preserves_flags));
        }
        Self::from_bits_retain(value)
    }

    /// Write CR0
    ///
    /// # Safety
    ///
    /// Clearing PG or PE while executing mapped code is immediately fatal.
    #[inline]
    pub unsafe fn write(self) {
        unsafe {
            asm!("mov cr0, {}", in(reg) self.bits(), options(nomem, nostack, preserves_flags));
        }
    }
}

// =============================================================================
// CR2
// =============================================================================

/// CR2 holds the linear address that caused the last page fault.
#[derive(Debug)]
pub struct Cr2;

impl Cr2 {
    /// Read the faulting address latched by the most recent #PF.
    #[inline]
    pub fn read() -> u64 {
        let value: u64;
        unsafe {
            asm!("mov {}, cr2", out(reg) value, options(nomem, nostack, preserves_flags));
        }
        value
    }
}

// =============================================================================
// CR3
// =============================================================================

/// Read CR3 (current top-level page table, physical).
#[inline]
pub fn read_cr3() -> u64 {
    let value: u64;
    unsafe {
        asm!("mov {}, cr3", out(reg) value, options(nomem, nostack, preserves_flags));
    }
    value
}

/// Write CR3.
///
/// Flushes every non-global TLB entry as a side effect.
///
/// # Safety
///
/// The value must point at a valid top-level page table that maps the
/// currently executing code.
#[inline]
pub unsafe fn write_cr3(value: u64) {
    unsafe {
        asm!("mov cr3, {}", in(reg) value, options(nomem, nostack, preserves_flags));
    }
}

/// Flush all non-global TLB entries by rewriting CR3.
///
/// # Safety
///
/// Same requirements as [`write_cr3`]; the current CR3 is assumed valid.
#[inline]
pub unsafe fn flush_tlb() {
    unsafe { write_cr3(read_cr3()) }
}

/// Invalidate the TLB entry covering a single linear address.
///
/// # Safety
///
/// Ring 0 only. Harmless for unmapped addresses.
#[inline]
pub unsafe fn invlpg(vaddr: u64) {
    unsafe {
        asm!("invlpg [{}]", in(reg) vaddr, options(nostack, preserves_flags));
    }
}

// =============================================================================
// CR4
// =============================================================================

bitflags! {
    /// CR4 control bits
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Cr4: u64 {
        /// Page size extensions
        const PAGE_SIZE_EXTENSION = 1 << 4;
        /// Physical address extension (mandatory in long mode)
        const PHYSICAL_ADDRESS_EXTENSION = 1 << 5;
        /// Machine check enable
        const MACHINE_CHECK = 1 << 6;
        /// Global pages enable
        const PAGE_GLOBAL = 1 << 7;
        /// OS supports FXSAVE/FXRSTOR
        const OSFXSR = 1 << 9;
        /// OS supports unmasked SIMD exceptions
        const OSXMMEXCPT = 1 << 10;
        /// OS supports XSAVE/XRSTOR and XCR0
        const OSXSAVE = 1 << 18;
        /// Supervisor-mode execution prevention
        const SMEP = 1 << 20;
        /// Supervisor-mode access prevention
        const SMAP = 1 << 21;
    }
}

impl Cr4 {
    /// Read CR4
    #[inline]
    pub fn read() -> Self {
        let value: u64;
        unsafe {
            asm!("mov {}, cr4", out(reg) value, options(nomem, nostack, preserves_flags));
        }
        Self::from_bits_retain(value)
    }

    /// Write CR4
    ///
    /// # Safety
    ///
    /// Setting bits the CPU does not support raises #GP.
    #[inline]
    pub unsafe fn write(self) {
        unsafe {
            asm!("mov cr4, {}", in(reg) self.bits(), options(nomem, nostack, preserves_flags));
        }
    }
}

// =============================================================================
// XCR0
// =============================================================================

bitflags! {
    /// XCR0 extended-state component bits
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Xcr0: u64 {
        /// x87 state (always set)
        const X87 = 1 << 0;
        /// SSE (XMM) state
        const SSE = 1 << 1;
        /// AVX (YMM) state
        const AVX = 1 << 2;
        /// AVX-512 opmask state
        const OPMASK = 1 << 5;
        /// AVX-512 upper-half ZMM state
        const ZMM_HI256 = 1 << 6;
        /// AVX-512 high ZMM registers
        const HI16_ZMM = 1 << 7;
    }
}

impl Xcr0 {
    /// Read XCR0 via XGETBV.
    ///
    /// # Safety
    ///
    /// CR4.OSXSAVE must be set, otherwise this raises #UD.
    #[inline]
    pub unsafe fn read() -> Self {
        let (lo, hi): (u32, u32);
        unsafe {
            asm!(
                "xgetbv",
                in("ecx") 0u32,
                out("eax") lo,
                out("edx") hi,
                options(nomem, nostack, preserves_flags),
            );
        }
        Self::from_bits_retain(((hi as u64) << 32) | lo as u64)
    }

    /// Write XCR0 via XSETBV.
    ///
    /// # Safety
    ///
    /// CR4.OSXSAVE must be set and the bit combination must be valid for
    /// this CPU.
    #[inline]
    pub unsafe fn write(self) {
        let lo = self.bits() as u32;
        let hi = (self.bits() >> 32) as u32;
        unsafe {
            asm!(
                "xsetbv",
                in("ecx") 0u32,
                in("eax") lo,
                in("edx") hi,
                options(nomem, nostack, preserves_flags),
            );
        }
    }
}

// =============================================================================
// RFLAGS
// =============================================================================

bitflags! {
    /// RFLAGS register
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct RFlags: u64 {
        /// Carry flag
        const CARRY = 1 << 0;
        /// Parity flag
        const PARITY = 1 << 2;
        /// Auxiliary carry flag
        const AUXILIARY_CARRY = 1 << 4;
        /// Zero flag
        const ZERO = 1 << 6;
        /// Sign flag
        const SIGN = 1 << 7;
        /// Trap flag (single step)
        const TRAP = 1 << 8;
        /// Interrupt enable flag
        const INTERRUPT = 1 << 9;
        /// Direction flag
        const DIRECTION = 1 << 10;
        /// Overflow flag
        const OVERFLOW = 1 << 11;
        /// Resume flag
        const RESUME = 1 << 16;
        /// CPUID availability toggle
        const ID = 1 << 21;
    }
}

impl RFlags {
    /// Read RFLAGS
    #[inline]
    pub fn read() -> Self {
        let value: u64;
        unsafe {
            asm!("pushfq", "pop {}", out(reg) value, options(nomem, preserves_flags));
        }
        Self::from_bits_retain(value)
    }
}

/// Read the current stack pointer.
#[inline]
pub fn read_rsp() -> u64 {
    let rsp: u64;
    unsafe {
        asm!("mov {}, rsp", out(reg) rsp, options(nomem, nostack, preserves_flags));
    }
    rsp
}

// =============================================================================
// Interrupt Flag
// =============================================================================

/// Clear RFLAGS.IF.
#[inline]
pub fn disable_interrupts() {
    unsafe {
        asm!("cli", options(nomem, nostack));
    }
}

/// Set RFLAGS.IF.
///
/// # Safety
///
/// The IDT must be loaded and the interrupt controllers configured, or the
/// first delivered interrupt triple-faults the CPU.
#[inline]
pub unsafe fn enable_interrupts() {
    unsafe {
        asm!("sti", options(nomem, nostack));
    }
}

/// Whether RFLAGS.IF is currently set on this CPU.
#[inline]
pub fn are_interrupts_enabled() -> bool {
    RFlags::read().contains(RFlags::INTERRUPT)
}

/// Halt until the next interrupt.
#[inline]
pub fn halt() {
    unsafe {
        asm!("hlt", options(nomem, nostack, preserves_flags));
    }
}

/// Disable interrupts and halt forever.
///
/// Used from unrecoverable fault paths. Performs no further kernel state
/// updates before parking the CPU.
#[inline]
pub fn halt_forever() -> ! {
    loop {
        unsafe {
            asm!("cli", "hlt", options(nomem, nostack));
        }
    }
}

/// Trigger a debug breakpoint (#BP).
#[inline]
pub fn breakpoint() {
    unsafe {
        asm!("int3", options(nomem, nostack));
    }
}

// =============================================================================
// TSC
// =============================================================================

/// Read the time stamp counter.
#[inline]
pub fn read_tsc() -> u64 {
    let (lo, hi): (u32, u32);
    unsafe {
        asm!(
            "rdtsc",
            out("eax") lo,
            out("edx") hi,
            options(nomem, nostack, preserves_flags),
        );
    }
    ((hi as u64) << 32) | lo as u64
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rflags_read() {
        // Reserved bit 1 is architecturally always set.
        let flags = RFlags::read();
        assert_ne!(flags.bits(), 0);
        assert_ne!(flags.bits() & 0x2, 0);
    }

    #[test]
    fn test_read_rsp_nonzero() {
        assert_ne!(read_rsp(), 0);
    }

    #[test]
    fn test_tsc_monotonic_enough() {
        let a = read_tsc();
        let b = read_tsc();
        // Counters can be virtualized but never run backwards within a thread.
        assert!(b >= a);
    }
}
