//! # Interrupt Frame
//!
//! The uniform stack frame every ISR stub hands to the dispatcher. The
//! stub synthesizes a zero error code for vectors where the CPU does not
//! push one, so the layout is identical for all 256 vectors.
//!
//! ## Layout (ascending addresses, RSP on dispatcher entry at `es`)
//!
//! ```text
//! es ds r15 r14 r13 r12 r11 r10 r9 r8 rbp rdi rsi rdx rcx rbx rax
//! vector error_code rip cs rflags rsp ss
//! ```

use core::fmt;

use bitflags::bitflags;

use crate::arch::x86_64::core::control_regs::RFlags;

/// Frame built by the ISR stubs plus the CPU's interrupt push.
#[derive(Clone, Copy)]
#[repr(C)]
pub struct InterruptFrame {
    /// ES at interrupt time (zero-extended)
    pub es: u64,
    /// DS at interrupt time (zero-extended)
    pub ds: u64,
    pub r15: u64,
    pub r14: u64,
    pub r13: u64,
    pub r12: u64,
    pub r11: u64,
    pub r10: u64,
    pub r9: u64,
    pub r8: u64,
    pub rbp: u64,
    pub rdi: u64,
    pub rsi: u64,
    pub rdx: u64,
    pub rcx: u64,
    pub rbx: u64,
    pub rax: u64,
    /// Vector number, pushed by the stub
    pub vector: u64,
    /// CPU error code, or a stub-synthesized zero
    pub error_code: u64,
    /// Interrupted instruction pointer
    pub rip: u64,
    /// Code segment (zero-extended)
    pub cs: u64,
    /// RFLAGS at interrupt time
    pub rflags: u64,
    /// Interrupted stack pointer
    pub rsp: u64,
    /// Stack segment (zero-extended)
    pub ss: u64,
}

impl InterruptFrame {
    /// Privilege level the CPU was running at.
    #[inline]
    pub const fn privilege_level(&self) -> u8 {
        (self.cs & 0x3) as u8
    }

    /// Whether the interrupt arrived in ring 0.
    #[inline]
    pub const fn is_kernel_mode(&self) -> bool {
        self.privilege_level() == 0
    }

    /// RFLAGS as typed flags.
    #[inline]
    pub const fn flags(&self) -> RFlags {
        RFlags::from_bits_truncate(self.rflags)
    }

    /// Whether interrupts were enabled when this frame was captured.
    #[inline]
    pub const fn interrupts_were_enabled(&self) -> bool {
        self.rflags & (1 << 9) != 0
    }
}

impl fmt::Debug for InterruptFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InterruptFrame")
            .field("vector", &format_args!("{:#04x}", self.vector))
            .field("error_code", &format_args!("{:#x}", self.error_code))
            .field("rip", &format_args!("{:#018x}", self.rip))
            .field("cs", &format_args!("{:#06x}", self.cs))
            .field("rflags", &format_args!("{:#018x}", self.rflags))
            .field("rsp", &format_args!("{:#018x}", self.rsp))
            .field("ss", &format_args!("{:#06x}", self.ss))
            .finish()
    }
}

impl fmt::Display for InterruptFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "  RAX: {:#018x}  RBX: {:#018x}", self.rax, self.rbx)?;
        writeln!(f, "  RCX: {:#018x}  RDX: {:#018x}", self.rcx, self.rdx)?;
        writeln!(f, "  RSI: {:#018x}  RDI: {:#018x}", self.rsi, self.rdi)?;
        writeln!(f, "  RBP: {:#018x}  R8:  {:#018x}", self.rbp, self.r8)?;
        writeln!(f, "  R9:  {:#018x}  R10: {:#018x}", self.r9, self.r10)?;
        writeln!(f, "  R11: {:#018x}  R12: {:#018x}", self.r11, self.r12)?;
        writeln!(f, "  R13: {:#018x}  R14: {:#018x}", self.r13, self.r14)?;
        write!(f, "  R15: {:#018x}", self.r15)
    }
}

// 24 qwords; the stub and dispatcher agree on this size.
pub const INTERRUPT_FRAME_SIZE: usize = 192;
static_assertions::const_assert_eq!(
    core::mem::size_of::<InterruptFrame>(),
    INTERRUPT_FRAME_SIZE
);

// =============================================================================
// Page Fault Error Code
// =============================================================================

bitflags! {
    /// #PF error code bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PageFaultErrorCode: u64 {
        /// Protection violation (set) vs. non-present page (clear)
        const PROTECTION_VIOLATION = 1 << 0;
        /// Write access (set) vs. read (clear)
        const WRITE = 1 << 1;
        /// Fault taken in user mode
        const USER_MODE = 1 << 2;
        /// Reserved page-table bit was set
        const RESERVED_WRITE = 1 << 3;
        /// Instruction fetch
        const INSTRUCTION_FETCH = 1 << 4;
    }
}

impl PageFaultErrorCode {
    /// Short human-readable cause.
    pub fn description(&self) -> &'static str {
        match (
            self.contains(Self::PROTECTION_VIOLATION),
            self.contains(Self::WRITE),
        ) {
            (false, false) => "read of non-present page",
            (false, true) => "write to non-present page",
            (true, false) => "read protection violation",
            (true, true) => "write protection violation",
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use core::mem::offset_of;

    #[test]
    fn test_frame_size() {
        assert_eq!(core::mem::size_of::<InterruptFrame>(), 192);
    }

    #[test]
    fn test_field_offsets_match_stub_contract() {
        assert_eq!(offset_of!(InterruptFrame, es), 0);
        assert_eq!(offset_of!(InterruptFrame, ds), 8);
        assert_eq!(offset_of!(InterruptFrame, r15), 16);
        assert_eq!(offset_of!(InterruptFrame, rax), 128);
        assert_eq!(offset_of!(InterruptFrame, vector), 136);
        assert_eq!(offset_of!(InterruptFrame, error_code), 144);
        assert_eq!(offset_of!(InterruptFrame, rip), 152);
        assert_eq!(offset_of!(InterruptFrame, ss), 184);
    }

    #[test]
    fn test_privilege_helpers() {
        let mut frame: InterruptFrame = unsafe { core::mem::zeroed() };
        frame.cs = 0x08;
        assert!(frame.is_kernel_mode());
        frame.cs = 0x23;
        assert_eq!(frame.privilege_level(), 3);
    }

    #[test]
    fn test_page_fault_description() {
        let code = PageFaultErrorCode::from_bits_truncate(0x2);
        assert_eq!(code.description(), "write to non-present page");
    }
}
