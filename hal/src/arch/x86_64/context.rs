//! # Context Switch
//!
//! The saved register set a thread parks in while off-CPU, and the
//! assembly that moves a CPU between two of them.
//!
//! Only callee-saved state lives here: a context switch is a function
//! call from the switching thread's point of view, so the caller-saved
//! registers are already dead. RIP is the return address of the
//! `switch_context` call; resuming a context is a jump back to it.
//!
//! The extended (FPU/SSE/AVX) area trails the fixed header at a 64-byte
//! boundary. The scheduler saves and restores it explicitly around
//! switches that need it; the switch primitive itself touches only the
//! integer state.

use core::arch::global_asm;
use core::mem::offset_of;

use super::core::fpu;

// =============================================================================
// Context Layout
// =============================================================================

/// Saved integer state of an off-CPU thread.
#[repr(C, align(64))]
#[derive(Debug, Clone, Copy)]
pub struct CpuContext {
    pub rbx: u64,
    pub rbp: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
    /// Stack pointer after the switch call returns
    pub rsp: u64,
    /// Resume address
    pub rip: u64,
    pub rflags: u64,
    /// Address space this thread runs in. The switch primitive does not
    /// touch CR3; the scheduler installs this value before resuming a
    /// thread from a different address space.
    pub cr3: u64,
}

impl CpuContext {
    /// Zeroed context. The scheduler fills in stack, entry and CR3.
    pub const fn new() -> Self {
        Self {
            rbx: 0,
            rbp: 0,
            r12: 0,
            r13: 0,
            r14: 0,
            r15: 0,
            rsp: 0,
            rip: 0,
            rflags: 0,
            cr3: 0,
        }
    }
}

impl Default for CpuContext {
    fn default() -> Self {
        Self::new()
    }
}

/// Offset of the extended-state area within a context allocation.
pub const EXTENDED_STATE_OFFSET: usize = 128;

const _: () = {
    assert!(core::mem::size_of::<CpuContext>() <= EXTENDED_STATE_OFFSET);
    assert!(EXTENDED_STATE_OFFSET % fpu::EXTENDED_STATE_ALIGN == 0);
};

/// Bytes a caller must reserve for one full context: the fixed header
/// plus the CPU's extended-state area.
pub fn context_size() -> usize {
    EXTENDED_STATE_OFFSET + fpu::extended_state_size()
}

/// Extended-state area of a context allocation.
///
/// # Safety
///
/// `context` must point at an allocation of at least [`context_size`]
/// bytes, 64-byte aligned.
pub unsafe fn extended_state_area(context: *mut CpuContext) -> *mut u8 {
    unsafe { (context as *mut u8).add(EXTENDED_STATE_OFFSET) }
}

// =============================================================================
// Switch Primitives
// =============================================================================

global_asm!(
    r#"
.section .text

// context_switch(old: rdi, new: rsi)
// Saves the callee-saved state into *old and resumes *new. Returns when
// someone switches back to *old.
.global context_switch
context_switch:
    mov [rdi + {rbx}], rbx
    mov [rdi + {rbp}], rbp
    mov [rdi + {r12}], r12
    mov [rdi + {r13}], r13
    mov [rdi + {r14}], r14
    mov [rdi + {r15}], r15
    lea rax, [rsp + 8]
    mov [rdi + {rsp}], rax
    mov rax, [rsp]
    mov [rdi + {rip}], rax
    pushfq
    pop rax
    mov [rdi + {rflags}], rax

// context_load(_, new: rsi)
// Resume *new without saving anything. First dispatch onto a thread.
// context_switch falls through here on purpose.
.global context_load
context_load:
    mov rbx, [rsi + {rbx}]
    mov rbp, [rsi + {rbp}]
    mov r12, [rsi + {r12}]
    mov r13, [rsi + {r13}]
    mov r14, [rsi + {r14}]
    mov r15, [rsi + {r15}]
    mov rsp, [rsi + {rsp}]
    mov rax, [rsi + {rflags}]
    push rax
    popfq
    mov rax, [rsi + {rip}]
    jmp rax

// context_resume_frame(frame: rdi) -> !
// Resume a full interrupt-frame image: every GPR, segments, RIP, RSP and
// RFLAGS, via iretq. The unwinder uses this to land on a rewritten frame.
.global context_resume_frame
context_resume_frame:
    mov rsp, rdi
    pop rax
    mov es, ax
    pop rax
    mov ds, ax
    pop r15
    pop r14
    pop r13
    pop r12
    pop r11
    pop r10
    pop r9
    pop r8
    pop rbp
    pop rdi
    pop rsi
    pop rdx
    pop rcx
    pop rbx
    pop rax
    add rsp, 16
    iretq
"#,
    rbx = const offset_of!(CpuContext, rbx),
    rbp = const offset_of!(CpuContext, rbp),
    r12 = const offset_of!(CpuContext, r12),
    r13 = const offset_of!(CpuContext, r13),
    r14 = const offset_of!(CpuContext, r14),
    r15 = const offset_of!(CpuContext, r15),
    rsp = const offset_of!(CpuContext, rsp),
    rip = const offset_of!(CpuContext, rip),
    rflags = const offset_of!(CpuContext, rflags),
);

extern "C" {
    fn context_switch(old: *mut CpuContext, new: *const CpuContext);
    fn context_load(unused: usize, new: *const CpuContext) -> !;
    fn context_resume_frame(frame: *mut super::interrupts::InterruptFrame) -> !;
}

/// Save the current thread into `old` and resume `new`.
///
/// Does not return until another CPU (or this one, later) switches back
/// into `old`.
///
/// # Safety
///
/// Both contexts must be valid; `new` must hold a resumable state with a
/// live stack and, when its CR3 differs, a page table mapping the
/// current code.
#[inline]
pub unsafe fn switch_context(old: *mut CpuContext, new: *const CpuContext) {
    unsafe { context_switch(old, new) }
}

/// Resume `new` without saving the current state. Used for the first
/// jump onto a thread; the calling stack is abandoned.
///
/// # Safety
///
/// Same as [`switch_context`], and the caller's execution state is lost.
#[inline]
pub unsafe fn load_context(new: *const CpuContext) -> ! {
    unsafe { context_load(0, new) }
}

/// Resume a full interrupt-frame image. Never returns.
///
/// # Safety
///
/// The frame must be a complete, coherent register image in writable
/// memory, with a kernel code selector and a valid target RIP/RSP.
#[inline]
pub unsafe fn resume_frame(frame: *mut super::interrupts::InterruptFrame) -> ! {
    unsafe { context_resume_frame(frame) }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_context_header_fits_below_extended_area() {
        assert!(core::mem::size_of::<CpuContext>() <= EXTENDED_STATE_OFFSET);
        assert_eq!(core::mem::align_of::<CpuContext>(), 64);
    }

    #[test]
    fn test_context_size_covers_fxsave_minimum() {
        assert!(context_size() >= EXTENDED_STATE_OFFSET + 512);
    }

    #[test]
    fn test_switch_and_return() {
        // Switch to a context that immediately switches back. Verifies
        // the save/restore pair end to end on the host.
        use std::sync::atomic::{AtomicBool, Ordering};

        static mut MAIN: CpuContext = CpuContext::new();
        static mut OTHER: CpuContext = CpuContext::new();
        static mut SCRATCH_STACK: [u8; 16 * 1024] = [0; 16 * 1024];
        static VISITED: AtomicBool = AtomicBool::new(false);

        extern "C" fn visit() -> ! {
            VISITED.store(true, Ordering::SeqCst);
            unsafe {
                context_switch(&raw mut OTHER, &raw const MAIN);
            }
            unreachable!();
        }

        unsafe {
            let base = &raw mut SCRATCH_STACK as *mut u8 as u64;
            let top = (base + 16 * 1024) & !0xF;
            (*(&raw mut OTHER)).rsp = top - 8;
            (*(&raw mut OTHER)).rip = visit as u64;
            (*(&raw mut OTHER)).rflags =
                crate::arch::x86_64::core::control_regs::RFlags::read().bits();

            context_switch(&raw mut MAIN, &raw const OTHER);
            assert!(VISITED.load(Ordering::SeqCst));
        }
    }
}
