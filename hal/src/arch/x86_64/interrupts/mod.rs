//! # Interrupt Framework
//!
//! IDT construction, the ISR stub table, and the single dispatcher all
//! 256 vectors funnel into.
//!
//! ## Vector Allocation
//!
//! ```text
//! Vector Range   Purpose
//! ─────────────────────────────────────────────
//! 0x00-0x1F      CPU exceptions
//! 0x20-0x2F      ISA IRQs 0-15 via the I/O APIC
//! 0x40           Scheduler tick (APIC timer)
//! 0xFA-0xFD      IPI block
//! 0xFE           APIC error
//! 0xFF           APIC spurious
//! ─────────────────────────────────────────────
//! ```
//!
//! The dispatcher runs with IF clear: every gate is an interrupt gate.
//! Handlers that want nesting re-enable interrupts themselves.

pub mod dispatch;
pub mod entries;
pub mod frame;
pub mod idt;
pub mod stubs;

pub use dispatch::{
    clear_handler_table, dispatch_interrupt, exception_name, register_handler,
    set_exception_dispatcher, unregister_handler, ExceptionDispatcher, InterruptHandler,
    VECTOR_COUNT,
};
pub use entries::{GateOptions, GateType, IdtEntry};
pub use frame::{InterruptFrame, PageFaultErrorCode, INTERRUPT_FRAME_SIZE};
pub use idt::{set_vector_ist, IdtPointer, IDT_ENTRIES};

// =============================================================================
// Well-Known Vectors
// =============================================================================

/// First external interrupt vector; 0x00-0x1F belong to the CPU.
pub const FIRST_EXTERNAL_VECTOR: u8 = 0x20;

/// ISA IRQ base: IRQ n arrives at vector `ISA_IRQ_BASE + n`.
pub const ISA_IRQ_BASE: u8 = 0x20;

/// APIC timer tick, the scheduler's heartbeat.
pub const TIMER_VECTOR: u8 = 0x40;

/// Call-function IPI.
pub const CALL_VECTOR: u8 = 0xFA;

/// Stop/halt IPI.
pub const STOP_VECTOR: u8 = 0xFB;

/// TLB shootdown IPI.
pub const TLB_VECTOR: u8 = 0xFC;

/// Reschedule IPI.
pub const RESCHEDULE_VECTOR: u8 = 0xFD;

/// APIC error interrupt.
pub const ERROR_VECTOR: u8 = 0xFE;

/// APIC spurious interrupt. The low nibble must be all-ones on older
/// parts, which pins it to 0xFF.
pub const SPURIOUS_VECTOR: u8 = 0xFF;

// =============================================================================
// Initialization
// =============================================================================

/// Stage-1 interrupt setup on the BSP: reset the handler table, build the
/// IDT from the stub table and load it.
///
/// # Safety
///
/// Single-threaded, interrupts disabled, GDT already loaded.
pub unsafe fn init() {
    dispatch::clear_handler_table();
    unsafe {
        idt::init();
    }
}

/// Load the shared IDT on an application processor.
///
/// # Safety
///
/// AP bring-up path only; the BSP must have completed [`init`].
pub unsafe fn init_for_ap() {
    unsafe {
        idt::load_on_ap();
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vector_map_is_disjoint() {
        assert!(ISA_IRQ_BASE >= FIRST_EXTERNAL_VECTOR);
        assert!(TIMER_VECTOR > ISA_IRQ_BASE + 15);
        assert!(CALL_VECTOR > TIMER_VECTOR);
        assert_eq!(SPURIOUS_VECTOR & 0x0F, 0x0F);
    }
}
