//! # Interrupt Dispatch
//!
//! Every ISR stub funnels into [`dispatch_interrupt`] with a pointer to
//! the uniform frame. Dispatch is a table lookup: a dense 256-slot array
//! of handler pointers in static storage, one atomic pointer-sized word
//! per vector, which is what makes reading it from inside an ISR safe.
//!
//! ## Default policy
//!
//! - Vectors 0-31 with no handler are first offered to the external
//!   exception dispatcher. If it declines, the fault is printed and the
//!   CPU halts forever.
//! - Vectors 32-255 with no handler are dropped silently; a late or
//!   spurious device interrupt is not an error.
//!
//! EOI is the handler's job, never the dispatcher's.

use core::sync::atomic::{AtomicPtr, Ordering};

use super::frame::{InterruptFrame, PageFaultErrorCode};
use crate::arch::x86_64::core::control_regs::{halt_forever, Cr2};

// =============================================================================
// Handler Table
// =============================================================================

/// Number of interrupt vectors.
pub const VECTOR_COUNT: usize = 256;

/// A registered interrupt handler.
///
/// System-V AMD64: the frame pointer arrives in RDI.
pub type InterruptHandler = extern "C" fn(&mut InterruptFrame);

/// Dense handler table, one slot per vector. Null means default policy.
///
/// Lives in zeroed static storage; usable before any allocator exists.
static HANDLER_TABLE: [AtomicPtr<()>; VECTOR_COUNT] = {
    #[allow(clippy::declare_interior_mutable_const)]
    const NULL: AtomicPtr<()> = AtomicPtr::new(core::ptr::null_mut());
    [NULL; VECTOR_COUNT]
};

/// Install `handler` for `vector`.
///
/// Out-of-range vectors are a silent no-op. Each slot write is a single
/// atomic store; callers that swap handlers at runtime serialize
/// themselves (typically by registering at init or with interrupts
/// disabled locally).
pub fn register_handler(vector: usize, handler: InterruptHandler) {
    if vector < VECTOR_COUNT {
        HANDLER_TABLE[vector].store(handler as *mut (), Ordering::Release);
    }
}

/// Remove the handler for `vector`. Out-of-range is a silent no-op.
pub fn unregister_handler(vector: usize) {
    if vector < VECTOR_COUNT {
        HANDLER_TABLE[vector].store(core::ptr::null_mut(), Ordering::Release);
    }
}

/// Currently registered handler, if any.
pub fn handler_for(vector: usize) -> Option<InterruptHandler> {
    if vector >= VECTOR_COUNT {
        return None;
    }
    let ptr = HANDLER_TABLE[vector].load(Ordering::Acquire);
    if ptr.is_null() {
        None
    } else {
        // SAFETY: only `register_handler` stores non-null values, and it
        // only ever stores `InterruptHandler` pointers.
        Some(unsafe { core::mem::transmute::<*mut (), InterruptHandler>(ptr) })
    }
}

/// Reset all 256 slots to the default policy.
///
/// Runs once during stage 1 before any handler can be registered.
pub fn clear_handler_table() {
    for slot in &HANDLER_TABLE {
        slot.store(core::ptr::null_mut(), Ordering::Release);
    }
}

// =============================================================================
// External Exception Dispatcher
// =============================================================================

/// Hook into the kernel's exception-handling subsystem.
///
/// Returns true when the exception was handled and execution should
/// resume at the (possibly rewritten) frame.
pub type ExceptionDispatcher = fn(&mut InterruptFrame, u8) -> bool;

static EXCEPTION_DISPATCHER: AtomicPtr<()> = AtomicPtr::new(core::ptr::null_mut());

/// Wire in the external exception dispatcher. Passing `None` detaches it.
pub fn set_exception_dispatcher(dispatcher: Option<ExceptionDispatcher>) {
    let ptr = match dispatcher {
        Some(f) => f as *mut (),
        None => core::ptr::null_mut(),
    };
    EXCEPTION_DISPATCHER.store(ptr, Ordering::Release);
}

fn exception_dispatcher() -> Option<ExceptionDispatcher> {
    let ptr = EXCEPTION_DISPATCHER.load(Ordering::Acquire);
    if ptr.is_null() {
        None
    } else {
        Some(unsafe { core::mem::transmute::<*mut (), ExceptionDispatcher>(ptr) })
    }
}

// =============================================================================
// Dispatcher
// =============================================================================

/// Single entry point invoked by `isr_common`.
///
/// # Safety
///
/// Called from the ISR stubs with a valid frame pointer. Callable from
/// Rust for testing with a fabricated frame.
pub extern "C" fn dispatch_interrupt(frame: &mut InterruptFrame) {
    let vector = frame.vector;
    if vector >= VECTOR_COUNT as u64 {
        // Never produced by the stubs; a corrupt frame is not worth
        // dereferencing further.
        return;
    }

    if let Some(handler) = handler_for(vector as usize) {
        handler(frame);
        return;
    }

    default_handler(frame, vector as u8);
}

/// Policy for vectors without a registered handler.
fn default_handler(frame: &mut InterruptFrame, vector: u8) {
    if vector >= 32 {
        // Spurious or not-yet-claimed device interrupt.
        return;
    }

    if let Some(dispatch) = exception_dispatcher() {
        if dispatch(frame, vector) {
            return;
        }
    }

    log_fatal_exception(frame, vector);
    halt_forever();
}

// =============================================================================
// Exception Names
// =============================================================================

/// Architectural name for an exception vector.
pub fn exception_name(vector: u8) -> &'static str {
    match vector {
        0 => "Divide by Zero",
        1 => "Debug",
        2 => "Non-Maskable Interrupt",
        3 => "Breakpoint",
        4 => "Overflow",
        5 => "Bound Range Exceeded",
        6 => "Invalid Opcode",
        7 => "Device Not Available",
        8 => "Double Fault",
        9 => "Coprocessor Segment Overrun",
        10 => "Invalid TSS",
        11 => "Segment Not Present",
        12 => "Stack Segment Fault",
        13 => "General Protection Fault",
        14 => "Page Fault",
        16 => "x87 Floating-Point Error",
        17 => "Alignment Check",
        18 => "Machine Check",
        19 => "SIMD Floating-Point",
        20 => "Virtualization",
        21 => "Control Protection",
        _ => "Unknown",
    }
}

/// Print the fatal-exception diagnostic.
fn log_fatal_exception(frame: &InterruptFrame, vector: u8) {
    log::error!("EXCEPTION {:04X}: {}", vector, exception_name(vector));
    log::error!(
        "  error={:#06x}  RIP={:#018x}  RSP={:#018x}",
        frame.error_code,
        frame.rip,
        frame.rsp
    );
    log::error!("  CS={:#06x}  SS={:#06x}", frame.cs, frame.ss);
    if vector == 14 {
        let cr2 = Cr2::read();
        let code = PageFaultErrorCode::from_bits_truncate(frame.error_code);
        log::error!("  CR2={:#018x} ({})", cr2, code.description());
    }
    log::error!("{}", frame);
}

// =============================================================================
// Tests
// =============================================================================

/// Serializes every test that mutates the process-global handler table.
#[cfg(test)]
pub(crate) static TEST_LOCK: std::sync::Mutex<()> = std::sync::Mutex::new(());

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

    use super::TEST_LOCK as TABLE_LOCK;

    fn frame_for(vector: u64) -> InterruptFrame {
        let mut frame: InterruptFrame = unsafe { core::mem::zeroed() };
        frame.vector = vector;
        frame.cs = 0x08;
        frame.ss = 0x10;
        frame
    }

    static SEEN_VECTOR: AtomicU64 = AtomicU64::new(u64::MAX);

    extern "C" fn recording_handler(frame: &mut InterruptFrame) {
        SEEN_VECTOR.store(frame.vector, Ordering::SeqCst);
    }

    #[test]
    fn test_registered_handler_receives_frame() {
        let _guard = TABLE_LOCK.lock().unwrap();
        clear_handler_table();
        register_handler(0x41, recording_handler);

        let mut frame = frame_for(0x41);
        dispatch_interrupt(&mut frame);
        assert_eq!(SEEN_VECTOR.load(Ordering::SeqCst), 0x41);

        unregister_handler(0x41);
        assert!(handler_for(0x41).is_none());
    }

    #[test]
    fn test_unhandled_device_vector_is_dropped() {
        let _guard = TABLE_LOCK.lock().unwrap();
        clear_handler_table();
        let mut frame = frame_for(0x80);
        // Must simply return.
        dispatch_interrupt(&mut frame);
    }

    #[test]
    fn test_out_of_range_register_is_noop() {
        let _guard = TABLE_LOCK.lock().unwrap();
        clear_handler_table();
        register_handler(256, recording_handler);
        register_handler(usize::MAX, recording_handler);
        for v in 0..VECTOR_COUNT {
            assert!(handler_for(v).is_none(), "slot {v} was written");
        }
    }

    static DISPATCHER_CALLS: AtomicUsize = AtomicUsize::new(0);

    fn accepting_dispatcher(_frame: &mut InterruptFrame, vector: u8) -> bool {
        assert!(vector < 32);
        DISPATCHER_CALLS.fetch_add(1, Ordering::SeqCst);
        true
    }

    #[test]
    fn test_exception_offered_to_external_dispatcher() {
        let _guard = TABLE_LOCK.lock().unwrap();
        clear_handler_table();
        set_exception_dispatcher(Some(accepting_dispatcher));

        let mut frame = frame_for(13);
        frame.error_code = 0x10;
        dispatch_interrupt(&mut frame);
        assert_eq!(DISPATCHER_CALLS.load(Ordering::SeqCst), 1);

        set_exception_dispatcher(None);
    }

    #[test]
    fn test_exception_names() {
        assert_eq!(exception_name(0), "Divide by Zero");
        assert_eq!(exception_name(8), "Double Fault");
        assert_eq!(exception_name(14), "Page Fault");
        assert_eq!(exception_name(21), "Control Protection");
        assert_eq!(exception_name(15), "Unknown");
        assert_eq!(exception_name(31), "Unknown");
    }
}
