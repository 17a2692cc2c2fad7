//! # Local APIC
//!
//! Per-CPU interrupt controller driver, xAPIC (memory-mapped) mode. Each
//! CPU programs its own registers; there is no cross-CPU sharing and no
//! locking here.
//!
//! Owns three jobs: acknowledge interrupts (EOI), run the periodic
//! scheduler timer, and push IPIs through the ICR.

use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use crate::arch::x86_64::core::{cpuid, msr};
use crate::arch::x86_64::interrupts::{
    self, InterruptFrame, ERROR_VECTOR, SPURIOUS_VECTOR, TIMER_VECTOR,
};
use crate::arch::x86_64::timers;

// =============================================================================
// Errors
// =============================================================================

/// APIC failure modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApicError {
    /// CPUID reports no local APIC
    NotPresent,
    /// BSP init ran twice
    AlreadyInitialized,
    /// AP init before BSP init
    NotInitialized,
    /// No I/O APIC owns the requested interrupt
    NoSuchGsi,
    /// Redirection entry index out of range
    InvalidRedirectionEntry,
    /// Registration table is full
    TooManyIoApics,
}

impl core::fmt::Display for ApicError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            ApicError::NotPresent => write!(f, "local APIC not present"),
            ApicError::AlreadyInitialized => write!(f, "APIC already initialized"),
            ApicError::NotInitialized => write!(f, "APIC not initialized"),
            ApicError::NoSuchGsi => write!(f, "no I/O APIC owns this interrupt"),
            ApicError::InvalidRedirectionEntry => write!(f, "redirection entry out of range"),
            ApicError::TooManyIoApics => write!(f, "I/O APIC table full"),
        }
    }
}

// =============================================================================
// Registers (xAPIC MMIO offsets)
// =============================================================================

/// Local APIC register offsets.
pub mod registers {
    /// APIC ID
    pub const ID: u32 = 0x020;
    /// Version
    pub const VERSION: u32 = 0x030;
    /// Task priority
    pub const TPR: u32 = 0x080;
    /// End of interrupt
    pub const EOI: u32 = 0x0B0;
    /// Spurious interrupt vector + software enable
    pub const SVR: u32 = 0x0F0;
    /// Error status
    pub const ESR: u32 = 0x280;
    /// Interrupt command, low half (write dispatches)
    pub const ICR_LOW: u32 = 0x300;
    /// Interrupt command, high half (destination)
    pub const ICR_HIGH: u32 = 0x310;
    /// LVT timer
    pub const LVT_TIMER: u32 = 0x320;
    /// LVT thermal sensor
    pub const LVT_THERMAL: u32 = 0x330;
    /// LVT performance counters
    pub const LVT_PERF: u32 = 0x340;
    /// LVT LINT0
    pub const LVT_LINT0: u32 = 0x350;
    /// LVT LINT1
    pub const LVT_LINT1: u32 = 0x360;
    /// LVT error
    pub const LVT_ERROR: u32 = 0x370;
    /// Timer initial count
    pub const TIMER_ICR: u32 = 0x380;
    /// Timer current count
    pub const TIMER_CCR: u32 = 0x390;
    /// Timer divide configuration
    pub const TIMER_DCR: u32 = 0x3E0;
}

/// LVT mask bit.
const LVT_MASKED: u32 = 1 << 16;

/// LVT timer periodic mode.
const LVT_TIMER_PERIODIC: u32 = 1 << 17;

/// SVR software-enable bit.
const SVR_ENABLE: u32 = 1 << 8;

/// IA32_APIC_BASE global enable.
const APIC_BASE_ENABLE: u64 = 1 << 11;

/// Divide configuration for divide-by-16.
const DIVIDE_BY_16: u32 = 0b0011;

/// Effective prescaler matching [`DIVIDE_BY_16`].
const TIMER_DIVISOR: u64 = 16;

// =============================================================================
// State
// =============================================================================

/// Default xAPIC MMIO base.
pub const LAPIC_BASE_DEFAULT: u64 = 0xFEE0_0000;

static LAPIC_BASE: AtomicU64 = AtomicU64::new(LAPIC_BASE_DEFAULT);
static INITIALIZED: AtomicBool = AtomicBool::new(false);

/// Timer input frequency after the divider, in Hz.
static TIMER_FREQUENCY: AtomicU64 = AtomicU64::new(0);

/// Whether the frequency came from a real reference clock.
static TIMER_ACCURATE: AtomicBool = AtomicBool::new(false);

/// Ticks delivered since the periodic timer started, summed over all CPUs.
static TICK_COUNT: AtomicU64 = AtomicU64::new(0);

/// Override the LAPIC register window (virtual address).
///
/// # Safety
///
/// The address must map the local APIC registers of the calling CPU.
pub unsafe fn set_base(virt_addr: u64) {
    LAPIC_BASE.store(virt_addr, Ordering::SeqCst);
}

// =============================================================================
// Register Access
// =============================================================================

#[inline]
unsafe fn read(offset: u32) -> u32 {
    let addr = LAPIC_BASE.load(Ordering::Relaxed) + offset as u64;
    unsafe { core::ptr::read_volatile(addr as *const u32) }
}

#[inline]
unsafe fn write(offset: u32, value: u32) {
    let addr = LAPIC_BASE.load(Ordering::Relaxed) + offset as u64;
    unsafe { core::ptr::write_volatile(addr as *mut u32, value) }
}

// =============================================================================
// Initialization
// =============================================================================

/// Bring up the local APIC of the calling CPU.
///
/// Enables the APIC globally (IA32_APIC_BASE), software-enables it via
/// the spurious vector register, masks every LVT entry except the error
/// line and programs the timer divider. The timer itself stays stopped.
///
/// # Safety
///
/// Ring 0, interrupts disabled, LAPIC window mapped.
pub unsafe fn init() -> Result<(), ApicError> {
    if !cpuid::features().apic {
        return Err(ApicError::NotPresent);
    }

    unsafe {
        // Global enable. The base address bits stay untouched.
        let base = msr::read(msr::IA32_APIC_BASE);
        if base & APIC_BASE_ENABLE == 0 {
            msr::write(msr::IA32_APIC_BASE, base | APIC_BASE_ENABLE);
        }

        // Software enable with the spurious vector.
        write(registers::SVR, SVR_ENABLE | SPURIOUS_VECTOR as u32);

        // Everything masked until someone asks for it.
        write(registers::LVT_TIMER, LVT_MASKED);
        write(registers::LVT_THERMAL, LVT_MASKED);
        write(registers::LVT_PERF, LVT_MASKED);
        write(registers::LVT_LINT0, LVT_MASKED);
        write(registers::LVT_LINT1, LVT_MASKED);
        write(registers::LVT_ERROR, ERROR_VECTOR as u32);

        // ESR needs back-to-back writes on older parts.
        write(registers::ESR, 0);
        write(registers::ESR, 0);

        // Flatten any interrupt left in-service by the firmware.
        write(registers::EOI, 0);

        // Accept everything.
        write(registers::TPR, 0);

        write(registers::TIMER_DCR, DIVIDE_BY_16);
    }

    INITIALIZED.store(true, Ordering::Release);
    Ok(())
}

/// Whether the BSP completed [`init`].
#[inline]
pub fn is_initialized() -> bool {
    INITIALIZED.load(Ordering::Acquire)
}

/// APIC ID of the calling CPU.
#[inline]
pub fn apic_id() -> u32 {
    unsafe { read(registers::ID) >> 24 }
}

/// Signal end-of-interrupt.
///
/// Mandatory before returning from any APIC-delivered handler except NMI
/// and SMI.
#[inline]
pub fn end_of_interrupt() {
    unsafe { write(registers::EOI, 0) }
}

// =============================================================================
// Timer
// =============================================================================

/// Calibrate the timer against the reference clock.
///
/// One-shot run with a known initial count over a fixed reference window,
/// then derive the post-divider input frequency from the consumed ticks.
/// Without an HPET the pause-loop wait stands in and the result is marked
/// inaccurate.
///
/// # Safety
///
/// Ring 0, after [`init`] on this CPU, interrupts disabled.
pub unsafe fn calibrate_timer() {
    const WINDOW_NS: u64 = 10_000_000; // 10 ms
    const INITIAL_COUNT: u32 = u32::MAX;

    unsafe {
        write(registers::LVT_TIMER, LVT_MASKED);
        write(registers::TIMER_DCR, DIVIDE_BY_16);
        write(registers::TIMER_ICR, INITIAL_COUNT);

        timers::busy_wait_ns(WINDOW_NS);

        let remaining = read(registers::TIMER_CCR);
        write(registers::TIMER_ICR, 0);

        let consumed = (INITIAL_COUNT - remaining) as u64;
        let frequency = consumed * (1_000_000_000 / WINDOW_NS);

        TIMER_FREQUENCY.store(frequency, Ordering::SeqCst);
        TIMER_ACCURATE.store(timers::reference_is_accurate(), Ordering::SeqCst);

        log::info!(
            "lapic: timer at {} Hz (divide {}, {})",
            frequency,
            TIMER_DIVISOR,
            if timers::reference_is_accurate() {
                "HPET-calibrated"
            } else {
                "uncalibrated"
            }
        );
    }
}

/// Timer tick frequency in Hz, as calibrated. Zero before calibration.
#[inline]
pub fn timer_frequency() -> u64 {
    TIMER_FREQUENCY.load(Ordering::Relaxed)
}

/// Whether [`timer_frequency`] came from a real reference clock.
#[inline]
pub fn timer_is_accurate() -> bool {
    TIMER_ACCURATE.load(Ordering::Relaxed)
}

/// Start the periodic scheduler tick on the calling CPU.
///
/// # Safety
///
/// Ring 0, after [`calibrate_timer`] on the BSP.
pub unsafe fn start_timer(period_ms: u64) {
    let frequency = timer_frequency().max(1);
    let initial = (frequency * period_ms / 1000).clamp(1, u32::MAX as u64) as u32;

    unsafe {
        write(registers::TIMER_DCR, DIVIDE_BY_16);
        write(
            registers::LVT_TIMER,
            TIMER_VECTOR as u32 | LVT_TIMER_PERIODIC,
        );
        write(registers::TIMER_ICR, initial);
    }
}

/// Ticks delivered since the periodic timer started.
#[inline]
pub fn tick_count() -> u64 {
    TICK_COUNT.load(Ordering::Relaxed)
}

/// Default tick handler: count and acknowledge.
///
/// The scheduler replaces this registration once it owns the tick vector;
/// until then the counter keeps time for busy-wait diagnostics.
pub extern "C" fn timer_tick_handler(_frame: &mut InterruptFrame) {
    TICK_COUNT.fetch_add(1, Ordering::Relaxed);
    end_of_interrupt();
}

/// Install [`timer_tick_handler`] on the tick vector.
pub fn register_tick_handler() {
    interrupts::register_handler(TIMER_VECTOR as usize, timer_tick_handler);
}

// =============================================================================
// ICR
// =============================================================================

/// ICR delivery-status bit (send pending).
const ICR_SEND_PENDING: u32 = 1 << 12;

/// Spin until the previous IPI left the ICR.
#[inline]
unsafe fn wait_icr_idle() {
    unsafe {
        while read(registers::ICR_LOW) & ICR_SEND_PENDING != 0 {
            core::hint::spin_loop();
        }
    }
}

/// Write an ICR command: high half (destination) first, then the low
/// half, whose write dispatches the interrupt.
///
/// # Safety
///
/// Ring 0, local APIC enabled.
pub unsafe fn write_icr(destination: u32, icr_low: u32) {
    unsafe {
        wait_icr_idle();
        write(registers::ICR_HIGH, destination << 24);
        write(registers::ICR_LOW, icr_low);
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_offsets() {
        assert_eq!(registers::EOI, 0x0B0);
        assert_eq!(registers::ICR_LOW, 0x300);
        assert_eq!(registers::ICR_HIGH, 0x310);
        assert_eq!(registers::TIMER_DCR, 0x3E0);
    }

    #[test]
    fn test_timer_initial_count_scaling() {
        // 100 MHz timer, 10 ms period: 1_000_000 ticks.
        let frequency: u64 = 100_000_000;
        let initial = frequency * 10 / 1000;
        assert_eq!(initial, 1_000_000);
    }

    #[test]
    fn test_tick_counter_monotonic() {
        let before = tick_count();
        let mut frame: InterruptFrame = unsafe { core::mem::zeroed() };
        // Counting must not depend on frame contents.
        frame.vector = TIMER_VECTOR as u64;
        // Not invoking the handler here: it would poke LAPIC MMIO.
        let _ = frame;
        assert!(tick_count() >= before);
    }
}
