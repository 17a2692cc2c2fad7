//! # Inter-Processor Interrupts
//!
//! ICR command composition and the send paths used for kernel IPIs and
//! for the INIT-SIPI-SIPI startup protocol.
//!
//! IPIs are fire-and-forget. Delivery to a dead or absent APIC ID is
//! silently dropped by the hardware; any acknowledgement protocol lives
//! in the layers above.

use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use super::local;

// =============================================================================
// Destinations and Modes
// =============================================================================

/// Where an IPI goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpiDestination {
    /// One CPU, by APIC ID
    Single(u32),
    /// Every CPU including the sender
    AllIncludingSelf,
    /// Every CPU except the sender
    AllExcludingSelf,
}

impl IpiDestination {
    /// ICR destination-shorthand bits (18-19).
    const fn shorthand(self) -> u32 {
        match self {
            IpiDestination::Single(_) => 0b00,
            IpiDestination::AllIncludingSelf => 0b10,
            IpiDestination::AllExcludingSelf => 0b11,
        }
    }

    const fn apic_id(self) -> u32 {
        match self {
            IpiDestination::Single(id) => id,
            _ => 0,
        }
    }
}

/// ICR delivery mode (bits 8-10).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum IpiDeliveryMode {
    /// Ordinary vectored interrupt
    Fixed = 0b000,
    /// Non-maskable interrupt (vector ignored)
    Nmi = 0b100,
    /// INIT signal
    Init = 0b101,
    /// Startup IPI (vector = entry page number)
    Startup = 0b110,
}

/// ICR level bit (14).
const ICR_LEVEL_ASSERT: u32 = 1 << 14;

/// ICR trigger-mode bit (15).
const ICR_TRIGGER_LEVEL: u32 = 1 << 15;

/// Compose the low half of an ICR command.
fn build_icr_low(vector: u8, mode: IpiDeliveryMode, assert: bool, level: bool, shorthand: u32) -> u32 {
    let mut icr = vector as u32;
    icr |= (mode as u32) << 8;
    if assert {
        icr |= ICR_LEVEL_ASSERT;
    }
    if level {
        icr |= ICR_TRIGGER_LEVEL;
    }
    icr | (shorthand << 18)
}

// =============================================================================
// Accounting
// =============================================================================

static IPI_SENT: AtomicU64 = AtomicU64::new(0);
static IPI_RECEIVED: AtomicU64 = AtomicU64::new(0);

/// IPIs pushed through the ICR since boot.
#[inline]
pub fn sent_count() -> u64 {
    IPI_SENT.load(Ordering::Relaxed)
}

/// IPIs acknowledged by handlers that call [`received`].
#[inline]
pub fn received_count() -> u64 {
    IPI_RECEIVED.load(Ordering::Relaxed)
}

/// Record an IPI arrival. Called from IPI handlers.
#[inline]
pub fn received() {
    IPI_RECEIVED.fetch_add(1, Ordering::Relaxed);
}

// =============================================================================
// Send Paths
// =============================================================================

/// Send a fixed-vector IPI.
///
/// # Safety
///
/// Local APIC enabled; `vector` must be ≥ 32.
pub unsafe fn send(destination: IpiDestination, vector: u8) {
    let icr = build_icr_low(
        vector,
        IpiDeliveryMode::Fixed,
        true,
        false,
        destination.shorthand(),
    );
    unsafe {
        local::write_icr(destination.apic_id(), icr);
    }
    IPI_SENT.fetch_add(1, Ordering::Relaxed);
}

/// Send an INIT IPI: assert, then de-assert.
///
/// # Safety
///
/// Local APIC enabled; the target is reset into wait-for-SIPI state.
pub unsafe fn send_init(apic_id: u32) {
    unsafe {
        local::write_icr(
            apic_id,
            build_icr_low(0, IpiDeliveryMode::Init, true, true, 0),
        );
        local::write_icr(
            apic_id,
            build_icr_low(0, IpiDeliveryMode::Init, false, true, 0),
        );
    }
    IPI_SENT.fetch_add(1, Ordering::Relaxed);
}

/// Send a startup IPI. `start_page` is the physical entry address divided
/// by 4096; it must land below 1 MiB.
///
/// # Safety
///
/// The target must have taken INIT, and the trampoline page must hold
/// real-mode startup code.
pub unsafe fn send_startup(apic_id: u32, start_page: u8) {
    unsafe {
        local::write_icr(
            apic_id,
            build_icr_low(start_page, IpiDeliveryMode::Startup, true, false, 0),
        );
    }
    IPI_SENT.fetch_add(1, Ordering::Relaxed);
}

// =============================================================================
// Rendezvous Barrier
// =============================================================================

/// Generation-counted spin barrier for bring-up rendezvous.
#[derive(Debug)]
pub struct IpiBarrier {
    expected: AtomicU32,
    arrived: AtomicU32,
    generation: AtomicU32,
}

impl IpiBarrier {
    /// Barrier expecting nobody; arm it with [`IpiBarrier::arm`].
    pub const fn new() -> Self {
        Self {
            expected: AtomicU32::new(0),
            arrived: AtomicU32::new(0),
            generation: AtomicU32::new(0),
        }
    }

    /// Arm the barrier for `cpus` participants.
    pub fn arm(&self, cpus: u32) {
        self.expected.store(cpus, Ordering::SeqCst);
        self.arrived.store(0, Ordering::SeqCst);
    }

    /// Spin until every participant arrived. Returns true on the last
    /// CPU in (the one that releases the others).
    pub fn wait(&self) -> bool {
        let generation = self.generation.load(Ordering::Acquire);
        let expected = self.expected.load(Ordering::Acquire);

        let arrived = self.arrived.fetch_add(1, Ordering::AcqRel) + 1;
        if arrived == expected {
            self.arrived.store(0, Ordering::Release);
            self.generation.fetch_add(1, Ordering::Release);
            return true;
        }

        while self.generation.load(Ordering::Acquire) == generation {
            core::hint::spin_loop();
        }
        false
    }
}

impl Default for IpiBarrier {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_icr_fixed_composition() {
        let icr = build_icr_low(0x40, IpiDeliveryMode::Fixed, true, false, 0b11);
        assert_eq!(icr & 0xFF, 0x40);
        assert_eq!((icr >> 8) & 0b111, 0);
        assert_ne!(icr & ICR_LEVEL_ASSERT, 0);
        assert_eq!(icr >> 18, 0b11);
    }

    #[test]
    fn test_icr_init_assert_deassert() {
        let assert_cmd = build_icr_low(0, IpiDeliveryMode::Init, true, true, 0);
        let deassert_cmd = build_icr_low(0, IpiDeliveryMode::Init, false, true, 0);
        assert_eq!(assert_cmd, 0x0000_C500);
        assert_eq!(deassert_cmd, 0x0000_8500);
    }

    #[test]
    fn test_icr_startup_vector() {
        // Trampoline at 0x8000: page 8.
        let sipi = build_icr_low(8, IpiDeliveryMode::Startup, true, false, 0);
        assert_eq!(sipi, 0x0000_4608);
    }

    #[test]
    fn test_barrier_two_threads() {
        use std::sync::Arc;

        let barrier = Arc::new(IpiBarrier::new());
        barrier.arm(2);

        let other = Arc::clone(&barrier);
        let worker = std::thread::spawn(move || other.wait());
        let mine = barrier.wait();
        let theirs = worker.join().unwrap();

        // Exactly one releaser.
        assert_ne!(mine, theirs);
    }
}
