//! # Interrupt Controllers
//!
//! The local APIC (per-CPU: EOI, timer, IPIs), the I/O APICs (device IRQ
//! routing) and the legacy 8259 shutdown path.
//!
//! ## Boot order
//!
//! 1. BSP: [`local::init`], timer calibration against the HPET, periodic
//!    tick start
//! 2. BSP: [`pic::disable`] when the topology reports 8259s
//! 3. BSP: [`ioapic::init`] and the ISA IRQ routes
//! 4. Each AP: [`local::init`] plus its own timer start during bring-up
//!
//! The PIC is silenced before any I/O APIC route goes live so the
//! 0x20-0x2F vector window never has two owners.

pub mod ioapic;
pub mod ipi;
pub mod local;
pub mod pic;

pub use ioapic::{IoApic, IrqRoute, Polarity, RedirectionEntry, TriggerMode};
pub use ipi::{IpiBarrier, IpiDestination};
pub use local::ApicError;

use core::sync::atomic::{AtomicU64, Ordering};

use crate::arch::x86_64::topology;

/// Tick period the BSP was configured with; APs reuse it.
static TIMER_PERIOD_MS: AtomicU64 = AtomicU64::new(10);

/// Bring up interrupt delivery on the BSP in stage 2.
///
/// Local APIC first, then the legacy PIC shutdown, then the I/O APICs
/// with every ISA IRQ routed to the BSP. Hardware absence degrades: a
/// machine without I/O APICs keeps running with no external IRQ routing.
///
/// # Safety
///
/// Stage 2 on the BSP, interrupts disabled, MMIO ranges mapped.
pub unsafe fn init_bsp(timer_period_ms: u64) -> Result<(), ApicError> {
    TIMER_PERIOD_MS.store(timer_period_ms, Ordering::SeqCst);
    unsafe {
        local::init()?;
        local::calibrate_timer();
        local::register_tick_handler();
        local::start_timer(timer_period_ms);

        if topology::has_legacy_pics() {
            pic::disable();
        }

        if topology::ioapic_count() > 0 {
            ioapic::init()?;
            ioapic::setup_isa_irqs();
        } else {
            log::warn!("apic: no I/O APIC reported; external IRQ routing disabled");
        }
    }
    Ok(())
}

/// Bring up the local APIC and timer on an application processor, with
/// the tick period the BSP chose.
///
/// # Safety
///
/// AP bring-up path, after [`init_bsp`] completed.
pub unsafe fn init_ap() -> Result<(), ApicError> {
    if !local::is_initialized() {
        return Err(ApicError::NotInitialized);
    }
    unsafe {
        local::init()?;
        local::start_timer(TIMER_PERIOD_MS.load(Ordering::SeqCst));
    }
    Ok(())
}

/// Signal end-of-interrupt on the calling CPU.
#[inline]
pub fn end_of_interrupt() {
    local::end_of_interrupt();
}

/// Send a fixed IPI to one CPU by APIC ID.
///
/// # Safety
///
/// Local APIC enabled; `vector` ≥ 32.
#[inline]
pub unsafe fn send_ipi(dest_apic_id: u32, vector: u8) {
    unsafe { ipi::send(IpiDestination::Single(dest_apic_id), vector) }
}

/// Broadcast a fixed IPI to every CPU except the sender.
///
/// # Safety
///
/// Local APIC enabled; `vector` ≥ 32.
#[inline]
pub unsafe fn broadcast_ipi(vector: u8) {
    unsafe { ipi::send(IpiDestination::AllExcludingSelf, vector) }
}
