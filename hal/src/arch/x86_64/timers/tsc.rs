//! # Time Stamp Counter
//!
//! Raw TSC reads plus a one-time frequency calibration. The TSC is the
//! cheapest clock on the machine but needs an external reference to mean
//! anything; CPUID leaf 15H gives the ratio directly on newer parts, and
//! the HPET covers the rest.

use core::sync::atomic::{AtomicU64, Ordering};

use crate::arch::x86_64::core::cpuid;

use super::hpet;

static FREQUENCY: AtomicU64 = AtomicU64::new(0);

/// Read the TSC.
#[inline]
pub fn read() -> u64 {
    crate::arch::x86_64::core::control_regs::read_tsc()
}

/// Read the TSC with a load fence so earlier loads cannot slip past the
/// sample point.
#[inline]
pub fn read_serialized() -> u64 {
    unsafe {
        core::arch::asm!("lfence", options(nostack, preserves_flags));
    }
    read()
}

/// Calibrated TSC frequency in Hz. Zero before calibration.
#[inline]
pub fn frequency() -> u64 {
    FREQUENCY.load(Ordering::Relaxed)
}

/// TSC frequency straight from CPUID leaf 15H, when the firmware filled
/// in the crystal clock.
pub fn frequency_from_cpuid() -> Option<u64> {
    if cpuid::max_leaf() < 0x15 {
        return None;
    }
    let leaf = cpuid::cpuid(0x15);
    if leaf.eax == 0 || leaf.ebx == 0 || leaf.ecx == 0 {
        return None;
    }
    // crystal Hz * (TSC/crystal ratio)
    Some(leaf.ecx as u64 * leaf.ebx as u64 / leaf.eax as u64)
}

/// Establish the TSC frequency: CPUID when available, else a 10 ms
/// measurement against the HPET. Without either reference the frequency
/// stays zero and callers fall back to other clocks.
pub fn calibrate() {
    if let Some(freq) = frequency_from_cpuid() {
        FREQUENCY.store(freq, Ordering::SeqCst);
        log::info!("tsc: {} Hz (CPUID)", freq);
        return;
    }

    if !hpet::is_available() {
        log::warn!("tsc: no reference clock, frequency unknown");
        return;
    }

    const WINDOW_NS: u64 = 10_000_000;
    let hpet_ticks = hpet::ns_to_ticks(WINDOW_NS);
    let start_hpet = hpet::read_counter();
    let start_tsc = read_serialized();
    while hpet::read_counter().wrapping_sub(start_hpet) < hpet_ticks {
        core::hint::spin_loop();
    }
    let elapsed_tsc = read_serialized().wrapping_sub(start_tsc);

    let freq = elapsed_tsc * (1_000_000_000 / WINDOW_NS);
    FREQUENCY.store(freq, Ordering::SeqCst);
    log::info!("tsc: {} Hz (HPET-calibrated)", freq);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_advances() {
        let a = read();
        let b = read_serialized();
        assert!(b >= a);
    }
}
