//! # High Precision Event Timer
//!
//! Ground-truth clock for this layer. Only the main counter is used: the
//! capabilities register gives the tick period in femtoseconds, and busy
//! waits spin on counter deltas. Comparator interrupts stay with the
//! kernel's timer subsystem, not here.

use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};

// =============================================================================
// Registers
// =============================================================================

/// HPET register offsets.
mod regs {
    /// General capabilities and ID (period in bits 63:32)
    pub const CAPABILITIES: u64 = 0x000;
    /// General configuration (bit 0 = counter enable)
    pub const CONFIGURATION: u64 = 0x010;
    /// Main counter
    pub const MAIN_COUNTER: u64 = 0x0F0;
}

/// ENABLE_CNF bit in the configuration register.
const ENABLE_COUNTER: u64 = 1 << 0;

// =============================================================================
// State
// =============================================================================

static AVAILABLE: AtomicBool = AtomicBool::new(false);
static BASE: AtomicU64 = AtomicU64::new(0);
static PERIOD_FS: AtomicU64 = AtomicU64::new(0);
static FREQUENCY: AtomicU64 = AtomicU64::new(0);

// =============================================================================
// Errors
// =============================================================================

/// HPET failure modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HpetError {
    /// Init ran twice
    AlreadyInitialized,
    /// Capabilities register reports a nonsense period
    InvalidPeriod,
}

impl core::fmt::Display for HpetError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            HpetError::AlreadyInitialized => write!(f, "HPET already initialized"),
            HpetError::InvalidPeriod => write!(f, "HPET reports invalid period"),
        }
    }
}

// =============================================================================
// Register Access
// =============================================================================

#[inline]
unsafe fn read_reg(offset: u64) -> u64 {
    let base = BASE.load(Ordering::Relaxed);
    unsafe { core::ptr::read_volatile((base + offset) as *const u64) }
}

#[inline]
unsafe fn write_reg(offset: u64, value: u64) {
    let base = BASE.load(Ordering::Relaxed);
    unsafe { core::ptr::write_volatile((base + offset) as *mut u64, value) }
}

// =============================================================================
// Initialization
// =============================================================================

/// Bring up the HPET at the ACPI-reported base and start the main
/// counter.
///
/// # Safety
///
/// `base` must map the HPET register block. Stage 2 on the BSP.
pub unsafe fn init(base: u64) -> Result<(), HpetError> {
    if AVAILABLE.load(Ordering::Acquire) {
        return Err(HpetError::AlreadyInitialized);
    }

    BASE.store(base, Ordering::SeqCst);

    let capabilities = unsafe { read_reg(regs::CAPABILITIES) };
    let period_fs = capabilities >> 32;
    // Sanity window: zero is firmware garbage, >100 ns violates the
    // architectural 10 MHz minimum.
    if period_fs == 0 || period_fs > 100_000_000 {
        return Err(HpetError::InvalidPeriod);
    }

    PERIOD_FS.store(period_fs, Ordering::SeqCst);
    let frequency = 1_000_000_000_000_000 / period_fs;
    FREQUENCY.store(frequency, Ordering::SeqCst);

    unsafe {
        let config = read_reg(regs::CONFIGURATION);
        write_reg(regs::CONFIGURATION, config | ENABLE_COUNTER);
    }

    AVAILABLE.store(true, Ordering::SeqCst);

    log::info!("hpet: {} Hz at {:#x}", frequency, base);
    Ok(())
}

/// Whether a working HPET was found.
#[inline]
pub fn is_available() -> bool {
    AVAILABLE.load(Ordering::Relaxed)
}

/// Main-counter frequency in Hz. Zero when unavailable.
#[inline]
pub fn frequency() -> u64 {
    FREQUENCY.load(Ordering::Relaxed)
}

// =============================================================================
// Counter
// =============================================================================

/// Raw main-counter value. Zero when unavailable.
#[inline]
pub fn read_counter() -> u64 {
    if !is_available() {
        return 0;
    }
    unsafe { read_reg(regs::MAIN_COUNTER) }
}

/// Convert nanoseconds to main-counter ticks.
#[inline]
pub fn ns_to_ticks(ns: u64) -> u64 {
    let period_fs = PERIOD_FS.load(Ordering::Relaxed);
    if period_fs == 0 {
        return 0;
    }
    // 1 ns = 10^6 fs.
    (ns as u128 * 1_000_000 / period_fs as u128) as u64
}

/// Convert main-counter ticks to nanoseconds.
#[inline]
pub fn ticks_to_ns(ticks: u64) -> u64 {
    let period_fs = PERIOD_FS.load(Ordering::Relaxed);
    (ticks as u128 * period_fs as u128 / 1_000_000) as u64
}

/// Nanoseconds since the counter started. Wraps with the counter.
#[inline]
pub fn elapsed_ns() -> u64 {
    ticks_to_ns(read_counter())
}

/// Spin on the main counter for `ns` nanoseconds.
pub fn busy_wait_ns(ns: u64) {
    let start = read_counter();
    let ticks = ns_to_ticks(ns);
    while read_counter().wrapping_sub(start) < ticks {
        core::hint::spin_loop();
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
pub(crate) fn set_period_for_test(period_fs: u64) {
    PERIOD_FS.store(period_fs, Ordering::SeqCst);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tick_conversions() {
        // 100 ns period (10 MHz).
        set_period_for_test(100_000_000);
        assert_eq!(ns_to_ticks(1_000), 10);
        assert_eq!(ticks_to_ns(10), 1_000);
        // Round trip at a second.
        assert_eq!(ticks_to_ns(ns_to_ticks(1_000_000_000)), 1_000_000_000);
        set_period_for_test(0);
    }

    #[test]
    fn test_unavailable_reads_zero() {
        assert_eq!(read_counter(), 0);
    }
}
