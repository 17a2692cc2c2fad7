//! # CPU Topology
//!
//! Read-only view of the machine as described by the ACPI MADT: the CPU
//! list, the I/O APICs with their GSI ranges, the interrupt-source
//! overrides and whether legacy 8259 PICs are wired up.
//!
//! The ACPI layer parses the table and hands the records over exactly
//! once, in stage 2 on the BSP. Before that happens every query reports a
//! single-CPU machine with no I/O APICs, which lets early code run on
//! bare or broken firmware.
//!
//! Per-CPU liveness is the one mutable part: SMP bring-up downgrades a
//! CPU that never acknowledged its startup sequence.

use core::sync::atomic::{AtomicBool, AtomicU8, Ordering};

use bitflags::bitflags;

use super::cell::BootCell;

// =============================================================================
// Capacities
// =============================================================================

/// Upper bound on tracked CPUs.
pub const MAX_CPUS: usize = 256;

/// Upper bound on I/O APIC controllers.
pub const MAX_IOAPICS: usize = 8;

/// Upper bound on interrupt-source override records.
pub const MAX_OVERRIDES: usize = 32;

// =============================================================================
// Records
// =============================================================================

bitflags! {
    /// MADT local-APIC flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct CpuFlags: u32 {
        /// CPU is enabled and may be brought online
        const ENABLED = 1 << 0;
        /// CPU is disabled now but hot-enable capable
        const ONLINE_CAPABLE = 1 << 1;
    }
}

/// One processor as reported by the MADT.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CpuEntry {
    /// Local APIC ID
    pub apic_id: u32,
    /// MADT flags
    pub flags: CpuFlags,
}

/// One I/O APIC controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IoApicEntry {
    /// Controller ID
    pub id: u8,
    /// MMIO base (physical; mapped 1:1 by the VM layer before stage 2)
    pub address: u64,
    /// First GSI this controller owns
    pub gsi_base: u32,
}

bitflags! {
    /// Interrupt-source override flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct OverrideFlags: u16 {
        /// Line is active-low (default: active-high)
        const ACTIVE_LOW = 1 << 0;
        /// Polarity field carries meaning
        const POLARITY_SPECIFIED = 1 << 1;
        /// Line is level-triggered (default: edge)
        const LEVEL_TRIGGERED = 1 << 2;
        /// Trigger field carries meaning
        const TRIGGER_SPECIFIED = 1 << 3;
    }
}

impl OverrideFlags {
    /// Whether the source line is active-low.
    pub fn is_active_low(self) -> bool {
        self.contains(Self::ACTIVE_LOW)
    }

    /// Whether the source line is level-triggered.
    pub fn is_level_triggered(self) -> bool {
        self.contains(Self::LEVEL_TRIGGERED)
    }
}

/// ISA IRQ rerouted to a different GSI, possibly with different
/// polarity/trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InterruptOverride {
    /// ISA source IRQ
    pub source_irq: u8,
    /// Global system interrupt it actually appears on
    pub gsi: u32,
    /// Polarity/trigger flags
    pub flags: OverrideFlags,
}

/// Liveness of one CPU slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CpuState {
    /// Known but not started
    Present = 0,
    /// Running kernel code
    Online = 1,
    /// Never acknowledged bring-up
    Failed = 2,
}

// =============================================================================
// Storage
// =============================================================================

struct TopologyData {
    cpus: [CpuEntry; MAX_CPUS],
    cpu_count: usize,
    ioapics: [IoApicEntry; MAX_IOAPICS],
    ioapic_count: usize,
    overrides: [InterruptOverride; MAX_OVERRIDES],
    override_count: usize,
    bsp_apic_id: u32,
    has_legacy_pics: bool,
}

const EMPTY_CPU: CpuEntry = CpuEntry {
    apic_id: 0,
    flags: CpuFlags::empty(),
};

const EMPTY_IOAPIC: IoApicEntry = IoApicEntry {
    id: 0,
    address: 0,
    gsi_base: 0,
};

const EMPTY_OVERRIDE: InterruptOverride = InterruptOverride {
    source_irq: 0,
    gsi: 0,
    flags: OverrideFlags::empty(),
};

static TOPOLOGY: BootCell<TopologyData> = BootCell::new(TopologyData {
    cpus: [EMPTY_CPU; MAX_CPUS],
    cpu_count: 0,
    ioapics: [EMPTY_IOAPIC; MAX_IOAPICS],
    ioapic_count: 0,
    overrides: [EMPTY_OVERRIDE; MAX_OVERRIDES],
    override_count: 0,
    bsp_apic_id: 0,
    has_legacy_pics: false,
});

static INITIALIZED: AtomicBool = AtomicBool::new(false);

static CPU_STATES: [AtomicU8; MAX_CPUS] = {
    #[allow(clippy::declare_interior_mutable_const)]
    const PRESENT: AtomicU8 = AtomicU8::new(CpuState::Present as u8);
    [PRESENT; MAX_CPUS]
};

// =============================================================================
// Errors
// =============================================================================

/// Topology population failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopologyError {
    /// Populate called twice
    AlreadyInitialized,
    /// More records than the static tables hold
    CapacityExceeded,
    /// No enabled CPU in the record set
    NoCpus,
}

impl core::fmt::Display for TopologyError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            TopologyError::AlreadyInitialized => write!(f, "topology already populated"),
            TopologyError::CapacityExceeded => write!(f, "too many MADT records"),
            TopologyError::NoCpus => write!(f, "MADT reported no enabled CPUs"),
        }
    }
}

// =============================================================================
// Population
// =============================================================================

/// Install the MADT-derived records. Called exactly once, on the BSP, in
/// stage 2.
///
/// Disabled CPUs (no `ENABLED` flag) are filtered out here so the rest of
/// the layer only ever sees startable processors.
pub fn populate(
    cpus: &[CpuEntry],
    ioapics: &[IoApicEntry],
    overrides: &[InterruptOverride],
    bsp_apic_id: u32,
    has_legacy_pics: bool,
) -> Result<(), TopologyError> {
    if INITIALIZED.load(Ordering::Acquire) {
        return Err(TopologyError::AlreadyInitialized);
    }
    if cpus.len() > MAX_CPUS || ioapics.len() > MAX_IOAPICS || overrides.len() > MAX_OVERRIDES {
        return Err(TopologyError::CapacityExceeded);
    }

    // Single-threaded: stage 2 runs on the BSP before APs exist.
    let data = unsafe { TOPOLOGY.get_mut() };

    data.cpu_count = 0;
    for cpu in cpus {
        if cpu.flags.contains(CpuFlags::ENABLED) {
            data.cpus[data.cpu_count] = *cpu;
            data.cpu_count += 1;
        }
    }
    if data.cpu_count == 0 {
        return Err(TopologyError::NoCpus);
    }

    data.ioapics[..ioapics.len()].copy_from_slice(ioapics);
    data.ioapic_count = ioapics.len();
    data.overrides[..overrides.len()].copy_from_slice(overrides);
    data.override_count = overrides.len();
    data.bsp_apic_id = bsp_apic_id;
    data.has_legacy_pics = has_legacy_pics;

    // The BSP is running by definition.
    for (index, cpu) in data.cpus[..data.cpu_count].iter().enumerate() {
        let state = if cpu.apic_id == bsp_apic_id {
            CpuState::Online
        } else {
            CpuState::Present
        };
        CPU_STATES[index].store(state as u8, Ordering::Release);
    }

    INITIALIZED.store(true, Ordering::Release);

    log::info!(
        "topology: {} CPU(s), {} I/O APIC(s), {} override(s), BSP APIC {}",
        data.cpu_count,
        data.ioapic_count,
        data.override_count,
        bsp_apic_id
    );

    Ok(())
}

// =============================================================================
// Queries
// =============================================================================

/// Whether the MADT records have been installed.
#[inline]
pub fn is_initialized() -> bool {
    INITIALIZED.load(Ordering::Acquire)
}

/// Number of usable CPUs. Reports 1 before population.
pub fn cpu_count() -> usize {
    if !is_initialized() {
        return 1;
    }
    unsafe { TOPOLOGY.get() }.cpu_count
}

/// CPU record at `index`.
pub fn cpu(index: usize) -> Option<CpuEntry> {
    if !is_initialized() {
        return None;
    }
    let data = unsafe { TOPOLOGY.get() };
    if index < data.cpu_count {
        Some(data.cpus[index])
    } else {
        None
    }
}

/// Liveness of CPU `index`.
pub fn cpu_state(index: usize) -> CpuState {
    match CPU_STATES[index % MAX_CPUS].load(Ordering::Acquire) {
        1 => CpuState::Online,
        2 => CpuState::Failed,
        _ => CpuState::Present,
    }
}

/// Record a CPU as running. Called from the CPU itself during bring-up.
pub fn mark_cpu_online(index: usize) {
    if index < MAX_CPUS {
        CPU_STATES[index].store(CpuState::Online as u8, Ordering::Release);
    }
}

/// Record a CPU that never acknowledged its startup sequence.
pub fn mark_cpu_failed(index: usize) {
    if index < MAX_CPUS {
        CPU_STATES[index].store(CpuState::Failed as u8, Ordering::Release);
    }
}

/// Number of I/O APICs. Zero before population.
pub fn ioapic_count() -> usize {
    if !is_initialized() {
        return 0;
    }
    unsafe { TOPOLOGY.get() }.ioapic_count
}

/// I/O APIC record at `index`.
pub fn ioapic(index: usize) -> Option<IoApicEntry> {
    if !is_initialized() {
        return None;
    }
    let data = unsafe { TOPOLOGY.get() };
    if index < data.ioapic_count {
        Some(data.ioapics[index])
    } else {
        None
    }
}

/// Override record for an ISA IRQ, if the firmware reported one.
pub fn interrupt_override(irq: u8) -> Option<InterruptOverride> {
    if !is_initialized() {
        return None;
    }
    let data = unsafe { TOPOLOGY.get() };
    data.overrides[..data.override_count]
        .iter()
        .find(|o| o.source_irq == irq)
        .copied()
}

/// APIC ID of the bootstrap processor.
pub fn bsp_apic_id() -> u32 {
    if !is_initialized() {
        return 0;
    }
    unsafe { TOPOLOGY.get() }.bsp_apic_id
}

/// Whether dual 8259s are present and must be silenced.
pub fn has_legacy_pics() -> bool {
    if !is_initialized() {
        return false;
    }
    unsafe { TOPOLOGY.get() }.has_legacy_pics
}

/// Index of the CPU record with `apic_id`.
pub fn cpu_index_for_apic_id(apic_id: u32) -> Option<usize> {
    if !is_initialized() {
        return None;
    }
    let data = unsafe { TOPOLOGY.get() };
    data.cpus[..data.cpu_count]
        .iter()
        .position(|c| c.apic_id == apic_id)
}

// =============================================================================
// Test Support
// =============================================================================

/// Serializes every test that mutates the global topology.
#[cfg(test)]
pub(crate) static TEST_LOCK: std::sync::Mutex<()> = std::sync::Mutex::new(());

/// Drop back to the unpopulated state.
#[cfg(test)]
pub(crate) fn reset_for_test() {
    INITIALIZED.store(false, Ordering::Release);
    let data = unsafe { TOPOLOGY.get_mut() };
    data.cpu_count = 0;
    data.ioapic_count = 0;
    data.override_count = 0;
    data.bsp_apic_id = 0;
    data.has_legacy_pics = false;
    for state in &CPU_STATES {
        state.store(CpuState::Present as u8, Ordering::Release);
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_cpus() -> [CpuEntry; 3] {
        [
            CpuEntry {
                apic_id: 0,
                flags: CpuFlags::ENABLED,
            },
            CpuEntry {
                apic_id: 2,
                flags: CpuFlags::ENABLED,
            },
            // Disabled socket, must be filtered out.
            CpuEntry {
                apic_id: 5,
                flags: CpuFlags::empty(),
            },
        ]
    }

    #[test]
    fn test_defaults_before_population() {
        let _guard = TEST_LOCK.lock().unwrap();
        reset_for_test();
        assert!(!is_initialized());
        assert_eq!(cpu_count(), 1);
        assert_eq!(ioapic_count(), 0);
        assert!(interrupt_override(0).is_none());
        assert!(!has_legacy_pics());
    }

    #[test]
    fn test_populate_filters_disabled_cpus() {
        let _guard = TEST_LOCK.lock().unwrap();
        reset_for_test();

        let ioapics = [IoApicEntry {
            id: 0,
            address: 0xFEC0_0000,
            gsi_base: 0,
        }];
        let overrides = [InterruptOverride {
            source_irq: 0,
            gsi: 2,
            flags: OverrideFlags::from_bits_truncate(0x000D),
        }];

        populate(&sample_cpus(), &ioapics, &overrides, 0, true).unwrap();

        assert!(is_initialized());
        assert_eq!(cpu_count(), 2);
        assert_eq!(cpu(0).unwrap().apic_id, 0);
        assert_eq!(cpu(1).unwrap().apic_id, 2);
        assert!(cpu(2).is_none());
        assert_eq!(bsp_apic_id(), 0);
        assert!(has_legacy_pics());
        assert_eq!(cpu_state(0), CpuState::Online);
        assert_eq!(cpu_state(1), CpuState::Present);

        let ovr = interrupt_override(0).unwrap();
        assert_eq!(ovr.gsi, 2);
        assert!(ovr.flags.is_active_low());
        assert!(ovr.flags.is_level_triggered());

        assert_eq!(populate(&sample_cpus(), &[], &[], 0, false),
            Err(TopologyError::AlreadyInitialized));
    }

    #[test]
    fn test_cpu_liveness_transitions() {
        let _guard = TEST_LOCK.lock().unwrap();
        reset_for_test();
        populate(&sample_cpus(), &[], &[], 0, false).unwrap();

        mark_cpu_online(1);
        assert_eq!(cpu_state(1), CpuState::Online);
        mark_cpu_failed(1);
        assert_eq!(cpu_state(1), CpuState::Failed);
        assert_eq!(cpu_index_for_apic_id(2), Some(1));
        assert_eq!(cpu_index_for_apic_id(99), None);
    }
}
