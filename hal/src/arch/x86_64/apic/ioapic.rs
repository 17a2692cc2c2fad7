//! # I/O APIC
//!
//! Routes external device interrupts (GSIs) to CPUs. Each controller
//! owns a contiguous GSI range `[gsi_base, gsi_base + entries)` and a
//! redirection table programmed through an index/window register pair:
//!
//! - `IOREGSEL` (base + 0x00): 32-bit register index
//! - `IOWIN`    (base + 0x10): 32-bit data window
//!
//! Redirection entry `n` lives at indirect registers `0x10 + 2n` (low)
//! and `0x11 + 2n` (high). Writes go **high half first**: the destination
//! lands before the low-half write commits vector, trigger and mask in
//! one shot.
//!
//! The two-poke window is not atomic, so every controller is wrapped in a
//! spin lock. ISA IRQ numbers pass through the MADT override table before
//! they become GSIs.

use spin::Mutex;

use super::local::ApicError;
use crate::arch::x86_64::interrupts::ISA_IRQ_BASE;
use crate::arch::x86_64::topology;

// =============================================================================
// Constants
// =============================================================================

/// Maximum controllers, matching the topology table.
pub const MAX_IOAPICS: usize = topology::MAX_IOAPICS;

/// Highest ISA-style IRQ accepted by the routing calls.
pub const MAX_ROUTED_IRQ: u8 = 23;

/// Indirect register indices.
mod regs {
    /// Controller ID
    pub const ID: u32 = 0x00;
    /// Version and redirection entry count
    pub const VERSION: u32 = 0x01;
    /// First redirection entry register
    pub const REDIR_BASE: u32 = 0x10;
}

// =============================================================================
// MMIO Protocol
// =============================================================================

#[cfg(not(test))]
mod mmio {
    /// IOREGSEL offset from the MMIO base.
    const IOREGSEL: u64 = 0x00;
    /// IOWIN offset from the MMIO base.
    const IOWIN: u64 = 0x10;

    /// Read an indirect register.
    ///
    /// # Safety
    ///
    /// `base` must map I/O APIC registers; caller holds the controller
    /// lock.
    #[inline]
    pub unsafe fn read_reg(base: u64, reg: u32) -> u32 {
        unsafe {
            core::ptr::write_volatile((base + IOREGSEL) as *mut u32, reg);
            core::ptr::read_volatile((base + IOWIN) as *const u32)
        }
    }

    /// Write an indirect register.
    ///
    /// # Safety
    ///
    /// Same as [`read_reg`].
    #[inline]
    pub unsafe fn write_reg(base: u64, reg: u32, value: u32) {
        unsafe {
            core::ptr::write_volatile((base + IOREGSEL) as *mut u32, reg);
            core::ptr::write_volatile((base + IOWIN) as *mut u32, value);
        }
    }
}

/// Hosted register-file model standing in for the hardware, so the
/// routing logic runs under the unit harness exactly as written.
#[cfg(test)]
pub(crate) mod mmio {
    use std::collections::HashMap;
    use std::sync::Mutex;

    const REG_SPACE: usize = 0x60;

    struct SimIoApic {
        regs: [u32; REG_SPACE],
    }

    static SIM: Mutex<Option<HashMap<u64, SimIoApic>>> = Mutex::new(None);

    /// Register a simulated controller at `base`.
    pub fn install(base: u64, id: u8, entries: u8) {
        let mut regs = [0u32; REG_SPACE];
        regs[super::regs::ID as usize] = (id as u32) << 24;
        regs[super::regs::VERSION as usize] = (((entries as u32) - 1) << 16) | 0x20;
        // Hardware comes up with every entry masked.
        for entry in 0..entries as usize {
            regs[super::regs::REDIR_BASE as usize + 2 * entry] = 1 << 16;
        }
        let mut sim = SIM.lock().unwrap();
        sim.get_or_insert_with(HashMap::new)
            .insert(base, SimIoApic { regs });
    }

    /// Drop every simulated controller.
    pub fn reset() {
        *SIM.lock().unwrap() = None;
    }

    /// Force the read-only status bits of an entry's low half.
    pub fn poke_readonly_bits(base: u64, entry: u8, bits: u32) {
        let mut sim = SIM.lock().unwrap();
        let apic = sim.as_mut().unwrap().get_mut(&base).unwrap();
        apic.regs[super::regs::REDIR_BASE as usize + 2 * entry as usize] |=
            bits & ((1 << 12) | (1 << 14));
    }

    pub unsafe fn read_reg(base: u64, reg: u32) -> u32 {
        let sim = SIM.lock().unwrap();
        sim.as_ref()
            .and_then(|m| m.get(&base))
            .map(|apic| apic.regs[reg as usize])
            .unwrap_or(0)
    }

    pub unsafe fn write_reg(base: u64, reg: u32, value: u32) {
        let mut sim = SIM.lock().unwrap();
        let Some(apic) = sim.as_mut().and_then(|m| m.get_mut(&base)) else {
            return;
        };
        let slot = &mut apic.regs[reg as usize];
        if reg == super::regs::VERSION {
            return;
        }
        if reg >= super::regs::REDIR_BASE && (reg - super::regs::REDIR_BASE) % 2 == 0 {
            // Delivery status (12) and remote IRR (14) are read-only.
            const RO: u32 = (1 << 12) | (1 << 14);
            *slot = (value & !RO) | (*slot & RO);
        } else {
            *slot = value;
        }
    }
}

// =============================================================================
// Redirection Entry
// =============================================================================

/// Line polarity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Polarity {
    ActiveHigh,
    ActiveLow,
}

/// Trigger mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerMode {
    Edge,
    Level,
}

/// 64-bit redirection table entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct RedirectionEntry(u64);

impl RedirectionEntry {
    const MASK_BIT: u64 = 1 << 16;
    const POLARITY_BIT: u64 = 1 << 13;
    const TRIGGER_BIT: u64 = 1 << 15;

    /// Masked, otherwise empty entry.
    pub const fn masked() -> Self {
        Self(Self::MASK_BIT)
    }

    /// Routed entry: fixed delivery, physical destination, unmasked.
    pub fn routed(vector: u8, destination: u8, polarity: Polarity, trigger: TriggerMode) -> Self {
        let mut bits = vector as u64;
        if matches!(polarity, Polarity::ActiveLow) {
            bits |= Self::POLARITY_BIT;
        }
        if matches!(trigger, TriggerMode::Level) {
            bits |= Self::TRIGGER_BIT;
        }
        bits |= (destination as u64) << 56;
        Self(bits)
    }

    pub const fn from_bits(bits: u64) -> Self {
        Self(bits)
    }

    pub const fn bits(self) -> u64 {
        self.0
    }

    /// Interrupt vector (bits 0-7).
    pub const fn vector(self) -> u8 {
        self.0 as u8
    }

    /// Destination APIC ID (bits 56-63).
    pub const fn destination(self) -> u8 {
        (self.0 >> 56) as u8
    }

    pub const fn is_masked(self) -> bool {
        self.0 & Self::MASK_BIT != 0
    }

    pub fn set_masked(&mut self, masked: bool) {
        if masked {
            self.0 |= Self::MASK_BIT;
        } else {
            self.0 &= !Self::MASK_BIT;
        }
    }

    pub fn polarity(self) -> Polarity {
        if self.0 & Self::POLARITY_BIT != 0 {
            Polarity::ActiveLow
        } else {
            Polarity::ActiveHigh
        }
    }

    pub fn trigger_mode(self) -> TriggerMode {
        if self.0 & Self::TRIGGER_BIT != 0 {
            TriggerMode::Level
        } else {
            TriggerMode::Edge
        }
    }
}

// =============================================================================
// Controller
// =============================================================================

/// One I/O APIC controller.
#[derive(Debug, Clone, Copy)]
pub struct IoApic {
    base: u64,
    id: u8,
    gsi_base: u32,
    entry_count: u8,
}

impl IoApic {
    /// Probe the controller at `base`.
    ///
    /// # Safety
    ///
    /// `base` must map I/O APIC registers.
    pub unsafe fn probe(base: u64, gsi_base: u32) -> Self {
        let version = unsafe { mmio::read_reg(base, regs::VERSION) };
        let entry_count = (((version >> 16) & 0xFF) + 1) as u8;
        let id = (unsafe { mmio::read_reg(base, regs::ID) } >> 24) as u8;
        Self {
            base,
            id,
            gsi_base,
            entry_count,
        }
    }

    /// Controller ID.
    pub fn id(&self) -> u8 {
        self.id
    }

    /// First GSI owned by this controller.
    pub fn gsi_base(&self) -> u32 {
        self.gsi_base
    }

    /// Redirection entry count.
    pub fn entry_count(&self) -> u8 {
        self.entry_count
    }

    /// Whether `gsi` falls in this controller's range.
    pub fn owns_gsi(&self, gsi: u32) -> bool {
        gsi >= self.gsi_base && gsi < self.gsi_base + self.entry_count as u32
    }

    /// Read redirection entry `index`.
    pub fn read_entry(&self, index: u8) -> Result<RedirectionEntry, ApicError> {
        if index >= self.entry_count {
            return Err(ApicError::InvalidRedirectionEntry);
        }
        let reg = regs::REDIR_BASE + 2 * index as u32;
        let (low, high) = unsafe {
            (
                mmio::read_reg(self.base, reg),
                mmio::read_reg(self.base, reg + 1),
            )
        };
        Ok(RedirectionEntry::from_bits(
            (high as u64) << 32 | low as u64,
        ))
    }

    /// Write redirection entry `index`, high half first.
    pub fn write_entry(&self, index: u8, entry: RedirectionEntry) -> Result<(), ApicError> {
        if index >= self.entry_count {
            return Err(ApicError::InvalidRedirectionEntry);
        }
        let reg = regs::REDIR_BASE + 2 * index as u32;
        let bits = entry.bits();
        unsafe {
            mmio::write_reg(self.base, reg + 1, (bits >> 32) as u32);
            mmio::write_reg(self.base, reg, bits as u32);
        }
        Ok(())
    }

    /// Set only the mask bit of entry `index`, preserving the rest.
    pub fn set_entry_masked(&self, index: u8, masked: bool) -> Result<(), ApicError> {
        let mut entry = self.read_entry(index)?;
        entry.set_masked(masked);
        self.write_entry(index, entry)
    }

    /// Mask every entry.
    pub fn mask_all(&self) {
        for index in 0..self.entry_count {
            let _ = self.set_entry_masked(index, true);
        }
    }
}

// =============================================================================
// Registry
// =============================================================================

// One lock per controller covers the IOREGSEL/IOWIN pair.
static IOAPICS: [Mutex<Option<IoApic>>; MAX_IOAPICS] =
    [const { Mutex::new(None) }; MAX_IOAPICS];

/// Bring up every controller the topology reports: probe, mask all
/// entries, register.
///
/// # Safety
///
/// Stage 2 on the BSP; the MMIO ranges must be mapped.
pub unsafe fn init() -> Result<usize, ApicError> {
    let count = topology::ioapic_count();
    for index in 0..count {
        let Some(entry) = topology::ioapic(index) else {
            break;
        };
        let apic = unsafe { IoApic::probe(entry.address, entry.gsi_base) };
        apic.mask_all();
        log::info!(
            "ioapic {}: base {:#x}, GSI {}..{}",
            apic.id(),
            entry.address,
            apic.gsi_base(),
            apic.gsi_base() + apic.entry_count() as u32
        );
        *IOAPICS[index].lock() = Some(apic);
    }
    Ok(count)
}

/// Drop every registered controller.
#[cfg(test)]
pub(crate) fn reset_for_test() {
    for slot in &IOAPICS {
        *slot.lock() = None;
    }
}

/// Run `f` on the controller owning `gsi`, under its lock.
fn with_ioapic_for_gsi<R>(gsi: u32, f: impl FnOnce(&IoApic) -> R) -> Option<R> {
    for slot in &IOAPICS {
        let guard = slot.lock();
        if let Some(apic) = guard.as_ref() {
            if apic.owns_gsi(gsi) {
                return Some(f(apic));
            }
        }
    }
    None
}

// =============================================================================
// IRQ Routing
// =============================================================================

/// Resolved routing for an ISA-style IRQ.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IrqRoute {
    /// Global system interrupt the line actually appears on
    pub gsi: u32,
    /// Line polarity
    pub polarity: Polarity,
    /// Trigger mode
    pub trigger: TriggerMode,
}

/// Apply the MADT override table to an IRQ number.
///
/// Identity GSI with active-high/edge defaults unless the firmware says
/// otherwise.
pub fn resolve_irq(irq: u8) -> IrqRoute {
    match topology::interrupt_override(irq) {
        Some(ovr) => IrqRoute {
            gsi: ovr.gsi,
            polarity: if ovr.flags.is_active_low() {
                Polarity::ActiveLow
            } else {
                Polarity::ActiveHigh
            },
            trigger: if ovr.flags.is_level_triggered() {
                TriggerMode::Level
            } else {
                TriggerMode::Edge
            },
        },
        None => IrqRoute {
            gsi: irq as u32,
            polarity: Polarity::ActiveHigh,
            trigger: TriggerMode::Edge,
        },
    }
}

/// Route `irq` to `destination` with `vector`, unmasked.
///
/// Out-of-range IRQs and GSIs no controller owns are silently ignored;
/// the caller is the kernel and there is nothing useful to propagate.
pub fn set_irq_route(irq: u8, vector: u8, destination: u8) {
    if irq > MAX_ROUTED_IRQ {
        return;
    }
    let route = resolve_irq(irq);
    let entry = RedirectionEntry::routed(vector, destination, route.polarity, route.trigger);
    let written = with_ioapic_for_gsi(route.gsi, |apic| {
        let index = (route.gsi - apic.gsi_base()) as u8;
        apic.write_entry(index, entry)
    });
    if written.is_none() {
        log::debug!("ioapic: no controller owns GSI {} (IRQ {})", route.gsi, irq);
    }
}

/// Mask `irq`, preserving every other redirection field.
pub fn mask_irq(irq: u8) {
    if irq > MAX_ROUTED_IRQ {
        return;
    }
    let route = resolve_irq(irq);
    with_ioapic_for_gsi(route.gsi, |apic| {
        let index = (route.gsi - apic.gsi_base()) as u8;
        apic.set_entry_masked(index, true)
    });
}

/// Unmask `irq`, preserving every other redirection field.
pub fn unmask_irq(irq: u8) {
    if irq > MAX_ROUTED_IRQ {
        return;
    }
    let route = resolve_irq(irq);
    with_ioapic_for_gsi(route.gsi, |apic| {
        let index = (route.gsi - apic.gsi_base()) as u8;
        apic.set_entry_masked(index, false)
    });
}

/// Route the 16 ISA IRQs to the BSP at vectors 0x20-0x2F.
pub fn setup_isa_irqs() {
    let bsp = topology::bsp_apic_id() as u8;
    for irq in 0..16u8 {
        set_irq_route(irq, ISA_IRQ_BASE + irq, bsp);
    }
    log::info!("ioapic: ISA IRQs 0-15 routed to BSP at 0x20-0x2F");
}

/// Read back the redirection entry an IRQ resolves to.
pub fn irq_entry(irq: u8) -> Option<RedirectionEntry> {
    let route = resolve_irq(irq);
    with_ioapic_for_gsi(route.gsi, |apic| {
        let index = (route.gsi - apic.gsi_base()) as u8;
        apic.read_entry(index).ok()
    })
    .flatten()
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::x86_64::topology::{
        self, CpuEntry, CpuFlags, InterruptOverride, IoApicEntry, OverrideFlags,
    };

    const BASE: u64 = 0xFEC0_0000;

    fn setup(overrides: &[InterruptOverride]) -> std::sync::MutexGuard<'static, ()> {
        let guard = topology::TEST_LOCK.lock().unwrap();
        topology::reset_for_test();
        reset_for_test();
        mmio::reset();
        mmio::install(BASE, 0, 24);

        let cpus = [CpuEntry {
            apic_id: 0,
            flags: CpuFlags::ENABLED,
        }];
        let ioapics = [IoApicEntry {
            id: 0,
            address: BASE,
            gsi_base: 0,
        }];
        topology::populate(&cpus, &ioapics, overrides, 0, false).unwrap();
        unsafe { init().unwrap() };
        guard
    }

    #[test]
    fn test_probe_reads_version() {
        let _guard = setup(&[]);
        let apic = unsafe { IoApic::probe(BASE, 0) };
        assert_eq!(apic.entry_count(), 24);
        assert_eq!(apic.id(), 0);
        assert!(apic.owns_gsi(0));
        assert!(apic.owns_gsi(23));
        assert!(!apic.owns_gsi(24));
    }

    #[test]
    fn test_entry_write_read_round_trip() {
        let _guard = setup(&[]);
        let apic = unsafe { IoApic::probe(BASE, 0) };

        // Read-only bits set by "hardware" must survive a full rewrite.
        mmio::poke_readonly_bits(BASE, 3, (1 << 12) | (1 << 14));

        let entry = RedirectionEntry::routed(0x31, 4, Polarity::ActiveLow, TriggerMode::Level);
        apic.write_entry(3, entry).unwrap();
        let back = apic.read_entry(3).unwrap();

        const RO: u64 = (1 << 12) | (1 << 14);
        assert_eq!(back.bits() & !RO, entry.bits() & !RO);
        assert_eq!(back.bits() & RO, RO);
    }

    #[test]
    fn test_mask_unmask_preserves_fields() {
        let _guard = setup(&[]);
        let apic = unsafe { IoApic::probe(BASE, 0) };

        let entry = RedirectionEntry::routed(0x2A, 7, Polarity::ActiveLow, TriggerMode::Level);
        apic.write_entry(5, entry).unwrap();

        apic.set_entry_masked(5, true).unwrap();
        let masked = apic.read_entry(5).unwrap();
        assert!(masked.is_masked());

        apic.set_entry_masked(5, false).unwrap();
        let unmasked = apic.read_entry(5).unwrap();
        assert_eq!(unmasked.bits(), entry.bits());
    }

    #[test]
    fn test_route_stores_vector_and_destination() {
        let _guard = setup(&[]);
        set_irq_route(4, 0x24, 9);
        let entry = irq_entry(4).unwrap();
        assert_eq!(entry.bits() & 0xFF, 0x24);
        assert_eq!(entry.bits() >> 56, 9);
        assert!(!entry.is_masked());
    }

    #[test]
    fn test_override_redirects_to_other_entry() {
        let overrides = [InterruptOverride {
            source_irq: 0,
            gsi: 2,
            flags: OverrideFlags::from_bits_truncate(0x000D),
        }];
        let _guard = setup(&overrides);

        set_irq_route(0, 0x20, 0);

        let apic = unsafe { IoApic::probe(BASE, 0) };
        // Entry 2 carries the route; entry 0 stays masked.
        let routed = apic.read_entry(2).unwrap();
        assert_eq!(routed.vector(), 0x20);
        assert_eq!(routed.polarity(), Polarity::ActiveLow);
        assert_eq!(routed.trigger_mode(), TriggerMode::Level);
        assert!(!routed.is_masked());
        assert!(apic.read_entry(0).unwrap().is_masked());
    }

    #[test]
    fn test_setup_isa_irqs_matches_boot_layout() {
        let _guard = setup(&[]);
        setup_isa_irqs();

        let entry = irq_entry(1).unwrap();
        assert_eq!(entry.vector(), 0x21);
        assert_eq!(entry.destination(), 0);
        assert!(!entry.is_masked());
        assert_eq!(entry.polarity(), Polarity::ActiveHigh);
        assert_eq!(entry.trigger_mode(), TriggerMode::Edge);
    }

    #[test]
    fn test_out_of_range_irq_ignored() {
        let _guard = setup(&[]);
        set_irq_route(24, 0x50, 0);
        mask_irq(24);
        // Nothing to assert beyond "does not panic": entry 24 does not
        // exist and no controller was touched.
        assert!(irq_entry(23).is_some());
    }
}
