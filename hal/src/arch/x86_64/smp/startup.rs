//! # Secondary CPU Bring-up
//!
//! INIT-SIPI-SIPI, one AP at a time:
//!
//! 1. Copy the trampoline to low memory and patch its mailbox
//! 2. INIT IPI, wait 10 ms
//! 3. First SIPI, wait 200 µs
//! 4. Second SIPI, wait 200 µs
//! 5. Poll the AP's alive flag, bounded
//!
//! An AP that never acknowledges is marked failed in the topology and
//! bring-up moves on; a machine with a dead socket still boots.
//!
//! The alive flag is a sequentially consistent store on the AP side and
//! load on the BSP side; that pair is the entire publication protocol.

use core::sync::atomic::{AtomicBool, Ordering};

use super::trampoline::{self, TrampolineMailbox, TRAMPOLINE_SIPI_VECTOR};
use crate::arch::x86_64::apic::ipi;
use crate::arch::x86_64::core::control_regs::read_cr3;
use crate::arch::x86_64::interrupts::idt;
use crate::arch::x86_64::segmentation;
use crate::arch::x86_64::timers;
use crate::arch::x86_64::topology::{self, MAX_CPUS};

// =============================================================================
// Tunables
// =============================================================================

/// Stack handed to each AP.
pub const AP_STACK_SIZE: usize = 64 * 1024;

/// Wait after the INIT IPI.
const INIT_WAIT_NS: u64 = 10_000_000; // 10 ms

/// Wait after each SIPI.
const SIPI_WAIT_NS: u64 = 200_000; // 200 µs

/// Bound on waiting for an AP's alive flag.
const ALIVE_TIMEOUT_NS: u64 = 200_000_000; // 200 ms

/// Poll step while waiting for the alive flag.
const ALIVE_POLL_NS: u64 = 1_000_000; // 1 ms

// =============================================================================
// Errors
// =============================================================================

/// Bring-up failure modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SmpError {
    /// Bring-up ran twice
    AlreadyStarted,
    /// No allocator hook to carve AP stacks from
    NoStackAllocator,
    /// Allocator returned null
    StackAllocationFailed,
    /// AP never published its alive flag
    ApTimeout,
}

impl core::fmt::Display for SmpError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            SmpError::AlreadyStarted => write!(f, "secondary CPUs already started"),
            SmpError::NoStackAllocator => write!(f, "no allocator for AP stacks"),
            SmpError::StackAllocationFailed => write!(f, "AP stack allocation failed"),
            SmpError::ApTimeout => write!(f, "AP did not acknowledge startup"),
        }
    }
}

// =============================================================================
// Shared State
// =============================================================================

static STARTED: AtomicBool = AtomicBool::new(false);

/// Alive flags, one per CPU index. Written by the AP, read by the BSP.
static AP_ALIVE: [AtomicBool; MAX_CPUS] = {
    #[allow(clippy::declare_interior_mutable_const)]
    const DEAD: AtomicBool = AtomicBool::new(false);
    [DEAD; MAX_CPUS]
};

/// APs spin here after acknowledging until the BSP opens the gate.
static RELEASE_GATE: AtomicBool = AtomicBool::new(false);

/// Per-AP work performed once the trampoline handed over to Rust.
/// Installed by the facade before bring-up starts.
pub type ApInitFn = fn(cpu_index: usize);

static AP_INIT: core::sync::atomic::AtomicPtr<()> =
    core::sync::atomic::AtomicPtr::new(core::ptr::null_mut());

/// Install the per-AP initialization callback.
pub fn set_ap_init(f: ApInitFn) {
    AP_INIT.store(f as *mut (), Ordering::Release);
}

// =============================================================================
// AP Entry
// =============================================================================

/// First Rust code an AP executes. The trampoline has already loaded the
/// shared GDT/IDT and a private stack.
pub extern "C" fn ap_entry(cpu_index: usize) -> ! {
    // Segment reload through the shared table; the trampoline left the
    // kernel selectors in place but the reload keeps the hidden parts
    // canonical.
    unsafe {
        segmentation::load_on_ap();
    }

    let init = AP_INIT.load(Ordering::Acquire);
    if !init.is_null() {
        let init: ApInitFn = unsafe { core::mem::transmute::<*mut (), ApInitFn>(init) };
        init(cpu_index);
    }

    topology::mark_cpu_online(cpu_index);

    // Publish liveness. The BSP's poll loop pairs with this store.
    AP_ALIVE[cpu_index].store(true, Ordering::SeqCst);

    while !RELEASE_GATE.load(Ordering::Acquire) {
        core::hint::spin_loop();
    }

    // The scheduler owns this CPU from here; until it dispatches, sleep
    // between interrupts.
    unsafe {
        crate::arch::x86_64::core::control_regs::enable_interrupts();
    }
    loop {
        crate::arch::x86_64::core::control_regs::halt();
    }
}

// =============================================================================
// BSP Side
// =============================================================================

/// Carve a stack for one AP out of the stage-2 heap.
fn allocate_ap_stack(alloc_zeroed: fn(usize) -> *mut u8) -> Result<u64, SmpError> {
    let base = alloc_zeroed(AP_STACK_SIZE);
    if base.is_null() {
        return Err(SmpError::StackAllocationFailed);
    }
    // Align the top and bias by 8 so the entry point sees a call-shaped
    // stack.
    let top = (base as u64 + AP_STACK_SIZE as u64) & !0xF;
    Ok(top - 8)
}

/// Start one AP through INIT-SIPI-SIPI. Returns once the AP published
/// its alive flag, or with a timeout error.
///
/// # Safety
///
/// BSP only, trampoline installed, `mailbox` pointing at the live copy.
unsafe fn start_one_ap(
    mailbox: *mut TrampolineMailbox,
    cpu_index: usize,
    apic_id: u32,
    stack_top: u64,
) -> Result<(), SmpError> {
    unsafe {
        (*mailbox).stack = stack_top;
        (*mailbox).cpu_index = cpu_index as u64;
    }
    crate::arch::x86_64::core::atomics::memory_barrier();

    unsafe {
        ipi::send_init(apic_id);
        timers::busy_wait_ns(INIT_WAIT_NS);

        ipi::send_startup(apic_id, TRAMPOLINE_SIPI_VECTOR);
        timers::busy_wait_ns(SIPI_WAIT_NS);

        if !AP_ALIVE[cpu_index].load(Ordering::SeqCst) {
            ipi::send_startup(apic_id, TRAMPOLINE_SIPI_VECTOR);
            timers::busy_wait_ns(SIPI_WAIT_NS);
        }
    }

    let mut waited = 0;
    while waited < ALIVE_TIMEOUT_NS {
        if AP_ALIVE[cpu_index].load(Ordering::SeqCst) {
            return Ok(());
        }
        timers::busy_wait_ns(ALIVE_POLL_NS);
        waited += ALIVE_POLL_NS;
    }
    Err(SmpError::ApTimeout)
}

/// Bring up every non-BSP CPU the topology reports.
///
/// Returns the number of APs now online. CPUs that time out are marked
/// failed and skipped.
///
/// # Safety
///
/// Stage 2 on the BSP, interrupts still disabled, low memory
/// identity-mapped.
pub unsafe fn start_secondary_cpus(alloc_zeroed: fn(usize) -> *mut u8) -> Result<usize, SmpError> {
    if STARTED.swap(true, Ordering::SeqCst) {
        return Err(SmpError::AlreadyStarted);
    }

    let mailbox = unsafe { trampoline::install() };
    let gdt_pointer = segmentation::gdt_pointer();
    let idt_pointer = idt::idt_pointer();
    unsafe {
        (*mailbox).cr3 = read_cr3();
        (*mailbox).entry = ap_entry as u64;
        (*mailbox).gdt_limit = gdt_pointer.limit;
        (*mailbox).gdt_base = gdt_pointer.base;
        (*mailbox).idt_limit = idt_pointer.limit;
        (*mailbox).idt_base = idt_pointer.base;
    }

    let bsp_apic = topology::bsp_apic_id();
    let mut online = 0usize;

    for index in 0..topology::cpu_count() {
        let Some(cpu) = topology::cpu(index) else {
            break;
        };
        if cpu.apic_id == bsp_apic {
            continue;
        }

        let stack_top = allocate_ap_stack(alloc_zeroed)?;
        match unsafe { start_one_ap(mailbox, index, cpu.apic_id, stack_top) } {
            Ok(()) => {
                online += 1;
                log::debug!("smp: CPU {} (APIC {}) online", index, cpu.apic_id);
            }
            Err(err) => {
                topology::mark_cpu_failed(index);
                log::warn!("smp: CPU {} (APIC {}) failed: {}", index, cpu.apic_id, err);
            }
        }
    }

    log::info!("smp: {} secondary CPU(s) online", online);
    Ok(online)
}

/// Open the gate the APs are parked behind.
pub fn release_secondary_cpus() {
    RELEASE_GATE.store(true, Ordering::Release);
}

/// Whether CPU `index` has published its alive flag.
pub fn is_cpu_alive(index: usize) -> bool {
    index < MAX_CPUS && AP_ALIVE[index].load(Ordering::SeqCst)
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stack_alignment_bias() {
        fn fake_alloc(size: usize) -> *mut u8 {
            // Leaked on purpose; the test process is short-lived.
            let layout = std::alloc::Layout::from_size_align(size, 16).unwrap();
            unsafe { std::alloc::alloc_zeroed(layout) }
        }
        let top = allocate_ap_stack(fake_alloc).unwrap();
        // Call-shaped: 8 below a 16-byte boundary.
        assert_eq!(top % 16, 8);
    }

    #[test]
    fn test_null_allocator_reported() {
        fn broken_alloc(_size: usize) -> *mut u8 {
            core::ptr::null_mut()
        }
        assert_eq!(
            allocate_ap_stack(broken_alloc),
            Err(SmpError::StackAllocationFailed)
        );
    }

    #[test]
    fn test_alive_flags_default_clear() {
        assert!(!is_cpu_alive(MAX_CPUS - 2));
        assert!(!is_cpu_alive(MAX_CPUS + 5));
    }
}
