//! # x86-64 Architecture Layer
//!
//! Brings the CPU from post-bootloader state to a fully usable
//! multi-processor machine and exports the capability surface the rest
//! of the kernel runs on.
//!
//! ## Module Map
//!
//! - [`core`]: privileged instruction bindings
//! - [`segmentation`]: GDT and TSS
//! - [`interrupts`]: IDT, ISR stubs, dispatch
//! - [`apic`]: local APIC, I/O APIC, legacy PIC shutdown
//! - [`timers`]: HPET, TSC, RTC
//! - [`topology`]: MADT-derived machine description
//! - [`smp`]: per-CPU state and AP bring-up
//! - [`context`]: context-switch primitives
//!
//! ## Boot Protocol
//!
//! **Stage 1** runs without a heap, right after the bootloader:
//! descriptor tables up, handler table cleared, then the virtual-memory
//! hook. **Stage 2** runs once the heap allocator works: topology,
//! exception handling, time sources, interrupt controllers, secondary
//! CPUs, and finally `sti`.
//!
//! Stage 1 is idempotent. Stage 2 runs exactly once.

pub mod apic;
mod cell;
pub mod context;
pub mod core;
pub mod interrupts;
pub mod segmentation;
pub mod smp;
pub mod timers;
pub mod topology;

use ::core::sync::atomic::{AtomicBool, AtomicPtr, Ordering};

use self::cell::BootCell;
use self::interrupts::{ExceptionDispatcher, InterruptHandler};

// =============================================================================
// Kernel Hooks
// =============================================================================

/// Entry points into the external collaborators this layer drives but
/// does not own. Installed once, before stage 1.
#[derive(Clone, Copy, Default)]
pub struct KernelHooks {
    /// Virtual-memory bring-up, called at the end of stage 1.
    pub virtual_memory_init: Option<fn()>,
    /// Exception-handling bring-up, called early in stage 2.
    pub exception_handling_init: Option<fn()>,
    /// Per-fault recovery check consulted before a fatal halt.
    pub dispatch_exception: Option<ExceptionDispatcher>,
    /// Zeroed allocation from the stage-2 heap. Null on exhaustion.
    pub alloc_zeroed: Option<fn(usize) -> *mut u8>,
    /// Scheduler callback creating the idle thread of a fresh CPU.
    pub scheduler_init_secondary_cpu: Option<fn(usize)>,
    /// Scheduler switch to multi-processor dispatch.
    pub scheduler_enable_smp: Option<fn()>,
}

impl ::core::fmt::Debug for KernelHooks {
    fn fmt(&self, f: &mut ::core::fmt::Formatter<'_>) -> ::core::fmt::Result {
        f.debug_struct("KernelHooks")
            .field("virtual_memory_init", &self.virtual_memory_init.is_some())
            .field(
                "exception_handling_init",
                &self.exception_handling_init.is_some(),
            )
            .field("dispatch_exception", &self.dispatch_exception.is_some())
            .field("alloc_zeroed", &self.alloc_zeroed.is_some())
            .field(
                "scheduler_init_secondary_cpu",
                &self.scheduler_init_secondary_cpu.is_some(),
            )
            .field("scheduler_enable_smp", &self.scheduler_enable_smp.is_some())
            .finish()
    }
}

static HOOKS: BootCell<KernelHooks> = BootCell::new(KernelHooks {
    virtual_memory_init: None,
    exception_handling_init: None,
    dispatch_exception: None,
    alloc_zeroed: None,
    scheduler_init_secondary_cpu: None,
    scheduler_enable_smp: None,
});

fn hooks() -> KernelHooks {
    *unsafe { HOOKS.get() }
}

// =============================================================================
// Stage-2 Configuration
// =============================================================================

/// Everything stage 2 needs from the firmware tables, gathered by the
/// ACPI layer.
#[derive(Debug, Clone, Copy)]
pub struct Stage2Config<'a> {
    /// MADT processor records
    pub cpus: &'a [topology::CpuEntry],
    /// MADT I/O APIC records
    pub ioapics: &'a [topology::IoApicEntry],
    /// MADT interrupt-source overrides
    pub overrides: &'a [topology::InterruptOverride],
    /// MADT PCAT_COMPAT: dual 8259s present
    pub has_legacy_pics: bool,
    /// HPET register block, when the HPET table exists
    pub hpet_base: Option<u64>,
    /// Scheduler tick period
    pub timer_period_ms: u64,
}

/// Stage-2 failure modes. Hardware absence is not among them; missing
/// devices degrade with a log line instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchError {
    /// Stage 2 before stage 1, or twice
    BadStage,
    /// Firmware tables unusable
    Topology(topology::TopologyError),
    /// Local APIC missing or broken
    Apic(apic::ApicError),
    /// Secondary CPU bring-up could not run at all
    Smp(smp::SmpError),
}

impl ::core::fmt::Display for ArchError {
    fn fmt(&self, f: &mut ::core::fmt::Formatter<'_>) -> ::core::fmt::Result {
        match self {
            ArchError::BadStage => write!(f, "architecture init called out of order"),
            ArchError::Topology(e) => write!(f, "topology: {e}"),
            ArchError::Apic(e) => write!(f, "apic: {e}"),
            ArchError::Smp(e) => write!(f, "smp: {e}"),
        }
    }
}

// =============================================================================
// Facade State
// =============================================================================

static STAGE1_COMPLETE: AtomicBool = AtomicBool::new(false);
static STAGE2_COMPLETE: AtomicBool = AtomicBool::new(false);

/// Throw entry point registered by the exception-handling subsystem.
static THROW_FN: AtomicPtr<()> = AtomicPtr::new(::core::ptr::null_mut());
/// Rethrow entry point registered by the exception-handling subsystem.
static RETHROW_FN: AtomicPtr<()> = AtomicPtr::new(::core::ptr::null_mut());

/// APIC ID of the calling CPU straight from CPUID, usable before the
/// local APIC driver is up.
fn initial_apic_id() -> u32 {
    core::cpuid::cpuid(1).ebx >> 24
}

// =============================================================================
// Architecture Facade
// =============================================================================

/// The architecture capability surface.
///
/// A compile-time singleton: every method is an associated function and
/// all state lives in statics, so calls resolve with no indirection.
#[derive(Debug)]
pub struct Architecture;

impl Architecture {
    // -------------------------------------------------------------------------
    // Staged Initialization
    // -------------------------------------------------------------------------

    /// Install the collaborator entry points. Must precede stage 1;
    /// later installs are ignored once stage 2 completed.
    pub fn install_hooks(new_hooks: KernelHooks) {
        if STAGE2_COMPLETE.load(Ordering::Acquire) {
            return;
        }
        unsafe {
            *HOOKS.get_mut() = new_hooks;
        }
    }

    /// Stage 1: descriptor tables and interrupt plumbing, no heap.
    ///
    /// Idempotent; the first call wins.
    ///
    /// # Safety
    ///
    /// Ring 0 on the bootstrap processor, before any other CPU runs.
    pub unsafe fn init_stage1() {
        if STAGE1_COMPLETE.swap(true, Ordering::SeqCst) {
            return;
        }

        core::control_regs::disable_interrupts();

        unsafe {
            segmentation::init();
            interrupts::init();
        }

        if let Some(vm_init) = hooks().virtual_memory_init {
            vm_init();
        }

        log::info!("arch: stage 1 complete");
    }

    /// Stage 2: topology, time, interrupt controllers, secondary CPUs,
    /// then enable interrupts.
    ///
    /// Called exactly once, after the heap allocator works.
    ///
    /// # Safety
    ///
    /// Ring 0 on the BSP; stage 1 complete; MMIO ranges and low memory
    /// identity-mapped by the virtual-memory layer.
    pub unsafe fn init_stage2(config: Stage2Config<'_>) -> Result<(), ArchError> {
        if !STAGE1_COMPLETE.load(Ordering::Acquire) || STAGE2_COMPLETE.load(Ordering::Acquire) {
            return Err(ArchError::BadStage);
        }

        let bsp_apic_id = initial_apic_id();
        topology::populate(
            config.cpus,
            config.ioapics,
            config.overrides,
            bsp_apic_id,
            config.has_legacy_pics,
        )
        .map_err(ArchError::Topology)?;

        // The BSP's per-CPU record exists before any scheduler code or
        // AP can look for it.
        let bsp_index = topology::cpu_index_for_apic_id(bsp_apic_id).unwrap_or(0);
        unsafe {
            smp::per_cpu::init_current_cpu(bsp_index, true);
        }

        let hooks = hooks();

        if let Some(exception_init) = hooks.exception_handling_init {
            exception_init();
        }
        interrupts::set_exception_dispatcher(hooks.dispatch_exception);

        unsafe {
            timers::init(config.hpet_base);
            apic::init_bsp(config.timer_period_ms).map_err(ArchError::Apic)?;
        }

        if topology::cpu_count() > 1 {
            smp::set_ap_init(secondary_cpu_init);
            let alloc = hooks.alloc_zeroed.ok_or(ArchError::Smp(
                smp::SmpError::NoStackAllocator,
            ))?;
            unsafe {
                smp::start_secondary_cpus(alloc).map_err(ArchError::Smp)?;
            }
        }

        if let Some(enable_smp) = hooks.scheduler_enable_smp {
            enable_smp();
        }
        smp::release_secondary_cpus();

        STAGE2_COMPLETE.store(true, Ordering::SeqCst);
        unsafe {
            core::control_regs::enable_interrupts();
        }

        log::info!(
            "arch: stage 2 complete ({} CPU(s), timer {} Hz)",
            topology::cpu_count(),
            apic::local::timer_frequency()
        );
        Ok(())
    }

    /// Whether stage 1 finished.
    #[inline]
    pub fn is_stage1_complete() -> bool {
        STAGE1_COMPLETE.load(Ordering::Acquire)
    }

    /// Whether stage 2 finished. Implies interrupts are enabled and the
    /// timer is ticking on every online CPU.
    #[inline]
    pub fn is_stage2_complete() -> bool {
        STAGE2_COMPLETE.load(Ordering::Acquire)
    }

    // -------------------------------------------------------------------------
    // Sizes
    // -------------------------------------------------------------------------

    /// Bytes the scheduler reserves per thread context.
    #[inline]
    pub fn context_size() -> usize {
        context::context_size()
    }

    /// Bytes of one extended-state save area.
    #[inline]
    pub fn extended_state_size() -> usize {
        core::fpu::extended_state_size()
    }

    // -------------------------------------------------------------------------
    // CPU Identity
    // -------------------------------------------------------------------------

    /// Number of usable CPUs.
    #[inline]
    pub fn cpu_count() -> usize {
        smp::cpu_count()
    }

    /// Zero-based index of the calling CPU.
    #[inline]
    pub fn current_cpu_index() -> usize {
        smp::current_cpu()
    }

    /// Whether the calling CPU is the bootstrap processor.
    #[inline]
    pub fn is_bsp() -> bool {
        if smp::per_cpu::is_initialized() {
            smp::per_cpu::is_bsp()
        } else {
            // Before per-CPU state exists only the BSP runs.
            true
        }
    }

    // -------------------------------------------------------------------------
    // Interrupts
    // -------------------------------------------------------------------------

    /// Install a handler for `vector`. Out-of-range is a silent no-op.
    #[inline]
    pub fn register_interrupt_handler(vector: usize, handler: InterruptHandler) {
        interrupts::register_handler(vector, handler);
    }

    /// Remove the handler for `vector`. Out-of-range is a silent no-op.
    #[inline]
    pub fn unregister_interrupt_handler(vector: usize) {
        interrupts::unregister_handler(vector);
    }

    /// Clear RFLAGS.IF on the calling CPU.
    #[inline]
    pub fn disable_interrupts() {
        core::control_regs::disable_interrupts();
    }

    /// Set RFLAGS.IF on the calling CPU.
    ///
    /// # Safety
    ///
    /// Stage 1 must have loaded the IDT.
    #[inline]
    pub unsafe fn enable_interrupts() {
        unsafe { core::control_regs::enable_interrupts() }
    }

    /// Whether RFLAGS.IF is set on the calling CPU.
    #[inline]
    pub fn interrupts_enabled() -> bool {
        core::control_regs::are_interrupts_enabled()
    }

    /// Acknowledge an in-service interrupt at the local APIC.
    ///
    /// The vector is accepted for symmetry with handler signatures; the
    /// EOI register acknowledges the highest in-service interrupt
    /// regardless.
    #[inline]
    pub fn end_of_interrupt(_vector: u8) {
        apic::end_of_interrupt();
    }

    /// Halt until the next interrupt.
    #[inline]
    pub fn halt() {
        core::control_regs::halt();
    }

    /// Trigger a debug breakpoint.
    #[inline]
    pub fn breakpoint() {
        core::control_regs::breakpoint();
    }

    // -------------------------------------------------------------------------
    // Time
    // -------------------------------------------------------------------------

    /// Timer ticks delivered since the periodic timer started.
    #[inline]
    pub fn tick_count() -> u64 {
        apic::local::tick_count()
    }

    /// Calibrated APIC timer frequency in Hz.
    #[inline]
    pub fn timer_frequency() -> u64 {
        apic::local::timer_frequency()
    }

    /// Busy-wait for `ns` nanoseconds.
    #[inline]
    pub fn busy_wait_ns(ns: u64) {
        timers::busy_wait_ns(ns);
    }

    /// Busy-wait for `ms` milliseconds.
    #[inline]
    pub fn busy_wait_ms(ms: u64) {
        timers::busy_wait_ms(ms);
    }

    // -------------------------------------------------------------------------
    // Exception Plumbing
    // -------------------------------------------------------------------------

    /// Register the throw entry point of the exception subsystem.
    pub fn set_throw_fn_ptr(ptr: *const ()) {
        THROW_FN.store(ptr as *mut (), Ordering::Release);
    }

    /// Register the rethrow entry point of the exception subsystem.
    pub fn set_rethrow_fn_ptr(ptr: *const ()) {
        RETHROW_FN.store(ptr as *mut (), Ordering::Release);
    }

    /// Throw entry point, null until the exception subsystem is up.
    pub fn throw_fn_ptr() -> *const () {
        THROW_FN.load(Ordering::Acquire) as *const ()
    }

    /// Rethrow entry point, null until the exception subsystem is up.
    pub fn rethrow_fn_ptr() -> *const () {
        RETHROW_FN.load(Ordering::Acquire) as *const ()
    }

    // -------------------------------------------------------------------------
    // SMP
    // -------------------------------------------------------------------------

    /// Per-CPU half of bring-up, run by each AP out of the trampoline.
    ///
    /// # Safety
    ///
    /// Must execute on the CPU being initialized, with the shared
    /// descriptor tables already loaded.
    pub unsafe fn init_secondary_cpu(cpu_index: usize) {
        secondary_cpu_init(cpu_index);
    }

    /// Start every non-BSP CPU. Normally driven by stage 2; exposed for
    /// kernels that defer SMP.
    ///
    /// # Safety
    ///
    /// Same requirements as the SMP phase of [`Architecture::init_stage2`].
    pub unsafe fn start_secondary_cpus() -> Result<usize, ArchError> {
        let alloc = hooks()
            .alloc_zeroed
            .ok_or(ArchError::Smp(smp::SmpError::NoStackAllocator))?;
        smp::set_ap_init(secondary_cpu_init);
        unsafe { smp::start_secondary_cpus(alloc).map_err(ArchError::Smp) }
    }

    /// Send an IPI to the CPU at `cpu_index`.
    ///
    /// # Safety
    ///
    /// Local APIC up; `vector` ≥ 32.
    pub unsafe fn send_ipi(cpu_index: usize, vector: u8) {
        if let Some(cpu) = topology::cpu(cpu_index) {
            unsafe { apic::send_ipi(cpu.apic_id, vector) }
        }
    }

    /// Broadcast an IPI to every CPU but the caller.
    ///
    /// # Safety
    ///
    /// Local APIC up; `vector` ≥ 32.
    pub unsafe fn broadcast_ipi(vector: u8) {
        unsafe { apic::broadcast_ipi(vector) }
    }
}

/// Per-AP initialization run out of the trampoline, before the alive
/// flag is published.
fn secondary_cpu_init(cpu_index: usize) {
    unsafe {
        interrupts::init_for_ap();
        smp::per_cpu::init_current_cpu(cpu_index, false);
        if let Err(err) = apic::init_ap() {
            log::warn!("arch: CPU {cpu_index} local APIC init failed: {err}");
        }
    }

    if let Some(init_secondary) = hooks().scheduler_init_secondary_cpu {
        init_secondary(cpu_index);
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    extern "C" fn nop_handler(_frame: &mut interrupts::InterruptFrame) {}

    #[test]
    fn test_stage_flags_start_clear() {
        // The test binary never runs the privileged init paths.
        assert!(!Architecture::is_stage2_complete());
    }

    #[test]
    fn test_context_size_is_plausible() {
        let size = Architecture::context_size();
        assert!(size >= 128 + 512);
        assert!(Architecture::extended_state_size() >= 512);
    }

    #[test]
    fn test_handler_registration_round_trip() {
        let _guard = interrupts::dispatch::TEST_LOCK.lock().unwrap();
        Architecture::register_interrupt_handler(0x77, nop_handler);
        assert!(interrupts::dispatch::handler_for(0x77).is_some());
        Architecture::unregister_interrupt_handler(0x77);
        assert!(interrupts::dispatch::handler_for(0x77).is_none());
        // Out of range: no-op, no panic.
        Architecture::register_interrupt_handler(4096, nop_handler);
    }

    #[test]
    fn test_throw_pointer_round_trip() {
        fn marker() {}
        Architecture::set_throw_fn_ptr(marker as *const ());
        assert_eq!(Architecture::throw_fn_ptr(), marker as *const ());
        Architecture::set_rethrow_fn_ptr(marker as *const ());
        assert_eq!(Architecture::rethrow_fn_ptr(), marker as *const ());
    }

    #[test]
    fn test_hooks_report_presence() {
        let hooks = KernelHooks::default();
        let debug = format!("{hooks:?}");
        assert!(debug.contains("alloc_zeroed: false"));
    }
}
