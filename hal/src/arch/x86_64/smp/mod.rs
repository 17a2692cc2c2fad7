//! # Symmetric Multi-Processing
//!
//! Per-CPU state and secondary CPU bring-up.
//!
//! ## Boot Sequence
//!
//! 1. BSP anchors its own per-CPU record in stage 2
//! 2. Trampoline lands in low memory, mailbox patched per AP
//! 3. INIT-SIPI-SIPI per AP, serial, bounded waits
//! 4. Each AP runs the installed init callback, publishes its alive
//!    flag and parks behind the release gate
//! 5. The BSP tells the scheduler to go SMP and opens the gate

pub mod per_cpu;
pub mod startup;
pub mod trampoline;

pub use per_cpu::{current_cpu_index, is_bsp, PerCpuData};
pub use startup::{
    release_secondary_cpus, set_ap_init, start_secondary_cpus, SmpError, AP_STACK_SIZE,
};
pub use trampoline::{TRAMPOLINE_BASE, TRAMPOLINE_SIPI_VECTOR};

use crate::arch::x86_64::topology;

/// Number of CPUs known to the system. One until the topology is
/// populated.
#[inline]
pub fn cpu_count() -> usize {
    topology::cpu_count()
}

/// Index of the calling CPU; 0 before its per-CPU record exists.
#[inline]
pub fn current_cpu() -> usize {
    if per_cpu::is_initialized() {
        per_cpu::current_cpu_index()
    } else {
        0
    }
}
