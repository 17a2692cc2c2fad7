//! # Borealis Hardware Abstraction Layer
//!
//! Architecture support for the Borealis kernel. The HAL owns everything
//! that talks to the CPU directly: descriptor tables, interrupt dispatch,
//! the interrupt controllers, time sources, per-CPU state and secondary
//! CPU bring-up. The rest of the kernel reaches the machine exclusively
//! through [`arch`].
//!
//! ## Initialization
//!
//! The HAL comes up in two stages:
//!
//! 1. **Stage 1** runs right after the bootloader hands over control, with
//!    no heap. It loads the GDT/TSS and IDT and clears the interrupt
//!    handler table. All stage-1 state lives in zero-initialized statics.
//! 2. **Stage 2** runs once the kernel heap is up. It populates the CPU
//!    topology, brings up the time sources and interrupt controllers,
//!    starts the secondary CPUs and finally enables interrupts.
//!
//! External collaborators (virtual memory, exception dispatch, the
//! scheduler) are wired in through [`arch::KernelHooks`] before stage 1.

#![cfg_attr(not(test), no_std)]

pub mod arch;

pub use arch::{Architecture, KernelHooks};
