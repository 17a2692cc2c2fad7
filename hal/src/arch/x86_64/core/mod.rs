//! # CPU Primitives
//!
//! Thin, typed bindings over the privileged x86-64 instruction set. Every
//! function here is a one-to-one wrapper around a single instruction (or a
//! short fixed sequence); policy lives in the callers.
//!
//! - [`control_regs`]: CR0-CR4, XCR0, RFLAGS, interrupt flag, TLB control
//! - [`msr`]: RDMSR/WRMSR and the architecturally named MSRs
//! - [`ports`]: byte/word/dword port I/O
//! - [`cpuid`]: CPUID enumeration and the feature record
//! - [`atomics`]: sequentially consistent atomics on raw cells
//! - [`fpu`]: FXSAVE/XSAVE extended-state management
//!
//! Misuse of these primitives does not fail in-band. A write to a reserved
//! MSR or control-register bit raises #GP, which surfaces through the
//! interrupt dispatcher like any other exception.

pub mod atomics;
pub mod control_regs;
pub mod cpuid;
pub mod fpu;
pub mod msr;
pub mod ports;

pub use control_regs::{
    are_interrupts_enabled, disable_interrupts, enable_interrupts, halt, halt_forever, RFlags,
};
pub use cpuid::CpuFeatures;
