//! # Architecture Selection
//!
//! Compile-time dispatch to the active architecture implementation. There
//! is no runtime indirection here: the kernel is built for exactly one
//! target and the facade resolves to that target's module.

cfg_if::cfg_if! {
    if #[cfg(target_arch = "x86_64")] {
        pub mod x86_64;
        pub use x86_64::{Architecture, KernelHooks};
    } else {
        compile_error!("unsupported target architecture");
    }
}
