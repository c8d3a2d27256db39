//! Platform-specific hypervisor backends
//!
//! Only built for bare-metal guests; hosted targets (including the test
//! build) talk to a [`crate::hypervisor::Hypervisor`] implementation of their
//! own instead.

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
mod x86_64;

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
pub use x86_64::{hypercall, util, PvHypervisor};
