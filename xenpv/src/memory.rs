//! Memory constants and location wrapper types
//!
//! Wrapper types keep guest-physical and machine frame numbers from being
//! confused at grant and mapping call sites.

/// Smallest unit of memory the hypervisor shares or maps
pub const PAGE_SIZE: usize = 4096;

/// log2 of [`PAGE_SIZE`]
pub const PAGE_SHIFT: usize = 12;

/// Machine (host-physical) frame number
///
/// Grant entries carry machine frames; a remote domain maps them without any
/// further translation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MachineFrameNumber(pub usize);

/// Guest-physical frame number
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageFrameNumber(pub usize);
