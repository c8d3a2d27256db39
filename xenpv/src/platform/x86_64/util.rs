//! Utility functions

use core::arch::asm;

/// Synchronised bit set
///
/// # Safety
///
/// `addr` must point to memory valid for a locked read-modify-write of the
/// 64-bit word containing bit `nr`.
pub unsafe fn synch_set_bit(nr: u64, addr: *mut u64) {
    asm!("lock", "bts [{}], {}", in(reg) addr, in(reg) nr);
}

/// Synchronised bit clear
///
/// # Safety
///
/// `addr` must point to memory valid for a locked read-modify-write of the
/// 64-bit word containing bit `nr`.
pub unsafe fn synch_clear_bit(nr: u64, addr: *mut u64) {
    asm!("lock", "btr [{}], {}", in(reg) addr, in(reg) nr);
}
