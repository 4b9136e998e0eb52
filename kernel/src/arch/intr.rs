//! Interrupt priority level (IPL) bookkeeping.
//!
//! The run queue is shared with interrupt context on real hardware, so every
//! read-modify-write of scheduler state is bracketed by raising the IPL to
//! [`IPL_HIGH`] and restoring the previous level afterwards. The IPL is a
//! per-thread property: `switch()` saves the outgoing thread's level on its
//! own stack and restores it when that thread resumes.
//!
//! Hosted builds have no interrupt controller, so the level is a plain
//! software variable; the discipline is identical to what a port with a real
//! PIC/APIC would gate on.

use core::sync::atomic::{AtomicU8, Ordering};

/// All interrupts deliverable.
pub const IPL_LOW: u8 = 0;
/// All interrupts masked.
pub const IPL_HIGH: u8 = 7;

static CURRENT_IPL: AtomicU8 = AtomicU8::new(IPL_LOW);

/// Read the current IPL.
#[inline]
pub fn get_ipl() -> u8 {
    CURRENT_IPL.load(Ordering::Relaxed)
}

/// Set the IPL, returning the previous level.
#[inline]
pub fn set_ipl(level: u8) -> u8 {
    CURRENT_IPL.swap(level, Ordering::Relaxed)
}

/// Raise the IPL to at least `level`, returning the previous level.
#[inline]
pub fn raise_ipl(level: u8) -> u8 {
    let old = get_ipl();
    if level > old {
        CURRENT_IPL.store(level, Ordering::Relaxed);
    }
    old
}

/// Wait for an interrupt to arrive. The caller must have lowered the IPL so
/// the interrupt it is waiting for can actually be delivered.
///
/// Hosted builds have no interrupt sources: if the scheduler got here, every
/// thread is blocked and none can ever be woken, so report the deadlock
/// instead of spinning forever.
pub fn wait() {
    panic!("intr::wait: run queue empty and every thread is blocked (deadlock)");
}
