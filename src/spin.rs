//! Spin-delay engine
//!
//! Busy-waits on the monotonic clock. The calling thread stays scheduled for
//! the whole interval, so a delayed call holds its thread (and anything the
//! thread holds) exactly like a slow synchronous dependency would. Sleeping
//! would let the scheduler hand the core to someone else and hide the cost.
//!
//! Between clock reads the loop issues [`std::hint::spin_loop`] (`pause` on
//! x86_64, `yield` on aarch64). The hint lowers power draw and memory-bus
//! pressure; it does not change how long the delay lasts.
//!
//! # Precision
//!
//! Each iteration costs one clock read, so a delay always takes at least two
//! reads. For durations below [`crate::calibration::get_min_delay_ns`] the
//! elapsed time is dominated by clock-read cost rather than the requested
//! duration. Raise the call frequency instead of shrinking the delay if a
//! smaller average slowdown is needed.

use crate::clock;
use std::sync::atomic::{AtomicBool, Ordering};

/// Spin iterations between cancellation checks in [`spin_delay_cancellable`]
pub const CANCEL_CHECK_INTERVAL: u32 = 64;

/// How a cancellable spin ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpinOutcome {
    /// The full duration elapsed
    Completed,
    /// The cancellation flag was observed before the deadline
    Cancelled,
}

/// Busy-wait until at least `duration_ns` of monotonic time has elapsed
///
/// Never yields or sleeps. Uses only call-local state, so any number of
/// threads may spin at once.
#[inline]
pub fn spin_delay(duration_ns: u64) {
    let deadline = clock::monotonic_ns().saturating_add(duration_ns);
    while clock::monotonic_ns() < deadline {
        std::hint::spin_loop();
    }
}

/// [`spin_delay`] that polls `cancel` every [`CANCEL_CHECK_INTERVAL`] iterations
///
/// Trades a little precision for the ability to abandon a long delay during
/// shutdown.
pub fn spin_delay_cancellable(duration_ns: u64, cancel: &AtomicBool) -> SpinOutcome {
    let deadline = clock::monotonic_ns().saturating_add(duration_ns);
    let mut spins = 0u32;
    while clock::monotonic_ns() < deadline {
        spins = spins.wrapping_add(1);
        if spins % CANCEL_CHECK_INTERVAL == 0 && cancel.load(Ordering::Relaxed) {
            return SpinOutcome::Cancelled;
        }
        std::hint::spin_loop();
    }
    SpinOutcome::Completed
}

/// Spin for `duration_ns` and return the elapsed monotonic nanoseconds
pub fn measure_spin(duration_ns: u64) -> u64 {
    let start = clock::monotonic_ns();
    spin_delay(duration_ns);
    clock::monotonic_ns().saturating_sub(start)
}
