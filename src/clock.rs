//! Clock primitives backing calibration, spin delays and time windows
//!
//! Two clocks are used:
//! - `CLOCK_MONOTONIC` for measuring elapsed time (calibration, spin delays)
//! - `CLOCK_REALTIME` for the activation window, which is expressed in
//!   wall-clock nanoseconds since the Unix epoch
//!
//! The fallible readers are used once, during calibration, to prove the clock
//! works. After that the infallible readers are used on the hot path.

use std::io;
use thiserror::Error;

/// Clock used for a reading
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClockKind {
    /// Monotonic clock, unaffected by wall-clock adjustments
    Monotonic,
    /// Wall clock (nanoseconds since the Unix epoch)
    Realtime,
}

impl ClockKind {
    fn clock_id(self) -> libc::clockid_t {
        match self {
            ClockKind::Monotonic => libc::CLOCK_MONOTONIC,
            ClockKind::Realtime => libc::CLOCK_REALTIME,
        }
    }

    fn name(self) -> &'static str {
        match self {
            ClockKind::Monotonic => "CLOCK_MONOTONIC",
            ClockKind::Realtime => "CLOCK_REALTIME",
        }
    }
}

/// Errors raised while reading a clock
#[derive(Debug, Error)]
pub enum ClockError {
    /// The clock could not be read at all
    #[error("{clock} unavailable: {source}")]
    Unavailable {
        clock: &'static str,
        #[source]
        source: io::Error,
    },
}

#[inline]
fn timespec_to_ns(ts: &libc::timespec) -> u64 {
    (ts.tv_sec as u64)
        .wrapping_mul(1_000_000_000)
        .wrapping_add(ts.tv_nsec as u64)
}

#[inline]
fn read_raw(kind: ClockKind) -> (i32, libc::timespec) {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    // SAFETY: `ts` is a valid, exclusively borrowed timespec for the call.
    let rc = unsafe { libc::clock_gettime(kind.clock_id(), &mut ts) };
    (rc, ts)
}

/// Read a clock, reporting failure
pub fn try_read_ns(kind: ClockKind) -> Result<u64, ClockError> {
    let (rc, ts) = read_raw(kind);
    if rc != 0 {
        return Err(ClockError::Unavailable {
            clock: kind.name(),
            source: io::Error::last_os_error(),
        });
    }
    Ok(timespec_to_ns(&ts))
}

/// Monotonic time in nanoseconds (hot path)
///
/// Only valid once [`try_read_ns`] has succeeded for the monotonic clock,
/// which calibration guarantees before any engine exists.
#[inline]
pub fn monotonic_ns() -> u64 {
    let (rc, ts) = read_raw(ClockKind::Monotonic);
    debug_assert!(rc == 0, "clock_gettime(CLOCK_MONOTONIC) failed");
    timespec_to_ns(&ts)
}

/// Wall-clock time in nanoseconds since the Unix epoch
#[inline]
pub fn wall_ns() -> i64 {
    let (rc, ts) = read_raw(ClockKind::Realtime);
    debug_assert!(rc == 0, "clock_gettime(CLOCK_REALTIME) failed");
    timespec_to_ns(&ts) as i64
}

/// Source of wall-clock time for activation windows
///
/// The engine reads this once per matched call event. Tests substitute a
/// manual clock to step through a window deterministically.
pub trait WallClock: Send + Sync {
    /// Current wall-clock time in nanoseconds since the Unix epoch
    fn now_ns(&self) -> i64;
}

/// The real `CLOCK_REALTIME` clock
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemWallClock;

impl WallClock for SystemWallClock {
    #[inline]
    fn now_ns(&self) -> i64 {
        wall_ns()
    }
}

/// A wall clock that only moves when told to
#[derive(Debug, Default)]
pub struct ManualWallClock {
    now: std::sync::atomic::AtomicI64,
}

impl ManualWallClock {
    /// Create a clock frozen at `now_ns`
    pub fn new(now_ns: i64) -> Self {
        Self {
            now: std::sync::atomic::AtomicI64::new(now_ns),
        }
    }

    /// Jump to an absolute time
    pub fn set(&self, now_ns: i64) {
        self.now.store(now_ns, std::sync::atomic::Ordering::SeqCst);
    }

    /// Move forward by `delta_ns`
    pub fn advance(&self, delta_ns: i64) {
        self.now
            .fetch_add(delta_ns, std::sync::atomic::Ordering::SeqCst);
    }
}

impl WallClock for ManualWallClock {
    fn now_ns(&self) -> i64 {
        self.now.load(std::sync::atomic::Ordering::SeqCst)
    }
}
