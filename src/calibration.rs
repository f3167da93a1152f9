//! Clock calibration
//!
//! Measures the cost of one monotonic clock read so that callers know the
//! smallest delay the spin engine can express. A spin delay needs at least two
//! clock reads (start and deadline check), so the minimum achievable delay is
//! twice the per-read overhead.
//!
//! The process-wide state is written once by [`init`], or by the first getter
//! call, and read-only afterwards.
//! Concurrent first calls may both measure; the first stored result wins and
//! every caller observes that one.

use crate::clock::{self, ClockError, ClockKind};
use serde::ser::{Serialize, SerializeStruct, Serializer};
use std::hint::black_box;
use std::sync::OnceLock;

/// Discarded reads that prime caches and the TLB before measuring
pub const WARMUP_ITERATIONS: u32 = 1_000;

/// Reads bracketed by the two measurement timestamps
pub const MEASURE_ITERATIONS: u32 = 100_000;

static GLOBAL: OnceLock<CalibrationState> = OnceLock::new();

/// Result of a calibration run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CalibrationState {
    /// Cost of one monotonic clock read in nanoseconds
    pub overhead_ns: u64,
    /// Whether a measurement has been taken
    pub calibrated: bool,
}

impl CalibrationState {
    /// State before any measurement
    pub const UNCALIBRATED: Self = Self {
        overhead_ns: 0,
        calibrated: false,
    };

    /// Smallest delay distinguishable from zero
    pub fn min_delay_ns(&self) -> u64 {
        self.overhead_ns.saturating_mul(2)
    }
}

impl Serialize for CalibrationState {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut report = serializer.serialize_struct("CalibrationState", 3)?;
        report.serialize_field("overhead_ns", &self.overhead_ns)?;
        report.serialize_field("min_delay_ns", &self.min_delay_ns())?;
        report.serialize_field("calibrated", &self.calibrated)?;
        report.end()
    }
}

/// Run a calibration with the default iteration counts
pub fn calibrate() -> Result<CalibrationState, ClockError> {
    calibrate_with(WARMUP_ITERATIONS, MEASURE_ITERATIONS)
}

/// Run a calibration with explicit iteration counts
///
/// `iterations` of zero is treated as one.
pub fn calibrate_with(warmup: u32, iterations: u32) -> Result<CalibrationState, ClockError> {
    // A failing clock must be reported here, not discovered inside a spin loop.
    clock::try_read_ns(ClockKind::Monotonic)?;

    for _ in 0..warmup {
        black_box(clock::monotonic_ns());
    }

    let iterations = iterations.max(1);
    let start = clock::try_read_ns(ClockKind::Monotonic)?;
    for _ in 0..iterations {
        black_box(clock::monotonic_ns());
    }
    let end = clock::try_read_ns(ClockKind::Monotonic)?;

    Ok(CalibrationState {
        overhead_ns: end.saturating_sub(start) / u64::from(iterations),
        calibrated: true,
    })
}

/// Calibrate the process-wide state if that has not happened yet
///
/// Returns the stored state. Fails only when the monotonic clock is
/// unavailable, which leaves the process without any timing guarantee.
pub fn init() -> Result<CalibrationState, ClockError> {
    if let Some(state) = GLOBAL.get() {
        return Ok(*state);
    }

    let measured = calibrate()?;
    let mut won = false;
    let state = *GLOBAL.get_or_init(|| {
        won = true;
        measured
    });

    if won {
        tracing::info!(
            overhead_ns = state.overhead_ns,
            min_delay_ns = state.min_delay_ns(),
            "clock calibrated"
        );
    }
    Ok(state)
}

/// Process-wide calibration state, calibrating on first use
///
/// [`CalibrationState::UNCALIBRATED`] only when the monotonic clock cannot be
/// read at all.
pub fn state() -> CalibrationState {
    init().unwrap_or_else(|err| {
        tracing::error!(error = %err, "clock calibration failed");
        CalibrationState::UNCALIBRATED
    })
}

/// Calibrated cost of one clock read in nanoseconds
pub fn get_clock_overhead_ns() -> u64 {
    state().overhead_ns
}

/// Minimum achievable delay in nanoseconds, always twice the clock overhead
pub fn get_min_delay_ns() -> u64 {
    state().min_delay_ns()
}

/// Whether the process clock is calibrated (calibrates if it is not yet)
pub fn is_calibrated() -> bool {
    state().calibrated
}
