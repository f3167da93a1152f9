//! Clock calibration tests
//!
//! The process-wide calibration is written once; every reader afterwards sees
//! the same values.

use speedbump::calibration::{self, MEASURE_ITERATIONS, WARMUP_ITERATIONS};
use std::thread;

#[test]
fn test_init_marks_calibrated() {
    let state = speedbump::init().unwrap();
    assert!(state.calibrated);
    assert!(speedbump::is_calibrated());
}

#[test]
fn test_min_delay_is_twice_overhead() {
    speedbump::init().unwrap();
    assert_eq!(
        speedbump::get_min_delay_ns(),
        2 * speedbump::get_clock_overhead_ns()
    );
}

#[test]
fn test_values_stable_across_calls() {
    let first = speedbump::init().unwrap();
    for _ in 0..10 {
        let again = speedbump::init().unwrap();
        assert_eq!(again, first);
        assert_eq!(speedbump::get_clock_overhead_ns(), first.overhead_ns);
    }
}

#[test]
fn test_concurrent_init_agrees() {
    let states: Vec<_> = (0..8)
        .map(|_| thread::spawn(|| speedbump::init().unwrap()))
        .collect::<Vec<_>>()
        .into_iter()
        .map(|h| h.join().unwrap())
        .collect();

    assert!(states.windows(2).all(|w| w[0] == w[1]));
    assert_eq!(calibration::state(), states[0]);
}

#[test]
fn test_fresh_calibration_is_plausible() {
    // A clock read costs well under a millisecond on anything we run on
    let state = calibration::calibrate_with(WARMUP_ITERATIONS / 10, MEASURE_ITERATIONS / 10).unwrap();
    assert!(state.calibrated);
    assert!(state.overhead_ns < 1_000_000);
}

#[test]
fn test_zero_iterations_treated_as_one() {
    let state = calibration::calibrate_with(0, 0).unwrap();
    assert!(state.calibrated);
    assert_eq!(state.min_delay_ns(), state.overhead_ns * 2);
}
