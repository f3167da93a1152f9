//! Frequency and activation-window gating
//!
//! Driven through `EngineHandle::on_call` with a manual wall clock so window
//! edges are exact.

use speedbump::clock::ManualWallClock;
use speedbump::{CallOutcome, CallSiteId, CallSiteInfo, EngineHandle, GateConfig, InstallConfig};
use std::sync::Arc;

fn target() -> anyhow::Result<CallSiteInfo<'static>> {
    Ok(CallSiteInfo::new("billing::ledger", "Ledger::post"))
}

fn bystander() -> anyhow::Result<CallSiteInfo<'static>> {
    Ok(CallSiteInfo::new("billing::ledger", "Ledger::len"))
}

fn engine_at(now_ns: i64) -> (EngineHandle, Arc<ManualWallClock>) {
    let wall = Arc::new(ManualWallClock::new(now_ns));
    let engine = EngineHandle::with_wall_clock(wall.clone()).unwrap();
    (engine, wall)
}

#[test]
fn test_every_third_call_delayed() {
    let (engine, _) = engine_at(0);
    let _sub = engine
        .install(&InstallConfig::new(["billing::*:Ledger::post"], 1_000).with_frequency(3))
        .unwrap();

    let delayed: Vec<u64> = (1..=9)
        .filter(|_| engine.on_call(CallSiteId(1), target).is_delayed())
        .collect();
    assert_eq!(delayed, vec![3, 6, 9]);
}

#[test]
fn test_skipped_calls_report_count() {
    let (engine, _) = engine_at(0);
    let _sub = engine
        .install(&InstallConfig::new(["*:Ledger::post"], 1_000).with_frequency(2))
        .unwrap();

    assert_eq!(
        engine.on_call(CallSiteId(1), target),
        CallOutcome::Skipped { count: 1 }
    );
    assert_eq!(
        engine.on_call(CallSiteId(1), target),
        CallOutcome::Delayed { delay_ns: 1_000 }
    );
}

#[test]
fn test_frequency_counted_per_site() {
    let (engine, _) = engine_at(0);
    let _sub = engine
        .install(&InstallConfig::new(["*:Ledger::post"], 0).with_frequency(2))
        .unwrap();

    // Alternating between two sites: each reaches its own 2nd call together
    let a = CallSiteId(10);
    let b = CallSiteId(11);
    assert!(!engine.on_call(a, target).is_delayed());
    assert!(!engine.on_call(b, target).is_delayed());
    assert!(engine.on_call(a, target).is_delayed());
    assert!(engine.on_call(b, target).is_delayed());
}

#[test]
fn test_frequency_one_delays_every_call_without_counting() {
    let (engine, _) = engine_at(0);
    let _sub = engine
        .install(&InstallConfig::new(["*:Ledger::post"], 0))
        .unwrap();

    for _ in 0..5 {
        assert!(engine.on_call(CallSiteId(1), target).is_delayed());
    }
    assert_eq!(engine.call_count(CallSiteId(1)), 0);
}

#[test]
fn test_non_target_never_delayed_or_counted() {
    let (engine, _) = engine_at(0);
    let _sub = engine
        .install(&InstallConfig::new(["*:Ledger::post"], 0).with_frequency(1))
        .unwrap();

    for _ in 0..5 {
        assert_eq!(engine.on_call(CallSiteId(2), bystander), CallOutcome::NotTargeted);
    }
    assert_eq!(engine.call_count(CallSiteId(2)), 0);
}

#[test]
fn test_before_start_never_delays() {
    let (engine, wall) = engine_at(0);
    let _sub = engine
        .install(&InstallConfig::new(["*:Ledger::post"], 0).with_window(1_000, 0))
        .unwrap();

    assert_eq!(engine.on_call(CallSiteId(1), target), CallOutcome::OutsideWindow);
    wall.set(999);
    assert_eq!(engine.on_call(CallSiteId(1), target), CallOutcome::OutsideWindow);
    wall.set(1_000);
    assert!(engine.on_call(CallSiteId(1), target).is_delayed());
    wall.advance(1_000_000_000);
    assert!(engine.on_call(CallSiteId(1), target).is_delayed());
}

#[test]
fn test_at_or_after_end_never_delays() {
    let (engine, wall) = engine_at(500);
    let _sub = engine
        .install(&InstallConfig::new(["*:Ledger::post"], 0).with_window(0, 1_000))
        .unwrap();

    assert!(engine.on_call(CallSiteId(1), target).is_delayed());
    wall.set(1_000);
    assert_eq!(engine.on_call(CallSiteId(1), target), CallOutcome::OutsideWindow);
    wall.set(5_000);
    assert_eq!(engine.on_call(CallSiteId(1), target), CallOutcome::OutsideWindow);
}

#[test]
fn test_outside_window_does_not_advance_counter() {
    let (engine, wall) = engine_at(0);
    let _sub = engine
        .install(
            &InstallConfig::new(["*:Ledger::post"], 0)
                .with_frequency(2)
                .with_window(100, 0),
        )
        .unwrap();

    for _ in 0..3 {
        assert_eq!(engine.on_call(CallSiteId(1), target), CallOutcome::OutsideWindow);
    }
    assert_eq!(engine.call_count(CallSiteId(1)), 0);

    wall.set(100);
    assert_eq!(
        engine.on_call(CallSiteId(1), target),
        CallOutcome::Skipped { count: 1 }
    );
}

#[test]
fn test_gate_window_edges() {
    let gate = GateConfig::new(0).with_window(10, 20);
    assert!(!gate.in_window(9));
    assert!(gate.in_window(10));
    assert!(gate.in_window(19));
    assert!(!gate.in_window(20));

    let open = GateConfig::new(0).with_window(10, 0);
    assert!(open.in_window(i64::MAX));
}

#[test]
fn test_gate_is_due() {
    let gate = GateConfig::new(0).with_frequency(3);
    let due: Vec<u64> = (1..=9).filter(|c| gate.is_due(*c)).collect();
    assert_eq!(due, vec![3, 6, 9]);
    assert!(GateConfig::new(0).is_due(1));
}
