//! Lifecycle against real kernel TAP devices.
//!
//! Requires passwordless sudo and `/dev/net/tun`; every test skips otherwise.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{serial, skip_without_deps, test_options};
use tap_harness::TapSet;
use tap_lan::{BindFailure, LanError, LifecycleController, StopOutcome, TapBackend, TapDevice};

#[test]
fn test_start_binds_every_tap() {
    let _guard = serial();
    if skip_without_deps(3) {
        return;
    }

    let taps = TapSet::provision(3).expect("provision taps");
    let mut controller = LifecycleController::new(Arc::new(TapBackend), test_options());
    controller.start(Duration::ZERO, 3).unwrap();

    assert!(controller.is_running());
    assert_eq!(controller.active_bindings(), taps.names());

    let outcome = controller.stop().unwrap();
    assert!(matches!(outcome, StopOutcome::Stopped(_)));
    assert!(controller.active_bindings().is_empty());
}

#[test]
fn test_bound_tap_is_busy_for_others() {
    let _guard = serial();
    if skip_without_deps(2) {
        return;
    }

    let _taps = TapSet::provision(2).expect("provision taps");
    let mut controller = LifecycleController::new(Arc::new(TapBackend), test_options());
    controller.start(Duration::from_millis(5), 2).unwrap();

    match TapDevice::attach("tap0-ns") {
        Err(LanError::DeviceBind {
            reason: BindFailure::Busy,
            ..
        }) => {}
        other => panic!("expected busy, got {other:?}"),
    }

    controller.stop().unwrap();
    // Released once the engine is gone.
    let device = TapDevice::attach("tap0-ns").expect("rebind after stop");
    assert_eq!(device.name(), "tap0-ns");
}

#[test]
fn test_restart_rebinds_same_devices() {
    let _guard = serial();
    if skip_without_deps(3) {
        return;
    }

    let taps = TapSet::provision(3).expect("provision taps");
    let mut controller = LifecycleController::new(Arc::new(TapBackend), test_options());
    controller.start(Duration::from_millis(1), 2).unwrap();

    for round in 0..3 {
        controller
            .restart(Duration::from_millis(round * 10), 3)
            .unwrap_or_else(|err| panic!("restart {round}: {err}"));
        assert_eq!(controller.active_bindings(), taps.names());
    }

    assert_eq!(controller.config().delay, Duration::from_millis(20));
    controller.stop().unwrap();
}

#[test]
fn test_missing_tap_fails_start() {
    let _guard = serial();
    if skip_without_deps(3) {
        return;
    }

    // Only tap0-ns and tap1-ns exist.
    let _taps = TapSet::provision(2).expect("provision taps");
    let mut controller = LifecycleController::new(Arc::new(TapBackend), test_options());

    match controller.start(Duration::ZERO, 3) {
        Err(LanError::DeviceBind {
            device,
            reason: BindFailure::Missing,
        }) => assert_eq!(device, "tap2-ns"),
        other => panic!("expected missing tap2-ns, got {other:?}"),
    }

    assert!(!controller.is_running());
    assert!(controller.active_bindings().is_empty());

    // The devices bound before the failure were released.
    controller.start(Duration::ZERO, 2).unwrap();
    controller.stop().unwrap();
}
