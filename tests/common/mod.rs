//! Shared utilities for integration tests.
#![allow(dead_code)]

use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use tap_harness::check_tap_deps;
use tap_lan::EngineOptions;

/// Device names are fixed (`tap{i}-ns`), so tests touching them run one at a time.
static TAP_LOCK: Mutex<()> = Mutex::new(());

pub fn serial() -> MutexGuard<'static, ()> {
    TAP_LOCK.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Check all integration test dependencies for `count` devices. Returns
/// `true` if tests should be skipped (prints the reason to stderr). Use at
/// the top of every test.
pub fn skip_without_deps(count: u32) -> bool {
    match check_tap_deps(count) {
        Ok(()) => false,
        Err(reason) => {
            eprintln!("Skipping: {reason}");
            true
        }
    }
}

/// Short grace periods so a misbehaving engine fails the test quickly.
pub fn test_options() -> EngineOptions {
    EngineOptions {
        stop_grace: Duration::from_secs(2),
        force_grace: Duration::from_secs(1),
        status_interval: None,
    }
}
