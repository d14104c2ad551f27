//! Host-side fixtures for testing the simulator against real TAP devices.
//!
//! # Modules
//!
//! - [`tap`]: TAP interface provisioning (RAII cleanup on drop)
//! - [`test_util`]: Privilege checks and unique name generation for tests

pub mod tap;
pub mod test_util;

pub use tap::{TapInterface, TapSet};
pub use test_util::{SkipReason, check_privileges, check_tap_deps, unique_tap_name};
