//! Real-time shared-medium LAN simulator bridged to host TAP devices.
//!
//! Each simulated node is bound to a pre-created TAP interface named
//! `tap{i}-ns`, so processes attached to those interfaces (typically through
//! per-container bridges) talk over one simulated broadcast segment with a
//! configurable propagation delay. An operator console stops, reconfigures
//! and restarts the simulation at runtime.

// Use mimalloc as the global allocator for tests (non-Windows only)
#[cfg(not(windows))]
#[cfg(test)]
#[global_allocator]
static ALLOC: mimalloc::MiMalloc = mimalloc::MiMalloc;

pub mod bridge;
pub mod config;
pub mod console;
pub mod controller;
pub mod engine;
pub mod error;
pub mod topology;

// Test helpers module - available when test-internals feature is enabled
#[cfg(any(test, feature = "test-internals"))]
pub mod test_helpers;

#[cfg(test)]
pub mod tests;

#[cfg(target_os = "linux")]
pub use bridge::tap::{TapBackend, TapDevice};
pub use bridge::{BindingRegistry, BridgeMode, DeviceBackend, FrameDevice};
pub use config::{EngineOptions, SimConfig};
pub use console::ConsoleCommandLoop;
pub use controller::{ControllerState, LifecycleController, StopOutcome};
pub use engine::{SimulationEngine, StopSignal, TeardownReport};
pub use error::{BindFailure, LanError};
pub use topology::{Topology, device_name};
