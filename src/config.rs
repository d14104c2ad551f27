//! Runtime configuration for the simulator.
//!
//! [`SimConfig`] is what the operator changes from the console (delay and
//! node count). [`EngineOptions`] holds the lifecycle timings fixed at launch.

use std::fmt;
use std::time::Duration;

/// Node count used when the process boots.
pub const DEFAULT_NODE_COUNT: u32 = 3;

/// Channel propagation delay used when the process boots, in milliseconds.
pub const DEFAULT_DELAY_MS: u64 = 0;

/// How long `stop` waits for a cooperative teardown before escalating.
pub const DEFAULT_STOP_GRACE_MS: u64 = 2_000;

/// How long `stop` waits after escalating to a forced stop.
pub const DEFAULT_FORCE_GRACE_MS: u64 = 1_000;

/// Interval of the engine's periodic status log.
pub const DEFAULT_STATUS_INTERVAL_SECS: u64 = 30;

/// Current simulation parameters as seen by the controller.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SimConfig {
    pub delay: Duration,
    pub node_count: u32,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            delay: Duration::from_millis(DEFAULT_DELAY_MS),
            node_count: DEFAULT_NODE_COUNT,
        }
    }
}

impl SimConfig {
    pub fn new(delay: Duration, node_count: u32) -> Self {
        Self { delay, node_count }
    }

    /// Same node count, different delay.
    pub fn with_delay(self, delay: Duration) -> Self {
        Self { delay, ..self }
    }

    /// Same delay, different node count.
    pub fn with_node_count(self, node_count: u32) -> Self {
        Self { node_count, ..self }
    }
}

impl fmt::Display for SimConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "delay={}ms nodes={}",
            self.delay.as_millis(),
            self.node_count
        )
    }
}

/// Lifecycle timings for the engine thread.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EngineOptions {
    pub stop_grace: Duration,
    pub force_grace: Duration,
    /// `None` disables the periodic status report.
    pub status_interval: Option<Duration>,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            stop_grace: Duration::from_millis(DEFAULT_STOP_GRACE_MS),
            force_grace: Duration::from_millis(DEFAULT_FORCE_GRACE_MS),
            status_interval: Some(Duration::from_secs(DEFAULT_STATUS_INTERVAL_SECS)),
        }
    }
}

impl EngineOptions {
    /// Create options from CLI arguments. A zero status interval disables it.
    pub fn from_cli(stop_grace_ms: u64, force_grace_ms: u64, status_interval_secs: u64) -> Self {
        Self {
            stop_grace: Duration::from_millis(stop_grace_ms),
            force_grace: Duration::from_millis(force_grace_ms),
            status_interval: (status_interval_secs > 0)
                .then(|| Duration::from_secs(status_interval_secs)),
        }
    }
}
