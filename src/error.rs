//! Error taxonomy for the simulator and its lifecycle.

use std::io;

use thiserror::Error;

/// Why a TAP device could not be bound to a simulated endpoint.
#[derive(Debug, Error)]
pub enum BindFailure {
    /// No interface with that name exists on the host.
    #[error("no such device")]
    Missing,
    /// Another engine or process already holds the device.
    #[error("device busy")]
    Busy,
    /// Interface names are limited to 15 bytes on Linux.
    #[error("interface name exceeds 15 bytes")]
    NameTooLong,
    #[error("{0}")]
    Io(#[from] io::Error),
}

/// Errors surfaced by topology construction, binding and the controller.
#[derive(Debug, Error)]
pub enum LanError {
    /// Node count below one. Rejected before any state changes.
    #[error("invalid topology: {0}")]
    InvalidTopology(String),

    /// The named device is unavailable. The build is rolled back.
    #[error("cannot bind device '{device}': {reason}")]
    DeviceBind { device: String, reason: BindFailure },

    /// The engine thread or its runtime could not be created.
    #[error("engine failed to start: {0}")]
    EngineStart(String),

    /// Non-numeric console argument. The pending restart is abandoned.
    #[error("invalid input '{input}': expected a non-negative integer")]
    InvalidInput { input: String },

    /// The engine ignored both the graceful and the forced stop deadline.
    #[error("engine did not tear down in time; devices still held: {}", orphaned.join(", "))]
    TeardownTimeout { orphaned: Vec<String> },

    /// The event loop stopped on an unrecoverable error.
    #[error("engine failed: {0}")]
    EngineFailed(String),
}

impl LanError {
    pub fn bind(device: impl Into<String>, reason: BindFailure) -> Self {
        Self::DeviceBind {
            device: device.into(),
            reason,
        }
    }

    /// True if this error left the controller configuration untouched.
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            LanError::InvalidTopology(_) | LanError::InvalidInput { .. }
        )
    }
}

pub type Result<T, E = LanError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bind_error_message() {
        let err = LanError::bind("tap3-ns", BindFailure::Busy);
        assert_eq!(err.to_string(), "cannot bind device 'tap3-ns': device busy");
    }

    #[test]
    fn test_bind_failure_messages() {
        assert_eq!(BindFailure::Missing.to_string(), "no such device");
        assert_eq!(
            BindFailure::NameTooLong.to_string(),
            "interface name exceeds 15 bytes"
        );
        let io = io::Error::from_raw_os_error(libc::EACCES);
        let expected = io.to_string();
        assert_eq!(BindFailure::from(io).to_string(), expected);
    }

    #[test]
    fn test_timeout_lists_devices() {
        let err = LanError::TeardownTimeout {
            orphaned: vec!["tap0-ns".into(), "tap1-ns".into()],
        };
        assert!(err.to_string().ends_with("tap0-ns, tap1-ns"));
    }

    #[test]
    fn test_rejections() {
        assert!(LanError::InvalidTopology("0 nodes".into()).is_rejection());
        assert!(
            LanError::InvalidInput {
                input: "abc".into()
            }
            .is_rejection()
        );
        assert!(!LanError::EngineStart("spawn".into()).is_rejection());
    }
}
