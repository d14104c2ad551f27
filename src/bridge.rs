//! Binding simulated endpoints to host virtual interfaces.
//!
//! A [`DeviceBackend`] opens a named host device. The [`BridgeAdapter`]
//! claims the name in the [`BindingRegistry`] before opening it, so a device
//! can never be bound twice, and the claim is released when the returned
//! [`Binding`] is dropped.

#[cfg(target_os = "linux")]
pub mod tap;

use std::collections::BTreeSet;
use std::fmt;
use std::io;
use std::os::unix::io::AsRawFd;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::debug;

use crate::error::{BindFailure, LanError, Result};
use crate::topology::device_name;

/// Linux netdev name limit (`IFNAMSIZ` minus the terminating NUL).
pub const MAX_DEVICE_NAME_LEN: usize = 15;

/// How the simulated endpoint relates to the host device.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum BridgeMode {
    /// Transparent: frames pass unchanged in both directions and the host
    /// side keeps its own MAC address, so the simulated medium looks like an
    /// extension of the host bridge.
    #[default]
    Local,
}

impl fmt::Display for BridgeMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BridgeMode::Local => write!(f, "local"),
        }
    }
}

/// A datagram-oriented host device: one `recv_frame` yields one frame.
///
/// Implementations must be non-blocking; the engine polls them through the
/// raw file descriptor.
pub trait FrameDevice: AsRawFd + Send + Sync + 'static {
    fn recv_frame(&self, buf: &mut [u8]) -> io::Result<usize>;
    fn send_frame(&self, frame: &[u8]) -> io::Result<usize>;
}

/// Opens host devices by name.
pub trait DeviceBackend: Send + Sync + 'static {
    type Device: FrameDevice;

    fn open(&self, name: &str, mode: BridgeMode) -> Result<Self::Device>;
}

/// Set of device names currently bound by an engine.
///
/// Shared between the controller (which reports it) and the engine thread
/// (which claims and releases names).
#[derive(Clone, Debug, Default)]
pub struct BindingRegistry {
    bound: Arc<Mutex<BTreeSet<String>>>,
}

impl BindingRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BTreeSet<String>> {
        self.bound.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Claim `name`, failing with "device busy" if it is already bound.
    pub fn claim(&self, name: &str) -> Result<BindingLease> {
        if !self.lock().insert(name.to_string()) {
            return Err(LanError::bind(name, BindFailure::Busy));
        }
        Ok(BindingLease {
            registry: self.clone(),
            name: name.to_string(),
        })
    }

    /// Bound device names in sorted order.
    pub fn active(&self) -> Vec<String> {
        self.lock().iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.lock().contains(name)
    }
}

/// Releases its device name from the registry on drop.
#[derive(Debug)]
pub struct BindingLease {
    registry: BindingRegistry,
    name: String,
}

impl Drop for BindingLease {
    fn drop(&mut self) {
        self.registry.lock().remove(&self.name);
    }
}

/// An endpoint bound to an open host device.
pub struct Binding<D: FrameDevice> {
    pub node: u32,
    pub device_name: String,
    pub mode: BridgeMode,
    pub device: Arc<D>,
    // Dropped after `device` so the name is only released once the fd is.
    _lease: BindingLease,
}

impl<D: FrameDevice> fmt::Debug for Binding<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Binding")
            .field("node", &self.node)
            .field("device_name", &self.device_name)
            .field("mode", &self.mode)
            .finish()
    }
}

/// Binds endpoints to host devices named after their node index.
pub struct BridgeAdapter<'a, B: DeviceBackend> {
    backend: &'a B,
    registry: &'a BindingRegistry,
    mode: BridgeMode,
}

impl<'a, B: DeviceBackend> BridgeAdapter<'a, B> {
    pub fn new(backend: &'a B, registry: &'a BindingRegistry) -> Self {
        Self {
            backend,
            registry,
            mode: BridgeMode::Local,
        }
    }

    pub fn attach(&self, node: u32) -> Result<Binding<B::Device>> {
        let name = device_name(node);
        if name.len() > MAX_DEVICE_NAME_LEN {
            return Err(LanError::bind(name, BindFailure::NameTooLong));
        }

        let lease = self.registry.claim(&name)?;
        let device = self.backend.open(&name, self.mode)?;

        debug!(node, device = %name, mode = %self.mode, "bound endpoint");

        Ok(Binding {
            node,
            device_name: name,
            mode: self.mode,
            device: Arc::new(device),
            _lease: lease,
        })
    }
}
