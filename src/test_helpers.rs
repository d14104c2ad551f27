#![cfg(any(test, feature = "test-internals"))]
#![allow(dead_code)] // Not every helper is used by every test module

//! In-memory device backend for tests.
//!
//! Each "device" is one end of a `SOCK_DGRAM` socket pair, which keeps frame
//! boundaries exactly like a TAP fd. The engine gets the non-blocking end;
//! the test keeps the other end (blocking, with a read timeout) to inject and
//! observe frames.

use std::collections::{BTreeSet, HashMap};
use std::io;
use std::os::unix::io::{AsRawFd, RawFd};
use std::os::unix::net::UnixDatagram;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::bridge::{BridgeMode, DeviceBackend, FrameDevice};
use crate::error::{BindFailure, LanError, Result};
use crate::topology::device_name;

/// How long a host-side `recv` waits before failing the test.
pub const HOST_READ_TIMEOUT: Duration = Duration::from_secs(5);

/// Engine side of a socket pair.
pub struct PairDevice {
    socket: UnixDatagram,
    open: Arc<AtomicUsize>,
    send_stall: Duration,
}

impl AsRawFd for PairDevice {
    fn as_raw_fd(&self) -> RawFd {
        self.socket.as_raw_fd()
    }
}

impl FrameDevice for PairDevice {
    fn recv_frame(&self, buf: &mut [u8]) -> io::Result<usize> {
        self.socket.recv(buf)
    }

    fn send_frame(&self, frame: &[u8]) -> io::Result<usize> {
        if !self.send_stall.is_zero() {
            std::thread::sleep(self.send_stall);
        }
        self.socket.send(frame)
    }
}

impl Drop for PairDevice {
    fn drop(&mut self) {
        self.open.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Backend whose devices are socket pairs. Only names passed at construction
/// "exist"; opening anything else fails with [`BindFailure::Missing`].
#[derive(Default)]
pub struct PairBackend {
    existing: BTreeSet<String>,
    hosts: Mutex<HashMap<String, Arc<UnixDatagram>>>,
    open: Arc<AtomicUsize>,
    send_stall: Duration,
}

impl PairBackend {
    pub fn new<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            existing: names.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    /// Backend with `tap0-ns` .. `tap(count-1)-ns`.
    pub fn with_devices(count: u32) -> Self {
        Self::new((0..count).map(device_name))
    }

    /// Every write to a device blocks the engine thread for `stall` first,
    /// simulating an engine that cannot react to a stop request in time.
    pub fn with_send_stall(mut self, stall: Duration) -> Self {
        self.send_stall = stall;
        self
    }

    /// Host end of the most recent open of `name`.
    pub fn host(&self, name: &str) -> Option<Arc<UnixDatagram>> {
        self.hosts.lock().unwrap().get(name).cloned()
    }

    /// Engine-side devices currently alive.
    pub fn open_count(&self) -> usize {
        self.open.load(Ordering::Acquire)
    }
}

impl DeviceBackend for PairBackend {
    type Device = PairDevice;

    fn open(&self, name: &str, _mode: BridgeMode) -> Result<PairDevice> {
        if !self.existing.contains(name) {
            return Err(LanError::bind(name, BindFailure::Missing));
        }

        let (engine_end, host_end) =
            UnixDatagram::pair().map_err(|err| LanError::bind(name, BindFailure::Io(err)))?;
        engine_end
            .set_nonblocking(true)
            .map_err(|err| LanError::bind(name, BindFailure::Io(err)))?;
        host_end
            .set_read_timeout(Some(HOST_READ_TIMEOUT))
            .map_err(|err| LanError::bind(name, BindFailure::Io(err)))?;

        self.hosts
            .lock()
            .unwrap()
            .insert(name.to_string(), Arc::new(host_end));
        self.open.fetch_add(1, Ordering::AcqRel);

        Ok(PairDevice {
            socket: engine_end,
            open: self.open.clone(),
            send_stall: self.send_stall,
        })
    }
}
