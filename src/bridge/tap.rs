//! Linux TAP backend.
//!
//! Attaches to a pre-created TAP interface through `/dev/net/tun` with
//! `TUNSETIFF`. The operator creates the interfaces (for example with
//! `ip tuntap add dev tap0-ns mode tap`) and enslaves them to the host
//! bridges; this module only attaches to them.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::Path;

use tracing::debug;

use super::{BridgeMode, DeviceBackend, FrameDevice, MAX_DEVICE_NAME_LEN};
use crate::error::{BindFailure, LanError, Result};

const TUN_CLONE_PATH: &str = "/dev/net/tun";
const SYS_CLASS_NET: &str = "/sys/class/net";

/// `_IOW('T', 202, int)`
const TUNSETIFF: u64 = 0x4004_54ca;

/// `struct ifreq` as used by `TUNSETIFF`: the name followed by the flags,
/// padded to the size of the kernel's union.
#[repr(C)]
struct IfReq {
    name: [libc::c_char; libc::IFNAMSIZ],
    flags: libc::c_short,
    _pad: [u8; 22],
}

impl IfReq {
    fn new(name: &str, flags: libc::c_short) -> Self {
        let mut req = Self {
            name: [0; libc::IFNAMSIZ],
            flags,
            _pad: [0; 22],
        };
        for (dst, src) in req.name.iter_mut().zip(name.bytes()) {
            *dst = src as libc::c_char;
        }
        req
    }
}

/// An attached TAP interface. Reads and writes are whole Ethernet frames.
#[derive(Debug)]
pub struct TapDevice {
    file: File,
    name: String,
}

impl TapDevice {
    pub fn attach(name: &str) -> Result<Self> {
        if name.is_empty() || name.len() > MAX_DEVICE_NAME_LEN {
            return Err(LanError::bind(name, BindFailure::NameTooLong));
        }

        // TUNSETIFF creates the interface when it does not exist, which would
        // leave the simulated node on a device nothing is bridged to.
        if !Path::new(SYS_CLASS_NET).join(name).exists() {
            return Err(LanError::bind(name, BindFailure::Missing));
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_NONBLOCK | libc::O_CLOEXEC)
            .open(TUN_CLONE_PATH)
            .map_err(|err| LanError::bind(name, BindFailure::Io(err)))?;

        let mut req = IfReq::new(name, (libc::IFF_TAP | libc::IFF_NO_PI) as libc::c_short);

        // Safety: `req` is a valid, fully initialized ifreq that outlives the
        // call, and the fd is owned by `file`.
        let rc = unsafe { libc::ioctl(file.as_raw_fd(), TUNSETIFF as _, &mut req as *mut IfReq) };
        if rc < 0 {
            let err = io::Error::last_os_error();
            let reason = match err.raw_os_error() {
                Some(libc::EBUSY) => BindFailure::Busy,
                Some(libc::ENODEV) | Some(libc::ENOENT) => BindFailure::Missing,
                _ => BindFailure::Io(err),
            };
            return Err(LanError::bind(name, reason));
        }

        debug!(device = name, "attached tap");

        Ok(Self {
            file,
            name: name.to_string(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl AsRawFd for TapDevice {
    fn as_raw_fd(&self) -> RawFd {
        self.file.as_raw_fd()
    }
}

impl FrameDevice for TapDevice {
    fn recv_frame(&self, buf: &mut [u8]) -> io::Result<usize> {
        (&self.file).read(buf)
    }

    fn send_frame(&self, frame: &[u8]) -> io::Result<usize> {
        (&self.file).write(frame)
    }
}

/// Backend opening real TAP interfaces.
#[derive(Clone, Copy, Debug, Default)]
pub struct TapBackend;

impl DeviceBackend for TapBackend {
    type Device = TapDevice;

    fn open(&self, name: &str, mode: BridgeMode) -> Result<TapDevice> {
        match mode {
            // The tap is used as-is: no MAC rewriting in either direction.
            BridgeMode::Local => TapDevice::attach(name),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ifreq_layout() {
        assert_eq!(std::mem::size_of::<IfReq>(), 40);
        let req = IfReq::new("tap0-ns", 0x1002);
        assert_eq!(req.name[0] as u8, b't');
        assert_eq!(req.name[6] as u8, b's');
        assert_eq!(req.name[7], 0);
        assert_eq!(req.flags, 0x1002);
    }

    #[test]
    fn test_long_name_rejected() {
        let err = TapDevice::attach("tap-name-way-too-long").unwrap_err();
        assert!(matches!(
            err,
            LanError::DeviceBind {
                reason: BindFailure::NameTooLong,
                ..
            }
        ));
    }

    #[test]
    fn test_missing_interface_is_reported() {
        let err = TapBackend.open("tapzz-none", BridgeMode::Local).unwrap_err();
        assert!(matches!(
            err,
            LanError::DeviceBind {
                reason: BindFailure::Missing,
                ..
            }
        ));
    }
}
