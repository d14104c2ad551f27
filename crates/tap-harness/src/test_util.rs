use std::path::Path;
use std::process::Command;
use std::sync::atomic::{AtomicU32, Ordering};

static TAP_COUNTER: AtomicU32 = AtomicU32::new(0);

/// Returns `true` if the environment can create TAP interfaces
/// (requires the `ip` tool, `/dev/net/tun` and passwordless `sudo`).
pub fn check_privileges() -> bool {
    let has_ip = Command::new("ip")
        .args(["link", "show"])
        .output()
        .is_ok_and(|o| o.status.success());

    has_ip
        && Path::new("/dev/net/tun").exists()
        && Command::new("sudo")
            .args(["-n", "ip", "tuntap", "show"])
            .output()
            .is_ok_and(|o| o.status.success())
}

/// Reason why TAP integration tests must be skipped.
#[derive(Debug)]
pub enum SkipReason {
    NotRoot,
    NoTunDevice,
    /// Interfaces named like the simulator's already exist on the host and
    /// must not be touched.
    TapsInUse(String),
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SkipReason::NotRoot => write!(f, "requires root / passwordless sudo"),
            SkipReason::NoTunDevice => write!(f, "/dev/net/tun not available"),
            SkipReason::TapsInUse(name) => write!(f, "host already has an interface named {name}"),
        }
    }
}

/// Check everything TAP integration tests need, for `count` devices.
pub fn check_tap_deps(count: u32) -> std::result::Result<(), SkipReason> {
    if !Path::new("/dev/net/tun").exists() {
        return Err(SkipReason::NoTunDevice);
    }
    if !check_privileges() {
        return Err(SkipReason::NotRoot);
    }
    for i in 0..count {
        let name = format!("tap{i}-ns");
        if Path::new("/sys/class/net").join(&name).exists() {
            return Err(SkipReason::TapsInUse(name));
        }
    }
    Ok(())
}

/// Generate a unique interface name safe for parallel tests.
///
/// Combines prefix + PID + atomic counter, truncated to 15 chars
/// (Linux netdev name limit).
pub fn unique_tap_name(prefix: &str) -> String {
    let seq = TAP_COUNTER.fetch_add(1, Ordering::Relaxed);
    let pid = std::process::id() % 0xffff;
    let name = format!("{prefix}{pid:x}_{seq}");
    if name.len() > 15 { name[..15].to_string() } else { name }
}
