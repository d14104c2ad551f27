use std::process::{Command, Output};

use anyhow::{Context, Result, bail};
use tracing::debug;

/// A persistent TAP interface with RAII cleanup.
///
/// Created with `sudo ip tuntap add` owned by the current user, so the test
/// process can attach to it without `CAP_NET_ADMIN`, and deleted on drop.
pub struct TapInterface {
    pub name: String,
}

impl TapInterface {
    pub fn new(name: &str) -> Result<Self> {
        // Clean up a stale interface with the same name (idempotent)
        let _ = sudo(&["ip", "link", "del", name]);

        let uid = current_uid()?;
        sudo_checked(&["ip", "tuntap", "add", "dev", name, "mode", "tap", "user", &uid])
            .with_context(|| format!("create tap '{name}'"))?;
        sudo_checked(&["ip", "link", "set", name, "up"])
            .with_context(|| format!("bring tap '{name}' up"))?;

        debug!(tap = name, "created tap interface");

        Ok(Self {
            name: name.to_string(),
        })
    }

    /// Run `ip link show` for this interface.
    pub fn show(&self) -> Result<Output> {
        sudo_checked(&["ip", "link", "show", &self.name])
    }
}

impl Drop for TapInterface {
    fn drop(&mut self) {
        debug!(tap = self.name, "deleting tap interface");
        let _ = sudo(&["ip", "link", "del", &self.name]);
    }
}

/// TAP interfaces `tap0-ns` .. `tap(n-1)-ns`, as the simulator expects them.
pub struct TapSet {
    pub taps: Vec<TapInterface>,
}

impl TapSet {
    pub fn provision(count: u32) -> Result<Self> {
        let taps = (0..count)
            .map(|i| TapInterface::new(&format!("tap{i}-ns")))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { taps })
    }

    pub fn names(&self) -> Vec<String> {
        self.taps.iter().map(|tap| tap.name.clone()).collect()
    }
}

// -- helpers --

fn current_uid() -> Result<String> {
    let output = Command::new("id").arg("-u").output().context("run id -u")?;
    if !output.status.success() {
        bail!("id -u failed");
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

/// Run `sudo <args>`, returning raw output.
fn sudo(args: &[&str]) -> Result<Output> {
    Command::new("sudo")
        .args(args)
        .output()
        .with_context(|| format!("sudo {}", args.join(" ")))
}

/// Run `sudo <args>`, returning output on success or bailing with stderr.
fn sudo_checked(args: &[&str]) -> Result<Output> {
    let output = sudo(args)?;
    if !output.status.success() {
        bail!(
            "command failed: sudo {}\n{}",
            args.join(" "),
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::check_privileges;

    #[test]
    fn test_tap_lifecycle() {
        if !check_privileges() {
            eprintln!("Skipping: insufficient privileges");
            return;
        }

        let name = crate::test_util::unique_tap_name("tht");
        {
            let tap = TapInterface::new(&name).expect("create tap");
            let out = tap.show().expect("ip link show");
            let stdout = String::from_utf8_lossy(&out.stdout);
            assert!(stdout.contains(&name), "tap missing: {stdout}");
        }

        let out = Command::new("ip").args(["link", "show", &name]).output().unwrap();
        assert!(!out.status.success(), "tap survived drop");
    }
}
