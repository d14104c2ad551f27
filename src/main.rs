#[cfg(not(target_os = "linux"))]
compile_error!("tap-lan binds Linux TAP devices and only builds on Linux");

use std::io;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tap_lan::config::{
    DEFAULT_DELAY_MS, DEFAULT_FORCE_GRACE_MS, DEFAULT_NODE_COUNT, DEFAULT_STATUS_INTERVAL_SECS,
    DEFAULT_STOP_GRACE_MS,
};
use tap_lan::{ConsoleCommandLoop, EngineOptions, LifecycleController, TapBackend};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

// Use mimalloc as the global allocator for the binary (non-Windows only)
#[cfg(not(windows))]
#[global_allocator]
static ALLOC: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[derive(Parser, Debug)]
#[command(
    name = "tap-lan",
    author,
    version,
    disable_version_flag = true,
    about = "Simulated shared-medium LAN bridged to tap0-ns .. tapN-ns"
)]
struct Cli {
    /// Print the version and exit
    #[arg(short = 'v', long = "version", action = clap::ArgAction::SetTrue)]
    print_version: bool,

    /// Number of simulated nodes (one TAP device each)
    #[arg(long = "nodes", default_value_t = DEFAULT_NODE_COUNT)]
    nodes: u32,
    /// Channel propagation delay in milliseconds
    #[arg(long = "delay-ms", default_value_t = DEFAULT_DELAY_MS)]
    delay_ms: u64,
    /// How long `stop` waits for a clean teardown before forcing it
    #[arg(long = "stop-grace-ms", default_value_t = DEFAULT_STOP_GRACE_MS)]
    stop_grace_ms: u64,
    /// How long a forced stop may take before the engine is abandoned
    #[arg(long = "force-grace-ms", default_value_t = DEFAULT_FORCE_GRACE_MS)]
    force_grace_ms: u64,
    /// Interval of the channel status log in seconds (0 disables it)
    #[arg(long = "status-interval-secs", default_value_t = DEFAULT_STATUS_INTERVAL_SECS)]
    status_interval_secs: u64,
}

fn main() -> Result<()> {
    // Logs go to stderr; stdout carries the console prompts.
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .with_writer(io::stderr)
        .init();

    let args = Cli::parse();
    if args.print_version {
        println!(
            "{} ({}@{}{}) [{}]",
            env!("CARGO_PKG_VERSION"),
            env!("GIT_BRANCH"),
            env!("GIT_HASH"),
            env!("GIT_DIRTY"),
            env!("CARGO_PKG_NAME")
        );
        return Ok(());
    }

    let options = EngineOptions::from_cli(
        args.stop_grace_ms,
        args.force_grace_ms,
        args.status_interval_secs,
    );
    let mut controller = LifecycleController::new(Arc::new(TapBackend), options);

    // A bootstrap failure (usually a missing tap) leaves the console usable:
    // the operator can fix the host side and `start` or `chgn`.
    if let Err(err) = controller.start(Duration::from_millis(args.delay_ms), args.nodes) {
        warn!("initial start failed: {err}");
    }

    let stdin = io::stdin();
    let stdout = io::stdout();
    let mut console = ConsoleCommandLoop::new(stdin.lock(), stdout.lock());
    console.run(&mut controller).context("console input failed")?;

    info!("end of input, shutting down");
    controller.stop().context("stop simulation")?;
    Ok(())
}
