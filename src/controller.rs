//! Engine lifecycle: start, stop and restart under operator control.
//!
//! The controller owns at most one engine thread. `stop` only returns once
//! that thread has torn its context down and released every device, so a
//! following `start` can always rebind the same names.

use std::sync::Arc;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::bridge::{BindingRegistry, DeviceBackend};
use crate::config::{EngineOptions, SimConfig};
use crate::engine::{SimulationEngine, StopSignal, TeardownReport};
use crate::error::{LanError, Result};
use crate::topology::Topology;

/// Name of the engine thread.
pub const ENGINE_THREAD_NAME: &str = "sim-engine";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ControllerState {
    Stopped,
    Running,
}

/// How a `stop` call ended.
#[derive(Debug)]
pub enum StopOutcome {
    /// Nothing was running.
    AlreadyStopped,
    /// The engine honoured the stop request within the grace period.
    Stopped(TeardownReport),
    /// The grace period elapsed and the engine only exited after a forced
    /// stop, discarding in-flight frames.
    Forced(TeardownReport),
}

impl StopOutcome {
    pub fn report(&self) -> Option<&TeardownReport> {
        match self {
            StopOutcome::AlreadyStopped => None,
            StopOutcome::Stopped(report) | StopOutcome::Forced(report) => Some(report),
        }
    }
}

/// Sent by the engine thread once teardown has completed.
struct EngineExit {
    report: TeardownReport,
    result: Result<()>,
}

struct EngineHandle {
    thread: JoinHandle<()>,
    stop: Arc<StopSignal>,
    done_rx: Receiver<EngineExit>,
}

pub struct LifecycleController<B: DeviceBackend> {
    backend: Arc<B>,
    registry: BindingRegistry,
    options: EngineOptions,
    config: SimConfig,
    engine: Option<EngineHandle>,
}

impl<B: DeviceBackend> LifecycleController<B> {
    /// A stopped controller with the bootstrap configuration.
    pub fn new(backend: Arc<B>, options: EngineOptions) -> Self {
        Self {
            backend,
            registry: BindingRegistry::new(),
            options,
            config: SimConfig::default(),
            engine: None,
        }
    }

    pub fn config(&self) -> SimConfig {
        self.config
    }

    pub fn options(&self) -> EngineOptions {
        self.options
    }

    /// Current state. An engine that exited on its own is reaped here.
    pub fn state(&mut self) -> ControllerState {
        self.reap_exited();
        if self.engine.is_some() {
            ControllerState::Running
        } else {
            ControllerState::Stopped
        }
    }

    pub fn is_running(&mut self) -> bool {
        self.state() == ControllerState::Running
    }

    /// Device names bound right now, sorted.
    pub fn active_bindings(&self) -> Vec<String> {
        self.registry.active()
    }

    /// Build and run a new engine. Only valid while stopped.
    pub fn start(&mut self, delay: Duration, node_count: u32) -> Result<()> {
        if self.is_running() {
            return Err(LanError::EngineStart(
                "an engine is already running; stop or restart it".into(),
            ));
        }
        let topology = Topology::new(node_count, delay)?;
        self.launch(topology)
    }

    /// Stop the running engine and wait for its teardown. Stopping a stopped
    /// controller is a no-op.
    pub fn stop(&mut self) -> Result<StopOutcome> {
        let Some(handle) = self.engine.take() else {
            debug!("stop requested while stopped");
            return Ok(StopOutcome::AlreadyStopped);
        };

        handle.stop.request();
        match handle.done_rx.recv_timeout(self.options.stop_grace) {
            Ok(exit) => return finish(handle.thread, exit, false),
            Err(RecvTimeoutError::Disconnected) => return Err(engine_died(handle.thread)),
            Err(RecvTimeoutError::Timeout) => {}
        }

        warn!(
            grace_ms = self.options.stop_grace.as_millis() as u64,
            "engine ignored stop request, forcing"
        );
        handle.stop.force();
        match handle.done_rx.recv_timeout(self.options.force_grace) {
            Ok(exit) => finish(handle.thread, exit, true),
            Err(RecvTimeoutError::Disconnected) => Err(engine_died(handle.thread)),
            Err(RecvTimeoutError::Timeout) => {
                // The thread is detached; its devices stay claimed until it
                // exits, so a new build reports them busy instead of sharing.
                let orphaned = self.registry.active();
                warn!(?orphaned, "engine did not tear down, abandoning its thread");
                drop(handle);
                Err(LanError::TeardownTimeout { orphaned })
            }
        }
    }

    /// Stop, then start with the given parameters. An invalid topology is
    /// rejected before the running engine is touched.
    pub fn restart(&mut self, delay: Duration, node_count: u32) -> Result<()> {
        let topology = Topology::new(node_count, delay)?;
        match self.stop() {
            Ok(_) => {}
            // The old engine already tore down; only its run failed.
            Err(LanError::EngineFailed(msg)) => warn!("previous engine failed: {msg}"),
            Err(err) => return Err(err),
        }
        self.launch(topology)
    }

    fn launch(&mut self, topology: Topology) -> Result<()> {
        self.config = SimConfig::new(topology.delay(), topology.node_count());

        let stop = Arc::new(StopSignal::new());
        let (ready_tx, ready_rx) = mpsc::sync_channel::<Result<()>>(1);
        let (done_tx, done_rx) = mpsc::sync_channel::<EngineExit>(1);
        let engine = SimulationEngine::new(self.backend.clone(), self.registry.clone(), self.options);

        let thread = thread::Builder::new()
            .name(ENGINE_THREAD_NAME.into())
            .spawn({
                let stop = stop.clone();
                move || engine_main(engine, topology, stop, ready_tx, done_tx)
            })
            .map_err(|err| LanError::EngineStart(format!("spawn engine thread: {err}")))?;

        match ready_rx.recv() {
            Ok(Ok(())) => {
                info!(config = %self.config, "engine started");
                self.engine = Some(EngineHandle {
                    thread,
                    stop,
                    done_rx,
                });
                Ok(())
            }
            Ok(Err(err)) => {
                let _ = thread.join();
                warn!(config = %self.config, "engine start failed: {err}");
                Err(err)
            }
            Err(_) => {
                let _ = thread.join();
                Err(LanError::EngineStart(
                    "engine thread exited during build".into(),
                ))
            }
        }
    }

    /// Collect an engine that left its loop without being asked to.
    fn reap_exited(&mut self) {
        let exited = match &self.engine {
            Some(handle) => match handle.done_rx.try_recv() {
                Ok(exit) => Some(Some(exit)),
                Err(mpsc::TryRecvError::Disconnected) => Some(None),
                Err(mpsc::TryRecvError::Empty) => None,
            },
            None => None,
        };
        let Some(exit) = exited else {
            return;
        };
        let Some(handle) = self.engine.take() else {
            return;
        };
        match exit {
            Some(exit) => {
                let _ = handle.thread.join();
                match exit.result {
                    Ok(()) => warn!("engine exited on its own"),
                    Err(err) => warn!("engine exited: {err}"),
                }
            }
            None => warn!("{}", engine_died(handle.thread)),
        }
    }
}

impl<B: DeviceBackend> Drop for LifecycleController<B> {
    fn drop(&mut self) {
        if let Err(err) = self.stop() {
            warn!("stop on drop failed: {err}");
        }
    }
}

fn finish(thread: JoinHandle<()>, exit: EngineExit, forced: bool) -> Result<StopOutcome> {
    let _ = thread.join();
    exit.result?;
    let report = exit.report;
    if forced {
        warn!(
            discarded = report.discarded,
            "engine stopped only after a forced stop"
        );
        Ok(StopOutcome::Forced(report))
    } else {
        info!(
            released = report.released.len(),
            uptime_ms = report.uptime.as_millis() as u64,
            "engine stopped"
        );
        Ok(StopOutcome::Stopped(report))
    }
}

fn engine_died(thread: JoinHandle<()>) -> LanError {
    match thread.join() {
        Ok(()) => LanError::EngineFailed("engine thread exited without reporting".into()),
        Err(_) => LanError::EngineFailed("engine thread panicked".into()),
    }
}

/// Body of the engine thread: build, report readiness, run, tear down.
fn engine_main<B: DeviceBackend>(
    engine: SimulationEngine<B>,
    topology: Topology,
    stop: Arc<StopSignal>,
    ready_tx: SyncSender<Result<()>>,
    done_tx: SyncSender<EngineExit>,
) {
    let runtime = match SimulationEngine::<B>::runtime() {
        Ok(runtime) => runtime,
        Err(err) => {
            let _ = ready_tx.send(Err(err));
            return;
        }
    };
    let mut ctx = match engine.build(&topology) {
        Ok(ctx) => ctx,
        Err(err) => {
            let _ = ready_tx.send(Err(err));
            return;
        }
    };
    let _ = ready_tx.send(Ok(()));

    let result = engine.run(&runtime, &mut ctx, &stop);
    if let Err(err) = &result {
        warn!("engine loop failed: {err}");
    }
    drop(runtime);

    let report = engine.teardown(ctx);
    let _ = done_tx.send(EngineExit { report, result });
}
