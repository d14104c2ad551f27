//! The real-time simulation engine.
//!
//! [`SimulationEngine::build`] turns a [`Topology`] into a
//! [`SimulationContext`] with every endpoint bound to its host device,
//! [`SimulationEngine::run`] drives the event loop on the calling thread
//! until a [`StopSignal`] fires, and [`SimulationEngine::teardown`] consumes
//! the context and releases every device.
//!
//! Events are processed in wall-clock order:
//! - frame arrivals, read from each device by a reader task and forwarded
//!   over an mpsc channel;
//! - timer events from the [`EventQueue`]: frame deliveries after the
//!   channel's propagation delay and the periodic status report.

pub mod queue;
pub mod signal;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::Interest;
use tokio::io::unix::AsyncFd;
use tokio::runtime::Runtime;
use tokio::sync::mpsc::{UnboundedSender, unbounded_channel};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};
use tracing::{debug, info, trace, warn};

use crate::bridge::{Binding, BindingRegistry, BridgeAdapter, DeviceBackend, FrameDevice};
use crate::config::EngineOptions;
use crate::error::{LanError, Result};
use crate::topology::{EndpointStats, SharedChannel, Topology, TopologyBuilder};
pub use queue::{EventQueue, TimerEvent};
pub use signal::StopSignal;

/// Largest frame read from a host device (TAP MTU up to 64 KiB plus header).
pub const MAX_FRAME_LEN: usize = 65_550;

/// Pause before retrying after a device read error.
const READ_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Lifecycle of one [`SimulationContext`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EngineState {
    Building,
    Running,
    TearingDown,
    Destroyed,
}

impl EngineState {
    /// Whether `self -> next` is a legal transition. A failed build goes
    /// straight to teardown; nothing else skips a state.
    pub const fn can_advance_to(self, next: EngineState) -> bool {
        matches!(
            (self, next),
            (EngineState::Building, EngineState::Running)
                | (EngineState::Building, EngineState::TearingDown)
                | (EngineState::Running, EngineState::TearingDown)
                | (EngineState::TearingDown, EngineState::Destroyed)
        )
    }
}

impl fmt::Display for EngineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineState::Building => write!(f, "building"),
            EngineState::Running => write!(f, "running"),
            EngineState::TearingDown => write!(f, "tearing-down"),
            EngineState::Destroyed => write!(f, "destroyed"),
        }
    }
}

/// Wall-clock time base of one context.
#[derive(Clone, Copy, Debug)]
pub struct RealtimeClock {
    origin: Instant,
}

impl RealtimeClock {
    pub fn start() -> Self {
        Self {
            origin: Instant::now(),
        }
    }

    #[inline]
    pub fn now(&self) -> Instant {
        Instant::now()
    }

    pub fn elapsed(&self) -> Duration {
        self.origin.elapsed()
    }
}

/// Lateness of timer events relative to their deadline.
#[derive(Clone, Copy, Debug, Default)]
pub struct JitterStats {
    pub samples: u64,
    pub total: Duration,
    pub max: Duration,
}

impl JitterStats {
    fn record(&mut self, late: Duration) {
        self.samples += 1;
        self.total += late;
        self.max = self.max.max(late);
    }

    pub fn mean(&self) -> Duration {
        if self.samples == 0 {
            Duration::ZERO
        } else {
            Duration::from_nanos((self.total.as_nanos() / u128::from(self.samples)) as u64)
        }
    }
}

/// A frame read from the host device of `node`.
#[derive(Debug)]
pub struct InboundFrame {
    pub node: u32,
    pub data: Arc<[u8]>,
}

/// Everything one engine instance owns: channel, bindings, clock and queue.
pub struct SimulationContext<D: FrameDevice> {
    topology: Topology,
    channel: SharedChannel,
    bindings: Vec<Binding<D>>,
    queue: EventQueue,
    clock: RealtimeClock,
    state: EngineState,
    jitter: JitterStats,
}

impl<D: FrameDevice> fmt::Debug for SimulationContext<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SimulationContext")
            .field("topology", &self.topology)
            .field("state", &self.state)
            .field("bindings", &self.bindings)
            .field("pending", &self.queue.len())
            .finish()
    }
}

impl<D: FrameDevice> SimulationContext<D> {
    fn new(topology: &Topology) -> Self {
        Self {
            topology: *topology,
            channel: TopologyBuilder::build(topology),
            bindings: Vec::new(),
            queue: EventQueue::new(),
            clock: RealtimeClock::start(),
            state: EngineState::Building,
            jitter: JitterStats::default(),
        }
    }

    pub fn state(&self) -> EngineState {
        self.state
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    pub fn channel(&self) -> &SharedChannel {
        &self.channel
    }

    pub fn bound_devices(&self) -> Vec<&str> {
        self.bindings
            .iter()
            .map(|binding| binding.device_name.as_str())
            .collect()
    }

    fn advance(&mut self, next: EngineState) {
        debug_assert!(
            self.state.can_advance_to(next),
            "illegal engine transition {} -> {}",
            self.state,
            next
        );
        debug!(from = %self.state, to = %next, "engine state");
        self.state = next;
    }

    /// A frame arrived from a host device: put it on the medium.
    fn handle_inbound(&mut self, frame: InboundFrame) {
        let receivers = self.channel.transmit(frame.node, frame.data.len());
        let deadline = self.clock.now() + self.channel.delay();
        trace!(
            from = frame.node,
            len = frame.data.len(),
            receivers = receivers.len(),
            "frame on channel"
        );
        for to in receivers {
            self.queue.schedule(
                deadline,
                TimerEvent::Deliver {
                    to,
                    frame: frame.data.clone(),
                },
            );
        }
    }

    fn deliver(&mut self, to: u32, frame: &[u8]) {
        let Some(binding) = self.bindings.get(to as usize) else {
            return;
        };
        match binding.device.send_frame(frame) {
            Ok(_) => self.channel.record_delivery(to, frame.len()),
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                trace!(device = %binding.device_name, "device queue full, frame dropped");
                self.channel.record_drop(to);
            }
            Err(err) => {
                warn!(device = %binding.device_name, "write failed: {err}");
                self.channel.record_drop(to);
            }
        }
    }

    /// Process every timer event that is due, checking `stop` between events.
    fn fire_due(&mut self, stop: &StopSignal, status_interval: Option<Duration>) {
        let now = self.clock.now();
        while let Some(scheduled) = self.queue.pop_due(now) {
            self.jitter
                .record(now.saturating_duration_since(scheduled.deadline));
            match scheduled.event {
                TimerEvent::Deliver { to, frame } => self.deliver(to, &frame),
                TimerEvent::StatusReport => {
                    self.log_status();
                    if let Some(interval) = status_interval {
                        self.queue
                            .schedule(scheduled.deadline + interval, TimerEvent::StatusReport);
                    }
                }
            }
            if stop.is_requested() {
                break;
            }
        }
    }

    /// Hand out deliveries that were already due when the stop arrived.
    fn flush_due(&mut self) {
        let now = self.clock.now();
        while let Some(scheduled) = self.queue.pop_due(now) {
            if let TimerEvent::Deliver { to, frame } = scheduled.event {
                self.deliver(to, &frame);
            }
        }
    }

    fn log_status(&self) {
        let totals = self.channel.totals();
        info!(
            uptime_s = self.clock.elapsed().as_secs(),
            nodes = self.topology.node_count(),
            frames_tx = totals.frames_tx,
            frames_rx = totals.frames_rx,
            dropped = totals.dropped,
            pending = self.queue.len(),
            max_jitter_us = self.jitter.max.as_micros() as u64,
            "channel status"
        );
    }
}

/// What a finished engine reports back to the controller.
#[derive(Clone, Debug)]
pub struct TeardownReport {
    pub uptime: Duration,
    pub totals: EndpointStats,
    /// Deliveries still queued when the engine stopped.
    pub discarded: u64,
    pub max_jitter: Duration,
    pub mean_jitter: Duration,
    /// Device names released by this teardown, in node order.
    pub released: Vec<String>,
}

/// Builds, runs and tears down simulation contexts on one device backend.
pub struct SimulationEngine<B: DeviceBackend> {
    backend: Arc<B>,
    registry: BindingRegistry,
    options: EngineOptions,
}

impl<B: DeviceBackend> SimulationEngine<B> {
    pub fn new(backend: Arc<B>, registry: BindingRegistry, options: EngineOptions) -> Self {
        Self {
            backend,
            registry,
            options,
        }
    }

    /// Runtime the event loop runs on. One per engine thread.
    pub fn runtime() -> Result<Runtime> {
        tokio::runtime::Builder::new_current_thread()
            .enable_io()
            .enable_time()
            .build()
            .map_err(|err| LanError::EngineStart(format!("build runtime: {err}")))
    }

    /// Create a context and bind every node. If any bind fails, the bindings
    /// made so far are released before the error is returned.
    pub fn build(&self, topology: &Topology) -> Result<SimulationContext<B::Device>> {
        let mut ctx = SimulationContext::new(topology);
        let adapter = BridgeAdapter::new(self.backend.as_ref(), &self.registry);

        for node in 0..topology.node_count() {
            match adapter.attach(node) {
                Ok(binding) => ctx.bindings.push(binding),
                Err(err) => {
                    warn!(node, "bind failed, rolling back {} bindings: {err}", ctx.bindings.len());
                    self.teardown(ctx);
                    return Err(err);
                }
            }
        }

        info!(
            nodes = topology.node_count(),
            delay_ms = topology.delay().as_millis() as u64,
            checksums = "off",
            "simulation built"
        );
        Ok(ctx)
    }

    /// Run the event loop on the calling thread until `stop` fires.
    pub fn run(
        &self,
        runtime: &Runtime,
        ctx: &mut SimulationContext<B::Device>,
        stop: &StopSignal,
    ) -> Result<()> {
        ctx.advance(EngineState::Running);
        runtime.block_on(event_loop(ctx, stop, self.options.status_interval))
    }

    /// Release every binding and destroy the context.
    pub fn teardown(&self, mut ctx: SimulationContext<B::Device>) -> TeardownReport {
        ctx.advance(EngineState::TearingDown);

        let discarded = ctx.queue.discard();
        let released: Vec<String> = ctx
            .bindings
            .drain(..)
            .map(|binding| binding.device_name.clone())
            .collect();

        ctx.advance(EngineState::Destroyed);

        let report = TeardownReport {
            uptime: ctx.clock.elapsed(),
            totals: ctx.channel.totals(),
            discarded,
            max_jitter: ctx.jitter.max,
            mean_jitter: ctx.jitter.mean(),
            released,
        };
        info!(
            released = report.released.len(),
            frames_tx = report.totals.frames_tx,
            frames_rx = report.totals.frames_rx,
            discarded,
            "simulation destroyed"
        );
        report
    }
}

/// Spawn a task forwarding every frame read from `fd` to the engine loop.
fn spawn_reader<D: FrameDevice>(
    node: u32,
    label: String,
    fd: AsyncFd<Arc<D>>,
    frame_tx: UnboundedSender<InboundFrame>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut buf = vec![0u8; MAX_FRAME_LEN];
        loop {
            let mut guard = match fd.readable().await {
                Ok(guard) => guard,
                Err(err) => {
                    warn!(device = %label, "readiness failed: {err}");
                    return;
                }
            };
            match guard.try_io(|inner| inner.get_ref().recv_frame(&mut buf)) {
                Ok(Ok(0)) => {
                    trace!(device = %label, "empty frame skipped");
                }
                Ok(Ok(len)) => {
                    let frame = InboundFrame {
                        node,
                        data: Arc::from(&buf[..len]),
                    };
                    if frame_tx.send(frame).is_err() {
                        return;
                    }
                }
                Ok(Err(err)) => {
                    warn!(device = %label, "read failed: {err}");
                    time::sleep(READ_ERROR_BACKOFF).await;
                }
                Err(_would_block) => continue,
            }
        }
    })
}

async fn event_loop<D: FrameDevice>(
    ctx: &mut SimulationContext<D>,
    stop: &StopSignal,
    status_interval: Option<Duration>,
) -> Result<()> {
    let (frame_tx, mut frame_rx) = unbounded_channel::<InboundFrame>();

    let mut readers = Vec::with_capacity(ctx.bindings.len());
    for binding in &ctx.bindings {
        let fd = match AsyncFd::with_interest(binding.device.clone(), Interest::READABLE) {
            Ok(fd) => fd,
            Err(err) => {
                readers.iter().for_each(JoinHandle::abort);
                return Err(LanError::EngineFailed(format!(
                    "register {}: {err}",
                    binding.device_name
                )));
            }
        };
        readers.push(spawn_reader(
            binding.node,
            binding.device_name.clone(),
            fd,
            frame_tx.clone(),
        ));
    }

    if let Some(interval) = status_interval {
        ctx.queue
            .schedule(ctx.clock.now() + interval, TimerEvent::StatusReport);
    }

    info!(devices = readers.len(), "engine running");

    loop {
        if stop.is_requested() {
            break;
        }
        let deadline = ctx.queue.next_deadline();
        tokio::select! {
            biased;
            () = stop.wait() => {}
            () = time::sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                ctx.fire_due(stop, status_interval);
            }
            frame = frame_rx.recv() => {
                // `frame_tx` lives until the loop ends, so the channel stays open.
                if let Some(frame) = frame {
                    ctx.handle_inbound(frame);
                    while !stop.is_requested() {
                        match frame_rx.try_recv() {
                            Ok(frame) => ctx.handle_inbound(frame),
                            Err(_) => break,
                        }
                    }
                }
            }
        }
    }

    if !stop.is_forced() {
        ctx.flush_due();
    }

    // Readers hold clones of the device handles; wait until they are gone so
    // teardown really closes the devices.
    for reader in &readers {
        reader.abort();
    }
    for reader in readers {
        let _ = reader.await;
    }
    drop(frame_tx);

    debug!(pending = ctx.queue.len(), forced = stop.is_forced(), "engine loop exited");
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::error::BindFailure;
    use crate::test_helpers::PairBackend;

    fn engine(backend: &Arc<PairBackend>, registry: &BindingRegistry) -> SimulationEngine<PairBackend> {
        SimulationEngine::new(backend.clone(), registry.clone(), EngineOptions::default())
    }

    #[test]
    fn test_transitions() {
        use EngineState::*;
        assert!(Building.can_advance_to(Running));
        assert!(Building.can_advance_to(TearingDown));
        assert!(Running.can_advance_to(TearingDown));
        assert!(TearingDown.can_advance_to(Destroyed));

        assert!(!Building.can_advance_to(Destroyed));
        assert!(!Running.can_advance_to(Destroyed));
        assert!(!Destroyed.can_advance_to(Building));
        assert!(!TearingDown.can_advance_to(Running));
    }

    #[test]
    fn test_build_binds_every_node() {
        let backend = Arc::new(PairBackend::with_devices(3));
        let registry = BindingRegistry::new();
        let engine = engine(&backend, &registry);

        let topo = Topology::new(3, Duration::ZERO).unwrap();
        let ctx = engine.build(&topo).unwrap();
        assert_eq!(ctx.state(), EngineState::Building);
        assert_eq!(ctx.bound_devices(), vec!["tap0-ns", "tap1-ns", "tap2-ns"]);
        assert_eq!(registry.len(), 3);

        let report = engine.teardown(ctx);
        assert_eq!(report.released, vec!["tap0-ns", "tap1-ns", "tap2-ns"]);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_failed_build_leaves_nothing_bound() {
        // Only tap0-ns and tap1-ns exist.
        let backend = Arc::new(PairBackend::with_devices(2));
        let registry = BindingRegistry::new();
        let engine = engine(&backend, &registry);

        let topo = Topology::new(3, Duration::ZERO).unwrap();
        let err = engine.build(&topo).unwrap_err();
        match err {
            LanError::DeviceBind { device, reason } => {
                assert_eq!(device, "tap2-ns");
                assert!(matches!(reason, BindFailure::Missing));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(registry.is_empty());
        assert_eq!(backend.open_count(), 0);
    }

    #[test]
    fn test_run_until_stopped() {
        let backend = Arc::new(PairBackend::with_devices(2));
        let registry = BindingRegistry::new();
        let engine = engine(&backend, &registry);
        let stop = Arc::new(StopSignal::new());

        let topo = Topology::new(2, Duration::ZERO).unwrap();
        let mut ctx = engine.build(&topo).unwrap();

        let stopper = {
            let stop = stop.clone();
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(50));
                stop.request();
            })
        };

        let runtime = SimulationEngine::<PairBackend>::runtime().unwrap();
        engine.run(&runtime, &mut ctx, &stop).unwrap();
        assert_eq!(ctx.state(), EngineState::Running);
        stopper.join().unwrap();

        engine.teardown(ctx);
        assert!(registry.is_empty());
        assert_eq!(backend.open_count(), 0);
    }

    #[test]
    fn test_frames_cross_the_channel() {
        let backend = Arc::new(PairBackend::with_devices(3));
        let registry = BindingRegistry::new();
        let engine = engine(&backend, &registry);
        let stop = Arc::new(StopSignal::new());

        let topo = Topology::new(3, Duration::ZERO).unwrap();
        let mut ctx = engine.build(&topo).unwrap();

        let host0 = backend.host("tap0-ns").unwrap();
        let host1 = backend.host("tap1-ns").unwrap();
        let host2 = backend.host("tap2-ns").unwrap();

        let tester = {
            let stop = stop.clone();
            std::thread::spawn(move || {
                host0.send(b"ping").unwrap();
                let mut buf = [0u8; 64];
                let n1 = host1.recv(&mut buf).unwrap();
                assert_eq!(&buf[..n1], b"ping");
                let n2 = host2.recv(&mut buf).unwrap();
                assert_eq!(&buf[..n2], b"ping");
                stop.request();
            })
        };

        let runtime = SimulationEngine::<PairBackend>::runtime().unwrap();
        engine.run(&runtime, &mut ctx, &stop).unwrap();
        tester.join().unwrap();

        let report = engine.teardown(ctx);
        assert_eq!(report.totals.frames_tx, 1);
        assert_eq!(report.totals.frames_rx, 2);
    }

    #[test]
    fn test_status_report_reschedules() {
        let backend = Arc::new(PairBackend::with_devices(1));
        let registry = BindingRegistry::new();
        let options = EngineOptions {
            status_interval: Some(Duration::from_millis(10)),
            ..EngineOptions::default()
        };
        let engine = SimulationEngine::new(backend.clone(), registry.clone(), options);
        let stop = Arc::new(StopSignal::new());

        let topo = Topology::new(1, Duration::ZERO).unwrap();
        let mut ctx = engine.build(&topo).unwrap();

        let stopper = {
            let stop = stop.clone();
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(80));
                stop.request();
            })
        };

        let runtime = SimulationEngine::<PairBackend>::runtime().unwrap();
        engine.run(&runtime, &mut ctx, &stop).unwrap();
        stopper.join().unwrap();

        // Several reports fired, and one is always pending for the next tick.
        assert!(ctx.jitter.samples >= 2, "samples: {}", ctx.jitter.samples);
        assert_eq!(ctx.queue.len(), 1);

        let report = engine.teardown(ctx);
        assert_eq!(report.discarded, 0);
    }

    #[test]
    fn test_forced_stop_discards_pending() {
        let backend = Arc::new(PairBackend::with_devices(2));
        let registry = BindingRegistry::new();
        let engine = engine(&backend, &registry);
        let stop = Arc::new(StopSignal::new());

        // Long delay so the frame is still in flight when we stop.
        let topo = Topology::new(2, Duration::from_secs(10)).unwrap();
        let mut ctx = engine.build(&topo).unwrap();
        let host0 = backend.host("tap0-ns").unwrap();

        let stopper = {
            let stop = stop.clone();
            std::thread::spawn(move || {
                host0.send(b"late").unwrap();
                std::thread::sleep(Duration::from_millis(100));
                stop.force();
            })
        };

        let runtime = SimulationEngine::<PairBackend>::runtime().unwrap();
        engine.run(&runtime, &mut ctx, &stop).unwrap();
        stopper.join().unwrap();

        let report = engine.teardown(ctx);
        assert_eq!(report.discarded, 1);
        assert_eq!(report.totals.frames_rx, 0);
    }
}
