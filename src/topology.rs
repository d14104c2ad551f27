//! Simulated LAN topology: N endpoints on one shared broadcast channel.

use std::time::Duration;

use tracing::debug;

use crate::error::{LanError, Result};

/// Largest node count a topology accepts.
pub const MAX_NODE_COUNT: u32 = 1024;

/// Name of the host TAP device bridged to node `index`.
pub fn device_name(index: u32) -> String {
    format!("tap{index}-ns")
}

/// Immutable description of one engine build.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Topology {
    node_count: u32,
    delay: Duration,
}

impl Topology {
    pub fn new(node_count: u32, delay: Duration) -> Result<Self> {
        if node_count < 1 {
            return Err(LanError::InvalidTopology(format!(
                "node count must be at least 1, got {node_count}"
            )));
        }
        if node_count > MAX_NODE_COUNT {
            return Err(LanError::InvalidTopology(format!(
                "node count must be at most {MAX_NODE_COUNT}, got {node_count}"
            )));
        }
        Ok(Self { node_count, delay })
    }

    pub fn node_count(&self) -> u32 {
        self.node_count
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }

    /// Device names for every node, in node order.
    pub fn device_names(&self) -> Vec<String> {
        (0..self.node_count).map(device_name).collect()
    }
}

/// Per-endpoint frame counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct EndpointStats {
    pub frames_tx: u64,
    pub frames_rx: u64,
    pub bytes_tx: u64,
    pub bytes_rx: u64,
    /// Deliveries the host device refused (full queue or I/O error).
    pub dropped: u64,
}

/// One simulated station attached to the channel.
#[derive(Debug)]
pub struct Endpoint {
    pub index: u32,
    pub stats: EndpointStats,
}

/// Shared broadcast medium. Every frame sent by one endpoint reaches every
/// other endpoint after the propagation delay.
#[derive(Debug)]
pub struct SharedChannel {
    delay: Duration,
    endpoints: Vec<Endpoint>,
}

impl SharedChannel {
    pub fn delay(&self) -> Duration {
        self.delay
    }

    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }

    pub fn endpoints(&self) -> &[Endpoint] {
        &self.endpoints
    }

    /// Account for a frame sent by `from` and return the receivers.
    pub fn transmit(&mut self, from: u32, len: usize) -> Vec<u32> {
        if let Some(sender) = self.endpoints.get_mut(from as usize) {
            sender.stats.frames_tx += 1;
            sender.stats.bytes_tx += len as u64;
        }
        self.endpoints
            .iter()
            .map(|endpoint| endpoint.index)
            .filter(|&index| index != from)
            .collect()
    }

    pub fn record_delivery(&mut self, to: u32, len: usize) {
        if let Some(endpoint) = self.endpoints.get_mut(to as usize) {
            endpoint.stats.frames_rx += 1;
            endpoint.stats.bytes_rx += len as u64;
        }
    }

    pub fn record_drop(&mut self, to: u32) {
        if let Some(endpoint) = self.endpoints.get_mut(to as usize) {
            endpoint.stats.dropped += 1;
        }
    }

    /// Sum of the counters of every endpoint.
    pub fn totals(&self) -> EndpointStats {
        self.endpoints
            .iter()
            .fold(EndpointStats::default(), |mut acc, endpoint| {
                acc.frames_tx += endpoint.stats.frames_tx;
                acc.frames_rx += endpoint.stats.frames_rx;
                acc.bytes_tx += endpoint.stats.bytes_tx;
                acc.bytes_rx += endpoint.stats.bytes_rx;
                acc.dropped += endpoint.stats.dropped;
                acc
            })
    }
}

/// Builds the endpoints and channel for a [`Topology`].
pub struct TopologyBuilder;

impl TopologyBuilder {
    pub fn build(topology: &Topology) -> SharedChannel {
        let endpoints = (0..topology.node_count())
            .map(|index| Endpoint {
                index,
                stats: EndpointStats::default(),
            })
            .collect();

        debug!(
            nodes = topology.node_count(),
            delay_ms = topology.delay().as_millis() as u64,
            "built shared channel"
        );

        SharedChannel {
            delay: topology.delay(),
            endpoints,
        }
    }
}
