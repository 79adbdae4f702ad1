//! Closed connection collection and aggregation
//!
//! Accumulates close batches from every CPU ring, keeps the last observed
//! state of each port binding, and builds the final report.

use crate::types::*;
use conntrack_common::{CloseBatch, PortBindingKey, TelemetryCounter};
use conntrack_tracer::Tracer;
use log::debug;
use std::collections::BTreeMap;

/// Report key of a port binding
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct PortKey {
    protocol: &'static str,
    netns: u32,
    port: u16,
}

/// Metrics collector for closed connections and port bindings
#[derive(Default)]
pub struct MetricsCollector {
    /// Closed connections in arrival order
    closed: Vec<ClosedConn>,
    /// Batches received per CPU
    flushes_by_cpu: BTreeMap<u32, u64>,
    /// Last observed port binding states
    ports: BTreeMap<PortKey, PortState>,
    /// CLOSED bindings deleted after being recorded
    ports_released: u64,
}

impl MetricsCollector {
    /// Create a new metrics collector
    pub fn new() -> Self {
        Self::default()
    }

    /// Add every record of a delivered batch
    pub fn add_batch(&mut self, batch: &CloseBatch) {
        *self.flushes_by_cpu.entry(batch.cpu).or_insert(0) += 1;
        self.closed.extend_from_slice(batch.as_slice());
    }

    /// Read both port binding tables
    ///
    /// CLOSED entries are deleted from the tracker once their state has been
    /// recorded; deleting them is the consumer's job.
    ///
    /// # Returns
    ///
    /// Number of bindings deleted
    pub fn poll_ports(&mut self, tracer: &Tracer) -> usize {
        let mut released = 0;

        for protocol in [Protocol::Tcp, Protocol::Udp] {
            for (key, state) in tracer.ports().entries(protocol) {
                self.ports.insert(port_key(protocol, &key), state);

                if state == PortState::Closed && tracer.ports().remove(protocol, &key) {
                    debug!(
                        "released {} port {} in netns {}",
                        protocol.as_str(),
                        key.port,
                        key.netns
                    );
                    released += 1;
                }
            }
        }

        self.ports_released += released as u64;
        released
    }

    /// Generate the report
    ///
    /// Records from different CPUs arrive in no particular order; the report
    /// orders them by closing timestamp, CPU breaking ties.
    pub fn generate_metrics(&self, tracer: &Tracer, elapsed_secs: u64) -> TrackerMetrics {
        let mut closed = self.closed.clone();
        closed.sort_by_key(|conn| (conn.closed_ns, conn.cpu));

        let mut totals = TrafficTotals::default();
        for conn in &closed {
            totals.add(conn);
        }

        let port_bindings = self
            .ports
            .iter()
            .map(|(key, state)| PortBindingMetrics {
                protocol: key.protocol.to_string(),
                netns: key.netns,
                port: key.port,
                state: port_state_name(*state).to_string(),
            })
            .collect();

        let snapshot = tracer.telemetry_snapshot();
        let telemetry = TelemetryCounter::ALL
            .iter()
            .map(|counter| (counter.name().to_string(), snapshot.get(*counter)))
            .collect();

        TrackerMetrics {
            timestamp: chrono::Utc::now().to_rfc3339(),
            duration_seconds: elapsed_secs,
            closed_connections: closed.iter().map(ClosedConnectionMetrics::from).collect(),
            active_connections: tracer.connections().conn_len(),
            flushes_by_cpu: self.flushes_by_cpu.clone(),
            port_bindings,
            ports_released: self.ports_released,
            telemetry,
            totals,
        }
    }

    /// Get number of closed connections received
    pub fn closed_count(&self) -> usize {
        self.closed.len()
    }

    /// Get number of batches received
    pub fn batch_count(&self) -> u64 {
        self.flushes_by_cpu.values().sum()
    }

    /// Get number of port bindings seen
    pub fn port_count(&self) -> usize {
        self.ports.len()
    }
}

fn port_key(protocol: Protocol, key: &PortBindingKey) -> PortKey {
    PortKey {
        protocol: protocol.as_str(),
        netns: key.netns,
        port: key.port,
    }
}
