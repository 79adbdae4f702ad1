//! Userspace type definitions
//!
//! Defines the data structures used by the daemon for reporting and export.
//!
//! ## Organization
//!
//! - **Table Types**: layouts shared with the tracking core (from conntrack_common)
//! - **Report Types**: types used only in userspace for aggregation and export

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::{Ipv4Addr, Ipv6Addr};

// ============================================================================
// Table Types
// ============================================================================

pub mod tables {
    //! Table layouts shared with the tracking core
    //!
    //! These are re-exported from the conntrack-common crate.

    pub use conntrack_common::constants;
    pub use conntrack_common::types::{
        CloseBatch, ClosedConn, ConnStats, ConnTuple, PortBindingKey, PortState, Protocol,
        TcpStats, TelemetryCounter,
    };
}

pub use tables::{ClosedConn, ConnTuple, PortState, Protocol};

use conntrack_common::{CONN_DIRECTION_INCOMING, CONN_DIRECTION_OUTGOING};

// ============================================================================
// Report Types
// ============================================================================

/// Aggregated report for export
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct TrackerMetrics {
    /// ISO 8601 timestamp when the report was generated
    pub timestamp: String,
    /// Duration of the collection period in seconds
    pub duration_seconds: u64,
    /// Closed connections, ordered by closing time
    pub closed_connections: Vec<ClosedConnectionMetrics>,
    /// Rows still present in the per-process table
    pub active_connections: usize,
    /// Batches received per CPU
    pub flushes_by_cpu: BTreeMap<u32, u64>,
    /// Last observed state of every port binding
    pub port_bindings: Vec<PortBindingMetrics>,
    /// CLOSED bindings deleted by the consumer
    pub ports_released: u64,
    /// Telemetry counters by name
    pub telemetry: BTreeMap<String, u64>,
    /// Traffic summed over closed connections
    pub totals: TrafficTotals,
}

/// Final statistics of one closed connection
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ClosedConnectionMetrics {
    /// Source address:port
    pub source: String,
    /// Destination address:port
    pub destination: String,
    pub protocol: String,
    pub pid: u32,
    pub netns: u32,
    pub direction: String,
    pub sent_bytes: u64,
    pub recv_bytes: u64,
    pub sent_packets: u64,
    pub recv_packets: u64,
    pub retransmits: u32,
    /// Smoothed RTT in microseconds
    pub rtt_us: u32,
    pub rtt_var_us: u32,
    /// TCP states entered over the lifetime of the flow
    pub tcp_states: Vec<String>,
    pub closed_ns: u64,
    pub cpu: u32,
}

impl From<&ClosedConn> for ClosedConnectionMetrics {
    fn from(conn: &ClosedConn) -> Self {
        let (source, destination) = tuple_endpoints(&conn.tuple);

        Self {
            source,
            destination,
            protocol: conn.tuple.protocol().as_str().to_string(),
            pid: conn.tuple.pid,
            netns: conn.tuple.netns,
            direction: direction_name(conn.conn_stats.direction).to_string(),
            sent_bytes: conn.conn_stats.sent_bytes,
            recv_bytes: conn.conn_stats.recv_bytes,
            sent_packets: conn.conn_stats.sent_packets,
            recv_packets: conn.conn_stats.recv_packets,
            retransmits: conn.tcp_stats.retransmits,
            rtt_us: conn.tcp_stats.rtt,
            rtt_var_us: conn.tcp_stats.rtt_var,
            tcp_states: tcp_state_names(conn.tcp_stats.state_transitions)
                .into_iter()
                .map(str::to_string)
                .collect(),
            closed_ns: conn.closed_ns,
            cpu: conn.cpu,
        }
    }
}

/// One row of a port binding table
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct PortBindingMetrics {
    pub protocol: String,
    pub netns: u32,
    pub port: u16,
    pub state: String,
}

/// Traffic summed over closed connections
#[derive(Serialize, Deserialize, Debug, Default, Clone, PartialEq, Eq)]
pub struct TrafficTotals {
    pub sent_bytes: u64,
    pub recv_bytes: u64,
    pub sent_packets: u64,
    pub recv_packets: u64,
    pub retransmits: u64,
}

impl TrafficTotals {
    pub fn add(&mut self, conn: &ClosedConn) {
        self.sent_bytes += conn.conn_stats.sent_bytes;
        self.recv_bytes += conn.conn_stats.recv_bytes;
        self.sent_packets += conn.conn_stats.sent_packets;
        self.recv_packets += conn.conn_stats.recv_packets;
        self.retransmits += conn.tcp_stats.retransmits as u64;
    }
}

/// Convert a ConnTuple to its two endpoints
///
/// # Returns
///
/// ("saddr:sport", "daddr:dport"), IPv6 addresses in brackets
pub fn tuple_endpoints(tuple: &ConnTuple) -> (String, String) {
    if tuple.is_ipv6() {
        let saddr = Ipv6Addr::from(((tuple.saddr_h as u128) << 64) | tuple.saddr_l as u128);
        let daddr = Ipv6Addr::from(((tuple.daddr_h as u128) << 64) | tuple.daddr_l as u128);
        (
            format!("[{}]:{}", saddr, tuple.sport),
            format!("[{}]:{}", daddr, tuple.dport),
        )
    } else {
        let saddr = Ipv4Addr::from(tuple.saddr_l as u32);
        let daddr = Ipv4Addr::from(tuple.daddr_l as u32);
        (
            format!("{}:{}", saddr, tuple.sport),
            format!("{}:{}", daddr, tuple.dport),
        )
    }
}

/// String in format "proto saddr:sport -> daddr:dport"
pub fn tuple_to_string(tuple: &ConnTuple) -> String {
    let (source, destination) = tuple_endpoints(tuple);
    format!("{} {} -> {}", tuple.protocol().as_str(), source, destination)
}

pub fn direction_name(direction: u8) -> &'static str {
    match direction {
        CONN_DIRECTION_INCOMING => "incoming",
        CONN_DIRECTION_OUTGOING => "outgoing",
        _ => "unknown",
    }
}

pub fn port_state_name(state: PortState) -> &'static str {
    match state {
        PortState::Listening => "listening",
        PortState::Closed => "closed",
    }
}

const TCP_STATE_NAMES: [&str; 12] = [
    "unknown",
    "established",
    "syn_sent",
    "syn_recv",
    "fin_wait1",
    "fin_wait2",
    "time_wait",
    "close",
    "close_wait",
    "last_ack",
    "listen",
    "closing",
];

/// Names of the states set in a transition bitmask, lowest state first
pub fn tcp_state_names(transitions: u16) -> Vec<&'static str> {
    TCP_STATE_NAMES
        .iter()
        .enumerate()
        .skip(1)
        .filter(|(state, _)| transitions & (1 << state) != 0)
        .map(|(_, name)| *name)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use conntrack_common::{TCP_CLOSE, TCP_ESTABLISHED, TCP_SYN_SENT};

    #[test]
    fn test_ipv4_endpoints() {
        let tuple = ConnTuple::ipv4(0x0a00_0001, 5353, 0x0a00_0002, 53, 1, Protocol::Udp);
        assert_eq!(tuple_to_string(&tuple), "udp 10.0.0.1:5353 -> 10.0.0.2:53");
    }

    #[test]
    fn test_ipv6_endpoints() {
        let tuple = ConnTuple::ipv6((0, 1), 40000, (0x2001_0db8_0000_0000, 2), 443, 1, Protocol::Tcp);
        let (source, destination) = tuple_endpoints(&tuple);
        assert_eq!(source, "[::1]:40000");
        assert_eq!(destination, "[2001:db8::2]:443");
    }

    #[test]
    fn test_state_names() {
        let mask = (1 << TCP_SYN_SENT) | (1 << TCP_ESTABLISHED) | (1 << TCP_CLOSE);
        assert_eq!(tcp_state_names(mask), vec!["established", "syn_sent", "close"]);
        assert!(tcp_state_names(0).is_empty());
    }
}
