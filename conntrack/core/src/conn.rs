//! Connection statistics tables
//!
//! Two tables are kept side by side:
//! - `conn_stats`, keyed by the full tuple including the process id, so that
//!   processes sharing a flow (dup'd or inherited descriptors) get their own
//!   rows;
//! - `tcp_stats`, keyed by the tuple with the process id zeroed, for values
//!   that only make sense once per flow (retransmits, RTT, state changes).
//!
//! Both use the reject policy. Updates accumulate field by field with atomic
//! adds; there is no ordering between fields, only the final sums are exact.

use std::sync::atomic::{AtomicU16, AtomicU32, AtomicU64, AtomicU8, Ordering};

use conntrack_common::{
    ClosedConn, ConnStats, ConnTuple, TcpStats, TelemetryCounter, CONN_DIRECTION_UNKNOWN,
};
use log::trace;

use crate::{
    error::{ConfigError, MapError},
    map::{CapacityPolicy, FixedMap, MapValue, UpdateFlag},
    telemetry::Telemetry,
};

#[derive(Default)]
pub struct AtomicConnStats {
    sent_bytes: AtomicU64,
    recv_bytes: AtomicU64,
    sent_packets: AtomicU64,
    recv_packets: AtomicU64,
    timestamp: AtomicU64,
    direction: AtomicU8,
}

impl AtomicConnStats {
    /// Add `delta` into this entry
    pub fn accumulate(&self, delta: &ConnStats) {
        if delta.sent_bytes != 0 {
            self.sent_bytes.fetch_add(delta.sent_bytes, Ordering::Relaxed);
        }
        if delta.recv_bytes != 0 {
            self.recv_bytes.fetch_add(delta.recv_bytes, Ordering::Relaxed);
        }
        if delta.sent_packets != 0 {
            self.sent_packets
                .fetch_add(delta.sent_packets, Ordering::Relaxed);
        }
        if delta.recv_packets != 0 {
            self.recv_packets
                .fetch_add(delta.recv_packets, Ordering::Relaxed);
        }
        self.timestamp.fetch_max(delta.timestamp, Ordering::Relaxed);
        if delta.direction != CONN_DIRECTION_UNKNOWN {
            let _ = self.direction.compare_exchange(
                CONN_DIRECTION_UNKNOWN,
                delta.direction,
                Ordering::Relaxed,
                Ordering::Relaxed,
            );
        }
    }
}

impl MapValue for AtomicConnStats {
    type Plain = ConnStats;

    fn read(&self) -> ConnStats {
        ConnStats {
            sent_bytes: self.sent_bytes.load(Ordering::Relaxed),
            recv_bytes: self.recv_bytes.load(Ordering::Relaxed),
            sent_packets: self.sent_packets.load(Ordering::Relaxed),
            recv_packets: self.recv_packets.load(Ordering::Relaxed),
            timestamp: self.timestamp.load(Ordering::Relaxed),
            direction: self.direction.load(Ordering::Relaxed),
            _padding: [0; 7],
        }
    }

    fn write(&self, value: &ConnStats) {
        self.sent_bytes.store(value.sent_bytes, Ordering::Relaxed);
        self.recv_bytes.store(value.recv_bytes, Ordering::Relaxed);
        self.sent_packets.store(value.sent_packets, Ordering::Relaxed);
        self.recv_packets.store(value.recv_packets, Ordering::Relaxed);
        self.timestamp.store(value.timestamp, Ordering::Relaxed);
        self.direction.store(value.direction, Ordering::Relaxed);
    }
}

#[derive(Default)]
pub struct AtomicTcpStats {
    retransmits: AtomicU32,
    rtt: AtomicU32,
    rtt_var: AtomicU32,
    state_transitions: AtomicU16,
}

impl AtomicTcpStats {
    /// Retransmits add up, RTT samples overwrite, state bits are OR'ed in
    pub fn accumulate(&self, delta: &TcpStats) {
        if delta.retransmits != 0 {
            self.retransmits
                .fetch_add(delta.retransmits, Ordering::Relaxed);
        }
        if delta.rtt != 0 {
            self.rtt.store(delta.rtt, Ordering::Relaxed);
            self.rtt_var.store(delta.rtt_var, Ordering::Relaxed);
        }
        if delta.state_transitions != 0 {
            self.state_transitions
                .fetch_or(delta.state_transitions, Ordering::Relaxed);
        }
    }
}

impl MapValue for AtomicTcpStats {
    type Plain = TcpStats;

    fn read(&self) -> TcpStats {
        TcpStats {
            retransmits: self.retransmits.load(Ordering::Relaxed),
            rtt: self.rtt.load(Ordering::Relaxed),
            rtt_var: self.rtt_var.load(Ordering::Relaxed),
            state_transitions: self.state_transitions.load(Ordering::Relaxed),
            _padding: 0,
        }
    }

    fn write(&self, value: &TcpStats) {
        self.retransmits.store(value.retransmits, Ordering::Relaxed);
        self.rtt.store(value.rtt, Ordering::Relaxed);
        self.rtt_var.store(value.rtt_var, Ordering::Relaxed);
        self.state_transitions
            .store(value.state_transitions, Ordering::Relaxed);
    }
}

/// Per-process and protocol-level statistics tables
pub struct ConnectionTable {
    conn_stats: FixedMap<ConnTuple, AtomicConnStats>,
    tcp_stats: FixedMap<ConnTuple, AtomicTcpStats>,
}

impl ConnectionTable {
    pub fn new(max_tracked_connections: u32) -> Result<Self, ConfigError> {
        Ok(Self {
            conn_stats: FixedMap::new("conn_stats", max_tracked_connections, CapacityPolicy::Reject)?,
            tcp_stats: FixedMap::new("tcp_stats", max_tracked_connections, CapacityPolicy::Reject)?,
        })
    }

    /// Add `delta` to the per-process row of `tuple`, creating it if needed
    ///
    /// Returns false when the update was dropped (counted as
    /// `ConnStatsDropped`).
    pub fn record(&self, tuple: &ConnTuple, delta: &ConnStats, telemetry: &Telemetry) -> bool {
        let applied = match self.conn_stats.insert(tuple, delta, UpdateFlag::NoExist) {
            Ok(_) => true,
            Err(MapError::Exists) => match self.conn_stats.get(tuple) {
                Some(stats) => {
                    stats.accumulate(delta);
                    true
                }
                // Removed between the insert and the lookup
                None => false,
            },
            Err(_) => false,
        };

        if !applied {
            trace!("conn_stats: update dropped for pid {}", tuple.pid);
            telemetry.incr(TelemetryCounter::ConnStatsDropped);
        }
        applied
    }

    /// Add `delta` to the protocol-level row of `tuple`
    ///
    /// The process id of `tuple` is ignored.
    pub fn record_tcp(&self, tuple: &ConnTuple, delta: &TcpStats, telemetry: &Telemetry) -> bool {
        let key = tuple.without_pid();
        let applied = match self.tcp_stats.insert(&key, delta, UpdateFlag::NoExist) {
            Ok(_) => true,
            Err(MapError::Exists) => match self.tcp_stats.get(&key) {
                Some(stats) => {
                    stats.accumulate(delta);
                    true
                }
                None => false,
            },
            Err(_) => false,
        };

        if !applied {
            trace!("tcp_stats: update dropped");
            telemetry.incr(TelemetryCounter::TcpStatsDropped);
        }
        applied
    }

    /// Final per-process statistics of `tuple`, freeing its slot
    pub fn snapshot_and_remove(&self, tuple: &ConnTuple) -> Option<ConnStats> {
        self.conn_stats.take(tuple).ok()
    }

    /// Final protocol-level statistics of `tuple`, freeing its slot
    pub fn take_tcp(&self, tuple: &ConnTuple) -> Option<TcpStats> {
        self.tcp_stats.take(&tuple.without_pid()).ok()
    }

    /// Remove both rows of a closing connection and build its record
    ///
    /// The two removals are independent table operations: a concurrent
    /// reader can see the per-process row gone while the protocol row is
    /// still present. Returns `None` when neither table knew the flow.
    pub fn close(&self, tuple: &ConnTuple, cpu: u32, now_ns: u64) -> Option<ClosedConn> {
        let conn_stats = self.snapshot_and_remove(tuple);
        let tcp_stats = self.take_tcp(tuple);
        if conn_stats.is_none() && tcp_stats.is_none() {
            return None;
        }

        Some(ClosedConn {
            tuple: *tuple,
            conn_stats: conn_stats.unwrap_or(ConnStats::ZERO),
            tcp_stats: tcp_stats.unwrap_or(TcpStats::ZERO),
            closed_ns: now_ns,
            cpu,
            _padding: [0; 4],
        })
    }

    pub fn conn_stats(&self, tuple: &ConnTuple) -> Option<ConnStats> {
        self.conn_stats.lookup(tuple)
    }

    pub fn tcp_stats(&self, tuple: &ConnTuple) -> Option<TcpStats> {
        self.tcp_stats.lookup(&tuple.without_pid())
    }

    /// Consumer-side poll of the per-process table
    pub fn conn_entries(&self) -> Vec<(ConnTuple, ConnStats)> {
        self.conn_stats.entries()
    }

    /// Consumer-side poll-and-delete of the per-process table
    pub fn drain_conn_stats(&self) -> Vec<(ConnTuple, ConnStats)> {
        self.conn_stats.drain()
    }

    pub fn tcp_entries(&self) -> Vec<(ConnTuple, TcpStats)> {
        self.tcp_stats.entries()
    }

    pub fn drain_tcp_stats(&self) -> Vec<(ConnTuple, TcpStats)> {
        self.tcp_stats.drain()
    }

    pub fn conn_len(&self) -> usize {
        self.conn_stats.len()
    }

    pub fn tcp_len(&self) -> usize {
        self.tcp_stats.len()
    }

    pub fn capacity(&self) -> usize {
        self.conn_stats.capacity()
    }
}
