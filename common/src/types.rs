//! Shared data structures between the tracking core and its consumer
//!
//! These structures must be repr(C) so that the key/value layouts of every
//! table match what a consumer reading the raw maps expects.

use crate::constants::*;

/// Transport protocol of a tracked flow
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Protocol {
    Tcp,
    Udp,
}

impl Protocol {
    /// IP protocol number (IPPROTO_*)
    pub const fn ip_proto(self) -> u8 {
        match self {
            Protocol::Tcp => IPPROTO_TCP,
            Protocol::Udp => IPPROTO_UDP,
        }
    }

    /// Short lowercase name, used in table names and reports
    pub const fn as_str(self) -> &'static str {
        match self {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
        }
    }
}

/// Connection identity
///
/// Addresses are 128 bits wide, split into high and low halves. IPv4
/// addresses live in the low 32 bits of `saddr_l` / `daddr_l` with both high
/// halves zero. Ports are in host byte order.
///
/// The per-process statistics table keys on the full tuple; the
/// protocol-level table keys on [`ConnTuple::without_pid`].
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct ConnTuple {
    /// Source address, upper 64 bits
    pub saddr_h: u64,
    /// Source address, lower 64 bits
    pub saddr_l: u64,
    /// Destination address, upper 64 bits
    pub daddr_h: u64,
    /// Destination address, lower 64 bits
    pub daddr_l: u64,
    /// Source port
    pub sport: u16,
    /// Destination port
    pub dport: u16,
    /// Network namespace inode
    pub netns: u32,
    /// Owning process id (0 in protocol-level keys)
    pub pid: u32,
    /// Protocol and family bits (see CONN_TYPE_* and CONN_V*)
    pub metadata: u32,
}

impl ConnTuple {
    /// Build an IPv4 tuple
    pub const fn ipv4(
        saddr: u32,
        sport: u16,
        daddr: u32,
        dport: u16,
        netns: u32,
        protocol: Protocol,
    ) -> Self {
        Self {
            saddr_h: 0,
            saddr_l: saddr as u64,
            daddr_h: 0,
            daddr_l: daddr as u64,
            sport,
            dport,
            netns,
            pid: 0,
            metadata: conn_type(protocol) | CONN_V4,
        }
    }

    /// Build an IPv6 tuple from the big-endian halves of both addresses
    pub const fn ipv6(
        saddr: (u64, u64),
        sport: u16,
        daddr: (u64, u64),
        dport: u16,
        netns: u32,
        protocol: Protocol,
    ) -> Self {
        Self {
            saddr_h: saddr.0,
            saddr_l: saddr.1,
            daddr_h: daddr.0,
            daddr_l: daddr.1,
            sport,
            dport,
            netns,
            pid: 0,
            metadata: conn_type(protocol) | CONN_V6,
        }
    }

    pub const fn protocol(&self) -> Protocol {
        if self.metadata & CONN_TYPE_MASK == CONN_TYPE_TCP {
            Protocol::Tcp
        } else {
            Protocol::Udp
        }
    }

    pub const fn is_ipv6(&self) -> bool {
        self.metadata & CONN_FAMILY_MASK == CONN_V6
    }

    /// Same tuple owned by `pid`
    pub const fn with_pid(mut self, pid: u32) -> Self {
        self.pid = pid;
        self
    }

    /// Projection used by the protocol-level statistics table
    pub const fn without_pid(&self) -> Self {
        self.with_pid(0)
    }
}

const fn conn_type(protocol: Protocol) -> u32 {
    match protocol {
        Protocol::Tcp => CONN_TYPE_TCP,
        Protocol::Udp => CONN_TYPE_UDP,
    }
}

/// Per-process connection statistics
///
/// Every counter only grows while the entry lives. `timestamp` is the latest
/// update time seen, `direction` is set once.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ConnStats {
    /// Bytes sent
    pub sent_bytes: u64,
    /// Bytes received
    pub recv_bytes: u64,
    /// Packets sent
    pub sent_packets: u64,
    /// Packets received
    pub recv_packets: u64,
    /// Last update (nanoseconds, monotonic clock)
    pub timestamp: u64,
    /// See CONN_DIRECTION_* constants
    pub direction: u8,
    /// Padding for alignment
    pub _padding: [u8; 7],
}

impl ConnStats {
    pub const ZERO: Self = Self {
        sent_bytes: 0,
        recv_bytes: 0,
        sent_packets: 0,
        recv_packets: 0,
        timestamp: 0,
        direction: CONN_DIRECTION_UNKNOWN,
        _padding: [0; 7],
    };

    /// Delta for a send of `bytes` in `packets` packets at `now`
    pub const fn sent(bytes: u64, packets: u64, now: u64) -> Self {
        let mut s = Self::ZERO;
        s.sent_bytes = bytes;
        s.sent_packets = packets;
        s.timestamp = now;
        s
    }

    /// Delta for a receive of `bytes` in `packets` packets at `now`
    pub const fn received(bytes: u64, packets: u64, now: u64) -> Self {
        let mut s = Self::ZERO;
        s.recv_bytes = bytes;
        s.recv_packets = packets;
        s.timestamp = now;
        s
    }

    /// Field-wise sum, the value a table entry converges to
    pub fn merged(&self, other: &Self) -> Self {
        Self {
            sent_bytes: self.sent_bytes + other.sent_bytes,
            recv_bytes: self.recv_bytes + other.recv_bytes,
            sent_packets: self.sent_packets + other.sent_packets,
            recv_packets: self.recv_packets + other.recv_packets,
            timestamp: self.timestamp.max(other.timestamp),
            direction: if self.direction != CONN_DIRECTION_UNKNOWN {
                self.direction
            } else {
                other.direction
            },
            _padding: [0; 7],
        }
    }
}

/// Protocol-level TCP statistics, shared by every process using the flow
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TcpStats {
    /// Retransmitted segments
    pub retransmits: u32,
    /// Smoothed round trip time (microseconds), last sample
    pub rtt: u32,
    /// Round trip time variance (microseconds), last sample
    pub rtt_var: u32,
    /// Bit `1 << state` set for every TCP state entered
    pub state_transitions: u16,
    /// Padding for alignment
    pub _padding: u16,
}

impl TcpStats {
    pub const ZERO: Self = Self {
        retransmits: 0,
        rtt: 0,
        rtt_var: 0,
        state_transitions: 0,
        _padding: 0,
    };

    pub const fn retransmitted(segments: u32) -> Self {
        let mut s = Self::ZERO;
        s.retransmits = segments;
        s
    }

    pub const fn rtt_sample(rtt: u32, rtt_var: u32) -> Self {
        let mut s = Self::ZERO;
        s.rtt = rtt;
        s.rtt_var = rtt_var;
        s
    }

    pub const fn state_entered(state: u8) -> Self {
        let mut s = Self::ZERO;
        if state < 16 {
            s.state_transitions = 1 << state;
        }
        s
    }
}

/// Final record of a closed connection
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ClosedConn {
    /// Identity, including the closing process
    pub tuple: ConnTuple,
    /// Per-process statistics at close
    pub conn_stats: ConnStats,
    /// Protocol-level statistics at close
    pub tcp_stats: TcpStats,
    /// Close timestamp (nanoseconds, monotonic clock)
    pub closed_ns: u64,
    /// CPU that observed the close
    pub cpu: u32,
    /// Padding for alignment
    pub _padding: [u8; 4],
}

impl ClosedConn {
    pub const ZERO: Self = Self {
        tuple: ConnTuple {
            saddr_h: 0,
            saddr_l: 0,
            daddr_h: 0,
            daddr_l: 0,
            sport: 0,
            dport: 0,
            netns: 0,
            pid: 0,
            metadata: 0,
        },
        conn_stats: ConnStats::ZERO,
        tcp_stats: TcpStats::ZERO,
        closed_ns: 0,
        cpu: 0,
        _padding: [0; 4],
    };
}

/// Closed connections accumulated on one CPU
///
/// Fixed storage of `CLOSE_BATCH_MAX` records; records keep append order.
#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct CloseBatch {
    /// Record storage, only the first `len` entries are meaningful
    pub conns: [ClosedConn; CLOSE_BATCH_MAX],
    /// Number of valid records
    pub len: u32,
    /// CPU owning this batch
    pub cpu: u32,
}

impl CloseBatch {
    pub const fn new(cpu: u32) -> Self {
        Self {
            conns: [ClosedConn::ZERO; CLOSE_BATCH_MAX],
            len: 0,
            cpu,
        }
    }

    /// Append a record, returns false when all slots are in use
    pub fn push(&mut self, conn: ClosedConn) -> bool {
        let idx = self.len as usize;
        if idx >= CLOSE_BATCH_MAX {
            return false;
        }
        self.conns[idx] = conn;
        self.len += 1;
        true
    }

    pub fn as_slice(&self) -> &[ClosedConn] {
        let len = (self.len as usize).min(CLOSE_BATCH_MAX);
        &self.conns[..len]
    }

    pub fn len(&self) -> usize {
        self.len as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn clear(&mut self) {
        self.len = 0;
    }
}

/// Key of the port binding tables (one table per protocol)
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PortBindingKey {
    /// Network namespace inode
    pub netns: u32,
    /// Local port, host byte order
    pub port: u16,
    /// Padding for alignment
    pub _padding: u16,
}

impl PortBindingKey {
    pub const fn new(netns: u32, port: u16) -> Self {
        Self {
            netns,
            port,
            _padding: 0,
        }
    }
}

/// Value of the port binding tables
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PortState {
    Closed = PORT_CLOSED,
    Listening = PORT_LISTENING,
}

impl PortState {
    pub const fn from_u8(raw: u8) -> Option<Self> {
        match raw {
            PORT_CLOSED => Some(PortState::Closed),
            PORT_LISTENING => Some(PortState::Listening),
            _ => None,
        }
    }
}

/// Arguments of an in-flight bind() captured at syscall entry
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BindSyscallArgs {
    /// Socket file descriptor
    pub fd: i32,
    /// Requested port, host byte order
    pub port: u16,
    /// Address family of the sockaddr
    pub family: u16,
}

/// Telemetry counter ids
///
/// The discriminant is the counter's key in the telemetry table.
#[repr(u16)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TelemetryCounter {
    /// Per-process statistics update dropped (table full or busy)
    ConnStatsDropped = 0,
    /// Protocol-level statistics update dropped
    TcpStatsDropped = 1,
    /// A close record could not be appended to its CPU batch
    MissedTcpClose = 2,
    /// tcp_sendmsg on a socket whose tuple could not be read
    TcpSentMiscounts = 3,
    /// udp_sendmsg accounted
    UdpSendProcessed = 4,
    /// udp_sendmsg on a socket whose tuple could not be read
    UdpSendMissed = 5,
    /// socket() entry not recorded or not paired, pending table full or busy
    PendingSocketDropped = 6,
    /// bind() entry not recorded or not paired, pending table full or busy
    PendingBindDropped = 7,
    /// Unbound-socket marker evicted, or not stored or cleared under pressure
    UnboundSocketEvicted = 8,
    /// Port binding not recorded or not closed, binding table full or busy
    PortBindingDropped = 9,
    /// Batch flush dropped, notification channel full
    CloseBatchLost = 10,
    /// Closed connections carried by dropped batches
    ClosedConnsLost = 11,
    /// udp_recvmsg entry not recorded or not paired, pending table full or busy
    PendingUdpRecvDropped = 12,
}

impl TelemetryCounter {
    /// Number of defined counters
    pub const COUNT: usize = 13;

    pub const ALL: [TelemetryCounter; Self::COUNT] = [
        TelemetryCounter::ConnStatsDropped,
        TelemetryCounter::TcpStatsDropped,
        TelemetryCounter::MissedTcpClose,
        TelemetryCounter::TcpSentMiscounts,
        TelemetryCounter::UdpSendProcessed,
        TelemetryCounter::UdpSendMissed,
        TelemetryCounter::PendingSocketDropped,
        TelemetryCounter::PendingBindDropped,
        TelemetryCounter::UnboundSocketEvicted,
        TelemetryCounter::PortBindingDropped,
        TelemetryCounter::CloseBatchLost,
        TelemetryCounter::ClosedConnsLost,
        TelemetryCounter::PendingUdpRecvDropped,
    ];

    pub const fn id(self) -> u16 {
        self as u16
    }

    pub const fn name(self) -> &'static str {
        match self {
            TelemetryCounter::ConnStatsDropped => "conn_stats_dropped",
            TelemetryCounter::TcpStatsDropped => "tcp_stats_dropped",
            TelemetryCounter::MissedTcpClose => "missed_tcp_close",
            TelemetryCounter::TcpSentMiscounts => "tcp_sent_miscounts",
            TelemetryCounter::UdpSendProcessed => "udp_send_processed",
            TelemetryCounter::UdpSendMissed => "udp_send_missed",
            TelemetryCounter::PendingSocketDropped => "pending_socket_dropped",
            TelemetryCounter::PendingBindDropped => "pending_bind_dropped",
            TelemetryCounter::UnboundSocketEvicted => "unbound_socket_evicted",
            TelemetryCounter::PortBindingDropped => "port_binding_dropped",
            TelemetryCounter::CloseBatchLost => "close_batch_lost",
            TelemetryCounter::ClosedConnsLost => "closed_conns_lost",
            TelemetryCounter::PendingUdpRecvDropped => "pending_udp_recv_dropped",
        }
    }
}

// Compile-time layout checks
const _: () = {
    assert!(core::mem::size_of::<ConnTuple>() == 48);
    assert!(core::mem::size_of::<ConnStats>() == 48);
    assert!(core::mem::size_of::<TcpStats>() == 16);
    assert!(core::mem::size_of::<ClosedConn>() == 128);
    assert!(core::mem::size_of::<PortBindingKey>() == 8);
    assert!(core::mem::size_of::<BindSyscallArgs>() == 8);
    assert!(core::mem::size_of::<ConnTuple>() % core::mem::align_of::<ConnTuple>() == 0);
    assert!(core::mem::size_of::<CloseBatch>() % core::mem::align_of::<CloseBatch>() == 0);
    assert!(TelemetryCounter::ALL.len() == TelemetryCounter::COUNT);
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tuple_projection() {
        let tuple = ConnTuple::ipv4(0x0a00_0001, 40000, 0x0a00_0002, 443, 7, Protocol::Tcp)
            .with_pid(1234);

        assert_eq!(tuple.protocol(), Protocol::Tcp);
        assert!(!tuple.is_ipv6());
        assert_eq!(tuple.without_pid().pid, 0);
        assert_eq!(tuple.without_pid().with_pid(1234), tuple);
    }

    #[test]
    fn test_batch_push_until_full() {
        let mut batch = CloseBatch::new(3);
        for i in 0..CLOSE_BATCH_MAX {
            let mut conn = ClosedConn::ZERO;
            conn.closed_ns = i as u64;
            assert!(batch.push(conn));
        }
        assert!(!batch.push(ClosedConn::ZERO));
        assert_eq!(batch.len(), CLOSE_BATCH_MAX);
        assert_eq!(batch.as_slice()[5].closed_ns, 5);

        batch.clear();
        assert!(batch.is_empty());
        assert_eq!(batch.cpu, 3);
    }

    #[test]
    fn test_stats_merge() {
        let a = ConnStats::sent(100, 1, 10);
        let mut b = ConnStats::received(50, 2, 5);
        b.direction = CONN_DIRECTION_OUTGOING;

        let merged = a.merged(&b);
        assert_eq!(merged.sent_bytes, 100);
        assert_eq!(merged.recv_bytes, 50);
        assert_eq!(merged.recv_packets, 2);
        assert_eq!(merged.timestamp, 10);
        assert_eq!(merged.direction, CONN_DIRECTION_OUTGOING);
    }

    #[test]
    fn test_state_bits() {
        assert_eq!(TcpStats::state_entered(TCP_ESTABLISHED).state_transitions, 1 << 1);
        assert_eq!(TcpStats::state_entered(200).state_transitions, 0);
        assert_eq!(PortState::from_u8(1), Some(PortState::Listening));
        assert_eq!(PortState::from_u8(9), None);
    }
}
