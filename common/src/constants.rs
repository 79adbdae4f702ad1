//! Shared constants for the connection tracer
//!
//! These constants are used by both the tracking core and the consumer
//! to agree on table sizes, flag values and wire encodings.

// ============================================================================
// Table Sizes
// ============================================================================

/// Default bound on tracked connections
///
/// Propagated to every capacity-dependent table: both statistics tables and
/// both port-binding tables.
pub const DEFAULT_MAX_TRACKED_CONNECTIONS: u32 = 65_536;

/// Capacity of each pending-call correlation table
pub const PENDING_CALLS_MAX: u32 = 8192;

/// Capacity of the unbound-socket marker table
pub const UNBOUND_SOCKETS_MAX: u32 = 1024;

/// Capacity of the table pairing udp_recvmsg entry and return
pub const PENDING_UDP_RECV_MAX: u32 = 1024;

/// Default number of closed connections per batch before an eager flush
pub const DEFAULT_CLOSE_BATCH_SIZE: usize = 4;

/// Upper bound on the configurable batch size
///
/// Every `CloseBatch` reserves this many slots, the configured batch size only
/// decides when it is flushed.
pub const CLOSE_BATCH_MAX: usize = 32;

/// Default number of undelivered batches buffered per CPU
pub const DEFAULT_CLOSE_CHANNEL_DEPTH: usize = 64;

// ============================================================================
// Tuple Metadata (for ConnTuple.metadata)
// ============================================================================

/// Connection is UDP
pub const CONN_TYPE_UDP: u32 = 0;

/// Connection is TCP
pub const CONN_TYPE_TCP: u32 = 1;

/// Connection is IPv4
pub const CONN_V4: u32 = 0 << 1;

/// Connection is IPv6
pub const CONN_V6: u32 = 1 << 1;

/// Mask selecting the connection type bit
pub const CONN_TYPE_MASK: u32 = 0x1;

/// Mask selecting the address family bit
pub const CONN_FAMILY_MASK: u32 = 0x2;

// ============================================================================
// Connection Direction (for ConnStats.direction)
// ============================================================================

/// Direction not yet known
pub const CONN_DIRECTION_UNKNOWN: u8 = 0;

/// Connection was accepted on a local listener
pub const CONN_DIRECTION_INCOMING: u8 = 1;

/// Connection was initiated locally
pub const CONN_DIRECTION_OUTGOING: u8 = 2;

// ============================================================================
// Port Binding States (value of the port binding tables)
// ============================================================================

/// The owning socket has been destroyed
pub const PORT_CLOSED: u8 = 0;

/// A socket is bound or listening on the port
pub const PORT_LISTENING: u8 = 1;

// ============================================================================
// Socket Constants (from linux/socket.h, linux/net.h)
// ============================================================================

/// Local (unix domain) address family
pub const AF_UNIX: u16 = 1;

/// IPv4 address family
pub const AF_INET: u16 = 2;

/// IPv6 address family
pub const AF_INET6: u16 = 10;

/// Stream socket type
pub const SOCK_STREAM: u32 = 1;

/// Datagram socket type
pub const SOCK_DGRAM: u32 = 2;

/// Mask separating the socket type from SOCK_NONBLOCK / SOCK_CLOEXEC
pub const SOCK_TYPE_MASK: u32 = 0xf;

// ============================================================================
// Protocol Numbers (from linux/in.h)
// ============================================================================

/// TCP protocol number
pub const IPPROTO_TCP: u8 = 6;

/// UDP protocol number
pub const IPPROTO_UDP: u8 = 17;

// ============================================================================
// TCP States (from include/net/tcp_states.h)
// ============================================================================

pub const TCP_ESTABLISHED: u8 = 1;
pub const TCP_SYN_SENT: u8 = 2;
pub const TCP_SYN_RECV: u8 = 3;
pub const TCP_FIN_WAIT1: u8 = 4;
pub const TCP_FIN_WAIT2: u8 = 5;
pub const TCP_TIME_WAIT: u8 = 6;
pub const TCP_CLOSE: u8 = 7;
pub const TCP_CLOSE_WAIT: u8 = 8;
pub const TCP_LAST_ACK: u8 = 9;
pub const TCP_LISTEN: u8 = 10;
pub const TCP_CLOSING: u8 = 11;
