//! Hook points and their handlers
//!
//! Every trigger point maps to one plain function in [`HOOKS`]. A handler
//! receives the invocation context and the arguments visible at that point
//! and mutates tables; it never fails and never waits.
//!
//! ```text
//! sys_socket / sys_bind (entry, exit) -> CallCorrelator -> PortBindingRegistry (udp)
//! tcp_sendmsg, tcp_cleanup_rbuf,
//! udp_sendmsg                         -> ConnectionTable (conn_stats)
//! udp_recvmsg (entry, exit)           -> CallCorrelator -> ConnectionTable
//! tcp_retransmit_skb, tcp_set_state   -> ConnectionTable (tcp_stats)
//! tcp_close                           -> ConnectionTable -> CloseBatcher
//! inet_csk_accept, *_destroy_sock     -> PortBindingRegistry
//! ```

use conntrack_common::{
    BindSyscallArgs, ConnStats, ConnTuple, PortBindingKey, Protocol, TcpStats, TelemetryCounter,
    CONN_DIRECTION_INCOMING, CONN_DIRECTION_OUTGOING,
};

use crate::tracer::Tracer;

/// Where a hook is attached
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TriggerPoint {
    SysSocket,
    SysSocketRet,
    SysBind,
    SysBindRet,
    TcpConnect,
    TcpSendmsg,
    TcpCleanupRbuf,
    TcpRetransmitSkb,
    TcpSetState,
    TcpClose,
    UdpSendmsg,
    UdpRecvmsg,
    UdpRecvmsgRet,
    InetCskAcceptRet,
    TcpV4DestroySock,
    UdpDestroySock,
}

impl TriggerPoint {
    pub const ALL: [TriggerPoint; 16] = [
        TriggerPoint::SysSocket,
        TriggerPoint::SysSocketRet,
        TriggerPoint::SysBind,
        TriggerPoint::SysBindRet,
        TriggerPoint::TcpConnect,
        TriggerPoint::TcpSendmsg,
        TriggerPoint::TcpCleanupRbuf,
        TriggerPoint::TcpRetransmitSkb,
        TriggerPoint::TcpSetState,
        TriggerPoint::TcpClose,
        TriggerPoint::UdpSendmsg,
        TriggerPoint::UdpRecvmsg,
        TriggerPoint::UdpRecvmsgRet,
        TriggerPoint::InetCskAcceptRet,
        TriggerPoint::TcpV4DestroySock,
        TriggerPoint::UdpDestroySock,
    ];

    /// Probe section name
    pub const fn attach_name(self) -> &'static str {
        match self {
            TriggerPoint::SysSocket => "kprobe/sys_socket",
            TriggerPoint::SysSocketRet => "kretprobe/sys_socket",
            TriggerPoint::SysBind => "kprobe/sys_bind",
            TriggerPoint::SysBindRet => "kretprobe/sys_bind",
            TriggerPoint::TcpConnect => "kprobe/tcp_connect",
            TriggerPoint::TcpSendmsg => "kprobe/tcp_sendmsg",
            TriggerPoint::TcpCleanupRbuf => "kprobe/tcp_cleanup_rbuf",
            TriggerPoint::TcpRetransmitSkb => "kprobe/tcp_retransmit_skb",
            TriggerPoint::TcpSetState => "kprobe/tcp_set_state",
            TriggerPoint::TcpClose => "kprobe/tcp_close",
            TriggerPoint::UdpSendmsg => "kprobe/udp_sendmsg",
            TriggerPoint::UdpRecvmsg => "kprobe/udp_recvmsg",
            TriggerPoint::UdpRecvmsgRet => "kretprobe/udp_recvmsg",
            TriggerPoint::InetCskAcceptRet => "kretprobe/inet_csk_accept",
            TriggerPoint::TcpV4DestroySock => "kprobe/tcp_v4_destroy_sock",
            TriggerPoint::UdpDestroySock => "kprobe/udp_destroy_sock",
        }
    }
}

/// Invocation context: who is running, where, and when
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HookContext {
    /// Process id in the upper 32 bits, thread id in the lower 32
    pub pid_tgid: u64,
    /// CPU executing the hook
    pub cpu: u32,
    /// Network namespace inode of the current task
    pub netns: u32,
    /// Monotonic clock (nanoseconds)
    pub now_ns: u64,
}

impl HookContext {
    pub const fn new(pid: u32, tid: u32, cpu: u32, netns: u32, now_ns: u64) -> Self {
        Self {
            pid_tgid: ((pid as u64) << 32) | tid as u64,
            cpu,
            netns,
            now_ns,
        }
    }

    /// Process id
    pub const fn tgid(&self) -> u32 {
        (self.pid_tgid >> 32) as u32
    }

    /// Thread id
    pub const fn tid(&self) -> u32 {
        (self.pid_tgid & 0xFFFF_FFFF) as u32
    }
}

/// Family and port of a bind() sockaddr
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SockAddr {
    pub family: u16,
    pub port: u16,
}

/// Arguments visible at a trigger point
///
/// A `None` tuple is a socket whose addresses could not be read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookEvent {
    SocketEnter {
        family: u16,
        sock_type: u32,
    },
    SocketExit {
        ret: i64,
    },
    BindEnter {
        fd: i32,
        addr: Option<SockAddr>,
    },
    BindExit {
        ret: i64,
    },
    TcpConnect {
        tuple: Option<ConnTuple>,
    },
    TcpSendmsg {
        tuple: Option<ConnTuple>,
        sent: i64,
        packets: u32,
        /// Smoothed RTT of the socket, 0 when unknown
        rtt: u32,
        rtt_var: u32,
    },
    TcpCleanupRbuf {
        tuple: Option<ConnTuple>,
        copied: i64,
        packets: u32,
    },
    TcpRetransmitSkb {
        tuple: Option<ConnTuple>,
        segments: u32,
    },
    TcpSetState {
        tuple: Option<ConnTuple>,
        state: u8,
    },
    TcpClose {
        tuple: Option<ConnTuple>,
    },
    UdpSendmsg {
        tuple: Option<ConnTuple>,
        sent: i64,
    },
    /// Entry of udp_recvmsg: only here is the socket visible
    UdpRecvmsg {
        tuple: Option<ConnTuple>,
    },
    UdpRecvmsgRet {
        copied: i64,
    },
    /// Return of accept on a listening socket: the new connection
    InetCskAcceptRet {
        tuple: Option<ConnTuple>,
    },
    TcpV4DestroySock {
        netns: u32,
        local_port: u16,
    },
    UdpDestroySock {
        netns: u32,
        local_port: u16,
    },
}

impl HookEvent {
    pub const fn trigger(&self) -> TriggerPoint {
        match self {
            HookEvent::SocketEnter { .. } => TriggerPoint::SysSocket,
            HookEvent::SocketExit { .. } => TriggerPoint::SysSocketRet,
            HookEvent::BindEnter { .. } => TriggerPoint::SysBind,
            HookEvent::BindExit { .. } => TriggerPoint::SysBindRet,
            HookEvent::TcpConnect { .. } => TriggerPoint::TcpConnect,
            HookEvent::TcpSendmsg { .. } => TriggerPoint::TcpSendmsg,
            HookEvent::TcpCleanupRbuf { .. } => TriggerPoint::TcpCleanupRbuf,
            HookEvent::TcpRetransmitSkb { .. } => TriggerPoint::TcpRetransmitSkb,
            HookEvent::TcpSetState { .. } => TriggerPoint::TcpSetState,
            HookEvent::TcpClose { .. } => TriggerPoint::TcpClose,
            HookEvent::UdpSendmsg { .. } => TriggerPoint::UdpSendmsg,
            HookEvent::UdpRecvmsg { .. } => TriggerPoint::UdpRecvmsg,
            HookEvent::UdpRecvmsgRet { .. } => TriggerPoint::UdpRecvmsgRet,
            HookEvent::InetCskAcceptRet { .. } => TriggerPoint::InetCskAcceptRet,
            HookEvent::TcpV4DestroySock { .. } => TriggerPoint::TcpV4DestroySock,
            HookEvent::UdpDestroySock { .. } => TriggerPoint::UdpDestroySock,
        }
    }
}

pub type HookHandler = fn(&Tracer, &HookContext, &HookEvent);

/// Trigger point -> handler
pub static HOOKS: [(TriggerPoint, HookHandler); 16] = [
    (TriggerPoint::SysSocket, on_sys_socket),
    (TriggerPoint::SysSocketRet, on_sys_socket_ret),
    (TriggerPoint::SysBind, on_sys_bind),
    (TriggerPoint::SysBindRet, on_sys_bind_ret),
    (TriggerPoint::TcpConnect, on_tcp_connect),
    (TriggerPoint::TcpSendmsg, on_tcp_sendmsg),
    (TriggerPoint::TcpCleanupRbuf, on_tcp_cleanup_rbuf),
    (TriggerPoint::TcpRetransmitSkb, on_tcp_retransmit_skb),
    (TriggerPoint::TcpSetState, on_tcp_set_state),
    (TriggerPoint::TcpClose, on_tcp_close),
    (TriggerPoint::UdpSendmsg, on_udp_sendmsg),
    (TriggerPoint::UdpRecvmsg, on_udp_recvmsg),
    (TriggerPoint::UdpRecvmsgRet, on_udp_recvmsg_ret),
    (TriggerPoint::InetCskAcceptRet, on_inet_csk_accept_ret),
    (TriggerPoint::TcpV4DestroySock, on_tcp_v4_destroy_sock),
    (TriggerPoint::UdpDestroySock, on_udp_destroy_sock),
];

pub fn handler_for(trigger: TriggerPoint) -> Option<HookHandler> {
    HOOKS
        .iter()
        .find(|(point, _)| *point == trigger)
        .map(|(_, handler)| *handler)
}

fn on_sys_socket(tracer: &Tracer, ctx: &HookContext, event: &HookEvent) {
    let HookEvent::SocketEnter { family, sock_type } = *event else {
        return;
    };
    tracer
        .correlator()
        .socket_enter(ctx.pid_tgid, family, sock_type, tracer.telemetry());
}

fn on_sys_socket_ret(tracer: &Tracer, ctx: &HookContext, event: &HookEvent) {
    let HookEvent::SocketExit { ret } = *event else {
        return;
    };
    tracer
        .correlator()
        .socket_exit(ctx.pid_tgid, ret, tracer.telemetry());
}

fn on_sys_bind(tracer: &Tracer, ctx: &HookContext, event: &HookEvent) {
    let HookEvent::BindEnter { fd, addr } = *event else {
        return;
    };
    let Some(addr) = addr else {
        return;
    };
    let args = BindSyscallArgs {
        fd,
        port: addr.port,
        family: addr.family,
    };
    tracer
        .correlator()
        .bind_enter(ctx.pid_tgid, args, tracer.telemetry());
}

fn on_sys_bind_ret(tracer: &Tracer, ctx: &HookContext, event: &HookEvent) {
    let HookEvent::BindExit { ret } = *event else {
        return;
    };
    // Two tables, no transaction: between the marker removal inside
    // `bind_exit` and the registry write below, neither holds the socket.
    if let Some(bound) = tracer
        .correlator()
        .bind_exit(ctx.pid_tgid, ret, tracer.telemetry())
    {
        tracer.ports().mark_listening(
            Protocol::Udp,
            PortBindingKey::new(ctx.netns, bound.port),
            tracer.telemetry(),
        );
    }
}

fn on_tcp_connect(tracer: &Tracer, ctx: &HookContext, event: &HookEvent) {
    let HookEvent::TcpConnect { tuple: Some(tuple) } = *event else {
        return;
    };
    let mut delta = ConnStats::ZERO;
    delta.timestamp = ctx.now_ns;
    delta.direction = CONN_DIRECTION_OUTGOING;
    tracer
        .connections()
        .record(&tuple.with_pid(ctx.tgid()), &delta, tracer.telemetry());
}

fn on_tcp_sendmsg(tracer: &Tracer, ctx: &HookContext, event: &HookEvent) {
    let HookEvent::TcpSendmsg {
        tuple,
        sent,
        packets,
        rtt,
        rtt_var,
    } = *event
    else {
        return;
    };
    let Some(tuple) = tuple else {
        tracer.telemetry().incr(TelemetryCounter::TcpSentMiscounts);
        return;
    };
    if sent <= 0 {
        return;
    }

    let tuple = tuple.with_pid(ctx.tgid());
    tracer.connections().record(
        &tuple,
        &ConnStats::sent(sent as u64, packets as u64, ctx.now_ns),
        tracer.telemetry(),
    );
    if rtt != 0 {
        tracer.connections().record_tcp(
            &tuple,
            &TcpStats::rtt_sample(rtt, rtt_var),
            tracer.telemetry(),
        );
    }
}

fn on_tcp_cleanup_rbuf(tracer: &Tracer, ctx: &HookContext, event: &HookEvent) {
    let HookEvent::TcpCleanupRbuf {
        tuple: Some(tuple),
        copied,
        packets,
    } = *event
    else {
        return;
    };
    if copied <= 0 {
        return;
    }
    tracer.connections().record(
        &tuple.with_pid(ctx.tgid()),
        &ConnStats::received(copied as u64, packets as u64, ctx.now_ns),
        tracer.telemetry(),
    );
}

fn on_tcp_retransmit_skb(tracer: &Tracer, _ctx: &HookContext, event: &HookEvent) {
    let HookEvent::TcpRetransmitSkb {
        tuple: Some(tuple),
        segments,
    } = *event
    else {
        return;
    };
    if segments == 0 {
        return;
    }
    tracer.connections().record_tcp(
        &tuple,
        &TcpStats::retransmitted(segments),
        tracer.telemetry(),
    );
}

fn on_tcp_set_state(tracer: &Tracer, _ctx: &HookContext, event: &HookEvent) {
    let HookEvent::TcpSetState {
        tuple: Some(tuple),
        state,
    } = *event
    else {
        return;
    };
    tracer.connections().record_tcp(
        &tuple,
        &TcpStats::state_entered(state),
        tracer.telemetry(),
    );
}

fn on_tcp_close(tracer: &Tracer, ctx: &HookContext, event: &HookEvent) {
    let HookEvent::TcpClose { tuple: Some(tuple) } = *event else {
        return;
    };
    // Snapshot-and-remove on both tables, then the per-CPU batch. A record
    // that fails to enter the batch is lost along with the rows.
    let tuple = tuple.with_pid(ctx.tgid());
    if let Some(conn) = tracer.connections().close(&tuple, ctx.cpu, ctx.now_ns) {
        tracer
            .batcher()
            .append(ctx.cpu, conn, tracer.telemetry());
    }
}

fn on_udp_sendmsg(tracer: &Tracer, ctx: &HookContext, event: &HookEvent) {
    let HookEvent::UdpSendmsg { tuple, sent } = *event else {
        return;
    };
    let Some(tuple) = tuple else {
        tracer.telemetry().incr(TelemetryCounter::UdpSendMissed);
        return;
    };
    if sent <= 0 {
        return;
    }
    let recorded = tracer.connections().record(
        &tuple.with_pid(ctx.tgid()),
        &ConnStats::sent(sent as u64, 1, ctx.now_ns),
        tracer.telemetry(),
    );
    if recorded {
        tracer.telemetry().incr(TelemetryCounter::UdpSendProcessed);
    }
}

fn on_udp_recvmsg(tracer: &Tracer, ctx: &HookContext, event: &HookEvent) {
    let HookEvent::UdpRecvmsg { tuple: Some(tuple) } = *event else {
        return;
    };
    tracer
        .correlator()
        .udp_recv_enter(ctx.pid_tgid, &tuple, tracer.telemetry());
}

fn on_udp_recvmsg_ret(tracer: &Tracer, ctx: &HookContext, event: &HookEvent) {
    let HookEvent::UdpRecvmsgRet { copied } = *event else {
        return;
    };
    // Always consume the parked socket, even for a failed receive
    let Some(tuple) = tracer
        .correlator()
        .udp_recv_exit(ctx.pid_tgid, tracer.telemetry())
    else {
        return;
    };
    if copied <= 0 {
        return;
    }
    tracer.connections().record(
        &tuple.with_pid(ctx.tgid()),
        &ConnStats::received(copied as u64, 1, ctx.now_ns),
        tracer.telemetry(),
    );
}

fn on_inet_csk_accept_ret(tracer: &Tracer, ctx: &HookContext, event: &HookEvent) {
    let HookEvent::InetCskAcceptRet { tuple: Some(tuple) } = *event else {
        return;
    };
    // The accepted socket's local port is the listener's port
    tracer.ports().mark_listening(
        Protocol::Tcp,
        PortBindingKey::new(tuple.netns, tuple.sport),
        tracer.telemetry(),
    );

    let mut delta = ConnStats::ZERO;
    delta.timestamp = ctx.now_ns;
    delta.direction = CONN_DIRECTION_INCOMING;
    tracer
        .connections()
        .record(&tuple.with_pid(ctx.tgid()), &delta, tracer.telemetry());
}

fn on_tcp_v4_destroy_sock(tracer: &Tracer, _ctx: &HookContext, event: &HookEvent) {
    let HookEvent::TcpV4DestroySock { netns, local_port } = *event else {
        return;
    };
    // By now tcp_close() has moved the socket out of LISTEN, so its state
    // cannot tell a listener from an accepted child. Any destroy closes the
    // port; the next accept on a live listener marks it LISTENING again.
    if local_port == 0 {
        return;
    }
    tracer.ports().mark_closed(
        Protocol::Tcp,
        PortBindingKey::new(netns, local_port),
        tracer.telemetry(),
    );
}

fn on_udp_destroy_sock(tracer: &Tracer, _ctx: &HookContext, event: &HookEvent) {
    let HookEvent::UdpDestroySock { netns, local_port } = *event else {
        return;
    };
    if local_port == 0 {
        return;
    }
    tracer.ports().mark_closed(
        Protocol::Udp,
        PortBindingKey::new(netns, local_port),
        tracer.telemetry(),
    );
}
