//! End-to-end hook sequences against a small tracer

use conntrack_common::{
    CloseBatch, ConnTuple, PortBindingKey, PortState, Protocol, TelemetryCounter, AF_INET,
    SOCK_DGRAM, SOCK_STREAM,
};
use conntrack_tracer::{
    CloseEventReaders, HookContext, HookEvent, SockAddr, Tracer, TracerConfig,
};

const NETNS: u32 = 4026531840;

fn small_tracer(max_tracked_connections: u32, close_batch_size: usize) -> (Tracer, CloseEventReaders) {
    Tracer::new(TracerConfig {
        max_tracked_connections,
        close_batch_size,
        close_channel_depth: 16,
        num_cpus: 2,
        pending_calls_max: 16,
        unbound_sockets_max: 4,
        pending_udp_recv_max: 16,
    })
    .unwrap()
}

fn ctx(pid: u32, cpu: u32, now_ns: u64) -> HookContext {
    HookContext::new(pid, pid, cpu, NETNS, now_ns)
}

fn tcp_flow(sport: u16) -> ConnTuple {
    ConnTuple::ipv4(0x0a00_0001, sport, 0x0a00_0002, 443, NETNS, Protocol::Tcp)
}

fn create_socket(tracer: &Tracer, ctx: &HookContext, sock_type: u32, fd: i64) {
    tracer.dispatch(
        ctx,
        &HookEvent::SocketEnter {
            family: AF_INET,
            sock_type,
        },
    );
    tracer.dispatch(ctx, &HookEvent::SocketExit { ret: fd });
}

fn bind(tracer: &Tracer, ctx: &HookContext, fd: i32, port: u16) {
    tracer.dispatch(
        ctx,
        &HookEvent::BindEnter {
            fd,
            addr: Some(SockAddr {
                family: AF_INET,
                port,
            }),
        },
    );
    tracer.dispatch(ctx, &HookEvent::BindExit { ret: 0 });
}

fn send(tracer: &Tracer, ctx: &HookContext, tuple: ConnTuple, bytes: i64) {
    tracer.dispatch(
        ctx,
        &HookEvent::TcpSendmsg {
            tuple: Some(tuple),
            sent: bytes,
            packets: 1,
            rtt: 0,
            rtt_var: 0,
        },
    );
}

fn drain(readers: &mut CloseEventReaders, cpu: u32) -> Vec<CloseBatch> {
    let ring = readers.ring_mut(cpu).unwrap();
    let mut batches = Vec::new();
    while let Ok(batch) = ring.try_recv() {
        batches.push(batch);
    }
    batches
}

#[test]
fn udp_bind_to_dns_port_lifecycle() {
    let (tracer, _readers) = small_tracer(64, 4);
    let ctx = ctx(100, 0, 0);
    let key = PortBindingKey::new(NETNS, 53);

    create_socket(&tracer, &ctx, SOCK_DGRAM, 5);
    assert!(tracer.correlator().has_unbound_marker(ctx.pid_tgid, 5));

    bind(&tracer, &ctx, 5, 53);
    assert_eq!(tracer.ports().entries(Protocol::Udp), vec![(key, PortState::Listening)]);
    assert!(!tracer.correlator().has_unbound_marker(ctx.pid_tgid, 5));
    assert_eq!(tracer.correlator().pending_sockets_len(), 0);
    assert_eq!(tracer.correlator().pending_binds_len(), 0);

    tracer.dispatch(
        &ctx,
        &HookEvent::UdpDestroySock {
            netns: NETNS,
            local_port: 53,
        },
    );
    assert_eq!(tracer.ports().get(Protocol::Udp, &key), Some(PortState::Closed));
    assert_eq!(tracer.ports().len(Protocol::Udp), 1);

    // Consumer deletes after reading the CLOSED state
    assert!(tracer.ports().remove(Protocol::Udp, &key));
    assert_eq!(tracer.ports().len(Protocol::Udp), 0);
}

#[test]
fn every_create_then_bind_pair_listens_once() {
    let (tracer, _readers) = small_tracer(64, 4);

    for (i, port) in [5000u16, 5001, 5002].into_iter().enumerate() {
        let ctx = ctx(200 + i as u32, 0, 0);
        create_socket(&tracer, &ctx, SOCK_DGRAM, 3);
        bind(&tracer, &ctx, 3, port);
        assert!(!tracer.correlator().has_unbound_marker(ctx.pid_tgid, 3));
    }

    assert_eq!(tracer.ports().len(Protocol::Udp), 3);
    assert_eq!(tracer.correlator().unbound_sockets_len(), 0);
}

#[test]
fn evicted_marker_yields_no_binding() {
    let (tracer, _readers) = small_tracer(64, 4);
    let ctx = ctx(300, 0, 0);

    // Five unbound datagram sockets in a four-slot marker table
    for fd in 3..8 {
        create_socket(&tracer, &ctx, SOCK_DGRAM, fd);
    }
    assert_eq!(tracer.correlator().unbound_sockets_len(), 4);
    assert_eq!(
        tracer.telemetry_snapshot().get(TelemetryCounter::UnboundSocketEvicted),
        1
    );

    let evicted: Vec<i32> = (3..8)
        .filter(|fd| !tracer.correlator().has_unbound_marker(ctx.pid_tgid, *fd))
        .collect();
    assert_eq!(evicted.len(), 1);

    bind(&tracer, &ctx, evicted[0], 9999);
    assert_eq!(tracer.ports().len(Protocol::Udp), 0);
}

#[test]
fn reused_descriptor_does_not_inherit_marker() {
    let (tracer, _readers) = small_tracer(64, 4);
    let ctx = ctx(400, 0, 0);

    create_socket(&tracer, &ctx, SOCK_DGRAM, 7);
    // Datagram socket closed without bind, descriptor handed to a stream socket
    create_socket(&tracer, &ctx, SOCK_STREAM, 7);
    assert!(!tracer.correlator().has_unbound_marker(ctx.pid_tgid, 7));

    bind(&tracer, &ctx, 7, 8080);
    assert_eq!(tracer.ports().len(Protocol::Udp), 0);
}

#[test]
fn closures_flush_in_ceil_k_over_b_batches() {
    const K: u16 = 10;
    const B: usize = 4;
    let (tracer, mut readers) = small_tracer(64, B);

    for sport in 0..K {
        let now = 1_000 + sport as u64;
        let ctx = ctx(500, 1, now);
        send(&tracer, &ctx, tcp_flow(40000 + sport), 100);
        tracer.dispatch(
            &ctx,
            &HookEvent::TcpClose {
                tuple: Some(tcp_flow(40000 + sport)),
            },
        );
    }

    // Two eager flushes, the remainder waits for the timer
    assert_eq!(drain(&mut readers, 1).len(), 2);
    assert_eq!(tracer.batcher().pending(1), 2);

    assert_eq!(tracer.flush_close_batches(), 2);
    assert_eq!(tracer.flush_close_batches(), 0);

    let last = drain(&mut readers, 1);
    assert_eq!(last.len(), 1);
    assert_eq!(last[0].len(), 2);
    let order: Vec<u16> = last[0].as_slice().iter().map(|c| c.tuple.sport).collect();
    assert_eq!(order, vec![40008, 40009]);
    assert!(drain(&mut readers, 0).is_empty());
    assert_eq!(tracer.connections().conn_len(), 0);
}

#[test]
fn closed_record_carries_both_snapshots() {
    let (tracer, mut readers) = small_tracer(64, 1);
    let ctx = ctx(600, 0, 50);
    let flow = tcp_flow(41000);

    tracer.dispatch(
        &ctx,
        &HookEvent::TcpSendmsg {
            tuple: Some(flow),
            sent: 300,
            packets: 2,
            rtt: 120,
            rtt_var: 10,
        },
    );
    tracer.dispatch(
        &ctx,
        &HookEvent::TcpRetransmitSkb {
            tuple: Some(flow),
            segments: 1,
        },
    );
    tracer.dispatch(&ctx, &HookEvent::TcpClose { tuple: Some(flow) });

    let batches = drain(&mut readers, 0);
    let conn = batches[0].as_slice()[0];
    assert_eq!(conn.tuple.pid, 600);
    assert_eq!(conn.conn_stats.sent_bytes, 300);
    assert_eq!(conn.tcp_stats.retransmits, 1);
    assert_eq!(conn.tcp_stats.rtt, 120);
    assert_eq!(conn.closed_ns, 50);
    assert_eq!(tracer.connections().tcp_len(), 0);
}

#[test]
fn full_table_rejects_one_more_key() {
    const N: u16 = 8;
    let (tracer, _readers) = small_tracer(N as u32, 4);
    let ctx = ctx(700, 0, 0);

    for sport in 0..N {
        send(&tracer, &ctx, tcp_flow(sport + 1), 10);
    }
    assert_eq!(tracer.connections().conn_len(), N as usize);

    send(&tracer, &ctx, tcp_flow(N + 1), 10);
    assert_eq!(tracer.connections().conn_len(), N as usize);
    assert_eq!(
        tracer.telemetry_snapshot().get(TelemetryCounter::ConnStatsDropped),
        1
    );

    // Existing keys still update
    send(&tracer, &ctx, tcp_flow(1), 10);
    assert_eq!(
        tracer
            .connections()
            .conn_stats(&tcp_flow(1).with_pid(700))
            .unwrap()
            .sent_bytes,
        20
    );
}

#[test]
fn protocol_stats_shared_across_processes() {
    let (tracer, _readers) = small_tracer(64, 4);
    let flow = tcp_flow(42000);

    for pid in [1u32, 2] {
        let ctx = ctx(pid, 0, 0);
        send(&tracer, &ctx, flow, 100);
        tracer.dispatch(
            &ctx,
            &HookEvent::TcpRetransmitSkb {
                tuple: Some(flow),
                segments: 1,
            },
        );
    }

    assert_eq!(tracer.connections().conn_len(), 2);
    assert_eq!(tracer.connections().tcp_len(), 1);
    assert_eq!(tracer.connections().tcp_stats(&flow).unwrap().retransmits, 2);
    assert_eq!(
        tracer
            .connections()
            .conn_stats(&flow.with_pid(1))
            .unwrap()
            .sent_bytes,
        100
    );
}

#[test]
fn undrained_channel_drops_are_counted() {
    let (tracer, _readers) = Tracer::new(TracerConfig {
        max_tracked_connections: 64,
        close_batch_size: 1,
        close_channel_depth: 1,
        num_cpus: 1,
        pending_calls_max: 16,
        unbound_sockets_max: 4,
        pending_udp_recv_max: 16,
    })
    .unwrap();

    for sport in 0..3 {
        let ctx = ctx(800, 0, 0);
        send(&tracer, &ctx, tcp_flow(43000 + sport), 1);
        tracer.dispatch(
            &ctx,
            &HookEvent::TcpClose {
                tuple: Some(tcp_flow(43000 + sport)),
            },
        );
    }

    let snap = tracer.telemetry_snapshot();
    assert_eq!(snap.get(TelemetryCounter::CloseBatchLost), 2);
    assert_eq!(snap.get(TelemetryCounter::ClosedConnsLost), 2);
}
