use conntrack_common::{ConnTuple, Protocol, TelemetryCounter};
use conntrack_tracer::{HookContext, HookEvent, Tracer, TracerConfig};
use proptest::prelude::*;

fn tracer(num_cpus: u32, close_batch_size: usize) -> Tracer {
    Tracer::new(TracerConfig {
        max_tracked_connections: 256,
        close_batch_size,
        close_channel_depth: 256,
        num_cpus,
        pending_calls_max: 64,
        unbound_sockets_max: 64,
        pending_udp_recv_max: 16,
    })
    .unwrap()
    .0
}

fn flow() -> ConnTuple {
    ConnTuple::ipv4(0xc0a8_0001, 55000, 0xc0a8_0002, 80, 1, Protocol::Tcp)
}

#[derive(Debug, Clone)]
enum Delta {
    Sent(i64, u32),
    Recv(i64, u32),
}

fn delta() -> impl Strategy<Value = Delta> {
    prop_oneof![
        (1i64..100_000, 1u32..64).prop_map(|(b, p)| Delta::Sent(b, p)),
        (1i64..100_000, 1u32..64).prop_map(|(b, p)| Delta::Recv(b, p)),
    ]
}

proptest! {
    #[test]
    fn deltas_sum_exactly(deltas in prop::collection::vec((delta(), 0u32..4, 0u64..1_000_000), 1..200)) {
        let tracer = tracer(4, 4);
        let (mut sent, mut recv, mut sent_pk, mut recv_pk, mut last) = (0u64, 0u64, 0u64, 0u64, 0u64);

        for (d, cpu, ts) in &deltas {
            let ctx = HookContext::new(42, 42, *cpu, 1, *ts);
            let event = match *d {
                Delta::Sent(bytes, packets) => {
                    sent += bytes as u64;
                    sent_pk += packets as u64;
                    HookEvent::TcpSendmsg { tuple: Some(flow()), sent: bytes, packets, rtt: 0, rtt_var: 0 }
                }
                Delta::Recv(bytes, packets) => {
                    recv += bytes as u64;
                    recv_pk += packets as u64;
                    HookEvent::TcpCleanupRbuf { tuple: Some(flow()), copied: bytes, packets }
                }
            };
            last = last.max(*ts);
            tracer.dispatch(&ctx, &event);
        }

        let stats = tracer.connections().conn_stats(&flow().with_pid(42)).unwrap();
        prop_assert_eq!(stats.sent_bytes, sent);
        prop_assert_eq!(stats.recv_bytes, recv);
        prop_assert_eq!(stats.sent_packets, sent_pk);
        prop_assert_eq!(stats.recv_packets, recv_pk);
        prop_assert_eq!(stats.timestamp, last);
        prop_assert_eq!(tracer.telemetry_snapshot().total_losses(), 0);
    }

    #[test]
    fn closures_are_delivered_once_in_order(k in 1u16..64, b in 1usize..8) {
        let tracer_and_readers = Tracer::new(TracerConfig {
            max_tracked_connections: 256,
            close_batch_size: b,
            close_channel_depth: 256,
            num_cpus: 1,
            pending_calls_max: 64,
            unbound_sockets_max: 64,
            pending_udp_recv_max: 16,
        });
        let (tracer, readers) = tracer_and_readers.unwrap();

        for sport in 0..k {
            let tuple = ConnTuple::ipv4(1, 1000 + sport, 2, 80, 1, Protocol::Tcp);
            let ctx = HookContext::new(7, 7, 0, 1, sport as u64);
            tracer.dispatch(&ctx, &HookEvent::TcpSendmsg { tuple: Some(tuple), sent: 1, packets: 1, rtt: 0, rtt_var: 0 });
            tracer.dispatch(&ctx, &HookEvent::TcpClose { tuple: Some(tuple) });
        }
        tracer.flush_close_batches();

        let mut ring = readers.into_rings().remove(0);
        let mut batches = Vec::new();
        while let Ok(batch) = ring.try_recv() {
            batches.push(batch);
        }

        prop_assert_eq!(batches.len(), (k as usize).div_ceil(b));
        prop_assert!(batches.iter().all(|batch| batch.len() <= b));
        let ports: Vec<u16> = batches
            .iter()
            .flat_map(|batch| batch.as_slice().iter().map(|c| c.tuple.sport))
            .collect();
        let expected: Vec<u16> = (0..k).map(|s| 1000 + s).collect();
        prop_assert_eq!(ports, expected);
        prop_assert_eq!(tracer.telemetry_snapshot().get(TelemetryCounter::MissedTcpClose), 0);
    }
}

#[test]
fn concurrent_senders_sum_exactly() {
    use std::sync::Arc;
    use std::thread;

    const THREADS: u32 = 4;
    const SENDS: u64 = 2_000;

    let tracer = Arc::new(tracer(THREADS, 4));
    let handles: Vec<_> = (0..THREADS)
        .map(|cpu| {
            let tracer = Arc::clone(&tracer);
            thread::spawn(move || {
                let ctx = HookContext::new(9, 9 + cpu, cpu, 1, 0);
                for _ in 0..SENDS {
                    tracer.dispatch(
                        &ctx,
                        &HookEvent::TcpSendmsg {
                            tuple: Some(flow()),
                            sent: 3,
                            packets: 1,
                            rtt: 0,
                            rtt_var: 0,
                        },
                    );
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    let dropped = tracer
        .telemetry_snapshot()
        .get(TelemetryCounter::ConnStatsDropped);
    let recorded = tracer
        .connections()
        .conn_stats(&flow().with_pid(9))
        .map(|s| s.sent_packets)
        .unwrap_or(0);
    assert_eq!(recorded + dropped, THREADS as u64 * SENDS);
    assert_eq!(recorded * 3, tracer.connections().conn_stats(&flow().with_pid(9)).unwrap().sent_bytes);
}
