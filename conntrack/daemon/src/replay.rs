//! Hook trace replay
//!
//! Drives the tracker from a JSON-lines trace, one hook invocation per line:
//!
//! ```text
//! {"cpu":0,"pid":100,"netns":4026531840,"ts":1000,"hook":"sys_socket","sock_type":2}
//! {"cpu":0,"pid":100,"netns":4026531840,"ts":1010,"hook":"sys_socket_ret","ret":5}
//! {"cpu":1,"pid":200,"netns":4026531840,"ts":2000,"hook":"tcp_sendmsg",
//!  "conn":{"saddr":"10.0.0.1","sport":40000,"daddr":"10.0.0.2","dport":443},"sent":512}
//! ```
//!
//! `tid` defaults to `pid`. A missing `conn` models a socket whose addresses
//! could not be read. Blank lines and lines starting with `#` are skipped.

use anyhow::{Context, Result};
use conntrack_common::{ConnTuple, Protocol, AF_INET};
use conntrack_tracer::{HookContext, HookEvent, SockAddr, Tracer};
use log::{debug, info, warn};
use serde::Deserialize;
use std::{
    fs::File,
    io::{BufRead, BufReader},
    net::IpAddr,
    path::Path,
};

/// Fields common to every trace line
#[derive(Deserialize, Debug, Clone, Copy)]
pub struct TraceHeader {
    pub cpu: u32,
    pub pid: u32,
    #[serde(default)]
    pub tid: Option<u32>,
    #[serde(default)]
    pub netns: u32,
    pub ts: u64,
}

impl TraceHeader {
    pub fn context(&self) -> HookContext {
        HookContext::new(
            self.pid,
            self.tid.unwrap_or(self.pid),
            self.cpu,
            self.netns,
            self.ts,
        )
    }
}

/// Socket addresses as written in a trace
#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct TraceTuple {
    pub saddr: IpAddr,
    pub sport: u16,
    pub daddr: IpAddr,
    pub dport: u16,
}

impl TraceTuple {
    pub fn to_conn_tuple(self, netns: u32, protocol: Protocol) -> ConnTuple {
        match (self.saddr, self.daddr) {
            (IpAddr::V4(saddr), IpAddr::V4(daddr)) => ConnTuple::ipv4(
                u32::from(saddr),
                self.sport,
                u32::from(daddr),
                self.dport,
                netns,
                protocol,
            ),
            (saddr, daddr) => ConnTuple::ipv6(
                split_v6(saddr),
                self.sport,
                split_v6(daddr),
                self.dport,
                netns,
                protocol,
            ),
        }
    }
}

fn split_v6(addr: IpAddr) -> (u64, u64) {
    let bits = match addr {
        IpAddr::V4(v4) => u128::from(v4.to_ipv6_mapped()),
        IpAddr::V6(v6) => u128::from(v6),
    };
    ((bits >> 64) as u64, bits as u64)
}

fn one() -> u32 {
    1
}

fn af_inet() -> u16 {
    AF_INET
}

/// Per-hook arguments, tagged by `hook`
#[derive(Deserialize, Debug, Clone, Copy, PartialEq)]
#[serde(tag = "hook", rename_all = "snake_case")]
pub enum TraceEvent {
    SysSocket {
        #[serde(default = "af_inet")]
        family: u16,
        sock_type: u32,
    },
    SysSocketRet {
        ret: i64,
    },
    SysBind {
        fd: i32,
        #[serde(default)]
        family: Option<u16>,
        #[serde(default)]
        port: Option<u16>,
    },
    SysBindRet {
        ret: i64,
    },
    TcpConnect {
        #[serde(default)]
        conn: Option<TraceTuple>,
    },
    TcpSendmsg {
        #[serde(default)]
        conn: Option<TraceTuple>,
        sent: i64,
        #[serde(default = "one")]
        packets: u32,
        #[serde(default)]
        rtt: u32,
        #[serde(default)]
        rtt_var: u32,
    },
    TcpCleanupRbuf {
        #[serde(default)]
        conn: Option<TraceTuple>,
        copied: i64,
        #[serde(default = "one")]
        packets: u32,
    },
    TcpRetransmitSkb {
        #[serde(default)]
        conn: Option<TraceTuple>,
        #[serde(default = "one")]
        segments: u32,
    },
    TcpSetState {
        #[serde(default)]
        conn: Option<TraceTuple>,
        state: u8,
    },
    TcpClose {
        #[serde(default)]
        conn: Option<TraceTuple>,
    },
    UdpSendmsg {
        #[serde(default)]
        conn: Option<TraceTuple>,
        sent: i64,
    },
    UdpRecvmsg {
        #[serde(default)]
        conn: Option<TraceTuple>,
    },
    UdpRecvmsgRet {
        copied: i64,
    },
    InetCskAccept {
        #[serde(default)]
        conn: Option<TraceTuple>,
    },
    TcpV4DestroySock {
        port: u16,
    },
    UdpDestroySock {
        port: u16,
    },
}

impl TraceEvent {
    /// Translate into the hook arguments, resolving tuples in `netns`
    pub fn into_hook_event(self, netns: u32) -> HookEvent {
        let tcp = |conn: Option<TraceTuple>| conn.map(|c| c.to_conn_tuple(netns, Protocol::Tcp));
        let udp = |conn: Option<TraceTuple>| conn.map(|c| c.to_conn_tuple(netns, Protocol::Udp));

        match self {
            TraceEvent::SysSocket { family, sock_type } => {
                HookEvent::SocketEnter { family, sock_type }
            }
            TraceEvent::SysSocketRet { ret } => HookEvent::SocketExit { ret },
            TraceEvent::SysBind { fd, family, port } => HookEvent::BindEnter {
                fd,
                addr: family
                    .zip(port)
                    .map(|(family, port)| SockAddr { family, port }),
            },
            TraceEvent::SysBindRet { ret } => HookEvent::BindExit { ret },
            TraceEvent::TcpConnect { conn } => HookEvent::TcpConnect { tuple: tcp(conn) },
            TraceEvent::TcpSendmsg {
                conn,
                sent,
                packets,
                rtt,
                rtt_var,
            } => HookEvent::TcpSendmsg {
                tuple: tcp(conn),
                sent,
                packets,
                rtt,
                rtt_var,
            },
            TraceEvent::TcpCleanupRbuf {
                conn,
                copied,
                packets,
            } => HookEvent::TcpCleanupRbuf {
                tuple: tcp(conn),
                copied,
                packets,
            },
            TraceEvent::TcpRetransmitSkb { conn, segments } => HookEvent::TcpRetransmitSkb {
                tuple: tcp(conn),
                segments,
            },
            TraceEvent::TcpSetState { conn, state } => HookEvent::TcpSetState {
                tuple: tcp(conn),
                state,
            },
            TraceEvent::TcpClose { conn } => HookEvent::TcpClose { tuple: tcp(conn) },
            TraceEvent::UdpSendmsg { conn, sent } => HookEvent::UdpSendmsg {
                tuple: udp(conn),
                sent,
            },
            TraceEvent::UdpRecvmsg { conn } => HookEvent::UdpRecvmsg { tuple: udp(conn) },
            TraceEvent::UdpRecvmsgRet { copied } => HookEvent::UdpRecvmsgRet { copied },
            TraceEvent::InetCskAccept { conn } => {
                HookEvent::InetCskAcceptRet { tuple: tcp(conn) }
            }
            TraceEvent::TcpV4DestroySock { port } => HookEvent::TcpV4DestroySock {
                netns,
                local_port: port,
            },
            TraceEvent::UdpDestroySock { port } => HookEvent::UdpDestroySock {
                netns,
                local_port: port,
            },
        }
    }
}

/// Parse one trace line
pub fn parse_line(line: &str) -> Result<(HookContext, HookEvent)> {
    let value: serde_json::Value = serde_json::from_str(line).context("invalid JSON")?;
    let header: TraceHeader =
        serde_json::from_value(value.clone()).context("invalid trace header")?;
    let event: TraceEvent = serde_json::from_value(value).context("invalid hook arguments")?;

    Ok((header.context(), event.into_hook_event(header.netns)))
}

/// Outcome of a replay run
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReplayStats {
    pub lines: u64,
    pub dispatched: u64,
    pub malformed: u64,
}

/// Replay every line of `reader` into `tracer`
///
/// Malformed lines are logged and skipped; only I/O errors abort the run.
pub fn replay<R: BufRead>(tracer: &Tracer, reader: R) -> Result<ReplayStats> {
    let mut stats = ReplayStats::default();

    for (index, line) in reader.lines().enumerate() {
        let line = line.with_context(|| format!("Failed to read trace line {}", index + 1))?;
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        stats.lines += 1;

        match parse_line(line) {
            Ok((ctx, event)) => {
                tracer.dispatch(&ctx, &event);
                stats.dispatched += 1;
            }
            Err(e) => {
                warn!("Skipping trace line {}: {:#}", index + 1, e);
                stats.malformed += 1;
            }
        }
    }

    debug!(
        "Replay finished: {} lines, {} dispatched, {} malformed",
        stats.lines, stats.dispatched, stats.malformed
    );
    Ok(stats)
}

/// Replay a trace file
pub fn replay_file(tracer: &Tracer, path: &Path) -> Result<ReplayStats> {
    let file =
        File::open(path).with_context(|| format!("Failed to open trace file: {:?}", path))?;
    info!("Replaying hook trace from {:?}", path);
    replay(tracer, BufReader::new(file))
}

#[cfg(test)]
mod tests {
    use super::*;
    use conntrack_common::{PortBindingKey, PortState, SOCK_DGRAM};
    use conntrack_tracer::TracerConfig;

    fn tracer() -> Tracer {
        Tracer::new(TracerConfig {
            num_cpus: 2,
            max_tracked_connections: 64,
            ..TracerConfig::default()
        })
        .unwrap()
        .0
    }

    #[test]
    fn test_parse_sendmsg() {
        let line = r#"{"cpu":1,"pid":200,"netns":7,"ts":2000,"hook":"tcp_sendmsg","conn":{"saddr":"10.0.0.1","sport":40000,"daddr":"10.0.0.2","dport":443},"sent":512}"#;
        let (ctx, event) = parse_line(line).unwrap();

        assert_eq!(ctx.tgid(), 200);
        assert_eq!(ctx.tid(), 200);
        assert_eq!(ctx.cpu, 1);
        assert_eq!(
            event,
            HookEvent::TcpSendmsg {
                tuple: Some(ConnTuple::ipv4(0x0a00_0001, 40000, 0x0a00_0002, 443, 7, Protocol::Tcp)),
                sent: 512,
                packets: 1,
                rtt: 0,
                rtt_var: 0,
            }
        );
    }

    #[test]
    fn test_parse_missing_conn_and_ipv6() {
        let (_, event) =
            parse_line(r#"{"cpu":0,"pid":1,"ts":0,"hook":"udp_sendmsg","sent":9}"#).unwrap();
        assert_eq!(event, HookEvent::UdpSendmsg { tuple: None, sent: 9 });

        let (_, event) = parse_line(
            r#"{"cpu":0,"pid":1,"ts":0,"hook":"tcp_close","conn":{"saddr":"::1","sport":1,"daddr":"::1","dport":2}}"#,
        )
        .unwrap();
        let HookEvent::TcpClose { tuple: Some(tuple) } = event else {
            panic!("unexpected event {:?}", event);
        };
        assert!(tuple.is_ipv6());
        assert_eq!(tuple.saddr_l, 1);
    }

    #[test]
    fn test_parse_rejects_unknown_hook() {
        assert!(parse_line(r#"{"cpu":0,"pid":1,"ts":0,"hook":"tcp_poll"}"#).is_err());
        assert!(parse_line(r#"{"pid":1,"ts":0,"hook":"tcp_close"}"#).is_err());
        assert!(parse_line("not json").is_err());
    }

    #[test]
    fn test_replay_udp_bind() {
        let tracer = tracer();
        let trace = format!(
            "# dns server\n\
             {{\"cpu\":0,\"pid\":100,\"netns\":9,\"ts\":1,\"hook\":\"sys_socket\",\"sock_type\":{}}}\n\
             {{\"cpu\":0,\"pid\":100,\"netns\":9,\"ts\":2,\"hook\":\"sys_socket_ret\",\"ret\":5}}\n\
             \n\
             {{\"cpu\":0,\"pid\":100,\"netns\":9,\"ts\":3,\"hook\":\"sys_bind\",\"fd\":5,\"family\":2,\"port\":53}}\n\
             garbage\n\
             {{\"cpu\":0,\"pid\":100,\"netns\":9,\"ts\":4,\"hook\":\"sys_bind_ret\",\"ret\":0}}\n",
            SOCK_DGRAM
        );

        let stats = replay(&tracer, trace.as_bytes()).unwrap();

        assert_eq!(
            stats,
            ReplayStats {
                lines: 5,
                dispatched: 4,
                malformed: 1
            }
        );
        assert_eq!(
            tracer.ports().get(Protocol::Udp, &PortBindingKey::new(9, 53)),
            Some(PortState::Listening)
        );
    }

    #[test]
    fn test_replay_udp_receive_and_listener_close() {
        let tracer = tracer();
        let trace = r#"
{"cpu":0,"pid":300,"netns":9,"ts":1,"hook":"udp_recvmsg","conn":{"saddr":"10.0.0.1","sport":53,"daddr":"10.0.0.2","dport":5353}}
{"cpu":0,"pid":300,"netns":9,"ts":2,"hook":"udp_recvmsg_ret","copied":128}
{"cpu":1,"pid":400,"netns":9,"ts":3,"hook":"inet_csk_accept","conn":{"saddr":"10.0.0.2","sport":8080,"daddr":"10.0.0.7","dport":41000}}
{"cpu":1,"pid":400,"netns":9,"ts":4,"hook":"tcp_v4_destroy_sock","port":8080}
"#;

        let stats = replay(&tracer, trace.as_bytes()).unwrap();
        assert_eq!(stats.dispatched, 4);

        let udp = ConnTuple::ipv4(0x0a00_0001, 53, 0x0a00_0002, 5353, 9, Protocol::Udp);
        assert_eq!(
            tracer.connections().conn_stats(&udp.with_pid(300)).unwrap().recv_bytes,
            128
        );
        assert_eq!(
            tracer.ports().get(Protocol::Tcp, &PortBindingKey::new(9, 8080)),
            Some(PortState::Closed)
        );
    }

    #[test]
    fn test_replay_missing_file() {
        let tracer = tracer();
        assert!(replay_file(&tracer, Path::new("/nonexistent/trace.jsonl")).is_err());
    }
}
