//! Entry/exit correlation for socket(), bind() and udp_recvmsg()
//!
//! At entry only the arguments are visible; at exit only the return value.
//! State captured at entry is parked under the calling task's `pid_tgid` and
//! taken back at exit. An exit that finds nothing is not an error: either the
//! entry was not interesting or it was never stored.
//!
//! Capacity policies:
//! - `pending_sockets`, `pending_bind`, `pending_udp_recv`: reject. A task
//!   re-entering with a stale entry overwrites it; a new task on a full table
//!   is dropped and counted.
//! - `unbound_sockets`: evict. Every eviction is counted, and so is an insert
//!   that found no victim.
//!
//! A busy bucket is handled like a full table on every path, entry or exit:
//! the work is dropped and counted against the table it touched.

use std::sync::atomic::{AtomicU16, AtomicU32, AtomicU64, AtomicU8, Ordering};

use conntrack_common::{
    BindSyscallArgs, ConnTuple, TelemetryCounter, AF_INET, AF_INET6, SOCK_DGRAM, SOCK_TYPE_MASK,
};
use log::trace;

use crate::{
    error::{ConfigError, MapError},
    map::{CapacityPolicy, FixedMap, Inserted, MapValue, UpdateFlag},
    telemetry::Telemetry,
};

/// `BindSyscallArgs` packed into one word
#[derive(Default)]
pub struct AtomicBindArgs(AtomicU64);

impl MapValue for AtomicBindArgs {
    type Plain = BindSyscallArgs;

    fn read(&self) -> BindSyscallArgs {
        let raw = self.0.load(Ordering::Relaxed);
        BindSyscallArgs {
            fd: (raw >> 32) as u32 as i32,
            port: (raw >> 16) as u16,
            family: raw as u16,
        }
    }

    fn write(&self, args: &BindSyscallArgs) {
        let raw = ((args.fd as u32 as u64) << 32) | ((args.port as u64) << 16) | args.family as u64;
        self.0.store(raw, Ordering::Relaxed);
    }
}

/// Socket of an in-flight udp_recvmsg(), as seen at entry
#[derive(Default)]
pub struct AtomicConnTuple {
    saddr_h: AtomicU64,
    saddr_l: AtomicU64,
    daddr_h: AtomicU64,
    daddr_l: AtomicU64,
    sport: AtomicU16,
    dport: AtomicU16,
    netns: AtomicU32,
    pid: AtomicU32,
    metadata: AtomicU32,
}

impl MapValue for AtomicConnTuple {
    type Plain = ConnTuple;

    fn read(&self) -> ConnTuple {
        ConnTuple {
            saddr_h: self.saddr_h.load(Ordering::Relaxed),
            saddr_l: self.saddr_l.load(Ordering::Relaxed),
            daddr_h: self.daddr_h.load(Ordering::Relaxed),
            daddr_l: self.daddr_l.load(Ordering::Relaxed),
            sport: self.sport.load(Ordering::Relaxed),
            dport: self.dport.load(Ordering::Relaxed),
            netns: self.netns.load(Ordering::Relaxed),
            pid: self.pid.load(Ordering::Relaxed),
            metadata: self.metadata.load(Ordering::Relaxed),
        }
    }

    fn write(&self, tuple: &ConnTuple) {
        self.saddr_h.store(tuple.saddr_h, Ordering::Relaxed);
        self.saddr_l.store(tuple.saddr_l, Ordering::Relaxed);
        self.daddr_h.store(tuple.daddr_h, Ordering::Relaxed);
        self.daddr_l.store(tuple.daddr_l, Ordering::Relaxed);
        self.sport.store(tuple.sport, Ordering::Relaxed);
        self.dport.store(tuple.dport, Ordering::Relaxed);
        self.netns.store(tuple.netns, Ordering::Relaxed);
        self.pid.store(tuple.pid, Ordering::Relaxed);
        self.metadata.store(tuple.metadata, Ordering::Relaxed);
    }
}

/// Key of the unbound socket table: process id in the upper half, descriptor
/// in the lower half
///
/// Descriptor tables are per process, so the thread id is dropped.
#[inline(always)]
pub fn unbound_socket_key(pid_tgid: u64, fd: i32) -> u64 {
    (pid_tgid & 0xFFFF_FFFF_0000_0000) | (fd as u32 as u64)
}

#[inline(always)]
fn is_inet(family: u16) -> bool {
    family == AF_INET || family == AF_INET6
}

/// A datagram socket whose bind() completed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BoundSocket {
    pub fd: i32,
    pub port: u16,
    pub family: u16,
}

pub struct CallCorrelator {
    pending_sockets: FixedMap<u64, AtomicU8>,
    pending_binds: FixedMap<u64, AtomicBindArgs>,
    unbound_sockets: FixedMap<u64, AtomicU8>,
    pending_udp_recv: FixedMap<u64, AtomicConnTuple>,
}

impl CallCorrelator {
    pub fn new(pending_max: u32, unbound_max: u32, udp_recv_max: u32) -> Result<Self, ConfigError> {
        Ok(Self {
            pending_sockets: FixedMap::new("pending_sockets", pending_max, CapacityPolicy::Reject)?,
            pending_binds: FixedMap::new("pending_bind", pending_max, CapacityPolicy::Reject)?,
            unbound_sockets: FixedMap::new("unbound_sockets", unbound_max, CapacityPolicy::Evict)?,
            pending_udp_recv: FixedMap::new(
                "pending_udp_recv",
                udp_recv_max,
                CapacityPolicy::Reject,
            )?,
        })
    }

    /// socket() entry: remember INET datagram requests only
    ///
    /// Other families can never reach the UDP port table, so they get no
    /// marker that could crowd out a real one.
    pub fn socket_enter(
        &self,
        pid_tgid: u64,
        family: u16,
        sock_type: u32,
        telemetry: &Telemetry,
    ) -> bool {
        if !is_inet(family) || sock_type & SOCK_TYPE_MASK != SOCK_DGRAM {
            return false;
        }

        match self.pending_sockets.insert(&pid_tgid, &1, UpdateFlag::Any) {
            Ok(_) => true,
            Err(err) => {
                trace!("pending_sockets: dropped entry for {:#x}: {}", pid_tgid, err);
                telemetry.incr(TelemetryCounter::PendingSocketDropped);
                false
            }
        }
    }

    /// socket() exit
    ///
    /// Returns the descriptor when a new datagram socket was marked unbound.
    /// A successful non-datagram socket clears any marker left on the same
    /// descriptor number, so a reused descriptor never inherits it.
    pub fn socket_exit(&self, pid_tgid: u64, ret: i64, telemetry: &Telemetry) -> Option<i32> {
        let was_datagram = match self.pending_sockets.take(&pid_tgid) {
            Ok(_) => true,
            Err(MapError::NotFound) => false,
            Err(err) => {
                trace!("pending_sockets: exit of {:#x} not paired: {}", pid_tgid, err);
                telemetry.incr(TelemetryCounter::PendingSocketDropped);
                return None;
            }
        };
        if ret < 0 || ret > i32::MAX as i64 {
            return None;
        }

        let fd = ret as i32;
        let key = unbound_socket_key(pid_tgid, fd);
        if !was_datagram {
            if let Err(MapError::Busy) = self.unbound_sockets.remove(&key) {
                trace!("unbound_sockets: stale marker for fd {} not cleared", fd);
                telemetry.incr(TelemetryCounter::UnboundSocketEvicted);
            }
            return None;
        }

        match self.unbound_sockets.insert(&key, &1, UpdateFlag::Any) {
            Ok(Inserted::Evicted) => {
                telemetry.incr(TelemetryCounter::UnboundSocketEvicted);
                Some(fd)
            }
            Ok(_) => Some(fd),
            Err(err) => {
                trace!("unbound_sockets: marker for fd {} not stored: {}", fd, err);
                telemetry.incr(TelemetryCounter::UnboundSocketEvicted);
                None
            }
        }
    }

    /// bind() entry: remember the target when the port is known up front
    ///
    /// Port 0 asks the kernel for an ephemeral port which the arguments cannot
    /// tell us, so such calls are not recorded.
    pub fn bind_enter(&self, pid_tgid: u64, args: BindSyscallArgs, telemetry: &Telemetry) -> bool {
        if args.port == 0 || !is_inet(args.family) {
            return false;
        }

        match self.pending_binds.insert(&pid_tgid, &args, UpdateFlag::Any) {
            Ok(_) => true,
            Err(err) => {
                trace!("pending_bind: dropped entry for {:#x}: {}", pid_tgid, err);
                telemetry.incr(TelemetryCounter::PendingBindDropped);
                false
            }
        }
    }

    /// bind() exit
    ///
    /// On success, consumes the unbound marker of the descriptor. Returns the
    /// binding only when the descriptor was a tracked datagram socket.
    pub fn bind_exit(&self, pid_tgid: u64, ret: i64, telemetry: &Telemetry) -> Option<BoundSocket> {
        let args = match self.pending_binds.take(&pid_tgid) {
            Ok(args) => args,
            Err(MapError::NotFound) => return None,
            Err(err) => {
                trace!("pending_bind: exit of {:#x} not paired: {}", pid_tgid, err);
                telemetry.incr(TelemetryCounter::PendingBindDropped);
                return None;
            }
        };
        if ret != 0 {
            return None;
        }

        match self
            .unbound_sockets
            .take(&unbound_socket_key(pid_tgid, args.fd))
        {
            Ok(_) => Some(BoundSocket {
                fd: args.fd,
                port: args.port,
                family: args.family,
            }),
            Err(MapError::NotFound) => None,
            Err(err) => {
                trace!("unbound_sockets: marker for fd {} unreadable: {}", args.fd, err);
                telemetry.incr(TelemetryCounter::UnboundSocketEvicted);
                None
            }
        }
    }

    /// udp_recvmsg() entry: park the socket until the call returns
    pub fn udp_recv_enter(&self, pid_tgid: u64, tuple: &ConnTuple, telemetry: &Telemetry) -> bool {
        match self.pending_udp_recv.insert(&pid_tgid, tuple, UpdateFlag::Any) {
            Ok(_) => true,
            Err(err) => {
                trace!("pending_udp_recv: dropped entry for {:#x}: {}", pid_tgid, err);
                telemetry.incr(TelemetryCounter::PendingUdpRecvDropped);
                false
            }
        }
    }

    /// udp_recvmsg() exit: the socket parked at entry, if any
    pub fn udp_recv_exit(&self, pid_tgid: u64, telemetry: &Telemetry) -> Option<ConnTuple> {
        match self.pending_udp_recv.take(&pid_tgid) {
            Ok(tuple) => Some(tuple),
            Err(MapError::NotFound) => None,
            Err(err) => {
                trace!("pending_udp_recv: exit of {:#x} not paired: {}", pid_tgid, err);
                telemetry.incr(TelemetryCounter::PendingUdpRecvDropped);
                None
            }
        }
    }

    pub fn has_unbound_marker(&self, pid_tgid: u64, fd: i32) -> bool {
        self.unbound_sockets
            .contains_key(&unbound_socket_key(pid_tgid, fd))
    }

    pub fn pending_sockets_len(&self) -> usize {
        self.pending_sockets.len()
    }

    pub fn pending_binds_len(&self) -> usize {
        self.pending_binds.len()
    }

    pub fn unbound_sockets_len(&self) -> usize {
        self.unbound_sockets.len()
    }

    pub fn pending_udp_recv_len(&self) -> usize {
        self.pending_udp_recv.len()
    }
}
