//! Per-CPU batching of closed connections
//!
//! Each CPU appends closed connections to its own `CloseBatch`. A batch that
//! reaches the configured size is pushed immediately onto that CPU's ring of
//! the notification channel; a timer-driven flush pushes whatever is left so
//! that quiet CPUs do not sit on records. Records keep append order within a
//! CPU; nothing orders them across CPUs.
//!
//! Delivery never waits: a full ring drops the whole batch and counts it.

use conntrack_common::{CloseBatch, ClosedConn, TelemetryCounter};
use log::{debug, trace};
use spin::Mutex;
use tokio::sync::mpsc::{self, error::TrySendError};

use crate::{error::ChannelError, map::try_lock_bounded, telemetry::Telemetry};

/// Bounded one-way channel with one ring per CPU
pub struct PerfEventChannel {
    rings: Box<[mpsc::Sender<CloseBatch>]>,
}

/// Consumer ends of the per-CPU rings, indexed by CPU
pub struct CloseEventReaders {
    rings: Vec<mpsc::Receiver<CloseBatch>>,
}

impl PerfEventChannel {
    /// Create `num_cpus` rings holding up to `depth` batches each
    pub fn new(num_cpus: u32, depth: usize) -> (Self, CloseEventReaders) {
        let (senders, receivers): (Vec<_>, Vec<_>) =
            (0..num_cpus).map(|_| mpsc::channel(depth)).unzip();

        (
            Self {
                rings: senders.into_boxed_slice(),
            },
            CloseEventReaders { rings: receivers },
        )
    }

    /// Non-blocking delivery of `batch` on `cpu`'s ring
    pub fn output(&self, cpu: u32, batch: CloseBatch) -> Result<(), ChannelError> {
        let ring = self
            .rings
            .get(cpu as usize)
            .ok_or(ChannelError::NoSuchCpu(cpu))?;

        ring.try_send(batch).map_err(|err| match err {
            TrySendError::Full(_) => ChannelError::Full(cpu),
            TrySendError::Closed(_) => ChannelError::Closed(cpu),
        })
    }

    pub fn num_cpus(&self) -> u32 {
        self.rings.len() as u32
    }
}

impl CloseEventReaders {
    pub fn len(&self) -> usize {
        self.rings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rings.is_empty()
    }

    /// Ring of a single CPU
    pub fn ring_mut(&mut self, cpu: u32) -> Option<&mut mpsc::Receiver<CloseBatch>> {
        self.rings.get_mut(cpu as usize)
    }

    /// Take the rings, CPU `i` at index `i`
    pub fn into_rings(self) -> Vec<mpsc::Receiver<CloseBatch>> {
        self.rings
    }
}

pub struct CloseBatcher {
    batches: Box<[Mutex<CloseBatch>]>,
    batch_size: usize,
    channel: PerfEventChannel,
}

impl CloseBatcher {
    /// `batch_size` must already be validated against `CLOSE_BATCH_MAX`
    pub fn new(channel: PerfEventChannel, batch_size: usize) -> Self {
        let batches = (0..channel.num_cpus())
            .map(|cpu| Mutex::new(CloseBatch::new(cpu)))
            .collect::<Vec<_>>()
            .into_boxed_slice();

        Self {
            batches,
            batch_size,
            channel,
        }
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn num_cpus(&self) -> u32 {
        self.batches.len() as u32
    }

    /// Queue a closed connection on `cpu`, flushing when the batch fills up
    ///
    /// Returns false when the record could not be queued (counted as
    /// `MissedTcpClose`).
    pub fn append(&self, cpu: u32, conn: ClosedConn, telemetry: &Telemetry) -> bool {
        let Some(slot) = self.batches.get(cpu as usize) else {
            telemetry.incr(TelemetryCounter::MissedTcpClose);
            return false;
        };
        let Ok(mut batch) = try_lock_bounded(slot) else {
            trace!("close batch of cpu {} busy", cpu);
            telemetry.incr(TelemetryCounter::MissedTcpClose);
            return false;
        };

        if !batch.push(conn) {
            telemetry.incr(TelemetryCounter::MissedTcpClose);
            return false;
        }
        if batch.len() >= self.batch_size {
            self.flush_locked(&mut batch, telemetry);
        }
        true
    }

    /// Push out whatever `cpu` has queued; returns the records delivered
    pub fn flush_cpu(&self, cpu: u32, telemetry: &Telemetry) -> usize {
        let Some(slot) = self.batches.get(cpu as usize) else {
            return 0;
        };
        match try_lock_bounded(slot) {
            Ok(mut batch) => self.flush_locked(&mut batch, telemetry),
            // The owning CPU is appending; its batch will be picked up next tick
            Err(_) => 0,
        }
    }

    /// External flush trigger: push out every non-empty batch
    pub fn flush_all(&self, telemetry: &Telemetry) -> usize {
        (0..self.num_cpus())
            .map(|cpu| self.flush_cpu(cpu, telemetry))
            .sum()
    }

    /// Records waiting in `cpu`'s batch
    pub fn pending(&self, cpu: u32) -> usize {
        self.batches
            .get(cpu as usize)
            .and_then(|slot| try_lock_bounded(slot).ok())
            .map(|batch| batch.len())
            .unwrap_or(0)
    }

    fn flush_locked(&self, batch: &mut CloseBatch, telemetry: &Telemetry) -> usize {
        if batch.is_empty() {
            return 0;
        }

        let n = batch.len();
        let delivered = match self.channel.output(batch.cpu, *batch) {
            Ok(()) => {
                trace!("flushed {} closed connections from cpu {}", n, batch.cpu);
                n
            }
            Err(err) => {
                debug!("dropping batch of {} closed connections: {}", n, err);
                telemetry.incr(TelemetryCounter::CloseBatchLost);
                telemetry.add(TelemetryCounter::ClosedConnsLost, n as u64);
                0
            }
        };
        batch.clear();
        delivered
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn closed(n: u64) -> ClosedConn {
        let mut conn = ClosedConn::ZERO;
        conn.closed_ns = n;
        conn
    }

    fn drain(readers: &mut CloseEventReaders, cpu: u32) -> Vec<CloseBatch> {
        let ring = readers.ring_mut(cpu).unwrap();
        let mut out = Vec::new();
        while let Ok(batch) = ring.try_recv() {
            out.push(batch);
        }
        out
    }

    #[test]
    fn test_full_batch_flushes_eagerly() {
        let (channel, mut readers) = PerfEventChannel::new(2, 16);
        let batcher = CloseBatcher::new(channel, 3);
        let t = Telemetry::new();

        for n in 0..7 {
            assert!(batcher.append(1, closed(n), &t));
        }

        let batches = drain(&mut readers, 1);
        assert_eq!(batches.len(), 2);
        assert!(batches.iter().all(|b| b.len() == 3 && b.cpu == 1));
        assert_eq!(batcher.pending(1), 1);
        assert!(drain(&mut readers, 0).is_empty());
    }

    #[test]
    fn test_timer_flush_delivers_partial_batch() {
        let (channel, mut readers) = PerfEventChannel::new(2, 16);
        let batcher = CloseBatcher::new(channel, 4);
        let t = Telemetry::new();

        batcher.append(0, closed(1), &t);
        batcher.append(1, closed(2), &t);
        batcher.append(1, closed(3), &t);

        assert_eq!(batcher.flush_all(&t), 3);
        assert_eq!(batcher.pending(0), 0);
        assert_eq!(batcher.pending(1), 0);

        let cpu1 = drain(&mut readers, 1);
        assert_eq!(cpu1.len(), 1);
        let order: Vec<u64> = cpu1[0].as_slice().iter().map(|c| c.closed_ns).collect();
        assert_eq!(order, vec![2, 3]);

        // Nothing left, nothing sent
        assert_eq!(batcher.flush_all(&t), 0);
        assert!(drain(&mut readers, 0).len() == 1);
    }

    #[test]
    fn test_full_ring_drops_and_counts() {
        let (channel, mut readers) = PerfEventChannel::new(1, 1);
        let batcher = CloseBatcher::new(channel, 2);
        let t = Telemetry::new();

        for n in 0..6 {
            batcher.append(0, closed(n), &t);
        }

        // One batch fits in the ring, the next two are dropped
        assert_eq!(drain(&mut readers, 0).len(), 1);
        assert_eq!(t.get(TelemetryCounter::CloseBatchLost), 2);
        assert_eq!(t.get(TelemetryCounter::ClosedConnsLost), 4);
        assert_eq!(batcher.pending(0), 0);
    }

    #[test]
    fn test_closed_ring_counts_loss() {
        let (channel, readers) = PerfEventChannel::new(1, 4);
        let batcher = CloseBatcher::new(channel, 1);
        let t = Telemetry::new();
        drop(readers);

        assert!(batcher.append(0, closed(1), &t));
        assert_eq!(t.get(TelemetryCounter::CloseBatchLost), 1);
    }

    #[test]
    fn test_unknown_cpu_is_counted() {
        let (channel, _readers) = PerfEventChannel::new(2, 4);
        let batcher = CloseBatcher::new(channel, 4);
        let t = Telemetry::new();

        assert!(!batcher.append(9, closed(1), &t));
        assert_eq!(t.get(TelemetryCounter::MissedTcpClose), 1);
        assert_eq!(batcher.flush_cpu(9, &t), 0);
    }
}
