//! Lossy-condition counters
//!
//! One monotonic counter per [`TelemetryCounter`]. Increments are a single
//! relaxed `fetch_add`; the consumer samples them read-only. Counters are
//! only ever zeroed by building a new tracer.

use std::sync::atomic::{AtomicU64, Ordering};

use conntrack_common::TelemetryCounter;

pub struct Telemetry {
    counters: [AtomicU64; TelemetryCounter::COUNT],
}

impl Telemetry {
    pub fn new() -> Self {
        Self {
            counters: std::array::from_fn(|_| AtomicU64::new(0)),
        }
    }

    #[inline(always)]
    pub fn incr(&self, counter: TelemetryCounter) {
        self.add(counter, 1);
    }

    #[inline(always)]
    pub fn add(&self, counter: TelemetryCounter, n: u64) {
        self.counters[counter.id() as usize].fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(&self, counter: TelemetryCounter) -> u64 {
        self.counters[counter.id() as usize].load(Ordering::Relaxed)
    }

    /// Read every counter without resetting it
    pub fn snapshot(&self) -> TelemetrySnapshot {
        TelemetrySnapshot {
            values: std::array::from_fn(|i| self.counters[i].load(Ordering::Relaxed)),
        }
    }
}

impl Default for Telemetry {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time copy of all counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TelemetrySnapshot {
    values: [u64; TelemetryCounter::COUNT],
}

impl TelemetrySnapshot {
    pub fn get(&self, counter: TelemetryCounter) -> u64 {
        self.values[counter.id() as usize]
    }

    /// Counters paired with their values, in id order
    pub fn iter(&self) -> impl Iterator<Item = (TelemetryCounter, u64)> + '_ {
        TelemetryCounter::ALL.iter().map(|&c| (c, self.get(c)))
    }

    /// Per-counter increase since `earlier`
    pub fn delta_since(&self, earlier: &TelemetrySnapshot) -> TelemetrySnapshot {
        TelemetrySnapshot {
            values: std::array::from_fn(|i| self.values[i].saturating_sub(earlier.values[i])),
        }
    }

    /// Sum of every counter except the ones that track successful work
    pub fn total_losses(&self) -> u64 {
        self.iter()
            .filter(|(c, _)| *c != TelemetryCounter::UdpSendProcessed)
            .map(|(_, v)| v)
            .sum()
    }
}
