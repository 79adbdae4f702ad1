//! Tracker aggregate
//!
//! Owns every table, built once from a single `TracerConfig`. The bound on
//! tracked connections sizes both statistics tables and both port binding
//! tables; the correlation tables keep their own small fixed bounds.

use conntrack_common::{
    CLOSE_BATCH_MAX, DEFAULT_CLOSE_BATCH_SIZE, DEFAULT_CLOSE_CHANNEL_DEPTH,
    DEFAULT_MAX_TRACKED_CONNECTIONS, PENDING_CALLS_MAX, PENDING_UDP_RECV_MAX, UNBOUND_SOCKETS_MAX,
};
use log::{debug, info};

use crate::{
    batch::{CloseBatcher, CloseEventReaders, PerfEventChannel},
    conn::ConnectionTable,
    error::ConfigError,
    hooks::{handler_for, HookContext, HookEvent},
    pending::CallCorrelator,
    ports::PortBindingRegistry,
    telemetry::{Telemetry, TelemetrySnapshot},
};

/// Sizing of every tracer table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TracerConfig {
    /// Capacity of the statistics and port binding tables
    pub max_tracked_connections: u32,
    /// Closed connections per batch before an eager flush
    pub close_batch_size: usize,
    /// Undelivered batches buffered per CPU
    pub close_channel_depth: usize,
    /// Number of CPUs, one batch and one ring each
    pub num_cpus: u32,
    /// Capacity of each pending-call table
    pub pending_calls_max: u32,
    /// Capacity of the unbound socket marker table
    pub unbound_sockets_max: u32,
    /// Capacity of the udp_recvmsg pairing table
    pub pending_udp_recv_max: u32,
}

impl Default for TracerConfig {
    fn default() -> Self {
        let num_cpus = std::thread::available_parallelism()
            .map(|n| n.get() as u32)
            .unwrap_or(1);

        Self {
            max_tracked_connections: DEFAULT_MAX_TRACKED_CONNECTIONS,
            close_batch_size: DEFAULT_CLOSE_BATCH_SIZE,
            close_channel_depth: DEFAULT_CLOSE_CHANNEL_DEPTH,
            num_cpus,
            pending_calls_max: PENDING_CALLS_MAX,
            unbound_sockets_max: UNBOUND_SOCKETS_MAX,
            pending_udp_recv_max: PENDING_UDP_RECV_MAX,
        }
    }
}

impl TracerConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.close_batch_size == 0 || self.close_batch_size > CLOSE_BATCH_MAX {
            return Err(ConfigError::InvalidBatchSize {
                max: CLOSE_BATCH_MAX,
                got: self.close_batch_size,
            });
        }
        if self.close_channel_depth == 0 {
            return Err(ConfigError::InvalidChannelDepth);
        }
        if self.num_cpus == 0 {
            return Err(ConfigError::NoCpus);
        }
        // Table capacities are checked as each table is allocated
        Ok(())
    }
}

pub struct Tracer {
    config: TracerConfig,
    telemetry: Telemetry,
    connections: ConnectionTable,
    correlator: CallCorrelator,
    ports: PortBindingRegistry,
    batcher: CloseBatcher,
}

impl Tracer {
    /// Allocate every table and the close notification rings
    pub fn new(config: TracerConfig) -> Result<(Self, CloseEventReaders), ConfigError> {
        config.validate()?;

        let connections = ConnectionTable::new(config.max_tracked_connections)?;
        let ports = PortBindingRegistry::new(config.max_tracked_connections)?;
        let correlator = CallCorrelator::new(
            config.pending_calls_max,
            config.unbound_sockets_max,
            config.pending_udp_recv_max,
        )?;
        let (channel, readers) =
            PerfEventChannel::new(config.num_cpus, config.close_channel_depth);
        let batcher = CloseBatcher::new(channel, config.close_batch_size);

        info!(
            "Tracer ready: {} tracked connections, {} CPUs, close batches of {}",
            config.max_tracked_connections, config.num_cpus, config.close_batch_size
        );

        Ok((
            Self {
                config,
                telemetry: Telemetry::new(),
                connections,
                correlator,
                ports,
                batcher,
            },
            readers,
        ))
    }

    /// Run the handler registered for the event's trigger point
    pub fn dispatch(&self, ctx: &HookContext, event: &HookEvent) {
        if let Some(handler) = handler_for(event.trigger()) {
            handler(self, ctx, event);
        }
    }

    /// External flush trigger, meant to be driven by a timer
    pub fn flush_close_batches(&self) -> usize {
        let flushed = self.batcher.flush_all(&self.telemetry);
        if flushed > 0 {
            debug!("timer flush delivered {} closed connections", flushed);
        }
        flushed
    }

    pub fn config(&self) -> &TracerConfig {
        &self.config
    }

    pub fn telemetry(&self) -> &Telemetry {
        &self.telemetry
    }

    pub fn telemetry_snapshot(&self) -> TelemetrySnapshot {
        self.telemetry.snapshot()
    }

    pub fn connections(&self) -> &ConnectionTable {
        &self.connections
    }

    pub fn correlator(&self) -> &CallCorrelator {
        &self.correlator
    }

    pub fn ports(&self) -> &PortBindingRegistry {
        &self.ports
    }

    pub fn batcher(&self) -> &CloseBatcher {
        &self.batcher
    }
}
