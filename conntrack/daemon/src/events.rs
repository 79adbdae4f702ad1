//! Event processing from the close notification rings
//!
//! Handles draining the per-CPU rings asynchronously and the periodic work the
//! tracker expects from its consumer: timer flushes, port binding polls and
//! telemetry reports.

use crate::collector::MetricsCollector;
use crate::types::tuple_to_string;
use conntrack_common::TelemetryCounter;
use conntrack_tracer::{CloseEventReaders, TelemetrySnapshot, Tracer};
use log::{debug, info, warn};
use std::{sync::Arc, time::Duration};
use tokio::{
    sync::{watch, Mutex},
    task::JoinHandle,
    time::interval,
};

/// Event processor owning the consumer-side tasks
pub struct EventProcessor {
    tracer: Arc<Tracer>,
    collector: Arc<Mutex<MetricsCollector>>,
    verbose: bool,
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl EventProcessor {
    /// Create a new event processor
    ///
    /// # Arguments
    ///
    /// * `tracer` - Tracker whose tables are polled and flushed
    /// * `collector` - Shared metrics collector
    /// * `verbose` - Log every closed connection
    pub fn new(tracer: Arc<Tracer>, collector: Arc<Mutex<MetricsCollector>>, verbose: bool) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            tracer,
            collector,
            verbose,
            shutdown,
            tasks: Vec::new(),
        }
    }

    /// Spawn per-CPU ring readers
    ///
    /// Creates a task for each CPU that moves delivered batches into the
    /// collector. On shutdown a reader drains what its ring still holds.
    pub fn spawn_cpu_readers(&mut self, readers: CloseEventReaders) {
        info!("Spawning event readers for {} CPUs", readers.len());

        for (cpu_id, mut ring) in readers.into_rings().into_iter().enumerate() {
            let collector = Arc::clone(&self.collector);
            let mut shutdown = self.shutdown.subscribe();
            let verbose = self.verbose;

            self.tasks.push(tokio::spawn(async move {
                loop {
                    tokio::select! {
                        batch = ring.recv() => {
                            let Some(batch) = batch else {
                                break;
                            };
                            if verbose {
                                for conn in batch.as_slice() {
                                    debug!(
                                        "Closed: {} pid {} sent {} recv {}",
                                        tuple_to_string(&conn.tuple),
                                        conn.tuple.pid,
                                        conn.conn_stats.sent_bytes,
                                        conn.conn_stats.recv_bytes
                                    );
                                }
                            }
                            collector.lock().await.add_batch(&batch);
                        }
                        _ = shutdown.changed() => {
                            let mut collector = collector.lock().await;
                            while let Ok(batch) = ring.try_recv() {
                                collector.add_batch(&batch);
                            }
                            break;
                        }
                    }
                }
                debug!("Reader for CPU {} stopped", cpu_id);
            }));
        }
    }

    /// Spawn the timer that flushes partially filled close batches
    pub fn spawn_flush_timer(&mut self, interval_ms: u64) {
        let tracer = Arc::clone(&self.tracer);
        let mut shutdown = self.shutdown.subscribe();

        self.tasks.push(tokio::spawn(async move {
            let mut ticker = interval(Duration::from_millis(interval_ms));

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        tracer.flush_close_batches();
                    }
                    _ = shutdown.changed() => break,
                }
            }
        }));
    }

    /// Spawn the port binding poller
    ///
    /// Records binding states and deletes CLOSED entries.
    pub fn spawn_port_poller(&mut self, interval_secs: u64) {
        let tracer = Arc::clone(&self.tracer);
        let collector = Arc::clone(&self.collector);
        let mut shutdown = self.shutdown.subscribe();

        self.tasks.push(tokio::spawn(async move {
            let mut ticker = interval(Duration::from_secs(interval_secs));

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        collector.lock().await.poll_ports(&tracer);
                    }
                    _ = shutdown.changed() => break,
                }
            }
        }));
    }

    /// Spawn progress reporter
    ///
    /// Periodically reports collection progress and warns about losses
    /// counted since the previous report.
    pub fn spawn_progress_reporter(&mut self, interval_secs: u64) {
        let tracer = Arc::clone(&self.tracer);
        let collector = Arc::clone(&self.collector);
        let mut shutdown = self.shutdown.subscribe();

        self.tasks.push(tokio::spawn(async move {
            let mut ticker = interval(Duration::from_secs(interval_secs));
            let mut last = TelemetrySnapshot::default();

            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = shutdown.changed() => break,
                }

                let snapshot = tracer.telemetry_snapshot();
                report_losses(&snapshot.delta_since(&last));
                last = snapshot;

                let collector = collector.lock().await;
                info!(
                    "Progress: {} closed connections in {} batches, {} active, {} port bindings",
                    collector.closed_count(),
                    collector.batch_count(),
                    tracer.connections().conn_len(),
                    collector.port_count()
                );
            }
        }));
    }

    /// Stop every task, letting ring readers drain first
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for task in self.tasks {
            if let Err(e) = task.await {
                warn!("Consumer task failed: {}", e);
            }
        }
    }
}

fn report_losses(delta: &TelemetrySnapshot) {
    if delta.total_losses() == 0 {
        return;
    }
    for (counter, value) in delta.iter() {
        if value > 0 && counter != TelemetryCounter::UdpSendProcessed {
            warn!("{}: +{}", counter.name(), value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conntrack_common::{ConnTuple, Protocol};
    use conntrack_tracer::{HookContext, HookEvent, TracerConfig};

    fn tracer(batch_size: usize) -> (Arc<Tracer>, CloseEventReaders) {
        let (tracer, readers) = Tracer::new(TracerConfig {
            num_cpus: 2,
            max_tracked_connections: 64,
            close_batch_size: batch_size,
            ..TracerConfig::default()
        })
        .unwrap();
        (Arc::new(tracer), readers)
    }

    fn close_one(tracer: &Tracer, cpu: u32, sport: u16) {
        let ctx = HookContext::new(10, 10, cpu, 1, sport as u64);
        let tuple = ConnTuple::ipv4(1, sport, 2, 80, 1, Protocol::Tcp);
        tracer.dispatch(
            &ctx,
            &HookEvent::TcpSendmsg {
                tuple: Some(tuple),
                sent: 100,
                packets: 1,
                rtt: 0,
                rtt_var: 0,
            },
        );
        tracer.dispatch(&ctx, &HookEvent::TcpClose { tuple: Some(tuple) });
    }

    #[tokio::test]
    async fn test_readers_drain_on_shutdown() {
        let (tracer, readers) = tracer(2);
        let collector = Arc::new(Mutex::new(MetricsCollector::new()));
        let mut processor = EventProcessor::new(Arc::clone(&tracer), Arc::clone(&collector), false);
        processor.spawn_cpu_readers(readers);

        for sport in 0..3 {
            close_one(&tracer, 0, sport);
        }
        close_one(&tracer, 1, 100);

        // Final flush before stopping, as the daemon does
        tracer.flush_close_batches();
        processor.shutdown().await;

        let collector = collector.lock().await;
        assert_eq!(collector.closed_count(), 4);
        assert_eq!(collector.batch_count(), 3);
    }

    #[tokio::test]
    async fn test_flush_timer_delivers_partial_batches() {
        let (tracer, readers) = tracer(8);
        let collector = Arc::new(Mutex::new(MetricsCollector::new()));
        let mut processor = EventProcessor::new(Arc::clone(&tracer), Arc::clone(&collector), false);
        processor.spawn_cpu_readers(readers);
        processor.spawn_flush_timer(5);

        close_one(&tracer, 1, 7);
        tokio::time::sleep(Duration::from_millis(50)).await;
        processor.shutdown().await;

        assert_eq!(collector.lock().await.closed_count(), 1);
        assert_eq!(tracer.batcher().pending(1), 0);
    }
}
