//! Metrics exporters
//!
//! Provides different exporters for the tracker report (JSON, Prometheus)

use crate::types::TrackerMetrics;
use anyhow::{Context, Result};
use std::{
    fmt::Write as _,
    fs::File,
    io::Write,
    path::{Path, PathBuf},
};

/// Trait for metrics exporters
pub trait MetricsExporter {
    /// Export the report
    fn export(&self, metrics: &TrackerMetrics) -> Result<()>;
}

/// Export format type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExporterType {
    /// JSON format
    Json,
    /// Prometheus text format
    Prometheus,
}

impl ExporterType {
    pub fn parse(format: &str) -> Option<Self> {
        match format.to_lowercase().as_str() {
            "json" => Some(ExporterType::Json),
            "prometheus" | "prom" => Some(ExporterType::Prometheus),
            _ => None,
        }
    }
}

fn write_output(path: &Path, data: &str) -> Result<()> {
    let mut file = File::create(path)
        .with_context(|| format!("Failed to create output file: {:?}", path))?;

    file.write_all(data.as_bytes())
        .with_context(|| format!("Failed to write to output file: {:?}", path))?;

    Ok(())
}

/// JSON exporter
pub struct JsonExporter {
    output_path: PathBuf,
    pretty: bool,
}

impl JsonExporter {
    /// Create a new JSON exporter
    ///
    /// # Arguments
    ///
    /// * `output_path` - Path to output file
    /// * `pretty` - Enable pretty-printing
    pub fn new(output_path: PathBuf, pretty: bool) -> Self {
        Self {
            output_path,
            pretty,
        }
    }
}

impl MetricsExporter for JsonExporter {
    fn export(&self, metrics: &TrackerMetrics) -> Result<()> {
        let json = if self.pretty {
            serde_json::to_string_pretty(metrics)?
        } else {
            serde_json::to_string(metrics)?
        };

        write_output(&self.output_path, &json)
    }
}

/// Prometheus exporter
pub struct PrometheusExporter {
    output_path: PathBuf,
}

impl PrometheusExporter {
    /// Create a new Prometheus exporter
    pub fn new(output_path: PathBuf) -> Self {
        Self { output_path }
    }

    /// Convert the report to Prometheus text format
    fn to_prometheus_format(metrics: &TrackerMetrics) -> String {
        let mut output = String::new();

        // Writing to a String cannot fail
        let _ = Self::write_metrics(&mut output, metrics);
        output
    }

    fn write_metrics(out: &mut String, metrics: &TrackerMetrics) -> std::fmt::Result {
        writeln!(out, "# HELP conntrack_closed_connections_total Closed connections received")?;
        writeln!(out, "# TYPE conntrack_closed_connections_total counter")?;
        writeln!(out, "conntrack_closed_connections_total {}", metrics.closed_connections.len())?;
        writeln!(out)?;

        writeln!(out, "# HELP conntrack_active_connections Rows in the per-process statistics table")?;
        writeln!(out, "# TYPE conntrack_active_connections gauge")?;
        writeln!(out, "conntrack_active_connections {}", metrics.active_connections)?;
        writeln!(out)?;

        writeln!(out, "# HELP conntrack_duration_seconds Duration of collection period")?;
        writeln!(out, "# TYPE conntrack_duration_seconds gauge")?;
        writeln!(out, "conntrack_duration_seconds {}", metrics.duration_seconds)?;
        writeln!(out)?;

        // Traffic of closed connections
        let totals = &metrics.totals;
        writeln!(out, "# HELP conntrack_bytes_total Bytes carried by closed connections")?;
        writeln!(out, "# TYPE conntrack_bytes_total counter")?;
        writeln!(out, "conntrack_bytes_total{{direction=\"sent\"}} {}", totals.sent_bytes)?;
        writeln!(out, "conntrack_bytes_total{{direction=\"recv\"}} {}", totals.recv_bytes)?;
        writeln!(out)?;
        writeln!(out, "# HELP conntrack_packets_total Packets carried by closed connections")?;
        writeln!(out, "# TYPE conntrack_packets_total counter")?;
        writeln!(out, "conntrack_packets_total{{direction=\"sent\"}} {}", totals.sent_packets)?;
        writeln!(out, "conntrack_packets_total{{direction=\"recv\"}} {}", totals.recv_packets)?;
        writeln!(out)?;
        writeln!(out, "# HELP conntrack_retransmits_total TCP retransmits of closed connections")?;
        writeln!(out, "# TYPE conntrack_retransmits_total counter")?;
        writeln!(out, "conntrack_retransmits_total {}", totals.retransmits)?;
        writeln!(out)?;

        writeln!(out, "# HELP conntrack_close_batches_total Close batches received per CPU")?;
        writeln!(out, "# TYPE conntrack_close_batches_total counter")?;
        for (cpu, count) in &metrics.flushes_by_cpu {
            writeln!(out, "conntrack_close_batches_total{{cpu=\"{}\"}} {}", cpu, count)?;
        }
        writeln!(out)?;

        writeln!(out, "# HELP conntrack_port_binding Last observed port binding state (1 = listening)")?;
        writeln!(out, "# TYPE conntrack_port_binding gauge")?;
        for binding in &metrics.port_bindings {
            writeln!(
                out,
                "conntrack_port_binding{{protocol=\"{}\",netns=\"{}\",port=\"{}\"}} {}",
                binding.protocol,
                binding.netns,
                binding.port,
                u8::from(binding.state == "listening")
            )?;
        }
        writeln!(out)?;

        writeln!(out, "# HELP conntrack_telemetry_total Tracker telemetry counters")?;
        writeln!(out, "# TYPE conntrack_telemetry_total counter")?;
        for (name, value) in &metrics.telemetry {
            writeln!(out, "conntrack_telemetry_total{{counter=\"{}\"}} {}", name, value)?;
        }
        writeln!(out)
    }
}

impl MetricsExporter for PrometheusExporter {
    fn export(&self, metrics: &TrackerMetrics) -> Result<()> {
        write_output(&self.output_path, &Self::to_prometheus_format(metrics))
    }
}
