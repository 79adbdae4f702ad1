//! Connection Tracker Consumer Library
//!
//! Provides reusable components for driving the tracker and consuming what it
//! produces: trace replay, ring readers, port polling and report export.

pub mod collector;
pub mod events;
pub mod exporter;
pub mod replay;
pub mod types;

pub use collector::MetricsCollector;
pub use events::EventProcessor;
pub use exporter::{ExporterType, JsonExporter, MetricsExporter, PrometheusExporter};
pub use replay::{replay, replay_file, ReplayStats};
pub use types::*;
