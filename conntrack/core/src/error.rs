//! Error types
//!
//! None of these ever reach a hooked system call. `MapError` is how the table
//! model reports a failed operation to the component that owns the table,
//! which turns it into a telemetry increment. `ConfigError` is only returned
//! while the tracer is being built.

use thiserror::Error;

/// Outcome of a failed table operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum MapError {
    /// New key on a table that holds `max_entries` keys (E2BIG)
    #[error("map is full")]
    Full,
    /// `NoExist` update on a key that is present (EEXIST)
    #[error("key already exists")]
    Exists,
    /// `Exist` update or delete on a missing key (ENOENT)
    #[error("key not found")]
    NotFound,
    /// Bucket lock not acquired within the spin bound (EBUSY)
    #[error("bucket is busy")]
    Busy,
}

/// Failed delivery on the close notification channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ChannelError {
    /// The consumer has not drained this CPU's ring
    #[error("ring for cpu {0} is full")]
    Full(u32),
    /// The consumer side has gone away
    #[error("ring for cpu {0} is closed")]
    Closed(u32),
    #[error("no ring for cpu {0}")]
    NoSuchCpu(u32),
}

/// Invalid tracer configuration
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("{table}: max_entries must be between 1 and {max}, got {got}")]
    InvalidCapacity {
        table: &'static str,
        max: u32,
        got: u32,
    },
    #[error("close batch size must be between 1 and {max}, got {got}")]
    InvalidBatchSize { max: usize, got: usize },
    #[error("close channel depth must be at least 1")]
    InvalidChannelDepth,
    #[error("at least one CPU is required")]
    NoCpus,
}
