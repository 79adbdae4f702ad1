//! Shared types and constants for the connection tracer
//!
//! This crate provides the key/value layouts of every tracer table and the
//! constants shared between the tracking core and the consumer.

#![cfg_attr(not(test), no_std)]

pub mod constants;
pub mod types;

// Re-export commonly used types
pub use constants::*;
pub use types::{
    BindSyscallArgs, CloseBatch, ClosedConn, ConnStats, ConnTuple, PortBindingKey, PortState,
    Protocol, TcpStats, TelemetryCounter,
};
