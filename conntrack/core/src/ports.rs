//! Listening port registry
//!
//! One table per protocol, keyed by (namespace, port). An entry is created or
//! overwritten as LISTENING when a bind/accept succeeds, and flipped to CLOSED
//! when the owning socket is destroyed. Entries are never deleted here: the
//! consumer polls on its own interval and removes CLOSED entries once it has
//! seen them.

use std::sync::atomic::AtomicU8;

use conntrack_common::{PortBindingKey, PortState, Protocol, TelemetryCounter};
use log::trace;

use crate::{
    error::{ConfigError, MapError},
    map::{CapacityPolicy, FixedMap, UpdateFlag},
    telemetry::Telemetry,
};

pub struct PortBindingRegistry {
    tcp: FixedMap<PortBindingKey, AtomicU8>,
    udp: FixedMap<PortBindingKey, AtomicU8>,
}

impl PortBindingRegistry {
    pub fn new(max_entries: u32) -> Result<Self, ConfigError> {
        Ok(Self {
            tcp: FixedMap::new("port_bindings", max_entries, CapacityPolicy::Reject)?,
            udp: FixedMap::new("udp_port_bindings", max_entries, CapacityPolicy::Reject)?,
        })
    }

    fn table(&self, protocol: Protocol) -> &FixedMap<PortBindingKey, AtomicU8> {
        match protocol {
            Protocol::Tcp => &self.tcp,
            Protocol::Udp => &self.udp,
        }
    }

    /// Absent or CLOSED or LISTENING -> LISTENING
    ///
    /// Returns false when a new key did not fit (counted).
    pub fn mark_listening(
        &self,
        protocol: Protocol,
        key: PortBindingKey,
        telemetry: &Telemetry,
    ) -> bool {
        match self
            .table(protocol)
            .insert(&key, &(PortState::Listening as u8), UpdateFlag::Any)
        {
            Ok(_) => true,
            Err(err) => {
                trace!(
                    "{} port {} in netns {} not recorded: {}",
                    protocol.as_str(),
                    key.port,
                    key.netns,
                    err
                );
                telemetry.incr(TelemetryCounter::PortBindingDropped);
                false
            }
        }
    }

    /// LISTENING -> CLOSED; a port that was never recorded stays absent
    ///
    /// A close lost to a busy bucket leaves the entry LISTENING, so it is
    /// counted like a dropped binding.
    pub fn mark_closed(
        &self,
        protocol: Protocol,
        key: PortBindingKey,
        telemetry: &Telemetry,
    ) -> bool {
        match self
            .table(protocol)
            .insert(&key, &(PortState::Closed as u8), UpdateFlag::Exist)
        {
            Ok(_) => true,
            Err(MapError::NotFound) => false,
            Err(err) => {
                trace!("{} port {} close not recorded: {}", protocol.as_str(), key.port, err);
                telemetry.incr(TelemetryCounter::PortBindingDropped);
                false
            }
        }
    }

    pub fn get(&self, protocol: Protocol, key: &PortBindingKey) -> Option<PortState> {
        self.table(protocol)
            .lookup(key)
            .and_then(PortState::from_u8)
    }

    /// Consumer-side snapshot of one protocol's bindings
    pub fn entries(&self, protocol: Protocol) -> Vec<(PortBindingKey, PortState)> {
        self.table(protocol)
            .entries()
            .into_iter()
            .filter_map(|(key, raw)| PortState::from_u8(raw).map(|state| (key, state)))
            .collect()
    }

    /// Consumer-side delete
    pub fn remove(&self, protocol: Protocol, key: &PortBindingKey) -> bool {
        self.table(protocol).remove(key).is_ok()
    }

    pub fn len(&self, protocol: Protocol) -> usize {
        self.table(protocol).len()
    }

    pub fn capacity(&self) -> usize {
        self.tcp.capacity()
    }
}
