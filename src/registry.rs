//! Server-side authoritative maps of advertised channels and services
//! (spec §4.2). Monotonic id allocation, byte-identical reuse checking,
//! nothing else — broadcasting the resulting `advertise`/`unadvertise`
//! frames to connected clients is the Server Session Manager's job
//! (`server.rs`), which is the only thing that also knows about clients.

use std::collections::HashMap;

use crate::error::{ProtocolError, Result};
use crate::protocol::json::{Channel, NewChannel, NewService, Service};

/// The server's channel table: id → descriptor, plus the next id to hand
/// out. Ids start at 1 and are pre-incremented (spec §3: "monotonically
/// increasing from 1").
#[derive(Debug, Default)]
pub struct ChannelRegistry {
    next_id: u32,
    channels: HashMap<u32, Channel>,
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a new channel, always succeeding, and returns the
    /// allocated descriptor.
    ///
    /// Per the open question in spec §9(i), this implementation always
    /// allocates a fresh id rather than attempting to reuse one freed by a
    /// prior `remove_channel` of a byte-identical descriptor — callers who
    /// want reuse should track their own previously-removed ids and pass
    /// them through a higher-level API. [`NewChannel::matches`] is exposed
    /// so such a caller can implement that policy.
    pub fn add_channel(&mut self, new_channel: NewChannel) -> Channel {
        self.next_id += 1;
        let id = self.next_id;
        let channel = new_channel.into_channel(id);
        self.channels.insert(id, channel.clone());
        channel
    }

    pub fn remove_channel(&mut self, id: u32) -> Result<Channel> {
        self.channels.remove(&id).ok_or(ProtocolError::NotFound(id))
    }

    pub fn get(&self, id: u32) -> Option<&Channel> {
        self.channels.get(&id)
    }

    pub fn contains(&self, id: u32) -> bool {
        self.channels.contains_key(&id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Channel> {
        self.channels.values()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }
}

/// The server's service table, gated entirely by capability `services` at
/// the call sites that use it (the registry itself is capability-agnostic).
#[derive(Debug, Default)]
pub struct ServiceRegistry {
    next_id: u32,
    services: HashMap<u32, Service>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_service(&mut self, new_service: NewService) -> Service {
        self.next_id += 1;
        let id = self.next_id;
        let service = new_service.into_service(id);
        self.services.insert(id, service.clone());
        service
    }

    pub fn remove_service(&mut self, id: u32) -> Result<Service> {
        self.services.remove(&id).ok_or(ProtocolError::NotFound(id))
    }

    pub fn get(&self, id: u32) -> Option<&Service> {
        self.services.get(&id)
    }

    pub fn contains(&self, id: u32) -> bool {
        self.services.contains_key(&id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Service> {
        self.services.values()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_channel(topic: &str) -> NewChannel {
        NewChannel {
            topic: topic.to_string(),
            encoding: "json".into(),
            schema_name: "Foo".into(),
            schema: "some data".into(),
            schema_encoding: None,
        }
    }

    #[test]
    fn ids_are_assigned_starting_at_one_and_increase() {
        let mut reg = ChannelRegistry::new();
        let a = reg.add_channel(sample_channel("/a"));
        let b = reg.add_channel(sample_channel("/b"));
        assert_eq!(a.id, 1);
        assert_eq!(b.id, 2);
    }

    #[test]
    fn remove_unknown_channel_fails_with_not_found() {
        let mut reg = ChannelRegistry::new();
        let err = reg.remove_channel(99).unwrap_err();
        assert!(matches!(err, ProtocolError::NotFound(99)));
    }

    #[test]
    fn removed_channel_id_is_gone_from_registry() {
        let mut reg = ChannelRegistry::new();
        let c = reg.add_channel(sample_channel("/a"));
        reg.remove_channel(c.id).unwrap();
        assert!(!reg.contains(c.id));
    }
}
