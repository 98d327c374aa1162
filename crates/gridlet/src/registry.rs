//! Known remote resources and their connection state.
//!
//! Entries are keyed by `machine_id`: a resource that reconnects to the relay
//! under a new `connection_id` updates its entry. An entry exists while at
//! least one of its connection bits is set and is removed when both clear.

use std::collections::{HashMap, HashSet, VecDeque};

use crate::message::{MessageKind, ResourceDescriptor};

/// Connection id of the node's own resource entry.
pub const LOCAL_CONNECTION_ID: &str = "local";

/// Bitfield of live links to a resource.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConnectionState(u8);

impl ConnectionState {
    pub const NONE: Self = Self(0);
    /// Reachable through the relay.
    pub const SIGNALING: Self = Self(1);
    /// Peer data channel open.
    pub const PEER: Self = Self(2);

    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: Self) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: Self) {
        self.0 &= !other.0;
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn bits(self) -> u8 {
        self.0
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Resource {
    pub descriptor: ResourceDescriptor,
    pub state: ConnectionState,
    /// We initiate the peer connection (the remote joined after us).
    pub active: bool,
}

impl Resource {
    pub fn connection_id(&self) -> Option<&str> {
        self.descriptor.connection_id.as_deref()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Discovery {
    Added,
    /// Known machine, possibly under a new connection id.
    Updated,
    /// Our own announcement echoed back.
    Ignored,
}

/// Where a message for a resource should go.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    Local,
    Peer { machine_id: String },
    Relay { connection_id: String },
}

pub struct ResourceRegistry {
    local: ResourceDescriptor,
    resources: HashMap<String, Resource>,
}

impl ResourceRegistry {
    pub fn new(mut local: ResourceDescriptor) -> Self {
        local.connection_id = Some(LOCAL_CONNECTION_ID.to_string());
        Self {
            local,
            resources: HashMap::new(),
        }
    }

    pub fn local(&self) -> &ResourceDescriptor {
        &self.local
    }

    pub fn discover(&mut self, descriptor: ResourceDescriptor, active: bool) -> Discovery {
        if descriptor.machine_id == self.local.machine_id {
            return Discovery::Ignored;
        }
        match self.resources.get_mut(&descriptor.machine_id) {
            Some(existing) => {
                if descriptor.connection_id != existing.descriptor.connection_id {
                    tracing::debug!(
                        machine_id = %descriptor.machine_id,
                        connection_id = ?descriptor.connection_id,
                        "Resource reconnected"
                    );
                }
                existing.descriptor = descriptor;
                existing.state.insert(ConnectionState::SIGNALING);
                Discovery::Updated
            }
            None => {
                tracing::info!(
                    machine_id = %descriptor.machine_id,
                    name = %descriptor.name,
                    capacity = descriptor.capacity,
                    frameworks = ?descriptor.frameworks,
                    "Resource discovered"
                );
                self.resources.insert(
                    descriptor.machine_id.clone(),
                    Resource {
                        descriptor,
                        state: ConnectionState::SIGNALING,
                        active,
                    },
                );
                Discovery::Added
            }
        }
    }

    /// Clear the signaling bit of the resource behind `connection_id`.
    /// Returns the machine id, or `None` if the connection is unknown.
    pub fn signaling_lost(&mut self, connection_id: &str) -> Option<String> {
        let machine_id = self.by_connection(connection_id)?.descriptor.machine_id.clone();
        self.clear(&machine_id, ConnectionState::SIGNALING);
        Some(machine_id)
    }

    /// Record the peer channel of `machine_id` opening or closing.
    /// Returns the new state, `None` if the resource is unknown or was removed.
    pub fn set_peer(&mut self, machine_id: &str, connected: bool) -> Option<ConnectionState> {
        if connected {
            let resource = self.resources.get_mut(machine_id)?;
            resource.state.insert(ConnectionState::PEER);
            return Some(resource.state);
        }
        self.clear(machine_id, ConnectionState::PEER)
    }

    fn clear(&mut self, machine_id: &str, bit: ConnectionState) -> Option<ConnectionState> {
        let resource = self.resources.get_mut(machine_id)?;
        resource.state.remove(bit);
        if resource.state.is_empty() {
            tracing::info!(%machine_id, "Resource removed");
            self.resources.remove(machine_id);
            return None;
        }
        Some(resource.state)
    }

    pub fn get(&self, machine_id: &str) -> Option<&Resource> {
        self.resources.get(machine_id)
    }

    pub fn by_connection(&self, connection_id: &str) -> Option<&Resource> {
        self.resources
            .values()
            .find(|r| r.connection_id() == Some(connection_id))
    }

    /// Machine id for a relay connection id, including our own `local`.
    pub fn machine_for(&self, connection_id: &str) -> Option<&str> {
        if connection_id == LOCAL_CONNECTION_ID {
            return Some(&self.local.machine_id);
        }
        self.by_connection(connection_id)
            .map(|r| r.descriptor.machine_id.as_str())
    }

    /// Peer channel when open, otherwise the relay tagged with the
    /// resource's connection id.
    pub fn route(&self, machine_id: &str) -> Option<Route> {
        if machine_id == self.local.machine_id {
            return Some(Route::Local);
        }
        let resource = self.resources.get(machine_id)?;
        if resource.state.contains(ConnectionState::PEER) {
            return Some(Route::Peer {
                machine_id: machine_id.to_string(),
            });
        }
        resource.connection_id().map(|c| Route::Relay {
            connection_id: c.to_string(),
        })
    }

    pub fn iter(&self) -> impl Iterator<Item = &Resource> {
        self.resources.values()
    }

    pub fn len(&self) -> usize {
        self.resources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }
}

/// Bounded record of processed messages, oldest forgotten first.
///
/// Keyed by message kind and `request_id` so that a job's request and its
/// result are tracked independently.
pub struct ReceivingSet {
    capacity: usize,
    order: VecDeque<(MessageKind, String)>,
    seen: HashSet<(MessageKind, String)>,
}

impl ReceivingSet {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            order: VecDeque::new(),
            seen: HashSet::new(),
        }
    }

    /// Record a message. Returns `false` if it was already recorded.
    pub fn insert(&mut self, kind: MessageKind, request_id: &str) -> bool {
        let key = (kind, request_id.to_string());
        if self.seen.contains(&key) {
            return false;
        }
        if self.order.len() == self.capacity
            && let Some(oldest) = self.order.pop_front()
        {
            self.seen.remove(&oldest);
        }
        self.order.push_back(key.clone());
        self.seen.insert(key);
        true
    }

    pub fn contains(&self, kind: MessageKind, request_id: &str) -> bool {
        self.seen.contains(&(kind, request_id.to_string()))
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}
