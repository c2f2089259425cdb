//! In-memory broadcast groups.
//!
//! Each attached connection owns an unbounded channel; the connection's task
//! drains it and writes to the socket. Groups are plain membership sets.

use crate::connection::ConnectionId;
use crate::transport::Broadcast;
use roomcast_protocol::ServerEvent;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

/// Outbound half of a connection's event channel.
pub type EventSink = mpsc::UnboundedSender<Arc<ServerEvent>>;

/// Receiving half of a connection's event channel.
pub type EventStream = mpsc::UnboundedReceiver<Arc<ServerEvent>>;

/// Broadcast groups backed by per-connection channels.
#[derive(Debug, Default)]
pub struct GroupRegistry {
    /// Outbound channel per attached connection.
    sinks: HashMap<ConnectionId, EventSink>,
    /// Members of each group.
    groups: HashMap<String, HashSet<ConnectionId>>,
    /// Groups of each connection.
    memberships: HashMap<ConnectionId, HashSet<String>>,
}

impl GroupRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the outbound channel of a connection.
    pub fn attach(&mut self, connection: ConnectionId, sink: EventSink) {
        debug!(connection = %connection, "Attached connection");
        self.sinks.insert(connection, sink);
    }

    /// Forget a connection, dropping its channel and any group membership
    /// it still holds.
    pub fn detach(&mut self, connection: &ConnectionId) {
        self.sinks.remove(connection);

        if let Some(groups) = self.memberships.remove(connection) {
            for group in groups {
                self.remove_member(&group, connection);
            }
        }

        debug!(connection = %connection, "Detached connection");
    }

    /// Get the members of a group.
    #[must_use]
    pub fn members(&self, room: &str) -> Vec<ConnectionId> {
        self.groups
            .get(room)
            .map(|members| members.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Number of attached connections.
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.sinks.len()
    }

    /// Number of non-empty groups.
    #[must_use]
    pub fn group_count(&self) -> usize {
        self.groups.len()
    }

    fn remove_member(&mut self, room: &str, connection: &ConnectionId) {
        if let Some(members) = self.groups.get_mut(room) {
            members.remove(connection);
            if members.is_empty() {
                self.groups.remove(room);
            }
        }
    }

    fn deliver(&self, connection: &ConnectionId, event: Arc<ServerEvent>) -> bool {
        match self.sinks.get(connection) {
            Some(sink) => {
                if sink.send(event).is_err() {
                    warn!(connection = %connection, "Outbound channel closed, dropping event");
                    false
                } else {
                    true
                }
            }
            None => {
                warn!(connection = %connection, "No outbound channel for connection");
                false
            }
        }
    }
}

impl Broadcast for GroupRegistry {
    fn join_group(&mut self, connection: &ConnectionId, room: &str) {
        self.groups
            .entry(room.to_string())
            .or_default()
            .insert(connection.clone());
        self.memberships
            .entry(connection.clone())
            .or_default()
            .insert(room.to_string());
    }

    fn leave_group(&mut self, connection: &ConnectionId, room: &str) {
        self.remove_member(room, connection);
        if let Some(groups) = self.memberships.get_mut(connection) {
            groups.remove(room);
        }
    }

    fn send_to(&mut self, connection: &ConnectionId, event: ServerEvent) {
        trace!(connection = %connection, event = event.name(), "Sending event");
        self.deliver(connection, Arc::new(event));
    }

    fn broadcast_to_group(
        &mut self,
        room: &str,
        event: ServerEvent,
        exclude: Option<&ConnectionId>,
    ) -> usize {
        let Some(members) = self.groups.get(room) else {
            return 0;
        };

        let event = Arc::new(event);
        let delivered = members
            .iter()
            .filter(|member| Some(*member) != exclude)
            .filter(|member| self.deliver(member, Arc::clone(&event)))
            .count();

        trace!(room = %room, event = event.name(), recipients = delivered, "Broadcast event");
        delivered
    }

    fn groups_of(&self, connection: &ConnectionId) -> Vec<String> {
        self.memberships
            .get(connection)
            .map(|groups| groups.iter().cloned().collect())
            .unwrap_or_default()
    }
}
