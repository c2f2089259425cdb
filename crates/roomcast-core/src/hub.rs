//! The presence hub.
//!
//! Every connection is in exactly one room at all times, starting in the
//! global room. Switching rooms always leaves the old room before entering
//! the new one, and each affected room is told its new occupant count.

use crate::connection::{ConnectionId, ConnectionState};
use crate::registry::{RoomName, RoomOccupancy, RoomRegistry, GLOBAL_ROOM};
use crate::transport::Broadcast;
use roomcast_protocol::{ClientEvent, ServerEvent};
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use thiserror::Error;
use tracing::{debug, warn};

/// Hub errors.
///
/// The display strings of the room errors are sent verbatim to clients.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HubError {
    /// Join targeted a room with no occupants.
    #[error("Room not found")]
    RoomNotFound,

    /// Create targeted a room that still has occupants.
    #[error("Room already exists")]
    RoomAlreadyExists,

    /// The connection is not known to the hub.
    #[error("Unknown connection: {0}")]
    UnknownConnection(ConnectionId),
}

/// Hub statistics.
#[derive(Debug, Clone, Serialize)]
pub struct HubStats {
    /// Number of live connections.
    pub connections: usize,
    /// Every room entry and its occupancy.
    pub rooms: Vec<RoomOccupancy>,
}

/// Owns room membership for all connections and drives notifications.
pub struct PresenceHub<B> {
    registry: RoomRegistry,
    connections: HashMap<ConnectionId, ConnectionState>,
    transport: B,
}

impl<B: Broadcast> PresenceHub<B> {
    /// Create a hub with a fresh registry.
    #[must_use]
    pub fn new(transport: B) -> Self {
        Self {
            registry: RoomRegistry::new(),
            connections: HashMap::new(),
            transport,
        }
    }

    /// Get the room registry.
    #[must_use]
    pub fn registry(&self) -> &RoomRegistry {
        &self.registry
    }

    /// Get the transport.
    #[must_use]
    pub fn transport(&self) -> &B {
        &self.transport
    }

    /// Get the transport mutably, e.g. to attach connection channels.
    pub fn transport_mut(&mut self) -> &mut B {
        &mut self.transport
    }

    /// Get the room a connection is in.
    #[must_use]
    pub fn current_room(&self, connection: &ConnectionId) -> Option<&str> {
        self.connections
            .get(connection)
            .map(|state| state.current_room.as_str())
    }

    /// Number of live connections.
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Number of rooms with at least one occupant.
    #[must_use]
    pub fn active_rooms(&self) -> usize {
        self.registry.occupied()
    }

    /// Get hub statistics.
    #[must_use]
    pub fn stats(&self) -> HubStats {
        HubStats {
            connections: self.connections.len(),
            rooms: self.registry.rooms(),
        }
    }

    /// Register a new connection in the global room and tell the room its
    /// new count.
    pub fn connect(&mut self, connection: ConnectionId) {
        if self.connections.contains_key(&connection) {
            warn!(connection = %connection, "Connection already registered");
            return;
        }

        debug!(connection = %connection, "New connection, entering global room");

        self.connections
            .insert(connection.clone(), ConnectionState::new(connection.clone()));
        let count = self.enter(&connection, GLOBAL_ROOM.to_string());
        self.transport
            .broadcast_to_group(GLOBAL_ROOM, ServerEvent::Count(count), None);
    }

    /// Handle an event received from a connection.
    ///
    /// # Errors
    ///
    /// Returns the error that was reported to the connection, if any.
    pub fn handle(&mut self, connection: &ConnectionId, event: ClientEvent) -> Result<(), HubError> {
        match event {
            ClientEvent::Message(payload) => self.message(connection, payload).map(|_| ()),
            ClientEvent::Join(room) => self.join(connection, &room),
            ClientEvent::Create(room) => self.create(connection, &room),
        }
    }

    /// Move a connection into an existing room.
    ///
    /// # Errors
    ///
    /// Returns `RoomNotFound` if the room has no occupants. The error is
    /// also sent to the connection and nothing changes.
    pub fn join(&mut self, connection: &ConnectionId, room: &str) -> Result<(), HubError> {
        let room = room.to_lowercase();
        let current = self.room_of(connection)?;

        if !self.registry.exists(&room) {
            return Err(self.reject(connection, HubError::RoomNotFound));
        }

        debug!(connection = %connection, from = %current, room = %room, "Joining room");

        self.leave(connection, &current);
        let count = self.enter(connection, room.clone());
        self.transport
            .send_to(connection, ServerEvent::Joined(room.clone()));
        self.transport
            .broadcast_to_group(&room, ServerEvent::Count(count), None);

        Ok(())
    }

    /// Create a room and move a connection into it.
    ///
    /// # Errors
    ///
    /// Returns `RoomAlreadyExists` if the room has occupants. The error is
    /// also sent to the connection and nothing changes.
    pub fn create(&mut self, connection: &ConnectionId, room: &str) -> Result<(), HubError> {
        let room = room.to_lowercase();
        let current = self.room_of(connection)?;

        if self.registry.exists(&room) {
            return Err(self.reject(connection, HubError::RoomAlreadyExists));
        }

        debug!(connection = %connection, from = %current, room = %room, "Creating room");

        self.leave(connection, &current);
        let count = self.enter(connection, room.clone());
        self.transport
            .send_to(connection, ServerEvent::Created(room.clone()));
        self.transport
            .broadcast_to_group(&room, ServerEvent::Count(count), None);

        Ok(())
    }

    /// Relay a payload to the other members of the sender's room.
    ///
    /// Returns the number of connections the payload was handed to.
    ///
    /// # Errors
    ///
    /// Returns `UnknownConnection` if the sender is not registered.
    pub fn message(&mut self, connection: &ConnectionId, payload: Value) -> Result<usize, HubError> {
        if !self.connections.contains_key(connection) {
            return Err(HubError::UnknownConnection(connection.clone()));
        }

        let delivered: usize = self
            .transport
            .groups_of(connection)
            .iter()
            .map(|group| {
                self.transport.broadcast_to_group(
                    group,
                    ServerEvent::Message(payload.clone()),
                    Some(connection),
                )
            })
            .sum();

        debug!(connection = %connection, recipients = delivered, "Relayed message");
        Ok(delivered)
    }

    /// Remove a connection from its room and forget it.
    ///
    /// Returns the final state of the connection, if it was registered.
    pub fn disconnect(&mut self, connection: &ConnectionId) -> Option<ConnectionState> {
        let current = self.room_of(connection).ok()?;

        debug!(connection = %connection, room = %current, "Disconnecting");

        self.leave(connection, &current);
        self.connections.remove(connection)
    }

    /// Drop registry entries of rooms that have emptied out.
    pub fn prune_empty_rooms(&mut self) -> Vec<RoomName> {
        self.registry.prune_empty()
    }

    fn room_of(&self, connection: &ConnectionId) -> Result<RoomName, HubError> {
        self.connections
            .get(connection)
            .map(|state| state.current_room.clone())
            .ok_or_else(|| HubError::UnknownConnection(connection.clone()))
    }

    fn reject(&mut self, connection: &ConnectionId, error: HubError) -> HubError {
        debug!(connection = %connection, error = %error, "Rejected room request");
        self.transport
            .send_to(connection, ServerEvent::error(error.to_string()));
        error
    }

    /// Leave a room: drop the group membership, lower the count and tell
    /// whoever remains.
    fn leave(&mut self, connection: &ConnectionId, room: &str) {
        self.transport.leave_group(connection, room);
        let count = self.registry.decrement(room);
        self.transport
            .broadcast_to_group(room, ServerEvent::Count(count), None);
    }

    /// Enter a room: count the connection in, record it as the current room
    /// and add the group membership. Returns the new count.
    fn enter(&mut self, connection: &ConnectionId, room: RoomName) -> u64 {
        self.registry.ensure(&room);
        let count = self.registry.increment(&room);
        self.transport.join_group(connection, &room);
        if let Some(state) = self.connections.get_mut(connection) {
            state.current_room = room;
        }
        count
    }
}
