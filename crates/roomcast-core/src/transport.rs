//! The transport capability the hub drives.
//!
//! The hub never talks to sockets. It tells a [`Broadcast`] implementation
//! which broadcast groups a connection belongs to and where events should go,
//! which keeps the room state machine independent of the wire.

use crate::connection::ConnectionId;
use roomcast_protocol::ServerEvent;

/// Group membership and event delivery, as offered by a realtime transport.
pub trait Broadcast {
    /// Add a connection to a room's broadcast group.
    fn join_group(&mut self, connection: &ConnectionId, room: &str);

    /// Remove a connection from a room's broadcast group.
    fn leave_group(&mut self, connection: &ConnectionId, room: &str);

    /// Send an event to a single connection.
    fn send_to(&mut self, connection: &ConnectionId, event: ServerEvent);

    /// Send an event to every member of a room's broadcast group, optionally
    /// skipping one connection.
    ///
    /// Returns the number of connections the event was handed to.
    fn broadcast_to_group(
        &mut self,
        room: &str,
        event: ServerEvent,
        exclude: Option<&ConnectionId>,
    ) -> usize;

    /// The broadcast groups a connection currently belongs to.
    fn groups_of(&self, connection: &ConnectionId) -> Vec<String>;
}
