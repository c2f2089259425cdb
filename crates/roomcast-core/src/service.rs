//! The hub service.
//!
//! A single task owns the [`PresenceHub`] and applies commands one at a time,
//! in the order they were sent. Connection tasks hold a [`HubHandle`] and
//! never touch room state directly, so every registry mutation and group
//! change is serialized without locks.

use crate::connection::ConnectionId;
use crate::groups::{EventSink, EventStream, GroupRegistry};
use crate::hub::{HubError, HubStats, PresenceHub};
use crate::registry::RoomName;
use roomcast_protocol::ClientEvent;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Service errors.
#[derive(Debug, Error)]
pub enum ServiceError {
    /// The hub task is no longer running.
    #[error("Hub service has stopped")]
    Closed,
}

/// A command for the hub task.
#[derive(Debug)]
pub enum HubCommand {
    /// A connection was established.
    Connect {
        id: ConnectionId,
        sink: EventSink,
    },
    /// A connection sent an event.
    Event { id: ConnectionId, event: ClientEvent },
    /// A connection went away.
    Disconnect { id: ConnectionId },
    /// Report statistics.
    Stats { reply: oneshot::Sender<HubStats> },
    /// Report the number of occupied rooms.
    ActiveRooms { reply: oneshot::Sender<usize> },
    /// Prune empty rooms, reporting the removed names.
    Prune {
        reply: oneshot::Sender<Vec<RoomName>>,
    },
}

/// Cloneable handle to the hub task.
#[derive(Debug, Clone)]
pub struct HubHandle {
    tx: mpsc::UnboundedSender<HubCommand>,
}

impl HubHandle {
    /// Register a connection and get the stream of events addressed to it.
    ///
    /// # Errors
    ///
    /// Returns an error if the hub task has stopped.
    pub fn connect(&self, id: ConnectionId) -> Result<EventStream, ServiceError> {
        let (sink, stream) = mpsc::unbounded_channel();
        self.send(HubCommand::Connect { id, sink })?;
        Ok(stream)
    }

    /// Forward an event received from a connection.
    ///
    /// # Errors
    ///
    /// Returns an error if the hub task has stopped.
    pub fn dispatch(&self, id: ConnectionId, event: ClientEvent) -> Result<(), ServiceError> {
        self.send(HubCommand::Event { id, event })
    }

    /// Tell the hub a connection went away.
    ///
    /// # Errors
    ///
    /// Returns an error if the hub task has stopped.
    pub fn disconnect(&self, id: ConnectionId) -> Result<(), ServiceError> {
        self.send(HubCommand::Disconnect { id })
    }

    /// Get hub statistics.
    ///
    /// # Errors
    ///
    /// Returns an error if the hub task has stopped.
    pub async fn stats(&self) -> Result<HubStats, ServiceError> {
        let (reply, rx) = oneshot::channel();
        self.send(HubCommand::Stats { reply })?;
        rx.await.map_err(|_| ServiceError::Closed)
    }

    /// Get the number of rooms with at least one occupant.
    ///
    /// # Errors
    ///
    /// Returns an error if the hub task has stopped.
    pub async fn active_rooms(&self) -> Result<usize, ServiceError> {
        let (reply, rx) = oneshot::channel();
        self.send(HubCommand::ActiveRooms { reply })?;
        rx.await.map_err(|_| ServiceError::Closed)
    }

    /// Prune empty rooms.
    ///
    /// # Errors
    ///
    /// Returns an error if the hub task has stopped.
    pub async fn prune(&self) -> Result<Vec<RoomName>, ServiceError> {
        let (reply, rx) = oneshot::channel();
        self.send(HubCommand::Prune { reply })?;
        rx.await.map_err(|_| ServiceError::Closed)
    }

    fn send(&self, command: HubCommand) -> Result<(), ServiceError> {
        self.tx.send(command).map_err(|_| ServiceError::Closed)
    }
}

/// Spawn the hub task.
///
/// The task runs until every [`HubHandle`] has been dropped.
#[must_use]
pub fn spawn() -> (HubHandle, JoinHandle<()>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let hub = PresenceHub::new(GroupRegistry::new());
    let task = tokio::spawn(run(hub, rx));
    (HubHandle { tx }, task)
}

async fn run(mut hub: PresenceHub<GroupRegistry>, mut rx: mpsc::UnboundedReceiver<HubCommand>) {
    info!("Hub service started");

    while let Some(command) = rx.recv().await {
        apply(&mut hub, command);
    }

    info!("Hub service stopped");
}

fn apply(hub: &mut PresenceHub<GroupRegistry>, command: HubCommand) {
    match command {
        HubCommand::Connect { id, sink } => {
            // The sink of a live connection must stay attached.
            if hub.current_room(&id).is_some() {
                warn!(connection = %id, "Connection already registered, dropping new sink");
                return;
            }
            hub.transport_mut().attach(id.clone(), sink);
            hub.connect(id);
        }

        HubCommand::Event { id, event } => {
            let name = event.name();
            match hub.handle(&id, event) {
                Ok(()) => {}
                Err(e @ HubError::UnknownConnection(_)) => {
                    warn!(connection = %id, event = name, error = %e, "Event dropped");
                }
                Err(e) => {
                    debug!(connection = %id, event = name, error = %e, "Event rejected");
                }
            }
        }

        HubCommand::Disconnect { id } => {
            if hub.disconnect(&id).is_none() {
                warn!(connection = %id, "Disconnect of unknown connection");
            }
            hub.transport_mut().detach(&id);
        }

        HubCommand::Stats { reply } => {
            let _ = reply.send(hub.stats());
        }

        HubCommand::ActiveRooms { reply } => {
            let _ = reply.send(hub.active_rooms());
        }

        HubCommand::Prune { reply } => {
            let pruned = hub.prune_empty_rooms();
            if !pruned.is_empty() {
                debug!(rooms = pruned.len(), "Pruned empty rooms");
            }
            let _ = reply.send(pruned);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::GLOBAL_ROOM;
    use roomcast_protocol::ServerEvent;
    use serde_json::json;

    #[tokio::test]
    async fn test_service_round_trip() {
        let (hub, _task) = spawn();

        let a = ConnectionId::from("a");
        let b = ConnectionId::from("b");
        let mut rx_a = hub.connect(a.clone()).unwrap();
        let mut rx_b = hub.connect(b.clone()).unwrap();

        assert_eq!(*rx_a.recv().await.unwrap(), ServerEvent::Count(1));
        assert_eq!(*rx_a.recv().await.unwrap(), ServerEvent::Count(2));
        assert_eq!(*rx_b.recv().await.unwrap(), ServerEvent::Count(2));

        hub.dispatch(a.clone(), ClientEvent::create("Lobby")).unwrap();
        assert_eq!(*rx_b.recv().await.unwrap(), ServerEvent::Count(1));
        assert_eq!(
            *rx_a.recv().await.unwrap(),
            ServerEvent::Created("lobby".into())
        );
        assert_eq!(*rx_a.recv().await.unwrap(), ServerEvent::Count(1));

        hub.dispatch(b.clone(), ClientEvent::join("LOBBY")).unwrap();
        assert_eq!(
            *rx_b.recv().await.unwrap(),
            ServerEvent::Joined("lobby".into())
        );
        assert_eq!(*rx_b.recv().await.unwrap(), ServerEvent::Count(2));
        assert_eq!(*rx_a.recv().await.unwrap(), ServerEvent::Count(2));

        hub.dispatch(b.clone(), ClientEvent::message(json!({"x": 1})))
            .unwrap();
        assert_eq!(
            *rx_a.recv().await.unwrap(),
            ServerEvent::Message(json!({"x": 1}))
        );

        let stats = hub.stats().await.unwrap();
        assert_eq!(stats.connections, 2);
        let lobby = stats.rooms.iter().find(|r| r.name == "lobby").unwrap();
        assert_eq!(lobby.count, 2);
    }

    #[tokio::test]
    async fn test_service_disconnect_and_prune() {
        let (hub, _task) = spawn();

        let a = ConnectionId::from("a");
        let _rx_a = hub.connect(a.clone()).unwrap();
        hub.dispatch(a.clone(), ClientEvent::create("r1")).unwrap();
        hub.disconnect(a).unwrap();

        assert_eq!(hub.prune().await.unwrap(), vec!["r1".to_string()]);

        let stats = hub.stats().await.unwrap();
        assert_eq!(stats.connections, 0);
        assert_eq!(stats.rooms.len(), 1);
        assert_eq!(stats.rooms[0].name, GLOBAL_ROOM);
    }

    #[tokio::test]
    async fn test_service_rejection_reaches_client() {
        let (hub, _task) = spawn();

        let a = ConnectionId::from("a");
        let mut rx_a = hub.connect(a.clone()).unwrap();
        rx_a.recv().await.unwrap();

        hub.dispatch(a, ClientEvent::join("ghost")).unwrap();
        assert_eq!(
            *rx_a.recv().await.unwrap(),
            ServerEvent::error("Room not found")
        );
    }

    #[tokio::test]
    async fn test_service_duplicate_connect_keeps_first_sink() {
        let (hub, _task) = spawn();

        let a = ConnectionId::from("a");
        let mut rx_first = hub.connect(a.clone()).unwrap();
        let mut rx_second = hub.connect(a.clone()).unwrap();
        assert_eq!(*rx_first.recv().await.unwrap(), ServerEvent::Count(1));

        // The hub dropped the second sink without registering anything.
        assert!(rx_second.recv().await.is_none());

        hub.dispatch(a, ClientEvent::create("r1")).unwrap();
        assert_eq!(
            *rx_first.recv().await.unwrap(),
            ServerEvent::Created("r1".into())
        );
        assert_eq!(hub.stats().await.unwrap().connections, 1);
    }

    #[tokio::test]
    async fn test_service_active_rooms() {
        let (hub, _task) = spawn();
        assert_eq!(hub.active_rooms().await.unwrap(), 0);

        let a = ConnectionId::from("a");
        let b = ConnectionId::from("b");
        let _rx_a = hub.connect(a.clone()).unwrap();
        let _rx_b = hub.connect(b).unwrap();
        assert_eq!(hub.active_rooms().await.unwrap(), 1);

        hub.dispatch(a.clone(), ClientEvent::create("r1")).unwrap();
        assert_eq!(hub.active_rooms().await.unwrap(), 2);

        hub.disconnect(a).unwrap();
        assert_eq!(hub.active_rooms().await.unwrap(), 1);
    }
}
