//! Event types exchanged at the Roomcast boundary.
//!
//! Every event travels as an envelope of the form
//! `{"event": "<name>", "data": <payload>}`. The event names are part of the
//! public contract and must never change.

use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Event names used on the wire.
pub mod names {
    pub const MESSAGE: &str = "event:message";
    pub const JOIN: &str = "event:join";
    pub const CREATE: &str = "event:create";
    pub const COUNT: &str = "event:count";
    pub const JOINED: &str = "event:joined";
    pub const CREATED: &str = "event:created";
    pub const ERROR: &str = "event:error";
}

/// An event sent by a client to the hub.
///
/// A message envelope without `data` relays `null`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", content = "data")]
pub enum ClientEvent {
    /// Relay an arbitrary payload to the sender's current room.
    #[serde(rename = "event:message")]
    Message(Value),

    /// Switch to an existing room.
    #[serde(rename = "event:join")]
    Join(String),

    /// Create a room and switch to it.
    #[serde(rename = "event:create")]
    Create(String),
}

impl ClientEvent {
    /// Get the wire name of this event.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            ClientEvent::Message(_) => names::MESSAGE,
            ClientEvent::Join(_) => names::JOIN,
            ClientEvent::Create(_) => names::CREATE,
        }
    }

    /// Create a new Message event.
    #[must_use]
    pub fn message(payload: impl Into<Value>) -> Self {
        ClientEvent::Message(payload.into())
    }

    /// Create a new Join event.
    #[must_use]
    pub fn join(room: impl Into<String>) -> Self {
        ClientEvent::Join(room.into())
    }

    /// Create a new Create event.
    #[must_use]
    pub fn create(room: impl Into<String>) -> Self {
        ClientEvent::Create(room.into())
    }
}

/// Inbound envelope, before the event name is resolved.
#[derive(Deserialize)]
struct Envelope {
    event: String,
    #[serde(default)]
    data: Value,
}

impl<'de> Deserialize<'de> for ClientEvent {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let Envelope { event, data } = Envelope::deserialize(deserializer)?;

        match event.as_str() {
            names::MESSAGE => Ok(ClientEvent::Message(data)),
            names::JOIN => room_name(data).map(ClientEvent::Join),
            names::CREATE => room_name(data).map(ClientEvent::Create),
            other => Err(de::Error::unknown_variant(
                other,
                &[names::MESSAGE, names::JOIN, names::CREATE],
            )),
        }
    }
}

fn room_name<E: de::Error>(data: Value) -> Result<String, E> {
    match data {
        Value::String(room) => Ok(room),
        other => Err(de::Error::invalid_type(unexpected(&other), &"a room name")),
    }
}

fn unexpected(value: &Value) -> de::Unexpected<'_> {
    match value {
        Value::Null => de::Unexpected::Unit,
        Value::Bool(b) => de::Unexpected::Bool(*b),
        Value::Number(_) => de::Unexpected::Other("number"),
        Value::String(s) => de::Unexpected::Str(s),
        Value::Array(_) => de::Unexpected::Seq,
        Value::Object(_) => de::Unexpected::Map,
    }
}

/// An event sent by the hub to one or more clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum ServerEvent {
    /// A payload relayed from another member of the room.
    #[serde(rename = "event:message")]
    Message(Value),

    /// The new occupant count of the recipient's room.
    #[serde(rename = "event:count")]
    Count(u64),

    /// Acknowledges a successful join.
    #[serde(rename = "event:joined")]
    Joined(String),

    /// Acknowledges a successful create.
    #[serde(rename = "event:created")]
    Created(String),

    /// A failed join or create.
    #[serde(rename = "event:error")]
    Error(String),
}

impl ServerEvent {
    /// Get the wire name of this event.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            ServerEvent::Message(_) => names::MESSAGE,
            ServerEvent::Count(_) => names::COUNT,
            ServerEvent::Joined(_) => names::JOINED,
            ServerEvent::Created(_) => names::CREATED,
            ServerEvent::Error(_) => names::ERROR,
        }
    }

    /// Create a new Error event.
    #[must_use]
    pub fn error(message: impl Into<String>) -> Self {
        ServerEvent::Error(message.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_client_event_envelope() {
        let join: ClientEvent =
            serde_json::from_value(json!({"event": "event:join", "data": "Lobby"})).unwrap();
        assert_eq!(join, ClientEvent::join("Lobby"));

        let message: ClientEvent =
            serde_json::from_value(json!({"event": "event:message", "data": {"x": 1}})).unwrap();
        assert_eq!(message, ClientEvent::message(json!({"x": 1})));
    }

    #[test]
    fn test_server_event_envelope() {
        assert_eq!(
            serde_json::to_value(ServerEvent::Count(3)).unwrap(),
            json!({"event": "event:count", "data": 3})
        );
        assert_eq!(
            serde_json::to_value(ServerEvent::error("Room not found")).unwrap(),
            json!({"event": "event:error", "data": "Room not found"})
        );
        assert_eq!(
            serde_json::to_value(ServerEvent::Created("r1".into())).unwrap(),
            json!({"event": "event:created", "data": "r1"})
        );
    }

    #[test]
    fn test_unknown_event_rejected() {
        let result: Result<ClientEvent, _> =
            serde_json::from_value(json!({"event": "event:count", "data": 1}));
        assert!(result.is_err());
    }

    #[test]
    fn test_message_without_data_relays_null() {
        let message: ClientEvent =
            serde_json::from_value(json!({"event": "event:message"})).unwrap();
        assert_eq!(message, ClientEvent::Message(Value::Null));
    }

    #[test]
    fn test_join_without_data_rejected() {
        let result: Result<ClientEvent, _> = serde_json::from_value(json!({"event": "event:join"}));
        assert!(result.is_err());
    }

    #[test]
    fn test_join_requires_string() {
        let result: Result<ClientEvent, _> =
            serde_json::from_value(json!({"event": "event:join", "data": 42}));
        assert!(result.is_err());
    }

    #[test]
    fn test_event_names() {
        assert_eq!(ClientEvent::create("x").name(), "event:create");
        assert_eq!(ServerEvent::Joined("x".into()).name(), "event:joined");
    }
}
