//! # roomcast-protocol
//!
//! Wire protocol definitions for the Roomcast presence hub.
//!
//! Clients and the hub exchange named events, each carried as an envelope
//! `{"event": "<name>", "data": <payload>}`:
//!
//! - `event:message` - Relay a payload to the current room (both directions)
//! - `event:join` / `event:create` - Switch rooms (client to hub)
//! - `event:count` - Live occupancy of the recipient's room
//! - `event:joined` / `event:created` / `event:error` - Request outcomes
//!
//! ## Example
//!
//! ```rust
//! use roomcast_protocol::{codec, ClientEvent};
//!
//! let event = ClientEvent::join("lobby");
//!
//! let text = codec::encode_json(&event).unwrap();
//! assert_eq!(text, r#"{"event":"event:join","data":"lobby"}"#);
//!
//! let binary = codec::encode(&event).unwrap();
//! let decoded: ClientEvent = codec::decode(&binary).unwrap();
//! assert_eq!(decoded, event);
//! ```

pub mod codec;
pub mod events;

pub use codec::{decode, encode, Encoded, ProtocolError, WireFormat};
pub use events::{ClientEvent, ServerEvent};
