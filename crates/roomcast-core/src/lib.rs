//! # roomcast-core
//!
//! Room membership and presence broadcasting for the Roomcast hub.
//!
//! This crate provides the building blocks:
//!
//! - **RoomRegistry** - Room name to occupant count; a room exists while it has occupants
//! - **PresenceHub** - Per-connection room state machine (connect, join, create, disconnect, message)
//! - **Broadcast** - The transport capability the hub drives
//! - **GroupRegistry** - In-memory broadcast groups over per-connection channels
//! - **HubHandle** - Serialized access to a hub running in its own task
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     ┌─────────────┐     ┌──────────────┐
//! │  Connection │────▶│  HubHandle  │────▶│ PresenceHub  │
//! └─────────────┘     └─────────────┘     └──────────────┘
//!        ▲                                   │        │
//!        │                                   ▼        ▼
//!        │                          ┌──────────────┐ ┌──────────────┐
//!        └──────────────────────────│GroupRegistry │ │ RoomRegistry │
//!                                   └──────────────┘ └──────────────┘
//! ```

pub mod connection;
pub mod groups;
pub mod hub;
pub mod registry;
pub mod service;
pub mod transport;

pub use connection::{ConnectionId, ConnectionState};
pub use groups::{EventSink, EventStream, GroupRegistry};
pub use hub::{HubError, HubStats, PresenceHub};
pub use registry::{RoomOccupancy, RoomRegistry, GLOBAL_ROOM};
pub use service::{HubHandle, ServiceError};
pub use transport::Broadcast;
