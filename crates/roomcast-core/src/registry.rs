//! Room occupancy registry.
//!
//! A room is nothing more than an entry `name -> occupant count`. Whether a
//! room exists is derived from the count alone: an entry at count 0 is
//! indistinguishable from a name that was never created.

use serde::Serialize;
use std::collections::HashMap;
use tracing::{debug, warn};

/// The room every connection starts in.
pub const GLOBAL_ROOM: &str = "global";

/// A room name.
pub type RoomName = String;

/// Occupancy of a single room.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RoomOccupancy {
    /// Room name.
    pub name: RoomName,
    /// Number of connections currently in the room.
    pub count: u64,
}

/// Maps room names to their current occupant count.
#[derive(Debug)]
pub struct RoomRegistry {
    rooms: HashMap<RoomName, u64>,
}

impl RoomRegistry {
    /// Create a registry holding only the global room, at count 0.
    #[must_use]
    pub fn new() -> Self {
        let mut rooms = HashMap::new();
        rooms.insert(GLOBAL_ROOM.to_string(), 0);
        Self { rooms }
    }

    /// Check if a room exists, i.e. has an entry with at least one occupant.
    #[must_use]
    pub fn exists(&self, room: &str) -> bool {
        self.rooms.get(room).is_some_and(|&count| count > 0)
    }

    /// Check if an entry is present for a room, whatever its count.
    #[must_use]
    pub fn contains(&self, room: &str) -> bool {
        self.rooms.contains_key(room)
    }

    /// Insert an entry at count 0 if none is present.
    pub fn ensure(&mut self, room: &str) {
        if !self.rooms.contains_key(room) {
            debug!(room = %room, "Creating room entry");
            self.rooms.insert(room.to_string(), 0);
        }
    }

    /// Add one occupant to a room, returning the new count.
    pub fn increment(&mut self, room: &str) -> u64 {
        let count = self.rooms.entry(room.to_string()).or_insert(0);
        *count += 1;
        *count
    }

    /// Remove one occupant from a room, returning the new count.
    ///
    /// The count never goes below 0. An underflow means the one-room-per-
    /// connection invariant was broken somewhere, so it is logged.
    pub fn decrement(&mut self, room: &str) -> u64 {
        match self.rooms.get_mut(room) {
            Some(count) if *count > 0 => {
                *count -= 1;
                *count
            }
            Some(_) => {
                warn!(room = %room, "Occupant count underflow, clamping at 0");
                0
            }
            None => {
                warn!(room = %room, "Decrement of unknown room");
                0
            }
        }
    }

    /// Get the occupant count of a room, or 0 if absent.
    #[must_use]
    pub fn count_of(&self, room: &str) -> u64 {
        self.rooms.get(room).copied().unwrap_or(0)
    }

    /// Remove every entry whose count is 0, except the global room.
    ///
    /// Returns the removed names. Existence is unaffected since an entry at 0
    /// and a missing entry are treated the same.
    pub fn prune_empty(&mut self) -> Vec<RoomName> {
        let empty: Vec<RoomName> = self
            .rooms
            .iter()
            .filter(|(name, &count)| count == 0 && name.as_str() != GLOBAL_ROOM)
            .map(|(name, _)| name.clone())
            .collect();

        for name in &empty {
            self.rooms.remove(name);
            debug!(room = %name, "Pruned empty room");
        }

        empty
    }

    /// Snapshot of all entries, sorted by name.
    #[must_use]
    pub fn rooms(&self) -> Vec<RoomOccupancy> {
        let mut rooms: Vec<RoomOccupancy> = self
            .rooms
            .iter()
            .map(|(name, &count)| RoomOccupancy {
                name: name.clone(),
                count,
            })
            .collect();
        rooms.sort_by(|a, b| a.name.cmp(&b.name));
        rooms
    }

    /// Number of rooms with at least one occupant.
    #[must_use]
    pub fn occupied(&self) -> usize {
        self.rooms.values().filter(|&&count| count > 0).count()
    }

    /// Number of entries, including empty ones.
    #[must_use]
    pub fn len(&self) -> usize {
        self.rooms.len()
    }

    /// Check if the registry has no entries. The global room makes this false
    /// for any registry built with [`RoomRegistry::new`].
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rooms.is_empty()
    }
}

impl Default for RoomRegistry {
    fn default() -> Self {
        Self::new()
    }
}
