//! Where room snapshots go when a room shuts down.
//!
//! A room loads its snapshot when it opens and saves it when the last
//! session is gone. Durable storage is someone else's job: implement
//! [`SnapshotStore`] over it. [`MemoryStore`] keeps snapshots for the life of
//! the process.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    pub content: String,
    pub revision: u64,
}

pub trait SnapshotStore: Send + Sync + 'static {
    fn load(&self, room_id: &str) -> Option<Snapshot>;
    fn save(&self, room_id: &str, snapshot: Snapshot);
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    rooms: RwLock<HashMap<String, Snapshot>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.rooms.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl SnapshotStore for MemoryStore {
    fn load(&self, room_id: &str) -> Option<Snapshot> {
        self.rooms
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(room_id)
            .cloned()
    }

    fn save(&self, room_id: &str, snapshot: Snapshot) {
        log::debug!(
            "saving snapshot of room {room_id} at revision {} ({} bytes)",
            snapshot.revision,
            snapshot.content.len()
        );
        self.rooms
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(room_id.to_string(), snapshot);
    }
}
