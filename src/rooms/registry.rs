//! Registry of open rooms

use dashmap::DashMap;
use tracing::info;

use super::room::{PeerLink, Room, RoomError, RoomHandle};

/// All open rooms, keyed by name
pub struct RoomRegistry {
    rooms: DashMap<String, RoomHandle>,
    capacity: usize,
}

impl RoomRegistry {
    pub fn new(capacity: usize) -> Self {
        Self {
            rooms: DashMap::new(),
            capacity,
        }
    }

    pub fn get(&self, name: &str) -> Option<RoomHandle> {
        self.rooms.get(name).map(|r| r.value().clone())
    }

    /// Open room by name, starting its task when none is running
    pub fn get_or_open(&self, name: &str) -> RoomHandle {
        let mut entry = self
            .rooms
            .entry(name.to_string())
            .or_insert_with(|| spawn_room(name, self.capacity));
        if entry.is_closed() {
            *entry = spawn_room(name, self.capacity);
        }
        entry.value().clone()
    }

    /// Join a room, reopening it once if it closed in the meantime
    pub async fn join(&self, name: &str) -> Result<(RoomHandle, PeerLink), RoomError> {
        let handle = self.get_or_open(name);
        let joined = handle.join().await;
        match joined {
            Err(RoomError::Closed) => {
                let handle = self.get_or_open(name);
                let link = handle.join().await?;
                Ok((handle, link))
            }
            other => other.map(|link| (handle, link)),
        }
    }

    /// Forget rooms whose task has finished
    pub fn prune(&self) {
        self.rooms.retain(|name, handle| {
            let open = !handle.is_closed();
            if !open {
                info!(room = %name, "Room removed");
            }
            open
        });
    }

    pub fn active_rooms(&self) -> usize {
        self.rooms.iter().filter(|r| !r.value().is_closed()).count()
    }

    pub fn total_peers(&self) -> usize {
        self.rooms.iter().map(|r| r.value().peer_count()).sum()
    }
}

impl Default for RoomRegistry {
    fn default() -> Self {
        Self::new(16)
    }
}

fn spawn_room(name: &str, capacity: usize) -> RoomHandle {
    let (room, handle) = Room::new(name, capacity);
    tokio::spawn(room.run());
    handle
}
