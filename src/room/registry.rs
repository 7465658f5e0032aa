use std::sync::Arc;

use dashmap::DashMap;
use tracing::{debug, trace};

use crate::network::{ConnectionId, SocketClient};
use crate::room::{NetworkRoom, RoomKey, RoomTypeId};
use crate::sync::{PeerRegistry, ServerId};
use crate::{AppError, AppResult};

pub const MAX_ROOM_TYPES: usize = u8::MAX as usize + 1;

#[derive(Debug, Clone)]
pub struct JoinOutcome {
    pub room: Arc<NetworkRoom>,
    /// false when the connection was already in the room
    pub joined: bool,
    /// the connection is the first local subscriber, peers should learn about the room
    pub first_local: bool,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct LeaveOutcome {
    pub left: bool,
    /// the room has no local subscriber anymore
    pub last_local: bool,
    /// the room was empty and has been dropped from the registry
    pub removed: bool,
}

///
/// All rooms of this server, one slot per room type.
///
/// Rooms are created lazily on first join and dropped as soon as they have neither local
/// subscribers nor remote peers. Creation and removal both happen under the slot entry lock,
/// so a join racing with the removal of an empty room always ends up in a live room.
#[derive(Debug)]
pub struct NetworkRoomRegistry {
    slots: Box<[DashMap<u64, Arc<NetworkRoom>>]>,
    peers: Arc<PeerRegistry>,
}

impl NetworkRoomRegistry {
    pub fn new(room_type_count: usize, peers: Arc<PeerRegistry>) -> Self {
        let count = room_type_count.clamp(1, MAX_ROOM_TYPES);
        let slots = (0..count).map(|_| DashMap::new()).collect::<Vec<_>>();
        NetworkRoomRegistry {
            slots: slots.into_boxed_slice(),
            peers,
        }
    }

    pub fn room_type_count(&self) -> usize {
        self.slots.len()
    }

    fn slot(&self, room_type: RoomTypeId) -> AppResult<&DashMap<u64, Arc<NetworkRoom>>> {
        self.slots
            .get(room_type.0 as usize)
            .ok_or(AppError::UnknownRoomType(room_type.0))
    }

    pub fn get(&self, key: &RoomKey) -> Option<Arc<NetworkRoom>> {
        let slot = self.slot(key.room_type).ok()?;
        slot.get(&key.room_id).map(|room| room.value().clone())
    }

    pub fn get_or_create(&self, key: RoomKey) -> AppResult<Arc<NetworkRoom>> {
        let slot = self.slot(key.room_type)?;
        let room = slot
            .entry(key.room_id)
            .or_insert_with(|| Arc::new(NetworkRoom::new(key, self.peers.clone())))
            .value()
            .clone();
        Ok(room)
    }

    pub fn join(&self, key: RoomKey, client: &SocketClient) -> AppResult<JoinOutcome> {
        let slot = self.slot(key.room_type)?;
        let entry = slot
            .entry(key.room_id)
            .or_insert_with(|| Arc::new(NetworkRoom::new(key, self.peers.clone())));
        let room = entry.value().clone();
        let first_local = room.local_count() == 0;
        let joined = room.join(client.clone());
        drop(entry);

        if joined {
            client.track_join(key);
            trace!("connection {} joined {}", client.id(), key);
        }
        Ok(JoinOutcome {
            room,
            joined,
            first_local: joined && first_local,
        })
    }

    pub fn leave(&self, key: RoomKey, client: &SocketClient) -> AppResult<LeaveOutcome> {
        client.track_leave(&key);
        self.leave_by_id(key, client.id())
    }

    fn leave_by_id(&self, key: RoomKey, connection_id: ConnectionId) -> AppResult<LeaveOutcome> {
        let slot = self.slot(key.room_type)?;
        let Some(room) = slot.get(&key.room_id).map(|r| r.value().clone()) else {
            return Ok(LeaveOutcome::default());
        };
        let left = room.leave(connection_id).is_some();
        let last_local = left && room.local_count() == 0;
        let removed = slot
            .remove_if(&key.room_id, |_, room| room.is_empty())
            .is_some();
        if removed {
            trace!("{} is empty, removed", key);
        }
        Ok(LeaveOutcome {
            left,
            last_local,
            removed,
        })
    }

    /// Leave every room of a closed connection. Returns the rooms that lost their last local
    /// subscriber.
    pub fn remove_connection(
        &self,
        connection_id: ConnectionId,
        rooms: impl IntoIterator<Item = RoomKey>,
    ) -> Vec<RoomKey> {
        let mut abandoned = Vec::new();
        for key in rooms {
            match self.leave_by_id(key, connection_id) {
                Ok(outcome) if outcome.last_local => abandoned.push(key),
                Ok(_) => {}
                Err(e) => debug!("connection {} leaving {}: {}", connection_id, key, e),
            }
        }
        abandoned
    }

    /// Record that `server_id` hosts the room, as announced on peer connection `connection_id`.
    pub fn add_remote_peer(
        &self,
        key: RoomKey,
        server_id: ServerId,
        connection_id: ConnectionId,
    ) -> AppResult<bool> {
        let slot = self.slot(key.room_type)?;
        let entry = slot
            .entry(key.room_id)
            .or_insert_with(|| Arc::new(NetworkRoom::new(key, self.peers.clone())));
        Ok(entry.value().add_remote(server_id, connection_id))
    }

    pub fn remove_remote_peer(
        &self,
        key: RoomKey,
        server_id: ServerId,
        connection_id: ConnectionId,
    ) -> bool {
        let Ok(slot) = self.slot(key.room_type) else {
            return false;
        };
        let removed = match slot.get(&key.room_id) {
            Some(room) => room.remove_remote(server_id, connection_id),
            None => false,
        };
        slot.remove_if(&key.room_id, |_, room| room.is_empty());
        removed
    }

    /// Drop every room entry `server_id` announced on `connection_id`. Entries of a newer
    /// connection of the same server are kept. Returns the number of rooms left.
    pub fn forget_peer(&self, server_id: ServerId, connection_id: ConnectionId) -> usize {
        let keys = self.rooms_of_peer(server_id);
        keys.into_iter()
            .filter(|key| self.remove_remote_peer(*key, server_id, connection_id))
            .count()
    }

    /// Rooms with at least one local subscriber.
    pub fn active_rooms(&self) -> Vec<RoomKey> {
        self.slots
            .iter()
            .flat_map(|slot| {
                slot.iter()
                    .filter(|room| room.local_count() > 0)
                    .map(|room| room.value().key())
                    .collect::<Vec<_>>()
            })
            .collect()
    }

    /// Rooms whose remote set lists `server_id`.
    pub fn rooms_of_peer(&self, server_id: ServerId) -> Vec<RoomKey> {
        self.slots
            .iter()
            .flat_map(|slot| {
                slot.iter()
                    .filter(|room| room.has_remote(server_id))
                    .map(|room| room.value().key())
                    .collect::<Vec<_>>()
            })
            .collect()
    }

    pub fn room_count(&self) -> usize {
        self.slots.iter().map(|slot| slot.len()).sum()
    }
}
