// Copyright 2025 jonefeewang@gmail.com
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Publish/subscribe rooms.
//!
//! A room fans one encoded message out to its local socket subscribers and forwards the same
//! buffer chain to every peer server known to host the room. Rooms live in a
//! [`NetworkRoomRegistry`] with one slot per room type.

use std::fmt::{Display, Formatter};

pub use network_room::{DeliveryReport, NetworkRoom, RoomState};
pub use registry::{JoinOutcome, LeaveOutcome, NetworkRoomRegistry};

mod network_room;
mod registry;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RoomTypeId(pub u8);

impl RoomTypeId {
    /// Rooms of this type carry content updates, the room id is the content type id.
    pub const CONTENT: RoomTypeId = RoomTypeId(0);
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RoomKey {
    pub room_type: RoomTypeId,
    pub room_id: u64,
}

impl RoomKey {
    pub fn new(room_type: RoomTypeId, room_id: u64) -> Self {
        RoomKey { room_type, room_id }
    }

    pub fn content(content_type_id: i32) -> Self {
        RoomKey {
            room_type: RoomTypeId::CONTENT,
            room_id: content_type_id as u32 as u64,
        }
    }

    pub fn is_content(&self) -> bool {
        self.room_type == RoomTypeId::CONTENT
    }
}

impl Display for RoomKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "room {}/{}", self.room_type.0, self.room_id)
    }
}
