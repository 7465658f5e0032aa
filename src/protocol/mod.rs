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

//! Wire protocol shared by socket clients and peer servers.
//!
//! Content messages are described at runtime by a [`Schema`] of typed field descriptors, so a
//! server can decode the content types of a peer from nothing but the peer's type registration.
//! Control messages have fixed layouts, see [`messages`].

pub use field::{FieldDescriptor, WireFieldType, WireValue, DONE_MARKER};
pub use frame::{Frame, FrameBuilder, RoomHeader, CONTROL_LEAD, FRAME_HEADER_SIZE, ROOM_LEAD};
pub use messages::{
    Action, ContentUpdate, ControlMessage, Handshake, HandshakeResponse, ProtocolCodec,
    RegistrationComplete, RemoteTypeNotice, RoomJoin, RoomLeave, Subscribe, TypeRegistration,
    Unsubscribe, WireContent,
};
pub use opcode::OpCode;
pub use primitives::{read_cstring, read_string, read_var_i64, read_var_u64};
pub use record::Record;
pub use schema::Schema;

mod field;
mod frame;
pub mod messages;
mod opcode;
mod primitives;
mod record;
mod schema;
