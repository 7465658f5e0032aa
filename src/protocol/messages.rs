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

use bytes::{Buf, Bytes};

use crate::buffer::{BufferChain, BufferPool, Writer};
use crate::protocol::primitives::{
    ensure_remaining, read_bytes, read_string, read_string_list, read_var_u64,
};
use crate::protocol::{FrameBuilder, OpCode, Record, Schema};
use crate::room::{RoomKey, RoomTypeId};
use crate::sync::ServerId;
use crate::{AppError, AppResult};

///
/// Encoding of a control message body. The frame header and opcode are written by
/// [`FrameBuilder`], implementors only deal with their own fields.
pub trait ProtocolCodec: Sized {
    const OPCODE: OpCode;

    fn encode(&self, writer: &mut Writer) -> AppResult<()>;

    fn decode<B: Buf>(buffer: &mut B) -> AppResult<Self>;

    fn to_frame(&self, pool: &BufferPool) -> AppResult<BufferChain> {
        let mut builder = FrameBuilder::control(pool, Self::OPCODE);
        self.encode(builder.writer())?;
        builder.finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    pub server_id: ServerId,
    pub signature: String,
}

impl ProtocolCodec for Handshake {
    const OPCODE: OpCode = OpCode::HANDSHAKE;

    fn encode(&self, writer: &mut Writer) -> AppResult<()> {
        writer.write_i32(self.server_id);
        writer.write_string(&self.signature);
        Ok(())
    }

    fn decode<B: Buf>(buffer: &mut B) -> AppResult<Self> {
        ensure_remaining(buffer, 4, "handshake server id")?;
        let server_id = buffer.get_i32();
        let signature = read_string(buffer)?;
        Ok(Handshake {
            server_id,
            signature,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandshakeResponse {
    pub server_id: u32,
}

impl ProtocolCodec for HandshakeResponse {
    const OPCODE: OpCode = OpCode::HANDSHAKE_RESPONSE;

    fn encode(&self, writer: &mut Writer) -> AppResult<()> {
        writer.write_u32(self.server_id);
        Ok(())
    }

    fn decode<B: Buf>(buffer: &mut B) -> AppResult<Self> {
        ensure_remaining(buffer, 4, "handshake response server id")?;
        Ok(HandshakeResponse {
            server_id: buffer.get_u32(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypeRegistration {
    pub content_type_id: i32,
    pub opcode_to_listen_for: u32,
    /// field descriptors in their `<type>:<name>` text form
    pub field_info: Vec<String>,
}

impl ProtocolCodec for TypeRegistration {
    const OPCODE: OpCode = OpCode::TYPE_REGISTRATION;

    fn encode(&self, writer: &mut Writer) -> AppResult<()> {
        writer.write_i32(self.content_type_id);
        writer.write_u32(self.opcode_to_listen_for);
        writer.write_var_u64(self.field_info.len() as u64);
        for info in &self.field_info {
            writer.write_string(info);
        }
        Ok(())
    }

    fn decode<B: Buf>(buffer: &mut B) -> AppResult<Self> {
        ensure_remaining(buffer, 8, "type registration")?;
        let content_type_id = buffer.get_i32();
        let opcode_to_listen_for = buffer.get_u32();
        let field_info = read_string_list(buffer)?;
        Ok(TypeRegistration {
            content_type_id,
            opcode_to_listen_for,
            field_info,
        })
    }
}

/// Sent after the last type registration of a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegistrationComplete {
    pub type_count: u32,
}

impl ProtocolCodec for RegistrationComplete {
    const OPCODE: OpCode = OpCode::REGISTRATION_COMPLETE;

    fn encode(&self, writer: &mut Writer) -> AppResult<()> {
        writer.write_u32(self.type_count);
        Ok(())
    }

    fn decode<B: Buf>(buffer: &mut B) -> AppResult<Self> {
        ensure_remaining(buffer, 4, "registration complete")?;
        Ok(RegistrationComplete {
            type_count: buffer.get_u32(),
        })
    }
}

///
/// Control messages whose only field is a room key.
macro_rules! room_key_message {
    ($name:ident, $opcode:expr) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        pub struct $name(pub RoomKey);

        impl ProtocolCodec for $name {
            const OPCODE: OpCode = $opcode;

            fn encode(&self, writer: &mut Writer) -> AppResult<()> {
                writer.write_u8(self.0.room_type.0);
                writer.write_var_u64(self.0.room_id);
                Ok(())
            }

            fn decode<B: Buf>(buffer: &mut B) -> AppResult<Self> {
                ensure_remaining(buffer, 1, stringify!($name))?;
                let room_type = RoomTypeId(buffer.get_u8());
                let room_id = read_var_u64(buffer)?;
                Ok($name(RoomKey::new(room_type, room_id)))
            }
        }
    };
}

room_key_message!(RoomJoin, OpCode::ROOM_JOIN);
room_key_message!(RoomLeave, OpCode::ROOM_LEAVE);
room_key_message!(Subscribe, OpCode::SUBSCRIBE);
room_key_message!(Unsubscribe, OpCode::UNSUBSCRIBE);

///
/// Announces a content type by name with opaque metadata, for types that are hosted without a
/// field schema exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteTypeNotice {
    pub locale_id: u32,
    pub type_name: String,
    pub meta: Bytes,
}

impl ProtocolCodec for RemoteTypeNotice {
    const OPCODE: OpCode = OpCode::REMOTE_TYPE_NOTICE;

    fn encode(&self, writer: &mut Writer) -> AppResult<()> {
        let remaining = u32::try_from(self.meta.len())
            .map_err(|_| AppError::InvalidValue("type notice meta is too large".into()))?;
        writer.write_u32(self.locale_id);
        writer.write_string(&self.type_name);
        writer.write_u32(remaining);
        writer.write_bytes(&self.meta);
        Ok(())
    }

    fn decode<B: Buf>(buffer: &mut B) -> AppResult<Self> {
        ensure_remaining(buffer, 4, "type notice locale")?;
        let locale_id = buffer.get_u32();
        let type_name = read_string(buffer)?;
        ensure_remaining(buffer, 4, "type notice length")?;
        let remaining = buffer.get_u32() as usize;
        let meta = read_bytes(buffer, remaining)?;
        Ok(RemoteTypeNotice {
            locale_id,
            type_name,
            meta,
        })
    }
}

/// Every control message, dispatched by opcode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlMessage {
    Handshake(Handshake),
    HandshakeResponse(HandshakeResponse),
    TypeRegistration(TypeRegistration),
    RegistrationComplete(RegistrationComplete),
    RoomJoin(RoomJoin),
    RoomLeave(RoomLeave),
    RemoteTypeNotice(RemoteTypeNotice),
    Subscribe(Subscribe),
    Unsubscribe(Unsubscribe),
}

impl ControlMessage {
    pub fn decode<B: Buf>(opcode: OpCode, buffer: &mut B) -> AppResult<ControlMessage> {
        let message = match opcode {
            OpCode::HANDSHAKE => ControlMessage::Handshake(Handshake::decode(buffer)?),
            OpCode::HANDSHAKE_RESPONSE => {
                ControlMessage::HandshakeResponse(HandshakeResponse::decode(buffer)?)
            }
            OpCode::TYPE_REGISTRATION => {
                ControlMessage::TypeRegistration(TypeRegistration::decode(buffer)?)
            }
            OpCode::REGISTRATION_COMPLETE => {
                ControlMessage::RegistrationComplete(RegistrationComplete::decode(buffer)?)
            }
            OpCode::ROOM_JOIN => ControlMessage::RoomJoin(RoomJoin::decode(buffer)?),
            OpCode::ROOM_LEAVE => ControlMessage::RoomLeave(RoomLeave::decode(buffer)?),
            OpCode::REMOTE_TYPE_NOTICE => {
                ControlMessage::RemoteTypeNotice(RemoteTypeNotice::decode(buffer)?)
            }
            OpCode::SUBSCRIBE => ControlMessage::Subscribe(Subscribe::decode(buffer)?),
            OpCode::UNSUBSCRIBE => ControlMessage::Unsubscribe(Unsubscribe::decode(buffer)?),
            other => return Err(AppError::UnknownOpcode(other.0)),
        };
        Ok(message)
    }
}

/// What happened to a content entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Action {
    Created = 1,
    Updated = 2,
    Deleted = 3,
}

impl Action {
    pub fn from_u8(value: u8) -> AppResult<Action> {
        match value {
            1 => Ok(Action::Created),
            2 => Ok(Action::Updated),
            3 => Ok(Action::Deleted),
            invalid => Err(AppError::MalformedProtocol(format!(
                "content action {} is invalid",
                invalid
            ))),
        }
    }

    pub fn as_u8(&self) -> u8 {
        *self as u8
    }
}

/// Entity payloads that can be carried by a [`ContentUpdate`].
pub trait WireContent: Sized {
    fn write_content(&self, schema: &Schema, writer: &mut Writer) -> AppResult<()>;
    fn read_content<B: Buf>(schema: &Schema, buffer: &mut B) -> AppResult<Self>;
}

impl WireContent for Record {
    fn write_content(&self, schema: &Schema, writer: &mut Writer) -> AppResult<()> {
        schema.write_record(self, writer)
    }

    fn read_content<B: Buf>(schema: &Schema, buffer: &mut B) -> AppResult<Self> {
        schema.read_record(buffer)
    }
}

/// A create/update/delete of one entity; the opcode of the enclosing frame names its type.
#[derive(Debug, Clone, PartialEq)]
pub struct ContentUpdate<T> {
    pub action: Action,
    pub locale_id: u32,
    pub user_id: u32,
    pub role_id: u32,
    pub content: T,
}

impl<T: WireContent> ContentUpdate<T> {
    pub fn encode(&self, schema: &Schema, writer: &mut Writer) -> AppResult<()> {
        writer.write_u8(self.action.as_u8());
        writer.write_u32(self.locale_id);
        writer.write_u32(self.user_id);
        writer.write_u32(self.role_id);
        self.content.write_content(schema, writer)
    }

    pub fn decode<B: Buf>(schema: &Schema, buffer: &mut B) -> AppResult<Self> {
        ensure_remaining(buffer, 13, "content update header")?;
        let action = Action::from_u8(buffer.get_u8())?;
        let locale_id = buffer.get_u32();
        let user_id = buffer.get_u32();
        let role_id = buffer.get_u32();
        let content = T::read_content(schema, buffer)?;
        Ok(ContentUpdate {
            action,
            locale_id,
            user_id,
            role_id,
            content,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Frame, WireValue};

    fn decode_control(chain: &BufferChain) -> ControlMessage {
        let mut buffer = chain.to_bytes();
        match Frame::parse(&mut buffer, 1 << 20).unwrap() {
            Some(Frame::Control { opcode, mut body }) => {
                let message = ControlMessage::decode(opcode, &mut body).unwrap();
                assert!(body.is_empty(), "trailing bytes after {:?}", message);
                message
            }
            other => panic!("expected a control frame, got {:?}", other),
        }
    }

    #[test]
    fn test_content_update_round_trip() {
        let pool = BufferPool::new(8);
        let schema = Schema::from_field_info(&["u32:id", "cstr:title", "bytes[4]:tag"]).unwrap();
        let update = ContentUpdate {
            action: Action::Created,
            locale_id: 7,
            user_id: 42,
            role_id: 3,
            content: Record::new()
                .with("id", WireValue::UInt(1001))
                .with("title", "release notes")
                .with("tag", Bytes::from_static(b"\x01\x02\x03\x04")),
        };

        let mut writer = Writer::new(&pool);
        update.encode(&schema, &mut writer).unwrap();
        let chain = writer.finish();

        let mut reader = chain.reader();
        let decoded = ContentUpdate::<Record>::decode(&schema, &mut reader).unwrap();
        assert_eq!(decoded, update);
        assert_eq!(reader.remaining(), 0);
    }

    #[test]
    fn test_invalid_action_is_rejected() {
        let pool = BufferPool::new(8);
        let schema = Schema::new(vec![]).unwrap();
        let mut writer = Writer::new(&pool);
        writer.write_u8(4);
        writer.write_bytes(&[0; 12]);
        writer.write_u8(crate::protocol::DONE_MARKER);
        let chain = writer.finish();
        assert!(ContentUpdate::<Record>::decode(&schema, &mut chain.reader()).is_err());
    }

    #[test]
    fn test_control_messages_round_trip() {
        let pool = BufferPool::new(16);
        let messages = vec![
            ControlMessage::Handshake(Handshake {
                server_id: -4,
                signature: "ab12".into(),
            }),
            ControlMessage::HandshakeResponse(HandshakeResponse { server_id: 9 }),
            ControlMessage::TypeRegistration(TypeRegistration {
                content_type_id: 12,
                opcode_to_listen_for: 40,
                field_info: vec!["u32:id".into(), "cstr:body".into()],
            }),
            ControlMessage::RegistrationComplete(RegistrationComplete { type_count: 1 }),
            ControlMessage::RoomJoin(RoomJoin(RoomKey::new(RoomTypeId(2), 1 << 33))),
            ControlMessage::RoomLeave(RoomLeave(RoomKey::new(RoomTypeId(2), 5))),
            ControlMessage::RemoteTypeNotice(RemoteTypeNotice {
                locale_id: 1,
                type_name: "Gallery".into(),
                meta: Bytes::from_static(b"meta-bytes"),
            }),
            ControlMessage::Subscribe(Subscribe(RoomKey::new(RoomTypeId(1), 8))),
            ControlMessage::Unsubscribe(Unsubscribe(RoomKey::new(RoomTypeId(1), 8))),
        ];

        for message in messages {
            let chain = match &message {
                ControlMessage::Handshake(m) => m.to_frame(&pool),
                ControlMessage::HandshakeResponse(m) => m.to_frame(&pool),
                ControlMessage::TypeRegistration(m) => m.to_frame(&pool),
                ControlMessage::RegistrationComplete(m) => m.to_frame(&pool),
                ControlMessage::RoomJoin(m) => m.to_frame(&pool),
                ControlMessage::RoomLeave(m) => m.to_frame(&pool),
                ControlMessage::RemoteTypeNotice(m) => m.to_frame(&pool),
                ControlMessage::Subscribe(m) => m.to_frame(&pool),
                ControlMessage::Unsubscribe(m) => m.to_frame(&pool),
            }
            .unwrap();
            assert_eq!(decode_control(&chain), message);
        }
    }

    #[test]
    fn test_truncated_type_notice_is_malformed() {
        let pool = BufferPool::new(16);
        let mut writer = Writer::new(&pool);
        writer.write_u32(1);
        writer.write_string("Forum");
        writer.write_u32(10);
        writer.write_bytes(b"short");
        let chain = writer.finish();
        assert!(RemoteTypeNotice::decode(&mut chain.reader()).is_err());
    }
}
