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

//! Frame layout, all integers big-endian:
//!
//! ```text
//! control frame: [CONTROL_LEAD][len:u32][opcode:u8][fields...]
//! room frame:    [ROOM_LEAD][len:u32][room_type:u8][room_id:varint][origin:i32][opcode:u8][fields...]
//! ```
//!
//! `len` counts every byte after the length field.

use bytes::{Buf, Bytes, BytesMut};

use crate::buffer::{BufferChain, BufferPool, Writer};
use crate::protocol::primitives::{ensure_remaining, read_var_u64};
use crate::protocol::OpCode;
use crate::room::{RoomKey, RoomTypeId};
use crate::sync::ServerId;
use crate::AppError::Incomplete;
use crate::{AppError, AppResult};

pub const CONTROL_LEAD: u8 = 0xC3;
/// Reserved first byte of every frame built for room delivery.
pub const ROOM_LEAD: u8 = 0xA5;
pub const FRAME_HEADER_SIZE: usize = 5;

/// Addressing part of a room frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoomHeader {
    pub key: RoomKey,
    /// server the message entered the cluster on
    pub origin: ServerId,
    pub opcode: OpCode,
}

impl RoomHeader {
    fn write_to(&self, writer: &mut Writer) {
        writer.write_u8(self.key.room_type.0);
        writer.write_var_u64(self.key.room_id);
        writer.write_i32(self.origin);
        writer.write_u8(self.opcode.0);
    }

    fn read_from<B: Buf>(buffer: &mut B) -> AppResult<RoomHeader> {
        ensure_remaining(buffer, 1, "room type")?;
        let room_type = RoomTypeId(buffer.get_u8());
        let room_id = read_var_u64(buffer)?;
        ensure_remaining(buffer, 5, "room frame origin")?;
        let origin = buffer.get_i32();
        let opcode = OpCode(buffer.get_u8());
        Ok(RoomHeader {
            key: RoomKey::new(room_type, room_id),
            origin,
            opcode,
        })
    }
}

#[derive(Debug)]
pub enum Frame {
    Control {
        opcode: OpCode,
        body: Bytes,
    },
    Room {
        header: RoomHeader,
        body: Bytes,
        /// the complete frame, forwarded untouched to local subscribers
        raw: Bytes,
    },
}

impl Frame {
    /// Validate the header and return the total frame size once it is fully buffered.
    pub fn check(buffer: &mut BytesMut, max_package_size: usize) -> AppResult<usize> {
        if buffer.remaining() < FRAME_HEADER_SIZE {
            return Err(Incomplete);
        }
        let lead = buffer[0];
        if lead != CONTROL_LEAD && lead != ROOM_LEAD {
            return Err(AppError::MalformedProtocol(format!(
                "unknown frame lead byte {:#04x}",
                lead
            )));
        }
        let body_size = u32::from_be_bytes([buffer[1], buffer[2], buffer[3], buffer[4]]) as usize;
        if body_size == 0 {
            return Err(AppError::MalformedProtocol("frame without opcode".into()));
        }
        if body_size > max_package_size {
            return Err(AppError::DetailedIoError(format!(
                "Frame of length {} is too large.",
                body_size
            )));
        }
        let frame_size = body_size + FRAME_HEADER_SIZE;
        if buffer.remaining() < frame_size {
            buffer.reserve(frame_size - buffer.remaining());
            return Err(Incomplete);
        }
        Ok(frame_size)
    }

    pub fn parse(buffer: &mut BytesMut, max_package_size: usize) -> AppResult<Option<Frame>> {
        let frame_size = match Frame::check(buffer, max_package_size) {
            Ok(size) => size,
            Err(Incomplete) => return Ok(None),
            Err(e) => return Err(e),
        };
        let raw = buffer.split_to(frame_size).freeze();
        let mut body = raw.slice(FRAME_HEADER_SIZE..);
        let frame = if raw[0] == CONTROL_LEAD {
            let opcode = OpCode(body.get_u8());
            Frame::Control { opcode, body }
        } else {
            let header = RoomHeader::read_from(&mut body)?;
            Frame::Room { header, body, raw }
        };
        Ok(Some(frame))
    }
}

///
/// Writes a frame header, lets the caller append the fields, and back-fills the length.
#[derive(Debug)]
pub struct FrameBuilder {
    writer: Writer,
    length_position: usize,
}

impl FrameBuilder {
    pub fn control(pool: &BufferPool, opcode: OpCode) -> Self {
        let mut writer = Writer::new(pool);
        writer.write_u8(CONTROL_LEAD);
        let length_position = writer.reserve_u32();
        writer.write_u8(opcode.0);
        FrameBuilder {
            writer,
            length_position,
        }
    }

    pub fn room(pool: &BufferPool, header: &RoomHeader) -> Self {
        let mut writer = Writer::new(pool);
        writer.write_u8(ROOM_LEAD);
        let length_position = writer.reserve_u32();
        header.write_to(&mut writer);
        FrameBuilder {
            writer,
            length_position,
        }
    }

    pub fn writer(&mut self) -> &mut Writer {
        &mut self.writer
    }

    pub fn finish(mut self) -> AppResult<BufferChain> {
        let body_size = self.writer.len() - self.length_position - 4;
        let body_size = u32::try_from(body_size).map_err(|_| {
            AppError::InvalidValue(format!("frame body of {} bytes is too large", body_size))
        })?;
        self.writer.patch_u32_be(self.length_position, body_size)?;
        Ok(self.writer.finish())
    }
}
