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

use std::fmt::{Display, Formatter};

use crate::{AppError, AppResult};

/// Identifies the schema of a message.
///
/// Values below [`OpCode::CONTENT_BASE`] are the fixed control messages, content types pick
/// their own opcode at or above it and announce it in their type registration.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OpCode(pub u8);

impl OpCode {
    pub const HANDSHAKE: OpCode = OpCode(1);
    pub const HANDSHAKE_RESPONSE: OpCode = OpCode(2);
    pub const TYPE_REGISTRATION: OpCode = OpCode(3);
    pub const REGISTRATION_COMPLETE: OpCode = OpCode(4);
    pub const ROOM_JOIN: OpCode = OpCode(5);
    pub const ROOM_LEAVE: OpCode = OpCode(6);
    pub const REMOTE_TYPE_NOTICE: OpCode = OpCode(7);
    pub const SUBSCRIBE: OpCode = OpCode(8);
    pub const UNSUBSCRIBE: OpCode = OpCode(9);

    pub const CONTENT_BASE: u8 = 32;

    pub fn is_content(&self) -> bool {
        self.0 >= Self::CONTENT_BASE
    }

    /// Opcodes travel as uint32 inside type registrations.
    pub fn from_u32(value: u32) -> AppResult<OpCode> {
        u8::try_from(value)
            .map(OpCode)
            .map_err(|_| AppError::InvalidValue(format!("opcode {} does not fit a byte", value)))
    }

    pub fn as_u32(&self) -> u32 {
        self.0 as u32
    }
}

impl Display for OpCode {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "op#{}", self.0)
    }
}
