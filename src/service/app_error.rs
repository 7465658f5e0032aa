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

pub type AppResult<T> = Result<T, AppError>;

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    /// general errors
    #[error("illegal state: {0}")]
    IllegalStateError(String),

    #[error("malformed protocol : {0}")]
    MalformedProtocol(String),

    #[error("invalid value: {0}")]
    InvalidValue(String),

    #[error("I/O error: {0}")]
    DetailedIoError(String),

    #[error("io error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("channel send error: {0}")]
    ChannelSendError(String),

    #[error("config file error: {0}")]
    ConfigFileError(#[from] config::ConfigError),

    /// marker error, more bytes are needed before a frame can be parsed
    #[error("incomplete frame")]
    Incomplete,

    /// replication protocol errors
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("handshake with {0} timed out")]
    HandshakeTimeout(String),

    #[error("no schema registered for opcode {0}")]
    SchemaGap(u8),

    #[error("unknown control opcode {0}")]
    UnknownOpcode(u8),

    #[error("room type {0} is not configured")]
    UnknownRoomType(u8),

    #[error("connection {0} closed")]
    ConnectionClosed(u64),

    #[error("send queue of connection {0} is full")]
    SlowConsumer(u64),
}

impl AppError {
    /// Errors that only concern a single frame; the connection that carried it stays usable.
    pub fn is_frame_local(&self) -> bool {
        matches!(
            self,
            AppError::SchemaGap(_) | AppError::UnknownOpcode(_) | AppError::UnknownRoomType(_)
        )
    }
}
