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
use std::str::FromStr;

use bytes::{Buf, Bytes};
use chrono::{DateTime, TimeZone, Utc};

use crate::buffer::Writer;
use crate::protocol::primitives::{
    ensure_remaining, read_bytes, read_cstring, read_var_i64, read_var_u64,
};
use crate::{AppError, AppResult};

/// Byte written where a schema says `done`.
pub const DONE_MARKER: u8 = 0xFF;

///
/// How one field of a message is encoded on the wire.
///
/// The tag set is shared by every peer; schemas built from it travel in type registrations
/// so that new content types need no simultaneous deploy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WireFieldType {
    Int8,
    Int16,
    Int32,
    Int64,
    UInt8,
    UInt16,
    UInt32,
    UInt64,
    /// zig-zag varint
    CompressedInt,
    /// unsigned varint
    PackedUInt,
    Float32,
    Float64,
    FixedBytes(u16),
    CString,
    /// milliseconds since the Unix epoch, i64 big-endian
    Date,
    OpCode,
    Done,
}

/// A decoded field value.
#[derive(Debug, Clone, PartialEq)]
pub enum WireValue {
    Int(i64),
    UInt(u64),
    Float(f64),
    Bytes(Bytes),
    Str(String),
    Date(DateTime<Utc>),
    OpCode(u8),
}

impl From<i64> for WireValue {
    fn from(value: i64) -> Self {
        WireValue::Int(value)
    }
}
impl From<u64> for WireValue {
    fn from(value: u64) -> Self {
        WireValue::UInt(value)
    }
}
impl From<f64> for WireValue {
    fn from(value: f64) -> Self {
        WireValue::Float(value)
    }
}
impl From<&str> for WireValue {
    fn from(value: &str) -> Self {
        WireValue::Str(value.to_string())
    }
}
impl From<String> for WireValue {
    fn from(value: String) -> Self {
        WireValue::Str(value)
    }
}
impl From<Bytes> for WireValue {
    fn from(value: Bytes) -> Self {
        WireValue::Bytes(value)
    }
}
impl From<DateTime<Utc>> for WireValue {
    fn from(value: DateTime<Utc>) -> Self {
        WireValue::Date(value)
    }
}

impl WireFieldType {
    pub fn tag(&self) -> u8 {
        match self {
            WireFieldType::Int8 => 1,
            WireFieldType::Int16 => 2,
            WireFieldType::Int32 => 3,
            WireFieldType::Int64 => 4,
            WireFieldType::UInt8 => 5,
            WireFieldType::UInt16 => 6,
            WireFieldType::UInt32 => 7,
            WireFieldType::UInt64 => 8,
            WireFieldType::CompressedInt => 9,
            WireFieldType::PackedUInt => 10,
            WireFieldType::Float32 => 11,
            WireFieldType::Float64 => 12,
            WireFieldType::FixedBytes(_) => 13,
            WireFieldType::CString => 14,
            WireFieldType::Date => 15,
            WireFieldType::OpCode => 16,
            WireFieldType::Done => DONE_MARKER,
        }
    }

    pub fn encode(&self, value: &WireValue, writer: &mut Writer) -> AppResult<()> {
        match (self, value) {
            (WireFieldType::Int8, WireValue::Int(v)) => writer.write_i8(narrow(*self, *v)?),
            (WireFieldType::Int16, WireValue::Int(v)) => writer.write_i16(narrow(*self, *v)?),
            (WireFieldType::Int32, WireValue::Int(v)) => writer.write_i32(narrow(*self, *v)?),
            (WireFieldType::Int64, WireValue::Int(v)) => writer.write_i64(*v),
            (WireFieldType::UInt8, WireValue::UInt(v)) => writer.write_u8(narrow(*self, *v)?),
            (WireFieldType::UInt16, WireValue::UInt(v)) => writer.write_u16(narrow(*self, *v)?),
            (WireFieldType::UInt32, WireValue::UInt(v)) => writer.write_u32(narrow(*self, *v)?),
            (WireFieldType::UInt64, WireValue::UInt(v)) => writer.write_u64(*v),
            (WireFieldType::CompressedInt, WireValue::Int(v)) => writer.write_var_i64(*v),
            (WireFieldType::PackedUInt, WireValue::UInt(v)) => writer.write_var_u64(*v),
            (WireFieldType::Float32, WireValue::Float(v)) => writer.write_f32(*v as f32),
            (WireFieldType::Float64, WireValue::Float(v)) => writer.write_f64(*v),
            (WireFieldType::FixedBytes(len), WireValue::Bytes(bytes)) => {
                if bytes.len() != *len as usize {
                    return Err(AppError::InvalidValue(format!(
                        "{} expects {} bytes, got {}",
                        self,
                        len,
                        bytes.len()
                    )));
                }
                writer.write_bytes(bytes);
            }
            (WireFieldType::CString, WireValue::Str(s)) => writer.write_cstring(s)?,
            (WireFieldType::Date, WireValue::Date(date)) => {
                writer.write_i64(date.timestamp_millis())
            }
            (WireFieldType::OpCode, WireValue::OpCode(op)) => writer.write_u8(*op),
            (WireFieldType::Done, _) => writer.write_u8(DONE_MARKER),
            (field_type, value) => {
                return Err(AppError::InvalidValue(format!(
                    "value {:?} can not be encoded as {}",
                    value, field_type
                )));
            }
        }
        Ok(())
    }

    /// Decode one value. `Done` has no value and is handled by [`crate::protocol::Schema`].
    pub fn decode<B: Buf>(&self, buffer: &mut B) -> AppResult<WireValue> {
        let what = self.to_string();
        let value = match self {
            WireFieldType::Int8 => {
                ensure_remaining(buffer, 1, &what)?;
                WireValue::Int(buffer.get_i8() as i64)
            }
            WireFieldType::Int16 => {
                ensure_remaining(buffer, 2, &what)?;
                WireValue::Int(buffer.get_i16() as i64)
            }
            WireFieldType::Int32 => {
                ensure_remaining(buffer, 4, &what)?;
                WireValue::Int(buffer.get_i32() as i64)
            }
            WireFieldType::Int64 => {
                ensure_remaining(buffer, 8, &what)?;
                WireValue::Int(buffer.get_i64())
            }
            WireFieldType::UInt8 => {
                ensure_remaining(buffer, 1, &what)?;
                WireValue::UInt(buffer.get_u8() as u64)
            }
            WireFieldType::UInt16 => {
                ensure_remaining(buffer, 2, &what)?;
                WireValue::UInt(buffer.get_u16() as u64)
            }
            WireFieldType::UInt32 => {
                ensure_remaining(buffer, 4, &what)?;
                WireValue::UInt(buffer.get_u32() as u64)
            }
            WireFieldType::UInt64 => {
                ensure_remaining(buffer, 8, &what)?;
                WireValue::UInt(buffer.get_u64())
            }
            WireFieldType::CompressedInt => WireValue::Int(read_var_i64(buffer)?),
            WireFieldType::PackedUInt => WireValue::UInt(read_var_u64(buffer)?),
            WireFieldType::Float32 => {
                ensure_remaining(buffer, 4, &what)?;
                WireValue::Float(buffer.get_f32() as f64)
            }
            WireFieldType::Float64 => {
                ensure_remaining(buffer, 8, &what)?;
                WireValue::Float(buffer.get_f64())
            }
            WireFieldType::FixedBytes(len) => WireValue::Bytes(read_bytes(buffer, *len as usize)?),
            WireFieldType::CString => WireValue::Str(read_cstring(buffer)?),
            WireFieldType::Date => {
                ensure_remaining(buffer, 8, &what)?;
                let millis = buffer.get_i64();
                let date = Utc.timestamp_millis_opt(millis).single().ok_or_else(|| {
                    AppError::MalformedProtocol(format!("date {} is out of range", millis))
                })?;
                WireValue::Date(date)
            }
            WireFieldType::OpCode => {
                ensure_remaining(buffer, 1, &what)?;
                WireValue::OpCode(buffer.get_u8())
            }
            WireFieldType::Done => {
                return Err(AppError::IllegalStateError(
                    "done marks the end of a message and carries no value".into(),
                ));
            }
        };
        Ok(value)
    }
}

fn narrow<S, T>(field_type: WireFieldType, value: S) -> AppResult<T>
where
    S: Copy + Display,
    T: TryFrom<S>,
{
    T::try_from(value).map_err(|_| {
        AppError::InvalidValue(format!("{} does not fit into {}", value, field_type))
    })
}

impl Display for WireFieldType {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            WireFieldType::Int8 => write!(f, "i8"),
            WireFieldType::Int16 => write!(f, "i16"),
            WireFieldType::Int32 => write!(f, "i32"),
            WireFieldType::Int64 => write!(f, "i64"),
            WireFieldType::UInt8 => write!(f, "u8"),
            WireFieldType::UInt16 => write!(f, "u16"),
            WireFieldType::UInt32 => write!(f, "u32"),
            WireFieldType::UInt64 => write!(f, "u64"),
            WireFieldType::CompressedInt => write!(f, "cint"),
            WireFieldType::PackedUInt => write!(f, "pint"),
            WireFieldType::Float32 => write!(f, "f32"),
            WireFieldType::Float64 => write!(f, "f64"),
            WireFieldType::FixedBytes(len) => write!(f, "bytes[{}]", len),
            WireFieldType::CString => write!(f, "cstr"),
            WireFieldType::Date => write!(f, "date"),
            WireFieldType::OpCode => write!(f, "opcode"),
            WireFieldType::Done => write!(f, "done"),
        }
    }
}

impl FromStr for WireFieldType {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let field_type = match s {
            "i8" => WireFieldType::Int8,
            "i16" => WireFieldType::Int16,
            "i32" => WireFieldType::Int32,
            "i64" => WireFieldType::Int64,
            "u8" => WireFieldType::UInt8,
            "u16" => WireFieldType::UInt16,
            "u32" => WireFieldType::UInt32,
            "u64" => WireFieldType::UInt64,
            "cint" => WireFieldType::CompressedInt,
            "pint" => WireFieldType::PackedUInt,
            "f32" => WireFieldType::Float32,
            "f64" => WireFieldType::Float64,
            "cstr" => WireFieldType::CString,
            "date" => WireFieldType::Date,
            "opcode" => WireFieldType::OpCode,
            "done" => WireFieldType::Done,
            other => {
                let len = other
                    .strip_prefix("bytes[")
                    .and_then(|rest| rest.strip_suffix(']'))
                    .and_then(|len| len.parse::<u16>().ok())
                    .ok_or_else(|| {
                        AppError::InvalidValue(format!("unknown wire field type: {}", other))
                    })?;
                WireFieldType::FixedBytes(len)
            }
        };
        Ok(field_type)
    }
}

///
/// One named field of a schema. The text form `"<type>:<name>"` is what peers exchange.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FieldDescriptor {
    pub name: String,
    pub field_type: WireFieldType,
}

impl FieldDescriptor {
    pub fn new(name: impl Into<String>, field_type: WireFieldType) -> Self {
        FieldDescriptor {
            name: name.into(),
            field_type,
        }
    }
}

impl Display for FieldDescriptor {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.field_type, self.name)
    }
}

impl FromStr for FieldDescriptor {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (field_type, name) = s.split_once(':').ok_or_else(|| {
            AppError::InvalidValue(format!("field descriptor {:?} is not <type>:<name>", s))
        })?;
        if name.is_empty() {
            return Err(AppError::InvalidValue(format!(
                "field descriptor {:?} has no name",
                s
            )));
        }
        Ok(FieldDescriptor {
            name: name.to_string(),
            field_type: field_type.parse()?,
        })
    }
}
