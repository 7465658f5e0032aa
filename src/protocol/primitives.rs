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

//! Readers for the primitive encodings produced by [`crate::buffer::Writer`].
//!
//! They are generic over [`Buf`] so that the same code decodes a socket `BytesMut`, a `Bytes`
//! slice of a frame, or a pooled [`crate::buffer::BufferChain`].

use bytes::{Buf, Bytes};
use integer_encoding::VarInt;

use crate::{AppError, AppResult};

const MAX_VARINT_LEN: usize = 10;

/// Fail with `MalformedProtocol` unless `n` bytes are left.
pub fn ensure_remaining<B: Buf>(buffer: &B, n: usize, what: &str) -> AppResult<()> {
    if buffer.remaining() < n {
        return Err(AppError::MalformedProtocol(format!(
            "can not read a {}, need {} bytes but {} remain",
            what,
            n,
            buffer.remaining()
        )));
    }
    Ok(())
}

fn read_varint_bytes<B: Buf>(buffer: &mut B, what: &str) -> AppResult<([u8; MAX_VARINT_LEN], usize)> {
    let mut scratch = [0u8; MAX_VARINT_LEN];
    for (i, slot) in scratch.iter_mut().enumerate() {
        ensure_remaining(buffer, 1, what)?;
        let byte = buffer.get_u8();
        *slot = byte;
        if byte & 0x80 == 0 {
            return Ok((scratch, i + 1));
        }
    }
    Err(AppError::MalformedProtocol(format!(
        "{} is longer than {} bytes",
        what, MAX_VARINT_LEN
    )))
}

pub fn read_var_u64<B: Buf>(buffer: &mut B) -> AppResult<u64> {
    let (scratch, n) = read_varint_bytes(buffer, "packed unsigned integer")?;
    u64::decode_var(&scratch[..n])
        .map(|(value, _)| value)
        .ok_or_else(|| AppError::MalformedProtocol("can not read a packed unsigned integer".into()))
}

pub fn read_var_i64<B: Buf>(buffer: &mut B) -> AppResult<i64> {
    let (scratch, n) = read_varint_bytes(buffer, "compressed integer")?;
    i64::decode_var(&scratch[..n])
        .map(|(value, _)| value)
        .ok_or_else(|| AppError::MalformedProtocol("can not read a compressed integer".into()))
}

pub fn read_bytes<B: Buf>(buffer: &mut B, len: usize) -> AppResult<Bytes> {
    ensure_remaining(buffer, len, "byte range")?;
    Ok(buffer.copy_to_bytes(len))
}

/// Varint length prefixed UTF-8 string.
pub fn read_string<B: Buf>(buffer: &mut B) -> AppResult<String> {
    let len = read_var_u64(buffer)? as usize;
    let bytes = read_bytes(buffer, len)?;
    String::from_utf8(bytes.to_vec())
        .map_err(|e| AppError::MalformedProtocol(format!("string is not valid utf-8: {}", e)))
}

/// Null terminated UTF-8 string.
pub fn read_cstring<B: Buf>(buffer: &mut B) -> AppResult<String> {
    let mut bytes = Vec::new();
    loop {
        ensure_remaining(buffer, 1, "null terminated string")?;
        match buffer.get_u8() {
            0 => break,
            byte => bytes.push(byte),
        }
    }
    String::from_utf8(bytes)
        .map_err(|e| AppError::MalformedProtocol(format!("string is not valid utf-8: {}", e)))
}

/// Varint count followed by that many length prefixed strings.
pub fn read_string_list<B: Buf>(buffer: &mut B) -> AppResult<Vec<String>> {
    let count = read_var_u64(buffer)? as usize;
    // every string takes at least its length byte
    ensure_remaining(buffer, count, "string list")?;
    let mut values = Vec::with_capacity(count);
    for _ in 0..count {
        values.push(read_string(buffer)?);
    }
    Ok(values)
}
