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

use integer_encoding::VarInt;

use super::{BufferChain, BufferPool, PooledBuffer};
use crate::{AppError, AppResult};

///
/// Implement big-endian and little-endian appends for a fixed-width integer.
macro_rules! write_fixed {
    ($be:ident, $le:ident, $t:ty) => {
        pub fn $be(&mut self, value: $t) {
            self.write_bytes(&value.to_be_bytes());
        }
        pub fn $le(&mut self, value: $t) {
            self.write_bytes(&value.to_le_bytes());
        }
    };
}

///
/// Growable byte sink backed by pooled buffers.
///
/// Appends fill the last buffer of the chain; when it is full a new one is leased from the
/// pool and linked, so values may straddle buffer boundaries. Every buffer except the last one
/// is always full. `finish` hands the chain over as an immutable [`BufferChain`].
#[derive(Debug)]
pub struct Writer {
    pool: BufferPool,
    buffers: Vec<PooledBuffer>,
    len: usize,
}

impl Writer {
    pub fn new(pool: &BufferPool) -> Self {
        Writer {
            pool: pool.clone(),
            buffers: Vec::new(),
            len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn buffer_count(&self) -> usize {
        self.buffers.len()
    }

    pub fn first_byte(&self) -> Option<u8> {
        self.buffers
            .first()
            .and_then(|b| b.as_slice().first().copied())
    }

    fn current(&mut self) -> &mut PooledBuffer {
        let full = self
            .buffers
            .last()
            .map_or(true, |b| b.remaining_capacity() == 0);
        if full {
            self.buffers.push(self.pool.get());
        }
        let last = self.buffers.len() - 1;
        &mut self.buffers[last]
    }

    pub fn write_bytes(&mut self, mut src: &[u8]) {
        while !src.is_empty() {
            let taken = self.current().append(src);
            self.len += taken;
            src = &src[taken..];
        }
    }

    pub fn write_u8(&mut self, value: u8) {
        self.write_bytes(&[value]);
    }

    pub fn write_i8(&mut self, value: i8) {
        self.write_bytes(&value.to_be_bytes());
    }

    write_fixed!(write_u16, write_u16_le, u16);
    write_fixed!(write_i16, write_i16_le, i16);
    write_fixed!(write_u32, write_u32_le, u32);
    write_fixed!(write_i32, write_i32_le, i32);
    write_fixed!(write_u64, write_u64_le, u64);
    write_fixed!(write_i64, write_i64_le, i64);
    write_fixed!(write_f32, write_f32_le, f32);
    write_fixed!(write_f64, write_f64_le, f64);

    /// Packed unsigned integer (LEB128 varint).
    pub fn write_var_u64(&mut self, value: u64) {
        let mut scratch = [0u8; 10];
        let n = value.encode_var(&mut scratch);
        self.write_bytes(&scratch[..n]);
    }

    /// Compressed signed integer (zig-zag varint).
    pub fn write_var_i64(&mut self, value: i64) {
        let mut scratch = [0u8; 10];
        let n = value.encode_var(&mut scratch);
        self.write_bytes(&scratch[..n]);
    }

    /// Varint length followed by the UTF-8 bytes.
    pub fn write_string(&mut self, value: &str) {
        self.write_var_u64(value.len() as u64);
        self.write_bytes(value.as_bytes());
    }

    /// UTF-8 bytes followed by a single `0`.
    pub fn write_cstring(&mut self, value: &str) -> AppResult<()> {
        if value.as_bytes().contains(&0) {
            return Err(AppError::InvalidValue(format!(
                "string {:?} contains a null byte",
                value
            )));
        }
        self.write_bytes(value.as_bytes());
        self.write_u8(0);
        Ok(())
    }

    /// Append a zeroed u32 and return its position for a later [`Writer::patch_u32_be`].
    pub fn reserve_u32(&mut self) -> usize {
        let position = self.len;
        self.write_u32(0);
        position
    }

    pub fn patch_u32_be(&mut self, position: usize, value: u32) -> AppResult<()> {
        self.patch_bytes(position, &value.to_be_bytes())
    }

    pub fn patch_bytes(&mut self, position: usize, mut src: &[u8]) -> AppResult<()> {
        if position + src.len() > self.len {
            return Err(AppError::InvalidValue(format!(
                "patch of {} bytes at {} is outside of the {} written bytes",
                src.len(),
                position,
                self.len
            )));
        }
        let buffer_size = self.pool.buffer_size();
        let mut index = position / buffer_size;
        let mut offset = position % buffer_size;
        while !src.is_empty() {
            let written = self.buffers[index].overwrite(offset, src);
            src = &src[written..];
            index += 1;
            offset = 0;
        }
        Ok(())
    }

    /// CRC-32C of the bytes in `[start, end)`, which may span several buffers.
    pub fn crc32c(&self, start: usize, end: usize) -> AppResult<u32> {
        if start > end || end > self.len {
            return Err(AppError::InvalidValue(format!(
                "checksum range {}..{} is outside of the {} written bytes",
                start, end, self.len
            )));
        }
        let mut crc = 0u32;
        let mut base = 0usize;
        for buffer in &self.buffers {
            let slice = buffer.as_slice();
            let seg_start = base;
            let seg_end = base + slice.len();
            base = seg_end;
            if seg_end <= start {
                continue;
            }
            if seg_start >= end {
                break;
            }
            let from = start.saturating_sub(seg_start);
            let to = end.min(seg_end) - seg_start;
            crc = crc32c::crc32c_append(crc, &slice[from..to]);
        }
        Ok(crc)
    }

    pub fn finish(self) -> BufferChain {
        BufferChain::from_buffers(self.buffers, self.len)
    }
}
