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

use std::sync::Arc;

use bytes::{Buf, BufMut, BytesMut};

use super::{BufferPool, PooledBuffer, Writer};

#[derive(Debug)]
struct ChainInner {
    buffers: Vec<PooledBuffer>,
    len: usize,
}

///
/// The encoded bytes of one message, spread over pooled buffers in link order.
///
/// A chain is immutable and reference counted: the same encoded message can sit in the send
/// queues of local subscribers and peer connections at once. The buffers go back to the pool
/// when the last clone is dropped.
#[derive(Debug, Clone)]
pub struct BufferChain {
    inner: Arc<ChainInner>,
}

impl BufferChain {
    pub(crate) fn from_buffers(buffers: Vec<PooledBuffer>, len: usize) -> Self {
        BufferChain {
            inner: Arc::new(ChainInner { buffers, len }),
        }
    }

    pub fn empty() -> Self {
        Self::from_buffers(Vec::new(), 0)
    }

    /// Copy `bytes` into buffers leased from `pool`.
    pub fn copy_from_slice(pool: &BufferPool, bytes: &[u8]) -> Self {
        let mut writer = Writer::new(pool);
        writer.write_bytes(bytes);
        writer.finish()
    }

    pub fn len(&self) -> usize {
        self.inner.len
    }

    pub fn is_empty(&self) -> bool {
        self.inner.len == 0
    }

    pub fn buffer_count(&self) -> usize {
        self.inner.buffers.len()
    }

    pub fn first_byte(&self) -> Option<u8> {
        self.inner
            .buffers
            .first()
            .and_then(|b| b.as_slice().first().copied())
    }

    /// Number of live holders of this chain.
    pub fn holders(&self) -> usize {
        Arc::strong_count(&self.inner)
    }

    pub fn segments(&self) -> impl Iterator<Item = &[u8]> {
        self.inner.buffers.iter().map(|b| b.as_slice())
    }

    pub fn reader(&self) -> ChainReader<'_> {
        ChainReader {
            buffers: &self.inner.buffers,
            index: 0,
            offset: 0,
            remaining: self.inner.len,
        }
    }

    /// Contiguous copy of the chain, mostly useful for tests and diagnostics.
    pub fn to_bytes(&self) -> BytesMut {
        let mut bytes = BytesMut::with_capacity(self.inner.len);
        for segment in self.segments() {
            bytes.put_slice(segment);
        }
        bytes
    }
}

///
/// Cursor over a [`BufferChain`] implementing [`Buf`], so every decoder that reads from a
/// socket buffer can read from a chain as well.
#[derive(Debug)]
pub struct ChainReader<'a> {
    buffers: &'a [PooledBuffer],
    index: usize,
    offset: usize,
    remaining: usize,
}

impl Buf for ChainReader<'_> {
    fn remaining(&self) -> usize {
        self.remaining
    }

    fn chunk(&self) -> &[u8] {
        match self.buffers.get(self.index) {
            Some(buffer) => &buffer.as_slice()[self.offset..],
            None => &[],
        }
    }

    fn advance(&mut self, mut cnt: usize) {
        assert!(
            cnt <= self.remaining,
            "cannot advance {} bytes past the end of the chain",
            cnt
        );
        self.remaining -= cnt;
        while cnt > 0 {
            let left_in_segment = self.buffers[self.index].len() - self.offset;
            if cnt < left_in_segment {
                self.offset += cnt;
                return;
            }
            cnt -= left_in_segment;
            self.index += 1;
            self.offset = 0;
        }
    }
}
