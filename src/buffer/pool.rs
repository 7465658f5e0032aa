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
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{error, trace};

use crate::{AppError, AppResult};

/// Index of a buffer slot inside its pool's arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferHandle(usize);

impl BufferHandle {
    pub fn index(&self) -> usize {
        self.0
    }
}

impl Display for BufferHandle {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "buffer#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotState {
    Leased,
    Free,
}

#[derive(Debug)]
struct Slot {
    state: SlotState,
    // the byte array lives here only while the slot is free
    data: Option<Box<[u8]>>,
}

#[derive(Debug, Default)]
struct Arena {
    slots: Vec<Slot>,
    free: Vec<usize>,
}

#[derive(Debug)]
struct PoolInner {
    buffer_size: usize,
    arena: Mutex<Arena>,
}

/// Snapshot of a pool's arena.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub buffer_size: usize,
    pub allocated: usize,
    pub leased: usize,
    pub free: usize,
}

///
/// Fixed-size byte array allocator.
///
/// Buffers live in an arena of slots addressed by [`BufferHandle`]; the free list is a stack
/// of slot indices guarded by a single mutex. Leasing a buffer moves its byte array out of the
/// slot and into a [`PooledBuffer`], releasing moves it back. Because `release` consumes the
/// `PooledBuffer`, a buffer can not be handed back twice, and the arena still rejects a release
/// of a slot that is not leased.
///
/// The pool is a cheap handle, clone it wherever buffers are needed.
#[derive(Debug, Clone)]
pub struct BufferPool {
    inner: Arc<PoolInner>,
}

impl BufferPool {
    pub fn new(buffer_size: usize) -> Self {
        assert!(buffer_size > 0, "buffer pool needs a non-zero buffer size");
        BufferPool {
            inner: Arc::new(PoolInner {
                buffer_size,
                arena: Mutex::new(Arena::default()),
            }),
        }
    }

    pub fn buffer_size(&self) -> usize {
        self.inner.buffer_size
    }

    /// Lease a buffer, reusing a free slot when one exists.
    pub fn get(&self) -> PooledBuffer {
        let reused = {
            let mut arena = self.inner.arena.lock();
            match arena.free.pop() {
                Some(index) => {
                    let slot = &mut arena.slots[index];
                    slot.state = SlotState::Leased;
                    Ok((index, slot.data.take()))
                }
                None => {
                    arena.slots.push(Slot {
                        state: SlotState::Leased,
                        data: None,
                    });
                    Err(arena.slots.len() - 1)
                }
            }
        };

        let (index, data) = match reused {
            Ok((index, data)) => (index, data),
            Err(index) => {
                trace!("buffer pool grows to {} slots", index + 1);
                (index, None)
            }
        };
        let data = data.unwrap_or_else(|| vec![0u8; self.inner.buffer_size].into_boxed_slice());

        PooledBuffer {
            pool: self.clone(),
            handle: BufferHandle(index),
            data: Some(data),
            len: 0,
        }
    }

    /// Hand a buffer back to the pool.
    pub fn release(&self, mut buffer: PooledBuffer) -> AppResult<()> {
        if !Arc::ptr_eq(&self.inner, &buffer.pool.inner) {
            return Err(AppError::IllegalStateError(format!(
                "{} does not belong to this pool",
                buffer.handle
            )));
        }
        match buffer.data.take() {
            Some(data) => self.put_back(buffer.handle, data),
            None => Err(AppError::IllegalStateError(format!(
                "{} has no backing storage",
                buffer.handle
            ))),
        }
    }

    pub fn stats(&self) -> PoolStats {
        let arena = self.inner.arena.lock();
        PoolStats {
            buffer_size: self.inner.buffer_size,
            allocated: arena.slots.len(),
            leased: arena.slots.len() - arena.free.len(),
            free: arena.free.len(),
        }
    }

    fn put_back(&self, handle: BufferHandle, data: Box<[u8]>) -> AppResult<()> {
        let mut arena = self.inner.arena.lock();
        let slot = arena.slots.get_mut(handle.0).ok_or_else(|| {
            AppError::IllegalStateError(format!("{} is outside of the arena", handle))
        })?;
        if slot.state != SlotState::Leased {
            return Err(AppError::IllegalStateError(format!(
                "{} released while already free",
                handle
            )));
        }
        slot.state = SlotState::Free;
        slot.data = Some(data);
        arena.free.push(handle.0);
        Ok(())
    }
}

///
/// A buffer leased from a [`BufferPool`].
///
/// Owned by exactly one writer or chain at a time. Dropping it returns the storage to the pool.
#[derive(Debug)]
pub struct PooledBuffer {
    pool: BufferPool,
    handle: BufferHandle,
    data: Option<Box<[u8]>>,
    len: usize,
}

impl PooledBuffer {
    pub fn handle(&self) -> BufferHandle {
        self.handle
    }

    pub fn capacity(&self) -> usize {
        self.data.as_ref().map_or(0, |d| d.len())
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn remaining_capacity(&self) -> usize {
        self.capacity() - self.len
    }

    pub fn as_slice(&self) -> &[u8] {
        match &self.data {
            Some(data) => &data[..self.len],
            None => &[],
        }
    }

    /// Copy as much of `src` as fits, returning the number of bytes taken.
    pub fn append(&mut self, src: &[u8]) -> usize {
        let start = self.len;
        let Some(data) = self.data.as_mut() else {
            return 0;
        };
        let n = src.len().min(data.len() - start);
        data[start..start + n].copy_from_slice(&src[..n]);
        self.len += n;
        n
    }

    /// Overwrite already filled bytes starting at `offset`, returning how many were written.
    pub(crate) fn overwrite(&mut self, offset: usize, src: &[u8]) -> usize {
        let len = self.len;
        let Some(data) = self.data.as_mut() else {
            return 0;
        };
        if offset >= len {
            return 0;
        }
        let n = src.len().min(len - offset);
        data[offset..offset + n].copy_from_slice(&src[..n]);
        n
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        if let Some(data) = self.data.take() {
            if let Err(e) = self.pool.put_back(self.handle, data) {
                error!("failed to return buffer to pool: {}", e);
            }
        }
    }
}
