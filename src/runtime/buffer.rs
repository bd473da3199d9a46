//! Shared buffer arena.
//!
//! One contiguous allocation of `capacity * chunk_size` bytes, handed out in
//! fixed-size chunks without per-operation allocation. Chunks are carved off
//! the front of the region on first use and recycled through a free list
//! afterwards (LIFO for cache locality).
//!
//! Every chunk is either on the free list, still uncarved, or owned by exactly
//! one [`ArenaChunk`] value, so two live operations can never share one.

use crate::error::{NetError, NetResult};
use bytes::BytesMut;
use parking_lot::Mutex;
use std::ops::{Deref, DerefMut};

/// A chunk of the arena, owned by one in-flight operation.
#[derive(Debug)]
pub struct ArenaChunk {
    /// Byte offset of the chunk within the arena region.
    offset: usize,
    buf: BytesMut,
}

impl ArenaChunk {
    /// Byte offset of this chunk within the arena.
    pub fn offset(&self) -> usize {
        self.offset
    }
}

impl Deref for ArenaChunk {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.buf
    }
}

impl DerefMut for ArenaChunk {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.buf
    }
}

struct ArenaState {
    /// Released chunks.
    free: Vec<ArenaChunk>,
    /// Region not yet handed out.
    uncarved: BytesMut,
    /// Offset of the first uncarved byte.
    cursor: usize,
}

/// Fixed-size chunk allocator over a single region.
pub struct BufferArena {
    state: Mutex<ArenaState>,
    chunk_size: usize,
    capacity: usize,
}

impl BufferArena {
    /// Create a new arena.
    ///
    /// # Arguments
    /// * `capacity` - Number of chunks
    /// * `chunk_size` - Size of each chunk in bytes
    ///
    /// Fails if the region size does not fit in `usize`.
    pub fn new(capacity: usize, chunk_size: usize) -> NetResult<Self> {
        let region = capacity.checked_mul(chunk_size).ok_or_else(|| {
            NetError::config(format!(
                "arena of {capacity} chunks of {chunk_size} bytes is too large"
            ))
        })?;

        Ok(Self {
            state: Mutex::new(ArenaState {
                free: Vec::with_capacity(capacity),
                uncarved: BytesMut::zeroed(region),
                cursor: 0,
            }),
            chunk_size,
            capacity,
        })
    }

    /// Take a chunk from the arena.
    ///
    /// Reuses a released chunk when one is available, otherwise carves the
    /// next one off the region. Fails once every chunk is in use.
    pub fn acquire(&self) -> NetResult<ArenaChunk> {
        let mut state = self.state.lock();

        if let Some(chunk) = state.free.pop() {
            return Ok(chunk);
        }

        if state.uncarved.len() < self.chunk_size || self.chunk_size == 0 {
            return Err(NetError::ArenaExhausted {
                capacity: self.capacity,
            });
        }

        let offset = state.cursor;
        let buf = state.uncarved.split_to(self.chunk_size);
        state.cursor += self.chunk_size;
        Ok(ArenaChunk { offset, buf })
    }

    /// Return a chunk to the arena.
    pub fn release(&self, mut chunk: ArenaChunk) {
        debug_assert!(
            chunk.offset < self.capacity * self.chunk_size,
            "chunk offset out of bounds"
        );
        debug_assert_eq!(chunk.buf.len(), self.chunk_size, "chunk was resized");
        chunk.fill(0);
        self.state.lock().free.push(chunk);
    }

    /// Size of each chunk.
    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Total number of chunks.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of chunks that can still be acquired.
    pub fn available(&self) -> usize {
        let state = self.state.lock();
        let uncarved = if self.chunk_size == 0 {
            0
        } else {
            state.uncarved.len() / self.chunk_size
        };
        state.free.len() + uncarved
    }
}
