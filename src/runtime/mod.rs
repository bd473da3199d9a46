//! Connection runtime shared by the server and the client.
//!
//! - `BufferArena`: one region carved into fixed-size receive/send chunks
//! - `AsyncContextPool`: bounded pool of pending-operation contexts
//! - `ReassemblyState`: turns a stream of reads into complete messages
//! - `Connection`: connection state machine and outbound queue
//! - `pipeline`: the per-connection receive and send loops

mod buffer;
mod connection;
mod context;
pub(crate) mod pipeline;
mod reassembly;

pub use buffer::{ArenaChunk, BufferArena};
pub use connection::{ConnState, Connection, ConnectionId, ConnectionRegistry};
pub use context::{AsyncContext, AsyncContextPool, OpKind, OpStatus, PooledContext};
pub use reassembly::{Phase, ReassemblyState};

use crate::error::NetResult;
use std::sync::Arc;

/// Receive and send context pools backed by their own arenas.
pub(crate) struct ContextPools {
    pub(crate) read_arena: BufferArena,
    pub(crate) write_arena: BufferArena,
    pub(crate) read: Arc<AsyncContextPool>,
    pub(crate) write: Arc<AsyncContextPool>,
}

impl ContextPools {
    /// Build `count` receive and `count` send contexts of `chunk_size` bytes.
    pub(crate) fn new(count: usize, chunk_size: usize) -> NetResult<Self> {
        let read_arena = BufferArena::new(count, chunk_size)?;
        let write_arena = BufferArena::new(count, chunk_size)?;
        let read = AsyncContextPool::with_arena(OpKind::Receive, &read_arena, count)?;
        let write = AsyncContextPool::with_arena(OpKind::Send, &write_arena, count)?;

        Ok(Self {
            read_arena,
            write_arena,
            read: Arc::new(read),
            write: Arc::new(write),
        })
    }

    /// Hand idle contexts' chunks back to their arenas.
    pub(crate) fn release(&self) {
        self.read.drain_into(&self.read_arena);
        self.write.drain_into(&self.write_arena);
    }
}
