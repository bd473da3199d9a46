//! Pending-operation contexts and their pool.
//!
//! Each receive or send in flight is described by an [`AsyncContext`] that
//! owns an arena chunk for its whole life; the pool bounds how many of them
//! can be outstanding at once. Accepts need no context: the listener has a
//! single accept outstanding and it carries no buffer.
//! When the pool is empty, [`AsyncContextPool::acquire`] waits for a release
//! instead of allocating, which is the engine's backpressure signal.

use crate::error::NetResult;
use crate::runtime::buffer::{ArenaChunk, BufferArena};
use crate::runtime::connection::ConnectionId;
use parking_lot::Mutex;
use std::io;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use tokio::sync::Notify;

/// Type of in-flight operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpKind {
    /// Receive operation on a connection.
    Receive,
    /// Send operation on a connection.
    Send,
}

/// Outcome of the last operation issued with a context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpStatus {
    /// Sitting in the pool.
    Idle,
    /// Issued, not yet completed.
    Pending,
    /// Completed successfully.
    Completed,
    /// Completed with a socket error.
    Failed(io::ErrorKind),
}

/// One in-flight operation and the buffer it reads into or writes from.
#[derive(Debug)]
pub struct AsyncContext {
    kind: OpKind,
    chunk: ArenaChunk,
    connection: Option<ConnectionId>,
    status: OpStatus,
    bytes_transferred: usize,
}

impl AsyncContext {
    /// Create a context bound to an arena chunk.
    pub fn with_chunk(kind: OpKind, chunk: ArenaChunk) -> Self {
        Self {
            kind,
            chunk,
            connection: None,
            status: OpStatus::Idle,
            bytes_transferred: 0,
        }
    }

    pub fn kind(&self) -> OpKind {
        self.kind
    }

    pub fn status(&self) -> OpStatus {
        self.status
    }

    /// Connection the context is currently assigned to.
    pub fn connection(&self) -> Option<ConnectionId> {
        self.connection
    }

    /// Bytes moved by the last completed operation.
    pub fn bytes_transferred(&self) -> usize {
        self.bytes_transferred
    }

    /// The bound chunk.
    pub fn buffer(&self) -> &[u8] {
        &self.chunk
    }

    pub fn buffer_mut(&mut self) -> &mut [u8] {
        &mut self.chunk
    }

    /// Assign the context to a connection and mark an operation as issued.
    pub(crate) fn begin(&mut self, connection: ConnectionId) {
        self.connection = Some(connection);
        self.status = OpStatus::Pending;
    }

    pub(crate) fn complete(&mut self, bytes: usize) {
        self.status = OpStatus::Completed;
        self.bytes_transferred = bytes;
    }

    pub(crate) fn fail(&mut self, error: &io::Error) {
        self.status = OpStatus::Failed(error.kind());
        self.bytes_transferred = 0;
    }

    fn reset(&mut self) {
        self.connection = None;
        self.status = OpStatus::Idle;
        self.bytes_transferred = 0;
    }

    fn into_chunk(self) -> ArenaChunk {
        self.chunk
    }
}

/// Bounded pool of reusable contexts.
pub struct AsyncContextPool {
    kind: OpKind,
    slots: Mutex<Vec<AsyncContext>>,
    capacity: usize,
    released: Notify,
}

impl AsyncContextPool {
    /// Create a pool of `count` contexts, each bound to its own arena chunk.
    pub fn with_arena(kind: OpKind, arena: &BufferArena, count: usize) -> NetResult<Self> {
        let mut slots = Vec::with_capacity(count);
        for _ in 0..count {
            match arena.acquire() {
                Ok(chunk) => slots.push(AsyncContext::with_chunk(kind, chunk)),
                Err(e) => {
                    for chunk in slots.into_iter().map(AsyncContext::into_chunk) {
                        arena.release(chunk);
                    }
                    return Err(e);
                }
            }
        }
        Ok(Self {
            kind,
            slots: Mutex::new(slots),
            capacity: count,
            released: Notify::new(),
        })
    }

    pub fn kind(&self) -> OpKind {
        self.kind
    }

    /// Number of contexts the pool was populated with.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of contexts currently in the pool.
    pub fn available(&self) -> usize {
        self.slots.lock().len()
    }

    /// Take a context if one is available.
    pub fn pop(&self) -> Option<AsyncContext> {
        self.slots.lock().pop()
    }

    /// Return a context and wake one waiter.
    pub fn push(&self, mut ctx: AsyncContext) {
        debug_assert_eq!(ctx.kind, self.kind, "context returned to the wrong pool");
        ctx.reset();
        self.slots.lock().push(ctx);
        self.released.notify_one();
    }

    /// Take a context that returns itself to the pool when dropped.
    pub fn try_acquire(self: &Arc<Self>) -> Option<PooledContext> {
        self.pop().map(|ctx| PooledContext::new(ctx, Arc::clone(self)))
    }

    /// Take a context, waiting for a release while the pool is empty.
    pub async fn acquire(self: &Arc<Self>) -> PooledContext {
        loop {
            let released = self.released.notified();
            tokio::pin!(released);
            released.as_mut().enable();

            if let Some(ctx) = self.try_acquire() {
                return ctx;
            }
            released.await;
        }
    }

    /// Drain idle contexts, handing their chunks back to `arena`.
    pub fn drain_into(&self, arena: &BufferArena) -> usize {
        let drained: Vec<_> = self.slots.lock().drain(..).collect();
        let count = drained.len();
        for chunk in drained.into_iter().map(AsyncContext::into_chunk) {
            arena.release(chunk);
        }
        count
    }
}

/// A context borrowed from a pool; released back on drop.
#[derive(Debug)]
pub struct PooledContext {
    ctx: Option<AsyncContext>,
    pool: Arc<AsyncContextPool>,
}

impl PooledContext {
    fn new(ctx: AsyncContext, pool: Arc<AsyncContextPool>) -> Self {
        Self {
            ctx: Some(ctx),
            pool,
        }
    }
}

impl Deref for PooledContext {
    type Target = AsyncContext;

    fn deref(&self) -> &AsyncContext {
        self.ctx.as_ref().expect("context present until drop")
    }
}

impl DerefMut for PooledContext {
    fn deref_mut(&mut self) -> &mut AsyncContext {
        self.ctx.as_mut().expect("context present until drop")
    }
}

impl Drop for PooledContext {
    fn drop(&mut self) {
        if let Some(ctx) = self.ctx.take() {
            self.pool.push(ctx);
        }
    }
}

impl std::fmt::Debug for AsyncContextPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncContextPool")
            .field("kind", &self.kind)
            .field("capacity", &self.capacity)
            .field("available", &self.available())
            .finish()
    }
}
