//! Connection state machine and registry.
//!
//! A [`Connection`] is a cheap, cloneable handle shared by the connection's
//! receive task, its send task, the registry, and user callbacks. Outbound
//! frames go through a bounded per-connection FIFO so they reach the socket
//! in the order they were queued. A full queue fails the send rather than
//! growing while the peer is slow.
//!
//! ```text
//! client:  Connecting -> Connected -> Disconnecting -> Disconnected
//! server:                Connected -> Disconnecting -> Disconnected
//! ```

use crate::error::{NetError, NetResult};
use crate::packet::Packet;
use bytes::Bytes;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, Notify};

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Opaque process-unique connection identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub(crate) fn next() -> Self {
        Self(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Current state of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum ConnState {
    /// Outbound connect in progress (client only).
    Connecting = 0,
    /// Socket established; receiving and sending.
    Connected = 1,
    /// Teardown requested; outstanding operations are winding down.
    Disconnecting = 2,
    /// Socket closed and contexts returned to their pools.
    Disconnected = 3,
}

impl ConnState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => ConnState::Connecting,
            1 => ConnState::Connected,
            2 => ConnState::Disconnecting,
            _ => ConnState::Disconnected,
        }
    }
}

struct Inner {
    id: ConnectionId,
    peer_addr: SocketAddr,
    state: AtomicU8,
    outbound: mpsc::Sender<Bytes>,
    queue_capacity: usize,
    closed: Notify,
}

/// Handle to a single TCP connection.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Inner>,
}

impl Connection {
    /// Create a connection handle feeding `outbound`.
    pub(crate) fn new(
        peer_addr: SocketAddr,
        state: ConnState,
        outbound: mpsc::Sender<Bytes>,
    ) -> Self {
        let queue_capacity = outbound.capacity();
        Self {
            inner: Arc::new(Inner {
                id: ConnectionId::next(),
                peer_addr,
                state: AtomicU8::new(state as u8),
                outbound,
                queue_capacity,
                closed: Notify::new(),
            }),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.inner.id
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.inner.peer_addr
    }

    pub fn state(&self) -> ConnState {
        ConnState::from_u8(self.inner.state.load(Ordering::Acquire))
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnState::Connected
    }

    /// Whether teardown has been requested or finished.
    pub fn is_closing(&self) -> bool {
        self.state() >= ConnState::Disconnecting
    }

    /// Queue a write-mode packet for this connection.
    pub fn send(&self, packet: Packet) -> NetResult<()> {
        self.send_frame(packet.into_frame()?)
    }

    /// Queue an already framed buffer for this connection.
    ///
    /// Fails with [`NetError::SendQueueFull`] when the peer is not keeping up.
    /// The caller owns retrying.
    pub fn send_frame(&self, frame: Bytes) -> NetResult<()> {
        if !self.is_connected() {
            return Err(NetError::State("connection is not connected"));
        }
        self.inner.outbound.try_send(frame).map_err(|e| match e {
            TrySendError::Full(_) => NetError::SendQueueFull {
                capacity: self.inner.queue_capacity,
            },
            TrySendError::Closed(_) => NetError::State("send queue is closed"),
        })
    }

    /// Move from `Connecting` to `Connected`.
    pub(crate) fn mark_connected(&self) -> bool {
        self.inner
            .state
            .compare_exchange(
                ConnState::Connecting as u8,
                ConnState::Connected as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Request teardown. Returns `true` for the caller that initiated it.
    pub(crate) fn begin_disconnect(&self) -> bool {
        let initiated = self
            .inner
            .state
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |raw| {
                match ConnState::from_u8(raw) {
                    ConnState::Connecting | ConnState::Connected => {
                        Some(ConnState::Disconnecting as u8)
                    }
                    _ => None,
                }
            })
            .is_ok();
        self.inner.closed.notify_waiters();
        initiated
    }

    pub(crate) fn mark_disconnected(&self) {
        self.inner
            .state
            .store(ConnState::Disconnected as u8, Ordering::Release);
        self.inner.closed.notify_waiters();
    }

    /// Resolves once teardown has been requested.
    pub(crate) async fn closed(&self) {
        let notified = self.inner.closed.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();

        if self.is_closing() {
            return;
        }
        notified.await;
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.inner.id)
            .field("peer_addr", &self.inner.peer_addr)
            .field("state", &self.state())
            .finish()
    }
}

/// Registry of live connections keyed by id.
///
/// Inserted by the accept path, removed by the disconnect path, and read
/// concurrently during dispatch.
pub struct ConnectionRegistry {
    connections: RwLock<HashMap<ConnectionId, Connection>>,
    max_connections: usize,
}

impl ConnectionRegistry {
    /// Create a new registry with specified maximum capacity.
    pub fn new(max_connections: usize) -> Self {
        Self {
            connections: RwLock::new(HashMap::with_capacity(max_connections)),
            max_connections,
        }
    }

    /// Insert a connection. Returns `false` if the registry is at capacity.
    pub fn insert(&self, conn: Connection) -> bool {
        let mut connections = self.connections.write();
        if connections.len() >= self.max_connections {
            return false;
        }
        connections.insert(conn.id(), conn);
        true
    }

    pub fn get(&self, id: ConnectionId) -> Option<Connection> {
        self.connections.read().get(&id).cloned()
    }

    pub fn remove(&self, id: ConnectionId) -> Option<Connection> {
        self.connections.write().remove(&id)
    }

    pub fn contains(&self, id: ConnectionId) -> bool {
        self.connections.read().contains_key(&id)
    }

    /// Number of live connections.
    pub fn len(&self) -> usize {
        self.connections.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.read().is_empty()
    }

    /// Maximum number of connections allowed.
    pub fn capacity(&self) -> usize {
        self.max_connections
    }

    /// Snapshot of the live connections.
    pub fn snapshot(&self) -> Vec<Connection> {
        self.connections.read().values().cloned().collect()
    }

    /// Remove and return every connection.
    pub fn drain(&self) -> Vec<Connection> {
        self.connections.write().drain().map(|(_, c)| c).collect()
    }
}

#[cfg(test)]
pub(crate) fn test_connection(state: ConnState) -> (Connection, mpsc::Receiver<Bytes>) {
    let (tx, rx) = mpsc::channel(4);
    let addr = "127.0.0.1:9".parse().unwrap();
    (Connection::new(addr, state, tx), rx)
}
