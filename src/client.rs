//! TCP client engine.
//!
//! Runs the same receive and send loops as the server for a single outbound
//! connection.

use crate::config::ClientConfig;
use crate::error::{HandlerError, NetError, NetResult};
use crate::packet::{LengthPrefixCodec, Packet, PacketCodec};
use crate::runtime::pipeline;
use crate::runtime::{ConnState, Connection, ContextPools, PooledContext};
use parking_lot::RwLock;
use std::net::SocketAddr;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Client callbacks.
pub trait ClientHandler: Send + Sync + 'static {
    /// Called once the connection is established, before the first message.
    fn on_connected(&self, _conn: &Connection) {}

    /// Called once per complete message, in arrival order.
    fn handle_message(&self, conn: &Connection, packet: Packet) -> Result<(), HandlerError>;

    fn on_disconnected(&self) {}

    fn on_error(&self, _error: &NetError) {}
}

struct Shared<H> {
    handler: H,
    codec: Arc<dyn PacketCodec>,
    config: RwLock<ClientConfig>,
    /// Set from the start of `connect` until the connection is gone.
    active: AtomicBool,
    conn: RwLock<Option<Connection>>,
}

/// Single-connection client.
pub struct Client<H: ClientHandler> {
    shared: Arc<Shared<H>>,
}

impl<H: ClientHandler> Clone for Client<H> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<H: ClientHandler> Client<H> {
    /// Create a client using the length-prefixed frame format.
    pub fn new(config: ClientConfig, handler: H) -> Self {
        Self::with_codec(config, handler, LengthPrefixCodec::default())
    }

    /// Create a client with a custom frame codec.
    pub fn with_codec(config: ClientConfig, handler: H, codec: impl PacketCodec) -> Self {
        Client {
            shared: Arc::new(Shared {
                handler,
                codec: Arc::new(codec),
                config: RwLock::new(config),
                active: AtomicBool::new(false),
                conn: RwLock::new(None),
            }),
        }
    }

    pub fn handler(&self) -> &H {
        &self.shared.handler
    }

    pub fn config(&self) -> ClientConfig {
        self.shared.config.read().clone()
    }

    /// Change the configuration. Fails while connected or connecting.
    pub fn configure<F>(&self, f: F) -> NetResult<()>
    where
        F: FnOnce(&mut ClientConfig),
    {
        let mut config = self.shared.config.write();
        if self.shared.active.load(Ordering::Acquire) {
            return Err(NetError::config(
                "cannot change configuration while the client is connected",
            ));
        }
        f(&mut config);
        Ok(())
    }

    pub fn is_connected(&self) -> bool {
        self.connection().is_some_and(|conn| conn.is_connected())
    }

    /// The live connection, if any.
    pub fn connection(&self) -> Option<Connection> {
        self.shared.conn.read().clone()
    }

    /// Connect to the configured server.
    ///
    /// The configuration is validated before any socket is created. A refused
    /// or timed out connection is reported as
    /// [`ErrorKind::ConnectFailed`](crate::ErrorKind::ConnectFailed).
    pub async fn connect(&self) -> NetResult<()> {
        let config = self.config();
        config.validate(self.shared.codec.header_size())?;

        if self.shared.active.swap(true, Ordering::AcqRel) {
            return Err(NetError::State("client is already connected"));
        }

        let result = self.establish(&config).await;
        if result.is_err() {
            self.shared.active.store(false, Ordering::Release);
        }
        result
    }

    /// Close the connection. Does nothing when not connected.
    pub fn disconnect(&self) {
        let Some(conn) = self.shared.conn.write().take() else {
            return;
        };
        conn.begin_disconnect();
        self.shared.active.store(false, Ordering::Release);
        info!(conn_id = %conn.id(), peer = %conn.peer_addr(), "Disconnected");
        self.shared.handler.on_disconnected();
    }

    /// Queue a packet for the server.
    pub fn send(&self, packet: Packet) -> NetResult<()> {
        self.connection()
            .ok_or(NetError::State("client is not connected"))?
            .send(packet)
    }

    async fn establish(&self, config: &ClientConfig) -> NetResult<()> {
        let addr = config.resolve().await?;
        let pools = ContextPools::new(1, config.buffer_size)?;

        let (tx, rx) = mpsc::channel(config.send_queue);
        let conn = Connection::new(addr, ConnState::Connecting, tx);
        let stream = connect_with_timeout(addr, config.timeout_ms).await?;
        if let Err(e) = stream.set_nodelay(true) {
            debug!(error = %e, "Failed to set TCP_NODELAY");
        }

        let read_ctx = pools
            .read
            .try_acquire()
            .ok_or(NetError::State("no receive context available"))?;
        let (reader, writer) = stream.into_split();

        conn.mark_connected();
        *self.shared.conn.write() = Some(conn.clone());
        info!(conn_id = %conn.id(), peer = %addr, "Connected");

        {
            let client = self.clone();
            let conn = conn.clone();
            let pool = Arc::clone(&pools.write);
            tokio::spawn(async move {
                if let Err(e) = pipeline::send_loop(writer, rx, pool, &conn).await {
                    client.connection_fault(&conn, e);
                }
            });
        }

        self.shared.handler.on_connected(&conn);

        let client = self.clone();
        tokio::spawn(async move {
            client.serve(conn, reader, read_ctx).await;
        });
        Ok(())
    }

    async fn serve(&self, conn: Connection, reader: OwnedReadHalf, mut read_ctx: PooledContext) {
        let codec = Arc::clone(&self.shared.codec);
        let result = pipeline::receive_loop(
            reader,
            &mut read_ctx,
            &conn,
            codec.as_ref(),
            |packet| self.dispatch(&conn, packet),
        )
        .await;

        if let Err(e) = result {
            self.connection_fault(&conn, e);
        }
        drop(read_ctx);
        self.connection_lost(&conn);
    }

    fn dispatch(&self, conn: &Connection, packet: Packet) {
        let handler = &self.shared.handler;
        match panic::catch_unwind(AssertUnwindSafe(|| handler.handle_message(conn, packet))) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => self.report(NetError::Handler(e)),
            Err(payload) => self.report(NetError::handler_panic(payload)),
        }
    }

    fn connection_fault(&self, conn: &Connection, e: NetError) {
        if conn.is_closing() && matches!(e, NetError::Socket(_)) {
            debug!(conn_id = %conn.id(), error = %e, "Socket error during disconnect");
        } else {
            self.report(e);
        }
        conn.begin_disconnect();
    }

    /// Clean up after the receive loop ended; runs the disconnect callback
    /// unless `disconnect` already did.
    fn connection_lost(&self, conn: &Connection) {
        conn.begin_disconnect();
        conn.mark_disconnected();

        let mut slot = self.shared.conn.write();
        if slot.as_ref().is_some_and(|current| current.id() == conn.id()) {
            slot.take();
            drop(slot);
            self.shared.active.store(false, Ordering::Release);
            info!(conn_id = %conn.id(), "Connection closed");
            self.shared.handler.on_disconnected();
        }
    }

    fn report(&self, e: NetError) {
        warn!(kind = ?e.kind(), error = %e, "Client error");
        self.shared.handler.on_error(&e);
    }
}

async fn connect_with_timeout(addr: SocketAddr, timeout_ms: u64) -> NetResult<TcpStream> {
    match tokio::time::timeout(Duration::from_millis(timeout_ms), TcpStream::connect(addr)).await {
        Ok(Ok(stream)) => Ok(stream),
        Ok(Err(source)) => Err(NetError::ConnectFailed {
            addr: addr.to_string(),
            source,
        }),
        Err(_) => Err(NetError::ConnectTimeout {
            addr: addr.to_string(),
            timeout_ms,
        }),
    }
}
