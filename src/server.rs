//! TCP server engine.
//!
//! Accepts connections, gives each one a receive context from a bounded pool,
//! reassembles incoming frames and hands every complete message to the
//! connection's [`Session`]. Faults on one connection are reported through
//! [`ServerHandler::on_error`] and never stop the accept loop.

use crate::config::ServerConfig;
use crate::error::{HandlerError, NetError, NetResult};
use crate::packet::{LengthPrefixCodec, Packet, PacketCodec};
use crate::runtime::pipeline;
use crate::runtime::{
    ConnState, Connection, ConnectionId, ConnectionRegistry, ContextPools, PooledContext,
};
use parking_lot::RwLock;
use std::io;
use std::net::SocketAddr;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch, Notify};
use tracing::{debug, error, info, warn};

/// Per-connection message handler.
pub trait Session: Send + 'static {
    /// Called once when the connection is established, before the first
    /// message is received.
    fn on_connected(&mut self, _conn: &Connection) -> Result<(), HandlerError> {
        Ok(())
    }

    /// Called once per complete message, in arrival order.
    fn handle_message(&mut self, conn: &Connection, packet: Packet) -> Result<(), HandlerError>;
}

/// Server-wide callbacks.
///
/// Connection callbacks run synchronously on the connection's own task, never
/// on the accept loop; a slow callback stalls that connection only.
pub trait ServerHandler: Send + Sync + 'static {
    type Session: Session;

    /// Create the session for a newly accepted connection.
    fn create_session(&self, conn: &Connection) -> Self::Session;

    /// Called during `start`, after the pools are built and before the
    /// first connection is accepted.
    fn initialize(&self) {}

    fn on_client_connected(&self, _conn: &Connection) {}

    fn on_client_disconnected(&self, _conn: &Connection) {}

    /// A fault on a connection (or on accept when `conn` is `None`).
    fn on_error(&self, _conn: Option<&Connection>, _error: &NetError) {}
}

// Lifecycle of a `start` call. Only RUNNING -> STOPPING releases the wait.
const IDLE: u8 = 0;
const RUNNING: u8 = 1;
const STOPPING: u8 = 2;

/// State that only exists while the server is running.
struct Engine {
    registry: ConnectionRegistry,
    pools: ContextPools,
    local_addr: SocketAddr,
    send_queue: usize,
}

struct Shared<H> {
    handler: H,
    codec: Arc<dyn PacketCodec>,
    config: RwLock<ServerConfig>,
    lifecycle: AtomicU8,
    shutdown: Notify,
    engine: RwLock<Option<Arc<Engine>>>,
    listening: watch::Sender<Option<SocketAddr>>,
}

/// Server instance
pub struct Server<H: ServerHandler> {
    shared: Arc<Shared<H>>,
}

impl<H: ServerHandler> Clone for Server<H> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<H: ServerHandler> Server<H> {
    /// Create a server using the length-prefixed frame format.
    pub fn new(config: ServerConfig, handler: H) -> Self {
        Self::with_codec(config, handler, LengthPrefixCodec::default())
    }

    /// Create a server with a custom frame codec.
    pub fn with_codec(config: ServerConfig, handler: H, codec: impl PacketCodec) -> Self {
        let (listening, _) = watch::channel(None);
        Server {
            shared: Arc::new(Shared {
                handler,
                codec: Arc::new(codec),
                config: RwLock::new(config),
                lifecycle: AtomicU8::new(IDLE),
                shutdown: Notify::new(),
                engine: RwLock::new(None),
                listening,
            }),
        }
    }

    pub fn handler(&self) -> &H {
        &self.shared.handler
    }

    /// Current configuration.
    pub fn config(&self) -> ServerConfig {
        self.shared.config.read().clone()
    }

    /// Change the configuration. Fails while the server is running.
    pub fn configure<F>(&self, f: F) -> NetResult<()>
    where
        F: FnOnce(&mut ServerConfig),
    {
        let mut config = self.shared.config.write();
        if self.is_running() {
            return Err(NetError::config(
                "cannot change configuration while the server is running",
            ));
        }
        f(&mut config);
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.shared.lifecycle.load(Ordering::Acquire) != IDLE
    }

    /// Validate the configuration, bind, and serve until [`stop`](Self::stop)
    /// is called.
    pub async fn start(&self) -> NetResult<()> {
        if self
            .shared
            .lifecycle
            .compare_exchange(IDLE, RUNNING, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(NetError::State("server is already running"));
        }

        let result = self.run().await;

        self.shared.listening.send_replace(None);
        let _config = self.shared.config.write();
        self.shared.lifecycle.store(IDLE, Ordering::Release);
        result
    }

    /// Release a running `start`. Calling it again, or when the server is not
    /// running, does nothing.
    pub fn stop(&self) {
        if self
            .shared
            .lifecycle
            .compare_exchange(RUNNING, STOPPING, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            self.shared.shutdown.notify_waiters();
        }
    }

    /// Disconnect one client and invoke the disconnect callback.
    pub fn disconnect_client(&self, id: ConnectionId) -> NetResult<()> {
        let conn = self
            .engine()
            .and_then(|engine| engine.registry.remove(id))
            .ok_or(NetError::ConnectionNotFound(id))?;

        conn.begin_disconnect();
        debug!(conn_id = %id, peer = %conn.peer_addr(), "Client disconnected by server");
        self.shared.handler.on_client_disconnected(&conn);
        Ok(())
    }

    /// Snapshot of the connected clients.
    pub fn clients(&self) -> Vec<Connection> {
        self.engine()
            .map(|engine| engine.registry.snapshot())
            .unwrap_or_default()
    }

    pub fn client(&self, id: ConnectionId) -> Option<Connection> {
        self.engine().and_then(|engine| engine.registry.get(id))
    }

    /// Number of connected clients.
    pub fn connection_count(&self) -> usize {
        self.engine().map_or(0, |engine| engine.registry.len())
    }

    /// Send one packet to every connected client. Returns how many clients
    /// it was queued for.
    pub fn broadcast(&self, packet: Packet) -> NetResult<usize> {
        let frame = packet.into_frame()?;
        Ok(self
            .clients()
            .iter()
            .filter(|conn| conn.send_frame(frame.clone()).is_ok())
            .count())
    }

    /// Address the server is listening on, while running.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.engine().map(|engine| engine.local_addr)
    }

    /// Wait until the server is listening and return its address.
    pub async fn wait_listening(&self) -> NetResult<SocketAddr> {
        let mut rx = self.shared.listening.subscribe();
        let addr = *rx
            .wait_for(Option::is_some)
            .await
            .map_err(|_| NetError::State("server was dropped"))?;
        addr.ok_or(NetError::State("server is not listening"))
    }

    fn engine(&self) -> Option<Arc<Engine>> {
        self.shared.engine.read().clone()
    }

    async fn run(&self) -> NetResult<()> {
        let config = self.config();
        config.validate(self.shared.codec.header_size())?;
        let addr = config.resolve().await?;

        let pools = ContextPools::new(config.max_connections, config.buffer_size)?;
        self.shared.handler.initialize();

        let listener = TcpListener::from_std(create_listener(addr, config.backlog)?)?;
        let local_addr = listener.local_addr()?;
        let engine = Arc::new(Engine {
            registry: ConnectionRegistry::new(config.max_connections),
            pools,
            local_addr,
            send_queue: config.send_queue,
        });
        *self.shared.engine.write() = Some(Arc::clone(&engine));
        self.shared.listening.send_replace(Some(local_addr));

        info!(
            address = %local_addr,
            max_connections = config.max_connections,
            buffer_size = config.buffer_size,
            backlog = config.backlog,
            "Server listening"
        );

        let accept = tokio::spawn(accept_loop(self.clone(), listener, Arc::clone(&engine)));

        let shutdown = self.shared.shutdown.notified();
        tokio::pin!(shutdown);
        shutdown.as_mut().enable();
        if self.shared.lifecycle.load(Ordering::Acquire) != STOPPING {
            shutdown.await;
        }

        accept.abort();
        let _ = accept.await;
        *self.shared.engine.write() = None;

        for conn in engine.registry.drain() {
            conn.begin_disconnect();
            self.shared.handler.on_client_disconnected(&conn);
        }
        engine.pools.release();

        info!(address = %local_addr, "Server stopped");
        Ok(())
    }

    fn admit(&self, engine: &Arc<Engine>, stream: TcpStream, peer: SocketAddr) {
        let Some(read_ctx) = engine.pools.read.try_acquire() else {
            warn!(peer = %peer, "Receive pool exhausted, rejecting connection");
            return;
        };

        if let Err(e) = stream.set_nodelay(true) {
            debug!(peer = %peer, error = %e, "Failed to set TCP_NODELAY");
        }

        let (tx, rx) = mpsc::channel(engine.send_queue);
        let conn = Connection::new(peer, ConnState::Connected, tx);
        if !engine.registry.insert(conn.clone()) {
            warn!(peer = %peer, "Connection limit reached, rejecting connection");
            return;
        }
        debug!(conn_id = %conn.id(), peer = %peer, "Client connected");

        let (reader, writer) = stream.into_split();

        {
            let server = self.clone();
            let conn = conn.clone();
            let pool = Arc::clone(&engine.pools.write);
            tokio::spawn(async move {
                if let Err(e) = pipeline::send_loop(writer, rx, pool, &conn).await {
                    server.connection_fault(&conn, e);
                }
            });
        }

        let server = self.clone();
        let engine = Arc::clone(engine);
        tokio::spawn(async move {
            server.serve(engine, conn, reader, read_ctx).await;
        });
    }

    async fn serve(
        &self,
        engine: Arc<Engine>,
        conn: Connection,
        reader: OwnedReadHalf,
        mut read_ctx: PooledContext,
    ) {
        let mut session = self.shared.handler.create_session(&conn);
        self.shared.handler.on_client_connected(&conn);
        if let Err(e) = session.on_connected(&conn) {
            self.report(Some(&conn), NetError::Handler(e));
        }

        let codec = Arc::clone(&self.shared.codec);
        let result = pipeline::receive_loop(
            reader,
            &mut read_ctx,
            &conn,
            codec.as_ref(),
            |packet| self.dispatch(&mut session, &conn, packet),
        )
        .await;

        if let Err(e) = result {
            self.connection_fault(&conn, e);
        }
        drop(read_ctx);
        self.connection_lost(&engine, &conn);
    }

    fn dispatch(&self, session: &mut H::Session, conn: &Connection, packet: Packet) {
        match panic::catch_unwind(AssertUnwindSafe(|| session.handle_message(conn, packet))) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => self.report(Some(conn), NetError::Handler(e)),
            Err(payload) => self.report(Some(conn), NetError::handler_panic(payload)),
        }
    }

    /// Tear down after a socket or framing fault. Faults observed after
    /// teardown was requested are expected and not reported.
    fn connection_fault(&self, conn: &Connection, e: NetError) {
        if conn.is_closing() && matches!(e, NetError::Socket(_)) {
            debug!(conn_id = %conn.id(), error = %e, "Socket error during disconnect");
        } else {
            self.report(Some(conn), e);
        }
        conn.begin_disconnect();
    }

    fn connection_lost(&self, engine: &Engine, conn: &Connection) {
        conn.begin_disconnect();
        conn.mark_disconnected();
        if engine.registry.remove(conn.id()).is_some() {
            debug!(conn_id = %conn.id(), peer = %conn.peer_addr(), "Client disconnected");
            self.shared.handler.on_client_disconnected(conn);
        }
    }

    fn report(&self, conn: Option<&Connection>, e: NetError) {
        match conn {
            Some(conn) => warn!(conn_id = %conn.id(), kind = ?e.kind(), error = %e, "Connection error"),
            None => error!(kind = ?e.kind(), error = %e, "Server error"),
        }
        self.shared.handler.on_error(conn, &e);
    }
}

async fn accept_loop<H: ServerHandler>(server: Server<H>, listener: TcpListener, engine: Arc<Engine>) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => server.admit(&engine, stream, peer),
            Err(e) => {
                error!(error = %e, "Failed to accept connection");
                server.shared.handler.on_error(None, &NetError::Socket(e));
            }
        }
    }
}

/// Create a TCP listener with SO_REUSEADDR and the configured backlog.
fn create_listener(addr: SocketAddr, backlog: u32) -> io::Result<std::net::TcpListener> {
    let socket = socket2::Socket::new(
        socket2::Domain::for_address(addr),
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(i32::try_from(backlog).unwrap_or(i32::MAX))?;

    Ok(socket.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use parking_lot::Mutex;
    use std::future::Future;
    use std::sync::atomic::AtomicUsize;
    use std::time::{Duration, Instant};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::task::JoinHandle;

    #[derive(Default)]
    struct Events {
        connected: Vec<ConnectionId>,
        disconnected: Vec<ConnectionId>,
        errors: Vec<ErrorKind>,
        messages: Vec<String>,
        initialized: bool,
    }

    #[derive(Clone, Default)]
    struct Recorder {
        events: Arc<Mutex<Events>>,
        greeting: Option<&'static str>,
    }

    struct EchoSession {
        events: Arc<Mutex<Events>>,
        greeting: Option<&'static str>,
    }

    impl Session for EchoSession {
        fn on_connected(&mut self, conn: &Connection) -> Result<(), HandlerError> {
            if let Some(greeting) = self.greeting {
                let mut packet = Packet::new();
                packet.write(greeting)?;
                conn.send(packet)?;
            }
            Ok(())
        }

        fn handle_message(&mut self, conn: &Connection, mut packet: Packet) -> Result<(), HandlerError> {
            let text: String = packet.read()?;
            self.events.lock().messages.push(text.clone());
            match text.as_str() {
                "boom" => Err("rejected".into()),
                "panic" => panic!("session exploded"),
                _ => {
                    let mut reply = Packet::new();
                    reply.write(format!("OK: {text}").as_str())?;
                    conn.send(reply)?;
                    Ok(())
                }
            }
        }
    }

    impl ServerHandler for Recorder {
        type Session = EchoSession;

        fn create_session(&self, _conn: &Connection) -> EchoSession {
            EchoSession {
                events: Arc::clone(&self.events),
                greeting: self.greeting,
            }
        }

        fn initialize(&self) {
            self.events.lock().initialized = true;
        }

        fn on_client_connected(&self, conn: &Connection) {
            self.events.lock().connected.push(conn.id());
        }

        fn on_client_disconnected(&self, conn: &Connection) {
            self.events.lock().disconnected.push(conn.id());
        }

        fn on_error(&self, _conn: Option<&Connection>, error: &NetError) {
            self.events.lock().errors.push(error.kind());
        }
    }

    fn config(port: u16) -> ServerConfig {
        ServerConfig {
            port,
            buffer_size: 512,
            max_connections: 4,
            ..Default::default()
        }
    }

    async fn spawn_server<H: ServerHandler>(
        config: ServerConfig,
        handler: H,
    ) -> (Server<H>, JoinHandle<NetResult<()>>) {
        let server = Server::new(config, handler);
        let handle = {
            let server = server.clone();
            tokio::spawn(async move { server.start().await })
        };
        tokio::time::timeout(Duration::from_secs(5), server.wait_listening())
            .await
            .expect("server did not start listening")
            .unwrap();
        (server, handle)
    }

    async fn connect<H: ServerHandler>(server: &Server<H>) -> TcpStream {
        TcpStream::connect(server.local_addr().unwrap()).await.unwrap()
    }

    async fn send_text(stream: &mut TcpStream, text: &str) {
        let mut packet = Packet::new();
        packet.write(text).unwrap();
        stream.write_all(&packet.into_frame().unwrap()).await.unwrap();
    }

    async fn recv_text(stream: &mut TcpStream) -> String {
        let mut header = [0u8; 4];
        stream.read_exact(&mut header).await.unwrap();
        let mut payload = vec![0u8; u32::from_le_bytes(header) as usize - 4];
        stream.read_exact(&mut payload).await.unwrap();
        Packet::from_payload(payload).read::<String>().unwrap()
    }

    async fn eventually<F: Fn() -> bool>(cond: F) {
        for _ in 0..200 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    async fn within<T>(fut: impl Future<Output = T>) -> T {
        tokio::time::timeout(Duration::from_secs(5), fut)
            .await
            .expect("timed out")
    }

    #[tokio::test]
    async fn test_start_rejects_invalid_config() {
        let server = Server::new(ServerConfig::default(), Recorder::default());
        let err = server.start().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Configuration);
        assert!(!server.is_running());

        server.configure(|c| c.port = 47101).unwrap();
        server.configure(|c| c.buffer_size = 2).unwrap();
        assert_eq!(server.start().await.unwrap_err().kind(), ErrorKind::Configuration);
    }

    #[tokio::test]
    async fn test_echo_round_trip() {
        let handler = Recorder::default();
        let (server, handle) = spawn_server(config(47102), handler.clone()).await;
        assert!(handler.events.lock().initialized);

        let mut stream = connect(&server).await;
        send_text(&mut stream, "hello").await;
        assert_eq!(within(recv_text(&mut stream)).await, "OK: hello");

        // Several frames in one write arrive as separate messages, in order.
        let mut batch = Vec::new();
        for text in ["a", "b", "c"] {
            let mut packet = Packet::new();
            packet.write(text).unwrap();
            batch.extend_from_slice(&packet.into_frame().unwrap());
        }
        stream.write_all(&batch).await.unwrap();
        for expected in ["OK: a", "OK: b", "OK: c"] {
            assert_eq!(within(recv_text(&mut stream)).await, expected);
        }

        assert_eq!(server.connection_count(), 1);
        assert_eq!(handler.events.lock().messages, vec!["hello", "a", "b", "c"]);

        server.stop();
        within(handle).await.unwrap().unwrap();
        assert!(!server.is_running());
        assert_eq!(server.connection_count(), 0);
        assert_eq!(handler.events.lock().disconnected.len(), 1);
    }

    #[tokio::test]
    async fn test_start_twice_and_stop_idempotent() {
        let (server, handle) = spawn_server(config(47103), Recorder::default()).await;

        let err = server.start().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::State);

        let err = server.configure(|c| c.backlog = 1).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Configuration);

        server.stop();
        server.stop();
        within(handle).await.unwrap().unwrap();
        server.stop();

        // Stopped servers can be reconfigured and restarted.
        server.configure(|c| c.port = 47104).unwrap();
        let handle = {
            let server = server.clone();
            tokio::spawn(async move { server.start().await })
        };
        let addr = within(server.wait_listening()).await.unwrap();
        assert_eq!(addr.port(), 47104);
        server.stop();
        within(handle).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_disconnect_client() {
        let handler = Recorder::default();
        let (server, handle) = spawn_server(config(47105), handler.clone()).await;

        let err = server
            .disconnect_client(ConnectionId::from_raw(u64::MAX))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ConnectionNotFound);

        let mut stream = connect(&server).await;
        eventually(|| server.connection_count() == 1).await;
        let id = server.clients()[0].id();
        assert_eq!(server.client(id).unwrap().peer_addr(), stream.local_addr().unwrap());

        server.disconnect_client(id).unwrap();
        assert!(server.client(id).is_none());

        // The peer sees the socket close.
        let mut buf = [0u8; 8];
        assert_eq!(within(stream.read(&mut buf)).await.unwrap(), 0);

        // Exactly one disconnect callback, and no fault reported.
        tokio::time::sleep(Duration::from_millis(50)).await;
        let events = handler.events.lock();
        assert_eq!(events.disconnected, vec![id]);
        assert!(events.errors.is_empty(), "{:?}", events.errors);
        drop(events);

        assert!(server.disconnect_client(id).is_err());
        server.stop();
        within(handle).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_pool_exhaustion_rejects_connection() {
        let mut config = config(47106);
        config.max_connections = 1;
        let handler = Recorder::default();
        let (server, handle) = spawn_server(config, handler.clone()).await;

        let mut first = connect(&server).await;
        eventually(|| server.connection_count() == 1).await;

        let mut second = connect(&server).await;
        let mut buf = [0u8; 8];
        let n = within(second.read(&mut buf)).await.unwrap_or(0);
        assert_eq!(n, 0);

        // The admitted connection is unaffected.
        send_text(&mut first, "still here").await;
        assert_eq!(within(recv_text(&mut first)).await, "OK: still here");
        assert_eq!(handler.events.lock().connected.len(), 1);

        // Once it leaves, its context is free for the next client.
        drop(first);
        eventually(|| server.connection_count() == 0).await;
        let mut third = connect(&server).await;
        send_text(&mut third, "next").await;
        assert_eq!(within(recv_text(&mut third)).await, "OK: next");

        server.stop();
        within(handle).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_handler_errors_do_not_stop_receiving() {
        let handler = Recorder::default();
        let (server, handle) = spawn_server(config(47107), handler.clone()).await;

        let mut stream = connect(&server).await;
        send_text(&mut stream, "boom").await;
        send_text(&mut stream, "panic").await;
        send_text(&mut stream, "after").await;
        assert_eq!(within(recv_text(&mut stream)).await, "OK: after");

        let events = handler.events.lock();
        assert_eq!(events.errors, vec![ErrorKind::Handler, ErrorKind::Handler]);
        assert!(events.disconnected.is_empty());
        drop(events);

        server.stop();
        within(handle).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_corrupt_frame_disconnects_only_that_client() {
        let handler = Recorder::default();
        let (server, handle) = spawn_server(config(47108), handler.clone()).await;

        let mut good = connect(&server).await;
        let mut bad = connect(&server).await;
        eventually(|| server.connection_count() == 2).await;

        bad.write_all(&[0, 0, 0, 0]).await.unwrap();
        let mut buf = [0u8; 8];
        assert_eq!(within(bad.read(&mut buf)).await.unwrap_or(0), 0);
        eventually(|| server.connection_count() == 1).await;

        send_text(&mut good, "ping").await;
        assert_eq!(within(recv_text(&mut good)).await, "OK: ping");

        let events = handler.events.lock();
        assert_eq!(events.errors, vec![ErrorKind::Framing]);
        assert_eq!(events.disconnected.len(), 1);
        drop(events);

        server.stop();
        within(handle).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_truncated_frame_is_not_delivered() {
        let handler = Recorder::default();
        let (server, handle) = spawn_server(config(47109), handler.clone()).await;

        let mut stream = connect(&server).await;
        let mut frame = 100u32.to_le_bytes().to_vec();
        frame.extend_from_slice(&[b'x'; 50]);
        stream.write_all(&frame).await.unwrap();
        drop(stream);

        eventually(|| handler.events.lock().disconnected.len() == 1).await;
        let events = handler.events.lock();
        assert!(events.messages.is_empty());
        assert_eq!(events.errors, vec![ErrorKind::Framing]);
        drop(events);

        server.stop();
        within(handle).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_greeting_and_broadcast() {
        let handler = Recorder {
            greeting: Some("welcome"),
            ..Default::default()
        };
        let (server, handle) = spawn_server(config(47110), handler).await;

        let mut a = connect(&server).await;
        let mut b = connect(&server).await;
        assert_eq!(within(recv_text(&mut a)).await, "welcome");
        assert_eq!(within(recv_text(&mut b)).await, "welcome");
        eventually(|| server.connection_count() == 2).await;

        let mut packet = Packet::new();
        packet.write("news").unwrap();
        assert_eq!(server.broadcast(packet).unwrap(), 2);
        assert_eq!(within(recv_text(&mut a)).await, "news");
        assert_eq!(within(recv_text(&mut b)).await, "news");

        server.stop();
        within(handle).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_stop_right_after_start() {
        let server = Server::new(config(47111), Recorder::default());
        let handle = {
            let server = server.clone();
            tokio::spawn(async move { server.start().await })
        };

        // Stop as soon as `start` has claimed the server, before it listens.
        while !server.is_running() {
            tokio::task::yield_now().await;
        }
        server.stop();
        within(handle).await.unwrap().unwrap();
        assert!(!server.is_running());

        // The stop did not leak into the next run.
        let handle = {
            let server = server.clone();
            tokio::spawn(async move { server.start().await })
        };
        within(server.wait_listening()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!handle.is_finished());
        server.stop();
        within(handle).await.unwrap().unwrap();
    }

    struct SlowGreeter {
        sessions: AtomicUsize,
        connected: Mutex<Vec<Instant>>,
    }

    struct SlowGreeting {
        slow: bool,
    }

    impl Session for SlowGreeting {
        fn on_connected(&mut self, _conn: &Connection) -> Result<(), HandlerError> {
            if self.slow {
                std::thread::sleep(Duration::from_millis(1500));
            }
            Ok(())
        }

        fn handle_message(&mut self, _conn: &Connection, _packet: Packet) -> Result<(), HandlerError> {
            Ok(())
        }
    }

    impl ServerHandler for SlowGreeter {
        type Session = SlowGreeting;

        fn create_session(&self, _conn: &Connection) -> SlowGreeting {
            SlowGreeting {
                slow: self.sessions.fetch_add(1, Ordering::SeqCst) == 0,
            }
        }

        fn on_client_connected(&self, _conn: &Connection) {
            self.connected.lock().push(Instant::now());
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_slow_greeting_does_not_block_accept() {
        let handler = SlowGreeter {
            sessions: AtomicUsize::new(0),
            connected: Mutex::new(Vec::new()),
        };
        let (server, handle) = spawn_server(config(47112), handler).await;

        let _first = connect(&server).await;
        eventually(|| server.handler().connected.lock().len() == 1).await;

        let started = Instant::now();
        let _second = connect(&server).await;
        eventually(|| server.handler().connected.lock().len() == 2).await;
        assert!(
            started.elapsed() < Duration::from_millis(1000),
            "second client admitted after {:?}",
            started.elapsed()
        );

        server.stop();
        within(handle).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_disconnect_client_with_stalled_sends() {
        let mut config = config(47113);
        config.max_connections = 1;
        let handler = Recorder::default();
        let (server, handle) = spawn_server(config, handler.clone()).await;

        // The peer never reads, so the server's writes back up.
        let mut stream = connect(&server).await;
        eventually(|| server.connection_count() == 1).await;
        let id = server.clients()[0].id();

        let big = "x".repeat(60_000);
        for _ in 0..400 {
            let mut packet = Packet::new();
            packet.write(big.as_str()).unwrap();
            assert_eq!(server.broadcast(packet).unwrap(), 1);
        }
        let engine = server.engine().unwrap();
        eventually(|| engine.pools.write.available() == 0).await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        server.disconnect_client(id).unwrap();
        eventually(|| engine.pools.write.available() == engine.pools.write.capacity()).await;

        // Whatever was already in flight drains, then the peer sees EOF.
        let mut buf = vec![0u8; 64 * 1024];
        within(async {
            while stream.read(&mut buf).await.unwrap() > 0 {}
        })
        .await;

        assert_eq!(handler.events.lock().disconnected, vec![id]);
        assert!(handler.events.lock().errors.is_empty());

        server.stop();
        within(handle).await.unwrap().unwrap();
    }
}
