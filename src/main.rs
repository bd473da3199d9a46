//! tcpframe sample programs
//!
//! - `tcpframe server`: echo server answering every string with `OK: '<string>'`
//! - `tcpframe client -M <text>...`: send each message and print the replies
//!
//! Configuration via CLI arguments or TOML file.

use std::time::Duration;
use tcpframe::config::{Mode, Settings};
use tcpframe::{
    Client, ClientConfig, ClientHandler, Connection, HandlerError, NetError, Packet, Server,
    ServerConfig, ServerHandler, Session,
};
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// Time to wait for each reply before giving up.
const REPLY_TIMEOUT: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let settings = Settings::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&settings.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    match settings.mode {
        Mode::Server(config) => run_server(config).await,
        Mode::Client { config, messages } => run_client(config, messages).await,
    }
}

struct EchoServer;

struct EchoSession;

impl Session for EchoSession {
    fn on_connected(&mut self, conn: &Connection) -> Result<(), HandlerError> {
        let mut packet = Packet::new();
        packet.write("Welcome!")?;
        conn.send(packet)?;
        Ok(())
    }

    fn handle_message(&mut self, conn: &Connection, mut packet: Packet) -> Result<(), HandlerError> {
        let value: String = packet.read()?;
        info!(conn_id = %conn.id(), value = %value, "Received");

        let mut reply = Packet::new();
        reply.write(format!("OK: '{value}'").as_str())?;
        conn.send(reply)?;
        Ok(())
    }
}

impl ServerHandler for EchoServer {
    type Session = EchoSession;

    fn create_session(&self, _conn: &Connection) -> EchoSession {
        EchoSession
    }

    fn on_client_connected(&self, conn: &Connection) {
        info!(conn_id = %conn.id(), peer = %conn.peer_addr(), "New client connected");
    }

    fn on_client_disconnected(&self, conn: &Connection) {
        info!(conn_id = %conn.id(), "Client disconnected");
    }

    fn on_error(&self, conn: Option<&Connection>, error: &NetError) {
        warn!(conn_id = ?conn.map(Connection::id), error = %error, "Echo server error");
    }
}

async fn run_server(config: ServerConfig) -> Result<(), Box<dyn std::error::Error>> {
    info!(host = %config.host, port = config.port, "Starting tcpframe echo server");
    let server = Server::new(config, EchoServer);

    let signal = server.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutting down");
            signal.stop();
        }
    });

    server.start().await?;
    Ok(())
}

struct PrintReplies {
    replies: mpsc::UnboundedSender<String>,
}

impl ClientHandler for PrintReplies {
    fn handle_message(&self, _conn: &Connection, mut packet: Packet) -> Result<(), HandlerError> {
        self.replies.send(packet.read()?)?;
        Ok(())
    }

    fn on_disconnected(&self) {
        info!("Disconnected from server");
    }

    fn on_error(&self, error: &NetError) {
        error!(error = %error, "Client error");
    }
}

async fn run_client(
    config: ClientConfig,
    messages: Vec<String>,
) -> Result<(), Box<dyn std::error::Error>> {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let client = Client::new(config, PrintReplies { replies: tx });
    client.connect().await?;

    // The server greets first.
    if let Ok(Some(greeting)) = tokio::time::timeout(REPLY_TIMEOUT, rx.recv()).await {
        println!("{greeting}");
    }

    for message in messages {
        let mut packet = Packet::new();
        packet.write(message.as_str())?;
        client.send(packet)?;

        match tokio::time::timeout(REPLY_TIMEOUT, rx.recv()).await {
            Ok(Some(reply)) => println!("{reply}"),
            Ok(None) => break,
            Err(_) => {
                warn!(message = %message, "No reply from server");
                break;
            }
        }
    }

    client.disconnect();
    Ok(())
}
