//! Configuration for the server and client engines.
//!
//! The engine configs are plain structs with defaults that can also be loaded
//! from the `[server]` / `[client]` tables of a TOML file. The sample binary
//! merges command-line arguments over the file; CLI arguments take
//! precedence over config file values.

use crate::error::{NetError, NetResult};
use clap::{Args, Parser, Subcommand};
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::PathBuf;
use thiserror::Error;

/// Largest accepted receive/send buffer.
pub const MAX_BUFFER_SIZE: usize = 16 * 1024 * 1024;

/// Largest accepted total size of one context pool's buffers.
pub const MAX_POOL_BYTES: usize = 1024 * 1024 * 1024;

/// Listening server configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Host name or address to bind (`0.0.0.0` for all interfaces).
    pub host: String,
    /// Port to bind. Must be set.
    pub port: u16,
    /// Listen backlog.
    pub backlog: u32,
    /// Size of each receive and send buffer.
    pub buffer_size: usize,
    /// Maximum number of simultaneously connected clients.
    pub max_connections: usize,
    /// Frames that may wait in each connection's outbound queue.
    pub send_queue: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: 0,
            backlog: 50,
            buffer_size: 4096,
            max_connections: 100,
            send_queue: 1024,
        }
    }
}

impl ServerConfig {
    /// Check everything that can be checked without touching the network.
    pub fn validate(&self, header_size: usize) -> NetResult<()> {
        validate_endpoint(&self.host, self.port)?;
        validate_buffer_size(self.buffer_size, header_size)?;
        if self.max_connections == 0 {
            return Err(NetError::config("max_connections must be greater than 0"));
        }
        validate_pool_size(self.max_connections, self.buffer_size)?;
        validate_send_queue(self.send_queue)
    }

    /// Resolve the bind address.
    pub async fn resolve(&self) -> NetResult<SocketAddr> {
        resolve(&self.host, self.port).await
    }
}

/// Outbound client configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Host name or address of the server.
    pub host: String,
    /// Server port. Must be set.
    pub port: u16,
    /// Size of the receive and send buffers.
    pub buffer_size: usize,
    /// Connect timeout in milliseconds.
    pub timeout_ms: u64,
    /// Frames that may wait in the outbound queue.
    pub send_queue: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: 0,
            buffer_size: 1024,
            timeout_ms: 5000,
            send_queue: 1024,
        }
    }
}

impl ClientConfig {
    /// Check everything that can be checked without touching the network.
    pub fn validate(&self, header_size: usize) -> NetResult<()> {
        validate_endpoint(&self.host, self.port)?;
        validate_buffer_size(self.buffer_size, header_size)?;
        if self.timeout_ms == 0 {
            return Err(NetError::config("timeout_ms must be greater than 0"));
        }
        validate_send_queue(self.send_queue)
    }

    /// Resolve the server address.
    pub async fn resolve(&self) -> NetResult<SocketAddr> {
        resolve(&self.host, self.port).await
    }
}

fn validate_endpoint(host: &str, port: u16) -> NetResult<()> {
    if host.trim().is_empty() {
        return Err(NetError::config("host must not be empty"));
    }
    if port == 0 {
        return Err(NetError::config("port must be greater than 0"));
    }
    Ok(())
}

fn validate_buffer_size(buffer_size: usize, header_size: usize) -> NetResult<()> {
    if buffer_size <= header_size {
        return Err(NetError::config(format!(
            "buffer_size {buffer_size} must be larger than the {header_size} byte frame header"
        )));
    }
    if buffer_size > MAX_BUFFER_SIZE {
        return Err(NetError::config(format!(
            "buffer_size {buffer_size} exceeds the {MAX_BUFFER_SIZE} byte limit"
        )));
    }
    Ok(())
}

fn validate_pool_size(max_connections: usize, buffer_size: usize) -> NetResult<()> {
    match max_connections.checked_mul(buffer_size) {
        Some(total) if total <= MAX_POOL_BYTES => Ok(()),
        _ => Err(NetError::config(format!(
            "{max_connections} connections of {buffer_size} byte buffers exceed the \
             {MAX_POOL_BYTES} byte pool limit"
        ))),
    }
}

fn validate_send_queue(send_queue: usize) -> NetResult<()> {
    if send_queue == 0 {
        return Err(NetError::config("send_queue must be greater than 0"));
    }
    Ok(())
}

async fn resolve(host: &str, port: u16) -> NetResult<SocketAddr> {
    let mut addrs = tokio::net::lookup_host((host, port))
        .await
        .map_err(|e| NetError::config(format!("cannot resolve host '{host}': {e}")))?;
    addrs
        .next()
        .ok_or_else(|| NetError::config(format!("host '{host}' resolved to no addresses")))
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

/// Command-line arguments for the sample programs
#[derive(Parser, Debug)]
#[command(name = "tcpframe")]
#[command(version = "0.1.0")]
#[command(about = "Length-prefixed TCP echo server and client", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, default_value = "info")]
    pub log_level: String,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the echo server
    Server(ServerArgs),
    /// Connect to an echo server and send messages
    Client(ClientArgs),
}

#[derive(Args, Debug)]
pub struct ServerArgs {
    /// Host to bind to
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Listen backlog
    #[arg(long)]
    pub backlog: Option<u32>,

    /// Receive/send buffer size in bytes
    #[arg(short, long)]
    pub buffer_size: Option<usize>,

    /// Maximum number of connected clients
    #[arg(short = 'm', long)]
    pub max_connections: Option<usize>,

    /// Outbound frames queued per connection
    #[arg(long)]
    pub send_queue: Option<usize>,
}

#[derive(Args, Debug)]
pub struct ClientArgs {
    /// Server host
    #[arg(long)]
    pub host: Option<String>,

    /// Server port
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Receive/send buffer size in bytes
    #[arg(short, long)]
    pub buffer_size: Option<usize>,

    /// Connect timeout in milliseconds
    #[arg(short, long)]
    pub timeout_ms: Option<u64>,

    /// Outbound frames queued before sends fail
    #[arg(long)]
    pub send_queue: Option<usize>,

    /// Message to send (repeatable)
    #[arg(short = 'M', long = "message", required = true)]
    pub messages: Vec<String>,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub client: ClientConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Logging configuration
#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

/// What the binary was asked to run.
#[derive(Debug, Clone)]
pub enum Mode {
    Server(ServerConfig),
    Client {
        config: ClientConfig,
        messages: Vec<String>,
    },
}

/// Final resolved settings for the binary
#[derive(Debug, Clone)]
pub struct Settings {
    pub mode: Mode,
    pub log_level: String,
}

impl Settings {
    /// Load settings from CLI args and optional TOML file.
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_args(CliArgs::parse())
    }

    /// Merge parsed CLI args over the TOML file they name, if any.
    pub fn from_args(cli: CliArgs) -> Result<Self, ConfigError> {
        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents)
                .map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        let mode = match cli.command {
            Command::Server(args) => {
                let file = toml_config.server;
                Mode::Server(ServerConfig {
                    host: args.host.unwrap_or(file.host),
                    port: args.port.unwrap_or(file.port),
                    backlog: args.backlog.unwrap_or(file.backlog),
                    buffer_size: args.buffer_size.unwrap_or(file.buffer_size),
                    max_connections: args.max_connections.unwrap_or(file.max_connections),
                    send_queue: args.send_queue.unwrap_or(file.send_queue),
                })
            }
            Command::Client(args) => {
                let file = toml_config.client;
                Mode::Client {
                    config: ClientConfig {
                        host: args.host.unwrap_or(file.host),
                        port: args.port.unwrap_or(file.port),
                        buffer_size: args.buffer_size.unwrap_or(file.buffer_size),
                        timeout_ms: args.timeout_ms.unwrap_or(file.timeout_ms),
                        send_queue: args.send_queue.unwrap_or(file.send_queue),
                    },
                    messages: args.messages,
                }
            }
        };

        Ok(Settings {
            mode,
            log_level: if cli.log_level != "info" {
                cli.log_level
            } else {
                toml_config.logging.level
            },
        })
    }
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{}': {1}", .0.display())]
    FileRead(PathBuf, #[source] std::io::Error),
    #[error("Failed to parse config file '{}': {1}", .0.display())]
    TomlParse(PathBuf, #[source] toml::de::Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn test_default_config() {
        let config = TomlConfig::default();
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.server.port, 0);
        assert_eq!(config.server.backlog, 50);
        assert_eq!(config.server.buffer_size, 4096);
        assert_eq!(config.server.max_connections, 100);
        assert_eq!(config.client.buffer_size, 1024);
        assert_eq!(config.client.timeout_ms, 5000);
        assert_eq!(config.server.send_queue, 1024);
        assert_eq!(config.client.send_queue, 1024);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_toml_parsing() {
        let toml_str = r#"
            [server]
            host = "0.0.0.0"
            port = 4444
            max_connections = 8

            [client]
            port = 4444
            timeout_ms = 250

            [logging]
            level = "debug"
        "#;

        let config: TomlConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.server.port, 4444);
        assert_eq!(config.server.max_connections, 8);
        assert_eq!(config.server.backlog, 50);
        assert_eq!(config.client.host, "127.0.0.1");
        assert_eq!(config.client.timeout_ms, 250);
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn test_validation() {
        let mut config = ServerConfig {
            port: 4444,
            ..Default::default()
        };
        assert!(config.validate(4).is_ok());

        config.port = 0;
        assert_eq!(config.validate(4).unwrap_err().kind(), ErrorKind::Configuration);

        config.port = 4444;
        config.buffer_size = 4;
        assert!(config.validate(4).is_err());

        config.buffer_size = 512;
        config.max_connections = 0;
        assert!(config.validate(4).is_err());

        config.max_connections = 1;
        config.send_queue = 0;
        assert!(config.validate(4).is_err());

        config.send_queue = 1;
        config.host = " ".into();
        assert!(config.validate(4).is_err());

        let client = ClientConfig::default();
        assert!(client.validate(4).is_err());
        let client = ClientConfig {
            port: 1,
            ..Default::default()
        };
        assert!(client.validate(4).is_ok());
    }

    #[test]
    fn test_validation_rejects_oversized_pools() {
        let mut config = ServerConfig {
            port: 4444,
            ..Default::default()
        };

        config.buffer_size = usize::MAX;
        let err = config.validate(4).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Configuration);

        config.buffer_size = MAX_BUFFER_SIZE;
        config.max_connections = usize::MAX / 2;
        assert_eq!(config.validate(4).unwrap_err().kind(), ErrorKind::Configuration);

        config.max_connections = MAX_POOL_BYTES / MAX_BUFFER_SIZE;
        assert!(config.validate(4).is_ok());

        let client = ClientConfig {
            port: 1,
            buffer_size: MAX_BUFFER_SIZE + 1,
            ..Default::default()
        };
        assert!(client.validate(4).is_err());
    }

    #[test]
    fn test_missing_config_file() {
        let cli = CliArgs::try_parse_from([
            "tcpframe",
            "--config",
            "/nonexistent/tcpframe.toml",
            "server",
        ])
        .unwrap();

        let err = Settings::from_args(cli).unwrap_err();
        assert!(matches!(err, ConfigError::FileRead(..)));
        assert!(err
            .to_string()
            .starts_with("Failed to read config file '/nonexistent/tcpframe.toml': "));
        assert!(std::error::Error::source(&err).is_some());
    }

    #[tokio::test]
    async fn test_resolve() {
        let config = ServerConfig {
            host: "0.0.0.0".into(),
            port: 4444,
            ..Default::default()
        };
        let addr = config.resolve().await.unwrap();
        assert!(addr.ip().is_unspecified());
        assert_eq!(addr.port(), 4444);

        let config = ClientConfig {
            port: 1,
            ..Default::default()
        };
        assert_eq!(
            config.resolve().await.unwrap(),
            "127.0.0.1:1".parse::<SocketAddr>().unwrap()
        );
    }

    #[test]
    fn test_cli_overrides() {
        let cli = CliArgs::try_parse_from([
            "tcpframe",
            "client",
            "--port",
            "9000",
            "-M",
            "hello",
            "-M",
            "world",
        ])
        .unwrap();

        let settings = Settings::from_args(cli).unwrap();
        assert_eq!(settings.log_level, "info");
        match settings.mode {
            Mode::Client { config, messages } => {
                assert_eq!(config.port, 9000);
                assert_eq!(config.timeout_ms, 5000);
                assert_eq!(messages, vec!["hello", "world"]);
            }
            other => panic!("unexpected mode {other:?}"),
        }

        let cli = CliArgs::try_parse_from([
            "tcpframe",
            "server",
            "-p",
            "4444",
            "-m",
            "2",
            "--send-queue",
            "16",
        ])
        .unwrap();
        match Settings::from_args(cli).unwrap().mode {
            Mode::Server(config) => {
                assert_eq!(config.port, 4444);
                assert_eq!(config.max_connections, 2);
                assert_eq!(config.send_queue, 16);
                assert_eq!(config.buffer_size, 4096);
            }
            other => panic!("unexpected mode {other:?}"),
        }
    }
}
