//! tcpframe: a pooled, length-prefixed TCP client/server engine
//!
//! Messages travel as `[u32 LE total length][payload]` frames. The engine
//! keeps receive and send buffers in fixed pools, reassembles frames that
//! arrive in arbitrary pieces, and hands each complete message to a
//! user-supplied handler.
//!
//! - `Server`: accept loop, connection registry, per-connection sessions
//! - `Client`: a single outbound connection with the same pipelines
//! - `Packet`: typed encode/decode of the frame payload
//! - `Delayer`: delayed and periodic actions

pub mod client;
pub mod config;
pub mod delayer;
pub mod error;
pub mod packet;
pub mod runtime;
pub mod server;

pub use client::{Client, ClientHandler};
pub use config::{ClientConfig, ServerConfig};
pub use delayer::{ActionId, Delayer};
pub use error::{ErrorKind, HandlerError, NetError, NetResult, PacketError};
pub use packet::{LengthPrefixCodec, Packet, PacketCodec, PacketMode, WireType, WireValue};
pub use runtime::{ConnState, Connection, ConnectionId};
pub use server::{Server, ServerHandler, Session};
