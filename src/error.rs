//! Error types for the connection engine.
//!
//! Errors are tagged by [`ErrorKind`] so callbacks can tell a configuration
//! mistake apart from a socket fault or a misbehaving handler without
//! matching on every variant.

use crate::packet::PacketMode;
use crate::runtime::ConnectionId;
use std::any::Any;
use std::io;
use thiserror::Error;

/// Error type returned by user callbacks.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Convenience alias used throughout the crate.
pub type NetResult<T> = Result<T, NetError>;

/// Coarse classification of a [`NetError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Invalid host/port/sizes, or mutation while running.
    Configuration,
    /// Disconnect requested for an unknown connection id.
    ConnectionNotFound,
    /// OS-level error on an active operation.
    Socket,
    /// Corrupt or truncated frame on the wire.
    Framing,
    /// `handle_message` returned an error or panicked.
    Handler,
    /// Outbound connection was refused or timed out.
    ConnectFailed,
    /// Misuse of a packet (wrong mode, underflow, bad string).
    Packet,
    /// A bounded pool or arena ran out.
    Resource,
    /// Operation is not valid in the current engine state.
    State,
}

/// Errors raised on packet encode/decode.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PacketError {
    #[error("packet is in {actual:?} mode, operation requires {expected:?} mode")]
    WrongMode {
        expected: PacketMode,
        actual: PacketMode,
    },
    #[error("packet underflow: needed {needed} bytes, {remaining} remaining")]
    Underflow { needed: usize, remaining: usize },
    #[error("string of {0} bytes exceeds the 65535 byte limit")]
    TooLong(usize),
    #[error("string contains non-ASCII characters")]
    NonAscii,
    #[error("packet has been disposed")]
    Disposed,
}

/// Errors surfaced by the server and client engines.
#[derive(Debug, Error)]
pub enum NetError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("connection {0} not found")]
    ConnectionNotFound(ConnectionId),

    #[error("socket fault: {0}")]
    Socket(#[from] io::Error),

    #[error("framing error: {0}")]
    Framing(String),

    #[error("message handler failed: {0}")]
    Handler(HandlerError),

    #[error("failed to connect to {addr}: {source}")]
    ConnectFailed {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("connect to {addr} timed out after {timeout_ms} ms")]
    ConnectTimeout { addr: String, timeout_ms: u64 },

    #[error(transparent)]
    Packet(#[from] PacketError),

    #[error("buffer arena exhausted ({capacity} chunks in use)")]
    ArenaExhausted { capacity: usize },

    #[error("send queue is full ({capacity} frames pending)")]
    SendQueueFull { capacity: usize },

    #[error("{0}")]
    State(&'static str),
}

impl NetError {
    /// Returns the classification tag for this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            NetError::Configuration(_) => ErrorKind::Configuration,
            NetError::ConnectionNotFound(_) => ErrorKind::ConnectionNotFound,
            NetError::Socket(_) => ErrorKind::Socket,
            NetError::Framing(_) => ErrorKind::Framing,
            NetError::Handler(_) => ErrorKind::Handler,
            NetError::ConnectFailed { .. } | NetError::ConnectTimeout { .. } => {
                ErrorKind::ConnectFailed
            }
            NetError::Packet(_) => ErrorKind::Packet,
            NetError::ArenaExhausted { .. } | NetError::SendQueueFull { .. } => {
                ErrorKind::Resource
            }
            NetError::State(_) => ErrorKind::State,
        }
    }

    pub(crate) fn config(msg: impl Into<String>) -> Self {
        NetError::Configuration(msg.into())
    }

    pub(crate) fn framing(msg: impl Into<String>) -> Self {
        NetError::Framing(msg.into())
    }

    /// Wrap the payload of a caught handler panic.
    pub(crate) fn handler_panic(payload: Box<dyn Any + Send>) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            format!("handler panicked: {s}")
        } else if let Some(s) = payload.downcast_ref::<String>() {
            format!("handler panicked: {s}")
        } else {
            "handler panicked".to_string()
        };
        NetError::Handler(message.into())
    }
}
