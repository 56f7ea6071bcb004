//! Transport Layer for Client Sessions
//!
//! A session talks to exactly one client over a bidirectional, ordered,
//! message-oriented text channel. The session does not care what carries
//! the messages:
//! - `InProcess`: tokio channels, for embedding and tests
//! - `WebSocket`: text frames over TCP, what the daemon serves
//!
//! # Design Philosophy
//!
//! - `recv` is cancel-safe so the session can select over it
//! - `Ok(None)` from `recv` is an orderly close, never an error
//! - `close` is idempotent

pub mod in_process;
#[cfg(feature = "websocket")]
pub mod websocket;

use async_trait::async_trait;
use thiserror::Error;

pub use in_process::{InProcessClient, InProcessTransport};
#[cfg(feature = "websocket")]
pub use websocket::WebSocketTransport;

/// Errors raised by a channel transport
#[derive(Debug, Error)]
pub enum TransportError {
    /// Peer is gone
    #[error("connection closed")]
    ConnectionClosed,

    /// Writing a message failed
    #[error("send failed: {0}")]
    SendFailed(String),

    /// Reading a message failed
    #[error("receive failed: {0}")]
    ReceiveFailed(String),

    /// Handshake or framing violation
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Underlying I/O failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// One client connection carrying text messages both ways
#[async_trait]
pub trait ChannelTransport: Send {
    /// Next inbound text message
    ///
    /// Returns `Ok(None)` once the peer closed the channel. Cancel-safe.
    async fn recv(&mut self) -> Result<Option<String>, TransportError>;

    /// Send one outbound text message
    async fn send(&mut self, text: String) -> Result<(), TransportError>;

    /// Close the channel (idempotent)
    async fn close(&mut self) -> Result<(), TransportError>;

    /// Peer description for logs
    fn peer(&self) -> String;
}
