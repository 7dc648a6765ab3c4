//! Transport abstraction traits for Junction.
//!
//! Every transport hands the session loop a [`Connection`] that carries whole
//! messages, so the session loop does not care about framing.

use async_trait::async_trait;
use bytes::Bytes;
use junction_protocol::rawsocket::HandshakeError;
use junction_protocol::{Message, ProtocolError};
use tenvis_junction_core::TransportDetails;
use thiserror::Error;

/// Transport errors.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Connection was closed.
    #[error("Connection closed")]
    ConnectionClosed,

    /// Connection timed out.
    #[error("Connection timed out")]
    Timeout,

    /// Failed to send data.
    #[error("Send failed: {0}")]
    SendFailed(String),

    /// Failed to receive data.
    #[error("Receive failed: {0}")]
    ReceiveFailed(String),

    /// Malformed or oversized message.
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Raw-socket handshake failed.
    #[error("Handshake failed: {0}")]
    Handshake(#[from] HandshakeError),

    /// Listener could not bind its address.
    #[error("Failed to bind {address}: {source}")]
    Bind {
        address: String,
        #[source]
        source: std::io::Error,
    },

    /// WebSocket upgrade path that cannot be routed.
    #[error("Invalid WebSocket path {path:?}: {reason}")]
    InvalidPath { path: String, reason: &'static str },

    /// Network name not recognised or not available on this platform.
    #[error("Unsupported network: {0}")]
    UnsupportedNetwork(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Other error.
    #[error("{0}")]
    Other(String),
}

/// What a connection received.
#[derive(Debug, Clone, PartialEq)]
pub enum Incoming {
    Message(Message),
    /// Keep-alive probe; answer with [`Connection::pong`].
    Ping(Bytes),
    Pong(Bytes),
}

/// An accepted connection carrying WAMP messages.
#[async_trait]
pub trait Connection: Send {
    /// Transport details recorded in the session.
    fn details(&self) -> &TransportDetails;

    /// Receive the next message or control frame.
    ///
    /// Returns `None` if the peer closed the connection cleanly. Must be
    /// cancel-safe: dropping the future loses no data. Transports that answer
    /// pings themselves do not surface them.
    async fn recv(&mut self) -> Result<Option<Incoming>, TransportError>;

    /// Send a message.
    async fn send(&mut self, message: &Message) -> Result<(), TransportError>;

    /// Send a keep-alive probe.
    async fn ping(&mut self, payload: Bytes) -> Result<(), TransportError>;

    /// Answer a keep-alive probe.
    async fn pong(&mut self, payload: Bytes) -> Result<(), TransportError>;

    /// Close the connection gracefully.
    async fn close(&mut self) -> Result<(), TransportError>;
}
