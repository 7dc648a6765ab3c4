//! Serializers for Junction messages.
//!
//! Two serializers are supported: JSON (text) and MessagePack (binary). Both
//! carry the array representation produced by [`Message::to_value`].

use bytes::Bytes;
use serde_json::Value;
use thiserror::Error;

use crate::message::Message;

/// Maximum encoded message size (16 MiB).
pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

/// Protocol errors that can occur during encoding/decoding.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Message exceeds maximum size.
    #[error("Message size {0} exceeds maximum {1}")]
    MessageTooLarge(usize, usize),

    /// JSON encoding or decoding error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// MessagePack encoding error.
    #[error("Encoding error: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    /// MessagePack decoding error.
    #[error("Decoding error: {0}")]
    Decode(#[from] rmp_serde::decode::Error),

    /// Well-formed data that is not a valid message.
    #[error("Invalid message: {0}")]
    Invalid(String),
}

/// A message serializer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Serializer {
    /// `wamp.2.json`
    #[default]
    Json,
    /// `wamp.2.msgpack`
    MsgPack,
}

impl Serializer {
    /// All serializers, in server preference order.
    pub const ALL: [Serializer; 2] = [Serializer::Json, Serializer::MsgPack];

    /// WebSocket subprotocol name.
    #[must_use]
    pub fn subprotocol(self) -> &'static str {
        match self {
            Serializer::Json => "wamp.2.json",
            Serializer::MsgPack => "wamp.2.msgpack",
        }
    }

    /// Look up a serializer by WebSocket subprotocol name.
    #[must_use]
    pub fn from_subprotocol(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|s| s.subprotocol() == name.trim())
    }

    /// Raw-socket serializer identifier.
    #[must_use]
    pub fn rawsocket_id(self) -> u8 {
        match self {
            Serializer::Json => 1,
            Serializer::MsgPack => 2,
        }
    }

    /// Look up a serializer by raw-socket identifier.
    #[must_use]
    pub fn from_rawsocket_id(id: u8) -> Option<Self> {
        Self::ALL.into_iter().find(|s| s.rawsocket_id() == id)
    }

    /// Whether encoded messages are binary (as opposed to UTF-8 text).
    #[must_use]
    pub fn is_binary(self) -> bool {
        matches!(self, Serializer::MsgPack)
    }

    /// Encode a message.
    ///
    /// # Errors
    ///
    /// Returns an error if the message is too large or encoding fails.
    pub fn encode(self, message: &Message) -> Result<Bytes, ProtocolError> {
        let value = message.to_value();
        let payload = match self {
            Serializer::Json => serde_json::to_vec(&value)?,
            Serializer::MsgPack => rmp_serde::to_vec(&value)?,
        };

        if payload.len() > MAX_MESSAGE_SIZE {
            return Err(ProtocolError::MessageTooLarge(payload.len(), MAX_MESSAGE_SIZE));
        }

        Ok(Bytes::from(payload))
    }

    /// Decode a message.
    ///
    /// # Errors
    ///
    /// Returns an error if the data is too large, cannot be parsed, or does
    /// not describe a valid message.
    pub fn decode(self, data: &[u8]) -> Result<Message, ProtocolError> {
        if data.len() > MAX_MESSAGE_SIZE {
            return Err(ProtocolError::MessageTooLarge(data.len(), MAX_MESSAGE_SIZE));
        }

        let value: Value = match self {
            Serializer::Json => serde_json::from_slice(data)?,
            Serializer::MsgPack => rmp_serde::from_slice(data)?,
        };
        Message::from_value(value)
    }
}

impl std::fmt::Display for Serializer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Serializer::Json => "json",
            Serializer::MsgPack => "msgpack",
        })
    }
}
