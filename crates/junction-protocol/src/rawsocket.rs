//! Raw-socket transport framing.
//!
//! A raw-socket connection starts with a 4-octet handshake in each direction:
//!
//! ```text
//! +--------+-----------+-----------+--------+--------+
//! |  0x7F  | LLLL SSSS |  reserved (2 octets, zero) |
//! +--------+-----------+-----------+--------+--------+
//! ```
//!
//! `LLLL` announces the maximum message length the sender is willing to
//! receive (`2^(9 + LLLL)` octets) and `SSSS` selects the serializer. A server
//! refuses a handshake by answering with `SSSS = 0` and an error code in
//! `LLLL`.
//!
//! After the handshake every frame carries a 4-octet header: one octet frame
//! type (message, ping or pong) and a 24-bit big-endian payload length.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

use crate::codec::{ProtocolError, Serializer};

/// First octet of every handshake.
pub const MAGIC: u8 = 0x7F;

/// Handshake and frame header size in bytes.
pub const HEADER_SIZE: usize = 4;

/// Largest length exponent, announcing `2^24` octets.
pub const MAX_LENGTH_EXPONENT: u8 = 15;

/// Largest payload a 24-bit length field can describe.
pub const MAX_FRAME_LENGTH: usize = 0x00FF_FFFF;

/// Error codes a server can answer a handshake with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum HandshakeErrorCode {
    SerializerUnsupported = 1,
    MaxLengthUnacceptable = 2,
    ReservedBitsUsed = 3,
    MaxConnectionCountReached = 4,
}

impl TryFrom<u8> for HandshakeErrorCode {
    type Error = &'static str;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(HandshakeErrorCode::SerializerUnsupported),
            2 => Ok(HandshakeErrorCode::MaxLengthUnacceptable),
            3 => Ok(HandshakeErrorCode::ReservedBitsUsed),
            4 => Ok(HandshakeErrorCode::MaxConnectionCountReached),
            _ => Err("Invalid handshake error code"),
        }
    }
}

/// Handshake failures.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum HandshakeError {
    /// The first octet was not [`MAGIC`]; the peer does not speak raw-socket.
    #[error("Bad handshake magic 0x{0:02x}")]
    BadMagic(u8),

    /// The peer's handshake is unacceptable; answer with this code.
    #[error("Handshake rejected: {0:?}")]
    Rejected(HandshakeErrorCode),

    /// The server refused our handshake.
    #[error("Handshake refused by peer: {0:?}")]
    Refused(HandshakeErrorCode),

    /// The server refused with a code outside the defined range.
    #[error("Handshake refused with unknown code {0}")]
    UnknownRefusal(u8),
}

/// One side of the handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Handshake {
    /// Announced maximum length exponent (0..=15).
    pub length_exponent: u8,
    /// Selected serializer.
    pub serializer: Serializer,
}

impl Handshake {
    /// Create a handshake announcing the largest message size.
    #[must_use]
    pub fn new(serializer: Serializer) -> Self {
        Self {
            length_exponent: MAX_LENGTH_EXPONENT,
            serializer,
        }
    }

    /// Set the announced maximum length exponent, clamped to 15.
    #[must_use]
    pub fn with_length_exponent(mut self, exponent: u8) -> Self {
        self.length_exponent = exponent.min(MAX_LENGTH_EXPONENT);
        self
    }

    /// Maximum message length in octets the announcing side accepts.
    #[must_use]
    pub fn max_message_len(&self) -> usize {
        (1usize << (9 + u32::from(self.length_exponent))).min(MAX_FRAME_LENGTH)
    }

    /// Encode the handshake octets.
    #[must_use]
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        [
            MAGIC,
            (self.length_exponent << 4) | self.serializer.rawsocket_id(),
            0,
            0,
        ]
    }

    /// Parse a client handshake as a server.
    ///
    /// # Errors
    ///
    /// Returns [`HandshakeError::BadMagic`] if the peer is not a raw-socket
    /// client (close without answering) or [`HandshakeError::Rejected`] with
    /// the code to answer with.
    pub fn parse_request(octets: [u8; HEADER_SIZE]) -> Result<Self, HandshakeError> {
        if octets[0] != MAGIC {
            return Err(HandshakeError::BadMagic(octets[0]));
        }
        if octets[2] != 0 || octets[3] != 0 {
            return Err(HandshakeError::Rejected(HandshakeErrorCode::ReservedBitsUsed));
        }

        let serializer = Serializer::from_rawsocket_id(octets[1] & 0x0F).ok_or(
            HandshakeError::Rejected(HandshakeErrorCode::SerializerUnsupported),
        )?;

        Ok(Self {
            length_exponent: octets[1] >> 4,
            serializer,
        })
    }

    /// Parse a server reply as a client.
    ///
    /// # Errors
    ///
    /// Returns [`HandshakeError::Refused`] if the server answered with an
    /// error code.
    pub fn parse_reply(octets: [u8; HEADER_SIZE]) -> Result<Self, HandshakeError> {
        if octets[0] != MAGIC {
            return Err(HandshakeError::BadMagic(octets[0]));
        }

        let serializer_id = octets[1] & 0x0F;
        if serializer_id == 0 {
            let code = octets[1] >> 4;
            return Err(HandshakeErrorCode::try_from(code)
                .map(HandshakeError::Refused)
                .unwrap_or(HandshakeError::UnknownRefusal(code)));
        }

        let serializer = Serializer::from_rawsocket_id(serializer_id).ok_or(
            HandshakeError::Refused(HandshakeErrorCode::SerializerUnsupported),
        )?;

        Ok(Self {
            length_exponent: octets[1] >> 4,
            serializer,
        })
    }
}

/// Encode a handshake refusal.
#[must_use]
pub fn refusal(code: HandshakeErrorCode) -> [u8; HEADER_SIZE] {
    [MAGIC, (code as u8) << 4, 0, 0]
}

/// Frame types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FrameKind {
    Message = 0,
    Ping = 1,
    Pong = 2,
}

impl TryFrom<u8> for FrameKind {
    type Error = &'static str;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value & 0x07 {
            0 => Ok(FrameKind::Message),
            1 => Ok(FrameKind::Ping),
            2 => Ok(FrameKind::Pong),
            _ => Err("Invalid frame type"),
        }
    }
}

/// Encode a frame into an existing buffer.
///
/// # Errors
///
/// Returns an error if the payload exceeds `max_len`.
pub fn encode_frame(
    kind: FrameKind,
    payload: &[u8],
    max_len: usize,
    buf: &mut BytesMut,
) -> Result<(), ProtocolError> {
    let limit = max_len.min(MAX_FRAME_LENGTH);
    if payload.len() > limit {
        return Err(ProtocolError::MessageTooLarge(payload.len(), limit));
    }

    buf.reserve(HEADER_SIZE + payload.len());
    buf.put_u8(kind as u8);
    buf.put_uint(payload.len() as u64, 3);
    buf.extend_from_slice(payload);

    Ok(())
}

/// Try to decode a frame from a buffer, advancing it if successful.
///
/// Returns `Ok(Some(..))` if a complete frame was decoded, `Ok(None)` if more
/// data is needed, or `Err` on protocol error.
///
/// # Errors
///
/// Returns an error if the frame type is unknown or the announced length
/// exceeds `max_len`.
pub fn decode_frame(
    buf: &mut BytesMut,
    max_len: usize,
) -> Result<Option<(FrameKind, Bytes)>, ProtocolError> {
    if buf.len() < HEADER_SIZE {
        return Ok(None);
    }

    let kind = FrameKind::try_from(buf[0]).map_err(|e| ProtocolError::Invalid(e.into()))?;
    let length = u32::from_be_bytes([0, buf[1], buf[2], buf[3]]) as usize;

    if length > max_len {
        return Err(ProtocolError::MessageTooLarge(length, max_len));
    }

    let total_size = HEADER_SIZE + length;
    if buf.len() < total_size {
        buf.reserve(total_size - buf.len());
        return Ok(None);
    }

    buf.advance(HEADER_SIZE);
    let payload = buf.split_to(length).freeze();

    Ok(Some((kind, payload)))
}
