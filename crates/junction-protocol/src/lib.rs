//! # junction-protocol
//!
//! Wire protocol definitions for the Junction WAMP router.
//!
//! This crate defines the messages exchanged between peers and the router,
//! the serializers that carry them, and the raw-socket framing.
//!
//! ## Message Types
//!
//! - `Hello` / `Welcome` / `Abort` / `Goodbye` - Session lifecycle
//! - `Subscribe` / `Publish` / `Event` - Publish and subscribe
//! - `Register` / `Call` / `Invocation` / `Yield` / `Result` - Remote procedure calls
//! - `Error` - Failure replies
//!
//! ## Example
//!
//! ```rust
//! use junction_protocol::{Dict, Message, Serializer};
//!
//! let hello = Message::hello("default", Dict::new());
//!
//! let encoded = Serializer::Json.encode(&hello).unwrap();
//! let decoded = Serializer::Json.decode(&encoded).unwrap();
//! assert_eq!(hello, decoded);
//! ```

pub mod codec;
pub mod message;
pub mod rawsocket;
pub mod uri;

pub use codec::{ProtocolError, Serializer, MAX_MESSAGE_SIZE};
pub use message::{Dict, Id, List, Message, MessageType, Uri};
