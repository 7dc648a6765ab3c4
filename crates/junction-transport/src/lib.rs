//! # tenvis-junction-transport
//!
//! Network transports for the Junction router.
//!
//! - **WebSocket** - axum upgrade endpoint with JSON and MessagePack subprotocols
//! - **Raw socket** - WAMP raw-socket framing over TCP and Unix sockets
//!
//! Both transports hand accepted connections to the same session loop via the
//! [`Connection`] trait, and both return a [`ListenerHandle`] that stops the
//! listener when closed.
//!
//! ```rust,ignore
//! use tenvis_junction_transport::{Network, RawSocketServer, WebSocketServer};
//!
//! let ws = WebSocketServer::new(router.clone()).listen_and_serve("localhost:8951").await?;
//! let rs = RawSocketServer::new(router).listen_and_serve(Network::Tcp, "127.0.0.1:8952").await?;
//! // ...
//! rs.close().await?;
//! ws.close().await?;
//! ```

pub mod listener;
pub mod metrics;
pub mod rawsocket;
pub mod session;
pub mod traits;
pub mod websocket;

pub use listener::{ListenAddr, ListenerHandle};
pub use rawsocket::{Network, RawSocketOptions, RawSocketServer};
pub use session::{serve_connection, SessionOptions, DEFAULT_KEEP_ALIVE};
pub use traits::{Connection, Incoming, TransportError};
pub use websocket::{
    validate_path, OriginPolicy, WebSocketOptions, WebSocketServer, HEALTH_PATH, TRACKING_COOKIE,
};
