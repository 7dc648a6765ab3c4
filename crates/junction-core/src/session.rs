//! Session identity and transport details.

use crate::realm::Realm;
use junction_protocol::{Id, Message, Serializer, Uri};
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Sender half of a session's outbound message queue.
pub type Outbound = mpsc::UnboundedSender<Message>;

/// How a session is attached to the router.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportKind {
    /// In-process client.
    Local,
    /// WebSocket connection.
    WebSocket,
    /// Raw-socket connection (TCP or Unix).
    RawSocket,
}

impl TransportKind {
    /// Short label used in logs and metrics.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            TransportKind::Local => "local",
            TransportKind::WebSocket => "websocket",
            TransportKind::RawSocket => "rawsocket",
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Details about the transport carrying a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportDetails {
    pub kind: TransportKind,
    /// Remote address, if any.
    pub peer: Option<String>,
    /// Negotiated serializer, `None` for local sessions.
    pub serializer: Option<Serializer>,
    /// Tracking cookie value for WebSocket sessions.
    pub cookie: Option<String>,
}

impl TransportDetails {
    /// Create details for a transport kind.
    #[must_use]
    pub fn new(kind: TransportKind) -> Self {
        Self {
            kind,
            peer: None,
            serializer: None,
            cookie: None,
        }
    }

    /// Details for an in-process session.
    #[must_use]
    pub fn local() -> Self {
        Self::new(TransportKind::Local)
    }

    #[must_use]
    pub fn with_peer(mut self, peer: impl Into<String>) -> Self {
        self.peer = Some(peer.into());
        self
    }

    #[must_use]
    pub fn with_serializer(mut self, serializer: Serializer) -> Self {
        self.serializer = Some(serializer);
        self
    }

    #[must_use]
    pub fn with_cookie(mut self, cookie: impl Into<String>) -> Self {
        self.cookie = Some(cookie.into());
        self
    }
}

/// Identity of a joined session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionDetails {
    pub id: Id,
    pub realm: Uri,
    pub authid: String,
    pub authrole: String,
    pub transport: TransportDetails,
}

/// Handle to a session joined to a realm.
///
/// Messages from the peer are routed with [`crate::Router::handle`]; messages
/// to the peer arrive on the receiver paired with the [`Outbound`] passed to
/// [`crate::Router::join`].
#[derive(Clone)]
pub struct Session {
    details: Arc<SessionDetails>,
    realm: Arc<Realm>,
}

impl Session {
    pub(crate) fn new(details: Arc<SessionDetails>, realm: Arc<Realm>) -> Self {
        Self { details, realm }
    }

    /// Session ID.
    #[must_use]
    pub fn id(&self) -> Id {
        self.details.id
    }

    /// URI of the realm the session joined.
    #[must_use]
    pub fn realm_uri(&self) -> &str {
        &self.details.realm
    }

    #[must_use]
    pub fn details(&self) -> &SessionDetails {
        &self.details
    }

    pub(crate) fn realm(&self) -> &Arc<Realm> {
        &self.realm
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.details.id)
            .field("realm", &self.details.realm)
            .field("transport", &self.details.transport.kind)
            .finish()
    }
}
