//! The router: a set of realms sessions can join.

use crate::realm::{Realm, RealmConfig};
use crate::session::{Outbound, Session, TransportDetails};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use junction_protocol::uri::{
    validate_uri, CLOSE_SYSTEM_SHUTDOWN, ERROR_NO_SUCH_REALM, ERROR_NOT_AUTHORIZED,
    ERROR_PROTOCOL_VIOLATION,
};
use junction_protocol::{Dict, Message, Uri};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};

/// Router errors.
#[derive(Debug, Error)]
pub enum RouterError {
    /// Realm URI failed validation.
    #[error("Invalid realm URI {uri:?}: {reason}")]
    InvalidRealm { uri: Uri, reason: &'static str },

    /// A realm with this URI is already configured.
    #[error("Realm already exists: {0}")]
    RealmExists(Uri),

    /// HELLO named a realm the router does not serve.
    #[error("No such realm: {0}")]
    NoSuchRealm(Uri),

    /// The realm refuses the session.
    #[error("Not authorized to join realm {0}")]
    NotAuthorized(Uri),

    /// The router or realm has been closed.
    #[error("Router is closed")]
    Closed,

    /// The session's outbound channel closed before WELCOME was queued.
    #[error("Peer went away during join")]
    PeerGone,
}

impl RouterError {
    /// Reason URI for an ABORT answering a failed join.
    #[must_use]
    pub fn abort_reason(&self) -> &'static str {
        match self {
            RouterError::NoSuchRealm(_) => ERROR_NO_SUCH_REALM,
            RouterError::NotAuthorized(_) => ERROR_NOT_AUTHORIZED,
            RouterError::Closed => CLOSE_SYSTEM_SHUTDOWN,
            _ => ERROR_PROTOCOL_VIOLATION,
        }
    }

    /// ABORT message answering a failed join.
    #[must_use]
    pub fn to_abort(&self) -> Message {
        Message::abort_with_message(self.abort_reason(), self.to_string())
    }
}

/// Router configuration.
#[derive(Debug, Clone, Default)]
pub struct RouterConfig {
    /// Realms to create at startup.
    pub realms: Vec<RealmConfig>,
}

impl RouterConfig {
    /// Router serving a single realm.
    #[must_use]
    pub fn single(realm: RealmConfig) -> Self {
        Self {
            realms: vec![realm],
        }
    }
}

/// Router statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RouterStats {
    pub realms: usize,
    pub sessions: usize,
    pub registrations: usize,
    pub subscriptions: usize,
}

/// Routes messages between sessions joined to its realms.
pub struct Router {
    realms: DashMap<Uri, Arc<Realm>>,
    closed: AtomicBool,
}

impl Router {
    /// Create a router with the configured realms.
    ///
    /// # Errors
    ///
    /// Fails if a realm URI is invalid or listed twice.
    pub fn new(config: RouterConfig) -> Result<Self, RouterError> {
        let router = Self {
            realms: DashMap::new(),
            closed: AtomicBool::new(false),
        };

        for realm in config.realms {
            router.add_realm(realm)?;
        }

        Ok(router)
    }

    /// Add a realm.
    ///
    /// # Errors
    ///
    /// Fails if the URI is invalid or already served.
    pub fn add_realm(&self, config: RealmConfig) -> Result<(), RouterError> {
        validate_uri(&config.uri).map_err(|reason| RouterError::InvalidRealm {
            uri: config.uri.clone(),
            reason,
        })?;

        match self.realms.entry(config.uri.clone()) {
            Entry::Occupied(_) => Err(RouterError::RealmExists(config.uri)),
            Entry::Vacant(slot) => {
                info!(
                    realm = %config.uri,
                    anonymous_auth = config.anonymous_auth,
                    allow_disclose = config.allow_disclose,
                    "Realm created"
                );
                slot.insert(Arc::new(Realm::new(config)));
                Ok(())
            }
        }
    }

    /// Look up a realm.
    #[must_use]
    pub fn realm(&self, uri: &str) -> Option<Arc<Realm>> {
        self.realms.get(uri).map(|r| Arc::clone(r.value()))
    }

    #[must_use]
    pub fn has_realm(&self, uri: &str) -> bool {
        self.realms.contains_key(uri)
    }

    /// Join a session to a realm.
    ///
    /// On success WELCOME has been queued on `outbound`.
    ///
    /// # Errors
    ///
    /// Fails if the router is closed, the realm does not exist, or the realm
    /// refuses the session. Answer the peer with [`RouterError::to_abort`].
    pub fn join(
        &self,
        realm: &str,
        hello: &Dict,
        transport: TransportDetails,
        outbound: Outbound,
    ) -> Result<Session, RouterError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(RouterError::Closed);
        }
        let realm = self
            .realm(realm)
            .ok_or_else(|| RouterError::NoSuchRealm(realm.to_string()))?;
        realm.join(hello, transport, outbound)
    }

    /// Route a message from a joined session.
    pub fn handle(&self, session: &Session, message: Message) {
        session.realm().handle(session.details(), message);
    }

    /// Remove a session after its transport went away.
    pub fn leave(&self, session: &Session) -> bool {
        session.realm().leave(session.id())
    }

    /// Send GOODBYE to every session and refuse further joins.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let realms: Vec<Arc<Realm>> = self.realms.iter().map(|r| Arc::clone(r.value())).collect();
        for realm in realms {
            debug!(realm = %realm.uri(), sessions = realm.session_count(), "Closing realm");
            realm.close(CLOSE_SYSTEM_SHUTDOWN);
        }
        info!("Router closed");
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Get router statistics.
    #[must_use]
    pub fn stats(&self) -> RouterStats {
        self.realms.iter().fold(
            RouterStats {
                realms: self.realms.len(),
                ..RouterStats::default()
            },
            |mut stats, realm| {
                stats.sessions += realm.session_count();
                stats.registrations += realm.registration_count();
                stats.subscriptions += realm.subscription_count();
                stats
            },
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn router() -> Router {
        Router::new(RouterConfig::single(RealmConfig::new("realm1"))).unwrap()
    }

    #[test]
    fn test_join_known_realm() {
        let router = router();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let session = router
            .join("realm1", &Dict::new(), TransportDetails::local(), tx)
            .unwrap();

        match rx.try_recv() {
            Ok(Message::Welcome { session: id, details }) => {
                assert_eq!(id, session.id());
                assert_eq!(details.get("authrole").and_then(|v| v.as_str()), Some("anonymous"));
            }
            other => panic!("Expected Welcome, got {:?}", other),
        }
        assert_eq!(router.stats().sessions, 1);
        assert!(router.has_realm("realm1"));
        assert!(!router.has_realm("realm2"));

        assert!(router.leave(&session));
        assert!(!router.leave(&session));
        assert_eq!(router.stats().sessions, 0);
    }

    #[test]
    fn test_join_unknown_realm() {
        let router = router();
        let (tx, _rx) = mpsc::unbounded_channel();
        let err = router
            .join("nope", &Dict::new(), TransportDetails::local(), tx)
            .unwrap_err();
        assert!(matches!(err, RouterError::NoSuchRealm(_)));
        assert!(matches!(
            err.to_abort(),
            Message::Abort { reason, .. } if reason == ERROR_NO_SUCH_REALM
        ));
    }

    #[test]
    fn test_realm_without_anonymous_auth() {
        let router = Router::new(RouterConfig::single(
            RealmConfig::new("locked").with_anonymous_auth(false),
        ))
        .unwrap();
        let (tx, _rx) = mpsc::unbounded_channel();
        assert!(matches!(
            router.join("locked", &Dict::new(), TransportDetails::local(), tx),
            Err(RouterError::NotAuthorized(_))
        ));
    }

    #[test]
    fn test_invalid_and_duplicate_realms() {
        assert!(matches!(
            Router::new(RouterConfig::single(RealmConfig::new(""))),
            Err(RouterError::InvalidRealm { .. })
        ));

        let config = RouterConfig {
            realms: vec![RealmConfig::new("a"), RealmConfig::new("a")],
        };
        assert!(matches!(Router::new(config), Err(RouterError::RealmExists(_))));
    }

    #[test]
    fn test_close_refuses_joins() {
        let router = router();
        let (tx, mut rx) = mpsc::unbounded_channel();
        router
            .join("realm1", &Dict::new(), TransportDetails::local(), tx)
            .unwrap();
        router.close();

        let _welcome = rx.try_recv().unwrap();
        assert!(matches!(rx.try_recv(), Ok(Message::Goodbye { .. })));
        // The realm dropped its sender.
        assert!(matches!(
            rx.try_recv(),
            Err(mpsc::error::TryRecvError::Disconnected)
        ));

        let (tx, _rx) = mpsc::unbounded_channel();
        assert!(matches!(
            router.join("realm1", &Dict::new(), TransportDetails::local(), tx),
            Err(RouterError::Closed)
        ));
        assert!(router.is_closed());
    }
}
