//! Realms: the broker and dealer for one routing namespace.
//!
//! All state is held in concurrent maps keyed by URI or ID. No map reference
//! is held across an operation that touches the same map, and no lock is held
//! while a message is queued to a peer's outbound channel of the same map.

use crate::id::{global_id, IdSequence};
use crate::metrics;
use crate::router::RouterError;
use crate::session::{Outbound, Session, SessionDetails, TransportDetails};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use junction_protocol::uri::{
    is_reserved, validate_uri, CLOSE_GOODBYE_AND_OUT, ERROR_CANCELED, ERROR_DISCLOSE_DISALLOWED,
    ERROR_INVALID_URI, ERROR_NO_SUCH_PROCEDURE, ERROR_NO_SUCH_REGISTRATION,
    ERROR_NO_SUCH_SUBSCRIPTION, ERROR_PROCEDURE_ALREADY_EXISTS, ERROR_PROTOCOL_VIOLATION,
};
use junction_protocol::{Dict, Id, List, Message, MessageType, Uri};
use serde_json::{json, Value};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// Realm configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RealmConfig {
    /// Realm URI.
    pub uri: Uri,
    /// Admit sessions without authentication.
    pub anonymous_auth: bool,
    /// Honor `disclose_me` on calls and publications.
    pub allow_disclose: bool,
}

impl RealmConfig {
    /// Create a realm config admitting anonymous sessions.
    #[must_use]
    pub fn new(uri: impl Into<Uri>) -> Self {
        Self {
            uri: uri.into(),
            anonymous_auth: true,
            allow_disclose: false,
        }
    }

    #[must_use]
    pub fn with_anonymous_auth(mut self, enabled: bool) -> Self {
        self.anonymous_auth = enabled;
        self
    }

    #[must_use]
    pub fn with_allow_disclose(mut self, enabled: bool) -> Self {
        self.allow_disclose = enabled;
        self
    }
}

struct Peer {
    details: Arc<SessionDetails>,
    outbound: Outbound,
}

struct Registration {
    id: Id,
    callee: Id,
}

struct Subscription {
    id: Id,
    subscribers: HashSet<Id>,
}

struct PendingInvocation {
    caller: Id,
    call_request: Id,
    callee: Id,
}

/// A routing namespace.
pub struct Realm {
    config: RealmConfig,
    sessions: DashMap<Id, Peer>,
    registrations: DashMap<Uri, Registration>,
    registration_index: DashMap<Id, Uri>,
    subscriptions: DashMap<Uri, Subscription>,
    subscription_index: DashMap<Id, Uri>,
    invocations: DashMap<Id, PendingInvocation>,
    invocation_ids: IdSequence,
    closed: AtomicBool,
}

impl Realm {
    pub(crate) fn new(config: RealmConfig) -> Self {
        Self {
            config,
            sessions: DashMap::new(),
            registrations: DashMap::new(),
            registration_index: DashMap::new(),
            subscriptions: DashMap::new(),
            subscription_index: DashMap::new(),
            invocations: DashMap::new(),
            invocation_ids: IdSequence::new(),
            closed: AtomicBool::new(false),
        }
    }

    /// Realm URI.
    #[must_use]
    pub fn uri(&self) -> &str {
        &self.config.uri
    }

    #[must_use]
    pub fn config(&self) -> &RealmConfig {
        &self.config
    }

    #[must_use]
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    #[must_use]
    pub fn registration_count(&self) -> usize {
        self.registrations.len()
    }

    #[must_use]
    pub fn subscription_count(&self) -> usize {
        self.subscriptions.len()
    }

    /// Whether a procedure is currently registered.
    #[must_use]
    pub fn has_procedure(&self, procedure: &str) -> bool {
        self.registrations.contains_key(procedure)
    }

    /// Admit a session and queue its WELCOME.
    pub(crate) fn join(
        self: &Arc<Self>,
        hello: &Dict,
        transport: TransportDetails,
        outbound: Outbound,
    ) -> Result<Session, RouterError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(RouterError::Closed);
        }
        if !self.config.anonymous_auth {
            return Err(RouterError::NotAuthorized(self.config.uri.clone()));
        }

        let id = global_id();
        let authid = hello
            .get("authid")
            .and_then(Value::as_str)
            .map(str::to_owned)
            .unwrap_or_else(|| id.to_string());
        let kind = transport.kind;
        let details = Arc::new(SessionDetails {
            id,
            realm: self.config.uri.clone(),
            authid,
            authrole: "anonymous".to_string(),
            transport,
        });

        outbound
            .send(Message::Welcome {
                session: id,
                details: self.welcome_details(&details),
            })
            .map_err(|_| RouterError::PeerGone)?;

        self.sessions.insert(
            id,
            Peer {
                details: Arc::clone(&details),
                outbound,
            },
        );
        metrics::record_session_joined(&self.config.uri, kind);
        debug!(realm = %self.config.uri, session = id, transport = %kind, "Session joined");

        Ok(Session::new(details, Arc::clone(self)))
    }

    fn welcome_details(&self, details: &SessionDetails) -> Dict {
        let welcome = json!({
            "realm": details.realm,
            "authid": details.authid,
            "authrole": details.authrole,
            "authmethod": "anonymous",
            "roles": {
                "broker": { "features": { "publisher_identification": self.config.allow_disclose } },
                "dealer": { "features": { "caller_identification": self.config.allow_disclose } },
            },
        });
        match welcome {
            Value::Object(map) => map,
            _ => Dict::new(),
        }
    }

    fn send(&self, session: Id, message: Message) -> bool {
        match self.sessions.get(&session) {
            Some(peer) => peer.outbound.send(message).is_ok(),
            None => false,
        }
    }

    /// Route one message from a joined session.
    pub(crate) fn handle(&self, session: &SessionDetails, message: Message) {
        if !self.sessions.contains_key(&session.id) {
            trace!(session = session.id, "Dropping message from departed session");
            return;
        }
        trace!(
            realm = %self.config.uri,
            session = session.id,
            message_type = ?message.message_type(),
            "Routing message"
        );

        match message {
            Message::Goodbye { reason, .. } => {
                debug!(session = session.id, reason = %reason, "Session said goodbye");
                self.send(session.id, Message::goodbye(CLOSE_GOODBYE_AND_OUT));
                self.leave(session.id);
            }
            Message::Subscribe { request, topic, .. } => self.subscribe(session.id, request, topic),
            Message::Unsubscribe {
                request,
                subscription,
            } => self.unsubscribe(session.id, request, subscription),
            Message::Publish {
                request,
                options,
                topic,
                arguments,
                arguments_kw,
            } => self.publish(session, request, &options, topic, arguments, arguments_kw),
            Message::Register {
                request, procedure, ..
            } => self.register(session.id, request, procedure),
            Message::Unregister {
                request,
                registration,
            } => self.unregister(session.id, request, registration),
            Message::Call {
                request,
                options,
                procedure,
                arguments,
                arguments_kw,
            } => self.call(session, request, &options, procedure, arguments, arguments_kw),
            Message::Yield {
                request,
                arguments,
                arguments_kw,
                ..
            } => self.yield_result(session.id, request, arguments, arguments_kw),
            Message::Error {
                request_type: MessageType::Invocation,
                request,
                details,
                error,
                arguments,
                arguments_kw,
            } => self.invocation_error(session.id, request, details, error, arguments, arguments_kw),
            other => {
                let message_type = other.message_type();
                warn!(session = session.id, ?message_type, "Protocol violation");
                metrics::record_error("protocol_violation");
                self.send(
                    session.id,
                    Message::abort_with_message(
                        ERROR_PROTOCOL_VIOLATION,
                        format!("unexpected {:?} message", message_type),
                    ),
                );
                self.leave(session.id);
            }
        }
    }

    fn subscribe(&self, session: Id, request: Id, topic: Uri) {
        if let Err(reason) = validate_uri(&topic) {
            debug!(session, topic = %topic, reason, "Rejected subscription");
            self.send(session, Message::error(MessageType::Subscribe, request, ERROR_INVALID_URI));
            return;
        }

        let subscription = {
            let mut entry = self
                .subscriptions
                .entry(topic.clone())
                .or_insert_with(|| Subscription {
                    id: global_id(),
                    subscribers: HashSet::new(),
                });
            entry.subscribers.insert(session);
            entry.id
        };
        self.subscription_index.insert(subscription, topic.clone());

        debug!(session, topic = %topic, subscription, "Subscribed");
        self.send(
            session,
            Message::Subscribed {
                request,
                subscription,
            },
        );
    }

    fn unsubscribe(&self, session: Id, request: Id, subscription: Id) {
        let topic = self
            .subscription_index
            .get(&subscription)
            .map(|t| t.value().clone());

        let removed = topic.as_ref().and_then(|topic| {
            let mut sub = self.subscriptions.get_mut(topic)?;
            let was_subscribed = sub.subscribers.remove(&session);
            Some((was_subscribed, sub.subscribers.is_empty()))
        });

        match (topic, removed) {
            (Some(topic), Some((true, empty))) => {
                if empty
                    && self
                        .subscriptions
                        .remove_if(&topic, |_, s| s.subscribers.is_empty())
                        .is_some()
                {
                    self.subscription_index.remove(&subscription);
                }
                debug!(session, topic = %topic, subscription, "Unsubscribed");
                self.send(session, Message::Unsubscribed { request });
            }
            _ => {
                self.send(
                    session,
                    Message::error(MessageType::Unsubscribe, request, ERROR_NO_SUCH_SUBSCRIPTION),
                );
            }
        }
    }

    fn publish(
        &self,
        publisher: &SessionDetails,
        request: Id,
        options: &Dict,
        topic: Uri,
        arguments: List,
        arguments_kw: Dict,
    ) {
        let acknowledge = flag(options, "acknowledge");

        if validate_uri(&topic).is_err() {
            if acknowledge {
                self.send(
                    publisher.id,
                    Message::error(MessageType::Publish, request, ERROR_INVALID_URI),
                );
            }
            return;
        }

        let disclose = flag(options, "disclose_me");
        if disclose && !self.config.allow_disclose {
            self.send(
                publisher.id,
                Message::error(MessageType::Publish, request, ERROR_DISCLOSE_DISALLOWED),
            );
            return;
        }

        let exclude_me = options
            .get("exclude_me")
            .and_then(Value::as_bool)
            .unwrap_or(true);
        let publication = global_id();

        let target = self
            .subscriptions
            .get(&topic)
            .map(|s| (s.id, s.subscribers.iter().copied().collect::<Vec<_>>()));

        let mut delivered = 0usize;
        if let Some((subscription, subscribers)) = target {
            let mut details = Dict::new();
            if disclose {
                details.insert("publisher".into(), json!(publisher.id));
                details.insert("publisher_authid".into(), json!(publisher.authid));
                details.insert("publisher_authrole".into(), json!(publisher.authrole));
            }

            for subscriber in subscribers {
                if exclude_me && subscriber == publisher.id {
                    continue;
                }
                let event = Message::Event {
                    subscription,
                    publication,
                    details: details.clone(),
                    arguments: arguments.clone(),
                    arguments_kw: arguments_kw.clone(),
                };
                if self.send(subscriber, event) {
                    delivered += 1;
                }
            }
        }

        metrics::record_publication(&self.config.uri);
        trace!(topic = %topic, publication, recipients = delivered, "Published");

        if acknowledge {
            self.send(
                publisher.id,
                Message::Published {
                    request,
                    publication,
                },
            );
        }
    }

    fn register(&self, session: Id, request: Id, procedure: Uri) {
        if let Err(reason) = validate_uri(&procedure) {
            debug!(session, procedure = %procedure, reason, "Rejected registration");
            self.send(session, Message::error(MessageType::Register, request, ERROR_INVALID_URI));
            return;
        }
        if is_reserved(&procedure) {
            debug!(session, procedure = %procedure, "Rejected reserved procedure");
            self.send(session, Message::error(MessageType::Register, request, ERROR_INVALID_URI));
            return;
        }

        let registration = match self.registrations.entry(procedure.clone()) {
            Entry::Occupied(_) => None,
            Entry::Vacant(slot) => {
                let id = global_id();
                slot.insert(Registration {
                    id,
                    callee: session,
                });
                Some(id)
            }
        };

        let Some(registration) = registration else {
            debug!(session, procedure = %procedure, "Procedure already registered");
            self.send(
                session,
                Message::error(MessageType::Register, request, ERROR_PROCEDURE_ALREADY_EXISTS),
            );
            return;
        };

        self.registration_index.insert(registration, procedure.clone());
        debug!(session, procedure = %procedure, registration, "Registered");
        self.send(
            session,
            Message::Registered {
                request,
                registration,
            },
        );
    }

    fn unregister(&self, session: Id, request: Id, registration: Id) {
        let procedure = self
            .registration_index
            .get(&registration)
            .map(|p| p.value().clone());

        let removed = procedure.as_ref().and_then(|procedure| {
            self.registrations.remove_if(procedure, |_, r| {
                r.id == registration && r.callee == session
            })
        });

        if removed.is_some() {
            self.registration_index.remove(&registration);
            debug!(session, registration, "Unregistered");
            self.send(session, Message::Unregistered { request });
        } else {
            self.send(
                session,
                Message::error(MessageType::Unregister, request, ERROR_NO_SUCH_REGISTRATION),
            );
        }
    }

    fn call(
        &self,
        caller: &SessionDetails,
        request: Id,
        options: &Dict,
        procedure: Uri,
        arguments: List,
        arguments_kw: Dict,
    ) {
        let target = self
            .registrations
            .get(&procedure)
            .map(|r| (r.id, r.callee));

        let Some((registration, callee)) = target else {
            debug!(caller = caller.id, procedure = %procedure, "No such procedure");
            self.send(caller.id, Message::error(MessageType::Call, request, ERROR_NO_SUCH_PROCEDURE));
            return;
        };

        let disclose = flag(options, "disclose_me");
        if disclose && !self.config.allow_disclose {
            self.send(caller.id, Message::error(MessageType::Call, request, ERROR_DISCLOSE_DISALLOWED));
            return;
        }

        let mut details = Dict::new();
        details.insert("procedure".into(), json!(procedure));
        if disclose {
            details.insert("caller".into(), json!(caller.id));
            details.insert("caller_authid".into(), json!(caller.authid));
            details.insert("caller_authrole".into(), json!(caller.authrole));
        }

        let invocation = self.invocation_ids.next();
        self.invocations.insert(
            invocation,
            PendingInvocation {
                caller: caller.id,
                call_request: request,
                callee,
            },
        );
        metrics::record_call(&self.config.uri);
        trace!(caller = caller.id, callee, procedure = %procedure, invocation, "Routing call");

        let delivered = self.send(
            callee,
            Message::Invocation {
                request: invocation,
                registration,
                details,
                arguments,
                arguments_kw,
            },
        );
        if !delivered {
            self.invocations.remove(&invocation);
            self.send(caller.id, Message::error(MessageType::Call, request, ERROR_CANCELED));
        }
    }

    fn yield_result(&self, callee: Id, invocation: Id, arguments: List, arguments_kw: Dict) {
        match self
            .invocations
            .remove_if(&invocation, |_, pending| pending.callee == callee)
        {
            Some((_, pending)) => {
                self.send(
                    pending.caller,
                    Message::Result {
                        request: pending.call_request,
                        details: Dict::new(),
                        arguments,
                        arguments_kw,
                    },
                );
            }
            None => debug!(callee, invocation, "Yield for unknown invocation"),
        }
    }

    fn invocation_error(
        &self,
        callee: Id,
        invocation: Id,
        details: Dict,
        error: Uri,
        arguments: List,
        arguments_kw: Dict,
    ) {
        match self
            .invocations
            .remove_if(&invocation, |_, pending| pending.callee == callee)
        {
            Some((_, pending)) => {
                self.send(
                    pending.caller,
                    Message::Error {
                        request_type: MessageType::Call,
                        request: pending.call_request,
                        details,
                        error,
                        arguments,
                        arguments_kw,
                    },
                );
            }
            None => debug!(callee, invocation, "Error for unknown invocation"),
        }
    }

    /// Remove a session and everything it owns.
    ///
    /// Pending calls routed to the session are answered with
    /// `wamp.error.canceled`. Returns `false` if the session was not joined.
    pub(crate) fn leave(&self, session: Id) -> bool {
        let Some((_, peer)) = self.sessions.remove(&session) else {
            return false;
        };

        let mut unregistered = Vec::new();
        self.registrations.retain(|_, r| {
            if r.callee == session {
                unregistered.push(r.id);
                false
            } else {
                true
            }
        });
        for id in unregistered {
            self.registration_index.remove(&id);
        }

        let mut emptied = Vec::new();
        self.subscriptions.retain(|_, s| {
            s.subscribers.remove(&session);
            if s.subscribers.is_empty() {
                emptied.push(s.id);
                false
            } else {
                true
            }
        });
        for id in emptied {
            self.subscription_index.remove(&id);
        }

        let mut orphaned = Vec::new();
        self.invocations.retain(|_, pending| {
            if pending.callee == session {
                orphaned.push((pending.caller, pending.call_request));
                false
            } else {
                pending.caller != session
            }
        });
        for (caller, request) in orphaned {
            self.send(caller, Message::error(MessageType::Call, request, ERROR_CANCELED));
        }

        metrics::record_session_left(&self.config.uri);
        debug!(
            realm = %self.config.uri,
            session,
            transport = %peer.details.transport.kind,
            "Session left"
        );
        true
    }

    /// Send GOODBYE to every session and remove them. Later joins fail.
    pub(crate) fn close(&self, reason: &str) {
        self.closed.store(true, Ordering::Release);
        let ids: Vec<Id> = self.sessions.iter().map(|e| *e.key()).collect();
        for id in ids {
            self.send(id, Message::goodbye(reason));
            self.leave(id);
        }
    }
}

fn flag(options: &Dict, key: &str) -> bool {
    options.get(key).and_then(Value::as_bool).unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use junction_protocol::uri::CLOSE_SYSTEM_SHUTDOWN;
    use tokio::sync::mpsc;

    struct TestPeer {
        session: Session,
        rx: mpsc::UnboundedReceiver<Message>,
    }

    impl TestPeer {
        fn join(realm: &Arc<Realm>) -> Self {
            let (tx, mut rx) = mpsc::unbounded_channel();
            let session = realm
                .join(&Dict::new(), TransportDetails::local(), tx)
                .unwrap();
            assert!(matches!(rx.try_recv(), Ok(Message::Welcome { .. })));
            Self { session, rx }
        }

        fn send(&self, message: Message) {
            self.session
                .realm()
                .handle(self.session.details(), message);
        }

        fn recv(&mut self) -> Message {
            self.rx.try_recv().expect("expected a queued message")
        }
    }

    fn realm() -> Arc<Realm> {
        Arc::new(Realm::new(RealmConfig::new("test")))
    }

    fn register(peer: &mut TestPeer, procedure: &str) -> Id {
        peer.send(Message::Register {
            request: 1,
            options: Dict::new(),
            procedure: procedure.into(),
        });
        match peer.recv() {
            Message::Registered { registration, .. } => registration,
            other => panic!("Expected Registered, got {:?}", other),
        }
    }

    fn subscribe(peer: &mut TestPeer, topic: &str) -> Id {
        peer.send(Message::Subscribe {
            request: 2,
            options: Dict::new(),
            topic: topic.into(),
        });
        match peer.recv() {
            Message::Subscribed { subscription, .. } => subscription,
            other => panic!("Expected Subscribed, got {:?}", other),
        }
    }

    #[test]
    fn test_call_routes_to_callee_and_back() {
        let realm = realm();
        let mut callee = TestPeer::join(&realm);
        let mut caller = TestPeer::join(&realm);
        let registration = register(&mut callee, "dev.echo");

        caller.send(Message::Call {
            request: 7,
            options: Dict::new(),
            procedure: "dev.echo".into(),
            arguments: vec![json!("hi")],
            arguments_kw: Dict::new(),
        });

        let invocation = match callee.recv() {
            Message::Invocation {
                request,
                registration: reg,
                arguments,
                ..
            } => {
                assert_eq!(reg, registration);
                assert_eq!(arguments, vec![json!("hi")]);
                request
            }
            other => panic!("Expected Invocation, got {:?}", other),
        };

        callee.send(Message::Yield {
            request: invocation,
            options: Dict::new(),
            arguments: vec![json!("hi")],
            arguments_kw: Dict::new(),
        });

        match caller.recv() {
            Message::Result {
                request, arguments, ..
            } => {
                assert_eq!(request, 7);
                assert_eq!(arguments, vec![json!("hi")]);
            }
            other => panic!("Expected Result, got {:?}", other),
        }
    }

    #[test]
    fn test_call_unknown_procedure() {
        let realm = realm();
        let mut caller = TestPeer::join(&realm);
        caller.send(Message::Call {
            request: 3,
            options: Dict::new(),
            procedure: "dev.missing".into(),
            arguments: List::new(),
            arguments_kw: Dict::new(),
        });

        match caller.recv() {
            Message::Error {
                request_type,
                request,
                error,
                ..
            } => {
                assert_eq!(request_type, MessageType::Call);
                assert_eq!(request, 3);
                assert_eq!(error, ERROR_NO_SUCH_PROCEDURE);
            }
            other => panic!("Expected Error, got {:?}", other),
        }
    }

    #[test]
    fn test_duplicate_and_reserved_registration() {
        let realm = realm();
        let mut first = TestPeer::join(&realm);
        let mut second = TestPeer::join(&realm);
        register(&mut first, "dev.echo");

        second.send(Message::Register {
            request: 4,
            options: Dict::new(),
            procedure: "dev.echo".into(),
        });
        assert!(matches!(
            second.recv(),
            Message::Error { error, .. } if error == ERROR_PROCEDURE_ALREADY_EXISTS
        ));

        second.send(Message::Register {
            request: 5,
            options: Dict::new(),
            procedure: "wamp.session.count".into(),
        });
        assert!(matches!(
            second.recv(),
            Message::Error { error, .. } if error == ERROR_INVALID_URI
        ));
    }

    #[test]
    fn test_publish_fans_out_excluding_publisher() {
        let realm = realm();
        let mut publisher = TestPeer::join(&realm);
        let mut a = TestPeer::join(&realm);
        let mut b = TestPeer::join(&realm);
        subscribe(&mut publisher, "dev.time");
        let sub_a = subscribe(&mut a, "dev.time");
        let sub_b = subscribe(&mut b, "dev.time");
        assert_eq!(sub_a, sub_b);

        let mut options = Dict::new();
        options.insert("acknowledge".into(), json!(true));
        publisher.send(Message::Publish {
            request: 9,
            options,
            topic: "dev.time".into(),
            arguments: vec![json!("2024-01-01T00:00:00Z")],
            arguments_kw: Dict::new(),
        });

        assert!(matches!(publisher.recv(), Message::Published { request: 9, .. }));
        assert!(publisher.rx.try_recv().is_err());
        for peer in [&mut a, &mut b] {
            match peer.recv() {
                Message::Event {
                    subscription,
                    arguments,
                    ..
                } => {
                    assert_eq!(subscription, sub_a);
                    assert_eq!(arguments, vec![json!("2024-01-01T00:00:00Z")]);
                }
                other => panic!("Expected Event, got {:?}", other),
            }
        }
    }

    #[test]
    fn test_disclose_requires_permission() {
        let closed = realm();
        let mut caller = TestPeer::join(&closed);
        let mut callee = TestPeer::join(&closed);
        register(&mut callee, "dev.echo");

        let mut options = Dict::new();
        options.insert("disclose_me".into(), json!(true));
        caller.send(Message::Call {
            request: 1,
            options: options.clone(),
            procedure: "dev.echo".into(),
            arguments: List::new(),
            arguments_kw: Dict::new(),
        });
        assert!(matches!(
            caller.recv(),
            Message::Error { error, .. } if error == ERROR_DISCLOSE_DISALLOWED
        ));

        let open = Arc::new(Realm::new(RealmConfig::new("open").with_allow_disclose(true)));
        let mut caller = TestPeer::join(&open);
        let mut callee = TestPeer::join(&open);
        register(&mut callee, "dev.echo");
        caller.send(Message::Call {
            request: 2,
            options,
            procedure: "dev.echo".into(),
            arguments: List::new(),
            arguments_kw: Dict::new(),
        });
        match callee.recv() {
            Message::Invocation { details, .. } => {
                assert_eq!(details.get("caller"), Some(&json!(caller.session.id())));
            }
            other => panic!("Expected Invocation, got {:?}", other),
        }
    }

    #[test]
    fn test_leave_cancels_pending_and_cleans_up() {
        let realm = realm();
        let mut callee = TestPeer::join(&realm);
        let mut caller = TestPeer::join(&realm);
        register(&mut callee, "dev.echo");
        subscribe(&mut callee, "dev.time");

        caller.send(Message::Call {
            request: 11,
            options: Dict::new(),
            procedure: "dev.echo".into(),
            arguments: List::new(),
            arguments_kw: Dict::new(),
        });
        assert!(matches!(callee.recv(), Message::Invocation { .. }));

        callee.send(Message::goodbye("wamp.close.normal"));
        assert!(matches!(callee.recv(), Message::Goodbye { .. }));

        match caller.recv() {
            Message::Error { request, error, .. } => {
                assert_eq!(request, 11);
                assert_eq!(error, ERROR_CANCELED);
            }
            other => panic!("Expected Error, got {:?}", other),
        }
        assert_eq!(realm.session_count(), 1);
        assert_eq!(realm.registration_count(), 0);
        assert_eq!(realm.subscription_count(), 0);
        assert!(!realm.has_procedure("dev.echo"));
    }

    #[test]
    fn test_unexpected_message_aborts() {
        let realm = realm();
        let mut peer = TestPeer::join(&realm);
        peer.send(Message::hello("test", Dict::new()));
        assert!(matches!(
            peer.recv(),
            Message::Abort { reason, .. } if reason == ERROR_PROTOCOL_VIOLATION
        ));
        assert_eq!(realm.session_count(), 0);
    }

    #[test]
    fn test_unsubscribe() {
        let realm = realm();
        let mut peer = TestPeer::join(&realm);
        let subscription = subscribe(&mut peer, "dev.time");

        peer.send(Message::Unsubscribe {
            request: 3,
            subscription,
        });
        assert!(matches!(peer.recv(), Message::Unsubscribed { request: 3 }));
        assert_eq!(realm.subscription_count(), 0);

        peer.send(Message::Unsubscribe {
            request: 4,
            subscription,
        });
        assert!(matches!(
            peer.recv(),
            Message::Error { error, .. } if error == ERROR_NO_SUCH_SUBSCRIPTION
        ));
    }

    #[test]
    fn test_close_says_goodbye_and_refuses_joins() {
        let realm = realm();
        let mut peer = TestPeer::join(&realm);
        realm.close(CLOSE_SYSTEM_SHUTDOWN);

        assert!(matches!(
            peer.recv(),
            Message::Goodbye { reason, .. } if reason == CLOSE_SYSTEM_SHUTDOWN
        ));
        assert_eq!(realm.session_count(), 0);

        let (tx, _rx) = mpsc::unbounded_channel();
        assert!(matches!(
            realm.join(&Dict::new(), TransportDetails::local(), tx),
            Err(RouterError::Closed)
        ));
    }
}
