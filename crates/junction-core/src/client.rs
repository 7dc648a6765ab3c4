//! In-process client attached directly to a [`Router`].
//!
//! A local client joins a realm without a transport: messages pass through
//! [`Router::handle`] and replies arrive on an in-memory channel drained by a
//! background task.

use crate::id::IdSequence;
use crate::router::{Router, RouterError};
use crate::session::{Session, TransportDetails};
use dashmap::DashMap;
use futures_util::future::BoxFuture;
use junction_protocol::uri::{CLOSE_NORMAL, ERROR_NO_SUCH_REGISTRATION};
use junction_protocol::{Dict, Id, List, Message, MessageType, Uri};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, trace, warn};

/// Default time to wait for the router to answer a request.
pub const DEFAULT_RESPONSE_TIMEOUT: Duration = Duration::from_secs(10);

/// Client errors.
#[derive(Debug, Error)]
pub enum ClientError {
    /// The router refused the join.
    #[error("Failed to join realm: {0}")]
    Join(#[from] RouterError),

    /// The router aborted the session.
    #[error("Session aborted: {0}")]
    Aborted(Uri),

    /// The router answered HELLO with something other than WELCOME.
    #[error("Unexpected {0:?} during session establishment")]
    Handshake(MessageType),

    /// The router answered a request with an ERROR.
    #[error("Request failed with {error}")]
    Remote {
        error: Uri,
        arguments: List,
        arguments_kw: Dict,
    },

    /// No answer within the response timeout.
    #[error("Timed out waiting for reply to request {0}")]
    Timeout(Id),

    /// The router answered with an unexpected message type.
    #[error("Unexpected reply {0:?}")]
    UnexpectedReply(MessageType),

    /// The procedure was not registered by this client.
    #[error("Procedure not registered by this client: {0}")]
    NotRegistered(Uri),

    /// The session has ended.
    #[error("Client is closed")]
    Closed,
}

/// A call delivered to a registered procedure.
#[derive(Debug, Clone, PartialEq)]
pub struct Invocation {
    pub request: Id,
    pub registration: Id,
    pub details: Dict,
    pub arguments: List,
    pub arguments_kw: Dict,
}

/// What a procedure handler returns.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InvokeResult {
    pub arguments: List,
    pub arguments_kw: Dict,
    /// Error URI; when set the caller receives an ERROR instead of a RESULT.
    pub error: Option<Uri>,
}

impl InvokeResult {
    #[must_use]
    pub fn new(arguments: List, arguments_kw: Dict) -> Self {
        Self {
            arguments,
            arguments_kw,
            error: None,
        }
    }

    #[must_use]
    pub fn error(error: impl Into<Uri>) -> Self {
        Self {
            error: Some(error.into()),
            ..Self::default()
        }
    }

    fn into_message(self, request: Id) -> Message {
        match self.error {
            Some(error) => Message::Error {
                request_type: MessageType::Invocation,
                request,
                details: Dict::new(),
                error,
                arguments: self.arguments,
                arguments_kw: self.arguments_kw,
            },
            None => Message::Yield {
                request,
                options: Dict::new(),
                arguments: self.arguments,
                arguments_kw: self.arguments_kw,
            },
        }
    }
}

/// Procedure handler. Each invocation runs as its own task.
pub type InvocationHandler =
    Arc<dyn Fn(Invocation) -> BoxFuture<'static, InvokeResult> + Send + Sync>;

/// An event delivered to a subscription.
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    pub subscription: Id,
    pub publication: Id,
    pub details: Dict,
    pub arguments: List,
    pub arguments_kw: Dict,
}

/// Result of a successful call.
#[derive(Debug, Clone, PartialEq)]
pub struct CallResult {
    pub details: Dict,
    pub arguments: List,
    pub arguments_kw: Dict,
}

/// Events for one subscription.
#[derive(Debug)]
pub struct Subscription {
    id: Id,
    events: mpsc::UnboundedReceiver<Event>,
}

impl Subscription {
    #[must_use]
    pub fn id(&self) -> Id {
        self.id
    }

    /// Wait for the next event. `None` once the client has closed.
    pub async fn next(&mut self) -> Option<Event> {
        self.events.recv().await
    }
}

/// Local client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub realm: Uri,
    /// Details sent with HELLO.
    pub hello_details: Dict,
    pub response_timeout: Duration,
}

impl ClientConfig {
    #[must_use]
    pub fn new(realm: impl Into<Uri>) -> Self {
        Self {
            realm: realm.into(),
            hello_details: Dict::new(),
            response_timeout: DEFAULT_RESPONSE_TIMEOUT,
        }
    }

    #[must_use]
    pub fn with_response_timeout(mut self, timeout: Duration) -> Self {
        self.response_timeout = timeout;
        self
    }
}

enum Attachment {
    Handler(Uri, InvocationHandler),
    Events(mpsc::UnboundedSender<Event>),
}

struct PendingRequest {
    reply: oneshot::Sender<Message>,
    attachment: Option<Attachment>,
}

struct Shared {
    router: Arc<Router>,
    session: Session,
    requests: IdSequence,
    pending: DashMap<Id, PendingRequest>,
    handlers: DashMap<Id, InvocationHandler>,
    procedures: DashMap<Uri, Id>,
    subscribers: DashMap<Id, mpsc::UnboundedSender<Event>>,
    closed: AtomicBool,
}

impl Shared {
    fn send(&self, message: Message) -> Result<(), ClientError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ClientError::Closed);
        }
        self.router.handle(&self.session, message);
        Ok(())
    }
}

/// A session joined in-process.
pub struct Client {
    shared: Arc<Shared>,
    config: ClientConfig,
    receiver: Mutex<Option<JoinHandle<()>>>,
}

impl Client {
    /// Join a realm on `router`.
    ///
    /// # Errors
    ///
    /// Fails if the router refuses the join or the session is not welcomed.
    pub async fn connect_local(router: Arc<Router>, config: ClientConfig) -> Result<Self, ClientError> {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let session = router.join(
            &config.realm,
            &config.hello_details,
            TransportDetails::local(),
            tx,
        )?;

        match rx.recv().await {
            Some(Message::Welcome { session: id, .. }) => {
                debug!(realm = %config.realm, session = id, "Local client joined");
            }
            Some(Message::Abort { reason, .. }) => return Err(ClientError::Aborted(reason)),
            Some(other) => {
                router.leave(&session);
                return Err(ClientError::Handshake(other.message_type()));
            }
            None => return Err(ClientError::Closed),
        }

        let shared = Arc::new(Shared {
            router,
            session,
            requests: IdSequence::new(),
            pending: DashMap::new(),
            handlers: DashMap::new(),
            procedures: DashMap::new(),
            subscribers: DashMap::new(),
            closed: AtomicBool::new(false),
        });
        let receiver = tokio::spawn(receive_loop(Arc::clone(&shared), rx));

        Ok(Self {
            shared,
            config,
            receiver: Mutex::new(Some(receiver)),
        })
    }

    /// Session ID assigned by the router.
    #[must_use]
    pub fn session_id(&self) -> Id {
        self.shared.session.id()
    }

    #[must_use]
    pub fn realm(&self) -> &str {
        self.shared.session.realm_uri()
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    async fn request(
        &self,
        attachment: Option<Attachment>,
        build: impl FnOnce(Id) -> Message,
    ) -> Result<Message, ClientError> {
        if self.is_closed() {
            return Err(ClientError::Closed);
        }

        let request = self.shared.requests.next();
        let (reply, rx) = oneshot::channel();
        self.shared
            .pending
            .insert(request, PendingRequest { reply, attachment });

        if let Err(e) = self.shared.send(build(request)) {
            self.shared.pending.remove(&request);
            return Err(e);
        }

        match timeout(self.config.response_timeout, rx).await {
            Ok(Ok(Message::Error {
                error,
                arguments,
                arguments_kw,
                ..
            })) => Err(ClientError::Remote {
                error,
                arguments,
                arguments_kw,
            }),
            Ok(Ok(message)) => Ok(message),
            Ok(Err(_)) => Err(ClientError::Closed),
            Err(_) => {
                self.shared.pending.remove(&request);
                Err(ClientError::Timeout(request))
            }
        }
    }

    /// Register a procedure. Returns the registration ID.
    ///
    /// # Errors
    ///
    /// Fails with [`ClientError::Remote`] if the router refuses, e.g. when the
    /// procedure is already registered.
    pub async fn register(
        &self,
        procedure: &str,
        handler: InvocationHandler,
    ) -> Result<Id, ClientError> {
        let attachment = Attachment::Handler(procedure.to_string(), handler);
        let reply = self
            .request(Some(attachment), |request| Message::Register {
                request,
                options: Dict::new(),
                procedure: procedure.to_string(),
            })
            .await?;

        match reply {
            Message::Registered { registration, .. } => {
                debug!(procedure, registration, "Procedure registered");
                Ok(registration)
            }
            other => Err(ClientError::UnexpectedReply(other.message_type())),
        }
    }

    /// Unregister a procedure registered by this client.
    ///
    /// # Errors
    ///
    /// Fails with [`ClientError::NotRegistered`] if this client does not hold
    /// the registration, or if the router refuses.
    pub async fn unregister(&self, procedure: &str) -> Result<(), ClientError> {
        let registration = self
            .shared
            .procedures
            .get(procedure)
            .map(|r| *r.value())
            .ok_or_else(|| ClientError::NotRegistered(procedure.to_string()))?;

        let reply = self
            .request(None, |request| Message::Unregister {
                request,
                registration,
            })
            .await?;

        match reply {
            Message::Unregistered { .. } => {
                self.shared.procedures.remove(procedure);
                self.shared.handlers.remove(&registration);
                debug!(procedure, registration, "Procedure unregistered");
                Ok(())
            }
            other => Err(ClientError::UnexpectedReply(other.message_type())),
        }
    }

    /// Subscribe to a topic.
    ///
    /// # Errors
    ///
    /// Fails with [`ClientError::Remote`] if the router refuses the topic.
    pub async fn subscribe(&self, topic: &str) -> Result<Subscription, ClientError> {
        let (tx, events) = mpsc::unbounded_channel();
        let reply = self
            .request(Some(Attachment::Events(tx)), |request| Message::Subscribe {
                request,
                options: Dict::new(),
                topic: topic.to_string(),
            })
            .await?;

        match reply {
            Message::Subscribed { subscription, .. } => Ok(Subscription {
                id: subscription,
                events,
            }),
            other => Err(ClientError::UnexpectedReply(other.message_type())),
        }
    }

    /// Drop a subscription.
    ///
    /// # Errors
    ///
    /// Fails if the router does not know the subscription.
    pub async fn unsubscribe(&self, subscription: Subscription) -> Result<(), ClientError> {
        let id = subscription.id;
        self.shared.subscribers.remove(&id);
        let reply = self
            .request(None, |request| Message::Unsubscribe {
                request,
                subscription: id,
            })
            .await?;

        match reply {
            Message::Unsubscribed { .. } => Ok(()),
            other => Err(ClientError::UnexpectedReply(other.message_type())),
        }
    }

    /// Publish an event without waiting for acknowledgement.
    ///
    /// # Errors
    ///
    /// Fails with [`ClientError::Closed`] once the session has ended.
    pub fn publish(
        &self,
        topic: &str,
        arguments_kw: Dict,
        arguments: List,
        options: Dict,
    ) -> Result<(), ClientError> {
        self.shared.send(Message::Publish {
            request: self.shared.requests.next(),
            options,
            topic: topic.to_string(),
            arguments,
            arguments_kw,
        })
    }

    /// Call a procedure and wait for its result.
    ///
    /// # Errors
    ///
    /// Fails with [`ClientError::Remote`] if the callee or router answers with
    /// an error, or [`ClientError::Timeout`].
    pub async fn call(
        &self,
        procedure: &str,
        arguments: List,
        arguments_kw: Dict,
    ) -> Result<CallResult, ClientError> {
        let reply = self
            .request(None, |request| Message::Call {
                request,
                options: Dict::new(),
                procedure: procedure.to_string(),
                arguments,
                arguments_kw,
            })
            .await?;

        match reply {
            Message::Result {
                details,
                arguments,
                arguments_kw,
                ..
            } => Ok(CallResult {
                details,
                arguments,
                arguments_kw,
            }),
            other => Err(ClientError::UnexpectedReply(other.message_type())),
        }
    }

    /// Leave the realm. Registrations and subscriptions are released.
    ///
    /// # Errors
    ///
    /// Currently infallible; closing twice is a no-op.
    pub async fn close(&self) -> Result<(), ClientError> {
        if self.shared.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        self.shared
            .router
            .handle(&self.shared.session, Message::goodbye(CLOSE_NORMAL));

        if let Some(receiver) = self.receiver.lock().await.take() {
            if timeout(self.config.response_timeout, receiver).await.is_err() {
                warn!(session = self.session_id(), "Timed out waiting for GOODBYE reply");
            }
        }
        // Leave anyway in case the router never answered.
        self.shared.router.leave(&self.shared.session);
        debug!(session = self.session_id(), "Local client closed");
        Ok(())
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        if !self.shared.closed.swap(true, Ordering::AcqRel) {
            self.shared.router.leave(&self.shared.session);
        }
    }
}

async fn receive_loop(shared: Arc<Shared>, mut rx: mpsc::UnboundedReceiver<Message>) {
    while let Some(message) = rx.recv().await {
        match message {
            Message::Invocation {
                request,
                registration,
                details,
                arguments,
                arguments_kw,
            } => {
                let handler = shared
                    .handlers
                    .get(&registration)
                    .map(|h| Arc::clone(h.value()));
                match handler {
                    Some(handler) => {
                        let shared = Arc::clone(&shared);
                        let invocation = Invocation {
                            request,
                            registration,
                            details,
                            arguments,
                            arguments_kw,
                        };
                        tokio::spawn(async move {
                            let result = handler(invocation).await;
                            if shared.send(result.into_message(request)).is_err() {
                                trace!(request, "Dropping result for closed client");
                            }
                        });
                    }
                    None => {
                        let _ = shared.send(Message::error(
                            MessageType::Invocation,
                            request,
                            ERROR_NO_SUCH_REGISTRATION,
                        ));
                    }
                }
            }
            Message::Event {
                subscription,
                publication,
                details,
                arguments,
                arguments_kw,
            } => {
                if let Some(tx) = shared.subscribers.get(&subscription) {
                    let _ = tx.send(Event {
                        subscription,
                        publication,
                        details,
                        arguments,
                        arguments_kw,
                    });
                }
            }
            Message::Goodbye { reason, .. } => {
                debug!(session = shared.session.id(), reason = %reason, "Router ended session");
                shared.closed.store(true, Ordering::Release);
                break;
            }
            Message::Abort { reason, .. } => {
                warn!(session = shared.session.id(), reason = %reason, "Session aborted");
                shared.closed.store(true, Ordering::Release);
                break;
            }
            message => match message.reply_to() {
                Some(request) => complete(&shared, request, message),
                None => trace!(message_type = ?message.message_type(), "Ignoring message"),
            },
        }
    }

    shared.closed.store(true, Ordering::Release);
    shared.pending.clear();
    shared.subscribers.clear();
}

fn complete(shared: &Shared, request: Id, message: Message) {
    let Some((_, PendingRequest { reply, attachment })) = shared.pending.remove(&request) else {
        trace!(request, "Reply for unknown request");
        return;
    };

    match (&message, attachment) {
        (Message::Registered { registration, .. }, Some(Attachment::Handler(procedure, handler))) => {
            shared.handlers.insert(*registration, handler);
            shared.procedures.insert(procedure, *registration);
        }
        (Message::Subscribed { subscription, .. }, Some(Attachment::Events(tx))) => {
            shared.subscribers.insert(*subscription, tx);
        }
        _ => {}
    }

    let _ = reply.send(message);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::realm::RealmConfig;
    use crate::router::RouterConfig;
    use futures_util::FutureExt;
    use serde_json::json;

    fn router() -> Arc<Router> {
        Arc::new(Router::new(RouterConfig::single(RealmConfig::new("realm1"))).unwrap())
    }

    fn echo() -> InvocationHandler {
        Arc::new(|inv: Invocation| {
            async move { InvokeResult::new(inv.arguments, inv.arguments_kw) }.boxed()
        })
    }

    #[tokio::test]
    async fn test_register_and_call() {
        let router = router();
        let callee = Client::connect_local(Arc::clone(&router), ClientConfig::new("realm1"))
            .await
            .unwrap();
        let caller = Client::connect_local(Arc::clone(&router), ClientConfig::new("realm1"))
            .await
            .unwrap();

        callee.register("dev.echo", echo()).await.unwrap();
        let result = caller
            .call("dev.echo", vec![json!("hello")], Dict::new())
            .await
            .unwrap();
        assert_eq!(result.arguments, vec![json!("hello")]);
    }

    #[tokio::test]
    async fn test_call_failures() {
        let router = router();
        let callee = Client::connect_local(Arc::clone(&router), ClientConfig::new("realm1"))
            .await
            .unwrap();
        let failing: InvocationHandler =
            Arc::new(|_inv: Invocation| async { InvokeResult::error("dev.error.failed") }.boxed());
        callee.register("dev.fail", failing).await.unwrap();

        match callee.register("dev.fail", echo()).await {
            Err(ClientError::Remote { error, .. }) => {
                assert_eq!(error, "wamp.error.procedure_already_exists")
            }
            other => panic!("Expected Remote error, got {:?}", other.map(|_| ())),
        }

        match callee.call("dev.fail", List::new(), Dict::new()).await {
            Err(ClientError::Remote { error, .. }) => assert_eq!(error, "dev.error.failed"),
            other => panic!("Expected Remote error, got {:?}", other),
        }

        match callee.call("dev.missing", List::new(), Dict::new()).await {
            Err(ClientError::Remote { error, .. }) => {
                assert_eq!(error, "wamp.error.no_such_procedure")
            }
            other => panic!("Expected Remote error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_subscribe_receives_publications() {
        let router = router();
        let publisher = Client::connect_local(Arc::clone(&router), ClientConfig::new("realm1"))
            .await
            .unwrap();
        let subscriber = Client::connect_local(Arc::clone(&router), ClientConfig::new("realm1"))
            .await
            .unwrap();

        let mut events = subscriber.subscribe("dev.time").await.unwrap();
        publisher
            .publish("dev.time", Dict::new(), vec![json!("now")], Dict::new())
            .unwrap();

        let event = events.next().await.unwrap();
        assert_eq!(event.subscription, events.id());
        assert_eq!(event.arguments, vec![json!("now")]);
    }

    #[tokio::test]
    async fn test_unregister_removes_procedure() {
        let router = router();
        let callee = Client::connect_local(Arc::clone(&router), ClientConfig::new("realm1"))
            .await
            .unwrap();
        let caller = Client::connect_local(Arc::clone(&router), ClientConfig::new("realm1"))
            .await
            .unwrap();

        callee.register("dev.echo", echo()).await.unwrap();
        callee.unregister("dev.echo").await.unwrap();
        assert_eq!(router.stats().registrations, 0);

        match caller.call("dev.echo", vec![json!(1)], Dict::new()).await {
            Err(ClientError::Remote { error, .. }) => {
                assert_eq!(error, "wamp.error.no_such_procedure")
            }
            other => panic!("Expected Remote error, got {:?}", other),
        }

        assert!(matches!(
            callee.unregister("dev.echo").await,
            Err(ClientError::NotRegistered(procedure)) if procedure == "dev.echo"
        ));

        // The name is free again.
        caller.register("dev.echo", echo()).await.unwrap();
    }

    #[tokio::test]
    async fn test_unsubscribe_stops_delivery() {
        let router = router();
        let publisher = Client::connect_local(Arc::clone(&router), ClientConfig::new("realm1"))
            .await
            .unwrap();
        let subscriber = Client::connect_local(Arc::clone(&router), ClientConfig::new("realm1"))
            .await
            .unwrap();

        let dropped = subscriber.subscribe("dev.time").await.unwrap();
        let mut kept = subscriber.subscribe("dev.tick").await.unwrap();
        assert_eq!(router.stats().subscriptions, 2);

        subscriber.unsubscribe(dropped).await.unwrap();
        assert_eq!(router.stats().subscriptions, 1);

        publisher
            .publish("dev.time", Dict::new(), vec![json!("late")], Dict::new())
            .unwrap();
        publisher
            .publish("dev.tick", Dict::new(), vec![json!(1)], Dict::new())
            .unwrap();

        // Events are delivered in publication order, so only the kept
        // subscription has anything to read.
        let event = kept.next().await.unwrap();
        assert_eq!(event.arguments, vec![json!(1)]);
        assert!(kept.events.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_call_times_out() {
        let router = router();
        let callee = Client::connect_local(Arc::clone(&router), ClientConfig::new("realm1"))
            .await
            .unwrap();
        let caller = Client::connect_local(
            Arc::clone(&router),
            ClientConfig::new("realm1").with_response_timeout(Duration::from_secs(1)),
        )
        .await
        .unwrap();

        let stalled: InvocationHandler = Arc::new(|_inv: Invocation| {
            async {
                tokio::time::sleep(Duration::from_secs(60)).await;
                InvokeResult::default()
            }
            .boxed()
        });
        callee.register("dev.stall", stalled).await.unwrap();

        match caller.call("dev.stall", List::new(), Dict::new()).await {
            Err(ClientError::Timeout(_)) => {}
            other => panic!("Expected Timeout error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_close_releases_registrations() {
        let router = router();
        let client = Client::connect_local(Arc::clone(&router), ClientConfig::new("realm1"))
            .await
            .unwrap();
        client.register("dev.echo", echo()).await.unwrap();
        assert_eq!(router.stats().registrations, 1);

        client.close().await.unwrap();
        assert!(client.is_closed());
        assert_eq!(router.stats().registrations, 0);
        assert_eq!(router.stats().sessions, 0);
        assert!(matches!(
            client.call("dev.echo", List::new(), Dict::new()).await,
            Err(ClientError::Closed)
        ));
        client.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_router_close_ends_client() {
        let router = router();
        let client = Client::connect_local(Arc::clone(&router), ClientConfig::new("realm1"))
            .await
            .unwrap();
        router.close();
        tokio::time::timeout(Duration::from_secs(1), async {
            while !client.is_closed() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_unknown_realm() {
        let router = router();
        assert!(matches!(
            Client::connect_local(router, ClientConfig::new("other")).await,
            Err(ClientError::Join(RouterError::NoSuchRealm(_)))
        ));
    }

    #[tokio::test]
    async fn test_drop_leaves_realm() {
        let router = router();
        {
            let client = Client::connect_local(Arc::clone(&router), ClientConfig::new("realm1"))
                .await
                .unwrap();
            client.register("dev.echo", echo()).await.unwrap();
        }
        assert_eq!(router.stats().sessions, 0);
        assert_eq!(router.stats().registrations, 0);
    }
}
