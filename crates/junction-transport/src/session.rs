//! The session loop shared by every transport.
//!
//! A connection must open with HELLO. Once the router has welcomed the
//! session, the loop multiplexes the peer's messages, the router's outbound
//! queue, keep-alive pings and the listener's shutdown token until one side
//! ends the session.

use crate::metrics::ConnectionMetricsGuard;
use crate::traits::{Connection, Incoming, TransportError};
use bytes::Bytes;
use junction_protocol::uri::{CLOSE_SYSTEM_SHUTDOWN, ERROR_PROTOCOL_VIOLATION};
use junction_protocol::Message;
use std::time::Duration;
use tenvis_junction_core::metrics::{record_error, record_message};
use tenvis_junction_core::{Router, Session};
use tokio::sync::mpsc;
use tokio::time::{interval_at, timeout, Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

/// Default keep-alive ping interval.
pub const DEFAULT_KEEP_ALIVE: Duration = Duration::from_secs(30);

/// Time a new connection has to send HELLO.
pub const DEFAULT_HELLO_TIMEOUT: Duration = Duration::from_secs(10);

/// Session loop settings.
#[derive(Debug, Clone, Copy)]
pub struct SessionOptions {
    /// Ping interval; zero disables keep-alive.
    pub keep_alive: Duration,
    pub hello_timeout: Duration,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            keep_alive: DEFAULT_KEEP_ALIVE,
            hello_timeout: DEFAULT_HELLO_TIMEOUT,
        }
    }
}

/// Serve one accepted connection until the session ends.
pub async fn serve_connection<C: Connection>(
    router: &Router,
    mut conn: C,
    options: SessionOptions,
    shutdown: CancellationToken,
) {
    let kind = conn.details().kind;
    let peer = conn.details().peer.clone().unwrap_or_default();
    let _metrics_guard = ConnectionMetricsGuard::new(kind);
    debug!(transport = %kind, peer = %peer, "Connection opened");

    let established = establish(router, &mut conn, options.hello_timeout, &shutdown).await;
    let (session, mut outbound) = match established {
        Ok(Some(joined)) => joined,
        Ok(None) => {
            let _ = conn.close().await;
            return;
        }
        Err(e) => {
            debug!(transport = %kind, peer = %peer, error = %e, "Session not established");
            abort_on_protocol_error(&mut conn, &e).await;
            let _ = conn.close().await;
            return;
        }
    };

    let result = run(router, &session, &mut conn, &mut outbound, options.keep_alive, &shutdown).await;
    router.leave(&session);

    match &result {
        Ok(()) => {
            // Flush what the router queued before it let the session go.
            while let Ok(message) = outbound.try_recv() {
                if conn.send(&message).await.is_err() {
                    break;
                }
            }
        }
        Err(e) => {
            warn!(session = session.id(), transport = %kind, error = %e, "Session ended with error");
            record_error("session");
            abort_on_protocol_error(&mut conn, e).await;
        }
    }

    let _ = conn.close().await;
    debug!(session = session.id(), transport = %kind, peer = %peer, "Connection closed");
}

async fn establish<C: Connection>(
    router: &Router,
    conn: &mut C,
    hello_timeout: Duration,
    shutdown: &CancellationToken,
) -> Result<Option<(Session, mpsc::UnboundedReceiver<Message>)>, TransportError> {
    let first = tokio::select! {
        _ = shutdown.cancelled() => return Ok(None),
        first = timeout(hello_timeout, next_message(conn)) => {
            first.map_err(|_| TransportError::Timeout)??
        }
    };

    let (realm, details) = match first {
        Some(Message::Hello { realm, details }) => (realm, details),
        Some(other) => {
            let message_type = other.message_type();
            debug!(?message_type, "First message was not HELLO");
            conn.send(&Message::abort_with_message(
                ERROR_PROTOCOL_VIOLATION,
                format!("expected HELLO, got {:?}", message_type),
            ))
            .await?;
            return Ok(None);
        }
        None => return Ok(None),
    };

    let (tx, rx) = mpsc::unbounded_channel();
    match router.join(&realm, &details, conn.details().clone(), tx) {
        Ok(session) => {
            info!(
                session = session.id(),
                realm = %realm,
                transport = %conn.details().kind,
                serializer = ?conn.details().serializer,
                "Session established"
            );
            Ok(Some((session, rx)))
        }
        Err(e) => {
            info!(realm = %realm, error = %e, "Join rejected");
            conn.send(&e.to_abort()).await?;
            Ok(None)
        }
    }
}

async fn next_message<C: Connection>(conn: &mut C) -> Result<Option<Message>, TransportError> {
    loop {
        match conn.recv().await? {
            Some(Incoming::Message(message)) => return Ok(Some(message)),
            Some(Incoming::Ping(payload)) => conn.pong(payload).await?,
            Some(Incoming::Pong(_)) => {}
            None => return Ok(None),
        }
    }
}

async fn run<C: Connection>(
    router: &Router,
    session: &Session,
    conn: &mut C,
    outbound: &mut mpsc::UnboundedReceiver<Message>,
    keep_alive: Duration,
    shutdown: &CancellationToken,
) -> Result<(), TransportError> {
    let kind = conn.details().kind;
    let mut ticker = (!keep_alive.is_zero()).then(|| {
        let mut ticker = interval_at(Instant::now() + keep_alive, keep_alive);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker
    });

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                debug!(session = session.id(), "Listener closing, ending session");
                conn.send(&Message::goodbye(CLOSE_SYSTEM_SHUTDOWN)).await?;
                return Ok(());
            }
            message = outbound.recv() => match message {
                Some(message) => {
                    conn.send(&message).await?;
                    record_message(kind, "outbound");
                }
                // The router removed the session.
                None => return Ok(()),
            },
            incoming = conn.recv() => match incoming? {
                Some(Incoming::Message(message)) => {
                    record_message(kind, "inbound");
                    router.handle(session, message);
                }
                Some(Incoming::Ping(payload)) => conn.pong(payload).await?,
                Some(Incoming::Pong(_)) => trace!(session = session.id(), "Pong"),
                None => {
                    debug!(session = session.id(), "Peer disconnected");
                    return Ok(());
                }
            },
            _ = tick(&mut ticker) => conn.ping(Bytes::new()).await?,
        }
    }
}

async fn tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending().await,
    }
}

async fn abort_on_protocol_error<C: Connection>(conn: &mut C, error: &TransportError) {
    if let TransportError::Protocol(e) = error {
        let _ = conn
            .send(&Message::abort_with_message(ERROR_PROTOCOL_VIOLATION, e.to_string()))
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use junction_protocol::uri::ERROR_NO_SUCH_REALM;
    use junction_protocol::Dict;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tenvis_junction_core::{RealmConfig, RouterConfig, TransportDetails, TransportKind};

    /// Connection backed by channels, standing in for a socket.
    struct ChannelConnection {
        details: TransportDetails,
        inbound: mpsc::UnboundedReceiver<Incoming>,
        sent: mpsc::UnboundedSender<Message>,
        pings: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Connection for ChannelConnection {
        fn details(&self) -> &TransportDetails {
            &self.details
        }

        async fn recv(&mut self) -> Result<Option<Incoming>, TransportError> {
            Ok(self.inbound.recv().await)
        }

        async fn send(&mut self, message: &Message) -> Result<(), TransportError> {
            self.sent
                .send(message.clone())
                .map_err(|_| TransportError::ConnectionClosed)
        }

        async fn ping(&mut self, _payload: Bytes) -> Result<(), TransportError> {
            self.pings.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn pong(&mut self, _payload: Bytes) -> Result<(), TransportError> {
            Ok(())
        }

        async fn close(&mut self) -> Result<(), TransportError> {
            Ok(())
        }
    }

    fn connection() -> (
        ChannelConnection,
        mpsc::UnboundedSender<Incoming>,
        mpsc::UnboundedReceiver<Message>,
    ) {
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let conn = ChannelConnection {
            details: TransportDetails::new(TransportKind::RawSocket),
            inbound: in_rx,
            sent: out_tx,
            pings: Arc::new(AtomicUsize::new(0)),
        };
        (conn, in_tx, out_rx)
    }

    fn router() -> Router {
        Router::new(RouterConfig::single(RealmConfig::new("realm1"))).unwrap()
    }

    #[tokio::test]
    async fn test_hello_welcome_goodbye() {
        let router = router();
        let (conn, peer, mut sent) = connection();

        peer.send(Incoming::Message(Message::hello("realm1", Dict::new())))
            .unwrap();
        peer.send(Incoming::Message(Message::goodbye("wamp.close.normal")))
            .unwrap();

        serve_connection(&router, conn, SessionOptions::default(), CancellationToken::new()).await;

        assert!(matches!(sent.recv().await, Some(Message::Welcome { .. })));
        assert!(matches!(
            sent.recv().await,
            Some(Message::Goodbye { reason, .. }) if reason == "wamp.close.goodbye_and_out"
        ));
        assert_eq!(router.stats().sessions, 0);
    }

    #[tokio::test]
    async fn test_unknown_realm_aborts() {
        let router = router();
        let (conn, peer, mut sent) = connection();
        peer.send(Incoming::Message(Message::hello("other", Dict::new())))
            .unwrap();

        serve_connection(&router, conn, SessionOptions::default(), CancellationToken::new()).await;

        assert!(matches!(
            sent.recv().await,
            Some(Message::Abort { reason, .. }) if reason == ERROR_NO_SUCH_REALM
        ));
    }

    #[tokio::test]
    async fn test_first_message_must_be_hello() {
        let router = router();
        let (conn, peer, mut sent) = connection();
        peer.send(Incoming::Message(Message::goodbye("wamp.close.normal")))
            .unwrap();

        serve_connection(&router, conn, SessionOptions::default(), CancellationToken::new()).await;

        assert!(matches!(
            sent.recv().await,
            Some(Message::Abort { reason, .. }) if reason == ERROR_PROTOCOL_VIOLATION
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_hello_timeout() {
        let router = router();
        let (conn, _peer, mut sent) = connection();
        let options = SessionOptions {
            hello_timeout: Duration::from_secs(1),
            ..SessionOptions::default()
        };

        serve_connection(&router, conn, options, CancellationToken::new()).await;
        assert!(sent.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_shutdown_says_goodbye() {
        let router = router();
        let (conn, peer, mut sent) = connection();
        let token = CancellationToken::new();
        peer.send(Incoming::Message(Message::hello("realm1", Dict::new())))
            .unwrap();

        let task = {
            let token = token.clone();
            async move { serve_connection(&router, conn, SessionOptions::default(), token).await }
        };
        let handle = tokio::spawn(task);

        assert!(matches!(sent.recv().await, Some(Message::Welcome { .. })));
        token.cancel();
        assert!(matches!(
            sent.recv().await,
            Some(Message::Goodbye { reason, .. }) if reason == CLOSE_SYSTEM_SHUTDOWN
        ));
        handle.await.unwrap();
    }

    async fn pings_after(keep_alive: Duration, wait: Duration) -> usize {
        let router = Arc::new(router());
        let (conn, peer, mut sent) = connection();
        let pings = Arc::clone(&conn.pings);
        let token = CancellationToken::new();
        peer.send(Incoming::Message(Message::hello("realm1", Dict::new())))
            .unwrap();

        let options = SessionOptions {
            keep_alive,
            ..SessionOptions::default()
        };
        let handle = {
            let router = Arc::clone(&router);
            let token = token.clone();
            tokio::spawn(async move { serve_connection(&router, conn, options, token).await })
        };
        assert!(matches!(sent.recv().await, Some(Message::Welcome { .. })));

        tokio::time::sleep(wait).await;
        let count = pings.load(Ordering::SeqCst);

        token.cancel();
        handle.await.unwrap();
        count
    }

    #[tokio::test(start_paused = true)]
    async fn test_keep_alive_pings() {
        let count = pings_after(Duration::from_secs(5), Duration::from_millis(16_500)).await;
        assert_eq!(count, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_keep_alive_never_pings() {
        let count = pings_after(Duration::ZERO, Duration::from_secs(120)).await;
        assert_eq!(count, 0);
    }
}
