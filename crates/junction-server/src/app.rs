//! Startup and shutdown sequencing.
//!
//! Startup acquires, in order: router, local session, listeners (WebSocket
//! first), demo workloads. Each acquired resource is pushed onto a
//! [`ResourceStack`]; a failure at any step releases what was acquired so
//! far, and shutdown releases everything in reverse order.

use crate::bootstrap;
use crate::config::Settings;
use crate::context::AppContext;
use crate::demo;
use crate::error::StartupError;
use crate::shutdown::{Interrupts, Phase, ResourceStack, ShutdownReport};
use crate::transports;
use std::sync::Arc;
use tenvis_junction_core::{Router, TransportKind};
use tenvis_junction_transport::ListenAddr;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// A started server.
pub struct Running {
    ctx: AppContext,
    resources: ResourceStack,
    listeners: Vec<(TransportKind, ListenAddr)>,
    phase: watch::Sender<Phase>,
}

impl Running {
    #[must_use]
    pub fn context(&self) -> &AppContext {
        &self.ctx
    }

    /// Bound address of every started listener, in startup order.
    #[must_use]
    pub fn listeners(&self) -> &[(TransportKind, ListenAddr)] {
        &self.listeners
    }

    #[must_use]
    pub fn phase(&self) -> watch::Receiver<Phase> {
        self.phase.subscribe()
    }

    /// Release every resource in reverse order of acquisition.
    pub async fn shutdown(mut self) -> ShutdownReport {
        self.phase.send_replace(Phase::Draining);
        info!(resources = self.resources.len(), "Shutting down");

        let report = self.resources.release_all().await;
        self.phase.send_replace(Phase::Terminated);

        if report.is_clean() {
            info!(released = report.released.len(), "Shutdown complete");
        } else {
            warn!(failures = report.failures.len(), "Shutdown completed with failures");
        }
        report
    }
}

/// Start the router, the local session, the listeners and the demo workloads.
///
/// # Errors
///
/// Returns the first [`StartupError`]. Everything acquired before it has been
/// released when this returns.
pub async fn start(settings: Settings) -> Result<Running, StartupError> {
    let mut resources = ResourceStack::new();
    match acquire(settings, &mut resources).await {
        Ok((ctx, listeners)) => {
            let (phase, _) = watch::channel(Phase::Running);
            Ok(Running {
                ctx,
                resources,
                listeners,
                phase,
            })
        }
        Err(e) => {
            error!(phase = e.phase(), error = %e, "Startup failed");
            if !resources.is_empty() {
                let report = resources.release_all().await;
                if !report.is_clean() {
                    warn!(failures = ?report.failures, "Failed to release some resources after startup error");
                }
            }
            Err(e)
        }
    }
}

async fn acquire(
    settings: Settings,
    resources: &mut ResourceStack,
) -> Result<(AppContext, Vec<(TransportKind, ListenAddr)>), StartupError> {
    let router = Arc::new(
        Router::new(settings.router.router_config()).map_err(StartupError::RouterCreation)?,
    );
    info!(realm = %settings.router.realm, "Router started");
    {
        let router = Arc::clone(&router);
        resources.push("router", move || async move {
            router.close();
            Ok(())
        });
    }

    let client = Arc::new(bootstrap::connect_local(&router, &settings.router).await?);
    {
        let client = Arc::clone(&client);
        resources.push("local session", move || async move {
            client.close().await?;
            Ok(())
        });
    }

    let ctx = AppContext {
        router,
        client,
        settings: Arc::new(settings),
    };

    let mut listeners = Vec::new();
    for spec in ctx.settings.transports.iter().filter(|spec| spec.enabled()) {
        let handle = transports::start_transport(&ctx, spec).await?;
        listeners.push((handle.kind(), handle.local_addr().clone()));
        resources.push(format!("{} listener", spec.kind()), move || async move {
            if handle.is_finished() {
                warn!(transport = %handle.kind(), addr = %handle.local_addr(), "Listener had already stopped");
            }
            handle.close().await?;
            Ok(())
        });
    }

    if let Some(publisher) = demo::register_workloads(&ctx).await? {
        resources.push("time publisher", move || async move {
            publisher.stop().await?;
            Ok(())
        });
    }

    Ok((ctx, listeners))
}

/// Start, wait for the first interrupt, then shut down. Interrupts that
/// arrive while draining are logged and ignored.
///
/// # Errors
///
/// Returns the [`StartupError`] if startup fails, or
/// [`StartupError::Signal`] (after releasing everything) if the interrupt
/// source failed.
pub async fn run(settings: Settings, mut interrupts: Interrupts) -> Result<ShutdownReport, StartupError> {
    let running = start(settings).await?;
    let stats = running.context().router.stats();
    info!(
        realm = %running.context().settings.router.realm,
        listeners = running.listeners().len(),
        registrations = stats.registrations,
        "Junction is running; press Ctrl-C to stop"
    );

    let failure = match interrupts.recv().await {
        Some(Ok(())) => {
            info!("Interrupt received, shutting down");
            None
        }
        Some(Err(e)) => {
            error!(error = %e, "Failed to listen for interrupts, shutting down");
            Some(e)
        }
        None => {
            warn!("Interrupt source closed, shutting down");
            None
        }
    };

    let phase = running.phase();
    let draining = running.shutdown();
    tokio::pin!(draining);
    let report = loop {
        tokio::select! {
            report = &mut draining => break report,
            Some(_) = interrupts.recv() => warn!("Shutdown already in progress; ignoring interrupt"),
        }
    };
    debug!(phase = ?*phase.borrow(), "Junction stopped");

    match failure {
        Some(e) => Err(StartupError::Signal(e)),
        None => Ok(report),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::demo::ECHO_PROCEDURE;
    use bytes::BytesMut;
    use futures_util::{SinkExt, StreamExt};
    use junction_protocol::rawsocket::{decode_frame, encode_frame, FrameKind, Handshake, HEADER_SIZE};
    use junction_protocol::{Dict, Message, Serializer};
    use serde_json::json;
    use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
    use tokio_tungstenite::tungstenite::Message as ClientMessage;

    fn free_port() -> u16 {
        std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port()
    }

    fn local_config() -> Config {
        let mut config = Config::default();
        config.realm = "realm1".to_string();
        config.websocket.host = "127.0.0.1".to_string();
        config.websocket.port = 0;
        config.rawsocket.port = 0;
        config
    }

    fn addr_of(running: &Running, kind: TransportKind) -> ListenAddr {
        running
            .listeners()
            .iter()
            .find(|(k, _)| *k == kind)
            .map(|(_, addr)| addr.clone())
            .unwrap()
    }

    async fn rawsocket_hello<S>(stream: &mut S) -> Message
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        stream
            .write_all(&Handshake::new(Serializer::Json).encode())
            .await
            .unwrap();
        let mut reply = [0u8; HEADER_SIZE];
        stream.read_exact(&mut reply).await.unwrap();
        Handshake::parse_reply(reply).unwrap();

        let payload = Serializer::Json
            .encode(&Message::hello("realm1", Dict::new()))
            .unwrap();
        let mut frame = BytesMut::new();
        encode_frame(FrameKind::Message, &payload, usize::MAX, &mut frame).unwrap();
        stream.write_all(&frame).await.unwrap();

        let mut buf = BytesMut::new();
        loop {
            if let Some((FrameKind::Message, payload)) = decode_frame(&mut buf, usize::MAX).unwrap() {
                return Serializer::Json.decode(&payload).unwrap();
            }
            buf.reserve(4096);
            assert!(stream.read_buf(&mut buf).await.unwrap() > 0, "connection closed");
        }
    }

    #[tokio::test]
    async fn test_both_transports_reachable() {
        let mut config = local_config();
        config.demo.echo = true;
        config.demo.echo_delay_ms = 0;
        config.demo.time = true;
        let running = start(config.resolve().unwrap()).await.unwrap();

        let kinds: Vec<TransportKind> = running.listeners().iter().map(|(k, _)| *k).collect();
        assert_eq!(kinds, vec![TransportKind::WebSocket, TransportKind::RawSocket]);

        let ws_addr = addr_of(&running, TransportKind::WebSocket).as_inet().unwrap();
        let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://{}/", ws_addr))
            .await
            .unwrap();
        ws.send(ClientMessage::Text(r#"[1,"realm1",{}]"#.to_string()))
            .await
            .unwrap();
        match ws.next().await.unwrap().unwrap() {
            ClientMessage::Text(text) => assert!(matches!(
                Serializer::Json.decode(text.as_bytes()).unwrap(),
                Message::Welcome { .. }
            )),
            other => panic!("Expected text frame, got {:?}", other),
        }

        let rs_addr = addr_of(&running, TransportKind::RawSocket).as_inet().unwrap();
        let mut stream = tokio::net::TcpStream::connect(rs_addr).await.unwrap();
        assert!(matches!(rawsocket_hello(&mut stream).await, Message::Welcome { .. }));

        let result = running
            .context()
            .client
            .call(ECHO_PROCEDURE, vec![json!("ping")], Dict::new())
            .await;
        assert_eq!(result.unwrap().arguments, vec![json!("ping")]);

        let phase = running.phase();
        let report = running.shutdown().await;
        assert!(report.is_clean());
        assert_eq!(
            report.released,
            vec![
                "time publisher",
                "rawsocket listener",
                "websocket listener",
                "local session",
                "router",
            ]
        );
        assert_eq!(*phase.borrow(), Phase::Terminated);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_unix_rawsocket_without_websocket() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("junction.sock");
        let ws_port = free_port();

        let mut config = local_config();
        config.websocket.enabled = false;
        config.websocket.port = ws_port;
        config.rawsocket.protocol = "unix".to_string();
        config.rawsocket.host = path.display().to_string();
        let running = start(config.resolve().unwrap()).await.unwrap();
        assert_eq!(running.listeners().len(), 1);

        let mut stream = tokio::net::UnixStream::connect(&path).await.unwrap();
        assert!(matches!(rawsocket_hello(&mut stream).await, Message::Welcome { .. }));

        assert!(tokio_tungstenite::connect_async(format!("ws://127.0.0.1:{}/", ws_port))
            .await
            .is_err());

        running.shutdown().await;
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_transport_failure_releases_acquired() {
        let occupied = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let rs_port = occupied.local_addr().unwrap().port();
        let ws_port = free_port();

        let mut config = local_config();
        config.websocket.port = ws_port;
        config.rawsocket.port = rs_port;

        match start(config.resolve().unwrap()).await {
            Err(StartupError::TransportStart { kind, .. }) => {
                assert_eq!(kind, TransportKind::RawSocket)
            }
            Err(other) => panic!("Expected TransportStart error, got {:?}", other),
            Ok(_) => panic!("Expected TransportStart error, got a running server"),
        }

        // The WebSocket listener started first and has been closed again.
        tokio::net::TcpListener::bind(("127.0.0.1", ws_port)).await.unwrap();
    }

    #[tokio::test]
    async fn test_invalid_websocket_path_releases_acquired() {
        let rs_port = free_port();
        let mut config = local_config();
        config.rawsocket.port = rs_port;
        let mut settings = config.resolve().unwrap();

        // Raw socket first, so one listener is up when the WebSocket fails.
        settings.transports.reverse();
        if let crate::config::TransportSpec::WebSocket(ws) = &mut settings.transports[1] {
            ws.options.path = "ws".to_string();
        }

        match start(settings).await {
            Err(StartupError::TransportStart { kind, source, .. }) => {
                assert_eq!(kind, TransportKind::WebSocket);
                assert!(matches!(
                    source,
                    tenvis_junction_transport::TransportError::InvalidPath { .. }
                ));
            }
            Err(other) => panic!("Expected TransportStart error, got {:?}", other),
            Ok(_) => panic!("Expected TransportStart error, got a running server"),
        }

        tokio::net::TcpListener::bind(("127.0.0.1", rs_port)).await.unwrap();
    }

    #[tokio::test]
    async fn test_run_until_interrupt() {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        let mut config = local_config();
        config.rawsocket.enabled = false;

        let server = tokio::spawn(run(config.resolve().unwrap(), rx));
        tx.send(Ok(())).unwrap();

        let report = server.await.unwrap().unwrap();
        assert_eq!(
            report.released,
            vec!["websocket listener", "local session", "router"]
        );
    }

    #[tokio::test]
    async fn test_second_interrupt_is_ignored() {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        let mut config = local_config();
        config.rawsocket.enabled = false;

        tx.send(Ok(())).unwrap();
        tx.send(Ok(())).unwrap();
        let report = run(config.resolve().unwrap(), rx).await.unwrap();

        assert!(report.is_clean());
        assert_eq!(
            report.released,
            vec!["websocket listener", "local session", "router"]
        );
    }

    #[tokio::test]
    async fn test_interrupt_failure_releases_and_errors() {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        let ws_port = free_port();
        let mut config = local_config();
        config.websocket.port = ws_port;
        config.rawsocket.enabled = false;

        tx.send(Err(std::io::Error::new(std::io::ErrorKind::Other, "no signal handler")))
            .unwrap();
        match run(config.resolve().unwrap(), rx).await {
            Err(StartupError::Signal(e)) => assert_eq!(e.to_string(), "no signal handler"),
            other => panic!("Expected Signal error, got {:?}", other),
        }

        tokio::net::TcpListener::bind(("127.0.0.1", ws_port)).await.unwrap();
    }
}
