//! WebSocket transport.
//!
//! Served by axum. The WAMP serializer is picked from the
//! `Sec-WebSocket-Protocol` header (`wamp.2.json` or `wamp.2.msgpack`,
//! JSON when the client offers none). JSON travels in text frames,
//! MessagePack in binary frames.

use crate::listener::{ListenAddr, ListenerHandle};
use crate::session::{serve_connection, SessionOptions, DEFAULT_HELLO_TIMEOUT, DEFAULT_KEEP_ALIVE};
use crate::traits::{Connection, Incoming, TransportError};
use async_trait::async_trait;
use axum::{
    extract::{
        ws::{Message as WsMessage, WebSocket, WebSocketUpgrade},
        ConnectInfo, State,
    },
    http::{
        header::{COOKIE, HOST, ORIGIN, SEC_WEBSOCKET_PROTOCOL, SET_COOKIE},
        HeaderMap, HeaderValue, StatusCode,
    },
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use bytes::Bytes;
use junction_protocol::{Message, Serializer, MAX_MESSAGE_SIZE};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tenvis_junction_core::{Router as WampRouter, TransportDetails, TransportKind};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Name of the session tracking cookie.
pub const TRACKING_COOKIE: &str = "junction-wamp-cookie";

/// Route of the JSON health endpoint.
pub const HEALTH_PATH: &str = "/health";

/// Which `Origin` headers are accepted on upgrade.
///
/// Requests without an `Origin` header are not from browsers and are always
/// accepted.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum OriginPolicy {
    /// Accept every origin.
    AllowAll,
    /// Accept only origins whose host matches the request's `Host`.
    #[default]
    SameOrigin,
    /// Accept the same origin plus the listed origins (`scheme://host[:port]`).
    AllowList(Vec<String>),
}

impl OriginPolicy {
    /// Build a policy from configured origins: empty means same-origin and
    /// `*` accepts everything.
    #[must_use]
    pub fn from_origins(origins: &[String]) -> Self {
        if origins.is_empty() {
            OriginPolicy::SameOrigin
        } else if origins.iter().any(|o| o.trim() == "*") {
            OriginPolicy::AllowAll
        } else {
            OriginPolicy::AllowList(
                origins
                    .iter()
                    .map(|o| o.trim().trim_end_matches('/').to_ascii_lowercase())
                    .collect(),
            )
        }
    }

    /// Whether a request with these `Origin` and `Host` values is accepted.
    #[must_use]
    pub fn allows(&self, origin: Option<&str>, host: Option<&str>) -> bool {
        let Some(origin) = origin else {
            return true;
        };
        let same_origin = host.is_some_and(|host| origin_host(origin).eq_ignore_ascii_case(host));

        match self {
            OriginPolicy::AllowAll => true,
            OriginPolicy::SameOrigin => same_origin,
            OriginPolicy::AllowList(allowed) => {
                let origin = origin.trim_end_matches('/');
                same_origin || allowed.iter().any(|a| a.eq_ignore_ascii_case(origin))
            }
        }
    }
}

fn origin_host(origin: &str) -> &str {
    origin
        .split_once("://")
        .map_or(origin, |(_, rest)| rest)
        .trim_end_matches('/')
}

/// WebSocket server options.
#[derive(Debug, Clone)]
pub struct WebSocketOptions {
    /// Upgrade path.
    pub path: String,
    /// Request per-message compression. Not supported: axum does not
    /// negotiate `permessage-deflate`, so frames are always sent uncompressed
    /// and this flag only produces a debug log.
    pub enable_compression: bool,
    pub origin_policy: OriginPolicy,
    /// Issue a tracking cookie when the client does not present one.
    pub tracking_cookie: bool,
    /// Ping interval; zero disables keep-alive.
    pub keep_alive: Duration,
    pub hello_timeout: Duration,
}

impl Default for WebSocketOptions {
    fn default() -> Self {
        Self {
            path: "/".to_string(),
            enable_compression: true,
            origin_policy: OriginPolicy::default(),
            tracking_cookie: true,
            keep_alive: DEFAULT_KEEP_ALIVE,
            hello_timeout: DEFAULT_HELLO_TIMEOUT,
        }
    }
}

#[derive(Clone)]
struct AppState {
    router: Arc<WampRouter>,
    options: Arc<WebSocketOptions>,
    shutdown: CancellationToken,
}

/// WebSocket server bound to a router.
pub struct WebSocketServer {
    router: Arc<WampRouter>,
    options: Arc<WebSocketOptions>,
}

impl WebSocketServer {
    /// Create a server with default options.
    #[must_use]
    pub fn new(router: Arc<WampRouter>) -> Self {
        Self::with_options(router, WebSocketOptions::default())
    }

    #[must_use]
    pub fn with_options(router: Arc<WampRouter>, options: WebSocketOptions) -> Self {
        Self {
            router,
            options: Arc::new(options),
        }
    }

    fn app(&self, shutdown: CancellationToken) -> Router {
        let state = AppState {
            router: Arc::clone(&self.router),
            options: Arc::clone(&self.options),
            shutdown,
        };

        Router::new()
            .route(&self.options.path, get(ws_handler))
            .route(HEALTH_PATH, get(health_handler))
            .with_state(state)
    }

    /// Bind `addr` (`host:port`) and start serving upgrades.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::InvalidPath`] if the upgrade path cannot be
    /// routed, or [`TransportError::Bind`] if the address cannot be bound.
    pub async fn listen_and_serve(&self, addr: &str) -> Result<ListenerHandle, TransportError> {
        validate_path(&self.options.path)?;
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| TransportError::Bind {
                address: addr.to_string(),
                source,
            })?;
        let local_addr = listener.local_addr()?;

        if self.options.enable_compression {
            debug!("WebSocket compression requested; frames are sent uncompressed");
        }

        let token = CancellationToken::new();
        let app = self.app(token.clone());
        let shutdown = token.clone();
        let task = tokio::spawn(async move {
            let result = axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await;

            if let Err(e) = result {
                error!(error = %e, "WebSocket server failed");
            }
        });

        info!(
            addr = %local_addr,
            path = %self.options.path,
            origin_policy = ?self.options.origin_policy,
            "WebSocket listener started"
        );
        Ok(ListenerHandle::new(
            TransportKind::WebSocket,
            ListenAddr::Inet(local_addr),
            token,
            task,
        ))
    }
}

/// Check that `path` can be routed as the upgrade endpoint: absolute, a
/// literal path, and distinct from `/health`.
///
/// # Errors
///
/// Returns [`TransportError::InvalidPath`] describing the problem.
pub fn validate_path(path: &str) -> Result<(), TransportError> {
    let reason = if !path.starts_with('/') {
        "must start with '/'"
    } else if path.contains(|c| matches!(c, ':' | '*' | '{' | '}')) {
        "must be a literal path without parameters or wildcards"
    } else if path.trim_end_matches('/') == HEALTH_PATH {
        "is reserved for the health check"
    } else {
        return Ok(());
    };

    Err(TransportError::InvalidPath {
        path: path.to_string(),
        reason,
    })
}

/// Health check handler.
async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let stats = state.router.stats();
    axum::Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "sessions": stats.sessions,
    }))
}

/// WebSocket upgrade handler.
async fn ws_handler(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let origin = headers.get(ORIGIN).and_then(|v| v.to_str().ok());
    let host = headers.get(HOST).and_then(|v| v.to_str().ok());
    if !state.options.origin_policy.allows(origin, host) {
        warn!(peer = %peer, origin = origin.unwrap_or_default(), "Rejected WebSocket origin");
        return (StatusCode::FORBIDDEN, "origin not allowed").into_response();
    }

    let (serializer, offered) = match negotiate_serializer(&headers) {
        Ok(negotiated) => negotiated,
        Err(offered) => {
            warn!(peer = %peer, offered = %offered, "No supported WebSocket subprotocol");
            return (StatusCode::BAD_REQUEST, "unsupported subprotocol").into_response();
        }
    };

    let presented = tracking_cookie(&headers);
    let issued = match (&presented, state.options.tracking_cookie) {
        (None, true) => Some(format!("{:032x}", rand::random::<u128>())),
        _ => None,
    };

    let mut details = TransportDetails::new(TransportKind::WebSocket)
        .with_peer(peer.to_string())
        .with_serializer(serializer);
    if let Some(cookie) = presented.as_ref().or(issued.as_ref()) {
        details = details.with_cookie(cookie.clone());
    }

    let ws = if offered {
        ws.protocols([serializer.subprotocol()])
    } else {
        ws
    };

    let session_options = SessionOptions {
        keep_alive: state.options.keep_alive,
        hello_timeout: state.options.hello_timeout,
    };
    let mut response = ws
        .max_message_size(MAX_MESSAGE_SIZE)
        .on_upgrade(move |socket| async move {
            let conn = WebSocketConnection::new(socket, serializer, details);
            let token = state.shutdown.child_token();
            serve_connection(&state.router, conn, session_options, token).await;
        });

    if let Some(cookie) = issued {
        match HeaderValue::from_str(&format!("{}={}; Path=/; HttpOnly", TRACKING_COOKIE, cookie)) {
            Ok(value) => {
                response.headers_mut().append(SET_COOKIE, value);
            }
            Err(e) => warn!(error = %e, "Invalid tracking cookie"),
        }
    }

    response
}

/// Pick a serializer from the offered subprotocols, in client order.
///
/// Returns the serializer and whether the client offered any subprotocol, or
/// the offer if none of it is supported.
fn negotiate_serializer(headers: &HeaderMap) -> Result<(Serializer, bool), String> {
    let offered: Vec<&str> = headers
        .get_all(SEC_WEBSOCKET_PROTOCOL)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .collect();

    if offered.is_empty() {
        return Ok((Serializer::Json, false));
    }

    offered
        .iter()
        .find_map(|p| Serializer::from_subprotocol(p))
        .map(|s| (s, true))
        .ok_or_else(|| offered.join(", "))
}

fn tracking_cookie(headers: &HeaderMap) -> Option<String> {
    headers
        .get_all(COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(name, _)| *name == TRACKING_COOKIE)
        .map(|(_, value)| value.to_string())
}

/// A WebSocket connection.
pub struct WebSocketConnection {
    socket: WebSocket,
    serializer: Serializer,
    details: TransportDetails,
}

impl WebSocketConnection {
    fn new(socket: WebSocket, serializer: Serializer, details: TransportDetails) -> Self {
        Self {
            socket,
            serializer,
            details,
        }
    }

    async fn send_frame(&mut self, frame: WsMessage) -> Result<(), TransportError> {
        self.socket
            .send(frame)
            .await
            .map_err(|e| TransportError::SendFailed(e.to_string()))
    }
}

#[async_trait]
impl Connection for WebSocketConnection {
    fn details(&self) -> &TransportDetails {
        &self.details
    }

    async fn recv(&mut self) -> Result<Option<Incoming>, TransportError> {
        loop {
            match self.socket.recv().await {
                Some(Ok(WsMessage::Text(text))) => {
                    return Ok(Some(Incoming::Message(self.serializer.decode(text.as_bytes())?)));
                }
                Some(Ok(WsMessage::Binary(data))) => {
                    return Ok(Some(Incoming::Message(self.serializer.decode(&data)?)));
                }
                Some(Ok(WsMessage::Ping(data))) => return Ok(Some(Incoming::Ping(data.into()))),
                Some(Ok(WsMessage::Pong(data))) => return Ok(Some(Incoming::Pong(data.into()))),
                Some(Ok(WsMessage::Close(_))) => {
                    debug!("Received close frame");
                    return Ok(None);
                }
                Some(Err(e)) => return Err(TransportError::ReceiveFailed(e.to_string())),
                None => return Ok(None),
            }
        }
    }

    async fn send(&mut self, message: &Message) -> Result<(), TransportError> {
        let payload = self.serializer.encode(message)?;
        let frame = if self.serializer.is_binary() {
            WsMessage::Binary(payload.to_vec())
        } else {
            let text = String::from_utf8(payload.to_vec())
                .map_err(|e| TransportError::SendFailed(e.to_string()))?;
            WsMessage::Text(text)
        };
        self.send_frame(frame).await
    }

    async fn ping(&mut self, payload: Bytes) -> Result<(), TransportError> {
        self.send_frame(WsMessage::Ping(payload.to_vec())).await
    }

    async fn pong(&mut self, payload: Bytes) -> Result<(), TransportError> {
        self.send_frame(WsMessage::Pong(payload.to_vec())).await
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        match self.socket.send(WsMessage::Close(None)).await {
            Ok(()) => Ok(()),
            // The peer may already be gone.
            Err(e) => {
                debug!(error = %e, "Close frame not sent");
                Ok(())
            }
        }
    }
}
