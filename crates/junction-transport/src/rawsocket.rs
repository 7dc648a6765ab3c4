//! Raw-socket transport.
//!
//! Serves the WAMP raw-socket protocol over TCP (`tcp`, `tcp4`, `tcp6`) and
//! Unix domain sockets (`unix` for stream sockets, `unixpacket` for
//! sequenced-packet sockets).

use crate::listener::{ListenAddr, ListenerHandle};
use crate::session::{serve_connection, SessionOptions, DEFAULT_HELLO_TIMEOUT, DEFAULT_KEEP_ALIVE};
use crate::traits::{Connection, Incoming, TransportError};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use junction_protocol::rawsocket::{
    decode_frame, encode_frame, refusal, FrameKind, Handshake, HandshakeError, HEADER_SIZE,
    MAX_LENGTH_EXPONENT,
};
use junction_protocol::{Message, Serializer};
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tenvis_junction_core::{Router, TransportDetails, TransportKind};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{lookup_host, TcpListener};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Read buffer growth step for stream sockets.
const STREAM_READ_CHUNK: usize = 8 * 1024;

/// Socket families a raw-socket listener can bind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Network {
    /// TCP over IPv4 or IPv6, whichever the host resolves to first.
    #[default]
    Tcp,
    Tcp4,
    Tcp6,
    /// Unix stream socket.
    Unix,
    /// Unix sequenced-packet socket.
    UnixPacket,
}

impl Network {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Network::Tcp => "tcp",
            Network::Tcp4 => "tcp4",
            Network::Tcp6 => "tcp6",
            Network::Unix => "unix",
            Network::UnixPacket => "unixpacket",
        }
    }

    /// Whether the address is a filesystem path rather than host:port.
    #[must_use]
    pub fn is_unix(self) -> bool {
        matches!(self, Network::Unix | Network::UnixPacket)
    }
}

impl FromStr for Network {
    type Err = TransportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "tcp" => Ok(Network::Tcp),
            "tcp4" => Ok(Network::Tcp4),
            "tcp6" => Ok(Network::Tcp6),
            "unix" => Ok(Network::Unix),
            "unixpacket" => Ok(Network::UnixPacket),
            _ => Err(TransportError::UnsupportedNetwork(s.to_string())),
        }
    }
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Raw-socket server options.
#[derive(Debug, Clone)]
pub struct RawSocketOptions {
    /// Ping interval; zero disables keep-alive.
    pub keep_alive: Duration,
    /// Announced maximum message length exponent (`2^(9 + n)` octets).
    pub length_exponent: u8,
    /// Time a client has to complete the handshake.
    pub handshake_timeout: Duration,
    /// Time a client has to send HELLO after the handshake.
    pub hello_timeout: Duration,
}

impl Default for RawSocketOptions {
    fn default() -> Self {
        Self {
            keep_alive: DEFAULT_KEEP_ALIVE,
            length_exponent: MAX_LENGTH_EXPONENT,
            handshake_timeout: Duration::from_secs(10),
            hello_timeout: DEFAULT_HELLO_TIMEOUT,
        }
    }
}

struct Shared {
    router: Arc<Router>,
    options: RawSocketOptions,
}

/// Raw-socket server bound to a router.
pub struct RawSocketServer {
    shared: Arc<Shared>,
}

impl RawSocketServer {
    /// Create a server with default options.
    #[must_use]
    pub fn new(router: Arc<Router>) -> Self {
        Self::with_options(router, RawSocketOptions::default())
    }

    #[must_use]
    pub fn with_options(router: Arc<Router>, options: RawSocketOptions) -> Self {
        Self {
            shared: Arc::new(Shared { router, options }),
        }
    }

    /// Bind `addr` and start accepting connections.
    ///
    /// For TCP networks `addr` is `host:port`; for Unix networks it is the
    /// socket path.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Bind`] if the address cannot be bound.
    pub async fn listen_and_serve(
        &self,
        network: Network,
        addr: &str,
    ) -> Result<ListenerHandle, TransportError> {
        let token = CancellationToken::new();
        let shared = Arc::clone(&self.shared);

        let (local_addr, task) = match network {
            Network::Tcp | Network::Tcp4 | Network::Tcp6 => {
                let listener = bind_tcp(network, addr).await?;
                let local_addr = listener.local_addr()?;
                let task = tokio::spawn(accept_loop(listener, shared, token.clone()));
                (ListenAddr::Inet(local_addr), task)
            }
            Network::Unix | Network::UnixPacket => {
                let listener = unix::bind(network, addr)?;
                let task = tokio::spawn(accept_loop(listener, shared, token.clone()));
                (ListenAddr::Unix(addr.into()), task)
            }
        };

        info!(network = %network, addr = %local_addr, "Raw-socket listener started");
        Ok(ListenerHandle::new(TransportKind::RawSocket, local_addr, token, task))
    }
}

async fn bind_tcp(network: Network, addr: &str) -> Result<TcpListener, TransportError> {
    let bind_error = |source| TransportError::Bind {
        address: addr.to_string(),
        source,
    };

    let candidates: Vec<SocketAddr> = lookup_host(addr)
        .await
        .map_err(bind_error)?
        .filter(|a| match network {
            Network::Tcp4 => a.is_ipv4(),
            Network::Tcp6 => a.is_ipv6(),
            _ => true,
        })
        .collect();

    let mut last_error = io::Error::new(
        io::ErrorKind::AddrNotAvailable,
        format!("no {} address for {}", network, addr),
    );
    for candidate in candidates {
        match TcpListener::bind(candidate).await {
            Ok(listener) => return Ok(listener),
            Err(e) => {
                debug!(addr = %candidate, error = %e, "Bind attempt failed");
                last_error = e;
            }
        }
    }
    Err(bind_error(last_error))
}

#[async_trait]
trait Accept: Send + Sync + 'static {
    type Stream: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    async fn accept_stream(&self) -> io::Result<(Self::Stream, String)>;

    /// Bytes to make room for before each read.
    fn read_reserve(&self, _max_len: usize) -> usize {
        STREAM_READ_CHUNK
    }
}

#[async_trait]
impl Accept for TcpListener {
    type Stream = tokio::net::TcpStream;

    async fn accept_stream(&self) -> io::Result<(Self::Stream, String)> {
        let (stream, peer) = self.accept().await?;
        stream.set_nodelay(true)?;
        Ok((stream, peer.to_string()))
    }
}

async fn accept_loop<L: Accept>(listener: L, shared: Arc<Shared>, token: CancellationToken) {
    let max_len = Handshake::new(Serializer::Json)
        .with_length_exponent(shared.options.length_exponent)
        .max_message_len();
    let reserve = listener.read_reserve(max_len);

    loop {
        let accepted = tokio::select! {
            _ = token.cancelled() => break,
            accepted = listener.accept_stream() => accepted,
        };

        match accepted {
            Ok((stream, peer)) => {
                let shared = Arc::clone(&shared);
                let token = token.child_token();
                tokio::spawn(async move {
                    serve_stream(stream, peer, reserve, shared, token).await;
                });
            }
            Err(e) => {
                error!(error = %e, "Failed to accept raw-socket connection");
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
    debug!("Raw-socket accept loop stopped");
}

async fn serve_stream<S>(
    mut stream: S,
    peer: String,
    read_reserve: usize,
    shared: Arc<Shared>,
    token: CancellationToken,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let options = &shared.options;
    let negotiated = tokio::select! {
        _ = token.cancelled() => return,
        negotiated = timeout(options.handshake_timeout, handshake(&mut stream, options.length_exponent)) => negotiated,
    };

    let (client, server) = match negotiated {
        Ok(Ok(pair)) => pair,
        Ok(Err(e)) => {
            warn!(peer = %peer, error = %e, "Raw-socket handshake failed");
            let _ = stream.shutdown().await;
            return;
        }
        Err(_) => {
            warn!(peer = %peer, "Raw-socket handshake timed out");
            return;
        }
    };

    debug!(
        peer = %peer,
        serializer = %client.serializer,
        client_max = client.max_message_len(),
        "Raw-socket handshake complete"
    );

    let details = TransportDetails::new(TransportKind::RawSocket)
        .with_peer(peer)
        .with_serializer(client.serializer);
    let conn = RawSocketConnection::new(stream, details, client, server, read_reserve);
    let session_options = SessionOptions {
        keep_alive: options.keep_alive,
        hello_timeout: options.hello_timeout,
    };
    serve_connection(&shared.router, conn, session_options, token).await;
}

/// Answer a client handshake. Returns the client's and our announcement.
async fn handshake<S>(stream: &mut S, length_exponent: u8) -> Result<(Handshake, Handshake), TransportError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut request = [0u8; HEADER_SIZE];
    stream.read_exact(&mut request).await?;

    match Handshake::parse_request(request) {
        Ok(client) => {
            let server = Handshake::new(client.serializer).with_length_exponent(length_exponent);
            stream.write_all(&server.encode()).await?;
            Ok((client, server))
        }
        Err(HandshakeError::Rejected(code)) => {
            stream.write_all(&refusal(code)).await?;
            Err(HandshakeError::Rejected(code).into())
        }
        Err(e) => Err(e.into()),
    }
}

/// A raw-socket connection after the handshake.
pub struct RawSocketConnection<S> {
    stream: S,
    details: TransportDetails,
    serializer: Serializer,
    read_buffer: BytesMut,
    write_buffer: BytesMut,
    /// Largest frame we accept, as we announced.
    recv_limit: usize,
    /// Largest frame the peer accepts, as it announced.
    send_limit: usize,
    read_reserve: usize,
}

impl<S> RawSocketConnection<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    fn new(
        stream: S,
        details: TransportDetails,
        client: Handshake,
        server: Handshake,
        read_reserve: usize,
    ) -> Self {
        Self {
            stream,
            details,
            serializer: client.serializer,
            read_buffer: BytesMut::with_capacity(read_reserve),
            write_buffer: BytesMut::with_capacity(STREAM_READ_CHUNK),
            recv_limit: server.max_message_len(),
            send_limit: client.max_message_len(),
            read_reserve,
        }
    }

    async fn write_frame(&mut self, kind: FrameKind, payload: &[u8]) -> Result<(), TransportError> {
        self.write_buffer.clear();
        encode_frame(kind, payload, self.send_limit, &mut self.write_buffer)?;
        // One write per frame keeps packet sockets aligned to frames.
        self.stream
            .write_all(&self.write_buffer)
            .await
            .map_err(|e| TransportError::SendFailed(e.to_string()))
    }
}

#[async_trait]
impl<S> Connection for RawSocketConnection<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    fn details(&self) -> &TransportDetails {
        &self.details
    }

    async fn recv(&mut self) -> Result<Option<Incoming>, TransportError> {
        loop {
            if let Some((kind, payload)) = decode_frame(&mut self.read_buffer, self.recv_limit)? {
                return Ok(Some(match kind {
                    FrameKind::Message => Incoming::Message(self.serializer.decode(&payload)?),
                    FrameKind::Ping => Incoming::Ping(payload),
                    FrameKind::Pong => Incoming::Pong(payload),
                }));
            }

            self.read_buffer.reserve(self.read_reserve);
            let read = self.stream.read_buf(&mut self.read_buffer).await?;
            if read == 0 {
                if self.read_buffer.is_empty() {
                    return Ok(None);
                }
                return Err(TransportError::ReceiveFailed(
                    "connection closed mid-frame".to_string(),
                ));
            }
        }
    }

    async fn send(&mut self, message: &Message) -> Result<(), TransportError> {
        let payload = self.serializer.encode(message)?;
        self.write_frame(FrameKind::Message, &payload).await
    }

    async fn ping(&mut self, payload: Bytes) -> Result<(), TransportError> {
        self.write_frame(FrameKind::Ping, &payload).await
    }

    async fn pong(&mut self, payload: Bytes) -> Result<(), TransportError> {
        self.write_frame(FrameKind::Pong, &payload).await
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        match self.stream.shutdown().await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotConnected => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(unix)]
mod unix {
    use super::{Accept, Network, TransportError, HEADER_SIZE};
    use async_trait::async_trait;
    use socket2::{Domain, SockAddr, Socket, Type};
    use std::io;
    use tokio::net::{UnixListener, UnixStream};

    /// Sequenced-packet listener. Every read must hold a whole packet.
    pub(super) struct PacketListener(UnixListener);

    pub(super) enum Listener {
        Unix(UnixListener),
        Packet(PacketListener),
    }

    pub(super) fn bind(network: Network, path: &str) -> Result<Listener, TransportError> {
        let bind_error = |source| TransportError::Bind {
            address: path.to_string(),
            source,
        };

        match network {
            Network::Unix => UnixListener::bind(path)
                .map(Listener::Unix)
                .map_err(bind_error),
            Network::UnixPacket => bind_packet(path)
                .map(|l| Listener::Packet(PacketListener(l)))
                .map_err(bind_error),
            other => Err(TransportError::UnsupportedNetwork(other.to_string())),
        }
    }

    fn bind_packet(path: &str) -> io::Result<UnixListener> {
        let socket = Socket::new(Domain::UNIX, Type::SEQPACKET, None)?;
        socket.bind(&SockAddr::unix(path)?)?;
        socket.listen(1024)?;
        socket.set_nonblocking(true)?;
        let listener: std::os::unix::net::UnixListener = socket.into();
        UnixListener::from_std(listener)
    }

    fn peer_label(stream: &UnixStream) -> String {
        stream
            .peer_addr()
            .ok()
            .and_then(|addr| addr.as_pathname().map(|p| p.display().to_string()))
            .unwrap_or_else(|| "unix".to_string())
    }

    #[async_trait]
    impl Accept for Listener {
        type Stream = UnixStream;

        async fn accept_stream(&self) -> io::Result<(Self::Stream, String)> {
            let listener = match self {
                Listener::Unix(l) => l,
                Listener::Packet(PacketListener(l)) => l,
            };
            let (stream, _) = listener.accept().await?;
            let peer = peer_label(&stream);
            Ok((stream, peer))
        }

        fn read_reserve(&self, max_len: usize) -> usize {
            match self {
                Listener::Unix(_) => super::STREAM_READ_CHUNK,
                Listener::Packet(_) => max_len + HEADER_SIZE,
            }
        }
    }
}

#[cfg(not(unix))]
mod unix {
    use super::{Accept, Network, TransportError};
    use async_trait::async_trait;
    use std::io;

    pub(super) enum Listener {}

    pub(super) fn bind(network: Network, _path: &str) -> Result<Listener, TransportError> {
        Err(TransportError::UnsupportedNetwork(network.to_string()))
    }

    #[async_trait]
    impl Accept for Listener {
        type Stream = tokio::net::TcpStream;

        async fn accept_stream(&self) -> io::Result<(Self::Stream, String)> {
            match *self {}
        }
    }
}
