//! Handles for running listeners.

use crate::traits::TransportError;
use std::fmt;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use tenvis_junction_core::TransportKind;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Time a listener has to wind down after [`ListenerHandle::close`].
pub const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Address a listener is bound to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListenAddr {
    Inet(SocketAddr),
    Unix(PathBuf),
}

impl ListenAddr {
    /// The socket address, for TCP listeners.
    #[must_use]
    pub fn as_inet(&self) -> Option<SocketAddr> {
        match self {
            ListenAddr::Inet(addr) => Some(*addr),
            ListenAddr::Unix(_) => None,
        }
    }
}

impl fmt::Display for ListenAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ListenAddr::Inet(addr) => write!(f, "{}", addr),
            ListenAddr::Unix(path) => write!(f, "{}", path.display()),
        }
    }
}

/// A running listener.
///
/// Closing consumes the handle. Dropping the handle without closing it leaves
/// the listener running.
#[derive(Debug)]
pub struct ListenerHandle {
    kind: TransportKind,
    addr: ListenAddr,
    token: CancellationToken,
    task: JoinHandle<()>,
}

impl ListenerHandle {
    pub(crate) fn new(
        kind: TransportKind,
        addr: ListenAddr,
        token: CancellationToken,
        task: JoinHandle<()>,
    ) -> Self {
        Self {
            kind,
            addr,
            token,
            task,
        }
    }

    #[must_use]
    pub fn kind(&self) -> TransportKind {
        self.kind
    }

    /// Resolved local address.
    #[must_use]
    pub fn local_addr(&self) -> &ListenAddr {
        &self.addr
    }

    /// Whether the accept loop has stopped on its own.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Stop accepting, end open sessions and wait for the accept loop.
    ///
    /// Unix socket files are removed.
    ///
    /// # Errors
    ///
    /// Fails if the accept loop panicked or did not stop within
    /// [`CLOSE_TIMEOUT`]. Cleanup happens either way.
    pub async fn close(self) -> Result<(), TransportError> {
        let Self {
            kind,
            addr,
            token,
            mut task,
        } = self;
        token.cancel();

        let result = match timeout(CLOSE_TIMEOUT, &mut task).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(TransportError::Other(format!("listener task failed: {}", e))),
            Err(_) => {
                task.abort();
                Err(TransportError::Timeout)
            }
        };

        if let ListenAddr::Unix(path) = &addr {
            match std::fs::remove_file(path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!(path = %path.display(), error = %e, "Failed to remove socket file"),
            }
        }

        debug!(transport = %kind, addr = %addr, "Listener closed");
        result
    }
}
