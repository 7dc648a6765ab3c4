//! Startup errors.

use tenvis_junction_core::{ClientError, RouterError, TransportKind};
use tenvis_junction_transport::TransportError;
use thiserror::Error;

/// Fatal conditions while starting or running. Each one aborts the process
/// after what was already acquired has been released.
#[derive(Debug, Error)]
pub enum StartupError {
    /// Invalid configuration, including no transport enabled.
    #[error("Invalid configuration: {0}")]
    Configuration(String),

    /// The router rejected the realm configuration.
    #[error("Failed to create router: {0}")]
    RouterCreation(#[source] RouterError),

    /// The local session could not join the realm.
    #[error("Failed to establish local session: {0}")]
    SessionEstablishment(#[source] ClientError),

    /// A listener failed to start.
    #[error("Failed to start {kind} transport on {address}: {source}")]
    TransportStart {
        kind: TransportKind,
        address: String,
        #[source]
        source: TransportError,
    },

    /// A demo procedure could not be registered.
    #[error("Failed to register {procedure}: {source}")]
    Registration {
        procedure: String,
        #[source]
        source: ClientError,
    },

    /// The interrupt handler could not be installed.
    #[error("Failed to listen for interrupts: {0}")]
    Signal(#[source] std::io::Error),
}

impl StartupError {
    /// Startup phase the error belongs to, for logs.
    #[must_use]
    pub fn phase(&self) -> &'static str {
        match self {
            StartupError::Configuration(_) => "configuration",
            StartupError::RouterCreation(_) => "router",
            StartupError::SessionEstablishment(_) => "local session",
            StartupError::TransportStart { .. } => "transport",
            StartupError::Registration { .. } => "registration",
            StartupError::Signal(_) => "signal",
        }
    }
}
