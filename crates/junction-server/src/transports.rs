//! Transport manager: starts the configured listeners.

use crate::config::TransportSpec;
use crate::context::AppContext;
use crate::error::StartupError;
use std::sync::Arc;
use tenvis_junction_transport::{ListenerHandle, RawSocketServer, WebSocketServer};
use tracing::info;

/// Start one listener. The returned handle stops it when closed.
///
/// # Errors
///
/// Returns [`StartupError::TransportStart`] if the listener cannot bind.
pub async fn start_transport(
    ctx: &AppContext,
    spec: &TransportSpec,
) -> Result<ListenerHandle, StartupError> {
    let address = spec.address();
    let result = match spec {
        TransportSpec::WebSocket(ws) => {
            WebSocketServer::with_options(Arc::clone(&ctx.router), ws.options.clone())
                .listen_and_serve(&address)
                .await
        }
        TransportSpec::RawSocket(rs) => {
            RawSocketServer::with_options(Arc::clone(&ctx.router), rs.options.clone())
                .listen_and_serve(rs.network, &address)
                .await
        }
    };

    let handle = result.map_err(|source| StartupError::TransportStart {
        kind: spec.kind(),
        address: address.clone(),
        source,
    })?;

    match spec {
        TransportSpec::WebSocket(_) => info!("listening on ws://{}", handle.local_addr()),
        TransportSpec::RawSocket(rs) => {
            info!("listening on {}://{}", rs.network, handle.local_addr())
        }
    }

    Ok(handle)
}
