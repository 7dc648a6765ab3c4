//! Local session bootstrap.

use crate::config::RouterConfiguration;
use crate::error::StartupError;
use std::sync::Arc;
use tenvis_junction_core::{Client, Router};
use tracing::info;

/// Join the configured realm with an in-process session.
///
/// # Errors
///
/// Returns [`StartupError::SessionEstablishment`] if the router refuses the
/// session.
pub async fn connect_local(
    router: &Arc<Router>,
    config: &RouterConfiguration,
) -> Result<Client, StartupError> {
    let client = Client::connect_local(Arc::clone(router), config.client_config())
        .await
        .map_err(StartupError::SessionEstablishment)?;

    info!(
        realm = %config.realm,
        session = client.session_id(),
        "Local session established"
    );
    Ok(client)
}
