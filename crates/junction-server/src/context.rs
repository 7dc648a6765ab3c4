//! Shared application state.

use crate::config::Settings;
use std::sync::Arc;
use tenvis_junction_core::{Client, Router};

/// State handed to every startup component.
#[derive(Clone)]
pub struct AppContext {
    pub router: Arc<Router>,
    /// Local session used by the demo workloads.
    pub client: Arc<Client>,
    pub settings: Arc<Settings>,
}
