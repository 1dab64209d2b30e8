//! Application State

use std::sync::Arc;

use gateway_store::PersistenceManager;

use crate::engine::Orchestrator;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    /// Chat orchestrator (routing, agent loop, caching)
    pub engine: Arc<Orchestrator>,

    /// Session store
    pub store: Arc<PersistenceManager>,

    /// Expected bearer token; `None` disables authentication
    pub auth_token: Option<String>,
}
