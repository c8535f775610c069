//! Application state shared across HTTP handlers.

use std::sync::Arc;

use crate::auth::AuthService;
use crate::db::Database;
use crate::realtime::ConnManager;

pub struct AppState {
    /// Transactional chat store.
    pub db: Database,
    /// Session issuance and validation.
    pub auth: AuthService,
    /// Live WebSocket connections keyed by username.
    pub manager: Arc<ConnManager>,
}

/// Shared application state type.
pub type SharedState = Arc<AppState>;
