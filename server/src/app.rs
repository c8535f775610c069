//! Application assembly: opens the store, wires the realtime engine to the
//! chat store, and builds the HTTP router. `main` and the integration tests
//! both go through here.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::middleware;
use axum::routing::{delete, get, post};
use axum::Router;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower::ServiceBuilder;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::auth::{auth_middleware, AuthService};
use crate::db::Database;
use crate::events::{register_event_handlers, register_presence_hooks};
use crate::handlers::{
    add_member_handler, create_room_handler, get_room_handler, get_room_messages_handler,
    get_user_handler, health_handler, me_handler, my_rooms_handler, register_handler,
    remove_member_handler, signin_handler, signout_handler, ws_handler,
};
use crate::realtime::{ConnManager, Emitter, EventRouter};
use crate::state::{AppState, SharedState};

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub database: String,
    pub secret: String,
    pub token_ttl_hours: i64,
}

/// A fully wired server: shared state, the HTTP router, and the dispatch
/// loop feeding domain handlers from the connection manager's inbound
/// stream.
pub struct App {
    pub state: SharedState,
    pub router: Router,
    event_router: Arc<EventRouter>,
    cancel: CancellationToken,
    dispatch: JoinHandle<()>,
}

impl App {
    pub async fn new(config: AppConfig) -> Result<Self> {
        let db = Database::new(&config.database)
            .await
            .context("opening database")?;

        let cancel = CancellationToken::new();
        let manager = Arc::new(ConnManager::new(cancel.clone()));
        let emitter = Emitter::new(Arc::clone(&manager));
        let auth = AuthService::new(
            db.clone(),
            config.secret.as_bytes(),
            chrono::Duration::hours(config.token_ttl_hours),
        );

        let mut event_router = EventRouter::new(emitter.clone(), cancel.clone());
        register_event_handlers(&mut event_router, &db, &manager);
        register_presence_hooks(&manager, &db, &emitter);
        let event_router = Arc::new(event_router);

        let inbound = manager
            .take_receiver()
            .context("inbound receiver already taken")?;
        let dispatch = tokio::spawn(Arc::clone(&event_router).listen(inbound));

        let state: SharedState = Arc::new(AppState { db, auth, manager });
        let router = routes(state.clone());

        Ok(Self {
            state,
            router,
            event_router,
            cancel,
            dispatch,
        })
    }

    /// Winds the engine down: cancels the process context, evicts every
    /// connection, drains in-flight handlers, then closes the store. Each
    /// wait is bounded by `deadline`; returns false when any timed out.
    pub async fn shutdown(self, deadline: Duration) -> bool {
        self.cancel.cancel();

        let manager_drained = self.state.manager.shutdown(deadline).await;
        let handlers_drained = self.event_router.close(deadline).await;
        let dispatch_stopped = tokio::time::timeout(deadline, self.dispatch).await.is_ok();

        self.state.db.close().await;

        info!("shutdown complete");
        manager_drained && handlers_drained && dispatch_stopped
    }
}

fn routes(state: SharedState) -> Router {
    let public = Router::new()
        .route("/api/health", get(health_handler))
        .route("/api/users", post(register_handler))
        .route("/api/users/:username", get(get_user_handler))
        .route("/api/auth/signin", post(signin_handler));

    let protected = Router::new()
        .route("/api/users/me", get(me_handler))
        .route("/api/users/me/rooms", get(my_rooms_handler))
        .route("/api/auth/signout", post(signout_handler))
        .route("/api/rooms", post(create_room_handler))
        .route("/api/rooms/:id", get(get_room_handler))
        .route("/api/rooms/:id/messages", get(get_room_messages_handler))
        .route("/api/rooms/:id/members", post(add_member_handler))
        .route("/api/rooms/:id/members/:username", delete(remove_member_handler))
        .route("/ws", get(ws_handler))
        .route_layer(middleware::from_fn_with_state(state.clone(), auth_middleware));

    Router::new()
        .merge(public)
        .merge(protected)
        .with_state(state)
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(
                    CorsLayer::new()
                        .allow_methods(Any)
                        .allow_headers(Any)
                        .allow_origin(Any),
                ),
        )
}
