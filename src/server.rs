//! HTTP surface: router assembly, room handler, admin handler and health.

use axum::{
    body::Bytes,
    extract::{ws::WebSocketUpgrade, OriginalUri, Path, State},
    http::{HeaderMap, Method},
    middleware,
    response::{IntoResponse, Response},
    routing::{any, get},
    Json, Router,
};
use serde_json::json;
use std::sync::Arc;
use std::time::Instant;
use tower::ServiceBuilder;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::admin::AdminPlane;
use crate::auth::{room_auth, AdminAuth, AuthContext, AuthGateway, PermissionResolver, TokenVerifier};
use crate::config::ServerConfig;
use crate::db::RelationalStore;
use crate::error::ServiceError;
use crate::history::HistoryRecorder;
use crate::projection::{ProjectionEngine, ProjectionQueue, Reconciler};
use crate::room::dispatcher::Dispatcher;
use crate::room::ConnectionMultiplexer;
use crate::storage::SnapshotStore;
use crate::sync::protocol::{close_codes, close_socket};
use crate::sync::{SyncServer, SyncServerConfig};

/// Shared application state
pub struct AppState {
    pub config: ServerConfig,
    pub multiplexer: Arc<ConnectionMultiplexer>,
    pub gateway: Arc<AuthGateway>,
    pub admin: AdminPlane,
    pub sync: Arc<SyncServer>,
    pub dispatcher: Dispatcher,
    started_at: Instant,
}

impl AppState {
    pub fn new(
        config: ServerConfig,
        store: Arc<dyn RelationalStore>,
        verifier: Arc<dyn TokenVerifier>,
        snapshots: SnapshotStore,
    ) -> Self {
        let resolver = PermissionResolver::new(store.clone());
        let multiplexer = Arc::new(ConnectionMultiplexer::new());

        let reconciler = Reconciler::new(
            ProjectionEngine::new(store.clone(), config.batch_size),
            HistoryRecorder::new(store),
        );
        let sync = Arc::new(SyncServer::new(
            snapshots,
            reconciler,
            ProjectionQueue::new(),
            SyncServerConfig {
                flush_interval: config.projection_interval,
            },
        ));

        let admin_auth = AdminAuth::new(config.admin_token.clone());
        if !admin_auth.is_configured() {
            warn!("ADMIN_TOKEN not set - admin endpoints will deny every request");
        }

        Self {
            gateway: Arc::new(AuthGateway::new(verifier, resolver.clone())),
            admin: AdminPlane::new(admin_auth, multiplexer.clone(), resolver.clone()),
            dispatcher: Dispatcher::new(multiplexer.clone(), sync.clone(), resolver),
            multiplexer,
            sync,
            config,
            started_at: Instant::now(),
        }
    }
}

/// Build the full router
pub fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(Any);

    let rooms = Router::new()
        .route("/parties/:kind/:room", get(room_handler))
        .route("/party/:kind/:room", get(room_handler))
        .route_layer(middleware::from_fn_with_state(state.gateway.clone(), room_auth));

    let admin = Router::new()
        .route("/parties/:kind/:room/admin/:action", any(admin_handler))
        .route("/party/:kind/:room/admin/:action", any(admin_handler));

    Router::new()
        .route("/health", get(health_handler))
        .merge(rooms)
        .merge(admin)
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()).layer(cors))
        .with_state(state)
}

/// Room requests that passed the gateway. The identity comes only from
/// the headers the gateway injected.
async fn room_handler(
    State(state): State<Arc<AppState>>,
    ws: Option<WebSocketUpgrade>,
    headers: HeaderMap,
) -> Response {
    let context = AuthContext::from_headers(&headers);
    match (ws, context) {
        (Some(ws), Ok(ctx)) => {
            let dispatcher = state.dispatcher.clone();
            ws.on_upgrade(move |socket| dispatcher.serve(socket, ctx))
        }
        (Some(ws), Err(e)) => {
            warn!("Connection without usable identity: {}", e);
            let reason = e.to_string();
            ws.on_upgrade(move |socket| close_socket(socket, close_codes::INVALID_CONTEXT, reason))
        }
        (None, Ok(ctx)) => Json(ctx).into_response(),
        (None, Err(e)) => ServiceError::from(e).into_response(),
    }
}

/// Admin requests. The room is parsed from the raw path because `Path`
/// has already percent-decoded its segments once.
async fn admin_handler(
    State(state): State<Arc<AppState>>,
    Path((_kind, _room, action)): Path<(String, String, String)>,
    OriginalUri(uri): OriginalUri,
    method: Method,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let path = uri.path();
    match state.admin.handle(&method, &headers, path, &action, &body).await {
        Ok(result) => Json(result).into_response(),
        Err(e) => {
            info!("Admin {} on {} failed: {}", action, path, e);
            ServiceError::from(e).into_response()
        }
    }
}

async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let stats = state.sync.stats();
    Json(json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
        "uptimeSeconds": state.started_at.elapsed().as_secs(),
        "activeRooms": state.multiplexer.room_count(),
        "activeDocuments": stats.active_rooms,
        "dirtyDocuments": stats.dirty_rooms,
        "activeConnections": state.multiplexer.connection_count(),
        "pendingProjections": state.sync.queue().pending_count(),
    }))
}
