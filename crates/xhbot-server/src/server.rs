use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::ws::rejection::WebSocketUpgradeRejection;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use tower_http::trace::TraceLayer;
use xhbot_core::{MessageHandler, SessionStore, TokenValidator};

use crate::auth::{authenticate, rejection};
use crate::registry::{is_valid_namespace, ConnectionRegistry};
use crate::scheduler::{broadcast_queue, BroadcastQueue, BroadcastScheduler, EnqueueError, SchedulerHandle};
use crate::settings::ServerSettings;
use crate::supervisor::Supervisor;

/// Collaborators the server is built around.
pub struct ServerDeps {
    pub validator: Arc<dyn TokenValidator>,
    pub handler: Arc<dyn MessageHandler>,
    pub sessions: Arc<dyn SessionStore>,
}

/// Shared application state passed to Axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<ConnectionRegistry>,
    pub supervisor: Arc<Supervisor>,
    pub validator: Arc<dyn TokenValidator>,
    pub sessions: Arc<dyn SessionStore>,
    pub broadcasts: BroadcastQueue,
    pub default_namespace: Arc<str>,
}

/// Build the Axum router with all routes.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/ws/bot", get(ws_default))
        .route("/ws/bot/", get(ws_default))
        .route("/ws/bot/{namespace}", get(ws_namespace))
        .route("/broadcast", post(broadcast_handler))
        .route("/health", get(health_handler))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

/// Create and start the server. Returns a handle to the running tasks.
pub async fn start(settings: &ServerSettings, deps: ServerDeps) -> Result<ServerHandle, std::io::Error> {
    let registry = Arc::new(ConnectionRegistry::new(settings.max_send_queue));
    let supervisor = Arc::new(Supervisor::new(
        Arc::clone(&registry),
        deps.handler,
        settings.heartbeat_interval(),
        settings.client_timeout(),
    ));

    let (broadcasts, jobs) = broadcast_queue(settings.broadcast.max_pending);
    let scheduler = Arc::new(BroadcastScheduler::new(
        Arc::clone(&registry),
        Arc::clone(&deps.sessions),
        settings.send_timeout(),
        settings.session.notify_on_expiry,
    ));
    let scheduler = scheduler.spawn(jobs, settings.broadcast_interval(), settings.sweep_interval());

    let app_state = AppState {
        registry: Arc::clone(&registry),
        supervisor,
        validator: deps.validator,
        sessions: deps.sessions,
        broadcasts: broadcasts.clone(),
        default_namespace: Arc::from(settings.default_namespace.as_str()),
    };

    let router = build_router(app_state);
    let addr = format!("{}:{}", settings.host, settings.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    let local_addr = listener.local_addr()?;

    tracing::info!(
        host = %settings.host,
        port = local_addr.port(),
        default_namespace = %settings.default_namespace,
        "xhbot server started"
    );

    let server = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, router).await {
            tracing::error!(error = %e, "server stopped");
        }
    });

    Ok(ServerHandle {
        port: local_addr.port(),
        registry,
        broadcasts,
        server,
        scheduler,
    })
}

/// Handle returned by `start()`. Keeps background tasks alive.
pub struct ServerHandle {
    pub port: u16,
    pub registry: Arc<ConnectionRegistry>,
    pub broadcasts: BroadcastQueue,
    server: tokio::task::JoinHandle<()>,
    scheduler: SchedulerHandle,
}

impl ServerHandle {
    /// Stop accepting connections and halt the background ticks.
    pub fn shutdown(&self) {
        self.scheduler.abort();
        self.server.abort();
    }
}

/// GET /ws/bot
async fn ws_default(
    State(state): State<AppState>,
    headers: HeaderMap,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    let namespace = state.default_namespace.to_string();
    upgrade(state, &headers, ws, namespace)
}

/// GET /ws/bot/{namespace}
async fn ws_namespace(
    State(state): State<AppState>,
    Path(namespace): Path<String>,
    headers: HeaderMap,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    if !is_valid_namespace(&namespace) {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({
                "error": "invalid_namespace",
                "message": "namespace must be 1-64 characters of [A-Za-z0-9_-]",
            })),
        )
            .into_response();
    }
    upgrade(state, &headers, ws, namespace)
}

/// Authenticate, then hand the socket to the supervisor.
fn upgrade(
    state: AppState,
    headers: &HeaderMap,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
    namespace: String,
) -> Response {
    if let Err(e) = authenticate(headers, state.validator.as_ref()) {
        tracing::warn!(
            namespace = %namespace,
            error_kind = e.error_kind(),
            reason = %e,
            "handshake rejected"
        );
        return rejection(&e);
    }

    let ws = match ws {
        Ok(ws) => ws,
        Err(rej) => return rej.into_response(),
    };

    let supervisor = state.supervisor;
    ws.on_upgrade(move |socket| async move { supervisor.serve(socket, namespace).await })
}

#[derive(Debug, Deserialize)]
struct BroadcastRequest {
    namespace: String,
    payload: serde_json::Value,
}

/// POST /broadcast
async fn broadcast_handler(State(state): State<AppState>, headers: HeaderMap, body: Bytes) -> Response {
    if let Err(e) = authenticate(&headers, state.validator.as_ref()) {
        tracing::warn!(error_kind = e.error_kind(), reason = %e, "broadcast request rejected");
        return rejection(&e);
    }

    let req: BroadcastRequest = match serde_json::from_slice(&body) {
        Ok(req) => req,
        Err(e) => return bad_request(format!("invalid broadcast body: {e}")),
    };
    if !is_valid_namespace(&req.namespace) {
        return bad_request("namespace must be 1-64 characters of [A-Za-z0-9_-]".into());
    }

    match state.broadcasts.enqueue(req.namespace.clone(), req.payload.to_string()) {
        Ok(()) => (
            StatusCode::ACCEPTED,
            Json(json!({ "queued": true, "namespace": req.namespace })),
        )
            .into_response(),
        Err(EnqueueError::Full) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "error": "queue_full", "message": "broadcast queue is full" })),
        )
            .into_response(),
        Err(EnqueueError::Closed) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "error": "queue_closed", "message": "broadcast scheduler is not running" })),
        )
            .into_response(),
    }
}

fn bad_request(message: String) -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(json!({ "error": "bad_request", "message": message })),
    )
        .into_response()
}

/// GET /health
async fn health_handler(State(state): State<AppState>) -> Response {
    let connections = state.registry.count();
    match state.sessions.count().await {
        Ok(sessions) => Json(json!({
            "status": "healthy",
            "connections": connections,
            "sessions": sessions,
        }))
        .into_response(),
        Err(e) => {
            tracing::warn!(error = %e, "session store unavailable");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({
                    "status": "degraded",
                    "connections": connections,
                    "error": e.to_string(),
                })),
            )
                .into_response()
        }
    }
}
