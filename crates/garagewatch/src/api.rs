use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;

use axum::extract::Path;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::response::Response;
use axum::routing::get;
use axum::routing::post;
use axum::Json;
use axum::Router;
use serde::Serialize;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;

use crate::config::OperatingMode;
use crate::entity::Entity;
use crate::store::Snapshot;
use crate::sync::ControllerHandle;

/// Response for the /v1/ping endpoint
#[derive(Serialize)]
struct PingResponse {
    status: String,
}

/// Response for the /v1/info endpoint
#[derive(Serialize)]
struct InfoResponse {
    version: String,
    hostname: String,
    mode: OperatingMode,
}

/// Response for the /v1/state endpoint
#[derive(Serialize)]
struct StateResponse {
    mode: OperatingMode,
    #[serde(flatten)]
    snapshot: Snapshot,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (
        status,
        Json(ErrorResponse {
            error: message.into(),
        }),
    )
        .into_response()
}

/// Shared application state
#[derive(Clone)]
struct AppState {
    version: &'static str,
    controller: ControllerHandle,
}

/// Handler for GET /v1/ping
#[tracing::instrument]
async fn ping() -> impl IntoResponse {
    tracing::debug!("Handling /v1/ping request");
    (
        StatusCode::OK,
        Json(PingResponse {
            status: "ok".to_string(),
        }),
    )
}

/// Handler for GET /v1/info
#[tracing::instrument(skip(state))]
async fn info(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    tracing::debug!("Handling /v1/info request");

    let hostname = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown".to_string());

    (
        StatusCode::OK,
        Json(InfoResponse {
            version: state.version.to_string(),
            hostname,
            mode: state.controller.mode(),
        }),
    )
}

/// Handler for GET /v1/state
#[tracing::instrument(skip(state))]
async fn current_state(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(StateResponse {
            mode: state.controller.mode(),
            snapshot: state.controller.snapshot(),
        }),
    )
}

/// Handler for POST /v1/entities/:entity/toggle
///
/// Accepts the short name (`left_door`) or either remote id. The command
/// runs in the background; poll /v1/state for the outcome.
#[tracing::instrument(skip(state))]
async fn toggle(State(state): State<Arc<AppState>>, Path(name): Path<String>) -> Response {
    let Some(entity) = Entity::from_str(&name).ok().or_else(|| Entity::from_id(&name)) else {
        return error_response(StatusCode::NOT_FOUND, format!("unknown entity: {}", name));
    };

    // The controller would drop it silently; tell the caller instead
    if state.controller.snapshot().awaiting_reply.contains(&entity) {
        return error_response(
            StatusCode::CONFLICT,
            format!("a command for {} is already in flight", entity.label()),
        );
    }

    match state.controller.toggle(entity) {
        Ok(()) => StatusCode::ACCEPTED.into_response(),
        Err(e) => error_response(StatusCode::SERVICE_UNAVAILABLE, e.to_string()),
    }
}

/// Handler for POST /v1/refresh
#[tracing::instrument(skip(state))]
async fn refresh(State(state): State<Arc<AppState>>) -> Response {
    match state.controller.refresh() {
        Ok(()) => StatusCode::ACCEPTED.into_response(),
        Err(e) => error_response(StatusCode::SERVICE_UNAVAILABLE, e.to_string()),
    }
}

/// Create the API router with all endpoints
fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/v1/ping", get(ping))
        .route("/v1/info", get(info))
        .route("/v1/state", get(current_state))
        .route("/v1/entities/:entity/toggle", post(toggle))
        .route("/v1/refresh", post(refresh))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Start the HTTP API server
///
/// Binds to `listen:port` and serves until `shutdown_rx` fires.
pub async fn serve(
    listen: String,
    port: u16,
    controller: ControllerHandle,
    shutdown_rx: tokio::sync::oneshot::Receiver<()>,
) -> anyhow::Result<()> {
    let version = env!("CARGO_PKG_VERSION");

    let state = Arc::new(AppState {
        version,
        controller,
    });
    let app = create_router(state);

    let addr: SocketAddr = format!("{}:{}", listen, port).parse()?;
    tracing::info!("Starting HTTP API server on {}", addr);

    let listener = TcpListener::bind(addr).await?;

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            shutdown_rx.await.ok();
            tracing::info!("HTTP API server shutting down gracefully");
        })
        .await?;

    Ok(())
}
