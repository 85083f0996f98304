// Event Registry - Web Server
// JSON API over the registration core, with the mirror synchronizer running alongside

use anyhow::{Context, Result};
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use event_registry::service::is_not_found;
use event_registry::{
    build_mirror, init_logging, sync, AdminFilter, AreaRule, Config, MirrorSynchronizer,
    RecoveryOutcome, RegisterRequest, RegistrationService, RegistryError, RegistryStore,
};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const SYNC_SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

/// Shared application state
#[derive(Clone)]
struct AppState {
    service: Arc<RegistrationService>,
}

/// API Response wrapper
#[derive(Serialize)]
struct ApiResponse<T> {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl<T> ApiResponse<T> {
    fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    fn err(message: String) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(message),
        }
    }
}

#[derive(Deserialize)]
struct ApproveRequest {
    full_name: String,
}

fn internal_error(context: &str, err: RegistryError) -> Response {
    error!(error = %err, "{}", context);
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(ApiResponse::<()>::err("Internal error".to_string())),
    )
        .into_response()
}

// ============================================================================
// API Handlers
// ============================================================================

/// GET /api/health - Health check
async fn health_check() -> impl IntoResponse {
    Json(ApiResponse::ok("OK"))
}

/// POST /api/register - Register a group of names
async fn register(
    State(state): State<AppState>,
    Json(request): Json<RegisterRequest>,
) -> impl IntoResponse {
    Json(state.service.register(&request))
}

/// POST /api/approve - Approve one registrant
async fn approve(State(state): State<AppState>, Json(body): Json<ApproveRequest>) -> Response {
    match state.service.approve(&body.full_name) {
        Ok(_) => StatusCode::NO_CONTENT.into_response(),
        Err(e) if is_not_found(&e) => (
            StatusCode::NOT_FOUND,
            Json(ApiResponse::<()>::err(e.to_string())),
        )
            .into_response(),
        Err(e) => internal_error("approval failed", e),
    }
}

/// GET /api/status/:group_id - Members and approval state of one group
async fn group_status(State(state): State<AppState>, Path(group_id): Path<String>) -> Response {
    match state.service.group_status(&group_id) {
        Ok(status) => Json(status).into_response(),
        Err(e) => internal_error("group status failed", e),
    }
}

/// GET /api/admin?church=&area= - Registrant listing
async fn admin_list(State(state): State<AppState>, Query(filter): Query<AdminFilter>) -> Response {
    match state.service.admin_list_filtered(&filter) {
        Ok(rows) => Json(ApiResponse::ok(rows)).into_response(),
        Err(e) => internal_error("admin listing failed", e),
    }
}

/// GET /api/admin/filters - Distinct churches and areas
async fn admin_filters(State(state): State<AppState>) -> Response {
    match state.service.admin_filters() {
        Ok(filters) => Json(ApiResponse::ok(filters)).into_response(),
        Err(e) => internal_error("admin filters failed", e),
    }
}

/// POST /api/erase - Wipe the local store
async fn erase(State(state): State<AppState>) -> Response {
    match state.service.erase() {
        Ok(removed) => Json(ApiResponse::ok(removed)).into_response(),
        Err(e) => internal_error("erase failed", e),
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "could not listen for Ctrl-C");
        std::future::pending::<()>().await;
    }
    info!("shutdown requested");
}

// ============================================================================
// Main Server
// ============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("registry.toml"));
    let config = Config::load(&config_path)?;
    init_logging(&config.log);

    let store = Arc::new(
        RegistryStore::open(&config.database_path, config.busy_timeout())
            .with_context(|| format!("Failed to open {}", config.database_path.display()))?,
    );

    // Recovery finishes before anything else touches the store
    let mirror = build_mirror(&config.mirror)?;
    let mut synchronizer = MirrorSynchronizer::from_config(Arc::clone(&store), mirror, &config.mirror);
    match synchronizer.recover().await? {
        RecoveryOutcome::Restored { imported, .. } => info!(imported, "cold-start recovery complete"),
        RecoveryOutcome::Unavailable => warn!("starting with an empty registry"),
        RecoveryOutcome::NotNeeded => {}
    }

    let (sync_handle, events) = sync::channel();
    let sync_task = synchronizer.spawn(events);

    let state = AppState {
        service: Arc::new(RegistrationService::new(
            store,
            sync_handle,
            AreaRule::from_config(&config.validation),
        )),
    };

    // Build API routes
    let api_routes = Router::new()
        .route("/health", get(health_check))
        .route("/register", post(register))
        .route("/approve", post(approve))
        .route("/status/:group_id", get(group_status))
        .route("/admin", get(admin_list))
        .route("/admin/filters", get(admin_filters))
        .route("/erase", post(erase))
        .with_state(state);

    let app = Router::new().nest("/api", api_routes).layer(
        ServiceBuilder::new()
            .layer(TraceLayer::new_for_http())
            .layer(TimeoutLayer::new(REQUEST_TIMEOUT))
            .layer(CorsLayer::permissive()),
    );

    let listener = tokio::net::TcpListener::bind(&config.server.bind)
        .await
        .with_context(|| format!("Failed to bind to {}", config.server.bind))?;
    info!(addr = %config.server.bind, mirror = ?config.mirror.url, "registry server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    // The router owned the last SyncHandle; the loop flushes and exits
    match tokio::time::timeout(SYNC_SHUTDOWN_GRACE, sync_task).await {
        Ok(Ok(())) => info!("mirror synchronizer stopped"),
        Ok(Err(e)) => warn!(error = %e, "mirror synchronizer task failed"),
        Err(_) => warn!("mirror synchronizer did not stop in time"),
    }

    Ok(())
}
