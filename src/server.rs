use std::sync::Arc;

use anyhow::Result;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, put},
    serve::Listener,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::{
    engine::{self, EngineSettings},
    error::RegistryError,
    registry::ScanRegistry,
    tls::TlsListener,
    types::{ScanOptions, ScanResult},
};

#[derive(Clone)]
pub struct AppState {
    registry: Arc<ScanRegistry>,
    engine: EngineSettings,
    shutdown: CancellationToken,
}

impl AppState {
    pub fn new(
        registry: Arc<ScanRegistry>,
        engine: EngineSettings,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            registry,
            engine,
            shutdown,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct StartScanRequest {
    pub target: String,
    #[serde(default)]
    pub options: ScanOptions,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StartScanResponse {
    pub id: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ProgressResponse {
    pub id: String,
    pub progress: u8,
}

#[derive(Debug, Deserialize)]
pub struct SetOptionRequest {
    pub name: String,
    pub value: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
}

/// Registry failures as HTTP responses.
pub struct ApiError(RegistryError);

impl From<RegistryError> for ApiError {
    fn from(e: RegistryError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match self.0 {
            RegistryError::NotFound(_) => StatusCode::NOT_FOUND,
        };
        (status, Json(ErrorBody { error: self.0.to_string() })).into_response()
    }
}

pub fn router(state: AppState) -> Router {
    let api = Router::new()
        .route("/scans", get(list_scans).post(start_scan))
        .route("/scans/{id}", get(get_scan).delete(delete_scan))
        .route("/scans/{id}/progress", get(get_progress))
        .route("/scans/{id}/results", get(get_results))
        .route("/scans/{id}/options", put(set_option))
        .with_state(state);

    Router::new().nest("/api", api).layer(TraceLayer::new_for_http())
}

/// Serve the API over TLS until `shutdown` is cancelled.
pub async fn serve(listener: TlsListener, state: AppState) -> Result<()> {
    let shutdown = state.shutdown.clone();
    let app = router(state);
    info!(addr = %listener.local_addr()?, "serving scan API");
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;
    Ok(())
}

async fn list_scans(State(app): State<AppState>) -> impl IntoResponse {
    let ids: Vec<String> = app.registry.ids_iterator().collect();
    Json(ids)
}

async fn start_scan(
    State(app): State<AppState>,
    Json(req): Json<StartScanRequest>,
) -> impl IntoResponse {
    let id = app.registry.create(req.target, req.options);
    info!(scan_id = %id, "scan requested");

    tokio::spawn(engine::run_scan(
        app.registry.clone(),
        id.clone(),
        app.engine,
        app.shutdown.child_token(),
    ));

    (StatusCode::CREATED, Json(StartScanResponse { id }))
}

async fn get_scan(
    State(app): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(app.registry.summary(&id)?))
}

async fn get_progress(
    State(app): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let progress = app.registry.get_progress(&id)?;
    Ok(Json(ProgressResponse { id, progress }))
}

async fn get_results(
    State(app): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let results: Vec<ScanResult> = app.registry.results_iterator(&id)?.collect();
    Ok(Json(results))
}

async fn set_option(
    State(app): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<SetOptionRequest>,
) -> Result<impl IntoResponse, ApiError> {
    app.registry.set_option(&id, req.name, req.value)?;
    Ok(Json(app.registry.get_options(&id)?))
}

async fn delete_scan(
    State(app): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    if app.registry.delete(&id)? {
        info!(scan_id = %id, "scan deleted");
        Ok(StatusCode::NO_CONTENT.into_response())
    } else {
        let body = ErrorBody {
            error: "scan still running".into(),
        };
        Ok((StatusCode::CONFLICT, Json(body)).into_response())
    }
}
