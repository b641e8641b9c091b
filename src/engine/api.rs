//! Updater API Module
//! HTTP entry points for the two update behaviors, with OpenAPI documentation

use axum::{
    extract::State,
    http::{header::AUTHORIZATION, HeaderMap, StatusCode},
    response::Json,
    routing::{get, post},
    Router,
};
use serde::Serialize;
use std::sync::{Arc, Mutex};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use utoipa::{OpenApi, ToSchema};

use crate::engine::config::UpdaterConfig;
use crate::engine::remote::{Credential, RemoteCall};
use crate::engine::updater::{
    ArtifactTransfer, CancelHandle, Convergence, RunReport, RunResult, UpdateError, UpdateOrchestrator,
};

#[derive(Clone)]
pub struct ApiState {
    pub config: Arc<UpdaterConfig>,
    pub remote: Arc<dyn RemoteCall>,
    pub transfer: Arc<dyn ArtifactTransfer>,
    /// Held for the duration of a run; the staging directory is not safe for
    /// concurrent runs
    pub run_lock: Arc<tokio::sync::Mutex<()>>,
    pub last_run: Arc<Mutex<Option<RunReport>>>,
}

impl ApiState {
    pub fn new(config: UpdaterConfig, remote: Arc<dyn RemoteCall>, transfer: Arc<dyn ArtifactTransfer>) -> Self {
        Self {
            config: Arc::new(config),
            remote,
            transfer,
            run_lock: Arc::new(tokio::sync::Mutex::new(())),
            last_run: Arc::new(Mutex::new(None)),
        }
    }
}

/// Documented shape of every run result
#[derive(Serialize, ToSchema)]
pub struct RunResultBody {
    /// `OK` or `ERROR`
    pub result: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(OpenApi)]
#[openapi(
    paths(check_for_updates, start_download, last_run),
    components(schemas(RunResultBody)),
    tags(
        (name = "ruleset", description = "Ruleset update and activation"),
    )
)]
pub struct ApiDoc;

pub fn create_router(state: ApiState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/ruleset/check-for-updates", post(check_for_updates))
        .route("/api/ruleset/start-download", post(start_download))
        .route("/api/ruleset/last-run", get(last_run))
        .route("/api/health", get(health_check))
        .route("/api/openapi.json", get(openapi_spec))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

async fn openapi_spec() -> Json<utoipa::openapi::OpenApi> {
    Json(ApiDoc::openapi())
}

#[utoipa::path(
    post,
    path = "/api/ruleset/check-for-updates",
    responses(
        (status = 200, description = "Run finished; see `result`", body = RunResultBody),
        (status = 401, description = "No credential supplied", body = RunResultBody),
        (status = 409, description = "Another run is in progress", body = RunResultBody)
    ),
    tag = "ruleset"
)]
async fn check_for_updates(State(state): State<ApiState>, headers: HeaderMap) -> (StatusCode, Json<RunResult>) {
    run_update(state, &headers, Convergence::CheckForUpdates).await
}

#[utoipa::path(
    post,
    path = "/api/ruleset/start-download",
    responses(
        (status = 200, description = "Run finished; see `result`", body = RunResultBody),
        (status = 401, description = "No credential supplied", body = RunResultBody),
        (status = 409, description = "Another run is in progress", body = RunResultBody)
    ),
    tag = "ruleset"
)]
async fn start_download(State(state): State<ApiState>, headers: HeaderMap) -> (StatusCode, Json<RunResult>) {
    run_update(state, &headers, Convergence::StartDownload).await
}

#[utoipa::path(
    get,
    path = "/api/ruleset/last-run",
    responses(
        (status = 200, description = "Report of the most recent run"),
        (status = 404, description = "No run recorded yet")
    ),
    tag = "ruleset"
)]
async fn last_run(State(state): State<ApiState>) -> Result<Json<RunReport>, StatusCode> {
    let in_memory = state
        .last_run
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .clone();
    if let Some(report) = in_memory {
        return Ok(Json(report));
    }

    let Some(path) = &state.config.state_path else {
        return Err(StatusCode::NOT_FOUND);
    };
    match RunReport::load(path) {
        Ok(Some(report)) => Ok(Json(report)),
        Ok(None) => Err(StatusCode::NOT_FOUND),
        Err(e) => {
            tracing::warn!(error = %e, "could not read run report");
            Err(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

async fn run_update(state: ApiState, headers: &HeaderMap, convergence: Convergence) -> (StatusCode, Json<RunResult>) {
    let authorization = headers
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .map(str::to_owned);

    if Credential::parse(authorization.as_deref()).is_none() {
        return (
            StatusCode::UNAUTHORIZED,
            Json(RunResult::from(UpdateError::AuthorizationMissing)),
        );
    }

    let Ok(guard) = state.run_lock.clone().try_lock_owned() else {
        return (
            StatusCode::CONFLICT,
            Json(RunResult::error("update already in progress")),
        );
    };

    let worker = state.clone();
    let joined = tokio::task::spawn_blocking(move || {
        // The lock lives as long as the run, even if the client goes away
        let _guard = guard;
        let orchestrator = UpdateOrchestrator::new(&worker.config, worker.remote.as_ref(), worker.transfer.as_ref());
        orchestrator.execute(authorization.as_deref(), convergence, &CancelHandle::new())
    })
    .await;

    match joined {
        Ok(report) => {
            let result = report.outcome();
            *state.last_run.lock().unwrap_or_else(|e| e.into_inner()) = Some(report);
            (StatusCode::OK, Json(result))
        }
        Err(e) => {
            tracing::error!(error = %e, "update worker panicked");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(RunResult::error(format!("update worker failed: {}", e))),
            )
        }
    }
}
