//! HTTP facade over the backup engine. Thin JSON routes only; the
//! surrounding application supplies authentication and the actor
//! descriptor for manual operations.

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;

use crate::backup::engine::{
    ArtifactEntry, BackupEngine, BackupOutcome, ConfigUpdate, EngineStatus,
};
use crate::backup::setup::SetupRequest;
use crate::backup::{Actor, BackupError};

pub fn router(engine: Arc<BackupEngine>) -> Router {
    Router::new()
        .route("/backup/status", get(status_handler))
        .route("/backup/artifacts", get(artifacts_handler))
        .route("/backup", post(create_backup_handler))
        .route("/backup/restore", post(restore_handler))
        .route("/backup/settings", put(update_settings_handler))
        .route("/backup/setup", post(setup_handler))
        .with_state(engine)
}

async fn status_handler(
    State(engine): State<Arc<BackupEngine>>,
) -> Result<Json<EngineStatus>, ApiError> {
    Ok(Json(engine.status().await?))
}

async fn artifacts_handler(
    State(engine): State<Arc<BackupEngine>>,
) -> Result<Json<Vec<ArtifactEntry>>, ApiError> {
    Ok(Json(engine.list_artifacts().await?))
}

#[derive(Deserialize)]
struct CreateBackupRequest {
    #[serde(default)]
    actor: Option<Actor>,
}

async fn create_backup_handler(
    State(engine): State<Arc<BackupEngine>>,
    Json(request): Json<CreateBackupRequest>,
) -> Result<Json<BackupOutcome>, ApiError> {
    let outcome = engine
        .create_backup(crate::backup::RunMode::Manual, request.actor)
        .await?;
    Ok(Json(outcome))
}

#[derive(Deserialize)]
struct RestoreRequest {
    file_name: String,
    #[serde(default)]
    include_globals: bool,
    #[serde(default)]
    actor: Option<Actor>,
}

async fn restore_handler(
    State(engine): State<Arc<BackupEngine>>,
    Json(request): Json<RestoreRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    engine
        .restore_backup(request.file_name.clone(), request.include_globals, request.actor)
        .await?;
    Ok(Json(json!({ "restored": request.file_name })))
}

#[derive(Deserialize)]
struct UpdateSettingsRequest {
    #[serde(flatten)]
    update: ConfigUpdate,
    #[serde(default)]
    actor: Option<Actor>,
}

async fn update_settings_handler(
    State(engine): State<Arc<BackupEngine>>,
    Json(request): Json<UpdateSettingsRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    engine.update_config(request.update, request.actor).await?;
    Ok(Json(json!({ "updated": true })))
}

#[derive(Deserialize)]
struct SetupCredentialsRequest {
    #[serde(flatten)]
    request: SetupRequest,
    #[serde(default)]
    actor: Option<Actor>,
}

async fn setup_handler(
    State(engine): State<Arc<BackupEngine>>,
    Json(request): Json<SetupCredentialsRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    engine
        .setup_credentials(request.request, request.actor)
        .await?;
    Ok(Json(json!({ "provisioned": true })))
}

/// Maps engine errors onto HTTP statuses
struct ApiError(BackupError);

impl From<BackupError> for ApiError {
    fn from(error: BackupError) -> Self {
        Self(error)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            BackupError::OperationInProgress { .. } => StatusCode::CONFLICT,
            BackupError::InvalidFileName { .. }
            | BackupError::MissingArtifact { .. }
            | BackupError::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
            BackupError::NotConfigured | BackupError::IncompleteSettings(_) => {
                StatusCode::BAD_REQUEST
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(json!({ "error": self.0.to_string() }))).into_response()
    }
}
