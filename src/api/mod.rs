use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Json,
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::warn;

use crate::build::{ArchiveType, BuildMode};
use crate::compiler::Compiler;
use crate::error::CompilerError;
use crate::session::SessionDirectoryManager;

#[derive(Clone)]
pub struct AppState {
    pub compiler: Arc<Compiler>,
    pub sessions: Arc<SessionDirectoryManager>,
}

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/sync", post(sync_source))
        .route("/rebuild/:mode", get(rebuild_status))
        .route("/sessions", post(create_session))
        .route("/sessions/:id", get(session_info))
        .route("/gc", post(run_gc))
}

type ApiResult = Result<Json<serde_json::Value>, (StatusCode, Json<serde_json::Value>)>;

fn error_response(status: StatusCode, message: impl ToString) -> (StatusCode, Json<serde_json::Value>) {
    (status, Json(serde_json::json!({ "error": message.to_string() })))
}

fn compiler_status(err: &CompilerError) -> StatusCode {
    match err {
        CompilerError::SourceNotFound { .. } | CompilerError::MarkerMissing { .. } => StatusCode::NOT_FOUND,
        CompilerError::Config(_) => StatusCode::BAD_REQUEST,
        CompilerError::Sync(_) | CompilerError::Build(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

#[derive(Debug, Default, Deserialize)]
struct SyncRequest {
    src: Option<PathBuf>,
    #[serde(default)]
    dry_run: bool,
    #[serde(default)]
    sync_examples: bool,
}

async fn sync_source(State(state): State<AppState>, Json(req): Json<SyncRequest>) -> ApiResult {
    let compiler = state.compiler.clone();
    let outcome = tokio::task::spawn_blocking(move || {
        if req.dry_run {
            compiler.preview(req.src.as_deref(), req.sync_examples)
        } else {
            compiler.update_src(req.src.as_deref(), req.sync_examples)
        }
    })
    .await
    .map_err(|e| error_response(StatusCode::INTERNAL_SERVER_ERROR, e))?;

    match outcome {
        Ok(result) => serde_json::to_value(result)
            .map(Json)
            .map_err(|e| error_response(StatusCode::INTERNAL_SERVER_ERROR, e)),
        Err(e) => {
            warn!("Sync request failed: {}", e);
            Err(error_response(compiler_status(&e), e))
        }
    }
}

#[derive(Serialize)]
struct ArchiveVerdict {
    archive: ArchiveType,
    rebuild_needed: bool,
    library_timestamp: Option<f64>,
}

async fn rebuild_status(State(state): State<AppState>, Path(mode): Path<String>) -> ApiResult {
    let mode: BuildMode = mode
        .parse()
        .map_err(|e: String| error_response(StatusCode::BAD_REQUEST, e))?;
    let context = state.compiler.context();
    let timestamps = context.timestamp_manager();
    let verdicts: Vec<ArchiveVerdict> = context
        .config()
        .archive_mode
        .archive_types()
        .iter()
        .map(|&archive| ArchiveVerdict {
            archive,
            rebuild_needed: timestamps.should_rebuild_library(mode, archive),
            library_timestamp: timestamps.get_library_timestamp(mode, archive),
        })
        .collect();

    Ok(Json(serde_json::json!({
        "mode": mode,
        "source_timestamp": timestamps.get_source_timestamp(),
        "archives": verdicts,
    })))
}

#[derive(Debug, Default, Deserialize)]
struct SessionRequest {
    session_id: Option<u64>,
}

async fn create_session(State(state): State<AppState>, Json(req): Json<SessionRequest>) -> ApiResult {
    let sessions = state.sessions.clone();
    let (id, reused) = tokio::task::spawn_blocking(move || sessions.get_or_create_session(req.session_id))
        .await
        .map_err(|e| error_response(StatusCode::INTERNAL_SERVER_ERROR, e))?
        .map_err(|e| error_response(StatusCode::INTERNAL_SERVER_ERROR, e))?;

    Ok(Json(serde_json::json!({
        "session_id": id,
        "reused": reused,
        "path": state.sessions.get_session_dir(id),
    })))
}

async fn session_info(State(state): State<AppState>, Path(id): Path<u64>) -> ApiResult {
    let sessions = state.sessions.clone();
    let (exists, size_bytes) = tokio::task::spawn_blocking(move || (sessions.session_exists(id), sessions.get_session_size(id)))
        .await
        .map_err(|e| error_response(StatusCode::INTERNAL_SERVER_ERROR, e))?;

    Ok(Json(serde_json::json!({
        "session_id": id,
        "exists": exists,
        "size_bytes": size_bytes,
        "path": state.sessions.get_session_dir(id),
    })))
}

async fn run_gc(State(state): State<AppState>) -> ApiResult {
    let sessions = state.sessions.clone();
    let report = tokio::task::spawn_blocking(move || sessions.garbage_collect())
        .await
        .map_err(|e| error_response(StatusCode::INTERNAL_SERVER_ERROR, e))?;
    serde_json::to_value(report)
        .map(Json)
        .map_err(|e| error_response(StatusCode::INTERNAL_SERVER_ERROR, e))
}
