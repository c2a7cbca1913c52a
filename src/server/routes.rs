//! Route handlers
//!
//! Implements:
//! - Health endpoint (GET /health, no auth)
//! - Chunked upload API (POST /api/data/chunk, /api/data/complete)
//! - Finalize routes (POST /api/gr/process, /api/gr/patch, /api/file/store)
//! - Queries (GET /api/gr/remote-info, /api/data/status/:session_id)
//!
//! Finalize routes answer 202 immediately and schedule a background task
//! that acquires the per-repo lock, runs the Git or file-store pipeline,
//! and writes the terminal outcome back to the session store. The response
//! path never holds the repo lock.

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Extension, Path, Query, State};
use axum::http::StatusCode;
use axum::middleware;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use tracing::{info, warn};

use super::auth::require_api_key;
use super::envelope::{decrypt_envelope, BinaryPayload};
use crate::config::Config;
use crate::error::RelayError;
use crate::repo::{is_valid_branch, GitBackend, RepoKey, RepoLockMap};
use crate::sessions::{SessionStatus, SessionStore};
use crate::storage::{is_hex_sha256, FileStore};
use crate::transport::replay::ReplayGuard;
use crate::transport::EnvelopeOpener;

/// Shared state for all handlers and middleware.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub sessions: Arc<SessionStore>,
    pub replay: Arc<ReplayGuard>,
    pub opener: Arc<EnvelopeOpener>,
    pub git: Arc<dyn GitBackend>,
    pub repo_locks: Arc<RepoLockMap>,
    pub files: Arc<FileStore>,
}

impl AppState {
    /// Wire up the state from a parsed config and a Git collaborator.
    pub fn new(config: Config, git: Arc<dyn GitBackend>) -> Self {
        let opener = EnvelopeOpener::new(
            config.crypto_mode,
            config.symmetric_key.clone(),
            config.transport_key.clone(),
        );
        let sessions = SessionStore::new(config.sessions_dir.clone(), config.session_ttl);
        let replay = ReplayGuard::new(config.replay_ttl, config.clock_skew);
        let files = FileStore::new(config.storage_dir.clone(), config.max_file_size);
        Self {
            config: Arc::new(config),
            sessions: Arc::new(sessions),
            replay: Arc::new(replay),
            opener: Arc::new(opener),
            git,
            repo_locks: Arc::new(RepoLockMap::new()),
            files: Arc::new(files),
        }
    }
}

/// Create the router: open health endpoint plus the authenticated,
/// envelope-decrypting `/api` surface.
pub fn build_router(state: AppState) -> Router {
    let api = Router::new()
        .route("/data/chunk", post(post_chunk))
        .route("/data/complete", post(post_complete))
        .route("/data/status/:session_id", get(get_status))
        .route("/gr/process", post(post_process))
        .route("/gr/patch", post(post_patch))
        .route("/gr/remote-info", get(get_remote_info))
        .route("/file/store", post(post_file_store))
        // Order matters: last added = first executed. Auth runs before any
        // decryption work.
        .layer(middleware::from_fn_with_state(state.clone(), decrypt_envelope))
        .layer(middleware::from_fn_with_state(state.clone(), require_api_key));

    Router::new()
        .route("/health", get(get_health))
        .nest("/api", api)
        .with_state(state)
}

// ============================================================================
// Validation helpers
// ============================================================================

/// Session ids are opaque client tokens, but they become path components:
/// restrict to a filesystem-safe alphabet.
fn validate_session_id(session_id: &str) -> Result<(), RelayError> {
    let valid = !session_id.is_empty()
        && session_id.len() <= 128
        && session_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if valid {
        Ok(())
    } else {
        Err(RelayError::InvalidInput(
            "sessionId must be 1-128 characters of [A-Za-z0-9_-]".into(),
        ))
    }
}

fn validate_branch(branch: &str, field: &str) -> Result<(), RelayError> {
    if is_valid_branch(branch) {
        Ok(())
    } else {
        Err(RelayError::InvalidInput(format!(
            "{field} is not a valid branch name"
        )))
    }
}

fn parse_body<'a, T: Deserialize<'a>>(body: &'a [u8]) -> Result<T, RelayError> {
    serde_json::from_slice(body)
        .map_err(|e| RelayError::InvalidInput(format!("invalid request body: {e}")))
}

// ============================================================================
// Health
// ============================================================================

/// GET /health - liveness probe, no auth.
async fn get_health() -> Response {
    (
        StatusCode::OK,
        Json(json!({
            "status": "ok",
            "timestamp": utc_now_iso8601(),
        })),
    )
        .into_response()
}

/// Current UTC timestamp in ISO 8601 format.
fn utc_now_iso8601() -> String {
    chrono::Utc::now().format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string()
}

// ============================================================================
// Chunk upload
// ============================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChunkRequest {
    session_id: String,
    chunk_index: u64,
    total_chunks: u64,
}

/// POST /api/data/chunk - persist one chunk of a session.
async fn post_chunk(
    State(state): State<AppState>,
    binary: Option<Extension<BinaryPayload>>,
    body: Bytes,
) -> Result<Response, RelayError> {
    let req: ChunkRequest = parse_body(&body)?;
    validate_session_id(&req.session_id)?;

    if req.total_chunks == 0 || req.total_chunks > u64::from(u32::MAX) {
        return Err(RelayError::InvalidInput(
            "totalChunks must be a positive integer".into(),
        ));
    }
    if req.chunk_index >= req.total_chunks {
        return Err(RelayError::InvalidInput(format!(
            "chunkIndex {} out of range for {} chunks",
            req.chunk_index, req.total_chunks
        )));
    }
    let chunk = binary
        .map(|Extension(BinaryPayload(bytes))| bytes)
        .filter(|bytes| !bytes.is_empty())
        .ok_or_else(|| RelayError::InvalidInput("chunk payload must not be empty".into()))?;

    let received = state.sessions.store_chunk(
        &req.session_id,
        req.chunk_index as u32,
        req.total_chunks as u32,
        &chunk,
    )?;

    Ok((
        StatusCode::OK,
        Json(json!({"success": true, "received": received})),
    )
        .into_response())
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CompleteRequest {
    session_id: String,
}

/// POST /api/data/complete - client declares the upload finished.
async fn post_complete(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Response, RelayError> {
    let req: CompleteRequest = parse_body(&body)?;
    validate_session_id(&req.session_id)?;
    state.sessions.mark_complete(&req.session_id)?;
    Ok((
        StatusCode::ACCEPTED,
        Json(json!({"success": true, "status": "complete"})),
    )
        .into_response())
}

/// GET /api/data/status/:session_id - poll a session's state.
async fn get_status(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<Response, RelayError> {
    let snapshot = state
        .sessions
        .get(&session_id)
        .ok_or_else(|| RelayError::SessionNotFound(session_id.clone()))?;

    let mut details = snapshot.details;
    details.insert(
        "chunksReceived".into(),
        Value::from(snapshot.chunks_received),
    );
    details.insert("totalChunks".into(), Value::from(snapshot.total_chunks));

    Ok(Json(json!({
        "sessionId": snapshot.session_id,
        "status": snapshot.status,
        "message": snapshot.message,
        "details": details,
    }))
    .into_response())
}

// ============================================================================
// Git finalize
// ============================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GitFinalizeRequest {
    session_id: String,
    repo: String,
    branch: String,
    base_branch: String,
}

/// What the reassembled payload contains.
#[derive(Debug, Clone, Copy)]
enum GitPayload {
    Bundle,
    Mbox,
}

/// POST /api/gr/process - finalize a session as a Git bundle push.
async fn post_process(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Response, RelayError> {
    finalize_git(state, &body, GitPayload::Bundle).await
}

/// POST /api/gr/patch - finalize a session as an mbox patch push.
async fn post_patch(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Response, RelayError> {
    finalize_git(state, &body, GitPayload::Mbox).await
}

async fn finalize_git(
    state: AppState,
    body: &[u8],
    payload: GitPayload,
) -> Result<Response, RelayError> {
    let req: GitFinalizeRequest = parse_body(body)?;
    validate_session_id(&req.session_id)?;
    let key = RepoKey::parse(&req.repo)?;
    validate_branch(&req.branch, "branch")?;
    validate_branch(&req.base_branch, "baseBranch")?;

    // The CAS into `processing` is the single gate against duplicate
    // finalization; a losing caller gets the same 202 without a second job.
    let started = state
        .sessions
        .start_processing(&req.session_id, "Processing")?;
    if started {
        spawn_git_job(
            state,
            req.session_id,
            key,
            req.branch,
            req.base_branch,
            payload,
        );
    }

    Ok((
        StatusCode::ACCEPTED,
        Json(json!({"success": true, "status": "processing"})),
    )
        .into_response())
}

/// Schedule the Git pipeline for a session. The 202 response has already
/// been decided; everything here reports only through the session store.
fn spawn_git_job(
    state: AppState,
    session_id: String,
    key: RepoKey,
    branch: String,
    base_branch: String,
    payload: GitPayload,
) {
    tokio::spawn(async move {
        let result = run_git_job(&state, &session_id, &key, &branch, &base_branch, payload).await;
        match result {
            Ok(sha) => {
                info!(
                    target: "server",
                    session_id = %session_id,
                    repo = %key,
                    branch = %branch,
                    sha = %sha,
                    "session pushed"
                );
                let mut details = Map::new();
                details.insert("commitSha".into(), Value::String(sha.clone()));
                details.insert(
                    "commitUrl".into(),
                    Value::String(format!("https://github.com/{key}/commit/{sha}")),
                );
                state.sessions.set_status(
                    &session_id,
                    SessionStatus::Pushed,
                    &format!("Pushed to {key}@{branch}"),
                    details,
                );
            }
            Err(err) => {
                warn!(target: "server", session_id = %session_id, repo = %key, "finalize failed: {err}");
                state.sessions.set_failed(&session_id, &err.to_string());
            }
        }
    });
}

async fn run_git_job(
    state: &AppState,
    session_id: &str,
    key: &RepoKey,
    branch: &str,
    base_branch: &str,
    payload: GitPayload,
) -> Result<String, RelayError> {
    // All Git work for this repository happens inside the critical section;
    // the guard releases on every exit path.
    let _guard = state.repo_locks.acquire(key).await;

    let data = state.sessions.reassemble(session_id)?;
    let repo_dir = state.git.prepare_branch(key, branch, base_branch).await?;
    match payload {
        GitPayload::Bundle => {
            state
                .git
                .apply_bundle(&repo_dir, &data, branch, session_id)
                .await
        }
        GitPayload::Mbox => {
            state.git.apply_patch(&repo_dir, &data).await?;
            state.git.push_branch(&repo_dir, branch).await
        }
    }
}

#[derive(Debug, Deserialize)]
struct RemoteInfoQuery {
    repo: String,
    branch: String,
}

/// GET /api/gr/remote-info - SHA of a branch head on the remote.
async fn get_remote_info(
    State(state): State<AppState>,
    Query(query): Query<RemoteInfoQuery>,
) -> Result<Response, RelayError> {
    let key = RepoKey::parse(&query.repo)?;
    validate_branch(&query.branch, "branch")?;
    let sha = state.git.remote_head(&key, &query.branch).await?;
    Ok(Json(json!({"sha": sha})).into_response())
}

// ============================================================================
// File finalize
// ============================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FileStoreRequest {
    session_id: String,
    file_name: String,
    size: u64,
    sha256: String,
}

/// POST /api/file/store - finalize a session as a durable file.
async fn post_file_store(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Response, RelayError> {
    let req: FileStoreRequest = parse_body(&body)?;
    validate_session_id(&req.session_id)?;

    if req.size == 0 {
        return Err(RelayError::InvalidInput(
            "size must be a positive integer".into(),
        ));
    }
    if req.size > state.config.max_file_size {
        return Err(RelayError::FileTooLarge {
            size: req.size,
            max: state.config.max_file_size,
        });
    }
    if !is_hex_sha256(&req.sha256) {
        return Err(RelayError::InvalidInput(
            "sha256 must be 64 hex characters".into(),
        ));
    }
    if req.file_name.trim().is_empty() {
        return Err(RelayError::InvalidInput("fileName must not be empty".into()));
    }

    let started = state
        .sessions
        .start_processing(&req.session_id, "Processing")?;
    if started {
        let state = state.clone();
        tokio::spawn(async move {
            let result = state.files.store(
                &state.sessions,
                &req.session_id,
                &req.file_name,
                req.size,
                &req.sha256,
            );
            match result {
                Ok(stored) => {
                    let mut details = Map::new();
                    details.insert(
                        "storedPath".into(),
                        Value::String(stored.stored_path.clone()),
                    );
                    details.insert("storedSize".into(), Value::from(stored.stored_size));
                    state.sessions.set_status(
                        &req.session_id,
                        SessionStatus::Stored,
                        "File stored",
                        details,
                    );
                }
                Err(err) => {
                    warn!(
                        target: "server",
                        session_id = %req.session_id,
                        "file store failed: {err}"
                    );
                    state.sessions.set_failed(&req.session_id, &err.to_string());
                }
            }
        });
    }

    Ok((
        StatusCode::ACCEPTED,
        Json(json!({"success": true, "status": "processing"})),
    )
        .into_response())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_session_id() {
        assert!(validate_session_id("s1").is_ok());
        assert!(validate_session_id("session-42_x").is_ok());
        assert!(validate_session_id("").is_err());
        assert!(validate_session_id("a/b").is_err());
        assert!(validate_session_id("..").is_err());
        assert!(validate_session_id("a b").is_err());
        assert!(validate_session_id(&"x".repeat(129)).is_err());
    }

    #[test]
    fn test_chunk_request_rejects_float_index() {
        let err = parse_body::<ChunkRequest>(
            br#"{"sessionId":"s1","chunkIndex":1.5,"totalChunks":3}"#,
        )
        .unwrap_err();
        assert_eq!(err.code(), "INVALID_INPUT");
    }

    #[test]
    fn test_chunk_request_rejects_missing_fields() {
        assert!(parse_body::<ChunkRequest>(br#"{"sessionId":"s1"}"#).is_err());
        assert!(parse_body::<ChunkRequest>(b"not json").is_err());
    }

    #[test]
    fn test_utc_now_iso8601_shape() {
        let ts = utc_now_iso8601();
        assert!(ts.ends_with('Z'));
        assert_eq!(ts.len(), "2026-01-01T00:00:00.000Z".len());
    }
}
