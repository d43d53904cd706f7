//! Admin HTTP API
//!
//! Read-only status plus the administrative actions: killing or resetting a
//! searcher and sending failed videos back to analysis.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde_json::json;
use std::future::Future;
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

use crate::crf_search::{SearchError, SearcherHandle};
use crate::failures::FailureLedger;
use crate::models::{current_timestamp_ms, FailureRecord};
use crate::state_machine::{StateMachine, StateMachineError};
use crate::status::{
    collect_system_status, state_counts, FailureCount, SharedActivity, StatusSnapshot,
};
use crate::store::StoreError;

/// Errors that can occur when running the admin server
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Failed to bind to {addr}: {source}")]
    Bind {
        addr: String,
        source: std::io::Error,
    },

    #[error("Server error: {0}")]
    Serve(std::io::Error),
}

/// Everything the handlers read from or act on
#[derive(Clone)]
pub struct AdminState {
    pub searchers: Arc<Vec<SearcherHandle>>,
    pub machine: StateMachine,
    pub ledger: FailureLedger,
    pub activity: SharedActivity,
}

/// Handler error mapped to a JSON body
#[derive(Debug, Error)]
enum ApiError {
    #[error("{0}")]
    NotFound(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    StateMachine(#[from] StateMachineError),

    #[error(transparent)]
    Search(#[from] SearchError),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Search(SearchError::Stopped(_)) => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            warn!(error = %self, "admin request failed");
        }
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

impl AdminState {
    fn searcher(&self, n: usize) -> Result<&SearcherHandle, ApiError> {
        self.searchers
            .get(n)
            .ok_or_else(|| ApiError::NotFound(format!("no searcher {}", n)))
    }
}

/// GET /status
async fn get_status(State(state): State<AdminState>) -> Result<Json<StatusSnapshot>, ApiError> {
    let mut searchers = Vec::with_capacity(state.searchers.len());
    for handle in state.searchers.iter() {
        searchers.push(handle.status().await?);
    }
    let videos = state_counts(
        state
            .machine
            .store()
            .blocking(|store| store.count_by_state())
            .await?,
    );
    let unresolved_failures = state
        .ledger
        .blocking(|ledger| ledger.summary())
        .await?
        .into_iter()
        .map(FailureCount::from)
        .collect();
    let encodes = state.activity.read().await.clone();
    let system = tokio::task::spawn_blocking(collect_system_status)
        .await
        .unwrap_or_default();

    Ok(Json(StatusSnapshot {
        timestamp_unix_ms: current_timestamp_ms(),
        searchers,
        encodes,
        videos,
        unresolved_failures,
        system,
    }))
}

/// GET /videos/:id/failures
async fn get_failures(
    State(state): State<AdminState>,
    Path(video_id): Path<i64>,
) -> Result<Json<Vec<FailureRecord>>, ApiError> {
    let video = state
        .machine
        .store()
        .blocking(move |store| store.get_video(video_id))
        .await?;
    if video.is_none() {
        return Err(ApiError::NotFound(format!("no video {}", video_id)));
    }
    let failures = state
        .ledger
        .blocking(move |ledger| ledger.failures_for_video(video_id))
        .await?;
    Ok(Json(failures))
}

/// POST /searchers/:n/kill
async fn kill_searcher(
    State(state): State<AdminState>,
    Path(n): Path<usize>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let killed = state.searcher(n)?.kill().await?;
    info!(searcher = n, killed, "kill requested");
    Ok(Json(json!({ "searcher": n, "killed": killed })))
}

/// POST /searchers/:n/reset
async fn reset_searcher(
    State(state): State<AdminState>,
    Path(n): Path<usize>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let reset = state.searcher(n)?.reset_if_stuck().await?;
    info!(searcher = n, reset, "reset requested");
    Ok(Json(json!({ "searcher": n, "reset": reset })))
}

/// POST /failed/reset
async fn reset_failed(State(state): State<AdminState>) -> Result<Json<serde_json::Value>, ApiError> {
    let reset = state
        .machine
        .blocking(|machine| machine.reset_failed_to_needs_analysis())
        .await?;
    Ok(Json(json!({ "reset": reset })))
}

/// Creates the axum Router with the admin endpoints
pub fn create_admin_router(state: AdminState) -> Router {
    Router::new()
        .route("/status", get(get_status))
        .route("/videos/:id/failures", get(get_failures))
        .route("/searchers/:n/kill", post(kill_searcher))
        .route("/searchers/:n/reset", post(reset_searcher))
        .route("/failed/reset", post(reset_failed))
        .with_state(state)
}

/// Runs the admin HTTP server on `bind` until `shutdown` resolves
pub async fn run_admin_server<F>(bind: &str, state: AdminState, shutdown: F) -> Result<(), ServerError>
where
    F: Future<Output = ()> + Send + 'static,
{
    let app = create_admin_router(state);
    let listener = tokio::net::TcpListener::bind(bind)
        .await
        .map_err(|source| ServerError::Bind {
            addr: bind.to_string(),
            source,
        })?;
    info!(addr = bind, "admin api listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
        .map_err(ServerError::Serve)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CrfSearchConfig;
    use crate::crf_search::SearcherContext;
    use crate::models::{ContentSource, EncodeFailure, FailureCategory, VideoState};
    use crate::rules::test_support::NoRules;
    use crate::status::new_shared_activity;
    use crate::store::test_support::new_video;
    use crate::store::Store;
    use crate::subprocess::SubprocessRunner;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use std::collections::BTreeMap;
    use std::time::Duration;
    use tower::ServiceExt;

    fn state(searchers: usize) -> AdminState {
        let store = Store::open_in_memory().unwrap();
        let machine = StateMachine::new(store.clone());
        let ledger = FailureLedger::new(store);
        let ctx = SearcherContext {
            machine: machine.clone(),
            ledger: ledger.clone(),
            runner: SubprocessRunner::new("/nonexistent/crf-tool", Duration::from_millis(100)),
            rules: Arc::new(NoRules),
            config: CrfSearchConfig::default(),
        };
        let handles = (0..searchers)
            .map(|id| SearcherHandle::spawn(id, ctx.clone()))
            .collect();
        AdminState {
            searchers: Arc::new(handles),
            machine,
            ledger,
            activity: new_shared_activity(),
        }
    }

    async fn call(state: &AdminState, method: &str, uri: &str) -> (StatusCode, serde_json::Value) {
        let response = create_admin_router(state.clone())
            .oneshot(
                Request::builder()
                    .method(method)
                    .uri(uri)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let status = response.status();
        let body = response.into_body().collect().await.unwrap().to_bytes();
        (status, serde_json::from_slice(&body).unwrap())
    }

    fn failed_video(state: &AdminState, path: &str) -> i64 {
        let store = state.machine.store();
        let video = store
            .insert_video(&new_video(path, ContentSource::Series, 1))
            .unwrap();
        state.machine.mark_failed(&video).unwrap();
        video.id
    }

    #[tokio::test]
    async fn test_status_reports_searchers_and_counts() {
        let state = state(2);
        failed_video(&state, "/tv/a.mkv");
        state
            .machine
            .store()
            .insert_video(&new_video("/tv/b.mkv", ContentSource::Series, 1))
            .unwrap();
        state.activity.write().await.completed = 7;

        let (status, json) = call(&state, "GET", "/status").await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["searchers"].as_array().unwrap().len(), 2);
        assert_eq!(json["searchers"][1]["id"], 1);
        assert_eq!(json["searchers"][0]["busy"], false);
        assert_eq!(json["videos"]["failed"], 1);
        assert_eq!(json["videos"]["needs_analysis"], 1);
        assert_eq!(json["encodes"]["completed"], 7);
        assert!(json["system"]["mem_usage_percent"].is_number());
        assert!(json["timestamp_unix_ms"].as_i64().unwrap() > 0);
    }

    #[tokio::test]
    async fn test_failures_for_video() {
        let state = state(1);
        let id = failed_video(&state, "/tv/a.mkv");
        state
            .ledger
            .record(
                id,
                FailureCategory::Encode(EncodeFailure::CodecIssues),
                "missing_output",
                "no output written",
                BTreeMap::new(),
            )
            .unwrap();

        let (status, json) = call(&state, "GET", &format!("/videos/{}/failures", id)).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(json.as_array().unwrap().len(), 1);
        assert_eq!(json[0]["code"], "missing_output");
        assert_eq!(json[0]["category"]["stage"], "encode");
        assert_eq!(json[0]["category"]["category"], "codec_issues");

        let (status, json) = call(&state, "GET", "/videos/999/failures").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(json["error"], "no video 999");
    }

    #[tokio::test]
    async fn test_kill_and_reset_idle_searcher() {
        let state = state(1);

        let (status, json) = call(&state, "POST", "/searchers/0/kill").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["killed"], false);

        let (status, json) = call(&state, "POST", "/searchers/0/reset").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["reset"], false);

        let (status, _) = call(&state, "POST", "/searchers/3/kill").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_reset_failed_moves_videos_back() {
        let state = state(1);
        let a = failed_video(&state, "/tv/a.mkv");
        let b = failed_video(&state, "/tv/b.mkv");

        let (status, json) = call(&state, "POST", "/failed/reset").await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["reset"], 2);
        for id in [a, b] {
            let video = state.machine.store().require_video(id).unwrap();
            assert_eq!(video.state, VideoState::NeedsAnalysis);
        }
    }

    #[tokio::test]
    async fn test_status_is_get_only() {
        let state = state(1);
        let response = create_admin_router(state)
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/status")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
    }
}
