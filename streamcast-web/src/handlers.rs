//! JSON API handlers.
//!
//! Endpoints never block on long-running work: job submission returns 202
//! immediately and progress is polled separately. Unknown stream names
//! return empty lists with 200 to keep client polling simple.

use axum::Json;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Deserialize;
use serde_json::json;
use streamcast_core::pipeline::PipelineError;
use streamcast_core::streaming::{StreamSession, StreamingError};

use crate::presets::PresetFeed;
use crate::server::AppState;

#[derive(Deserialize)]
pub struct StreamNameRequest {
    pub stream_name: String,
}

#[derive(Deserialize)]
pub struct AddStreamRequest {
    #[serde(default)]
    pub stream_name: Option<String>,
    #[serde(default)]
    pub remote_key: Option<String>,
}

pub async fn health() -> Json<serde_json::Value> {
    Json(json!({"status": "healthy", "service": "streamcast"}))
}

/// Brings up a preset group's feeds and returns their public playback URLs.
/// Cached groups return their URLs without starting anything; names that
/// match no preset group return `[]`.
pub async fn load_stream(
    State(state): State<AppState>,
    Json(request): Json<StreamNameRequest>,
) -> Response {
    let name = request.stream_name;

    // Held across the whole group bring-up so concurrent loads of the same
    // group cannot race each other into duplicate sessions.
    let mut cache = state.stream_cache.lock().await;
    if let Some(urls) = cache.get(&name) {
        return Json(urls.clone()).into_response();
    }

    let Some(feeds) = state.presets.group(&name) else {
        return Json(Vec::<String>::new()).into_response();
    };

    match start_preset_group(&state, feeds).await {
        Ok(urls) => {
            cache.insert(name, urls.clone());
            Json(urls).into_response()
        }
        Err(e) => {
            tracing::error!("Failed to load preset group {name}: {e}");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"error": e.to_string()})),
            )
                .into_response()
        }
    }
}

/// Registers and starts one session per preset feed. A feed that fails to
/// come up tears down the sessions already started so the group is never
/// cached half-alive.
async fn start_preset_group(
    state: &AppState,
    feeds: &[PresetFeed],
) -> Result<Vec<String>, StreamingError> {
    let mut started: Vec<StreamSession> = Vec::new();
    let mut urls = Vec::new();

    for feed in feeds {
        tracing::info!("Bringing up preset feed {}", feed.feed_name);
        let mut session = StreamSession::new(
            feed.file.clone(),
            Some(feed.feed_name.clone()),
            state.ingest_rtsp_port,
            state.transcode.clone(),
        )?;

        let result = async {
            let url = state
                .orchestrator
                .add_stream(session.local_rtsp_url(), session.serial())
                .await?;
            session.start().await?;
            Ok::<_, StreamingError>(url)
        }
        .await;

        match result {
            Ok(url) => {
                urls.push(url);
                started.push(session);
            }
            Err(e) => {
                session.cleanup().await;
                for mut survivor in started {
                    survivor.cleanup().await;
                }
                return Err(e);
            }
        }
    }

    state.sessions.lock().await.extend(started);
    Ok(urls)
}

/// Returns the cached playback URLs for a loaded group, or `[]`.
pub async fn get_stream(
    State(state): State<AppState>,
    Json(request): Json<StreamNameRequest>,
) -> Json<Vec<String>> {
    let cache = state.stream_cache.lock().await;
    Json(cache.get(&request.stream_name).cloned().unwrap_or_default())
}

/// Accepts a background processing job and returns 202 immediately.
pub async fn add_stream(
    State(state): State<AppState>,
    Json(request): Json<AddStreamRequest>,
) -> Response {
    let (Some(stream_name), Some(remote_key)) = (request.stream_name, request.remote_key) else {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": "Missing stream name or remote key"})),
        )
            .into_response();
    };

    match state.pipeline.submit(&stream_name, &remote_key) {
        Ok(()) => (
            StatusCode::ACCEPTED,
            Json(json!({
                "message": "Video processing started",
                "stream_name": stream_name,
                "status": "processing"
            })),
        )
            .into_response(),
        Err(e @ PipelineError::JobAlreadyRunning { .. }) => {
            (StatusCode::CONFLICT, Json(json!({"error": e.to_string()}))).into_response()
        }
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({"error": e.to_string()})),
        )
            .into_response(),
    }
}

/// Returns the current job snapshot for a stream name, or 404.
pub async fn get_processing_status(
    State(state): State<AppState>,
    Json(request): Json<StreamNameRequest>,
) -> Response {
    match state.pipeline.status(&request.stream_name) {
        Ok(snapshot) => Json(snapshot).into_response(),
        Err(_) => (
            StatusCode::NOT_FOUND,
            Json(json!({"error": "Stream not found"})),
        )
            .into_response(),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;
    use streamcast_core::blobstore::{BlobStore, BlobStoreError};
    use streamcast_core::config::StreamcastConfig;
    use streamcast_core::pipeline::{ChunkSink, ChunkUploader, ProcessingPipeline, UploadError};
    use streamcast_core::streaming::RemuxOrchestrator;
    use tokio::sync::watch;

    use super::*;
    use crate::presets::PresetLibrary;

    struct HangingBlobStore;

    #[async_trait]
    impl BlobStore for HangingBlobStore {
        async fn presigned_get_url(
            &self,
            _key: &str,
            _expires_in: Duration,
        ) -> Result<String, BlobStoreError> {
            std::future::pending().await
        }
    }

    struct NoopSink;

    #[async_trait]
    impl ChunkSink for NoopSink {
        async fn upload_chunk(&self, path: &std::path::Path) -> Result<String, UploadError> {
            Ok(path.display().to_string())
        }
    }

    fn test_state() -> AppState {
        let config = StreamcastConfig::default();
        let (_tx, rx) = watch::channel(false);
        let uploader = ChunkUploader::new(Arc::new(NoopSink), rx);
        let pipeline = ProcessingPipeline::new(
            config.pipeline.clone(),
            &config.transcode,
            Arc::new(HangingBlobStore),
            uploader,
            reqwest::Client::new(),
        );
        let orchestrator = Arc::new(RemuxOrchestrator::new(
            config.remux.clone(),
            config.tunnel.clone(),
        ));
        AppState::new(orchestrator, pipeline, PresetLibrary::new(), &config)
    }

    fn name_request(name: &str) -> Json<StreamNameRequest> {
        Json(StreamNameRequest {
            stream_name: name.to_string(),
        })
    }

    #[tokio::test]
    async fn test_health_reports_service() {
        let Json(body) = health().await;
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["service"], "streamcast");
    }

    #[tokio::test]
    async fn test_unknown_stream_loads_as_empty_list() {
        let state = test_state();
        let response = load_stream(State(state), name_request("Nowhere")).await;
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_get_stream_round_trips_cached_urls() {
        let state = test_state();
        let urls = vec!["https://tunnel.example/Feed-1/index.m3u8".to_string()];
        state
            .stream_cache
            .lock()
            .await
            .insert("Group".to_string(), urls.clone());

        let Json(cached) = get_stream(State(state.clone()), name_request("Group")).await;
        assert_eq!(cached, urls);

        let Json(unknown) = get_stream(State(state), name_request("Other")).await;
        assert!(unknown.is_empty());
    }

    #[tokio::test]
    async fn test_cached_group_loads_without_touching_orchestrator() {
        let state = test_state();
        let urls = vec!["https://tunnel.example/Feed-1/index.m3u8".to_string()];
        state
            .stream_cache
            .lock()
            .await
            .insert("Group".to_string(), urls.clone());

        // The orchestrator was never started; a cache hit must not need it.
        let response = load_stream(State(state), name_request("Group")).await;
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_add_stream_accepts_then_conflicts_while_active() {
        let state = test_state();
        let request = || {
            Json(AddStreamRequest {
                stream_name: Some("feed".to_string()),
                remote_key: Some("videos/feed.mp4".to_string()),
            })
        };

        let first = add_stream(State(state.clone()), request()).await;
        assert_eq!(first.status(), StatusCode::ACCEPTED);

        let second = add_stream(State(state), request()).await;
        assert_eq!(second.status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn test_add_stream_rejects_missing_fields() {
        let state = test_state();
        let response = add_stream(
            State(state),
            Json(AddStreamRequest {
                stream_name: Some("feed".to_string()),
                remote_key: None,
            }),
        )
        .await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_processing_status_found_and_not_found() {
        let state = test_state();
        state.pipeline.submit("feed", "videos/feed.mp4").unwrap();

        let found = get_processing_status(State(state.clone()), name_request("feed")).await;
        assert_eq!(found.status(), StatusCode::OK);

        let missing = get_processing_status(State(state), name_request("ghost")).await;
        assert_eq!(missing.status(), StatusCode::NOT_FOUND);
    }
}
