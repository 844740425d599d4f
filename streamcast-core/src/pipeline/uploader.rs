//! Concurrent chunk uploads to the ingestion API.
//!
//! Uploads fan out together and are joined in input order; one failing
//! chunk never cancels its siblings. The transport sits behind a trait so
//! the fan-out semantics are testable without a live endpoint.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::watch;

use crate::config::IngestionConfig;

/// Per-chunk upload failures. Non-fatal to the job; they only affect its
/// terminal state.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum UploadError {
    #[error("Ingestion API rejected {chunk} with status {status}: {body}")]
    Rejected {
        chunk: String,
        status: u16,
        body: String,
    },

    #[error("Ingestion response for {chunk} is missing the id field")]
    MissingId { chunk: String },

    #[error("Upload of {chunk} failed: {reason}")]
    Transport { chunk: String, reason: String },

    #[error("Upload of {chunk} cancelled by shutdown")]
    Cancelled { chunk: String },
}

/// Destination for chunk uploads.
#[async_trait]
pub trait ChunkSink: Send + Sync {
    /// Uploads one chunk file and returns the ingestion identifier.
    async fn upload_chunk(&self, path: &Path) -> Result<String, UploadError>;
}

/// Outcome of one chunk upload, in the position of its input path.
#[derive(Debug)]
pub struct ChunkUploadResult {
    pub chunk_path: PathBuf,
    pub outcome: Result<String, UploadError>,
}

impl ChunkUploadResult {
    pub fn succeeded(&self) -> bool {
        self.outcome.is_ok()
    }
}

/// Production sink: multipart POST against the ingestion API's `/files`
/// endpoint, with a timeout ceiling sized for multi-gigabyte chunks.
pub struct IngestionClient {
    client: reqwest::Client,
    config: IngestionConfig,
}

impl IngestionClient {
    pub fn new(client: reqwest::Client, config: IngestionConfig) -> Self {
        Self { client, config }
    }
}

#[async_trait]
impl ChunkSink for IngestionClient {
    async fn upload_chunk(&self, path: &Path) -> Result<String, UploadError> {
        let chunk = chunk_label(path);

        let file = tokio::fs::File::open(path)
            .await
            .map_err(|e| UploadError::Transport {
                chunk: chunk.clone(),
                reason: format!("failed to open chunk file: {e}"),
            })?;
        let size = file
            .metadata()
            .await
            .map(|meta| meta.len())
            .unwrap_or_default();
        tracing::info!("Uploading chunk {chunk} ({size} bytes)");

        let part = reqwest::multipart::Part::stream(reqwest::Body::from(file))
            .file_name(chunk.clone())
            .mime_str("video/mp4")
            .map_err(|e| UploadError::Transport {
                chunk: chunk.clone(),
                reason: e.to_string(),
            })?;
        let form = reqwest::multipart::Form::new()
            .part("file", part)
            .text("purpose", "vision")
            .text("media_type", "video");

        let response = self
            .client
            .post(format!("{}/files", self.config.base_url))
            .multipart(form)
            .timeout(self.config.upload_timeout)
            .send()
            .await
            .map_err(|e| UploadError::Transport {
                chunk: chunk.clone(),
                reason: e.to_string(),
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(UploadError::Rejected {
                chunk,
                status: status.as_u16(),
                body,
            });
        }

        let body: serde_json::Value =
            response.json().await.map_err(|e| UploadError::Transport {
                chunk: chunk.clone(),
                reason: format!("invalid ingestion response: {e}"),
            })?;

        match body.get("id").and_then(|id| id.as_str()) {
            Some(id) => {
                tracing::info!("Uploaded chunk {chunk} as {id}");
                Ok(id.to_string())
            }
            None => Err(UploadError::MissingId { chunk }),
        }
    }
}

/// Fan-out uploader with per-chunk success/failure aggregation.
#[derive(Clone)]
pub struct ChunkUploader {
    sink: Arc<dyn ChunkSink>,
    shutdown: watch::Receiver<bool>,
}

impl ChunkUploader {
    pub fn new(sink: Arc<dyn ChunkSink>, shutdown: watch::Receiver<bool>) -> Self {
        Self { sink, shutdown }
    }

    /// Uploads every chunk concurrently and returns one result per input
    /// path, in input order regardless of completion order. In-flight
    /// uploads observe the shutdown signal and report as cancelled instead
    /// of waiting out their timeout.
    pub async fn upload_all(&self, paths: &[PathBuf]) -> Vec<ChunkUploadResult> {
        let uploads = paths.iter().map(|path| {
            let sink = Arc::clone(&self.sink);
            let shutdown = self.shutdown.clone();
            let path = path.clone();
            async move {
                let outcome = tokio::select! {
                    result = sink.upload_chunk(&path) => result,
                    _ = shutdown_requested(shutdown) => Err(UploadError::Cancelled {
                        chunk: chunk_label(&path),
                    }),
                };
                ChunkUploadResult {
                    chunk_path: path,
                    outcome,
                }
            }
        });

        let results = futures::future::join_all(uploads).await;

        let succeeded = results.iter().filter(|r| r.succeeded()).count();
        tracing::info!(
            "Upload completed: {succeeded} successful, {} failed",
            results.len() - succeeded
        );
        results
    }
}

async fn shutdown_requested(mut shutdown: watch::Receiver<bool>) {
    // A closed channel means no shutdown can ever arrive; park forever so
    // the upload branch always wins the select.
    if shutdown.wait_for(|stop| *stop).await.is_err() {
        std::future::pending::<()>().await;
    }
}

pub(crate) fn chunk_label(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}
