//! Background video-processing pipeline.
//!
//! Each job is a state machine keyed by stream name: download the source
//! from the blob store, split it into time-bounded chunks, upload the
//! chunks to the ingestion API, then settle on a terminal state with
//! partial-failure accounting. Snapshots are pollable while the job runs
//! and after it finishes.

pub mod chunker;
pub mod uploader;

pub use uploader::{ChunkSink, ChunkUploadResult, ChunkUploader, IngestionClient, UploadError};

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::StreamExt;
use parking_lot::RwLock;
use serde::Serialize;
use thiserror::Error;
use tokio::io::AsyncWriteExt;

use crate::blobstore::{BlobStore, BlobStoreError};
use crate::config::{PipelineConfig, TranscodeConfig};
use crate::process::ProcessError;

/// Errors from job submission, polling, and the per-job stages
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("A job for {stream_name} is already running")]
    JobAlreadyRunning { stream_name: String },

    #[error("No job found for {stream_name}")]
    JobNotFound { stream_name: String },

    #[error("Download failed: {reason}")]
    Download { reason: String },

    #[error("Segmentation failed: {reason}")]
    Segmentation { reason: String },

    #[error("Blob store error: {0}")]
    BlobStore(#[from] BlobStoreError),

    #[error("Process error: {0}")]
    Process(#[from] ProcessError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Job lifecycle. Transitions are monotonic forward, except that any state
/// may fall to `Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Queued,
    Downloading,
    Chunking,
    Uploading,
    Completed,
    CompletedWithWarnings,
    Failed,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobState::Completed | JobState::CompletedWithWarnings | JobState::Failed
        )
    }
}

/// One chunk that failed to upload; retained in the job record.
#[derive(Debug, Clone, Serialize)]
pub struct ChunkFailure {
    pub chunk: String,
    pub error: String,
}

/// Pollable job snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct JobSnapshot {
    pub stream_name: String,
    pub state: JobState,
    pub progress: u8,
    pub message: String,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    pub uploaded_chunks: Vec<String>,
    pub failed_chunks: Vec<ChunkFailure>,
}

impl JobSnapshot {
    fn queued(stream_name: &str) -> Self {
        Self {
            stream_name: stream_name.to_string(),
            state: JobState::Queued,
            progress: 0,
            message: "Queued".to_string(),
            started_at: Utc::now(),
            completed_at: None,
            uploaded_chunks: Vec::new(),
            failed_chunks: Vec::new(),
        }
    }
}

/// Per-job state machine host: accepts submissions, runs jobs as background
/// tasks, and serves snapshots for polling.
#[derive(Clone)]
pub struct ProcessingPipeline {
    inner: Arc<PipelineInner>,
}

struct PipelineInner {
    jobs: RwLock<HashMap<String, JobSnapshot>>,
    blob_store: Arc<dyn BlobStore>,
    uploader: ChunkUploader,
    http: reqwest::Client,
    config: PipelineConfig,
    ffmpeg_binary: PathBuf,
    ffprobe_binary: PathBuf,
}

impl ProcessingPipeline {
    pub fn new(
        config: PipelineConfig,
        transcode: &TranscodeConfig,
        blob_store: Arc<dyn BlobStore>,
        uploader: ChunkUploader,
        http: reqwest::Client,
    ) -> Self {
        Self {
            inner: Arc::new(PipelineInner {
                jobs: RwLock::new(HashMap::new()),
                blob_store,
                uploader,
                http,
                config,
                ffmpeg_binary: transcode.ffmpeg_binary.clone(),
                ffprobe_binary: transcode.ffprobe_binary.clone(),
            }),
        }
    }

    /// Accepts a job for `stream_name`, or rejects it while another job for
    /// the same key is still active. The check-and-insert happens under one
    /// lock, so concurrent resubmissions of a key are serialized; distinct
    /// keys progress independently.
    ///
    /// # Errors
    ///
    /// - `PipelineError::JobAlreadyRunning` - A non-terminal job holds the key
    pub fn submit(&self, stream_name: &str, remote_key: &str) -> Result<(), PipelineError> {
        {
            let mut jobs = self.inner.jobs.write();
            if let Some(existing) = jobs.get(stream_name)
                && !existing.state.is_terminal()
            {
                return Err(PipelineError::JobAlreadyRunning {
                    stream_name: stream_name.to_string(),
                });
            }
            jobs.insert(stream_name.to_string(), JobSnapshot::queued(stream_name));
        }

        let inner = Arc::clone(&self.inner);
        let stream_name = stream_name.to_string();
        let remote_key = remote_key.to_string();
        tokio::spawn(async move {
            inner.run_job(stream_name, remote_key).await;
        });

        Ok(())
    }

    /// Returns the current snapshot for `stream_name`.
    ///
    /// # Errors
    ///
    /// - `PipelineError::JobNotFound` - No job has been submitted for the key
    pub fn status(&self, stream_name: &str) -> Result<JobSnapshot, PipelineError> {
        self.inner
            .jobs
            .read()
            .get(stream_name)
            .cloned()
            .ok_or_else(|| PipelineError::JobNotFound {
                stream_name: stream_name.to_string(),
            })
    }

    /// Evicts terminal job snapshots whose completion is older than `ttl`.
    /// Returns the number of evicted jobs.
    pub fn reap_terminal(&self, ttl: Duration) -> usize {
        let ttl = chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::MAX);
        let cutoff = Utc::now() - ttl;

        let mut jobs = self.inner.jobs.write();
        let before = jobs.len();
        jobs.retain(|_, job| {
            !(job.state.is_terminal() && job.completed_at.is_some_and(|at| at < cutoff))
        });
        let evicted = before - jobs.len();
        if evicted > 0 {
            tracing::debug!("Reaped {evicted} expired job snapshots");
        }
        evicted
    }
}

impl PipelineInner {
    async fn run_job(self: Arc<Self>, stream_name: String, remote_key: String) {
        tracing::info!("Starting video processing for {stream_name}");

        let mut temp_paths: Vec<PathBuf> = Vec::new();
        if let Err(e) = self.execute(&stream_name, &remote_key, &mut temp_paths).await {
            tracing::warn!("Processing {stream_name} failed: {e}");
            self.fail(&stream_name, &e);
        }
        self.cleanup_temp(&temp_paths).await;
    }

    async fn execute(
        &self,
        stream_name: &str,
        remote_key: &str,
        temp_paths: &mut Vec<PathBuf>,
    ) -> Result<(), PipelineError> {
        self.update(
            stream_name,
            JobState::Downloading,
            10,
            "Downloading source video...",
        );
        let download_url = self
            .blob_store
            .presigned_get_url(remote_key, self.config.presign_expiry)
            .await?;
        let video_path = self.download(&download_url, stream_name, temp_paths).await?;

        self.update(
            stream_name,
            JobState::Chunking,
            40,
            "Splitting video into chunks...",
        );
        let total = chunker::probe_duration(&self.ffprobe_binary, &video_path).await?;
        let chunk_len = chunker::chunk_duration(
            total,
            self.config.short_video_threshold,
            self.config.chunk_count,
        );
        let chunk_dir = self
            .config
            .temp_dir
            .join(format!("{}_chunks", scratch_name(stream_name)));
        temp_paths.push(chunk_dir.clone());
        let chunks = chunker::segment(
            &self.ffmpeg_binary,
            &video_path,
            &chunk_dir,
            chunk_len,
            self.config.segmentation_timeout,
        )
        .await?;

        self.update(
            stream_name,
            JobState::Uploading,
            70,
            "Uploading chunks to the ingestion API...",
        );
        let results = self.uploader.upload_all(&chunks).await;

        self.finalize(stream_name, &results);
        Ok(())
    }

    /// Streams the signed URL's body to a scratch file in chunks; the file
    /// never passes through memory whole.
    async fn download(
        &self,
        url: &str,
        stream_name: &str,
        temp_paths: &mut Vec<PathBuf>,
    ) -> Result<PathBuf, PipelineError> {
        tokio::fs::create_dir_all(&self.config.temp_dir).await?;
        let path = self
            .config
            .temp_dir
            .join(format!("{}.mp4", scratch_name(stream_name)));

        let response = self
            .http
            .get(url)
            .send()
            .await
            .and_then(|response| response.error_for_status())
            .map_err(|e| PipelineError::Download {
                reason: e.to_string(),
            })?;

        let mut file = tokio::fs::File::create(&path).await?;
        temp_paths.push(path.clone());

        let mut body = response.bytes_stream();
        while let Some(chunk) = body.next().await {
            let chunk = chunk.map_err(|e| PipelineError::Download {
                reason: format!("body stream interrupted: {e}"),
            })?;
            file.write_all(&chunk).await?;
        }
        file.flush().await?;

        tracing::info!("Downloaded source for {stream_name} to {}", path.display());
        Ok(path)
    }

    fn update(&self, stream_name: &str, state: JobState, progress: u8, message: &str) {
        let mut jobs = self.jobs.write();
        if let Some(job) = jobs.get_mut(stream_name) {
            job.state = state;
            job.progress = progress;
            job.message = message.to_string();
        }
    }

    fn fail(&self, stream_name: &str, error: &PipelineError) {
        let mut jobs = self.jobs.write();
        if let Some(job) = jobs.get_mut(stream_name) {
            job.state = JobState::Failed;
            job.message = format!("Error: {error}");
            job.completed_at = Some(Utc::now());
        }
    }

    fn finalize(&self, stream_name: &str, results: &[ChunkUploadResult]) {
        let (state, uploaded, failures) = terminal_outcome(results);
        let message = match state {
            JobState::Completed => "Video processing completed successfully".to_string(),
            JobState::CompletedWithWarnings => format!(
                "Video processing completed; {} of {} chunk uploads failed",
                failures.len(),
                results.len()
            ),
            _ => "All chunk uploads failed".to_string(),
        };

        let mut jobs = self.jobs.write();
        if let Some(job) = jobs.get_mut(stream_name) {
            job.state = state;
            job.progress = 100;
            job.message = message;
            job.completed_at = Some(Utc::now());
            job.uploaded_chunks = uploaded;
            job.failed_chunks = failures;
        }
    }

    /// Removes every path this job recorded, exactly once. Already-missing
    /// files are tolerated.
    async fn cleanup_temp(&self, temp_paths: &[PathBuf]) {
        for path in temp_paths {
            let removal = match tokio::fs::metadata(path).await {
                Ok(meta) if meta.is_dir() => tokio::fs::remove_dir_all(path).await,
                Ok(_) => tokio::fs::remove_file(path).await,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => Err(e),
            };
            if let Err(e) = removal {
                tracing::warn!("Failed to remove temp path {}: {e}", path.display());
            }
        }
    }
}

/// Terminal state from per-chunk outcomes: zero successes fails the job,
/// full success completes it, and a mix completes with warnings while
/// retaining every failure reason.
fn terminal_outcome(
    results: &[ChunkUploadResult],
) -> (JobState, Vec<String>, Vec<ChunkFailure>) {
    let mut uploaded = Vec::new();
    let mut failures = Vec::new();

    for result in results {
        match &result.outcome {
            Ok(id) => uploaded.push(id.clone()),
            Err(error) => failures.push(ChunkFailure {
                chunk: uploader::chunk_label(&result.chunk_path),
                error: error.to_string(),
            }),
        }
    }

    let state = if uploaded.is_empty() {
        JobState::Failed
    } else if failures.is_empty() {
        JobState::Completed
    } else {
        JobState::CompletedWithWarnings
    };

    (state, uploaded, failures)
}

/// Filesystem-safe scratch name for a client-chosen stream name.
fn scratch_name(stream_name: &str) -> String {
    stream_name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect()
}
