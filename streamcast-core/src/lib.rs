//! Streamcast Core - Stream orchestration and background video processing
//!
//! This crate provides the building blocks of the stream worker: port
//! allocation, supervised external processes, per-feed transcode sessions,
//! the remux server and tunnel orchestrator, and the background pipeline
//! that downloads, chunks, and uploads stored videos.

pub mod blobstore;
pub mod config;
pub mod pipeline;
pub mod ports;
pub mod process;
pub mod streaming;
pub mod tracing_setup;

// Re-export main types for convenient access
pub use blobstore::{BlobStore, BlobStoreError, S3BlobStore};
pub use config::StreamcastConfig;
pub use pipeline::{PipelineError, ProcessingPipeline};
pub use ports::PortAllocationError;
pub use process::ProcessError;
pub use streaming::{RemuxOrchestrator, StreamSession, StreamingError};

/// Core errors that can bubble up from any Streamcast subsystem.
#[derive(Debug, thiserror::Error)]
pub enum StreamcastError {
    #[error("Streaming error: {0}")]
    Streaming(#[from] StreamingError),

    #[error("Pipeline error: {0}")]
    Pipeline(#[from] PipelineError),

    #[error("Port allocation error: {0}")]
    Ports(#[from] PortAllocationError),

    #[error("Process error: {0}")]
    Process(#[from] ProcessError),

    #[error("Blob store error: {0}")]
    BlobStore(#[from] BlobStoreError),

    #[error("Configuration error: {reason}")]
    Configuration { reason: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, StreamcastError>;
