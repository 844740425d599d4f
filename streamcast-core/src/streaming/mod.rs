//! Live stream publication.
//!
//! A [`StreamSession`] loops a local file into a realtime RTSP feed; the
//! [`RemuxOrchestrator`] owns the remux server and tunnel processes and
//! republishes registered feeds as public HLS streams.

pub mod remux;
pub mod session;

pub use remux::{RemuxOrchestrator, RemuxSettings, StreamPath};
pub use session::{SessionState, StreamSession};

use thiserror::Error;

/// Errors from stream publication and orchestration
#[derive(Debug, Error)]
pub enum StreamingError {
    #[error("Configuration error: {reason}")]
    Config { reason: String },

    #[error("Process failed to start: {reason}")]
    ProcessSpawn { reason: String },

    #[error("Failed to capture tunnel URL: {reason}")]
    TunnelCapture { reason: String },

    #[error("Orchestrator has no captured tunnel URL yet")]
    NotStarted,

    #[error("Port allocation failed: {0}")]
    Ports(#[from] crate::ports::PortAllocationError),

    #[error("Process error: {0}")]
    Process(#[from] crate::process::ProcessError),

    #[error("Remux config serialization failed: {0}")]
    ConfigFormat(#[from] serde_yaml::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
