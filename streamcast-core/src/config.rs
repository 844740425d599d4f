//! Centralized configuration for Streamcast.
//!
//! All tunable parameters and settings are defined here to avoid
//! hard-coded values scattered throughout the codebase.

use std::path::PathBuf;
use std::time::Duration;

/// Central configuration for all Streamcast components.
///
/// Groups related configuration settings into logical sections.
/// Supports environment variable overrides for runtime customization.
#[derive(Debug, Clone, Default)]
pub struct StreamcastConfig {
    pub remux: RemuxProcessConfig,
    pub tunnel: TunnelConfig,
    pub transcode: TranscodeConfig,
    pub pipeline: PipelineConfig,
    pub ingestion: IngestionConfig,
    pub blob: BlobConfig,
    pub server: ServerConfig,
}

impl StreamcastConfig {
    /// Builds a configuration with environment variable overrides applied.
    ///
    /// Recognized variables: `STREAMCAST_INGESTION_URL` (ingestion API base),
    /// `STREAMCAST_SOURCE_BUCKET` (blob store bucket). AWS credentials and
    /// region are resolved by the SDK's own environment chain.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(url) = std::env::var("STREAMCAST_INGESTION_URL") {
            config.ingestion.base_url = url.trim_matches('"').to_string();
        }
        if let Ok(bucket) = std::env::var("STREAMCAST_SOURCE_BUCKET") {
            config.blob.bucket = bucket.trim_matches('"').to_string();
        }
        config
    }
}

/// Remux server (MediaMTX-compatible) process configuration.
///
/// The remux server republishes locally-published RTSP feeds as HLS. It is
/// launched with its config file path as the sole argument and reloads the
/// file on SIGUSR1 where supported.
#[derive(Debug, Clone)]
pub struct RemuxProcessConfig {
    /// Path to the remux server binary
    pub binary: PathBuf,
    /// Path the shared config file is written to
    pub config_path: PathBuf,
    /// RTSP ingest port transcoders publish to
    pub rtsp_port: u16,
    /// Local HLS port the tunnel points at
    pub hls_port: u16,
    /// Settle time between spawning the server and opening the tunnel
    pub settle: Duration,
    /// Grace period before a forced kill at shutdown
    pub stop_grace: Duration,
}

impl Default for RemuxProcessConfig {
    fn default() -> Self {
        Self {
            binary: PathBuf::from("mediamtx"),
            config_path: PathBuf::from("streamcast-remux.yml"),
            rtsp_port: 8554,
            hls_port: 8888,
            settle: Duration::from_secs(2),
            stop_grace: Duration::from_secs(5),
        }
    }
}

/// Public tunnel process configuration.
///
/// The tunnel exposes the local HLS port under a public URL and prints the
/// assigned hostname on its error stream.
#[derive(Debug, Clone)]
pub struct TunnelConfig {
    /// Path to the tunnel binary
    pub binary: PathBuf,
    /// Hostname suffix identifying the assigned public URL in tunnel logs
    pub hostname_suffix: String,
    /// Deadline for capturing the public URL before startup fails
    pub capture_timeout: Duration,
    /// Grace period before a forced kill at shutdown
    pub stop_grace: Duration,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            binary: PathBuf::from("cloudflared"),
            hostname_suffix: ".trycloudflare.com".to_string(),
            capture_timeout: Duration::from_secs(30),
            stop_grace: Duration::from_secs(5),
        }
    }
}

/// Per-feed transcoder configuration.
///
/// Controls the deterministic ffmpeg invocation that loops a local file
/// into a realtime RTSP feed, and the ffprobe binary used for duration
/// probing in the processing pipeline.
#[derive(Debug, Clone)]
pub struct TranscodeConfig {
    pub ffmpeg_binary: PathBuf,
    pub ffprobe_binary: PathBuf,
    /// Output resolution as (width, height)
    pub resolution: (u32, u32),
    /// Constant output frame rate
    pub frame_rate: u32,
    /// GOP size in frames (also the minimum keyframe interval)
    pub gop_size: u32,
    /// Target video bitrate, e.g. "1000k"
    pub video_bitrate: String,
    /// Bitrate ceiling, e.g. "1200k"
    pub max_bitrate: String,
    /// Rate control buffer size, e.g. "2000k"
    pub buffer_size: String,
    /// Audio bitrate, e.g. "96k"
    pub audio_bitrate: String,
    /// Audio sample rate in Hz
    pub sample_rate: u32,
    /// Audio channel count
    pub channels: u32,
    /// Warm-up interval before the spawned transcoder is health-checked
    pub warmup: Duration,
    /// Grace period before a forced kill at cleanup
    pub stop_grace: Duration,
}

impl Default for TranscodeConfig {
    fn default() -> Self {
        Self {
            ffmpeg_binary: PathBuf::from("ffmpeg"),
            ffprobe_binary: PathBuf::from("ffprobe"),
            resolution: (1280, 720),
            frame_rate: 30,
            gop_size: 30,
            video_bitrate: "1000k".to_string(),
            max_bitrate: "1200k".to_string(),
            buffer_size: "2000k".to_string(),
            audio_bitrate: "96k".to_string(),
            sample_rate: 44100,
            channels: 2,
            warmup: Duration::from_secs(2),
            stop_grace: Duration::from_secs(3),
        }
    }
}

/// Background processing pipeline configuration.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Scratch directory for downloads and chunk output
    pub temp_dir: PathBuf,
    /// Videos shorter than this become a single chunk
    pub short_video_threshold: Duration,
    /// Chunk count for videos at or above the threshold
    pub chunk_count: u32,
    /// Ceiling on a single segmentation run
    pub segmentation_timeout: Duration,
    /// Expiry for presigned download URLs
    pub presign_expiry: Duration,
    /// Terminal job snapshots older than this are reaped
    pub job_ttl: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            temp_dir: std::env::temp_dir().join("streamcast"),
            short_video_threshold: Duration::from_secs(60),
            chunk_count: 4,
            segmentation_timeout: Duration::from_secs(3600),
            presign_expiry: Duration::from_secs(3600),
            job_ttl: Duration::from_secs(3600),
        }
    }
}

/// Ingestion API configuration.
#[derive(Debug, Clone)]
pub struct IngestionConfig {
    /// Base URL of the ingestion API, without a trailing slash
    pub base_url: String,
    /// Total timeout per chunk upload; sized for multi-gigabyte chunks
    pub upload_timeout: Duration,
}

impl Default for IngestionConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            upload_timeout: Duration::from_secs(3000),
        }
    }
}

/// Blob store configuration for source video downloads.
#[derive(Debug, Clone, Default)]
pub struct BlobConfig {
    /// Bucket holding source videos
    pub bucket: String,
}

/// HTTP server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_address: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            port: 8000,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_documented_contract() {
        let config = StreamcastConfig::default();
        assert_eq!(config.remux.rtsp_port, 8554);
        assert_eq!(config.remux.hls_port, 8888);
        assert_eq!(config.tunnel.hostname_suffix, ".trycloudflare.com");
        assert_eq!(config.pipeline.chunk_count, 4);
        assert_eq!(
            config.pipeline.short_video_threshold,
            Duration::from_secs(60)
        );
        assert_eq!(config.ingestion.upload_timeout, Duration::from_secs(3000));
        assert_eq!(config.server.port, 8000);
    }
}
