//! Per-feed transcode sessions.
//!
//! Each session loops one local video file into a realtime RTSP feed
//! published at the remux server's ingest port, under a serial path of its
//! own. The transcoder runs as a supervised ffmpeg process.

use std::path::{Path, PathBuf};

use rand::Rng;
use rand::distr::Alphanumeric;

use super::StreamingError;
use crate::config::TranscodeConfig;
use crate::ports;
use crate::process::SupervisedProcess;

/// Lifecycle of a stream session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Created,
    Running,
    Stopped,
}

/// One looping-file-to-RTSP transcode session.
///
/// Construction allocates a placeholder TCP port and an RTP/RTCP pair;
/// the ports are released back to the OS implicitly when the transcoder
/// exits, never re-validated.
pub struct StreamSession {
    serial: String,
    source_file: PathBuf,
    rtsp_port: u16,
    rtp_port: u16,
    rtcp_port: u16,
    local_rtsp_url: String,
    config: TranscodeConfig,
    transcoder: Option<SupervisedProcess>,
    state: SessionState,
}

impl StreamSession {
    /// Creates a session for `source_file`, publishing to the remux server's
    /// RTSP ingest port. `feed_name` overrides the generated serial so preset
    /// feeds get stable playback paths.
    ///
    /// # Errors
    ///
    /// - `StreamingError::Ports` - No free port pair available
    pub fn new(
        source_file: PathBuf,
        feed_name: Option<String>,
        ingest_rtsp_port: u16,
        config: TranscodeConfig,
    ) -> Result<Self, StreamingError> {
        let rtsp_port = ports::allocate_tcp_port()?;
        let (rtp_port, rtcp_port) = ports::allocate_rtp_rtcp_pair()?;

        let serial = feed_name.unwrap_or_else(generate_serial);
        let local_rtsp_url = format!("rtsp://127.0.0.1:{ingest_rtsp_port}/{serial}");

        tracing::debug!(
            "Initialized stream session {serial} with ports {rtsp_port}, {rtp_port}, {rtcp_port}"
        );

        Ok(Self {
            serial,
            source_file,
            rtsp_port,
            rtp_port,
            rtcp_port,
            local_rtsp_url,
            config,
            transcoder: None,
            state: SessionState::Created,
        })
    }

    /// Starts the looping transcode toward the local RTSP sink.
    ///
    /// Waits a short warm-up interval after spawning; a transcoder that has
    /// already exited by then is reported as a spawn failure and is not
    /// retried automatically.
    ///
    /// # Errors
    ///
    /// - `StreamingError::ProcessSpawn` - ffmpeg missing, or exited during warm-up
    pub async fn start(&mut self) -> Result<(), StreamingError> {
        if self.transcoder.is_some() {
            return Ok(());
        }

        let args = transcode_args(&self.source_file, &self.local_rtsp_url, &self.config);
        let name = format!("ffmpeg:{}", self.serial);
        let mut process =
            SupervisedProcess::spawn(&name, self.config.ffmpeg_binary.as_os_str(), &args)?;

        tokio::time::sleep(self.config.warmup).await;

        if let Some(code) = process.exit_code() {
            return Err(StreamingError::ProcessSpawn {
                reason: format!(
                    "transcoder for {} exited during warm-up with code {code}",
                    self.serial
                ),
            });
        }

        self.transcoder = Some(process);
        self.state = SessionState::Running;
        tracing::info!("Started RTSP stream at {}", self.local_rtsp_url);
        Ok(())
    }

    /// Stops the transcoder with a bounded grace period, then a kill.
    ///
    /// Safe to call repeatedly - later calls observe no active process.
    pub async fn cleanup(&mut self) {
        if let Some(mut process) = self.transcoder.take() {
            process.terminate(self.config.stop_grace).await;
        }
        self.state = SessionState::Stopped;
    }

    pub fn serial(&self) -> &str {
        &self.serial
    }

    pub fn local_rtsp_url(&self) -> &str {
        &self.local_rtsp_url
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn rtsp_port(&self) -> u16 {
        self.rtsp_port
    }

    pub fn rtp_rtcp_ports(&self) -> (u16, u16) {
        (self.rtp_port, self.rtcp_port)
    }
}

fn generate_serial() -> String {
    rand::rng()
        .sample_iter(&Alphanumeric)
        .take(16)
        .map(char::from)
        .collect()
}

/// Builds the deterministic transcode invocation: infinite loop of a single
/// input at native pace, fixed resolution and constant frame rate, constrained
/// GOP with no B-frames or scene cuts, capped bitrate, AAC audio, RTSP output.
fn transcode_args(source: &Path, sink_url: &str, config: &TranscodeConfig) -> Vec<String> {
    let (width, height) = config.resolution;
    [
        "-hide_banner",
        "-loglevel",
        "error",
        // Input: read at native frame rate, loop forever
        "-re",
        "-stream_loop",
        "-1",
        "-i",
        &source.to_string_lossy(),
        // Video: fixed size, constant frame rate
        "-vf",
        &format!("scale={width}:{height}"),
        "-r",
        &config.frame_rate.to_string(),
        "-vsync",
        "cfr",
        "-c:v",
        "libx264",
        "-preset",
        "ultrafast",
        "-tune",
        "zerolatency",
        "-profile:v",
        "baseline",
        "-level",
        "3.1",
        "-g",
        &config.gop_size.to_string(),
        "-keyint_min",
        &config.gop_size.to_string(),
        "-bf",
        "0",
        "-x264-params",
        "scenecut=0",
        "-b:v",
        &config.video_bitrate,
        "-maxrate",
        &config.max_bitrate,
        "-bufsize",
        &config.buffer_size,
        "-pix_fmt",
        "yuv420p",
        // Audio
        "-c:a",
        "aac",
        "-b:a",
        &config.audio_bitrate,
        "-ar",
        &config.sample_rate.to_string(),
        "-ac",
        &config.channels.to_string(),
        // Output
        "-f",
        "rtsp",
        sink_url,
    ]
    .into_iter()
    .map(str::to_string)
    .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> TranscodeConfig {
        TranscodeConfig::default()
    }

    #[test]
    fn test_session_ports_hold_rtp_invariant() {
        let session = StreamSession::new(
            PathBuf::from("/videos/feed.mp4"),
            None,
            8554,
            test_config(),
        )
        .unwrap();

        let (rtp, rtcp) = session.rtp_rtcp_ports();
        assert_eq!(rtp % 2, 0);
        assert_eq!(rtcp, rtp + 1);
        assert_eq!(session.state(), SessionState::Created);
    }

    #[test]
    fn test_feed_name_becomes_serial_and_url_path() {
        let session = StreamSession::new(
            PathBuf::from("/videos/feed.mp4"),
            Some("Sewing-Machine-1".to_string()),
            8554,
            test_config(),
        )
        .unwrap();

        assert_eq!(session.serial(), "Sewing-Machine-1");
        assert_eq!(
            session.local_rtsp_url(),
            "rtsp://127.0.0.1:8554/Sewing-Machine-1"
        );
    }

    #[test]
    fn test_generated_serial_is_url_safe() {
        let session =
            StreamSession::new(PathBuf::from("/videos/feed.mp4"), None, 8554, test_config())
                .unwrap();

        assert_eq!(session.serial().len(), 16);
        assert!(session.serial().chars().all(|c| c.is_ascii_alphanumeric()));
    }

    #[test]
    fn test_transcode_args_shape() {
        let config = test_config();
        let args = transcode_args(
            Path::new("/videos/feed.mp4"),
            "rtsp://127.0.0.1:8554/abc",
            &config,
        );

        // Looping realtime input
        let loop_pos = args.iter().position(|a| a == "-stream_loop").unwrap();
        assert_eq!(args[loop_pos + 1], "-1");
        assert!(args.contains(&"-re".to_string()));

        // Fixed output format
        assert!(args.contains(&"scale=1280:720".to_string()));
        assert!(args.contains(&"cfr".to_string()));
        let bf_pos = args.iter().position(|a| a == "-bf").unwrap();
        assert_eq!(args[bf_pos + 1], "0");

        // RTSP sink is the final argument
        assert_eq!(args.last().unwrap(), "rtsp://127.0.0.1:8554/abc");
    }

    #[tokio::test]
    async fn test_cleanup_without_start_is_noop() {
        let mut session =
            StreamSession::new(PathBuf::from("/videos/feed.mp4"), None, 8554, test_config())
                .unwrap();

        session.cleanup().await;
        assert_eq!(session.state(), SessionState::Stopped);
        // Second call observes no active process and returns immediately.
        session.cleanup().await;
        assert_eq!(session.state(), SessionState::Stopped);
    }
}
