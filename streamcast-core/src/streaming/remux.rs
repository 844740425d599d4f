//! Remux server and tunnel orchestration.
//!
//! The orchestrator is the single writer of the shared remux config file. It
//! owns the remux-server process (which republishes registered RTSP feeds as
//! HLS) and the tunnel process that exposes the local HLS port under a
//! public URL. Every read-modify-write of the config file happens under one
//! mutex, in `start` and `add_stream` alike.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio::io::{BufReader, Lines};
use tokio::process::ChildStderr;
use tokio::sync::Mutex;

use super::StreamingError;
use crate::config::{RemuxProcessConfig, TunnelConfig};
use crate::process::{SupervisedProcess, pump_lines};

/// Shared remux server configuration, persisted as YAML.
///
/// Field names serialize to the camelCase keys the remux server expects.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemuxSettings {
    /// Segment duration; two GOPs per segment at the transcoder's pacing
    pub hls_segment_duration: String,
    /// LL-HLS part duration for faster initial load
    pub hls_part_duration: String,
    /// Segments kept in the playlist for buffer stability
    pub hls_segment_count: u32,
    pub hls_segment_max_size: String,
    pub hls_allow_origin: String,
    /// Keep the HLS muxer alive even with no clients
    pub hls_always_remux: bool,
    #[serde(default)]
    pub paths: BTreeMap<String, StreamPath>,
}

impl Default for RemuxSettings {
    fn default() -> Self {
        Self {
            hls_segment_duration: "2s".to_string(),
            hls_part_duration: "200ms".to_string(),
            hls_segment_count: 7,
            hls_segment_max_size: "50M".to_string(),
            hls_allow_origin: "*".to_string(),
            hls_always_remux: true,
            paths: BTreeMap::new(),
        }
    }
}

/// One registered stream path: where the remux server pulls the feed from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamPath {
    pub source: String,
    pub rtsp_transport: String,
}

/// Tunnel URL capture state. Set exactly once per orchestrator lifetime.
#[derive(Debug, Default)]
struct TunnelState {
    public_url: Option<String>,
}

impl TunnelState {
    fn capture(&mut self, url: String) {
        if self.public_url.is_none() {
            self.public_url = Some(url);
        }
    }
}

#[derive(Default)]
struct Inner {
    remux_process: Option<SupervisedProcess>,
    tunnel_process: Option<SupervisedProcess>,
    tunnel: TunnelState,
}

/// Owner of the remux-server and tunnel processes and single writer of the
/// shared remux config file.
pub struct RemuxOrchestrator {
    remux_config: RemuxProcessConfig,
    tunnel_config: TunnelConfig,
    inner: Mutex<Inner>,
    shutting_down: AtomicBool,
}

impl RemuxOrchestrator {
    pub fn new(remux_config: RemuxProcessConfig, tunnel_config: TunnelConfig) -> Self {
        Self {
            remux_config,
            tunnel_config,
            inner: Mutex::new(Inner::default()),
            shutting_down: AtomicBool::new(false),
        }
    }

    /// Starts the remux server and tunnel, capturing the tunnel's public URL.
    ///
    /// The whole sequence runs under the config mutex: write the initial
    /// settings file, spawn the remux server, settle, spawn the tunnel, and
    /// scan its error stream for the assigned public hostname. Capture is
    /// bounded by the configured timeout and by tunnel exit; both are fatal.
    ///
    /// # Errors
    ///
    /// - `StreamingError::Config` - Binary or config path invalid
    /// - `StreamingError::ProcessSpawn` - A child failed to spawn
    /// - `StreamingError::TunnelCapture` - No public URL before timeout or tunnel exit
    pub async fn start(&self) -> Result<(), StreamingError> {
        ensure_binary(&self.remux_config.binary)?;
        ensure_binary(&self.tunnel_config.binary)?;

        tracing::info!("Starting remux server");

        let mut inner = self.inner.lock().await;
        if inner.remux_process.is_some() {
            return Err(StreamingError::Config {
                reason: "orchestrator already started".to_string(),
            });
        }

        write_settings(&self.remux_config.config_path, &RemuxSettings::default()).await?;

        let remux_process = SupervisedProcess::spawn(
            "remux",
            self.remux_config.binary.as_os_str(),
            [self.remux_config.config_path.as_os_str()],
        )?;
        inner.remux_process = Some(remux_process);

        tokio::time::sleep(self.remux_config.settle).await;

        tracing::info!("Opening public tunnel");

        let tunnel_args = [
            "tunnel".to_string(),
            "--url".to_string(),
            format!("http://localhost:{}", self.remux_config.hls_port),
            "--no-autoupdate".to_string(),
            "--no-tls-verify".to_string(),
        ];
        let (tunnel_process, stderr_lines) = SupervisedProcess::spawn_with_stderr(
            "tunnel",
            self.tunnel_config.binary.as_os_str(),
            &tunnel_args,
        )?;
        inner.tunnel_process = Some(tunnel_process);

        let url = capture_public_url(
            stderr_lines,
            &self.tunnel_config.hostname_suffix,
            self.tunnel_config.capture_timeout,
        )
        .await?;

        tracing::info!("Remux server started with public tunnel: {url}");
        inner.tunnel.capture(url);
        Ok(())
    }

    /// Registers `local_rtsp_url` under `name` in the remux config and
    /// returns the public playback URL.
    ///
    /// The read-modify-write of the config file is serialized by the same
    /// mutex as `start`, so no other writer may race it. On Unix the remux
    /// process is nudged with SIGUSR1; elsewhere it must pick the change up
    /// via its own hot reload or next restart.
    ///
    /// # Errors
    ///
    /// - `StreamingError::NotStarted` - No tunnel URL captured yet
    /// - `StreamingError::Io` / `ConfigFormat` - Config file unreadable
    pub async fn add_stream(
        &self,
        local_rtsp_url: &str,
        name: &str,
    ) -> Result<String, StreamingError> {
        tracing::info!("Registering stream {name} with source {local_rtsp_url}");

        let mut inner = self.inner.lock().await;
        let public_url = inner
            .tunnel
            .public_url
            .clone()
            .ok_or(StreamingError::NotStarted)?;

        let mut settings = read_settings(&self.remux_config.config_path).await?;
        settings.paths.insert(
            name.to_string(),
            StreamPath {
                source: local_rtsp_url.to_string(),
                rtsp_transport: "tcp".to_string(),
            },
        );
        write_settings(&self.remux_config.config_path, &settings).await?;

        #[cfg(unix)]
        if let Some(remux_process) = inner.remux_process.as_ref()
            && let Err(e) = remux_process.send_signal(nix::sys::signal::Signal::SIGUSR1)
        {
            tracing::warn!("Config reload signal failed: {e}");
        }

        let playback_url = format!("{public_url}/{name}/index.m3u8");
        tracing::info!("Stream {name} available at {playback_url}");
        Ok(playback_url)
    }

    /// Returns the captured public tunnel URL, if startup has completed.
    pub async fn public_url(&self) -> Option<String> {
        self.inner.lock().await.tunnel.public_url.clone()
    }

    /// Terminates the tunnel and remux processes, each with bounded
    /// grace+kill. Later calls are no-ops.
    pub async fn shutdown(&self) {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            return;
        }

        tracing::info!("Shutting down remux orchestrator");

        let mut inner = self.inner.lock().await;
        if let Some(mut tunnel) = inner.tunnel_process.take() {
            tunnel.terminate(self.tunnel_config.stop_grace).await;
        }
        if let Some(mut remux) = inner.remux_process.take() {
            remux.terminate(self.remux_config.stop_grace).await;
        }

        tracing::info!("Remux orchestrator shutdown complete");
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }
}

fn ensure_binary(path: &Path) -> Result<(), StreamingError> {
    if path.is_absolute() && !path.exists() {
        return Err(StreamingError::Config {
            reason: format!("binary not found: {}", path.display()),
        });
    }
    Ok(())
}

async fn read_settings(path: &Path) -> Result<RemuxSettings, StreamingError> {
    let raw = tokio::fs::read_to_string(path).await?;
    Ok(serde_yaml::from_str(&raw)?)
}

async fn write_settings(path: &Path, settings: &RemuxSettings) -> Result<(), StreamingError> {
    let raw = serde_yaml::to_string(settings)?;
    tokio::fs::write(path, raw).await?;
    Ok(())
}

/// Scans tunnel stderr for the assigned public URL, bounded by `deadline`.
///
/// Once captured, the remaining stderr lines keep flowing to the log so the
/// tunnel's pipe never fills.
async fn capture_public_url(
    mut lines: Lines<BufReader<ChildStderr>>,
    hostname_suffix: &str,
    deadline: Duration,
) -> Result<String, StreamingError> {
    let pattern = url_pattern(hostname_suffix)?;

    let scan = async {
        while let Some(line) = lines.next_line().await? {
            tracing::info!(target: "streamcast::subprocess", "[tunnel] {line}");
            if let Some(url) = find_public_url(&pattern, &line) {
                return Ok::<_, std::io::Error>(Some(url));
            }
        }
        Ok(None)
    };

    let outcome = tokio::time::timeout(deadline, scan).await;
    match outcome {
        Err(_) => Err(StreamingError::TunnelCapture {
            reason: format!("no public URL within {}s", deadline.as_secs()),
        }),
        Ok(Err(e)) => Err(StreamingError::TunnelCapture {
            reason: format!("failed reading tunnel output: {e}"),
        }),
        Ok(Ok(None)) => Err(StreamingError::TunnelCapture {
            reason: "tunnel exited before announcing a public URL".to_string(),
        }),
        Ok(Ok(Some(url))) => {
            pump_lines("tunnel".to_string(), lines);
            Ok(url)
        }
    }
}

fn url_pattern(hostname_suffix: &str) -> Result<Regex, StreamingError> {
    Regex::new(&format!(
        "https://[A-Za-z0-9][A-Za-z0-9.-]*{}",
        regex::escape(hostname_suffix)
    ))
    .map_err(|e| StreamingError::Config {
        reason: format!("invalid tunnel hostname suffix: {e}"),
    })
}

fn find_public_url(pattern: &Regex, line: &str) -> Option<String> {
    pattern.find(line).map(|m| m.as_str().to_string())
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;
    use crate::config::{RemuxProcessConfig, TunnelConfig};

    fn orchestrator_with_config(config_path: std::path::PathBuf) -> RemuxOrchestrator {
        let remux_config = RemuxProcessConfig {
            config_path,
            ..RemuxProcessConfig::default()
        };
        RemuxOrchestrator::new(remux_config, TunnelConfig::default())
    }

    #[test]
    fn test_settings_yaml_round_trip() {
        let mut settings = RemuxSettings::default();
        settings.paths.insert(
            "Feed-1".to_string(),
            StreamPath {
                source: "rtsp://127.0.0.1:8554/Feed-1".to_string(),
                rtsp_transport: "tcp".to_string(),
            },
        );

        let raw = serde_yaml::to_string(&settings).unwrap();
        assert!(raw.contains("hlsSegmentDuration: 2s"));
        assert!(raw.contains("hlsAlwaysRemux: true"));
        assert!(raw.contains("rtspTransport: tcp"));

        let parsed: RemuxSettings = serde_yaml::from_str(&raw).unwrap();
        assert_eq!(parsed, settings);
    }

    #[test]
    fn test_settings_without_paths_key_defaults_empty() {
        let raw = "hlsSegmentDuration: 2s\nhlsPartDuration: 200ms\nhlsSegmentCount: 7\n\
                   hlsSegmentMaxSize: 50M\nhlsAllowOrigin: '*'\nhlsAlwaysRemux: true\n";
        let parsed: RemuxSettings = serde_yaml::from_str(raw).unwrap();
        assert!(parsed.paths.is_empty());
    }

    #[test]
    fn test_find_public_url_in_tunnel_banner() {
        let pattern = url_pattern(".trycloudflare.com").unwrap();
        let line = "2025-01-01T00:00:00Z INF |  https://odd-word-pair.trycloudflare.com  |";
        assert_eq!(
            find_public_url(&pattern, line).as_deref(),
            Some("https://odd-word-pair.trycloudflare.com")
        );

        assert_eq!(find_public_url(&pattern, "INF registered tunnel"), None);
        assert_eq!(
            find_public_url(&pattern, "https://example.com is not a tunnel"),
            None
        );
    }

    #[tokio::test]
    async fn test_add_stream_before_start_is_rejected() {
        let dir = tempdir().unwrap();
        let orchestrator = orchestrator_with_config(dir.path().join("remux.yml"));

        let result = orchestrator
            .add_stream("rtsp://127.0.0.1:8554/feed", "feed")
            .await;
        assert!(matches!(result, Err(StreamingError::NotStarted)));
    }

    #[tokio::test]
    async fn test_add_stream_inserts_path_and_builds_playback_url() {
        let dir = tempdir().unwrap();
        let config_path = dir.path().join("remux.yml");
        let orchestrator = orchestrator_with_config(config_path.clone());

        write_settings(&config_path, &RemuxSettings::default())
            .await
            .unwrap();
        orchestrator
            .inner
            .lock()
            .await
            .tunnel
            .capture("https://unit-test.trycloudflare.com".to_string());

        let playback_url = orchestrator
            .add_stream("rtsp://127.0.0.1:8554/Feed-1", "Feed-1")
            .await
            .unwrap();
        assert_eq!(
            playback_url,
            "https://unit-test.trycloudflare.com/Feed-1/index.m3u8"
        );

        let settings = read_settings(&config_path).await.unwrap();
        let path = settings.paths.get("Feed-1").unwrap();
        assert_eq!(path.source, "rtsp://127.0.0.1:8554/Feed-1");
        assert_eq!(path.rtsp_transport, "tcp");
    }

    #[tokio::test]
    async fn test_add_stream_overwrites_existing_name() {
        let dir = tempdir().unwrap();
        let config_path = dir.path().join("remux.yml");
        let orchestrator = orchestrator_with_config(config_path.clone());

        write_settings(&config_path, &RemuxSettings::default())
            .await
            .unwrap();
        orchestrator
            .inner
            .lock()
            .await
            .tunnel
            .capture("https://unit-test.trycloudflare.com".to_string());

        orchestrator
            .add_stream("rtsp://127.0.0.1:8554/old", "Feed-1")
            .await
            .unwrap();
        orchestrator
            .add_stream("rtsp://127.0.0.1:8554/new", "Feed-1")
            .await
            .unwrap();

        let settings = read_settings(&config_path).await.unwrap();
        assert_eq!(settings.paths.len(), 1);
        assert_eq!(
            settings.paths.get("Feed-1").unwrap().source,
            "rtsp://127.0.0.1:8554/new"
        );
    }

    #[tokio::test]
    async fn test_tunnel_url_captured_exactly_once() {
        let mut tunnel = TunnelState::default();
        tunnel.capture("https://first.trycloudflare.com".to_string());
        tunnel.capture("https://second.trycloudflare.com".to_string());
        assert_eq!(
            tunnel.public_url.as_deref(),
            Some("https://first.trycloudflare.com")
        );
    }
}
