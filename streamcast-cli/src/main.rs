//! Streamcast CLI - stream worker entry point
//!
//! Starts the remux orchestrator (fatal on failure - the worker never runs
//! half-initialized), serves the HTTP API, and drives the orderly teardown
//! when a termination signal arrives. The signal handler only flips a flag;
//! the main task performs the actual shutdown sequence.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use streamcast_core::blobstore::{BlobStore, S3BlobStore};
use streamcast_core::config::StreamcastConfig;
use streamcast_core::pipeline::{ChunkUploader, IngestionClient, ProcessingPipeline};
use streamcast_core::streaming::RemuxOrchestrator;
use streamcast_core::tracing_setup::{CliLogLevel, init_tracing};
use streamcast_web::{AppState, PresetLibrary, cleanup_sessions, run_server};
use tokio::sync::watch;

#[derive(Parser)]
#[command(name = "streamcast")]
#[command(about = "RTSP/HLS stream worker and video-processing pipeline")]
struct Cli {
    /// Address to bind the HTTP API on
    #[arg(long, default_value = "0.0.0.0")]
    bind: String,

    /// Port for the HTTP API
    #[arg(long, default_value_t = 8000)]
    port: u16,

    /// Directory of preset video groups (one subdirectory per group)
    #[arg(long)]
    presets: Option<PathBuf>,

    /// Scratch directory for downloads and chunk output
    #[arg(long)]
    temp_dir: Option<PathBuf>,

    /// Console log level
    #[arg(long, value_enum, default_value_t = CliLogLevel::Info)]
    log_level: CliLogLevel,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    init_tracing(cli.log_level.as_tracing_level(), None)
        .map_err(|e| anyhow::anyhow!("tracing setup failed: {e}"))?;

    let mut config = StreamcastConfig::from_env();
    config.server.bind_address = cli.bind;
    config.server.port = cli.port;
    if let Some(temp_dir) = cli.temp_dir {
        config.pipeline.temp_dir = temp_dir;
    }

    let presets = match &cli.presets {
        Some(dir) => PresetLibrary::from_dir(dir)
            .with_context(|| format!("failed to load preset library from {}", dir.display()))?,
        None => PresetLibrary::new(),
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Construct shared clients once and inject them; nothing downstream
    // reaches for globals.
    let http = reqwest::Client::new();
    let blob_store: Arc<dyn BlobStore> =
        Arc::new(S3BlobStore::from_env(config.blob.bucket.clone()).await);
    let sink = Arc::new(IngestionClient::new(http.clone(), config.ingestion.clone()));
    let uploader = ChunkUploader::new(sink, shutdown_rx.clone());
    let pipeline = ProcessingPipeline::new(
        config.pipeline.clone(),
        &config.transcode,
        blob_store,
        uploader,
        http,
    );

    let orchestrator = Arc::new(RemuxOrchestrator::new(
        config.remux.clone(),
        config.tunnel.clone(),
    ));
    orchestrator
        .start()
        .await
        .context("remux orchestrator failed to start")?;

    let state = AppState::new(
        Arc::clone(&orchestrator),
        pipeline.clone(),
        presets,
        &config,
    );

    spawn_job_reaper(pipeline, config.pipeline.job_ttl, shutdown_rx.clone());

    // The signal watcher only flips the shutdown flag; teardown runs below
    // on the main task once the server loop drains.
    let signal_tx = shutdown_tx.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        tracing::info!("Shutdown signal received");
        let _ = signal_tx.send(true);
    });

    let bind: SocketAddr = format!("{}:{}", config.server.bind_address, config.server.port)
        .parse()
        .context("invalid bind address")?;

    let served = run_server(state.clone(), bind, shutdown_rx).await;

    // Reached on signal or on server failure; either way tear down children.
    let _ = shutdown_tx.send(true);
    cleanup_sessions(&state).await;
    orchestrator.shutdown().await;

    served.context("HTTP server failed")?;
    tracing::info!("Shutdown complete");
    Ok(())
}

fn spawn_job_reaper(
    pipeline: ProcessingPipeline,
    job_ttl: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(Duration::from_secs(60));
        loop {
            tokio::select! {
                _ = tick.tick() => {
                    pipeline.reap_terminal(job_ttl);
                }
                _ = shutdown.wait_for(|stop| *stop) => break,
            }
        }
    });
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!("Failed to listen for ctrl-c: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::warn!("Failed to listen for SIGTERM: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
