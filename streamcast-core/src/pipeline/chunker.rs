//! Duration probing and stream-copy segmentation of downloaded videos.

use std::path::{Path, PathBuf};
use std::time::Duration;

use super::PipelineError;
use crate::process::SupervisedProcess;

/// Chunk length for a video of `total` duration: short videos become a
/// single chunk spanning the whole file, everything else is split into
/// exactly `chunk_count` equal-duration chunks.
pub fn chunk_duration(total: Duration, threshold: Duration, chunk_count: u32) -> Duration {
    if total < threshold || chunk_count == 0 {
        total
    } else {
        total / chunk_count
    }
}

/// Probes the container duration of `input` via ffprobe.
///
/// # Errors
///
/// - `PipelineError::Segmentation` - ffprobe failed or reported no duration
pub async fn probe_duration(ffprobe: &Path, input: &Path) -> Result<Duration, PipelineError> {
    let output = tokio::process::Command::new(ffprobe)
        .args([
            "-v",
            "error",
            "-show_entries",
            "format=duration",
            "-of",
            "default=noprint_wrappers=1:nokey=1",
        ])
        .arg(input)
        .output()
        .await
        .map_err(|e| PipelineError::Segmentation {
            reason: format!("failed to run ffprobe: {e}"),
        })?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(PipelineError::Segmentation {
            reason: format!("ffprobe failed for {}: {stderr}", input.display()),
        });
    }

    let seconds: f64 = String::from_utf8_lossy(&output.stdout)
        .trim()
        .parse()
        .map_err(|e| PipelineError::Segmentation {
            reason: format!("unparseable duration from ffprobe: {e}"),
        })?;

    Ok(Duration::from_secs_f64(seconds))
}

/// Splits `input` into chunks of `chunk_len` under `output_dir` without
/// re-encoding, resetting timestamps per chunk. Bounded by `ceiling`; a
/// run that exceeds it is terminated and reported as failed.
///
/// # Errors
///
/// - `PipelineError::Segmentation` - ffmpeg failed, timed out, or produced
///   zero chunk files
pub async fn segment(
    ffmpeg: &Path,
    input: &Path,
    output_dir: &Path,
    chunk_len: Duration,
    ceiling: Duration,
) -> Result<Vec<PathBuf>, PipelineError> {
    tokio::fs::create_dir_all(output_dir).await?;

    let stem = input
        .file_stem()
        .map(|stem| stem.to_string_lossy().replace(' ', "_"))
        .unwrap_or_else(|| "video".to_string());
    let pattern = output_dir.join(format!("{stem}_chunk_%04d.mp4"));

    let args = [
        "-hide_banner".to_string(),
        "-loglevel".to_string(),
        "error".to_string(),
        "-i".to_string(),
        input.to_string_lossy().into_owned(),
        "-c".to_string(),
        "copy".to_string(),
        "-map".to_string(),
        "0".to_string(),
        "-segment_time".to_string(),
        format!("{}", chunk_len.as_secs_f64()),
        "-f".to_string(),
        "segment".to_string(),
        "-reset_timestamps".to_string(),
        "1".to_string(),
        pattern.to_string_lossy().into_owned(),
    ];

    tracing::info!(
        "Segmenting {} into {:.1}s chunks",
        input.display(),
        chunk_len.as_secs_f64()
    );

    let mut process = SupervisedProcess::spawn("ffmpeg-chunk", ffmpeg.as_os_str(), &args)?;

    let exit_code = match tokio::time::timeout(ceiling, process.wait()).await {
        Ok(code) => code,
        Err(_) => {
            process.terminate(Duration::from_secs(2)).await;
            return Err(PipelineError::Segmentation {
                reason: format!("segmentation exceeded {}s ceiling", ceiling.as_secs()),
            });
        }
    };

    match exit_code {
        Some(0) => {}
        Some(code) => {
            return Err(PipelineError::Segmentation {
                reason: format!("segmenter exited with code {code}"),
            });
        }
        None => {
            return Err(PipelineError::Segmentation {
                reason: "segmenter exit status unavailable".to_string(),
            });
        }
    }

    let chunks = collect_chunks(output_dir).await?;
    if chunks.is_empty() {
        return Err(PipelineError::Segmentation {
            reason: format!("no chunk files were produced in {}", output_dir.display()),
        });
    }

    tracing::info!("Produced {} chunk files", chunks.len());
    Ok(chunks)
}

async fn collect_chunks(output_dir: &Path) -> Result<Vec<PathBuf>, PipelineError> {
    let mut chunks = Vec::new();
    let mut entries = tokio::fs::read_dir(output_dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if path.extension().is_some_and(|ext| ext == "mp4") {
            chunks.push(path);
        }
    }
    chunks.sort();
    Ok(chunks)
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;

    #[test]
    fn test_long_video_splits_into_four_equal_chunks() {
        let chunk = chunk_duration(
            Duration::from_secs(600),
            Duration::from_secs(60),
            4,
        );
        assert_eq!(chunk, Duration::from_secs(150));
    }

    #[test]
    fn test_short_video_is_a_single_chunk() {
        let chunk = chunk_duration(Duration::from_secs(45), Duration::from_secs(60), 4);
        assert_eq!(chunk, Duration::from_secs(45));
    }

    #[test]
    fn test_threshold_boundary_splits() {
        let chunk = chunk_duration(Duration::from_secs(60), Duration::from_secs(60), 4);
        assert_eq!(chunk, Duration::from_secs(15));
    }

    #[tokio::test]
    async fn test_collect_chunks_sorted_and_filtered() {
        let dir = tempdir().unwrap();
        for name in ["b_chunk_0001.mp4", "a_chunk_0000.mp4", "ignore.txt"] {
            std::fs::write(dir.path().join(name), b"x").unwrap();
        }

        let chunks = collect_chunks(dir.path()).await.unwrap();
        let names: Vec<_> = chunks
            .iter()
            .map(|path| path.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, ["a_chunk_0000.mp4", "b_chunk_0001.mp4"]);
    }

    #[tokio::test]
    async fn test_segment_rejects_failing_command() {
        let dir = tempdir().unwrap();
        // `false` exits nonzero immediately, standing in for a broken ffmpeg.
        let result = segment(
            Path::new("false"),
            Path::new("/nonexistent/input.mp4"),
            dir.path(),
            Duration::from_secs(10),
            Duration::from_secs(5),
        )
        .await;

        assert!(matches!(
            result,
            Err(PipelineError::Segmentation { .. })
        ));
    }
}
