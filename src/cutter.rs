//! Clip extraction through an external transcoder.

use std::{
    ffi::OsStr,
    path::{Path, PathBuf},
    time::Duration,
};

use async_trait::async_trait;
use tokio::fs;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::{error::CutError, process::run_tool};

#[derive(Debug, Clone)]
pub struct CutRequest {
    pub source: PathBuf,
    pub start_secs: u64,
    pub duration_secs: u64,
    pub output: PathBuf,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CutOutput {
    pub path: PathBuf,
    /// Length actually written; shorter than requested when the source ends
    /// early.
    pub duration_secs: f64,
}

#[async_trait]
pub trait ClipCutter: Send + Sync {
    async fn cut(&self, request: &CutRequest, cancel: &CancellationToken)
        -> Result<CutOutput, CutError>;
}

#[derive(Debug, Clone)]
pub struct FfmpegCutter {
    ffmpeg: PathBuf,
    ffprobe: PathBuf,
    timeout: Duration,
}

impl FfmpegCutter {
    pub fn new(ffmpeg: impl Into<PathBuf>, ffprobe: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            ffmpeg: ffmpeg.into(),
            ffprobe: ffprobe.into(),
            timeout,
        }
    }

    async fn probe_duration(
        &self,
        source: &Path,
        cancel: &CancellationToken,
    ) -> Result<f64, CutError> {
        let args = [
            OsStr::new("-v"),
            OsStr::new("error"),
            OsStr::new("-show_entries"),
            OsStr::new("format=duration"),
            OsStr::new("-of"),
            OsStr::new("default=noprint_wrappers=1:nokey=1"),
            source.as_os_str(),
        ];
        let output = run_tool(&self.ffprobe, args, self.timeout, cancel)
            .await
            .map_err(|err| match CutError::from(err) {
                CutError::Transcoder { stderr, .. } => CutError::Probe(stderr),
                other => other,
            })?;

        parse_probe_duration(&output.stdout)
            .ok_or_else(|| CutError::Probe(format!("unreadable duration {:?}", output.stdout.trim())))
    }
}

#[async_trait]
impl ClipCutter for FfmpegCutter {
    async fn cut(
        &self,
        request: &CutRequest,
        cancel: &CancellationToken,
    ) -> Result<CutOutput, CutError> {
        let source_secs = self.probe_duration(&request.source, cancel).await?;
        let effective = effective_duration(request.start_secs, request.duration_secs, source_secs)?;

        if effective + f64::EPSILON < request.duration_secs as f64 {
            info!(
                requested = request.duration_secs,
                available = effective,
                "Source shorter than requested clip, truncating"
            );
        }

        let args = ffmpeg_args(&request.source, request.start_secs, effective, &request.output);
        run_tool(&self.ffmpeg, &args, self.timeout, cancel).await?;

        let written = fs::metadata(&request.output).await.map(|m| m.len()).unwrap_or(0);
        if written == 0 {
            return Err(CutError::Transcoder {
                exit_code: Some(0),
                stderr: format!("no output written to {}", request.output.display()),
            });
        }

        debug!(output = %request.output.display(), bytes = written, "Clip written");
        Ok(CutOutput {
            path: request.output.clone(),
            duration_secs: effective,
        })
    }
}

/// Clamps the requested window to what the source can provide.
pub fn effective_duration(start_secs: u64, duration_secs: u64, source_secs: f64) -> Result<f64, CutError> {
    let remaining = source_secs - start_secs as f64;
    if remaining <= 0.0 {
        return Err(CutError::SourceExhausted {
            start_secs,
            source_secs,
        });
    }
    Ok(remaining.min(duration_secs as f64))
}

fn parse_probe_duration(stdout: &str) -> Option<f64> {
    stdout
        .lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .and_then(|line| line.parse::<f64>().ok())
        .filter(|secs| secs.is_finite() && *secs > 0.0)
}

pub fn ffmpeg_args(source: &Path, start_secs: u64, duration_secs: f64, output: &Path) -> Vec<String> {
    vec![
        "-y".to_string(),
        "-v".to_string(),
        "error".to_string(),
        "-ss".to_string(),
        start_secs.to_string(),
        "-i".to_string(),
        source.to_string_lossy().into_owned(),
        "-t".to_string(),
        format!("{duration_secs:.3}"),
        "-c:v".to_string(),
        "libx264".to_string(),
        "-c:a".to_string(),
        "aac".to_string(),
        "-movflags".to_string(),
        "+faststart".to_string(),
        output.to_string_lossy().into_owned(),
    ]
}

/// Workspace file name for a clip of `duration_secs`.
pub fn clip_file_name(duration_secs: u64) -> String {
    if duration_secs % 60 == 0 {
        format!("clip_{}min.mp4", duration_secs / 60)
    } else {
        format!("clip_{duration_secs}s.mp4")
    }
}
