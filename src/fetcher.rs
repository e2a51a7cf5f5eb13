//! Source download through an external media extractor.

use std::{
    io::ErrorKind,
    path::{Path, PathBuf},
    time::Duration,
};

use async_trait::async_trait;
use tokio::fs;
use tokio_util::sync::CancellationToken;
use tracing::info;
use url::Url;

use crate::{error::FetchError, process::run_tool};

/// Base name of the downloaded source inside a workspace.
pub const SOURCE_STEM: &str = "source";

#[async_trait]
pub trait SourceFetcher: Send + Sync {
    /// Downloads `url` into `dest_dir` and returns the local container file.
    async fn fetch(
        &self,
        url: &Url,
        dest_dir: &Path,
        cancel: &CancellationToken,
    ) -> Result<PathBuf, FetchError>;
}

#[derive(Debug, Clone)]
pub struct YtDlpFetcher {
    binary: PathBuf,
    format: String,
    timeout: Duration,
}

impl YtDlpFetcher {
    pub fn new(binary: impl Into<PathBuf>, format: impl Into<String>, timeout: Duration) -> Self {
        Self {
            binary: binary.into(),
            format: format.into(),
            timeout,
        }
    }

    fn build_args(&self, url: &Url, dest_dir: &Path) -> Vec<String> {
        let template = dest_dir.join(format!("{SOURCE_STEM}.%(ext)s"));
        vec![
            "--no-playlist".to_string(),
            "--no-progress".to_string(),
            "--quiet".to_string(),
            "--no-warnings".to_string(),
            "-f".to_string(),
            self.format.clone(),
            "--merge-output-format".to_string(),
            "mp4".to_string(),
            "-o".to_string(),
            template.to_string_lossy().into_owned(),
            url.as_str().to_string(),
        ]
    }
}

#[async_trait]
impl SourceFetcher for YtDlpFetcher {
    async fn fetch(
        &self,
        url: &Url,
        dest_dir: &Path,
        cancel: &CancellationToken,
    ) -> Result<PathBuf, FetchError> {
        info!(url = %url, dest = %dest_dir.display(), "Downloading source");
        let args = self.build_args(url, dest_dir);
        run_tool(&self.binary, &args, self.timeout, cancel).await?;

        let source = find_source_file(dest_dir).await?;
        info!(url = %url, source = %source.display(), "Source downloaded");
        Ok(source)
    }
}

/// Locates the merged `source.mp4` written by the extractor.
pub async fn find_source_file(dir: &Path) -> Result<PathBuf, FetchError> {
    let mut entries = match fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(err) if err.kind() == ErrorKind::NotFound => return Err(FetchError::NoPlayableStream),
        Err(err) => return Err(err.into()),
    };

    let prefix = format!("{SOURCE_STEM}.");
    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name().to_string_lossy().into_owned();
        if !name.starts_with(&prefix) || !name.ends_with(".mp4") {
            continue;
        }
        let metadata = entry.metadata().await?;
        if metadata.is_file() && metadata.len() > 0 {
            return Ok(entry.path());
        }
    }

    Err(FetchError::NoPlayableStream)
}
