//! Token → clip file registry with time-bounded retention.
//!
//! Registered files are moved out of the job workspace into the registry's
//! own storage directory, one backing file per token, so they outlive
//! workspace release. Expired entries are swept by a background worker.

use std::{
    collections::HashMap,
    io::ErrorKind,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use anyhow::{Context, Result};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use tokio::{fs, sync::RwLock, time::Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::ApiError;

#[derive(Debug, Clone)]
pub struct ArtifactInfo {
    pub token: String,
    pub job_id: String,
    pub file_name: String,
    pub path: PathBuf,
    pub size_bytes: u64,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug)]
struct ArtifactEntry {
    info: ArtifactInfo,
    deadline: Instant,
}

impl ArtifactEntry {
    fn is_expired(&self, now: Instant) -> bool {
        now >= self.deadline
    }
}

#[derive(Debug)]
pub struct ArtifactRegistry {
    root: PathBuf,
    entries: RwLock<HashMap<String, ArtifactEntry>>,
}

impl ArtifactRegistry {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Empties the storage directory. Entries are not persisted, so anything
    /// found there at startup is unreachable.
    pub async fn reset_storage(&self) -> Result<()> {
        match fs::remove_dir_all(&self.root).await {
            Ok(()) => info!(root = %self.root.display(), "Cleared stale artifact storage"),
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => {
                return Err(err).with_context(|| {
                    format!("Failed to clear artifact root {}", self.root.display())
                })
            }
        }
        fs::create_dir_all(&self.root).await.with_context(|| {
            format!("Failed to create artifact root at {}", self.root.display())
        })
    }

    /// Moves `source` into registry storage and issues a token for it.
    pub async fn register(
        &self,
        job_id: &str,
        source: &Path,
        file_name: &str,
        ttl: Duration,
    ) -> Result<ArtifactInfo> {
        let token = Uuid::new_v4().simple().to_string();
        let extension = source
            .extension()
            .map(|ext| ext.to_string_lossy().into_owned())
            .unwrap_or_else(|| "mp4".to_string());
        let stored_path = self.root.join(format!("{token}.{extension}"));

        let staged = StagedFile::new(stored_path.clone());
        move_file(source, &stored_path).await?;

        let size_bytes = fs::metadata(&stored_path)
            .await
            .with_context(|| format!("Failed to stat {}", stored_path.display()))?
            .len();

        let created_at = Utc::now();
        let expires_at = created_at
            + ChronoDuration::from_std(ttl).unwrap_or_else(|_| ChronoDuration::hours(1));
        let info = ArtifactInfo {
            token: token.clone(),
            job_id: job_id.to_string(),
            file_name: file_name.to_string(),
            path: stored_path,
            size_bytes,
            created_at,
            expires_at,
        };

        self.entries.write().await.insert(
            token.clone(),
            ArtifactEntry {
                info: info.clone(),
                deadline: Instant::now() + ttl,
            },
        );
        staged.keep();

        info!(
            job_id = %job_id,
            token = %token,
            file = %file_name,
            size_bytes,
            "Artifact registered"
        );
        Ok(info)
    }

    pub async fn resolve(&self, token: &str) -> Result<PathBuf, ApiError> {
        let entries = self.entries.read().await;
        live_entry(&entries, token).map(|entry| entry.info.path.clone())
    }

    /// Resolves and opens the backing file while holding the read lock, so a
    /// concurrent sweep cannot unlink it in between.
    pub async fn open(&self, token: &str) -> Result<(fs::File, ArtifactInfo), ApiError> {
        let entries = self.entries.read().await;
        let entry = live_entry(&entries, token)?;
        let file = fs::File::open(&entry.info.path).await.map_err(|err| {
            if err.kind() == ErrorKind::NotFound {
                ApiError::NotFound(format!("Artifact {token} not found"))
            } else {
                ApiError::Internal(anyhow::Error::new(err).context("Failed to open artifact"))
            }
        })?;
        Ok((file, entry.info.clone()))
    }

    /// Drops every entry registered for `job_id`, including tokens the job
    /// never got to record.
    pub async fn revoke_job(&self, job_id: &str) -> usize {
        let revoked: Vec<ArtifactEntry> = {
            let mut entries = self.entries.write().await;
            let tokens: Vec<String> = entries
                .iter()
                .filter(|(_, entry)| entry.info.job_id == job_id)
                .map(|(token, _)| token.clone())
                .collect();
            tokens
                .iter()
                .filter_map(|token| entries.remove(token))
                .collect()
        };

        for entry in &revoked {
            if let Err(err) = delete_file_if_exists(&entry.info.path).await {
                warn!(
                    job_id = %job_id,
                    token = %entry.info.token,
                    "Failed to delete revoked artifact: {err:#}"
                );
            }
        }
        if !revoked.is_empty() {
            debug!(job_id = %job_id, revoked = revoked.len(), "Job artifacts revoked");
        }
        revoked.len()
    }

    pub async fn sweep_expired(&self) -> usize {
        let now = Instant::now();
        let expired: Vec<ArtifactEntry> = {
            let mut entries = self.entries.write().await;
            let tokens: Vec<String> = entries
                .iter()
                .filter(|(_, entry)| entry.is_expired(now))
                .map(|(token, _)| token.clone())
                .collect();
            tokens
                .iter()
                .filter_map(|token| entries.remove(token))
                .collect()
        };

        for entry in &expired {
            info!(
                job_id = %entry.info.job_id,
                token = %entry.info.token,
                "Expiring artifact"
            );
            if let Err(err) = delete_file_if_exists(&entry.info.path).await {
                warn!(
                    "Failed to delete expired artifact {}: {err:#}",
                    entry.info.path.display()
                );
            }
        }

        expired.len()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }
}

/// A file moved into storage but not yet reachable through a token. Deleted
/// on drop unless kept, so an interrupted registration leaves nothing behind.
struct StagedFile {
    path: Option<PathBuf>,
}

impl StagedFile {
    fn new(path: PathBuf) -> Self {
        Self { path: Some(path) }
    }

    fn keep(mut self) {
        self.path = None;
    }
}

impl Drop for StagedFile {
    fn drop(&mut self) {
        let Some(path) = self.path.take() else {
            return;
        };
        for leftover in [path.with_extension("partial"), path] {
            match std::fs::remove_file(&leftover) {
                Ok(()) => debug!(path = %leftover.display(), "Discarded unregistered artifact"),
                Err(err) if err.kind() == ErrorKind::NotFound => {}
                Err(err) => warn!("Failed to discard {}: {err}", leftover.display()),
            }
        }
    }
}

fn live_entry<'a>(
    entries: &'a HashMap<String, ArtifactEntry>,
    token: &str,
) -> Result<&'a ArtifactEntry, ApiError> {
    entries
        .get(token)
        .filter(|entry| !entry.is_expired(Instant::now()))
        .ok_or_else(|| ApiError::NotFound(format!("Artifact {token} not found or expired")))
}

pub fn spawn_cleanup_worker(registry: Arc<ArtifactRegistry>, interval: Duration) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            let removed = registry.sweep_expired().await;
            if removed > 0 {
                info!(removed, "Artifact sweep finished");
            }
        }
    });
}

/// Renames `src` to `dst`, falling back to copy and delete when the two live
/// on different filesystems.
pub async fn move_file(src: &Path, dst: &Path) -> Result<()> {
    if let Some(parent) = dst.parent() {
        fs::create_dir_all(parent)
            .await
            .with_context(|| format!("Failed to create directory {}", parent.display()))?;
    }

    match fs::rename(src, dst).await {
        Ok(()) => Ok(()),
        Err(err) if is_cross_device_error(&err) => {
            debug!(
                "Cross-device rename, copying {} -> {}",
                src.display(),
                dst.display()
            );
            let partial = dst.with_extension("partial");
            fs::copy(src, &partial)
                .await
                .with_context(|| format!("Failed to copy {}", src.display()))?;
            fs::rename(&partial, dst)
                .await
                .with_context(|| format!("Failed to finalize {}", dst.display()))?;
            delete_file_if_exists(src).await
        }
        Err(err) => Err(err).with_context(|| {
            format!("Failed to move {} to {}", src.display(), dst.display())
        }),
    }
}

fn is_cross_device_error(err: &std::io::Error) -> bool {
    // EXDEV
    err.raw_os_error() == Some(18)
}

pub async fn delete_file_if_exists(path: &Path) -> Result<()> {
    match fs::remove_file(path).await {
        Ok(_) => Ok(()),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err).with_context(|| format!("Failed to delete {}", path.display())),
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::AsyncReadExt;

    use super::*;

    async fn registry_with_clip(content: &[u8]) -> (tempfile::TempDir, ArtifactRegistry, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let registry = ArtifactRegistry::new(dir.path().join("artifacts"));
        registry.reset_storage().await.unwrap();
        let clip = dir.path().join("clip_1min.mp4");
        fs::write(&clip, content).await.unwrap();
        (dir, registry, clip)
    }

    #[tokio::test]
    async fn register_moves_file_out_of_the_workspace() {
        let (_dir, registry, clip) = registry_with_clip(b"frames").await;

        let info = registry
            .register("job-1", &clip, "clip_1min.mp4", Duration::from_secs(60))
            .await
            .unwrap();

        assert!(!clip.exists());
        assert!(info.path.starts_with(registry.root()));
        assert_eq!(info.size_bytes, 6);
        assert_eq!(info.token.len(), 32);
        assert_eq!(registry.resolve(&info.token).await.unwrap(), info.path);

        let (mut file, opened) = registry.open(&info.token).await.unwrap();
        let mut body = Vec::new();
        file.read_to_end(&mut body).await.unwrap();
        assert_eq!(body, b"frames");
        assert_eq!(opened.file_name, "clip_1min.mp4");
    }

    #[tokio::test]
    async fn tokens_are_unique_per_registration() {
        let dir = tempfile::tempdir().unwrap();
        let registry = ArtifactRegistry::new(dir.path().join("artifacts"));
        let a = dir.path().join("a.mp4");
        let b = dir.path().join("b.mp4");
        fs::write(&a, b"a").await.unwrap();
        fs::write(&b, b"b").await.unwrap();

        let first = registry
            .register("job", &a, "a.mp4", Duration::from_secs(60))
            .await
            .unwrap();
        let second = registry
            .register("job", &b, "b.mp4", Duration::from_secs(60))
            .await
            .unwrap();

        assert_ne!(first.token, second.token);
        assert_ne!(first.path, second.path);
    }

    #[tokio::test]
    async fn unknown_token_is_not_found() {
        let (_dir, registry, _clip) = registry_with_clip(b"x").await;
        assert!(matches!(
            registry.resolve("deadbeef").await,
            Err(ApiError::NotFound(_))
        ));
        assert!(matches!(
            registry.open("deadbeef").await,
            Err(ApiError::NotFound(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn token_resolves_until_ttl_then_expires() {
        let (_dir, registry, clip) = registry_with_clip(b"frames").await;
        let info = registry
            .register("job-1", &clip, "clip_1min.mp4", Duration::from_secs(3600))
            .await
            .unwrap();

        tokio::time::advance(Duration::from_secs(3599)).await;
        assert!(registry.resolve(&info.token).await.is_ok());
        assert_eq!(registry.sweep_expired().await, 0);

        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(matches!(
            registry.resolve(&info.token).await,
            Err(ApiError::NotFound(_))
        ));

        assert_eq!(registry.sweep_expired().await, 1);
        assert!(!info.path.exists());
        assert_eq!(registry.len().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_keeps_live_entries_and_their_files() {
        let dir = tempfile::tempdir().unwrap();
        let registry = ArtifactRegistry::new(dir.path().join("artifacts"));
        let short = dir.path().join("short.mp4");
        let long = dir.path().join("long.mp4");
        fs::write(&short, b"s").await.unwrap();
        fs::write(&long, b"l").await.unwrap();

        let short = registry
            .register("job", &short, "short.mp4", Duration::from_secs(10))
            .await
            .unwrap();
        let long = registry
            .register("job", &long, "long.mp4", Duration::from_secs(100))
            .await
            .unwrap();

        tokio::time::advance(Duration::from_secs(11)).await;
        assert_eq!(registry.sweep_expired().await, 1);
        assert!(!short.path.exists());
        assert!(long.path.exists());
        assert!(registry.resolve(&long.token).await.is_ok());
    }

    #[tokio::test]
    async fn revoke_job_removes_only_that_jobs_artifacts() {
        let dir = tempfile::tempdir().unwrap();
        let registry = ArtifactRegistry::new(dir.path().join("artifacts"));
        let mut registered = Vec::new();
        for (job, name) in [("job-a", "a1.mp4"), ("job-a", "a2.mp4"), ("job-b", "b1.mp4")] {
            let clip = dir.path().join(name);
            fs::write(&clip, name).await.unwrap();
            let info = registry
                .register(job, &clip, name, Duration::from_secs(60))
                .await
                .unwrap();
            registered.push(info);
        }

        assert_eq!(registry.revoke_job("job-a").await, 2);
        assert!(!registered[0].path.exists());
        assert!(!registered[1].path.exists());
        assert!(registered[2].path.exists());
        assert!(registry.resolve(&registered[2].token).await.is_ok());
        assert_eq!(registry.revoke_job("job-a").await, 0);
    }

    #[tokio::test]
    async fn abandoned_staging_discards_the_stored_file() {
        let (_dir, registry, _clip) = registry_with_clip(b"x").await;
        let abandoned = registry.root().join("abandoned.mp4");
        let kept = registry.root().join("kept.mp4");
        fs::write(&abandoned, b"a").await.unwrap();
        fs::write(&kept, b"k").await.unwrap();

        drop(StagedFile::new(abandoned.clone()));
        StagedFile::new(kept.clone()).keep();

        assert!(!abandoned.exists());
        assert!(kept.exists());
    }

    #[tokio::test]
    async fn reset_storage_clears_leftovers() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("artifacts");
        std::fs::create_dir_all(&root).unwrap();
        std::fs::write(root.join("stale.mp4"), b"old").unwrap();

        let registry = ArtifactRegistry::new(&root);
        registry.reset_storage().await.unwrap();
        assert!(root.exists());
        assert!(std::fs::read_dir(&root).unwrap().next().is_none());
    }
}
