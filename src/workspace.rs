use std::{
    io::ErrorKind,
    path::{Path, PathBuf},
    time::{Duration, SystemTime},
};

use anyhow::{Context, Result};
use tokio::fs;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::WorkspaceError;

const WORKSPACE_PREFIX: &str = "job-";

/// Hands out per-job scratch directories under a shared root.
#[derive(Debug, Clone)]
pub struct WorkspaceManager {
    root: PathBuf,
}

/// A scratch directory exclusively owned by one job.
///
/// Call [`Workspace::release`] on every exit path. A workspace dropped
/// without being released is removed on the blocking pool, or inline when no
/// runtime is running.
#[derive(Debug)]
pub struct Workspace {
    path: PathBuf,
    released: bool,
}

impl WorkspaceManager {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub async fn ensure_root(&self) -> Result<()> {
        fs::create_dir_all(&self.root).await.with_context(|| {
            format!(
                "Failed to create workspace root at {}",
                self.root.display()
            )
        })
    }

    pub async fn acquire(&self, job_id: &str) -> Result<Workspace, WorkspaceError> {
        fs::create_dir_all(&self.root)
            .await
            .map_err(|source| WorkspaceError::Create {
                root: self.root.clone(),
                source,
            })?;

        let mut attempts = 0;
        loop {
            attempts += 1;
            let suffix = Uuid::new_v4().simple().to_string();
            let path = self
                .root
                .join(format!("{WORKSPACE_PREFIX}{job_id}-{}", &suffix[..12]));

            match fs::create_dir(&path).await {
                Ok(()) => {
                    debug!(job_id = %job_id, path = %path.display(), "Workspace acquired");
                    return Ok(Workspace {
                        path,
                        released: false,
                    });
                }
                Err(err) if err.kind() == ErrorKind::AlreadyExists && attempts < 3 => continue,
                Err(source) => {
                    return Err(WorkspaceError::Create {
                        root: self.root.clone(),
                        source,
                    })
                }
            }
        }
    }

    /// Removes workspace directories left behind by an earlier process that
    /// are older than `older_than`.
    pub async fn reap_orphans(&self, older_than: Duration) -> Result<usize> {
        let mut entries = match fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(0),
            Err(err) => {
                return Err(err).with_context(|| {
                    format!("Failed to list workspace root {}", self.root.display())
                })
            }
        };

        let now = SystemTime::now();
        let mut removed = 0;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            if !name.to_string_lossy().starts_with(WORKSPACE_PREFIX) {
                continue;
            }

            let metadata = match entry.metadata().await {
                Ok(metadata) if metadata.is_dir() => metadata,
                _ => continue,
            };
            let age = metadata
                .modified()
                .ok()
                .and_then(|modified| now.duration_since(modified).ok())
                .unwrap_or_default();
            if age < older_than {
                continue;
            }

            let path = entry.path();
            match fs::remove_dir_all(&path).await {
                Ok(()) => {
                    info!(path = %path.display(), age_secs = age.as_secs(), "Removed orphaned workspace");
                    removed += 1;
                }
                Err(err) => warn!("Failed to remove orphaned workspace {}: {err}", path.display()),
            }
        }

        Ok(removed)
    }
}

impl Workspace {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_released(&self) -> bool {
        self.released
    }

    /// Recursively deletes the workspace. Calling it again is a no-op.
    pub async fn release(&mut self) -> Result<(), WorkspaceError> {
        if self.released {
            return Ok(());
        }

        match fs::remove_dir_all(&self.path).await {
            Ok(()) => {}
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(source) => {
                return Err(WorkspaceError::Remove {
                    path: self.path.clone(),
                    source,
                })
            }
        }

        self.released = true;
        debug!(path = %self.path.display(), "Workspace released");
        Ok(())
    }
}

impl Drop for Workspace {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let path = std::mem::take(&mut self.path);
        warn!(path = %path.display(), "Workspace dropped without release, removing");
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn_blocking(move || remove_dropped_workspace(&path));
            }
            Err(_) => remove_dropped_workspace(&path),
        }
    }
}

fn remove_dropped_workspace(path: &Path) {
    match std::fs::remove_dir_all(path) {
        Ok(()) => debug!(path = %path.display(), "Dropped workspace removed"),
        Err(err) if err.kind() == ErrorKind::NotFound => {}
        Err(err) => warn!(
            "Failed to remove dropped workspace {}: {err}",
            path.display()
        ),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    #[tokio::test]
    async fn acquire_creates_empty_unique_directories() {
        let root = tempfile::tempdir().unwrap();
        let manager = WorkspaceManager::new(root.path().join("ws"));

        let first = manager.acquire("same-job").await.unwrap();
        let second = manager.acquire("same-job").await.unwrap();

        assert_ne!(first.path(), second.path());
        assert!(first.path().starts_with(manager.root()));
        assert!(std::fs::read_dir(first.path()).unwrap().next().is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_acquisition_never_collides() {
        let root = tempfile::tempdir().unwrap();
        let manager = WorkspaceManager::new(root.path());

        let mut handles = Vec::new();
        for i in 0..32 {
            let manager = manager.clone();
            handles.push(tokio::spawn(async move {
                let mut workspace = manager.acquire(&format!("job{}", i % 4)).await.unwrap();
                let path = workspace.path().to_path_buf();
                workspace.released = true;
                path
            }));
        }

        let mut seen = HashSet::new();
        for handle in handles {
            assert!(seen.insert(handle.await.unwrap()));
        }
        assert_eq!(seen.len(), 32);
    }

    #[tokio::test]
    async fn release_is_recursive_and_idempotent() {
        let root = tempfile::tempdir().unwrap();
        let manager = WorkspaceManager::new(root.path());
        let mut workspace = manager.acquire("abc").await.unwrap();
        let nested = workspace.path().join("nested");
        std::fs::create_dir(&nested).unwrap();
        std::fs::write(nested.join("clip.mp4"), b"data").unwrap();

        workspace.release().await.unwrap();
        assert!(!workspace.path().exists());
        assert!(workspace.is_released());
        workspace.release().await.unwrap();
    }

    #[tokio::test]
    async fn dropping_an_unreleased_workspace_removes_it() {
        let root = tempfile::tempdir().unwrap();
        let manager = WorkspaceManager::new(root.path());
        let path = {
            let workspace = manager.acquire("dropped").await.unwrap();
            std::fs::write(workspace.path().join("source.mp4"), b"x").unwrap();
            workspace.path().to_path_buf()
        };

        let started = std::time::Instant::now();
        while path.exists() {
            assert!(started.elapsed() < Duration::from_secs(5), "workspace left behind");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    #[test]
    fn dropping_outside_a_runtime_removes_inline() {
        let root = tempfile::tempdir().unwrap();
        let path = root.path().join("job-inline-0000");
        std::fs::create_dir(&path).unwrap();
        drop(Workspace {
            path: path.clone(),
            released: false,
        });
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn reaper_only_touches_old_workspace_directories() {
        let root = tempfile::tempdir().unwrap();
        let manager = WorkspaceManager::new(root.path());

        let orphan = root.path().join("job-orphan-1234");
        std::fs::create_dir(&orphan).unwrap();
        let unrelated = root.path().join("keep-me");
        std::fs::create_dir(&unrelated).unwrap();

        assert_eq!(manager.reap_orphans(Duration::from_secs(3600)).await.unwrap(), 0);
        assert!(orphan.exists());

        assert_eq!(manager.reap_orphans(Duration::ZERO).await.unwrap(), 1);
        assert!(!orphan.exists());
        assert!(unrelated.exists());
    }

    #[tokio::test]
    async fn reaper_tolerates_missing_root() {
        let root = tempfile::tempdir().unwrap();
        let manager = WorkspaceManager::new(root.path().join("absent"));
        assert_eq!(manager.reap_orphans(Duration::ZERO).await.unwrap(), 0);
    }
}
