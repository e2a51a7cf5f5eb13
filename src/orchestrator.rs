//! Job lifecycle: fetch → concurrent cuts → registration → workspace release.

use std::{collections::HashMap, sync::Arc, time::Duration};

use chrono::Utc;
use futures::future::join_all;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use url::Url;
use uuid::Uuid;

use crate::{
    artifact_store::ArtifactRegistry,
    config::Config,
    cutter::{clip_file_name, ClipCutter, CutRequest},
    error::{ApiError, CutError, FetchError},
    fetcher::SourceFetcher,
    models::{ClipResult, JobErrorPayload, JobRecord, JobResponse, JobState},
    process::{PoolStats, ProcessPool},
    workspace::{Workspace, WorkspaceManager},
};

#[derive(Debug, Clone)]
pub struct JobSettings {
    pub clip_durations: Vec<u64>,
    pub clip_start_seconds: u64,
    pub job_timeout: Duration,
    pub artifact_ttl: Duration,
    pub max_active_jobs: usize,
}

impl From<&Config> for JobSettings {
    fn from(config: &Config) -> Self {
        Self {
            clip_durations: config.clip_durations.clone(),
            clip_start_seconds: config.clip_start_seconds,
            job_timeout: config.job_timeout,
            artifact_ttl: config.artifact_ttl,
            max_active_jobs: config.max_active_jobs,
        }
    }
}

struct JobEntry {
    record: JobRecord,
    cancel: CancellationToken,
}

/// Why a job ended in `Failed`.
#[derive(Debug)]
enum JobFailure {
    Fetch(FetchError),
    Cancelled,
    TimedOut(Duration),
    NoClips,
    Workspace(String),
}

impl JobFailure {
    fn payload(&self) -> JobErrorPayload {
        match self {
            Self::Fetch(err) => JobErrorPayload::new(err.code(), err.to_string()),
            Self::Cancelled => JobErrorPayload::new("CANCELLED", "Job was cancelled"),
            Self::TimedOut(after) => JobErrorPayload::new(
                "JOB_TIMEOUT",
                format!("Job exceeded {}s", after.as_secs()),
            ),
            Self::NoClips => JobErrorPayload::new("ALL_CLIPS_FAILED", "No clip could be produced"),
            Self::Workspace(message) => JobErrorPayload::new("WORKSPACE_FAILED", message.clone()),
        }
    }
}

pub struct Orchestrator {
    settings: JobSettings,
    workspaces: WorkspaceManager,
    registry: Arc<ArtifactRegistry>,
    fetcher: Arc<dyn SourceFetcher>,
    cutter: Arc<dyn ClipCutter>,
    pool: ProcessPool,
    jobs: RwLock<HashMap<String, JobEntry>>,
}

impl Orchestrator {
    pub fn new(
        settings: JobSettings,
        workspaces: WorkspaceManager,
        registry: Arc<ArtifactRegistry>,
        fetcher: Arc<dyn SourceFetcher>,
        cutter: Arc<dyn ClipCutter>,
        pool: ProcessPool,
    ) -> Self {
        Self {
            settings,
            workspaces,
            registry,
            fetcher,
            cutter,
            pool,
            jobs: RwLock::new(HashMap::new()),
        }
    }

    pub fn pool_stats(&self) -> PoolStats {
        self.pool.stats()
    }

    /// Validates `raw_url`, records a pending job and starts it in the
    /// background.
    pub async fn submit(self: &Arc<Self>, raw_url: &str) -> Result<JobResponse, ApiError> {
        let url = validate_source_url(raw_url)?;
        let job_id = Uuid::new_v4().to_string();
        let record = JobRecord::new(job_id.clone(), url.to_string());
        let response = record.to_response();
        let cancel = CancellationToken::new();

        {
            let mut jobs = self.jobs.write().await;
            let active = jobs
                .values()
                .filter(|entry| !entry.record.state.is_terminal())
                .count();
            if active >= self.settings.max_active_jobs {
                return Err(ApiError::ResourceExhausted(format!(
                    "{active} jobs already in progress, retry later"
                )));
            }
            jobs.insert(
                job_id.clone(),
                JobEntry {
                    record,
                    cancel: cancel.clone(),
                },
            );
        }

        info!(job_id = %job_id, url = %url, "Job submitted");

        let orchestrator = Arc::clone(self);
        tokio::spawn(async move {
            orchestrator.run_job(job_id, url, cancel).await;
        });

        Ok(response)
    }

    pub async fn status(&self, job_id: &str) -> Result<JobResponse, ApiError> {
        let jobs = self.jobs.read().await;
        jobs.get(job_id)
            .map(|entry| entry.record.to_response())
            .ok_or_else(|| job_not_found(job_id))
    }

    /// Requests cancellation. The job reaches `Failed` once its processes
    /// are stopped and its workspace is gone.
    pub async fn cancel(&self, job_id: &str) -> Result<JobResponse, ApiError> {
        let jobs = self.jobs.read().await;
        let entry = jobs.get(job_id).ok_or_else(|| job_not_found(job_id))?;
        if !entry.record.state.is_terminal() {
            info!(job_id = %job_id, "Cancellation requested");
            entry.cancel.cancel();
        }
        Ok(entry.record.to_response())
    }

    /// Forgets terminal jobs last updated more than `older_than` ago.
    pub async fn prune_finished(&self, older_than: Duration) -> usize {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(older_than).unwrap_or_else(|_| chrono::Duration::hours(1));
        let mut jobs = self.jobs.write().await;
        let before = jobs.len();
        jobs.retain(|_, entry| {
            !(entry.record.state.is_terminal() && entry.record.updated_at < cutoff)
        });
        before - jobs.len()
    }

    async fn run_job(self: Arc<Self>, job_id: String, url: Url, cancel: CancellationToken) {
        let mut workspace = match self.workspaces.acquire(&job_id).await {
            Ok(workspace) => workspace,
            Err(err) => {
                error!(job_id = %job_id, "Failed to acquire workspace: {err}");
                self.finish(&job_id, Err(JobFailure::Workspace(err.to_string())))
                    .await;
                return;
            }
        };

        let outcome = match tokio::time::timeout(
            self.settings.job_timeout,
            self.execute(&job_id, &url, &workspace, &cancel),
        )
        .await
        {
            Ok(outcome) => outcome,
            Err(_) => {
                cancel.cancel();
                Err(JobFailure::TimedOut(self.settings.job_timeout))
            }
        };

        let outcome = match outcome {
            Ok(_) if cancel.is_cancelled() => Err(JobFailure::Cancelled),
            other => other,
        };

        if let Err(err) = workspace.release().await {
            warn!(job_id = %job_id, "Workspace release failed: {err}");
        }
        self.finish(&job_id, outcome).await;
    }

    async fn execute(
        &self,
        job_id: &str,
        url: &Url,
        workspace: &Workspace,
        cancel: &CancellationToken,
    ) -> Result<(), JobFailure> {
        let source = {
            let Some(_slot) = self.pool.acquire(cancel).await else {
                return Err(JobFailure::Cancelled);
            };
            self.set_state(job_id, JobState::Fetching).await;
            info!(job_id = %job_id, "Fetching source");

            match self.fetcher.fetch(url, workspace.path(), cancel).await {
                Ok(path) => path,
                Err(FetchError::Cancelled) => return Err(JobFailure::Cancelled),
                Err(err) => return Err(JobFailure::Fetch(err)),
            }
        };

        self.set_state(job_id, JobState::Cutting).await;
        info!(
            job_id = %job_id,
            durations = ?self.settings.clip_durations,
            "Cutting clips"
        );

        let cuts = self.settings.clip_durations.iter().map(|&duration| {
            let request = CutRequest {
                source: source.clone(),
                start_secs: self.settings.clip_start_seconds,
                duration_secs: duration,
                output: workspace.path().join(clip_file_name(duration)),
            };
            self.produce_clip(job_id, request, cancel)
        });
        join_all(cuts).await;

        if cancel.is_cancelled() {
            return Err(JobFailure::Cancelled);
        }
        Ok(())
    }

    /// Cuts and registers one duration, recording the result on the job.
    async fn produce_clip(&self, job_id: &str, request: CutRequest, cancel: &CancellationToken) {
        let duration = request.duration_secs;
        let result = match self.pool.acquire(cancel).await {
            None => ClipResult::failed(duration, CutError::Cancelled.to_string()),
            Some(_slot) => match self.cutter.cut(&request, cancel).await {
                Ok(output) => {
                    let file_name = clip_file_name(duration);
                    match self
                        .registry
                        .register(job_id, &output.path, &file_name, self.settings.artifact_ttl)
                        .await
                    {
                        Ok(artifact) => {
                            ClipResult::registered(duration, artifact.token, output.duration_secs)
                        }
                        Err(err) => {
                            warn!(job_id = %job_id, duration, "Failed to register clip: {err:#}");
                            ClipResult::failed(duration, format!("registration failed: {err}"))
                        }
                    }
                }
                Err(err) => {
                    warn!(job_id = %job_id, duration, "Cut failed: {err}");
                    ClipResult::failed(duration, err.to_string())
                }
            },
        };

        if result.truncated {
            info!(
                job_id = %job_id,
                duration,
                actual = result.actual_duration.unwrap_or_default(),
                "Clip truncated to source length"
            );
        }
        self.record_clip(job_id, result).await;
    }

    async fn set_state(&self, job_id: &str, state: JobState) {
        let mut jobs = self.jobs.write().await;
        if let Some(entry) = jobs.get_mut(job_id) {
            entry.record.state = state;
            entry.record.updated_at = Utc::now();
        }
    }

    async fn record_clip(&self, job_id: &str, clip: ClipResult) {
        let mut jobs = self.jobs.write().await;
        if let Some(entry) = jobs.get_mut(job_id) {
            entry.record.clips.push(clip);
            entry.record.clips.sort_by_key(|clip| clip.duration);
            entry.record.updated_at = Utc::now();
        }
    }

    /// Publishes the terminal state. Runs after the workspace is released.
    async fn finish(&self, job_id: &str, outcome: Result<(), JobFailure>) {
        let outcome = match outcome {
            Ok(()) => {
                let any_succeeded = self
                    .jobs
                    .read()
                    .await
                    .get(job_id)
                    .map(|entry| entry.record.clips.iter().any(ClipResult::succeeded))
                    .unwrap_or(false);
                if any_succeeded {
                    Ok(())
                } else {
                    Err(JobFailure::NoClips)
                }
            }
            Err(failure) => Err(failure),
        };

        if matches!(outcome, Err(JobFailure::Cancelled | JobFailure::TimedOut(_))) {
            self.abort_clips(job_id).await;
            // Covers clips registered by a cut that was interrupted before
            // it could record its token.
            let revoked = self.registry.revoke_job(job_id).await;
            if revoked > 0 {
                info!(job_id = %job_id, revoked, "Revoked artifacts of aborted job");
            }
        }

        let mut jobs = self.jobs.write().await;
        let Some(entry) = jobs.get_mut(job_id) else {
            return;
        };
        let record = &mut entry.record;
        record.updated_at = Utc::now();
        match outcome {
            Ok(()) => {
                record.state = JobState::Done;
                record.error = None;
                let produced = record.clips.iter().filter(|c| c.succeeded()).count();
                info!(
                    job_id = %job_id,
                    produced,
                    requested = self.settings.clip_durations.len(),
                    "Job finished"
                );
            }
            Err(failure) => {
                let payload = failure.payload();
                error!(job_id = %job_id, code = %payload.code, "Job failed: {}", payload.message);
                record.state = JobState::Failed;
                record.error = Some(payload);
            }
        }
    }

    /// Rewrites the clips of an aborted job as failures, adding an entry for
    /// every requested duration that never reported back.
    async fn abort_clips(&self, job_id: &str) {
        let mut jobs = self.jobs.write().await;
        let Some(entry) = jobs.get_mut(job_id) else {
            return;
        };
        let clips = &mut entry.record.clips;
        for clip in clips.iter_mut() {
            if clip.succeeded() {
                *clip = ClipResult::failed(clip.duration, "job aborted before completion");
            }
        }
        for &duration in &self.settings.clip_durations {
            if !clips.iter().any(|clip| clip.duration == duration) {
                clips.push(ClipResult::failed(duration, "job aborted before completion"));
            }
        }
        clips.sort_by_key(|clip| clip.duration);
    }
}

fn job_not_found(job_id: &str) -> ApiError {
    ApiError::NotFound(format!("Job {job_id} not found"))
}

pub fn validate_source_url(raw: &str) -> Result<Url, ApiError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(ApiError::Validation("url must not be empty".to_string()));
    }
    let url = Url::parse(trimmed)
        .map_err(|err| ApiError::Validation(format!("url is malformed: {err}")))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(ApiError::Validation(format!(
            "unsupported url scheme '{}'",
            url.scheme()
        )));
    }
    if url.host_str().map_or(true, str::is_empty) {
        return Err(ApiError::Validation("url must include a host".to_string()));
    }
    Ok(url)
}

pub fn spawn_job_pruner(orchestrator: Arc<Orchestrator>, interval: Duration, retention: Duration) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            let pruned = orchestrator.prune_finished(retention).await;
            if pruned > 0 {
                info!(pruned, "Pruned finished jobs");
            }
        }
    });
}
