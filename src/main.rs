mod api;
mod artifact_store;
mod config;
mod cutter;
mod error;
mod fetcher;
mod models;
mod orchestrator;
mod process;
mod workspace;

use std::sync::Arc;

use anyhow::Result;
use axum::{
    routing::{get, post},
    Router,
};
use artifact_store::ArtifactRegistry;
use config::Config;
use cutter::FfmpegCutter;
use fetcher::YtDlpFetcher;
use orchestrator::{JobSettings, Orchestrator};
use process::{tool_available, ProcessPool};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{info, warn};
use workspace::WorkspaceManager;

#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    pub orchestrator: Arc<Orchestrator>,
    pub registry: Arc<ArtifactRegistry>,
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(api::healthz))
        .route("/jobs", post(api::create_job))
        .route("/jobs/{job_id}", get(api::get_job).delete(api::cancel_job))
        .route("/artifacts/{token}", get(api::download_artifact))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "autoclip_api=info,tower_http=info".into()),
        )
        .init();

    let config = Config::from_env()?;

    for (name, path) in [
        ("yt-dlp", &config.ytdlp_bin),
        ("ffmpeg", &config.ffmpeg_bin),
        ("ffprobe", &config.ffprobe_bin),
    ] {
        if !tool_available(path) {
            warn!("{name} not found at {}; jobs will fail until it is installed", path.display());
        }
    }

    let workspaces = WorkspaceManager::new(&config.workspace_root);
    workspaces.ensure_root().await?;
    let reaped = workspaces.reap_orphans(config.orphan_workspace_age).await?;
    if reaped > 0 {
        info!(reaped, "Removed orphaned workspaces from a previous run");
    }

    let registry = Arc::new(ArtifactRegistry::new(&config.artifact_root));
    registry.reset_storage().await?;

    let fetcher = Arc::new(YtDlpFetcher::new(
        &config.ytdlp_bin,
        config.ytdlp_format.clone(),
        config.fetch_timeout,
    ));
    let cutter = Arc::new(FfmpegCutter::new(
        &config.ffmpeg_bin,
        &config.ffprobe_bin,
        config.cut_timeout,
    ));
    let orchestrator = Arc::new(Orchestrator::new(
        JobSettings::from(&config),
        workspaces,
        registry.clone(),
        fetcher,
        cutter,
        ProcessPool::new(config.max_processes),
    ));

    artifact_store::spawn_cleanup_worker(registry.clone(), config.cleanup_interval);
    orchestrator::spawn_job_pruner(
        orchestrator.clone(),
        config.cleanup_interval,
        config.artifact_ttl,
    );

    let state = AppState {
        config: config.clone(),
        orchestrator,
        registry,
    };
    let app = build_router(state);

    let listener = tokio::net::TcpListener::bind(config.bind_addr).await?;
    info!(
        durations = ?config.clip_durations,
        max_processes = config.max_processes,
        "autoclip-api listening on {}",
        config.bind_addr
    );
    axum::serve(listener, app).await?;
    Ok(())
}
