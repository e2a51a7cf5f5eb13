use std::{env, net::SocketAddr, path::PathBuf, time::Duration};

use anyhow::Result;

pub const DEFAULT_CLIP_DURATIONS: [u64; 3] = [60, 120, 300];

#[derive(Debug, Clone)]
pub struct Config {
    pub bind_addr: SocketAddr,
    pub ffmpeg_bin: PathBuf,
    pub ffprobe_bin: PathBuf,
    pub ytdlp_bin: PathBuf,
    pub ytdlp_format: String,
    pub clip_durations: Vec<u64>,
    pub clip_start_seconds: u64,
    pub fetch_timeout: Duration,
    pub cut_timeout: Duration,
    pub job_timeout: Duration,
    pub artifact_ttl: Duration,
    pub max_processes: usize,
    pub max_active_jobs: usize,
    pub workspace_root: PathBuf,
    pub artifact_root: PathBuf,
    pub orphan_workspace_age: Duration,
    pub cleanup_interval: Duration,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Ok(Self::from_lookup(|key| env::var(key).ok()))
    }

    /// Builds the configuration from an arbitrary variable source. Unset or
    /// unparsable values fall back to their defaults.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let bind_addr = lookup("AUTOCLIP_BIND_ADDR")
            .map(|raw| {
                raw.trim()
                    .trim_matches('"')
                    .trim_matches('\'')
                    .to_string()
            })
            .and_then(|v| v.parse::<SocketAddr>().ok())
            .unwrap_or_else(|| SocketAddr::from(([0, 0, 0, 0], 8080)));

        let ffmpeg_bin = lookup("AUTOCLIP_FFMPEG_BIN")
            .or_else(|| lookup("FFMPEG_BIN"))
            .and_then(non_empty)
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("ffmpeg"));

        let ffprobe_bin = lookup("AUTOCLIP_FFPROBE_BIN")
            .and_then(non_empty)
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("ffprobe"));

        let ytdlp_bin = lookup("AUTOCLIP_YTDLP_BIN")
            .and_then(non_empty)
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("yt-dlp"));

        let ytdlp_format = lookup("AUTOCLIP_YTDLP_FORMAT")
            .and_then(non_empty)
            .unwrap_or_else(|| "bestvideo+bestaudio/best".to_string());

        let clip_durations = lookup("AUTOCLIP_CLIP_DURATIONS")
            .and_then(|v| parse_durations(&v))
            .unwrap_or_else(|| DEFAULT_CLIP_DURATIONS.to_vec());

        let clip_start_seconds = parse_or(&lookup, "AUTOCLIP_CLIP_START_SECONDS", 0u64);

        let fetch_timeout = seconds_or(&lookup, "AUTOCLIP_FETCH_TIMEOUT_SECONDS", 30 * 60);
        let cut_timeout = seconds_or(&lookup, "AUTOCLIP_CUT_TIMEOUT_SECONDS", 15 * 60);
        let job_timeout = seconds_or(&lookup, "AUTOCLIP_JOB_TIMEOUT_SECONDS", 60 * 60);
        let artifact_ttl = seconds_or(&lookup, "AUTOCLIP_ARTIFACT_TTL_SECONDS", 60 * 60);

        let max_processes = parse_or(&lookup, "AUTOCLIP_MAX_PROCESSES", 4usize).max(1);
        let max_active_jobs = parse_or(&lookup, "AUTOCLIP_MAX_ACTIVE_JOBS", 64usize).max(1);

        let scratch_base = env::temp_dir().join("autoclip");
        let workspace_root = lookup("AUTOCLIP_WORKSPACE_ROOT")
            .and_then(non_empty)
            .map(PathBuf::from)
            .unwrap_or_else(|| scratch_base.join("workspaces"));
        let artifact_root = lookup("AUTOCLIP_ARTIFACT_ROOT")
            .and_then(non_empty)
            .map(PathBuf::from)
            .unwrap_or_else(|| scratch_base.join("artifacts"));

        let orphan_workspace_age =
            seconds_or(&lookup, "AUTOCLIP_ORPHAN_WORKSPACE_AGE_SECONDS", 2 * 60 * 60);
        let cleanup_interval = seconds_or(&lookup, "AUTOCLIP_CLEANUP_INTERVAL_SECONDS", 60);

        Self {
            bind_addr,
            ffmpeg_bin,
            ffprobe_bin,
            ytdlp_bin,
            ytdlp_format,
            clip_durations,
            clip_start_seconds,
            fetch_timeout,
            cut_timeout,
            job_timeout,
            artifact_ttl,
            max_processes,
            max_active_jobs,
            workspace_root,
            artifact_root,
            orphan_workspace_age,
            cleanup_interval,
        }
    }
}

fn non_empty(value: String) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

fn parse_or<F, T>(lookup: &F, key: &str, default: T) -> T
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    lookup(key)
        .and_then(|v| v.trim().parse::<T>().ok())
        .unwrap_or(default)
}

fn seconds_or<F>(lookup: &F, key: &str, default: u64) -> Duration
where
    F: Fn(&str) -> Option<String>,
{
    let secs = parse_or(lookup, key, default);
    Duration::from_secs(if secs == 0 { default } else { secs })
}

/// Parses a comma separated list of positive second counts. The result is
/// sorted and deduplicated; `None` if nothing valid remains.
fn parse_durations(raw: &str) -> Option<Vec<u64>> {
    let mut durations: Vec<u64> = raw
        .split(',')
        .filter_map(|part| part.trim().parse::<u64>().ok())
        .filter(|secs| *secs > 0)
        .collect();
    durations.sort_unstable();
    durations.dedup();
    if durations.is_empty() {
        None
    } else {
        Some(durations)
    }
}
