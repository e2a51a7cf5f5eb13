//! Bounded execution of external tools.
//!
//! Every yt-dlp, ffprobe and ffmpeg invocation holds a [`ProcessSlot`] from the
//! shared [`ProcessPool`] while it runs, so the number of live child processes
//! never exceeds the configured limit. Excess work waits on the semaphore.

use std::{
    ffi::OsStr,
    path::Path,
    process::Stdio,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use serde::Serialize;
use tokio::{
    io::AsyncReadExt,
    process::Command,
    sync::{OwnedSemaphorePermit, Semaphore},
    time::Instant,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::ToolError;

#[derive(Debug)]
struct PoolCounters {
    active: AtomicUsize,
    high_water: AtomicUsize,
}

#[derive(Debug, Clone)]
pub struct ProcessPool {
    limit: usize,
    semaphore: Arc<Semaphore>,
    counters: Arc<PoolCounters>,
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PoolStats {
    pub active: usize,
    pub high_water: usize,
    pub limit: usize,
}

/// Permission to run one external process. Released on drop.
#[derive(Debug)]
pub struct ProcessSlot {
    _permit: OwnedSemaphorePermit,
    counters: Arc<PoolCounters>,
}

impl Drop for ProcessSlot {
    fn drop(&mut self) {
        self.counters.active.fetch_sub(1, Ordering::SeqCst);
    }
}

impl ProcessPool {
    pub fn new(limit: usize) -> Self {
        let limit = limit.max(1);
        Self {
            limit,
            semaphore: Arc::new(Semaphore::new(limit)),
            counters: Arc::new(PoolCounters {
                active: AtomicUsize::new(0),
                high_water: AtomicUsize::new(0),
            }),
        }
    }

    /// Waits for a free slot. Returns `None` if `cancel` fires first.
    pub async fn acquire(&self, cancel: &CancellationToken) -> Option<ProcessSlot> {
        let permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => return None,
            permit = self.semaphore.clone().acquire_owned() => permit.ok()?,
        };

        let active = self.counters.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.counters.high_water.fetch_max(active, Ordering::SeqCst);

        Some(ProcessSlot {
            _permit: permit,
            counters: self.counters.clone(),
        })
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            active: self.counters.active.load(Ordering::SeqCst),
            high_water: self.counters.high_water.load(Ordering::SeqCst),
            limit: self.limit,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ToolOutput {
    pub stdout: String,
    pub stderr: String,
}

/// The process group of one spawned tool. Killed on drop so descendants
/// such as the muxer yt-dlp starts do not outlive the call.
#[derive(Debug)]
struct ProcessGroup {
    program: String,
    pgid: Option<i32>,
}

impl ProcessGroup {
    fn new(program: &str, child_id: Option<u32>) -> Self {
        Self {
            program: program.to_string(),
            pgid: child_id.and_then(|id| i32::try_from(id).ok()),
        }
    }

    fn kill(&mut self) {
        let Some(pgid) = self.pgid.take() else {
            return;
        };
        kill_group(&self.program, pgid);
    }
}

impl Drop for ProcessGroup {
    fn drop(&mut self) {
        self.kill();
    }
}

#[cfg(unix)]
fn kill_group(program: &str, pgid: i32) {
    use nix::{
        errno::Errno,
        sys::signal::{killpg, Signal},
        unistd::Pid,
    };

    match killpg(Pid::from_raw(pgid), Signal::SIGKILL) {
        Ok(()) | Err(Errno::ESRCH) => {}
        Err(err) => warn!("Failed to kill process group of {program}: {err}"),
    }
}

#[cfg(not(unix))]
fn kill_group(_program: &str, _pgid: i32) {}

/// Runs `program` to completion, capturing stdout and stderr.
///
/// The tool runs in its own process group. The whole group is killed when
/// `timeout` elapses, when `cancel` fires, when the returned future is
/// dropped, and after the tool exits, so no descendant survives the call.
/// Draining the output pipes is bounded by the same deadline. A non-zero exit
/// becomes [`ToolError::Failed`] carrying the captured diagnostic stream.
pub async fn run_tool<I, S>(
    program: &Path,
    args: I,
    timeout: Duration,
    cancel: &CancellationToken,
) -> Result<ToolOutput, ToolError>
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let program_name = program.display().to_string();
    let args: Vec<_> = args
        .into_iter()
        .map(|arg| arg.as_ref().to_os_string())
        .collect();

    debug!(
        "Running {} {}",
        program_name,
        args.iter()
            .map(|a| a.to_string_lossy())
            .collect::<Vec<_>>()
            .join(" ")
    );

    if cancel.is_cancelled() {
        return Err(ToolError::Cancelled {
            program: program_name,
        });
    }

    let deadline = Instant::now() + timeout;
    let mut command = Command::new(program);
    command
        .args(&args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    #[cfg(unix)]
    command.process_group(0);

    let mut child = command.spawn().map_err(|source| ToolError::Spawn {
        program: program_name.clone(),
        source,
    })?;
    let mut group = ProcessGroup::new(&program_name, child.id());

    let mut stdout = child.stdout.take();
    let mut stderr = child.stderr.take();
    let stdout_task = tokio::spawn(async move {
        let mut buf = Vec::new();
        if let Some(out) = stdout.as_mut() {
            let _ = out.read_to_end(&mut buf).await;
        }
        buf
    });
    let stderr_task = tokio::spawn(async move {
        let mut buf = Vec::new();
        if let Some(err) = stderr.as_mut() {
            let _ = err.read_to_end(&mut buf).await;
        }
        buf
    });
    let readers = [stdout_task.abort_handle(), stderr_task.abort_handle()];
    let abort_readers = || readers.iter().for_each(|reader| reader.abort());

    let interrupted = |program: &str, timed_out: bool| {
        if timed_out {
            ToolError::TimedOut {
                program: program.to_string(),
                after: timeout,
            }
        } else {
            ToolError::Cancelled {
                program: program.to_string(),
            }
        }
    };

    let outcome = tokio::select! {
        status = child.wait() => Ok(status?),
        _ = tokio::time::sleep_until(deadline) => Err(interrupted(&program_name, true)),
        _ = cancel.cancelled() => Err(interrupted(&program_name, false)),
    };

    // Stragglers still holding the pipes go down with the group.
    group.kill();

    let status = match outcome {
        Ok(status) => status,
        Err(err) => {
            warn!("Killed {}: {}", program_name, err);
            if let Err(kill_err) = child.kill().await {
                warn!("Failed to reap {}: {}", program_name, kill_err);
            }
            abort_readers();
            return Err(err);
        }
    };

    let drained = tokio::select! {
        drained = async { tokio::join!(stdout_task, stderr_task) } => Ok(drained),
        _ = tokio::time::sleep_until(deadline) => Err(interrupted(&program_name, true)),
        _ = cancel.cancelled() => Err(interrupted(&program_name, false)),
    };
    let (stdout, stderr) = match drained {
        Ok((stdout, stderr)) => (stdout.unwrap_or_default(), stderr.unwrap_or_default()),
        Err(err) => {
            warn!("Output of {} still open after exit: {}", program_name, err);
            abort_readers();
            return Err(err);
        }
    };

    let output = ToolOutput {
        stdout: String::from_utf8_lossy(&stdout).into_owned(),
        stderr: String::from_utf8_lossy(&stderr).into_owned(),
    };

    if status.success() {
        Ok(output)
    } else {
        Err(ToolError::Failed {
            program: program_name,
            exit_code: status.code(),
            stderr: output.stderr,
        })
    }
}

/// Reports whether `program` resolves to an executable.
pub fn tool_available(program: &Path) -> bool {
    which::which(program).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn pool_never_exceeds_its_limit() {
        let pool = ProcessPool::new(2);
        let cancel = CancellationToken::new();
        let mut handles = Vec::new();
        for _ in 0..6 {
            let pool = pool.clone();
            let cancel = cancel.clone();
            handles.push(tokio::spawn(async move {
                let _slot = pool.acquire(&cancel).await.expect("slot");
                tokio::time::sleep(Duration::from_millis(20)).await;
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let stats = pool.stats();
        assert_eq!(stats.active, 0);
        assert_eq!(stats.high_water, 2);
        assert_eq!(stats.limit, 2);
    }

    #[tokio::test]
    async fn waiting_for_a_slot_is_cancellable() {
        let pool = ProcessPool::new(1);
        let cancel = CancellationToken::new();
        let _held = pool.acquire(&cancel).await.expect("slot");

        let waiter_cancel = CancellationToken::new();
        waiter_cancel.cancel();
        assert!(pool.acquire(&waiter_cancel).await.is_none());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn captures_stdout_on_success() {
        let output = run_tool(
            Path::new("sh"),
            ["-c", "echo hello"],
            Duration::from_secs(10),
            &CancellationToken::new(),
        )
        .await
        .expect("sh should succeed");
        assert_eq!(output.stdout.trim(), "hello");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn non_zero_exit_carries_stderr() {
        let err = run_tool(
            Path::new("sh"),
            ["-c", "echo boom >&2; exit 3"],
            Duration::from_secs(10),
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();
        match err {
            ToolError::Failed {
                exit_code, stderr, ..
            } => {
                assert_eq!(exit_code, Some(3));
                assert_eq!(stderr.trim(), "boom");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn timeout_kills_the_child() {
        let started = Instant::now();
        let err = run_tool(
            Path::new("sleep"),
            ["30"],
            Duration::from_millis(100),
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, ToolError::TimedOut { .. }));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn cancellation_kills_the_child() {
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });

        let started = Instant::now();
        let err = run_tool(Path::new("sleep"), ["30"], Duration::from_secs(60), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::Cancelled { .. }));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    /// True once `pid` has exited, counting zombies awaiting their reaper.
    #[cfg(target_os = "linux")]
    fn process_gone(pid: &str) -> bool {
        match std::fs::read_to_string(format!("/proc/{pid}/stat")) {
            Err(_) => true,
            Ok(stat) => stat
                .rsplit_once(')')
                .map(|(_, rest)| rest.trim_start().starts_with('Z'))
                .unwrap_or(false),
        }
    }

    #[cfg(target_os = "linux")]
    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn cancellation_kills_grandchildren() {
        let dir = tempfile::tempdir().unwrap();
        let pid_file = dir.path().join("grandchild.pid");
        let script = format!("sleep 30 & echo $! > {}; wait", pid_file.display());

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        let watched = pid_file.clone();
        tokio::spawn(async move {
            while !watched.exists() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });

        let err = run_tool(Path::new("sh"), ["-c", script.as_str()], Duration::from_secs(60), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::Cancelled { .. }));

        let pid = std::fs::read_to_string(&pid_file).unwrap().trim().to_string();
        let started = Instant::now();
        while !process_gone(&pid) {
            assert!(
                started.elapsed() < Duration::from_secs(5),
                "grandchild {pid} survived cancellation"
            );
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn background_descendant_does_not_hold_the_call_open() {
        let started = Instant::now();
        let output = run_tool(
            Path::new("sh"),
            ["-c", "sleep 30 & echo done"],
            Duration::from_secs(10),
            &CancellationToken::new(),
        )
        .await
        .expect("sh should succeed");
        assert_eq!(output.stdout.trim(), "done");
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn missing_binary_is_a_spawn_error() {
        let err = run_tool(
            Path::new("/nonexistent/autoclip-tool"),
            Vec::<String>::new(),
            Duration::from_secs(1),
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, ToolError::Spawn { .. }));
        assert!(!tool_available(Path::new("/nonexistent/autoclip-tool")));
    }
}
