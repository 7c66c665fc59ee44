/// Worker process plumbing: spawn with output appended to the log file,
/// signal the worker's process group, read back early output, and find
/// workers an earlier overseer left behind.
use crate::config::WorkerConfig;
use crate::supervisor::SupervisorError;
use nix::errno::Errno;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::{getpgid, Pid};
use std::ffi::{OsStr, OsString};
use std::fs::OpenOptions;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use sysinfo::{Pid as SysPid, ProcessRefreshKind, ProcessStatus, ProcessesToUpdate, System, UpdateKind};
use tokio::process::{Child, Command};

/// Most bytes of early output attached to a failed start.
pub const EARLY_OUTPUT_LIMIT: u64 = 4096;

/// A freshly spawned worker.
#[derive(Debug)]
pub struct SpawnedWorker {
    pub child: Child,
    pub pid: u32,
    /// Log file length just before the spawn; everything past it is ours.
    pub log_offset: u64,
}

/// Spawn the worker with stdout+stderr appended to `log_path`.
///
/// The worker gets its own process group (via `process_group(0)`) so the
/// whole tree can be signalled at once.
pub fn spawn_worker(config: &WorkerConfig, log_path: &Path) -> Result<SpawnedWorker, SupervisorError> {
    let log_err = |e| SupervisorError::LogFile {
        path: log_path.to_path_buf(),
        source: e,
    };
    if let Some(parent) = log_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent).map_err(log_err)?;
        }
    }
    let stdout = OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_path)
        .map_err(log_err)?;
    let log_offset = stdout.metadata().map_err(log_err)?.len();
    // Second handle for stderr since File doesn't impl Clone
    let stderr = stdout.try_clone().map_err(log_err)?;

    tracing::info!(
        command = %config.command,
        args = ?config.args,
        cwd = %config.working_dir.display(),
        log = %log_path.display(),
        "spawning worker"
    );

    let child = Command::new(&config.command)
        .args(&config.args)
        .current_dir(&config.working_dir)
        .envs(&config.env)
        .stdin(Stdio::null())
        .stdout(Stdio::from(stdout))
        .stderr(Stdio::from(stderr))
        .process_group(0)
        .spawn()
        .map_err(|e| SupervisorError::Spawn {
            command: config.command.clone(),
            source: e,
        })?;

    let pid = child.id().ok_or_else(|| SupervisorError::Spawn {
        command: config.command.clone(),
        source: std::io::Error::other("worker exited before its pid was read"),
    })?;
    tracing::info!(pid, "worker process started");

    Ok(SpawnedWorker {
        child,
        pid,
        log_offset,
    })
}

/// Send `signal` to the worker's process group.
///
/// Returns `Ok(false)` when the group no longer exists.
pub fn signal_group(pid: u32, signal: Signal) -> Result<bool, SupervisorError> {
    match killpg(Pid::from_raw(pid as i32), signal) {
        Ok(()) => {
            tracing::debug!(pid, ?signal, "signalled worker process group");
            Ok(true)
        }
        Err(Errno::ESRCH) => Ok(false),
        Err(e) => Err(SupervisorError::Signal { pid, source: e }),
    }
}

/// Whether `pid` is a live process running `config`'s command line as the
/// leader of its own process group, the way `spawn_worker` starts it.
pub fn is_worker_process(pid: u32, config: &WorkerConfig) -> bool {
    let mut system = System::new();
    let sys_pid = SysPid::from_u32(pid);
    system.refresh_processes_specifics(
        ProcessesToUpdate::Some(&[sys_pid]),
        true,
        ProcessRefreshKind::nothing().with_cmd(UpdateKind::Always),
    );
    let Some(process) = system.process(sys_pid) else {
        return false;
    };
    if matches!(process.status(), ProcessStatus::Zombie) {
        return false;
    }
    let leads_group = getpgid(Some(Pid::from_raw(pid as i32)))
        .is_ok_and(|pgid| pgid.as_raw() as u32 == pid);
    leads_group && command_matches(process.cmd(), config)
}

fn command_matches(cmd: &[OsString], config: &WorkerConfig) -> bool {
    let Some((program, args)) = cmd.split_first() else {
        return false;
    };
    let file_name = |p: &OsStr| Path::new(p).file_name().map(OsStr::to_os_string);
    file_name(program.as_os_str()) == file_name(OsStr::new(&config.command))
        && args.len() == config.args.len()
        && args.iter().zip(&config.args).all(|(a, b)| a == b.as_str())
}

fn process_alive(pid: u32) -> bool {
    let mut system = System::new();
    let sys_pid = SysPid::from_u32(pid);
    system.refresh_processes(ProcessesToUpdate::Some(&[sys_pid]), true);
    system
        .process(sys_pid)
        .is_some_and(|p| !matches!(p.status(), ProcessStatus::Zombie))
}

async fn wait_gone(pid: u32, timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if !process_alive(pid) {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

/// Stop a worker group this process did not spawn (so cannot wait on):
/// SIGTERM, poll for `stop_timeout`, then SIGKILL. Returns whether
/// SIGKILL was needed.
pub async fn terminate_group(
    pid: u32,
    stop_timeout: Duration,
    kill_timeout: Duration,
) -> Result<bool, SupervisorError> {
    if !signal_group(pid, Signal::SIGTERM)? || wait_gone(pid, stop_timeout).await {
        return Ok(false);
    }
    tracing::warn!(pid, "worker ignored SIGTERM, force-killing its group");
    signal_group(pid, Signal::SIGKILL)?;
    if wait_gone(pid, kill_timeout).await {
        Ok(true)
    } else {
        Err(SupervisorError::KillTimedOut { pid })
    }
}

/// Up to [`EARLY_OUTPUT_LIMIT`] bytes written to `log_path` after `offset`.
pub fn read_early_output(log_path: &Path, offset: u64) -> String {
    let mut file = match std::fs::File::open(log_path) {
        Ok(f) => f,
        Err(_) => return String::new(),
    };
    let len = file.metadata().map(|m| m.len()).unwrap_or(0);
    // Truncated under us: whatever is there now is the early output.
    let start = if len < offset { 0 } else { offset };
    if file.seek(SeekFrom::Start(start)).is_err() {
        return String::new();
    }
    let mut buf = Vec::new();
    if file.take(EARLY_OUTPUT_LIMIT).read_to_end(&mut buf).is_err() {
        return String::new();
    }
    String::from_utf8_lossy(&buf).trim_end().to_string()
}
