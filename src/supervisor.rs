/// Worker lifecycle: start, graceful-then-forced stop, restart and status.
///
/// The child handle lives in a single async mutex; every mutating operation
/// holds it for its whole duration. Readers never wait on it: the latest
/// state is published through a `watch` channel, and `status` only checks
/// the child when the lock happens to be free.
use crate::config::{SupervisorConfig, WorkerConfig};
use crate::status::{format_uptime, StatusData, StatusFile, StatusReport, WorkerState};
use crate::worker::{is_worker_process, read_early_output, signal_group, spawn_worker, terminate_group};
use chrono::{DateTime, Local};
use nix::errno::Errno;
use nix::sys::signal::Signal;
use std::path::PathBuf;
use std::time::Duration;
use sysinfo::{Pid as SysPid, ProcessesToUpdate, System};
use tokio::process::Child;
use tokio::sync::{watch, Mutex, MutexGuard};

/// Errors surfaced by lifecycle operations.
#[derive(Debug)]
pub enum SupervisorError {
    AlreadyRunning {
        pid: u32,
    },
    NotRunning,
    /// The worker exited inside the startup grace window.
    StartFailed {
        exit_code: Option<i32>,
        output: String,
    },
    Spawn {
        command: String,
        source: std::io::Error,
    },
    LogFile {
        path: PathBuf,
        source: std::io::Error,
    },
    Signal {
        pid: u32,
        source: Errno,
    },
    Wait {
        pid: u32,
        source: std::io::Error,
    },
    /// SIGKILL was sent but the worker was not reaped in time.
    KillTimedOut {
        pid: u32,
    },
}

impl std::fmt::Display for SupervisorError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SupervisorError::AlreadyRunning { pid } => {
                write!(f, "worker is already running (pid {pid})")
            }
            SupervisorError::NotRunning => write!(f, "worker is not running"),
            SupervisorError::StartFailed { exit_code, output } => {
                match exit_code {
                    Some(code) => write!(f, "worker exited during startup with code {code}")?,
                    None => write!(f, "worker was killed by a signal during startup")?,
                }
                if !output.is_empty() {
                    write!(f, ": {output}")?;
                }
                Ok(())
            }
            SupervisorError::Spawn { command, source } => {
                write!(f, "failed to spawn worker `{command}`: {source}")
            }
            SupervisorError::LogFile { path, source } => {
                write!(f, "failed to open worker log {}: {source}", path.display())
            }
            SupervisorError::Signal { pid, source } => {
                write!(f, "failed to signal worker process group {pid}: {source}")
            }
            SupervisorError::Wait { pid, source } => {
                write!(f, "failed to wait for worker {pid}: {source}")
            }
            SupervisorError::KillTimedOut { pid } => {
                write!(f, "worker {pid} did not exit after SIGKILL")
            }
        }
    }
}

impl std::error::Error for SupervisorError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SupervisorError::Spawn { source, .. } => Some(source),
            SupervisorError::LogFile { source, .. } => Some(source),
            SupervisorError::Signal { source, .. } => Some(source),
            SupervisorError::Wait { source, .. } => Some(source),
            _ => None,
        }
    }
}

/// Result of a successful stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StopOutcome {
    pub pid: u32,
    /// The worker ignored SIGTERM and had to be killed.
    pub forced: bool,
    pub exit_code: Option<i32>,
}

/// Point-in-time view of the lifecycle, published on every transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    pub state: WorkerState,
    pub pid: Option<u32>,
    pub started_at: Option<DateTime<Local>>,
}

impl Snapshot {
    fn stopped() -> Self {
        Self {
            state: WorkerState::Stopped,
            pid: None,
            started_at: None,
        }
    }
}

struct WorkerHandle {
    child: Child,
    pid: u32,
    started_at: DateTime<Local>,
}

pub struct Supervisor {
    worker: WorkerConfig,
    timing: SupervisorConfig,
    log_path: PathBuf,
    slot: Mutex<Option<WorkerHandle>>,
    state: watch::Sender<Snapshot>,
    status_file: Option<StatusFile>,
    system: std::sync::Mutex<System>,
    /// Worker pid recorded by an earlier overseer's status file.
    previous_worker: Option<u32>,
}

impl Supervisor {
    pub fn new(
        worker: WorkerConfig,
        timing: SupervisorConfig,
        log_path: PathBuf,
        status_file: Option<StatusFile>,
    ) -> Self {
        let (state, _) = watch::channel(Snapshot::stopped());
        let previous_worker = status_file
            .as_ref()
            .and_then(|file| file.read().ok())
            .filter(|previous| previous.overseer_pid != std::process::id())
            .and_then(|previous| previous.worker_pid);
        let supervisor = Self {
            worker,
            timing,
            log_path,
            slot: Mutex::new(None),
            state,
            status_file,
            system: std::sync::Mutex::new(System::new()),
            previous_worker,
        };
        supervisor.write_status_file(&Snapshot::stopped());
        supervisor
    }

    pub fn snapshot(&self) -> Snapshot {
        self.state.borrow().clone()
    }

    fn transition(&self, state: WorkerState, pid: Option<u32>, started_at: Option<DateTime<Local>>) {
        let snapshot = Snapshot {
            state,
            pid,
            started_at,
        };
        let previous = self.state.send_replace(snapshot.clone());
        if previous.state != state {
            tracing::info!(
                from = previous.state.as_str(),
                to = state.as_str(),
                pid = ?pid,
                "worker state changed"
            );
        }
        self.write_status_file(&snapshot);
    }

    fn write_status_file(&self, snapshot: &Snapshot) {
        let Some(file) = &self.status_file else {
            return;
        };
        let data = StatusData {
            overseer_pid: std::process::id(),
            state: snapshot.state,
            worker_pid: snapshot.pid,
            started_at: snapshot.started_at,
            log_file: self.log_path.clone(),
            last_update: Local::now(),
        };
        if let Err(e) = file.write(&data) {
            tracing::warn!(path = %file.path().display(), error = %e, "failed to write status file");
        }
    }

    /// Start the worker. Returns its pid once it survived the grace window.
    pub async fn start(&self) -> Result<u32, SupervisorError> {
        let mut slot = self.slot.lock().await;
        self.start_locked(&mut slot).await
    }

    async fn start_locked(
        &self,
        slot: &mut MutexGuard<'_, Option<WorkerHandle>>,
    ) -> Result<u32, SupervisorError> {
        if let Some(pid) = self.reap_if_exited(slot) {
            return Err(SupervisorError::AlreadyRunning { pid });
        }

        self.transition(WorkerState::Starting, None, None);
        let mut spawned = match spawn_worker(&self.worker, &self.log_path) {
            Ok(spawned) => spawned,
            Err(e) => {
                self.transition(WorkerState::Stopped, None, None);
                return Err(e);
            }
        };
        let pid = spawned.pid;
        let started_at = Local::now();
        self.transition(WorkerState::Starting, Some(pid), Some(started_at));

        let grace = Duration::from_millis(self.timing.startup_grace_ms);
        match tokio::time::timeout(grace, spawned.child.wait()).await {
            Err(_) => {
                **slot = Some(WorkerHandle {
                    child: spawned.child,
                    pid,
                    started_at,
                });
                self.transition(WorkerState::Running, Some(pid), Some(started_at));
                Ok(pid)
            }
            Ok(Ok(exit)) => {
                let output = read_early_output(&self.log_path, spawned.log_offset);
                tracing::warn!(pid, exit_code = ?exit.code(), "worker exited during startup");
                // Leftover children in the group would otherwise keep writing.
                let _ = signal_group(pid, Signal::SIGKILL);
                self.transition(WorkerState::Stopped, None, None);
                Err(SupervisorError::StartFailed {
                    exit_code: exit.code(),
                    output,
                })
            }
            Ok(Err(e)) => {
                let _ = signal_group(pid, Signal::SIGKILL);
                self.transition(WorkerState::Stopped, None, None);
                Err(SupervisorError::Wait { pid, source: e })
            }
        }
    }

    /// Stop the worker: SIGTERM, wait, then SIGKILL if needed.
    ///
    /// The handle is cleared and the state is `stopped` afterwards, whatever
    /// happened along the way.
    pub async fn stop(&self) -> Result<StopOutcome, SupervisorError> {
        let mut slot = self.slot.lock().await;
        self.stop_locked(&mut slot).await
    }

    async fn stop_locked(
        &self,
        slot: &mut MutexGuard<'_, Option<WorkerHandle>>,
    ) -> Result<StopOutcome, SupervisorError> {
        if self.reap_if_exited(slot).is_none() {
            return Err(SupervisorError::NotRunning);
        }
        let Some(mut handle) = slot.take() else {
            return Err(SupervisorError::NotRunning);
        };

        self.transition(WorkerState::Stopping, Some(handle.pid), Some(handle.started_at));
        let result = self.terminate(&mut handle).await;
        self.transition(WorkerState::Stopped, None, None);

        match &result {
            Ok(outcome) => tracing::info!(
                pid = outcome.pid,
                forced = outcome.forced,
                exit_code = ?outcome.exit_code,
                "worker stopped"
            ),
            Err(e) => tracing::error!(pid = handle.pid, error = %e, "worker stop failed"),
        }
        result
    }

    async fn terminate(&self, handle: &mut WorkerHandle) -> Result<StopOutcome, SupervisorError> {
        let pid = handle.pid;

        match signal_group(pid, Signal::SIGTERM) {
            Ok(_) => {
                let grace = Duration::from_secs(self.timing.stop_timeout_secs);
                match tokio::time::timeout(grace, handle.child.wait()).await {
                    Ok(Ok(exit)) => {
                        return Ok(StopOutcome {
                            pid,
                            forced: false,
                            exit_code: exit.code(),
                        })
                    }
                    Ok(Err(e)) => tracing::warn!(pid, error = %e, "wait after SIGTERM failed"),
                    Err(_) => tracing::warn!(
                        pid,
                        timeout_secs = self.timing.stop_timeout_secs,
                        "worker ignored SIGTERM, force-killing"
                    ),
                }
            }
            Err(e) => tracing::warn!(pid, error = %e, "SIGTERM failed, force-killing"),
        }

        signal_group(pid, Signal::SIGKILL)?;
        // The leader may have left the group; kill it directly as well.
        let _ = handle.child.start_kill();

        let wait = Duration::from_secs(self.timing.kill_timeout_secs);
        match tokio::time::timeout(wait, handle.child.wait()).await {
            Ok(Ok(exit)) => Ok(StopOutcome {
                pid,
                forced: true,
                exit_code: exit.code(),
            }),
            Ok(Err(e)) => Err(SupervisorError::Wait { pid, source: e }),
            Err(_) => Err(SupervisorError::KillTimedOut { pid }),
        }
    }

    /// Stop a worker that an earlier overseer started and left running.
    ///
    /// Only touches the pid from the previous status file, and only while
    /// it is still a live group leader running the configured command.
    pub async fn reclaim_orphan(&self) -> Result<Option<StopOutcome>, SupervisorError> {
        let Some(pid) = self.previous_worker else {
            return Ok(None);
        };
        let slot = self.slot.lock().await;
        if slot.is_some() || !is_worker_process(pid, &self.worker) {
            return Ok(None);
        }
        tracing::warn!(pid, "worker left running by a previous overseer, stopping it");

        self.transition(WorkerState::Stopping, Some(pid), None);
        let result = terminate_group(
            pid,
            Duration::from_secs(self.timing.stop_timeout_secs),
            Duration::from_secs(self.timing.kill_timeout_secs),
        )
        .await;
        self.transition(WorkerState::Stopped, None, None);

        let forced = result?;
        Ok(Some(StopOutcome {
            pid,
            forced,
            exit_code: None,
        }))
    }

    /// Stop (if running), pause, start again. Holds the lifecycle lock
    /// throughout so nothing can interleave.
    pub async fn restart(&self) -> Result<u32, SupervisorError> {
        let mut slot = self.slot.lock().await;
        match self.stop_locked(&mut slot).await {
            Ok(_) | Err(SupervisorError::NotRunning) => {}
            Err(e) => return Err(e),
        }
        tokio::time::sleep(Duration::from_millis(self.timing.restart_delay_ms)).await;
        self.start_locked(&mut slot).await
    }

    /// If the recorded child has exited, clear it and mark the worker
    /// stopped. Returns the pid of a still-live child.
    fn reap_if_exited(&self, slot: &mut Option<WorkerHandle>) -> Option<u32> {
        let handle = slot.as_mut()?;
        let pid = handle.pid;
        match handle.child.try_wait() {
            Ok(None) => return Some(pid),
            Ok(Some(exit)) => {
                tracing::warn!(pid, exit_code = ?exit.code(), "worker exited unexpectedly");
            }
            Err(e) => {
                tracing::warn!(pid, error = %e, "liveness check failed, treating worker as gone");
            }
        }
        *slot = None;
        self.transition(WorkerState::Stopped, None, None);
        None
    }

    /// Current status. Self-heals to `stopped` when the worker is gone.
    ///
    /// Never waits: while a lifecycle operation holds the lock the report is
    /// built from the last published snapshot.
    pub fn status(&self) -> StatusReport {
        if let Ok(mut slot) = self.slot.try_lock() {
            self.reap_if_exited(&mut slot);
        }

        let snapshot = self.snapshot();
        let Some(pid) = snapshot.pid else {
            let mut report = StatusReport::stopped();
            report.status = snapshot.state;
            return report;
        };

        let uptime_secs = snapshot
            .started_at
            .map(|t| (Local::now() - t).num_seconds().max(0) as u64);
        let (cpu_percent, memory_percent) = self.sample_usage(pid);

        StatusReport {
            is_running: true,
            status: snapshot.state,
            pid: Some(pid),
            start_time: snapshot.started_at,
            uptime: uptime_secs.map(format_uptime),
            uptime_secs,
            cpu_percent,
            memory_percent,
        }
    }

    fn sample_usage(&self, pid: u32) -> (Option<f32>, Option<f32>) {
        let mut system = self
            .system
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let sys_pid = SysPid::from_u32(pid);
        system.refresh_memory();
        system.refresh_processes(ProcessesToUpdate::Some(&[sys_pid]), true);

        let Some(process) = system.process(sys_pid) else {
            return (None, None);
        };
        let total = system.total_memory();
        let memory = (total > 0).then(|| process.memory() as f32 / total as f32 * 100.0);
        (Some(process.cpu_usage()), memory)
    }
}
