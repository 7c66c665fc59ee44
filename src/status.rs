/// Worker status: the state machine, the report returned by status queries,
/// and the `status` file rewritten on every transition.
///
/// The file uses the atomic write pattern: write a temp file, then rename.
use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

/// Lifecycle of the supervised worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

impl WorkerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerState::Stopped => "stopped",
            WorkerState::Starting => "starting",
            WorkerState::Running => "running",
            WorkerState::Stopping => "stopping",
        }
    }
}

/// Answer to a status query.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusReport {
    pub is_running: bool,
    pub status: WorkerState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Local>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uptime: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uptime_secs: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cpu_percent: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory_percent: Option<f32>,
}

impl StatusReport {
    pub fn stopped() -> Self {
        Self {
            is_running: false,
            status: WorkerState::Stopped,
            pid: None,
            start_time: None,
            uptime: None,
            uptime_secs: None,
            cpu_percent: None,
            memory_percent: None,
        }
    }
}

/// Outcome of start/stop/restart as reported to callers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationResult {
    pub success: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
}

impl OperationResult {
    pub fn ok(message: impl Into<String>, pid: Option<u32>) -> Self {
        Self {
            success: true,
            message: message.into(),
            pid,
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
            pid: None,
        }
    }
}

/// "1d 2h 3m 4s", "2h 3m 4s", "3m 4s" or "4s".
pub fn format_uptime(secs: u64) -> String {
    let days = secs / 86_400;
    let hours = (secs % 86_400) / 3600;
    let minutes = (secs % 3600) / 60;
    let seconds = secs % 60;
    if days > 0 {
        format!("{days}d {hours}h {minutes}m {seconds}s")
    } else if hours > 0 {
        format!("{hours}h {minutes}m {seconds}s")
    } else if minutes > 0 {
        format!("{minutes}m {seconds}s")
    } else {
        format!("{seconds}s")
    }
}

/// The JSON payload written to the status file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusData {
    /// Pid of the overseer itself.
    pub overseer_pid: u32,
    pub state: WorkerState,
    pub worker_pid: Option<u32>,
    pub started_at: Option<DateTime<Local>>,
    pub log_file: PathBuf,
    pub last_update: DateTime<Local>,
}

pub struct StatusFile {
    path: PathBuf,
}

impl StatusFile {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    /// Atomically replace the status file with `data`.
    pub fn write(&self, data: &StatusData) -> Result<(), StatusError> {
        let json =
            serde_json::to_string_pretty(data).map_err(|e| StatusError::Serialize { source: e })?;

        let dir = self.path.parent().unwrap_or(Path::new("."));
        let mut tmp = NamedTempFile::new_in(dir).map_err(|e| StatusError::Write {
            path: dir.to_path_buf(),
            source: e,
        })?;
        std::io::Write::write_all(&mut tmp, json.as_bytes()).map_err(|e| StatusError::Write {
            path: tmp.path().to_path_buf(),
            source: e,
        })?;

        tmp.persist(&self.path).map_err(|e| StatusError::Rename {
            from: e.file.path().to_path_buf(),
            to: self.path.clone(),
            source: e.error,
        })?;
        Ok(())
    }

    pub fn read(&self) -> Result<StatusData, StatusError> {
        let contents = std::fs::read_to_string(&self.path).map_err(|e| StatusError::Read {
            path: self.path.clone(),
            source: e,
        })?;
        serde_json::from_str(&contents).map_err(|e| StatusError::Serialize { source: e })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Errors from status file operations.
#[derive(Debug)]
pub enum StatusError {
    Serialize {
        source: serde_json::Error,
    },
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
    Rename {
        from: PathBuf,
        to: PathBuf,
        source: std::io::Error,
    },
}

impl std::fmt::Display for StatusError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StatusError::Serialize { source } => write!(f, "invalid status data: {source}"),
            StatusError::Read { path, source } => {
                write!(f, "failed to read status file {}: {source}", path.display())
            }
            StatusError::Write { path, source } => {
                write!(
                    f,
                    "failed to write temp status file in {}: {source}",
                    path.display()
                )
            }
            StatusError::Rename { from, to, source } => {
                write!(
                    f,
                    "failed to rename {} -> {}: {source}",
                    from.display(),
                    to.display()
                )
            }
        }
    }
}

impl std::error::Error for StatusError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            StatusError::Serialize { source } => Some(source),
            StatusError::Read { source, .. } => Some(source),
            StatusError::Write { source, .. } => Some(source),
            StatusError::Rename { source, .. } => Some(source),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn sample(state: WorkerState) -> StatusData {
        StatusData {
            overseer_pid: 12345,
            state,
            worker_pid: Some(777),
            started_at: Some(Local::now()),
            log_file: PathBuf::from("logs/app.log"),
            last_update: Local::now(),
        }
    }

    #[test]
    fn test_status_file_write_then_read() {
        let dir = tempdir().unwrap();
        let sf = StatusFile::new(dir.path().join("status"));

        sf.write(&sample(WorkerState::Running)).unwrap();

        let contents = std::fs::read_to_string(sf.path()).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&contents).unwrap();
        assert_eq!(parsed["state"], "running");
        assert_eq!(parsed["worker_pid"], 777);
        assert_eq!(parsed["log_file"], "logs/app.log");

        let back = sf.read().unwrap();
        assert_eq!(back.state, WorkerState::Running);
        assert_eq!(back.overseer_pid, 12345);

        // Only the status file remains: the temp file was renamed into place.
        let entries: Vec<_> = std::fs::read_dir(dir.path()).unwrap().collect();
        assert_eq!(entries.len(), 1);
    }

    #[test]
    fn test_status_file_overwrite_and_remove() {
        let dir = tempdir().unwrap();
        let sf = StatusFile::new(dir.path().join("status"));

        sf.write(&sample(WorkerState::Starting)).unwrap();
        sf.write(&sample(WorkerState::Stopping)).unwrap();
        assert_eq!(sf.read().unwrap().state, WorkerState::Stopping);

        std::fs::remove_file(sf.path()).unwrap();
        assert!(matches!(sf.read(), Err(StatusError::Read { .. })));
    }

    #[test]
    fn test_status_file_write_to_nonexistent_dir_fails() {
        let sf = StatusFile::new(PathBuf::from("/nonexistent/dir/status"));
        let err = sf.write(&sample(WorkerState::Stopped)).unwrap_err();
        assert!(err.to_string().contains("failed to write temp status file"));
    }

    #[test]
    fn test_worker_states_serialize() {
        for (state, expected) in [
            (WorkerState::Stopped, "stopped"),
            (WorkerState::Starting, "starting"),
            (WorkerState::Running, "running"),
            (WorkerState::Stopping, "stopping"),
        ] {
            assert_eq!(serde_json::to_string(&state).unwrap(), format!("\"{expected}\""));
            assert_eq!(state.as_str(), expected);
        }
    }

    #[test]
    fn test_stopped_report_omits_process_fields() {
        let json = serde_json::to_value(StatusReport::stopped()).unwrap();
        assert_eq!(json["is_running"], false);
        assert_eq!(json["status"], "stopped");
        assert!(json.get("pid").is_none());
        assert!(json.get("uptime").is_none());
    }

    #[test]
    fn test_operation_result_shape() {
        let json = serde_json::to_value(OperationResult::ok("started", Some(42))).unwrap();
        assert_eq!(json["success"], true);
        assert_eq!(json["pid"], 42);

        let json = serde_json::to_value(OperationResult::failed("not running")).unwrap();
        assert_eq!(json["success"], false);
        assert_eq!(json["message"], "not running");
        assert!(json.get("pid").is_none());
    }

    #[test]
    fn test_format_uptime() {
        assert_eq!(format_uptime(0), "0s");
        assert_eq!(format_uptime(59), "59s");
        assert_eq!(format_uptime(61), "1m 1s");
        assert_eq!(format_uptime(3600), "1h 0m 0s");
        assert_eq!(format_uptime(7384), "2h 3m 4s");
        assert_eq!(format_uptime(86_400 + 7384), "1d 2h 3m 4s");
    }
}
