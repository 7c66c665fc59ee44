use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Top-level configuration loaded from overseer.toml.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct OverseerConfig {
    pub worker: WorkerConfig,
    pub supervisor: SupervisorConfig,
    pub tail: TailConfig,
    pub history: HistoryConfig,
    pub hub: HubConfig,
    pub serve: ServeConfig,
    pub storage: StorageConfig,
}

/// How to launch the supervised worker and where it writes its log.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub command: String,
    pub args: Vec<String>,
    pub working_dir: PathBuf,
    pub env: BTreeMap<String, String>,
    pub log_file: PathBuf,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SupervisorConfig {
    /// An exit inside this window counts as a failed start.
    pub startup_grace_ms: u64,
    pub stop_timeout_secs: u64,
    /// How long to wait for the worker to be reaped after SIGKILL.
    pub kill_timeout_secs: u64,
    pub restart_delay_ms: u64,
    pub check_interval_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TailConfig {
    pub poll_interval_ms: u64,
    /// Upper bound on bytes consumed by a single poll.
    pub max_read_bytes: u64,
    /// Longest line kept whole; unterminated output is cut at this size.
    pub max_line_bytes: usize,
    /// At startup only this much of the end of an existing log is read.
    pub catchup_bytes: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct HistoryConfig {
    pub capacity: usize,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct HubConfig {
    /// Records buffered per subscriber before new ones are dropped for it.
    pub subscriber_buffer: usize,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ServeConfig {
    pub bind: String,
    pub port: u16,
    pub heartbeat_secs: u64,
    pub send_timeout_secs: u64,
    /// Records replayed to a viewer when it connects.
    pub backlog: usize,
    /// Cap on the recent-records query.
    pub max_recent: usize,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct StorageConfig {
    pub data_dir: PathBuf,
}

// --- Default implementations ---

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            command: "python3".to_string(),
            args: vec!["main.py".to_string()],
            working_dir: PathBuf::from("."),
            env: BTreeMap::new(),
            log_file: PathBuf::from("logs/app.log"),
        }
    }
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            startup_grace_ms: 1000,
            stop_timeout_secs: 10,
            kill_timeout_secs: 5,
            restart_delay_ms: 2000,
            check_interval_secs: 5,
        }
    }
}

impl Default for TailConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 500,
            max_read_bytes: 1024 * 1024,
            max_line_bytes: 64 * 1024,
            catchup_bytes: 1024 * 1024,
        }
    }
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self { capacity: 1000 }
    }
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            subscriber_buffer: 256,
        }
    }
}

impl Default for ServeConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1".to_string(),
            port: 8000,
            heartbeat_secs: 30,
            send_timeout_secs: 5,
            backlog: 100,
            max_recent: 1000,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from(".overseer"),
        }
    }
}

impl OverseerConfig {
    /// The worker log path, resolved against the worker's working directory.
    pub fn log_path(&self) -> PathBuf {
        if self.worker.log_file.is_absolute() {
            self.worker.log_file.clone()
        } else {
            self.worker.working_dir.join(&self.worker.log_file)
        }
    }
}

/// Load config from `path`. A missing file yields defaults.
pub fn load_config(path: &Path) -> Result<OverseerConfig, ConfigError> {
    let contents = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!(path = %path.display(), "no config file, using defaults");
            return Ok(OverseerConfig::default());
        }
        Err(e) => {
            return Err(ConfigError::Read {
                path: path.to_path_buf(),
                source: e,
            })
        }
    };

    toml::from_str(&contents).map_err(|e| ConfigError::Parse {
        path: path.to_path_buf(),
        source: e,
    })
}

/// Errors from loading the config file.
#[derive(Debug)]
pub enum ConfigError {
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Read { path, source } => {
                write!(f, "failed to read config {}: {source}", path.display())
            }
            ConfigError::Parse { path, source } => {
                write!(f, "invalid config {}: {source}", path.display())
            }
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Read { source, .. } => Some(source),
            ConfigError::Parse { source, .. } => Some(source),
        }
    }
}
