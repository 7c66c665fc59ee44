//! The controller every front end talks to.
//!
//! Owns the supervisor, the log feed and the tail loop, and keeps the tail
//! loop's lifetime matched to the worker's: it runs while a worker may be
//! writing, and gets one final drain pass when the worker stops or dies.

use crate::config::OverseerConfig;
use crate::feed::{drain_once, on_blocking_pool, pump_once, LogFeed, LogTail, SharedTail, TailLoop};
use crate::status::{OperationResult, StatusFile, StatusReport, WorkerState};
use crate::supervisor::{Supervisor, SupervisorError};
use crate::tail::TailCursor;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;

pub struct Overseer {
    supervisor: Supervisor,
    feed: Arc<LogFeed>,
    tail: SharedTail,
    /// Serialises lifecycle operations; holds the tail loop while it runs.
    control: Mutex<Option<TailLoop>>,
    poll_interval: Duration,
    check_interval: Duration,
}

impl Overseer {
    /// Build the controller and seed history from the end of whatever the
    /// log already holds (at most `tail.catchup_bytes` of it).
    pub fn new(config: &OverseerConfig, status_file: Option<StatusFile>) -> Arc<Self> {
        let log_path = config.log_path();
        let feed = LogFeed::new(config.history.capacity, config.hub.subscriber_buffer);
        let mut log_tail = LogTail::new(
            TailCursor::new(&log_path, config.tail.max_read_bytes),
            config.tail.max_line_bytes,
        );
        match log_tail.skip_to_tail(config.tail.catchup_bytes) {
            Ok(0) => {}
            Ok(skipped) => tracing::info!(skipped_bytes = skipped, "catching up from the end of a large log"),
            Err(e) => tracing::warn!(error = %e, "could not size log for catch-up, reading it whole"),
        }
        let tail: SharedTail = Arc::new(std::sync::Mutex::new(log_tail));

        let seeded = pump_once(&tail, &feed);
        tracing::info!(
            records = seeded,
            log = %log_path.display(),
            "seeded history from existing log"
        );

        let supervisor = Supervisor::new(
            config.worker.clone(),
            config.supervisor.clone(),
            log_path,
            status_file,
        );

        Arc::new(Self {
            supervisor,
            feed,
            tail,
            control: Mutex::new(None),
            poll_interval: Duration::from_millis(config.tail.poll_interval_ms.max(1)),
            check_interval: Duration::from_secs(config.supervisor.check_interval_secs.max(1)),
        })
    }

    pub fn feed(&self) -> &Arc<LogFeed> {
        &self.feed
    }

    pub fn status(&self) -> StatusReport {
        self.supervisor.status()
    }

    fn ensure_tail_loop(&self, slot: &mut Option<TailLoop>) {
        if slot.as_ref().is_some_and(|l| !l.is_finished()) {
            return;
        }
        *slot = Some(TailLoop::spawn(
            Arc::clone(&self.tail),
            Arc::clone(&self.feed),
            self.poll_interval,
        ));
    }

    async fn stop_tail_loop(&self, slot: &mut Option<TailLoop>) {
        if let Some(tail_loop) = slot.take() {
            tail_loop.stop().await;
        }
        on_blocking_pool(&self.tail, &self.feed, drain_once).await;
    }

    /// Stop a worker an earlier overseer left running, so a fresh start
    /// never runs two at once.
    pub async fn reclaim_orphan(&self) {
        let mut control = self.control.lock().await;
        match self.supervisor.reclaim_orphan().await {
            Ok(Some(outcome)) => {
                tracing::info!(pid = outcome.pid, forced = outcome.forced, "stopped leftover worker");
                self.stop_tail_loop(&mut control).await;
            }
            Ok(None) => {}
            Err(e) => tracing::error!(error = %e, "failed to stop leftover worker"),
        }
    }

    pub async fn start(&self) -> OperationResult {
        let mut control = self.control.lock().await;
        // Running before the spawn so startup output streams live.
        self.ensure_tail_loop(&mut control);
        match self.supervisor.start().await {
            Ok(pid) => OperationResult::ok(format!("worker started (pid {pid})"), Some(pid)),
            Err(SupervisorError::AlreadyRunning { pid }) => OperationResult {
                success: false,
                message: SupervisorError::AlreadyRunning { pid }.to_string(),
                pid: Some(pid),
            },
            Err(e) => {
                self.stop_tail_loop(&mut control).await;
                tracing::warn!(error = %e, "start failed");
                OperationResult::failed(e.to_string())
            }
        }
    }

    pub async fn stop(&self) -> OperationResult {
        let mut control = self.control.lock().await;
        let result = self.supervisor.stop().await;
        self.stop_tail_loop(&mut control).await;
        match result {
            Ok(outcome) if outcome.forced => OperationResult::ok(
                format!("worker force-killed (pid {})", outcome.pid),
                Some(outcome.pid),
            ),
            Ok(outcome) => {
                OperationResult::ok(format!("worker stopped (pid {})", outcome.pid), Some(outcome.pid))
            }
            Err(e) => OperationResult::failed(e.to_string()),
        }
    }

    pub async fn restart(&self) -> OperationResult {
        let mut control = self.control.lock().await;
        self.ensure_tail_loop(&mut control);
        match self.supervisor.restart().await {
            Ok(pid) => OperationResult::ok(format!("worker restarted (pid {pid})"), Some(pid)),
            Err(e) => {
                self.stop_tail_loop(&mut control).await;
                tracing::warn!(error = %e, "restart failed");
                OperationResult::failed(e.to_string())
            }
        }
    }

    /// One liveness pass: look at the worker and retire the tail loop if it
    /// died. Skipped while a lifecycle operation is in flight.
    pub async fn check(&self) -> StatusReport {
        let Ok(mut control) = self.control.try_lock() else {
            return self.supervisor.status();
        };
        let report = self.supervisor.status();
        if report.status == WorkerState::Stopped && control.is_some() {
            tracing::info!("worker is gone, stopping tail loop");
            self.stop_tail_loop(&mut control).await;
        }
        report
    }

    /// Run `check` every `supervisor.check_interval_secs` until `shutdown`
    /// flips.
    pub fn spawn_monitor(self: &Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(this.check_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = ticker.tick() => {
                        this.check().await;
                    }
                }
            }
            tracing::debug!("liveness monitor stopped");
        })
    }

    /// Stop the worker if it runs and retire the tail loop.
    pub async fn shutdown(&self) {
        let mut control = self.control.lock().await;
        match self.supervisor.stop().await {
            Ok(outcome) => tracing::info!(pid = outcome.pid, "worker stopped for shutdown"),
            Err(SupervisorError::NotRunning) => {}
            Err(e) => tracing::error!(error = %e, "failed to stop worker during shutdown"),
        }
        self.stop_tail_loop(&mut control).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{SupervisorConfig, TailConfig};
    use tempfile::{tempdir, TempDir};

    fn config(dir: &TempDir, script: &str) -> OverseerConfig {
        let mut config = OverseerConfig::default();
        config.worker.command = "sh".to_string();
        config.worker.args = vec!["-c".to_string(), script.to_string()];
        config.worker.working_dir = dir.path().to_path_buf();
        config.supervisor = SupervisorConfig {
            startup_grace_ms: 200,
            stop_timeout_secs: 1,
            kill_timeout_secs: 2,
            restart_delay_ms: 50,
            check_interval_secs: 1,
        };
        config.tail = TailConfig {
            poll_interval_ms: 20,
            ..Default::default()
        };
        config
    }

    fn messages(overseer: &Overseer) -> Vec<String> {
        overseer
            .feed()
            .recent(1000)
            .iter()
            .map(|e| e.record.message.clone())
            .collect()
    }

    #[tokio::test]
    async fn test_new_seeds_history_from_existing_log() {
        let dir = tempdir().unwrap();
        let config = config(&dir, "exec sleep 30");
        std::fs::create_dir_all(config.log_path().parent().unwrap()).unwrap();
        std::fs::write(config.log_path(), "INFO: one\n\nINFO: two\n").unwrap();

        let overseer = Overseer::new(&config, None);
        assert_eq!(messages(&overseer), vec!["one", "two"]);
    }

    #[tokio::test]
    async fn test_new_catches_up_from_end_of_large_log() {
        let dir = tempdir().unwrap();
        let mut config = config(&dir, "exec sleep 30");
        config.tail.catchup_bytes = 30;
        std::fs::create_dir_all(config.log_path().parent().unwrap()).unwrap();
        let log: String = (0..10).map(|i| format!("INFO: line {i:02}\n")).collect();
        std::fs::write(config.log_path(), log).unwrap();

        let overseer = Overseer::new(&config, None);
        assert_eq!(messages(&overseer), vec!["line 08", "line 09"]);
    }

    #[tokio::test]
    async fn test_worker_output_reaches_feed_and_final_drain() {
        let dir = tempdir().unwrap();
        let overseer = Overseer::new(
            &config(&dir, "printf 'INFO: hello\\nWARNING: no newline'; exec sleep 30"),
            None,
        );

        let started = overseer.start().await;
        assert!(started.success, "{}", started.message);
        assert!(started.pid.is_some());

        let stopped = overseer.stop().await;
        assert!(stopped.success);
        assert!(!overseer.status().is_running);
        assert_eq!(messages(&overseer), vec!["hello", "no newline"]);
        assert!(overseer.control.lock().await.is_none());
    }

    #[tokio::test]
    async fn test_failed_start_reports_and_keeps_output() {
        let dir = tempdir().unwrap();
        let overseer = Overseer::new(&config(&dir, "echo 'CRITICAL: bad token'; exit 2"), None);

        let result = overseer.start().await;
        assert!(!result.success);
        assert!(result.message.contains("code 2"));
        assert!(result.message.contains("bad token"));
        assert_eq!(messages(&overseer), vec!["bad token"]);
    }

    #[tokio::test]
    async fn test_stop_when_stopped_fails_softly() {
        let dir = tempdir().unwrap();
        let overseer = Overseer::new(&config(&dir, "exec sleep 30"), None);
        let result = overseer.stop().await;
        assert!(!result.success);
        assert_eq!(result.message, "worker is not running");
        assert!(result.pid.is_none());
    }

    #[tokio::test]
    async fn test_double_start_reports_running_pid() {
        let dir = tempdir().unwrap();
        let overseer = Overseer::new(&config(&dir, "exec sleep 30"), None);
        let first = overseer.start().await;
        let second = overseer.start().await;
        assert!(!second.success);
        assert_eq!(second.pid, first.pid);
        overseer.shutdown().await;
        assert!(!overseer.status().is_running);
    }

    #[tokio::test]
    async fn test_check_retires_tail_loop_after_crash() {
        let dir = tempdir().unwrap();
        let overseer = Overseer::new(&config(&dir, "sleep 0.4; echo 'ERROR: dying'; exit 1"), None);
        assert!(overseer.start().await.success);

        tokio::time::sleep(Duration::from_millis(900)).await;
        let report = overseer.check().await;
        assert!(!report.is_running);
        assert!(overseer.control.lock().await.is_none());
        assert_eq!(messages(&overseer), vec!["dying"]);
    }

    #[tokio::test]
    async fn test_restart_keeps_history_and_cursor() {
        let dir = tempdir().unwrap();
        let overseer = Overseer::new(&config(&dir, "echo 'INFO: boot'; exec sleep 30"), None);
        assert!(overseer.start().await.success);
        let restarted = overseer.restart().await;
        assert!(restarted.success, "{}", restarted.message);
        overseer.stop().await;
        // Output is appended, so both boots are seen exactly once each.
        assert_eq!(messages(&overseer), vec!["boot", "boot"]);
    }

    #[tokio::test]
    async fn test_monitor_notices_crash_on_its_own() {
        let dir = tempdir().unwrap();
        let overseer = Overseer::new(&config(&dir, "sleep 0.3; echo 'ERROR: gone'; exit 1"), None);
        assert!(overseer.start().await.success);

        let (tx, rx) = watch::channel(false);
        let monitor = overseer.spawn_monitor(rx);

        let noticed = tokio::time::timeout(Duration::from_millis(1500), async {
            loop {
                let retired = overseer.control.try_lock().is_ok_and(|c| c.is_none());
                if overseer.supervisor.snapshot().state == WorkerState::Stopped && retired {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await;
        assert!(noticed.is_ok(), "monitor did not retire the dead worker");
        assert_eq!(messages(&overseer), vec!["gone"]);

        tx.send(true).unwrap();
        monitor.await.unwrap();
    }

    #[tokio::test]
    async fn test_reclaim_orphan_without_previous_status_is_noop() {
        let dir = tempdir().unwrap();
        let status = StatusFile::new(dir.path().join("status"));
        let overseer = Overseer::new(&config(&dir, "exec sleep 30"), Some(status));
        overseer.reclaim_orphan().await;
        assert!(!overseer.status().is_running);
        assert!(overseer.start().await.success);
        overseer.shutdown().await;
    }

    #[tokio::test]
    async fn test_monitor_stops_on_shutdown_signal() {
        let dir = tempdir().unwrap();
        let overseer = Overseer::new(&config(&dir, "exec sleep 30"), None);
        let (tx, rx) = watch::channel(false);
        let handle = overseer.spawn_monitor(rx);
        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
