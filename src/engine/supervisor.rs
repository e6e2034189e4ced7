//! Engine process supervisor
//!
//! Single-process ownership as a tagged state machine: the child handle
//! lives inside the state and is only reachable under the supervisor's
//! lock. Readiness is a fixed grace period after spawn verifying the
//! child has not already exited, bounded by a hard startup deadline so a
//! missing readiness marker can never block forever.

use crate::config::EngineSection;
use crate::engine::command;
use crate::engine::logpump::LogPump;
use crate::engine::{EngineControl, EngineError};
use crate::protocol::model::EngineStatus;
use chrono::Utc;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::process::Child;
use tokio::sync::{Mutex, RwLock};
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(500);
const VERSION_PROBE_TIMEOUT: Duration = Duration::from_secs(10);
const MAX_VALIDATE_OUTPUT: usize = 500;

/// Process ownership states
enum ProcessState {
    Stopped,
    Running {
        child: Child,
        pid: u32,
        pump: Option<LogPump>,
        run_cancel: CancellationToken,
    },
    Exited {
        code: Option<i32>,
    },
}

/// Supervisor owning at most one child engine process
pub struct EngineSupervisor {
    settings: EngineSection,
    state: Arc<Mutex<ProcessState>>,
    status: Arc<RwLock<EngineStatus>>,
    cancel: CancellationToken,
}

impl EngineSupervisor {
    pub fn new(settings: EngineSection, cancel: CancellationToken) -> Self {
        let status = EngineStatus::stopped(settings.config_dir.clone());
        Self {
            settings,
            state: Arc::new(Mutex::new(ProcessState::Stopped)),
            status: Arc::new(RwLock::new(status)),
            cancel,
        }
    }

    async fn start_inner(&self) -> Result<(), EngineError> {
        // Spawn under the lock; the child handle moves into the state
        {
            let mut state = self.state.lock().await;
            match &*state {
                ProcessState::Stopped | ProcessState::Exited { .. } => {}
                ProcessState::Running { pid, .. } => {
                    return Err(EngineError::AlreadyRunning { pid: *pid })
                }
            }

            let mut child = command::build_run_command(&self.settings)
                .spawn()
                .map_err(|e| {
                    EngineError::io(
                        format!("spawning {}", self.settings.binary_path.display()),
                        e,
                    )
                })?;
            let pid = child.id().unwrap_or(0);
            let run_cancel = self.cancel.child_token();
            let pump = match (child.stdout.take(), child.stderr.take()) {
                (Some(stdout), Some(stderr)) => {
                    Some(LogPump::spawn(stdout, stderr, run_cancel.clone()))
                }
                _ => None,
            };

            *state = ProcessState::Running {
                child,
                pid,
                pump,
                run_cancel,
            };
            info!(pid, binary = %self.settings.binary_path.display(), "engine spawned");
        }

        // Readiness gate: fixed grace, polling for an early exit
        let grace = Duration::from_secs(self.settings.startup_grace_secs);
        let started = Instant::now();
        while started.elapsed() < grace {
            sleep(EXIT_POLL_INTERVAL.min(grace)).await;

            let mut state = self.state.lock().await;
            let exited = match &mut *state {
                ProcessState::Running { child, .. } => child
                    .try_wait()
                    .map_err(|e| EngineError::io("polling engine during startup", e))?,
                _ => {
                    return Err(EngineError::StartupFailed {
                        message: "engine was stopped during startup".to_string(),
                    })
                }
            };

            if let Some(exit) = exited {
                let code = exit.code();
                let prev = std::mem::replace(&mut *state, ProcessState::Exited { code });
                drop(state);
                if let ProcessState::Running {
                    pump, run_cancel, ..
                } = prev
                {
                    run_cancel.cancel();
                    if let Some(pump) = pump {
                        pump.shutdown().await;
                    }
                }
                return Err(EngineError::StartupFailed {
                    message: format!("engine exited with {code:?} during startup grace"),
                });
            }
        }

        // The child survived the grace period: observably running
        {
            let state = self.state.lock().await;
            if let ProcessState::Running { pid, .. } = &*state {
                let mut status = self.status.write().await;
                status.running = true;
                status.pid = *pid;
                status.start_time = Some(Utc::now());
            }
        }

        if let Some(version) = self.detect_version().await {
            info!(version = %version, "engine version detected");
            self.status.write().await.version = version;
        } else {
            warn!("could not detect engine version");
        }

        self.spawn_exit_watcher();
        info!("engine running");
        Ok(())
    }

    /// Probe `<binary> --version` once after a successful start
    async fn detect_version(&self) -> Option<String> {
        let probe = command::build_version_command(&self.settings.binary_path).output();
        match timeout(VERSION_PROBE_TIMEOUT, probe).await {
            Ok(Ok(output)) => {
                let stdout = String::from_utf8_lossy(&output.stdout);
                command::parse_version_output(&stdout)
            }
            Ok(Err(e)) => {
                warn!(error = %e, "version probe failed");
                None
            }
            Err(_) => {
                warn!("version probe timed out");
                None
            }
        }
    }

    /// Watch for the child exiting underneath us
    fn spawn_exit_watcher(&self) {
        let state = self.state.clone();
        let status = self.status.clone();
        let cancel = self.cancel.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = sleep(EXIT_POLL_INTERVAL) => {}
                }

                let mut guard = state.lock().await;
                match &mut *guard {
                    ProcessState::Running { child, pid, .. } => {
                        match child.try_wait() {
                            Ok(Some(exit)) => {
                                let pid = *pid;
                                let code = exit.code();
                                warn!(pid, code = ?code, "engine exited unexpectedly");
                                let prev =
                                    std::mem::replace(&mut *guard, ProcessState::Exited { code });
                                drop(guard);

                                if let ProcessState::Running {
                                    pump, run_cancel, ..
                                } = prev
                                {
                                    run_cancel.cancel();
                                    if let Some(pump) = pump {
                                        pump.shutdown().await;
                                    }
                                }
                                let mut status = status.write().await;
                                status.running = false;
                                status.pid = 0;
                                break;
                            }
                            Ok(None) => {}
                            Err(e) => {
                                warn!(error = %e, "engine exit poll failed");
                            }
                        }
                    }
                    _ => break,
                }
            }
            debug!("engine exit watcher stopped");
        });
    }
}

#[async_trait::async_trait]
impl EngineControl for EngineSupervisor {
    async fn start(&self) -> Result<(), EngineError> {
        let deadline = Duration::from_secs(self.settings.startup_timeout_secs);
        match timeout(deadline, self.start_inner()).await {
            Ok(result) => result,
            Err(_) => {
                // Leave no half-started child behind
                if let Err(e) = self.stop(Duration::from_secs(5)).await {
                    warn!(error = %e, "cleanup after startup timeout failed");
                }
                Err(EngineError::StartupTimeout {
                    secs: deadline.as_secs(),
                })
            }
        }
    }

    async fn stop(&self, deadline: Duration) -> Result<(), EngineError> {
        let mut state = self.state.lock().await;
        let prev = std::mem::replace(&mut *state, ProcessState::Stopped);
        let (mut child, pid, pump, run_cancel) = match prev {
            // Stopping an already-stopped supervisor is success
            ProcessState::Stopped | ProcessState::Exited { .. } => return Ok(()),
            ProcessState::Running {
                child,
                pid,
                pump,
                run_cancel,
            } => (child, pid, pump, run_cancel),
        };

        info!(pid, "stopping engine");
        if let Err(e) = send_signal(pid, libc::SIGTERM) {
            warn!(pid, error = %e, "SIGTERM delivery failed, waiting anyway");
        }

        match timeout(deadline, child.wait()).await {
            Ok(Ok(exit)) => {
                info!(pid, code = ?exit.code(), "engine exited after SIGTERM");
            }
            Ok(Err(e)) => {
                return Err(EngineError::io("waiting for engine exit", e));
            }
            Err(_) => {
                warn!(pid, deadline_secs = deadline.as_secs(), "engine ignored SIGTERM, sending SIGKILL");
                child
                    .start_kill()
                    .map_err(|e| EngineError::io("sending SIGKILL", e))?;
                let exit = child
                    .wait()
                    .await
                    .map_err(|e| EngineError::io("waiting for engine exit after SIGKILL", e))?;
                info!(pid, code = ?exit.code(), "engine exited after SIGKILL");
            }
        }
        drop(state);

        run_cancel.cancel();
        if let Some(pump) = pump {
            pump.shutdown().await;
        }

        let mut status = self.status.write().await;
        status.running = false;
        status.pid = 0;
        Ok(())
    }

    async fn restart(&self, deadline: Duration) -> Result<(), EngineError> {
        self.stop(deadline).await?;
        self.start().await
    }

    async fn reload(&self) -> Result<(), EngineError> {
        let pid = {
            let state = self.state.lock().await;
            match &*state {
                ProcessState::Running { pid, .. } => *pid,
                _ => return Err(EngineError::NotRunning),
            }
        };

        send_signal(pid, libc::SIGHUP)?;
        self.status.write().await.last_reload_time = Some(Utc::now());
        info!(pid, "engine reload signalled");
        Ok(())
    }

    async fn validate(&self, config_path: &Path) -> Result<(), EngineError> {
        debug!(path = %config_path.display(), "validating config");
        let output = command::build_validate_command(&self.settings.binary_path, config_path)
            .output()
            .await
            .map_err(|e| EngineError::io("running config validation", e))?;

        let combined = format!(
            "{}{}",
            String::from_utf8_lossy(&output.stdout),
            String::from_utf8_lossy(&output.stderr)
        );
        if command::validation_ok(output.status.success(), &combined) {
            Ok(())
        } else {
            let mut output = combined;
            if output.len() > MAX_VALIDATE_OUTPUT {
                output.truncate(
                    (0..=MAX_VALIDATE_OUTPUT)
                        .rev()
                        .find(|i| output.is_char_boundary(*i))
                        .unwrap_or(0),
                );
            }
            Err(EngineError::ValidationFailed { output })
        }
    }

    async fn status(&self) -> EngineStatus {
        self.status.read().await.clone()
    }

    async fn is_running(&self) -> bool {
        self.status.read().await.running
    }
}

/// Deliver a POSIX signal to the child
fn send_signal(pid: u32, signal: libc::c_int) -> Result<(), EngineError> {
    if pid == 0 {
        return Err(EngineError::NotRunning);
    }
    let rc = unsafe { libc::kill(pid as libc::pid_t, signal) };
    if rc == 0 {
        Ok(())
    } else {
        Err(EngineError::Signal(
            std::io::Error::last_os_error().to_string(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_settings(binary: &Path) -> EngineSection {
        EngineSection {
            binary_path: binary.to_path_buf(),
            config_dir: binary.parent().unwrap().join("conf.d"),
            data_dir: binary.parent().unwrap().join("data"),
            log_dir: binary.parent().unwrap().join("logs"),
            workers: None,
            batch_size: None,
            auto_reload: false,
            startup_grace_secs: 1,
            startup_timeout_secs: 10,
        }
    }

    /// Write a small shell script acting as the engine binary; the
    /// version probe is answered up front so start() never waits on it
    fn fake_engine(dir: &Path, body: &str) -> std::path::PathBuf {
        use std::os::unix::fs::PermissionsExt;
        let path = dir.join("engine.sh");
        let script = format!(
            "#!/bin/sh\nif [ \"$1\" = \"--version\" ]; then echo \"engine 9.9.9\"; exit 0; fi\n{body}\n"
        );
        std::fs::write(&path, script).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    #[tokio::test]
    async fn test_initial_status_is_stopped() {
        let dir = tempfile::tempdir().unwrap();
        let binary = fake_engine(dir.path(), "sleep 60");
        let supervisor = EngineSupervisor::new(test_settings(&binary), CancellationToken::new());

        let status = supervisor.status().await;
        assert!(!status.running);
        assert_eq!(status.pid, 0);
        assert!(!supervisor.is_running().await);
    }

    #[tokio::test]
    async fn test_start_then_stop() {
        let dir = tempfile::tempdir().unwrap();
        let binary = fake_engine(dir.path(), "sleep 60");
        let supervisor = EngineSupervisor::new(test_settings(&binary), CancellationToken::new());

        supervisor.start().await.unwrap();
        let status = supervisor.status().await;
        assert!(status.running);
        assert_ne!(status.pid, 0);
        assert_eq!(status.version, "9.9.9");
        assert!(status.start_time.is_some());

        supervisor.stop(Duration::from_secs(10)).await.unwrap();
        let status = supervisor.status().await;
        assert!(!status.running);
        assert_eq!(status.pid, 0);
    }

    #[tokio::test]
    async fn test_start_rejected_while_running() {
        let dir = tempfile::tempdir().unwrap();
        let binary = fake_engine(dir.path(), "sleep 60");
        let supervisor = EngineSupervisor::new(test_settings(&binary), CancellationToken::new());

        supervisor.start().await.unwrap();
        assert!(matches!(
            supervisor.start().await,
            Err(EngineError::AlreadyRunning { .. })
        ));
        supervisor.stop(Duration::from_secs(10)).await.unwrap();
    }

    #[tokio::test]
    async fn test_early_exit_is_startup_failure() {
        let dir = tempfile::tempdir().unwrap();
        let binary = fake_engine(dir.path(), "exit 3");
        let supervisor = EngineSupervisor::new(test_settings(&binary), CancellationToken::new());

        let result = supervisor.start().await;
        assert!(matches!(result, Err(EngineError::StartupFailed { .. })));
        assert!(!supervisor.is_running().await);
    }

    #[tokio::test]
    async fn test_restart_replaces_the_process() {
        let dir = tempfile::tempdir().unwrap();
        let binary = fake_engine(dir.path(), "sleep 60");
        let supervisor = EngineSupervisor::new(test_settings(&binary), CancellationToken::new());

        supervisor.start().await.unwrap();
        let first_pid = supervisor.status().await.pid;

        supervisor.restart(Duration::from_secs(10)).await.unwrap();
        let status = supervisor.status().await;
        assert!(status.running);
        assert_ne!(status.pid, 0);
        assert_ne!(status.pid, first_pid);

        supervisor.stop(Duration::from_secs(10)).await.unwrap();
    }

    #[tokio::test]
    async fn test_stop_when_stopped_is_success() {
        let dir = tempfile::tempdir().unwrap();
        let binary = fake_engine(dir.path(), "sleep 60");
        let supervisor = EngineSupervisor::new(test_settings(&binary), CancellationToken::new());
        supervisor.stop(Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test]
    async fn test_reload_rejected_when_not_running() {
        let dir = tempfile::tempdir().unwrap();
        let binary = fake_engine(dir.path(), "sleep 60");
        let supervisor = EngineSupervisor::new(test_settings(&binary), CancellationToken::new());

        assert!(matches!(
            supervisor.reload().await,
            Err(EngineError::NotRunning)
        ));
    }

    #[tokio::test]
    async fn test_reload_updates_last_reload_time() {
        let dir = tempfile::tempdir().unwrap();
        let binary = fake_engine(
            dir.path(),
            "trap '' HUP\nsleep 60",
        );
        let supervisor = EngineSupervisor::new(test_settings(&binary), CancellationToken::new());

        supervisor.start().await.unwrap();
        assert!(supervisor.status().await.last_reload_time.is_none());
        supervisor.reload().await.unwrap();
        assert!(supervisor.status().await.last_reload_time.is_some());
        supervisor.stop(Duration::from_secs(10)).await.unwrap();
    }

    #[tokio::test]
    async fn test_validate_passes_on_clean_output() {
        let dir = tempfile::tempdir().unwrap();
        let binary = fake_engine(dir.path(), r#"echo "Configuration OK"; exit 0"#);
        let supervisor = EngineSupervisor::new(test_settings(&binary), CancellationToken::new());

        supervisor
            .validate(Path::new("/tmp/whatever.conf"))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_validate_fails_on_nonzero_exit() {
        let dir = tempfile::tempdir().unwrap();
        let binary = fake_engine(dir.path(), "exit 1");
        let supervisor = EngineSupervisor::new(test_settings(&binary), CancellationToken::new());

        assert!(matches!(
            supervisor.validate(Path::new("/tmp/c.conf")).await,
            Err(EngineError::ValidationFailed { .. })
        ));
    }

    #[tokio::test]
    async fn test_validate_fails_on_error_marker() {
        let dir = tempfile::tempdir().unwrap();
        let binary = fake_engine(dir.path(), r#"echo "ERROR: bad pipeline"; exit 0"#);
        let supervisor = EngineSupervisor::new(test_settings(&binary), CancellationToken::new());

        let result = supervisor.validate(Path::new("/tmp/c.conf")).await;
        match result {
            Err(EngineError::ValidationFailed { output }) => {
                assert!(output.contains("ERROR"));
            }
            other => panic!("expected validation failure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_exit_watcher_clears_running_state() {
        let dir = tempfile::tempdir().unwrap();
        // Engine survives the 1s grace, then dies on its own
        let binary = fake_engine(dir.path(), "sleep 2");
        let supervisor = EngineSupervisor::new(test_settings(&binary), CancellationToken::new());

        supervisor.start().await.unwrap();
        assert!(supervisor.is_running().await);

        // The watcher polls every 500ms; give it time to observe the exit
        tokio::time::timeout(Duration::from_secs(10), async {
            while supervisor.is_running().await {
                sleep(Duration::from_millis(100)).await;
            }
        })
        .await
        .expect("watcher should notice the engine exiting");

        let status = supervisor.status().await;
        assert_eq!(status.pid, 0);
    }
}
