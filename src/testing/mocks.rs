//! Mock implementations for testing
//!
//! Provides mock Platform and EngineControl implementations to enable
//! comprehensive testing without external dependencies.

use crate::engine::{EngineControl, EngineError};
use crate::protocol::frames::ControlFrame;
use crate::protocol::model::{
    AgentIdentity, AgentMetrics, AppliedConfig, EngineStatus, PipelineConfig, StatusReport,
};
use crate::transport::{Platform, TransportError};
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

/// Mock platform recording every call
#[derive(Default)]
pub struct MockPlatform {
    pub registrations: Arc<Mutex<Vec<AgentIdentity>>>,
    pub heartbeats: Arc<Mutex<Vec<String>>>,
    pub status_reports: Arc<Mutex<Vec<(String, StatusReport)>>>,
    pub applied_reports: Arc<Mutex<Vec<(String, AppliedConfig)>>>,
    pub metrics_reports: Arc<Mutex<Vec<(String, AgentMetrics)>>>,
    pub sent_frames: Arc<Mutex<Vec<ControlFrame>>>,
    pub configs: Arc<Mutex<HashMap<String, PipelineConfig>>>,
    pub should_fail: Arc<AtomicBool>,
    pub channel_connected: Arc<AtomicBool>,
}

impl MockPlatform {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every operation fails with a transport error
    pub fn failing() -> Self {
        let platform = Self::default();
        platform.should_fail.store(true, Ordering::SeqCst);
        platform
    }

    /// Flip failure mode at runtime
    pub fn set_failing(&self, failing: bool) {
        self.should_fail.store(failing, Ordering::SeqCst);
    }

    /// Seed a config the mock platform will serve on fetch
    pub async fn put_config(&self, config: PipelineConfig) {
        self.configs.lock().await.insert(config.id.clone(), config);
    }

    pub fn set_channel_connected(&self, connected: bool) {
        self.channel_connected.store(connected, Ordering::SeqCst);
    }

    fn fail_if_configured(&self) -> Result<(), TransportError> {
        if self.should_fail.load(Ordering::SeqCst) {
            Err(TransportError::NotConnected)
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl Platform for MockPlatform {
    async fn register(&self, identity: &AgentIdentity) -> Result<(), TransportError> {
        self.fail_if_configured()?;
        self.registrations.lock().await.push(identity.clone());
        Ok(())
    }

    async fn send_heartbeat(&self, agent_id: &str) -> Result<(), TransportError> {
        self.fail_if_configured()?;
        self.heartbeats.lock().await.push(agent_id.to_string());
        Ok(())
    }

    async fn report_status(
        &self,
        agent_id: &str,
        report: &StatusReport,
    ) -> Result<(), TransportError> {
        self.fail_if_configured()?;
        self.status_reports
            .lock()
            .await
            .push((agent_id.to_string(), report.clone()));
        Ok(())
    }

    async fn fetch_config(&self, config_id: &str) -> Result<PipelineConfig, TransportError> {
        self.fail_if_configured()?;
        self.configs
            .lock()
            .await
            .get(config_id)
            .cloned()
            .ok_or(TransportError::RemoteRejected {
                status: 404,
                body: format!("config {config_id} not found"),
            })
    }

    async fn report_config_applied(
        &self,
        agent_id: &str,
        applied: &AppliedConfig,
    ) -> Result<(), TransportError> {
        self.fail_if_configured()?;
        self.applied_reports
            .lock()
            .await
            .push((agent_id.to_string(), applied.clone()));
        Ok(())
    }

    async fn report_metrics(
        &self,
        agent_id: &str,
        metrics: &AgentMetrics,
    ) -> Result<(), TransportError> {
        self.fail_if_configured()?;
        self.metrics_reports
            .lock()
            .await
            .push((agent_id.to_string(), metrics.clone()));
        Ok(())
    }

    fn is_channel_connected(&self) -> bool {
        self.channel_connected.load(Ordering::SeqCst)
    }

    async fn send_frame(&self, frame: &ControlFrame) -> Result<(), TransportError> {
        if !self.is_channel_connected() {
            return Err(TransportError::NotConnected);
        }
        self.fail_if_configured()?;
        self.sent_frames.lock().await.push(frame.clone());
        Ok(())
    }
}

/// Mock engine supervisor with togglable behavior
pub struct MockEngine {
    pub running: Arc<AtomicBool>,
    pub start_count: Arc<AtomicU64>,
    pub stop_count: Arc<AtomicU64>,
    pub reload_count: Arc<AtomicU64>,
    pub validated_paths: Arc<Mutex<Vec<PathBuf>>>,
    pub fail_start: Arc<AtomicBool>,
    pub fail_validation: Arc<AtomicBool>,
    pub fail_reload: Arc<AtomicBool>,
    pub version: String,
    config_dir: PathBuf,
}

impl Default for MockEngine {
    fn default() -> Self {
        Self {
            running: Arc::new(AtomicBool::new(false)),
            start_count: Arc::new(AtomicU64::new(0)),
            stop_count: Arc::new(AtomicU64::new(0)),
            reload_count: Arc::new(AtomicU64::new(0)),
            validated_paths: Arc::new(Mutex::new(Vec::new())),
            fail_start: Arc::new(AtomicBool::new(false)),
            fail_validation: Arc::new(AtomicBool::new(false)),
            fail_reload: Arc::new(AtomicBool::new(false)),
            version: "8.0.0-mock".to_string(),
            config_dir: PathBuf::from("/tmp/mock-conf.d"),
        }
    }
}

impl MockEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// A mock engine that reports as already running
    pub fn running() -> Self {
        let engine = Self::default();
        engine.running.store(true, Ordering::SeqCst);
        engine
    }

    pub fn set_running(&self, running: bool) {
        self.running.store(running, Ordering::SeqCst);
    }

    pub fn reloads(&self) -> u64 {
        self.reload_count.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EngineControl for MockEngine {
    async fn start(&self) -> Result<(), EngineError> {
        if self.fail_start.load(Ordering::SeqCst) {
            return Err(EngineError::StartupFailed {
                message: "mock startup failure".to_string(),
            });
        }
        self.start_count.fetch_add(1, Ordering::SeqCst);
        self.running.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn stop(&self, _deadline: Duration) -> Result<(), EngineError> {
        self.stop_count.fetch_add(1, Ordering::SeqCst);
        self.running.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn restart(&self, deadline: Duration) -> Result<(), EngineError> {
        self.stop(deadline).await?;
        self.start().await
    }

    async fn reload(&self) -> Result<(), EngineError> {
        if !self.running.load(Ordering::SeqCst) {
            return Err(EngineError::NotRunning);
        }
        if self.fail_reload.load(Ordering::SeqCst) {
            return Err(EngineError::Signal("mock reload failure".to_string()));
        }
        self.reload_count.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn validate(&self, config_path: &Path) -> Result<(), EngineError> {
        self.validated_paths
            .lock()
            .await
            .push(config_path.to_path_buf());
        if self.fail_validation.load(Ordering::SeqCst) {
            return Err(EngineError::ValidationFailed {
                output: "mock: ERROR invalid pipeline".to_string(),
            });
        }
        Ok(())
    }

    async fn status(&self) -> EngineStatus {
        let running = self.running.load(Ordering::SeqCst);
        EngineStatus {
            running,
            pid: if running { 4242 } else { 0 },
            version: self.version.clone(),
            config_dir: self.config_dir.clone(),
            start_time: None,
            last_reload_time: None,
        }
    }

    async fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}
