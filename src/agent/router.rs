//! Inbound control-frame router
//!
//! Serves the control channel's inbound side. Frames arrive through a
//! bounded queue and a single worker drains them sequentially, so two
//! deploys, or a deploy and a delete for the same config id, can never
//! interleave on disk. Handler failures are answered with a best-effort
//! `error` frame and logged locally; the platform decides whether to
//! retry.

use crate::engine::EngineControl;
use crate::error::{AgentError, AgentResult};
use crate::protocol::frames::{
    ConfigDeletePayload, ConfigDeployPayload, ControlFrame, InboundMessage,
};
use crate::protocol::model::{AgentStatus, AppliedConfig, StatusReport};
use crate::services::MetricsService;
use crate::store::ConfigStore;
use crate::transport::Platform;
use chrono::Utc;
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Capacity of the inbound frame queue
pub const INBOUND_QUEUE_CAPACITY: usize = 100;

/// Dispatches typed inbound messages to the apply pipeline, the engine
/// supervisor, or the snapshot responders
pub struct MessageRouter {
    platform: Arc<dyn Platform>,
    store: Arc<ConfigStore>,
    engine: Arc<dyn EngineControl>,
    metrics: Arc<MetricsService>,
    status: Arc<RwLock<AgentStatus>>,
    agent_id: String,
    auto_reload: bool,
}

impl MessageRouter {
    pub fn new(
        platform: Arc<dyn Platform>,
        store: Arc<ConfigStore>,
        engine: Arc<dyn EngineControl>,
        metrics: Arc<MetricsService>,
        status: Arc<RwLock<AgentStatus>>,
        agent_id: impl Into<String>,
        auto_reload: bool,
    ) -> Self {
        Self {
            platform,
            store,
            engine,
            metrics,
            status,
            agent_id: agent_id.into(),
            auto_reload,
        }
    }

    /// Create the bounded inbound queue
    pub fn inbound_queue() -> (mpsc::Sender<ControlFrame>, mpsc::Receiver<ControlFrame>) {
        mpsc::channel(INBOUND_QUEUE_CAPACITY)
    }

    /// Spawn the single drain worker
    pub fn spawn(
        self: Arc<Self>,
        mut inbound_rx: mpsc::Receiver<ControlFrame>,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                let frame = tokio::select! {
                    _ = cancel.cancelled() => break,
                    frame = inbound_rx.recv() => match frame {
                        Some(frame) => frame,
                        None => break, // queue closed
                    },
                };
                self.dispatch(frame).await;
            }
            debug!("message router worker stopped");
        })
    }

    /// Handle one frame; failures are reported back and never propagate
    pub async fn dispatch(&self, frame: ControlFrame) {
        debug!(frame_type = %frame.frame_type, "dispatching control frame");

        let message = match InboundMessage::from_frame(&frame) {
            Ok(message) => message,
            Err(e) => {
                warn!(frame_type = %frame.frame_type, error = %e, "unhandled control frame");
                let error = AgentError::config_invalid(e.to_string());
                self.report_failure(&error, None).await;
                return;
            }
        };

        let config_id = message.config_id().map(|s| s.to_string());
        let result = match message {
            InboundMessage::ConfigDeploy(payload) => self.handle_deploy(payload).await,
            InboundMessage::ConfigDelete(payload) => self.handle_delete(payload).await,
            InboundMessage::ReloadRequest => self.handle_reload_request().await,
            InboundMessage::StatusRequest => self.handle_status_request().await,
            InboundMessage::MetricsRequest => self.handle_metrics_request().await,
        };

        if let Err(e) = result {
            error!(
                frame_type = %frame.frame_type,
                config_id = config_id.as_deref().unwrap_or("-"),
                error = %e,
                "control frame handling failed"
            );
            self.report_failure(&e, config_id.as_deref()).await;
        }
    }

    /// Best-effort `error` frame back to the platform
    async fn report_failure(&self, error: &AgentError, config_id: Option<&str>) {
        let frame = error.to_error_frame(config_id);
        if let Err(e) = self.platform.send_frame(&frame).await {
            debug!(error = %e, "could not deliver error frame");
        }
    }

    /// Fetch, save, validate, reload, record, report
    pub async fn handle_deploy(&self, payload: ConfigDeployPayload) -> AgentResult<()> {
        let config_id = payload.config_id.as_str();
        info!(
            config_id,
            version = payload.version,
            force = payload.force,
            "deploying config"
        );

        let fetched = self.platform.fetch_config(config_id).await?;
        if !payload.force && fetched.version != payload.version {
            return Err(AgentError::config_invalid(format!(
                "platform returned version {} for config {config_id}, expected {}",
                fetched.version, payload.version
            )));
        }

        self.store.save(&fetched).await?;
        let config_path = self.store.file_path(config_id);

        if let Err(e) = self.engine.validate(&config_path).await {
            warn!(config_id, error = %e, "validation failed, restoring previous config");
            if let Err(restore_err) = self.store.restore(config_id).await {
                error!(config_id, error = %restore_err, "restore after failed validation failed");
            }
            return Err(e.into());
        }

        if self.auto_reload && self.engine.is_running().await {
            if let Err(e) = self.engine.reload().await {
                warn!(config_id, error = %e, "reload failed, restoring previous config");
                if let Err(restore_err) = self.store.restore(config_id).await {
                    error!(config_id, error = %restore_err, "restore after failed reload failed");
                }
                return Err(e.into());
            }
        }

        let applied = AppliedConfig {
            config_id: config_id.to_string(),
            version: fetched.version,
            applied_at: Utc::now(),
        };
        self.status.write().await.upsert_applied(applied.clone());

        self.platform
            .report_config_applied(&self.agent_id, &applied)
            .await?;
        info!(config_id, version = fetched.version, "config deployed");
        Ok(())
    }

    /// Delete locally and nudge the engine; reload failure is not fatal
    pub async fn handle_delete(&self, payload: ConfigDeletePayload) -> AgentResult<()> {
        let config_id = payload.config_id.as_str();
        info!(config_id, "deleting config");

        self.store.delete(config_id).await?;
        self.status.write().await.remove_applied(config_id);

        if self.auto_reload && self.engine.is_running().await {
            if let Err(e) = self.engine.reload().await {
                warn!(config_id, error = %e, "reload after delete failed");
            }
        }
        Ok(())
    }

    pub async fn handle_reload_request(&self) -> AgentResult<()> {
        if !self.engine.is_running().await {
            return Err(crate::engine::EngineError::NotRunning.into());
        }
        self.engine.reload().await?;
        Ok(())
    }

    /// Answer with a status snapshot; the facade prefers the channel and
    /// falls back to HTTP
    pub async fn handle_status_request(&self) -> AgentResult<()> {
        let report = StatusReport {
            agent: self.status.read().await.clone(),
            engine: self.engine.status().await,
        };
        self.platform
            .report_status(&self.agent_id, &report)
            .await?;
        Ok(())
    }

    pub async fn handle_metrics_request(&self) -> AgentResult<()> {
        let sample = self.metrics.get_metrics().await;
        self.platform
            .report_metrics(&self.agent_id, &sample)
            .await?;
        Ok(())
    }
}
