//! Dual-transport platform client facade
//!
//! Fire-and-forget operations (heartbeat, status, applied, metrics) try
//! the control channel when it is connected and fall back to HTTP on any
//! error. Fetch-config always uses HTTP because it needs a response;
//! register always uses HTTP because it bootstraps identity before a
//! channel exists. The facade never retries; retry policy belongs to the
//! callers.

use crate::config::{AgentSettings, TlsSection};
use crate::protocol::frames::{
    ControlFrame, TYPE_CONFIG_APPLIED, TYPE_METRICS_REPORT, TYPE_STATUS_REPORT,
};
use crate::protocol::model::{
    AgentIdentity, AgentMetrics, AppliedConfig, PipelineConfig, StatusReport,
};
use crate::transport::channel::{ChannelHandle, ControlChannel};
use crate::transport::http::HttpClient;
use crate::transport::{Platform, TransportError};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Platform client combining the HTTP and control-channel sub-clients
pub struct PlatformClient {
    http: HttpClient,
    channel: Option<Arc<ControlChannel>>,
    handle: Option<ChannelHandle>,
}

impl PlatformClient {
    /// Build both sub-clients from settings and a resolved bearer token
    pub fn from_settings(
        settings: &AgentSettings,
        agent_id: &str,
        token: Option<String>,
    ) -> Result<Self, TransportError> {
        Self::new(
            &settings.platform.base_url,
            agent_id,
            token,
            Duration::from_secs(settings.platform.request_timeout_secs),
            Duration::from_secs(settings.platform.ping_interval_secs),
            settings.platform.control_channel,
            settings.platform.tls.clone(),
        )
    }

    /// Build both sub-clients; `with_channel = false` leaves the agent
    /// HTTP-only
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        base_url: &str,
        agent_id: &str,
        token: Option<String>,
        request_timeout: Duration,
        ping_interval: Duration,
        with_channel: bool,
        tls_section: Option<TlsSection>,
    ) -> Result<Self, TransportError> {
        let http = HttpClient::new(
            base_url,
            agent_id,
            token.as_deref(),
            request_timeout,
            tls_section.as_ref(),
        )?;

        let channel = if with_channel {
            Some(Arc::new(ControlChannel::new(
                http.base_url(),
                agent_id,
                token,
                ping_interval,
                tls_section,
            )?))
        } else {
            None
        };
        let handle = channel.as_ref().map(|c| c.handle());

        Ok(Self {
            http,
            channel,
            handle,
        })
    }

    /// The control-channel sub-client, when enabled
    pub fn channel(&self) -> Option<Arc<ControlChannel>> {
        self.channel.clone()
    }

    /// The HTTP sub-client
    pub fn http(&self) -> &HttpClient {
        &self.http
    }

    /// Try the channel first, then fall back to the given HTTP call
    async fn frame_or_fallback<T, F>(
        &self,
        frame_type: &str,
        payload: &T,
        fallback: F,
    ) -> Result<(), TransportError>
    where
        T: Serialize + Sync,
        F: std::future::Future<Output = Result<(), TransportError>>,
    {
        if let Some(handle) = &self.handle {
            if handle.is_connected() {
                let frame = ControlFrame::with_payload(frame_type, payload)?;
                match handle.send(&frame).await {
                    Ok(()) => return Ok(()),
                    Err(e) => {
                        warn!(
                            frame_type,
                            error = %e,
                            "control channel send failed, falling back to HTTP"
                        );
                    }
                }
            }
        }
        fallback.await
    }
}

#[async_trait::async_trait]
impl Platform for PlatformClient {
    async fn register(&self, identity: &AgentIdentity) -> Result<(), TransportError> {
        self.http.register(identity).await
    }

    async fn send_heartbeat(&self, agent_id: &str) -> Result<(), TransportError> {
        if let Some(handle) = &self.handle {
            if handle.is_connected() {
                let frame = ControlFrame::heartbeat(agent_id);
                match handle.send(&frame).await {
                    Ok(()) => return Ok(()),
                    Err(e) => {
                        warn!(error = %e, "heartbeat frame failed, falling back to HTTP");
                    }
                }
            }
        }
        self.http.send_heartbeat(agent_id).await
    }

    async fn report_status(
        &self,
        agent_id: &str,
        report: &StatusReport,
    ) -> Result<(), TransportError> {
        self.frame_or_fallback(
            TYPE_STATUS_REPORT,
            report,
            self.http.report_status(agent_id, report),
        )
        .await
    }

    async fn fetch_config(&self, config_id: &str) -> Result<PipelineConfig, TransportError> {
        debug!(config_id, "fetching config over HTTP");
        self.http.fetch_config(config_id).await
    }

    async fn report_config_applied(
        &self,
        agent_id: &str,
        applied: &AppliedConfig,
    ) -> Result<(), TransportError> {
        self.frame_or_fallback(
            TYPE_CONFIG_APPLIED,
            applied,
            self.http.report_config_applied(agent_id, applied),
        )
        .await
    }

    async fn report_metrics(
        &self,
        agent_id: &str,
        metrics: &AgentMetrics,
    ) -> Result<(), TransportError> {
        self.frame_or_fallback(
            TYPE_METRICS_REPORT,
            metrics,
            self.http.report_metrics(agent_id, metrics),
        )
        .await
    }

    fn is_channel_connected(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| h.is_connected())
    }

    async fn send_frame(&self, frame: &ControlFrame) -> Result<(), TransportError> {
        match &self.handle {
            Some(handle) => handle.send(frame).await,
            None => Err(TransportError::NotConnected),
        }
    }
}
