//! Transport layer for agent <-> platform communication
//!
//! This module provides the platform-facing facade and its two
//! sub-clients: a request/response HTTP client and a full-duplex
//! WebSocket control channel carrying framed JSON messages. The facade
//! prefers the control channel for fire-and-forget operations when it is
//! connected and falls back to HTTP otherwise.

use crate::protocol::frames::ControlFrame;
use crate::protocol::model::{
    AgentIdentity, AgentMetrics, AppliedConfig, PipelineConfig, StatusReport,
};
use thiserror::Error;

pub mod channel;
pub mod facade;
pub mod http;
pub mod tls;

pub use channel::{ChannelHandle, ControlChannel};
pub use facade::PlatformClient;
pub use http::HttpClient;

/// Platform trait for the operations the agent performs against the
/// central platform
///
/// This trait abstracts the dual-transport facade to enable dependency
/// injection and testing.
#[async_trait::async_trait]
pub trait Platform: Send + Sync {
    /// Register this agent with the platform (always HTTP)
    async fn register(&self, identity: &AgentIdentity) -> Result<(), TransportError>;

    /// Send a liveness heartbeat (channel preferred, HTTP fallback)
    async fn send_heartbeat(&self, agent_id: &str) -> Result<(), TransportError>;

    /// Push the full status document (channel preferred, HTTP fallback)
    async fn report_status(
        &self,
        agent_id: &str,
        report: &StatusReport,
    ) -> Result<(), TransportError>;

    /// Fetch a pipeline configuration by id (always HTTP)
    async fn fetch_config(&self, config_id: &str) -> Result<PipelineConfig, TransportError>;

    /// Report a successfully applied configuration (channel preferred)
    async fn report_config_applied(
        &self,
        agent_id: &str,
        applied: &AppliedConfig,
    ) -> Result<(), TransportError>;

    /// Report a metrics sample (channel preferred, HTTP fallback)
    async fn report_metrics(
        &self,
        agent_id: &str,
        metrics: &AgentMetrics,
    ) -> Result<(), TransportError>;

    /// Whether the control channel is currently connected
    fn is_channel_connected(&self) -> bool;

    /// Send a raw frame over the control channel
    async fn send_frame(&self, frame: &ControlFrame) -> Result<(), TransportError>;
}

/// Transport errors across both sub-clients
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Invalid platform URL: {0}")]
    InvalidUrl(String),

    #[error("HTTP request failed: {context}")]
    Http {
        context: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("Platform rejected request: HTTP {status}: {body}")]
    RemoteRejected { status: u16, body: String },

    #[error("Control channel not connected")]
    NotConnected,

    #[error("Control channel closed")]
    ChannelClosed,

    #[error("Control channel connect timed out after {secs}s")]
    ConnectTimeout { secs: u64 },

    #[error("Control channel write timed out after {secs}s")]
    WriteTimeout { secs: u64 },

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] Box<tokio_tungstenite::tungstenite::Error>),

    #[error("TLS configuration error: {0}")]
    Tls(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl TransportError {
    /// Wrap a reqwest error with a short context string
    pub fn http(context: impl Into<String>, source: reqwest::Error) -> Self {
        Self::Http {
            context: context.into(),
            source,
        }
    }

    /// Wire-level error code for outbound `error` frames
    pub fn code(&self) -> &'static str {
        match self {
            TransportError::RemoteRejected { .. } => "remote_rejected",
            _ => "transport_unavailable",
        }
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for TransportError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        TransportError::WebSocket(Box::new(err))
    }
}
