//! Control-frame envelope and typed inbound messages
//!
//! Frames are UTF-8 JSON text objects with a `type` tag, an RFC3339
//! timestamp, and a type-dependent payload object. Inbound frames are
//! parsed into a tagged enum so dispatch is a total match over the known
//! tags; an unknown tag is a parse error, never silently dropped.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Inbound frame type tags (platform -> agent)
pub const TYPE_CONFIG_DEPLOY: &str = "config_deploy";
pub const TYPE_CONFIG_DELETE: &str = "config_delete";
pub const TYPE_RELOAD_REQUEST: &str = "reload_request";
pub const TYPE_STATUS_REQUEST: &str = "status_request";
pub const TYPE_METRICS_REQUEST: &str = "metrics_request";

/// Outbound frame type tags (agent -> platform)
pub const TYPE_HEARTBEAT: &str = "heartbeat";
pub const TYPE_STATUS_REPORT: &str = "status_report";
pub const TYPE_METRICS_REPORT: &str = "metrics_report";
pub const TYPE_CONFIG_APPLIED: &str = "config_applied";
pub const TYPE_ERROR: &str = "error";

/// JSON envelope for every control-channel frame
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ControlFrame {
    #[serde(rename = "type")]
    pub frame_type: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub payload: Value,
}

impl ControlFrame {
    /// Build a frame with the current timestamp
    pub fn new(frame_type: impl Into<String>, payload: Value) -> Self {
        Self {
            frame_type: frame_type.into(),
            timestamp: Utc::now(),
            payload,
        }
    }

    /// Build a frame from a serializable payload
    pub fn with_payload<T: Serialize>(
        frame_type: impl Into<String>,
        payload: &T,
    ) -> Result<Self, serde_json::Error> {
        Ok(Self::new(frame_type, serde_json::to_value(payload)?))
    }

    /// Outbound heartbeat frame
    pub fn heartbeat(agent_id: &str) -> Self {
        Self::new(
            TYPE_HEARTBEAT,
            serde_json::json!({
                "agent_id": agent_id,
                "timestamp": Utc::now().timestamp(),
            }),
        )
    }

    /// Outbound error frame
    pub fn error(payload: ErrorPayload) -> Self {
        Self::new(
            TYPE_ERROR,
            serde_json::json!({
                "code": payload.code,
                "message": payload.message,
                "config_id": payload.config_id,
            }),
        )
    }
}

/// Payload of an outbound `error` frame
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ErrorPayload {
    pub code: String,
    pub message: String,
    #[serde(default)]
    pub config_id: Option<String>,
}

/// Payload of an inbound `config_deploy` frame
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConfigDeployPayload {
    pub config_id: String,
    pub version: u64,
    /// Skip the version equality check between request and fetched config
    #[serde(default)]
    pub force: bool,
}

/// Payload of an inbound `config_delete` frame
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConfigDeletePayload {
    pub config_id: String,
}

/// Typed inbound messages, one variant per known frame tag
#[derive(Debug, Clone, PartialEq)]
pub enum InboundMessage {
    ConfigDeploy(ConfigDeployPayload),
    ConfigDelete(ConfigDeletePayload),
    ReloadRequest,
    StatusRequest,
    MetricsRequest,
}

impl InboundMessage {
    /// Parse a frame into a typed message
    pub fn from_frame(frame: &ControlFrame) -> Result<Self, FrameError> {
        match frame.frame_type.as_str() {
            TYPE_CONFIG_DEPLOY => {
                let payload = serde_json::from_value(frame.payload.clone()).map_err(|e| {
                    FrameError::InvalidPayload {
                        frame_type: frame.frame_type.clone(),
                        source: e,
                    }
                })?;
                Ok(InboundMessage::ConfigDeploy(payload))
            }
            TYPE_CONFIG_DELETE => {
                let payload = serde_json::from_value(frame.payload.clone()).map_err(|e| {
                    FrameError::InvalidPayload {
                        frame_type: frame.frame_type.clone(),
                        source: e,
                    }
                })?;
                Ok(InboundMessage::ConfigDelete(payload))
            }
            TYPE_RELOAD_REQUEST => Ok(InboundMessage::ReloadRequest),
            TYPE_STATUS_REQUEST => Ok(InboundMessage::StatusRequest),
            TYPE_METRICS_REQUEST => Ok(InboundMessage::MetricsRequest),
            other => Err(FrameError::UnknownType {
                frame_type: other.to_string(),
            }),
        }
    }

    /// Config id this message concerns, when it has one
    pub fn config_id(&self) -> Option<&str> {
        match self {
            InboundMessage::ConfigDeploy(p) => Some(&p.config_id),
            InboundMessage::ConfigDelete(p) => Some(&p.config_id),
            _ => None,
        }
    }
}

/// Frame parsing errors
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("Unknown frame type: {frame_type}")]
    UnknownType { frame_type: String },
    #[error("Invalid payload for {frame_type} frame")]
    InvalidPayload {
        frame_type: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("Frame is not valid JSON")]
    Malformed(#[from] serde_json::Error),
}

/// Parse a raw text frame from the wire
pub fn parse_frame(text: &str) -> Result<ControlFrame, FrameError> {
    Ok(serde_json::from_str(text)?)
}
