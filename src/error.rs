//! Error types for the node agent core
//!
//! Each subsystem surfaces its own error enum; `AgentError` aggregates them
//! at the coordination layer and maps every failure to the wire-level error
//! code carried in outbound `error` frames.

use crate::protocol::frames::{ControlFrame, ErrorPayload};
use thiserror::Error;

/// Main error type for agent operations
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("Invalid input: {message}")]
    ConfigInvalid { message: String },

    #[error("Transport error: {0}")]
    Transport(#[from] crate::transport::TransportError),

    #[error("Configuration store error: {0}")]
    Store(#[from] crate::store::StoreError),

    #[error("Engine error: {0}")]
    Engine(#[from] crate::engine::EngineError),

    #[error("Settings error: {0}")]
    Settings(#[from] crate::config::ConfigError),

    #[error("Inbound queue full")]
    QueueFull,

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl AgentError {
    /// Create an invalid-input error
    pub fn config_invalid<S: Into<String>>(message: S) -> Self {
        Self::ConfigInvalid {
            message: message.into(),
        }
    }

    /// Wire-level error code for outbound `error` frames
    pub fn code(&self) -> &'static str {
        match self {
            AgentError::ConfigInvalid { .. } => "config_invalid",
            AgentError::Transport(e) => e.code(),
            AgentError::Store(_) => "io_failure",
            AgentError::Engine(e) => e.code(),
            AgentError::Settings(_) => "config_invalid",
            AgentError::QueueFull => "queue_full",
            AgentError::Cancelled => "cancelled",
            AgentError::Serialization(_) => "config_invalid",
        }
    }

    /// Convert to an outbound `error` frame, optionally naming the config
    /// the failure relates to
    pub fn to_error_frame(&self, config_id: Option<&str>) -> ControlFrame {
        ControlFrame::error(ErrorPayload {
            code: self.code().to_string(),
            message: truncate_message(&self.to_string(), 500),
            config_id: config_id.map(|s| s.to_string()),
        })
    }
}

/// Truncate long error messages before they go on the wire
fn truncate_message(message: &str, max_len: usize) -> String {
    if message.len() <= max_len {
        return message.to_string();
    }
    let suffix = "...[truncated]";
    let cut = max_len - suffix.len();
    let mut end = cut;
    while !message.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}{}", &message[..end], suffix)
}

/// Result type for agent operations
pub type AgentResult<T> = Result<T, AgentError>;
