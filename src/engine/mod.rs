//! Engine process supervision
//!
//! Owns at most one child engine process: spawn, signal-based
//! reload/stop, log pumping, startup gating, and version detection. The
//! engine is consumed as an opaque child reachable via CLI flags,
//! standard streams, and POSIX signals.

use crate::protocol::model::EngineStatus;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

pub mod command;
pub mod logpump;
pub mod supervisor;

pub use logpump::LogPump;
pub use supervisor::EngineSupervisor;

/// Engine supervision errors
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Engine already running (pid {pid})")]
    AlreadyRunning { pid: u32 },

    #[error("Engine is not running")]
    NotRunning,

    #[error("Engine failed during startup: {message}")]
    StartupFailed { message: String },

    #[error("Engine start timed out after {secs}s")]
    StartupTimeout { secs: u64 },

    #[error("Engine validation failed: {output}")]
    ValidationFailed { output: String },

    #[error("I/O failure {context}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to signal engine process: {0}")]
    Signal(String),
}

impl EngineError {
    pub(crate) fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// Wire-level error code for outbound `error` frames
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::NotRunning => "engine_not_running",
            EngineError::AlreadyRunning { .. }
            | EngineError::StartupFailed { .. }
            | EngineError::StartupTimeout { .. } => "engine_startup_failed",
            EngineError::ValidationFailed { .. } => "engine_validation_failed",
            EngineError::Io { .. } | EngineError::Signal(_) => "io_failure",
        }
    }
}

/// Engine control trait for the operations the router and coordinator
/// drive against the supervisor
///
/// Abstracted to enable dependency injection and testing with in-memory
/// fakes.
#[async_trait::async_trait]
pub trait EngineControl: Send + Sync {
    /// Spawn the engine; rejected when a process already exists
    async fn start(&self) -> Result<(), EngineError>;

    /// SIGTERM, wait until `deadline`, then SIGKILL; idempotent
    async fn stop(&self, deadline: Duration) -> Result<(), EngineError>;

    /// stop followed by start
    async fn restart(&self, deadline: Duration) -> Result<(), EngineError>;

    /// SIGHUP the running engine; completion is eventual
    async fn reload(&self) -> Result<(), EngineError>;

    /// Run the engine's config test against `config_path`
    async fn validate(&self, config_path: &Path) -> Result<(), EngineError>;

    /// Snapshot of the engine's observable state
    async fn status(&self) -> EngineStatus;

    /// Whether a live child process exists
    async fn is_running(&self) -> bool;
}
