//! pipeagent - node-side fleet management agent
//!
//! A production-ready management agent that runs beside a log-processing
//! engine on each host, keeps a live control channel to a central platform,
//! synchronises pipeline configuration files, and reports liveness and
//! metrics.
//!
//! # Overview
//!
//! This crate provides:
//! - Dual-transport platform client (persistent WebSocket control channel
//!   with HTTP fallback) with reconnection and message routing
//! - On-disk configuration store with atomic writes, versioned backup
//!   rotation, and validated apply-with-rollback
//! - Engine process supervisor (spawn, signal-based reload/stop, log
//!   pumping, startup gating, version detection)
//! - Heartbeat and metrics reporting services
//! - A lifecycle coordinator wiring everything together with orderly
//!   startup and shutdown
//!
//! # Quick Start
//!
//! ```rust
//! use pipeagent::protocol::frames::ControlFrame;
//! use pipeagent::protocol::model::PipelineConfig;
//! use serde_json::json;
//!
//! // Frames on the control channel are JSON text objects
//! let frame = ControlFrame::new(
//!     "config_deploy",
//!     json!({"config_id": "nginx-access", "version": 7}),
//! );
//! let wire = serde_json::to_string(&frame).unwrap();
//! assert!(wire.contains("config_deploy"));
//!
//! // Pipeline configurations are opaque byte blobs keyed by (id, version)
//! let config = PipelineConfig {
//!     id: "nginx-access".to_string(),
//!     version: 7,
//!     content: "input { stdin {} }".to_string(),
//!     name: Some("Nginx access log".to_string()),
//! };
//! assert_eq!(config.id, "nginx-access");
//! ```

pub mod agent;
pub mod config;
pub mod engine;
pub mod error;
pub mod observability;
pub mod protocol;
pub mod services;
pub mod store;
pub mod testing;
pub mod transport;

pub use agent::AgentCoordinator;
pub use config::{AgentSettings, ConfigError};
pub use error::{AgentError, AgentResult};
pub use protocol::frames::ControlFrame;
pub use protocol::model::{AgentIdentity, AgentStatus, AppliedConfig, PipelineConfig};
pub use store::ConfigStore;
pub use transport::PlatformClient;
