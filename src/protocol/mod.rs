//! Protocol types for agent <-> platform communication
//!
//! This module defines the shared data model (identity, status, configs,
//! metrics) and the JSON control-frame envelope exchanged over the
//! control channel.

pub mod frames;
pub mod model;

pub use frames::{ControlFrame, FrameError, InboundMessage};
pub use model::{
    AgentIdentity, AgentMetrics, AgentStatus, AgentStatusState, AppliedConfig, EngineStatus,
    PipelineConfig, StatusReport,
};
