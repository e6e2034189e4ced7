//! Periodic reporting services
//!
//! The heartbeat service pings the platform for liveness; the metrics
//! service samples host and engine resource usage and reports it. Both
//! own a single ticker worker cancelled through the coordinator's token.

pub mod heartbeat;
pub mod metrics;

pub use heartbeat::{HeartbeatService, HeartbeatStats};
pub use metrics::MetricsService;
