//! Agent coordination layer
//!
//! The message router dispatches inbound control frames; the lifecycle
//! coordinator owns every component and drives startup, the reconnect
//! loop, and orderly shutdown.

pub mod coordinator;
pub mod router;

pub use coordinator::AgentCoordinator;
pub use router::MessageRouter;
