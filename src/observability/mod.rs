//! Observability infrastructure
//!
//! Structured logging initialisation and span macros. Operational metrics
//! reported to the platform live in [`crate::services::metrics`].

pub mod logging;

pub use logging::{init_default_logging, init_logging, LogFormat, LogOptions};
