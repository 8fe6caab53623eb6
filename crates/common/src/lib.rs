#![deny(missing_docs)]

//! Shared configuration, error types, and observability primitives for
//! windflow crates.
//!
//! Architecture role:
//! - defines engine configuration passed across layers
//! - provides common [`WfError`] / [`Result`] contracts
//! - hosts the metrics registry shared by operator instances
//!
//! Key modules:
//! - [`config`]
//! - [`error`]
//! - [`metrics`]

/// Shared engine configuration types.
pub mod config;
/// Shared error taxonomy.
pub mod error;
/// Metrics registry and Prometheus rendering helpers.
pub mod metrics;

pub use config::{EngineConfig, WindowMode};
pub use error::{Result, WfError};
pub use metrics::{global_metrics, MetricsRegistry};
