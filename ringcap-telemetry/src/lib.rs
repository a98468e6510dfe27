//! # Ringcap Telemetry
//!
//! Logging initialisation and Prometheus metrics for the capture host.

pub mod logging;
pub mod metrics;

pub use logging::EventLogger;
pub use metrics::{CaptureTotals, MetricsRecorder};
