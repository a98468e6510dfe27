//! Logging and metrics configuration.

use serde::{Deserialize, Serialize};
use validator::{self, Validate};

use crate::validation;

/// Telemetry configuration.
#[derive(Debug, Serialize, Deserialize, Validate, Clone, PartialEq)]
pub struct TelemetryConfig {
    /// Default log level; `RUST_LOG` takes precedence when set.
    #[validate(custom(function = validation::validate_log_level))]
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Seconds between statistics reports.
    #[validate(range(min = 1, max = 3600))]
    #[serde(default = "default_stats_interval")]
    pub stats_interval_secs: u64,

    /// Collect Prometheus metrics.
    #[serde(default = "default_true")]
    pub metrics: bool,
}

fn default_log_level() -> String {
    "info".into()
}

fn default_stats_interval() -> u64 {
    10
}

fn default_true() -> bool {
    true
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            stats_interval_secs: default_stats_interval(),
            metrics: default_true(),
        }
    }
}
