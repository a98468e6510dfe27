//! ## ringcap-telemetry::logging
//! **Structured logging with tracing and OpenTelemetry attributes**
//!
//! `RUST_LOG` overrides the configured level when set.

use opentelemetry::KeyValue;
use tracing::info_span;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Clone)]
pub struct EventLogger;

impl EventLogger {
    /// Install the global fmt subscriber. Later calls are ignored.
    pub fn init(level: &str) {
        let _ = fmt()
            .with_env_filter(
                EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)),
            )
            .with_thread_names(true)
            .with_span_events(FmtSpan::ENTER)
            .try_init();
    }

    /// Record a lifecycle event such as a source opening or closing.
    pub fn log_event(event_type: &str, metadata: Vec<KeyValue>) {
        let span = info_span!(
            "capture_event",
            event_type = event_type,
            otel.kind = "INTERNAL"
        );
        let _entered = span.enter();

        tracing::info!(
            metadata = ?metadata,
            "Capture event occurred"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_test::traced_test;

    #[traced_test]
    #[test]
    fn test_logging() {
        EventLogger::log_event("opened", vec![KeyValue::new("interface", "eth0")]);
        assert!(logs_contain("Capture event occurred"));
        assert!(logs_contain("eth0"));
    }
}
