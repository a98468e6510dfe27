//! ## ringcap-telemetry::metrics
//! **Prometheus gauges mirroring the capture counters**
//!
//! Capture sources keep running totals, so each snapshot simply overwrites
//! the previous values.

use prometheus::{Encoder, IntGauge, Registry, TextEncoder};

/// Running totals reported by a capture source.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CaptureTotals {
    pub received: u64,
    pub bytes_received: u64,
    pub discarded: u64,
    pub anomalies: u64,
    pub kernel_packets: u64,
    pub kernel_drops: u64,
}

#[derive(Debug, Clone)]
pub struct MetricsRecorder {
    pub registry: Registry,
    pub received: IntGauge,
    pub bytes_received: IntGauge,
    pub discarded: IntGauge,
    pub anomalies: IntGauge,
    pub kernel_packets: IntGauge,
    pub kernel_drops: IntGauge,
}

impl MetricsRecorder {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();
        let gauge = |name: &str, help: &str| -> Result<IntGauge, prometheus::Error> {
            let gauge = IntGauge::new(name, help)?;
            registry.register(Box::new(gauge.clone()))?;
            Ok(gauge)
        };

        let received = gauge("ringcap_frames_received", "Frames delivered to the pipeline")?;
        let bytes_received = gauge(
            "ringcap_bytes_received",
            "On-wire bytes of frames delivered to the pipeline",
        )?;
        let discarded = gauge("ringcap_frames_discarded", "Frames rejected by the filter")?;
        let anomalies = gauge("ringcap_frames_anomalous", "Degenerate frames skipped")?;
        let kernel_packets = gauge("ringcap_kernel_packets", "Frames seen by the kernel socket")?;
        let kernel_drops = gauge(
            "ringcap_kernel_drops",
            "Frames the kernel dropped because the ring was full",
        )?;

        Ok(Self {
            registry,
            received,
            bytes_received,
            discarded,
            anomalies,
            kernel_packets,
            kernel_drops,
        })
    }

    pub fn record_snapshot(&self, totals: &CaptureTotals) {
        let set = |gauge: &IntGauge, value: u64| gauge.set(i64::try_from(value).unwrap_or(i64::MAX));

        set(&self.received, totals.received);
        set(&self.bytes_received, totals.bytes_received);
        set(&self.discarded, totals.discarded);
        set(&self.anomalies, totals.anomalies);
        set(&self.kernel_packets, totals.kernel_packets);
        set(&self.kernel_drops, totals.kernel_drops);
    }

    pub fn gather_metrics(&self) -> Result<String, prometheus::Error> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::<u8>::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}
