use std::os::fd::RawFd;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use opentelemetry::KeyValue;
use tokio::io::unix::AsyncFd;
use tokio::io::Interest;
use tracing::{debug, info};

use ringcap_capture::{
    CaptureSettings, Extract, OwnedPacket, PacketSource, RingParams, SourceRegistry,
    AF_PACKET_PREFIX,
};
use ringcap_config::{CaptureConfig, RingcapConfig};
use ringcap_telemetry::{CaptureTotals, EventLogger, MetricsRecorder};

/// Filter slot used for the expression given on the command line or in the config.
const FILTER_SLOT: usize = 0;

#[derive(Parser)]
#[command(name = "ringcap", version, about)]
pub struct Cli {
    /// Configuration file; defaults to config/ringcap.yaml plus RINGCAP_* variables
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Capture from an interface until interrupted
    Run(RunArgs),
    /// Validate and print the effective configuration
    CheckConfig,
}

#[derive(Args, Debug, Clone)]
pub struct RunArgs {
    /// Interface to capture on, overriding the configuration
    #[arg(short, long)]
    pub interface: Option<String>,

    /// Filter expression (tcpdump syntax), overriding the configuration
    #[arg(short, long)]
    pub filter: Option<String>,

    /// Stop after this many packets
    #[arg(long)]
    pub count: Option<u64>,

    /// Print the first N packets as hex
    #[arg(long, default_value_t = 0)]
    pub sample: u64,
}

pub async fn run_command(cli: Cli) -> anyhow::Result<()> {
    let config = match &cli.config {
        Some(path) => RingcapConfig::load_from_path(path),
        None => RingcapConfig::load(),
    }
    .context("failed to load configuration")?;

    match cli.command {
        Commands::Run(args) => {
            EventLogger::init(&config.telemetry.log_level);
            run_capture(args, config).await
        }
        Commands::CheckConfig => {
            print!("{}", serde_yaml::to_string(&config)?);
            Ok(())
        }
    }
}

pub fn capture_settings(config: &CaptureConfig) -> CaptureSettings {
    CaptureSettings {
        buffer_size: config.buffer_size,
        ring: RingParams {
            block_size: config.ring.block_size,
            frame_size: config.ring.frame_size,
            retire_timeout_ms: config.ring.retire_timeout_ms,
        },
        promiscuous: config.promiscuous,
        fanout: config.fanout.group(),
        hw_timestamping: config.hw_timestamping,
    }
}

async fn run_capture(args: RunArgs, mut config: RingcapConfig) -> anyhow::Result<()> {
    if let Some(interface) = &args.interface {
        config.capture.interface = interface.clone();
    }
    if args.filter.is_some() {
        config.capture.filter = args.filter.clone();
    }

    let registry = SourceRegistry::with_defaults();
    let path = format!("{}::{}", AF_PACKET_PREFIX, config.capture.interface);
    let mut source = registry.instantiate(&path, true, &capture_settings(&config.capture))?;

    if let Some(filter) = &config.capture.filter {
        source.precompile_filter(FILTER_SLOT, filter)?;
        source.set_filter(FILTER_SLOT);
    }

    let properties = source.open()?;
    EventLogger::log_event(
        "opened",
        vec![
            KeyValue::new("interface", properties.path.clone()),
            KeyValue::new("ifindex", i64::from(properties.ifindex)),
            KeyValue::new("link_type", i64::from(properties.link_type.dlt())),
        ],
    );

    let metrics = if config.telemetry.metrics {
        Some(MetricsRecorder::new()?)
    } else {
        None
    };
    let stats_every = Duration::from_secs(config.telemetry.stats_interval_secs);

    let outcome = capture_loop(
        source.as_mut(),
        properties.selectable_fd,
        &args,
        stats_every,
        metrics.as_ref(),
    )
    .await;

    source.close();
    EventLogger::log_event(
        "closed",
        vec![KeyValue::new("interface", properties.path.clone())],
    );

    if let Some(metrics) = &metrics {
        print!("{}", metrics.gather_metrics()?);
    }
    outcome
}

async fn capture_loop(
    source: &mut dyn PacketSource,
    fd: RawFd,
    args: &RunArgs,
    stats_every: Duration,
    metrics: Option<&MetricsRecorder>,
) -> anyhow::Result<()> {
    let async_fd = AsyncFd::with_interest(fd, Interest::READABLE)
        .context("failed to register capture descriptor")?;
    let mut ticker = tokio::time::interval(stats_every);
    ticker.tick().await;

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    let mut delivered = 0u64;
    loop {
        tokio::select! {
            _ = &mut shutdown => {
                info!("interrupted, shutting down");
                break;
            }
            _ = ticker.tick() => report(source, metrics),
            guard = async_fd.readable() => {
                let mut guard = guard?;
                let remaining = args.count.map(|count| count.saturating_sub(delivered));
                delivered += drain(source, remaining, args.sample.saturating_sub(delivered));
                guard.clear_ready();

                if args.count.is_some_and(|count| delivered >= count) {
                    info!(delivered, "packet limit reached");
                    break;
                }
            }
        }
    }

    report(source, metrics);
    Ok(())
}

/// Extract until the ring runs dry or `limit` packets were delivered.
fn drain(source: &mut dyn PacketSource, limit: Option<u64>, mut samples: u64) -> u64 {
    let mut delivered = 0u64;
    while limit.map_or(true, |limit| delivered < limit) {
        let sample: Option<OwnedPacket> = match source.extract_next_packet() {
            Extract::Empty => break,
            Extract::Anomaly(anomaly) => {
                debug!(anomaly = anomaly.name, "skipped frame");
                continue;
            }
            Extract::Packet(packet) => (samples > 0).then(|| packet.detach()),
        };
        source.done_with_packet();
        delivered += 1;

        if let Some(packet) = sample {
            samples -= 1;
            print_sample(&packet);
        }
    }
    delivered
}

fn print_sample(packet: &OwnedPacket) {
    let ts = packet.header.timestamp;
    let vlan = packet
        .vlan_tci
        .map(|tci| format!(" vlan {}", tci & 0x0fff))
        .unwrap_or_default();
    println!(
        "{}.{:06} len {} caplen {}{} {}",
        ts.as_secs(),
        ts.subsec_micros(),
        packet.header.len,
        packet.header.caplen,
        vlan,
        hex::encode(&packet.data)
    );
}

fn report(source: &mut dyn PacketSource, metrics: Option<&MetricsRecorder>) {
    let stats = source.statistics();
    let totals = CaptureTotals {
        received: stats.received,
        bytes_received: stats.bytes_received,
        discarded: source.discarded(),
        anomalies: source.anomalies(),
        kernel_packets: stats.link,
        kernel_drops: stats.dropped,
    };

    info!(
        received = totals.received,
        bytes = totals.bytes_received,
        discarded = totals.discarded,
        anomalies = totals.anomalies,
        kernel_packets = totals.kernel_packets,
        kernel_drops = totals.kernel_drops,
        "capture statistics"
    );
    if let Some(metrics) = metrics {
        metrics.record_snapshot(&totals);
    }
}
