//! ## ringcap-capture::source
//! **Packet sources selectable by name**
//!
//! Hosts drive captures through [`PacketSource`] and pick the implementation
//! from a [`SourceRegistry`] using paths such as `af_packet::eth0`.

use std::collections::BTreeMap;
use std::os::fd::RawFd;

use tracing::{debug, warn};

use crate::error::CaptureError;
use crate::session::{CaptureSession, CaptureSettings, CaptureStats, Extract, SourceProperties};
use crate::sys::PacketBackend;

/// Registry prefix of the AF_PACKET capture session.
pub const AF_PACKET_PREFIX: &str = "af_packet";

const PATH_SEPARATOR: &str = "::";

/// The calls a host pipeline makes on a capture source.
pub trait PacketSource {
    fn open(&mut self) -> Result<SourceProperties, CaptureError>;

    /// Returns `false` if the source was already closed.
    fn close(&mut self) -> bool;

    fn is_open(&self) -> bool;

    fn properties(&self) -> Option<&SourceProperties>;

    /// Descriptor to poll for readability while open.
    fn selectable_fd(&self) -> Option<RawFd> {
        self.properties().map(|properties| properties.selectable_fd)
    }

    fn extract_next_packet(&mut self) -> Extract<'_>;

    fn done_with_packet(&mut self);

    fn precompile_filter(&mut self, index: usize, source: &str) -> Result<(), CaptureError>;

    fn set_filter(&mut self, index: usize);

    /// Counter snapshot; a failed query is logged and reported as zeros.
    fn statistics(&mut self) -> CaptureStats;

    fn discarded(&self) -> u64;

    fn anomalies(&self) -> u64;
}

impl<B: PacketBackend> PacketSource for CaptureSession<B> {
    fn open(&mut self) -> Result<SourceProperties, CaptureError> {
        CaptureSession::open(self)
    }

    fn close(&mut self) -> bool {
        CaptureSession::close(self)
    }

    fn is_open(&self) -> bool {
        CaptureSession::is_open(self)
    }

    fn properties(&self) -> Option<&SourceProperties> {
        CaptureSession::properties(self)
    }

    fn extract_next_packet(&mut self) -> Extract<'_> {
        CaptureSession::extract_next_packet(self)
    }

    fn done_with_packet(&mut self) {
        CaptureSession::done_with_packet(self)
    }

    fn precompile_filter(&mut self, index: usize, source: &str) -> Result<(), CaptureError> {
        CaptureSession::precompile_filter(self, index, source)
    }

    fn set_filter(&mut self, index: usize) {
        CaptureSession::set_filter(self, index)
    }

    fn statistics(&mut self) -> CaptureStats {
        match CaptureSession::statistics(self) {
            Ok(stats) => stats,
            Err(e) => {
                warn!(interface = self.interface(), error = %e, "statistics unavailable");
                CaptureStats::default()
            }
        }
    }

    fn discarded(&self) -> u64 {
        CaptureSession::discarded(self)
    }

    fn anomalies(&self) -> u64 {
        CaptureSession::anomalies(self)
    }
}

/// Builds a source for the interface part of a path.
pub type SourceFactory =
    fn(name: &str, is_live: bool, settings: &CaptureSettings) -> Result<Box<dyn PacketSource>, CaptureError>;

/// Prefix to factory table owned by the host.
#[derive(Default)]
pub struct SourceRegistry {
    factories: BTreeMap<String, SourceFactory>,
}

impl SourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry offering the AF_PACKET session under [`AF_PACKET_PREFIX`].
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(AF_PACKET_PREFIX, af_packet_source);
        registry
    }

    /// Register `factory` under `prefix`, returning the factory it replaced.
    pub fn register(
        &mut self,
        prefix: impl Into<String>,
        factory: SourceFactory,
    ) -> Option<SourceFactory> {
        self.factories.insert(prefix.into(), factory)
    }

    pub fn prefixes(&self) -> impl Iterator<Item = &str> {
        self.factories.keys().map(String::as_str)
    }

    /// Build the source named by `path` (`<prefix>::<interface>`).
    pub fn instantiate(
        &self,
        path: &str,
        is_live: bool,
        settings: &CaptureSettings,
    ) -> Result<Box<dyn PacketSource>, CaptureError> {
        let unknown = || CaptureError::UnknownSource(path.to_string());

        let (prefix, name) = path.split_once(PATH_SEPARATOR).ok_or_else(unknown)?;
        if name.is_empty() {
            return Err(unknown());
        }
        let factory = self.factories.get(prefix).ok_or_else(unknown)?;

        debug!(prefix, name, "instantiating packet source");
        factory(name, is_live, settings)
    }
}

fn af_packet_source(
    name: &str,
    is_live: bool,
    settings: &CaptureSettings,
) -> Result<Box<dyn PacketSource>, CaptureError> {
    let session = CaptureSession::new(name, is_live, settings.clone())?;
    Ok(Box::new(session))
}
