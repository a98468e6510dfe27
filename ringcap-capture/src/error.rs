use std::fmt;
use std::io;

use thiserror::Error;

use crate::filter::FilterError;
use crate::ring::RingSetupError;

/// Negotiation step of [`CaptureSession::open`](crate::CaptureSession::open).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenStep {
    Socket,
    Ring,
    Bind,
    Promiscuous,
    Fanout,
    Timestamping,
}

impl fmt::Display for OpenStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let what = match self {
            OpenStep::Socket => "unable to create socket",
            OpenStep::Ring => "unable to create rx ring",
            OpenStep::Bind => "unable to bind to interface",
            OpenStep::Promiscuous => "unable to enable promiscuous mode",
            OpenStep::Fanout => "unable to join fanout group",
            OpenStep::Timestamping => "unable to enable hardware timestamping",
        };
        f.write_str(what)
    }
}

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("af_packet does not support offline input")]
    OfflineUnsupported,

    #[error("failed to open {interface}: {step}: {source}")]
    Open {
        interface: String,
        step: OpenStep,
        #[source]
        source: io::Error,
    },

    #[error("failed to open {interface}: unable to create rx ring: {source}")]
    Ring {
        interface: String,
        #[source]
        source: RingSetupError,
    },

    #[error("unable to read packet statistics: {0}")]
    Statistics(#[source] io::Error),

    #[error(transparent)]
    Filter(#[from] FilterError),

    #[error("no packet source registered for '{0}'")]
    UnknownSource(String),
}

impl CaptureError {
    /// The negotiation step that failed, for errors raised by `open`.
    pub fn open_step(&self) -> Option<OpenStep> {
        match self {
            CaptureError::Open { step, .. } => Some(*step),
            CaptureError::Ring { .. } => Some(OpenStep::Ring),
            _ => None,
        }
    }
}
