//! ## ringcap-capture::filter
//! **Packet filter collaborator**
//!
//! The capture session only remembers which slot is active. Compiling
//! expressions and running them against frames happens here.

use std::collections::HashMap;

use pcap::{BpfProgram, Capture, Linktype};
use thiserror::Error;
use tracing::{debug, warn};

use crate::packet::CaptureHeader;

#[derive(Debug, Error)]
pub enum FilterError {
    #[error("failed to compile filter {index} '{source_text}': {cause}")]
    Compile {
        index: usize,
        source_text: String,
        #[source]
        cause: pcap::Error,
    },
}

/// Compiles filter expressions into numbered slots and evaluates them.
pub trait PacketFilter {
    /// Compile `source` and store it in slot `index`, replacing any previous program.
    fn precompile(&mut self, index: usize, source: &str) -> Result<(), FilterError>;

    /// Whether the frame passes the program in slot `active`.
    ///
    /// `None` accepts everything. A slot that was never compiled rejects.
    fn apply(&self, active: Option<usize>, header: &CaptureHeader, data: &[u8]) -> bool;
}

/// Classic BPF filters compiled by libpcap for Ethernet frames.
#[derive(Default)]
pub struct BpfFilters {
    programs: HashMap<usize, BpfProgram>,
}

impl BpfFilters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.programs.is_empty()
    }
}

impl PacketFilter for BpfFilters {
    fn precompile(&mut self, index: usize, source: &str) -> Result<(), FilterError> {
        let compile_error = |cause| FilterError::Compile {
            index,
            source_text: source.to_string(),
            cause,
        };

        let program = Capture::dead(Linktype::ETHERNET)
            .and_then(|dead| dead.compile(source, true))
            .map_err(compile_error)?;

        debug!(index, filter = source, "filter compiled");
        self.programs.insert(index, program);
        Ok(())
    }

    fn apply(&self, active: Option<usize>, _header: &CaptureHeader, data: &[u8]) -> bool {
        let Some(index) = active else {
            return true;
        };

        match self.programs.get(&index) {
            Some(program) => program.filter(data),
            None => {
                warn!(index, "no filter compiled in slot, rejecting frame");
                false
            }
        }
    }
}
