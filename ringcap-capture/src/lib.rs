//! ringcap-capture
//!
//! Zero-copy packet capture from a Linux AF_PACKET TPACKET_V3 receive ring.
//!
//! - [`ring`] walks the kernel-shared ring block by block.
//! - [`session`] negotiates the socket and filters frames into packets.
//! - [`source`] exposes sessions to a host through a name-keyed registry.
//! - [`sys`] is the kernel boundary; everything privileged goes through it.

pub mod error;
pub mod filter;
pub mod packet;
pub mod ring;
pub mod session;
pub mod source;
pub mod sys;

#[cfg(test)]
mod testing;

pub use error::{CaptureError, OpenStep};
pub use filter::{BpfFilters, FilterError, PacketFilter};
pub use packet::{Anomaly, CaptureHeader, LinkType, OwnedPacket, Packet};
pub use ring::{Frame, RingLayout, RingParams, RingSetupError, RxRing};
pub use session::{CaptureSession, CaptureSettings, CaptureStats, Extract, SourceProperties};
pub use source::{PacketSource, SourceFactory, SourceRegistry, AF_PACKET_PREFIX};
pub use sys::{LinuxBackend, PacketBackend};
