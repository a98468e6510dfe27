//! Packet records handed to the host pipeline.
use std::time::Duration;

use bytes::Bytes;

/// Link-layer framing of captured data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkType {
    Ethernet,
}

impl LinkType {
    /// The `DLT_*` value libpcap uses for this link type.
    pub fn dlt(self) -> i32 {
        match self {
            LinkType::Ethernet => 1,
        }
    }
}

/// Capture metadata, the equivalent of a pcap record header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureHeader {
    pub timestamp: Duration,
    /// Bytes present in the record.
    pub caplen: u32,
    /// Bytes on the wire.
    pub len: u32,
}

impl CaptureHeader {
    pub fn timestamp_micros(&self) -> u128 {
        self.timestamp.as_micros()
    }
}

/// A captured packet borrowed from the receive ring.
#[derive(Debug, Clone, Copy)]
pub struct Packet<'a> {
    pub link_type: LinkType,
    pub header: CaptureHeader,
    pub data: &'a [u8],
    pub vlan_tci: Option<u16>,
    pub hw_timestamp: bool,
}

impl Packet<'_> {
    /// Copy the packet out of the ring so it can outlive `done_with_packet`.
    pub fn detach(&self) -> OwnedPacket {
        OwnedPacket {
            link_type: self.link_type,
            header: self.header,
            data: Bytes::copy_from_slice(self.data),
            vlan_tci: self.vlan_tci,
            hw_timestamp: self.hw_timestamp,
        }
    }
}

/// A packet that owns its payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OwnedPacket {
    pub link_type: LinkType,
    pub header: CaptureHeader,
    pub data: Bytes,
    pub vlan_tci: Option<u16>,
    pub hw_timestamp: bool,
}

/// A frame the session refused to deliver, tagged with the reason.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Anomaly {
    pub name: &'static str,
    pub header: CaptureHeader,
}
