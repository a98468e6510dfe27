//! ## ringcap-capture::session
//! **AF_PACKET capture session**
//!
//! A [`CaptureSession`] negotiates a TPACKET_V3 socket for one interface and
//! turns the frames of its receive ring into filtered [`Packet`]s.
//!
//! ### Lifecycle:
//! - `open` runs every negotiation step or none; a failure drops whatever was
//!   acquired so far and leaves the session closed.
//! - `extract_next_packet` never blocks. Poll the descriptor from
//!   [`SourceProperties::selectable_fd`] and call it again once readable.
//! - Every delivered packet stays in the ring until `done_with_packet`.
//! - `close` is idempotent and also runs on drop.

use std::io;
use std::net::Ipv4Addr;
use std::os::fd::{AsRawFd, RawFd};

use tracing::{debug, info, trace, warn};

use crate::error::{CaptureError, OpenStep};
use crate::filter::{BpfFilters, PacketFilter};
use crate::packet::{Anomaly, CaptureHeader, LinkType, Packet};
use crate::ring::{Frame, RingParams, RxRing};
use crate::sys::{LinuxBackend, PacketBackend, PACKET_FANOUT_HASH};

/// Default ring buffer size, 128 MiB.
pub const DEFAULT_BUFFER_SIZE: usize = 128 * 1024 * 1024;

/// Anomaly raised for frames with a zero length or zero captured length.
pub const EMPTY_FRAME_ANOMALY: &str = "empty_af_packet_header";

/// How a session negotiates its socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureSettings {
    pub buffer_size: usize,
    pub ring: RingParams,
    /// Add a promiscuous membership on open. Off means the interface is left as is.
    pub promiscuous: bool,
    /// Fanout group to join with hash distribution.
    pub fanout: Option<u16>,
    pub hw_timestamping: bool,
}

impl Default for CaptureSettings {
    fn default() -> Self {
        Self {
            buffer_size: DEFAULT_BUFFER_SIZE,
            ring: RingParams::default(),
            promiscuous: false,
            fanout: None,
            hw_timestamping: false,
        }
    }
}

/// Running counters of an open session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CaptureStats {
    /// Frames accepted by the filter and delivered.
    pub received: u64,
    /// Sum of the on-wire length of delivered frames.
    pub bytes_received: u64,
    /// Frames the kernel saw on the socket.
    pub link: u64,
    /// Frames the kernel dropped because the ring was full.
    pub dropped: u64,
}

/// What an open session reports about itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceProperties {
    pub path: String,
    pub selectable_fd: RawFd,
    pub link_type: LinkType,
    /// Always unknown for AF_PACKET.
    pub netmask: Option<Ipv4Addr>,
    pub is_live: bool,
    pub ifindex: i32,
}

/// Result of one extraction attempt.
#[derive(Debug)]
pub enum Extract<'a> {
    Packet(Packet<'a>),
    /// Nothing ready in the ring.
    Empty,
    /// A degenerate frame was consumed; call again for the next one.
    Anomaly(Anomaly),
}

enum Verdict {
    Accept(u32),
    Reject,
    Degenerate(CaptureHeader),
}

struct OpenCapture<B: PacketBackend> {
    // Unmap before the socket closes.
    ring: RxRing<B::Region>,
    socket: B::Socket,
    properties: SourceProperties,
}

/// A live capture on one network interface.
pub struct CaptureSession<B: PacketBackend = LinuxBackend> {
    backend: B,
    interface: String,
    settings: CaptureSettings,
    filters: Box<dyn PacketFilter>,
    active_filter: Option<usize>,
    open: Option<OpenCapture<B>>,
    stats: CaptureStats,
    discarded: u64,
    anomalies: u64,
    in_flight: bool,
}

impl CaptureSession<LinuxBackend> {
    /// A session on `interface` using the running kernel and libpcap filters.
    pub fn new(
        interface: impl Into<String>,
        is_live: bool,
        settings: CaptureSettings,
    ) -> Result<Self, CaptureError> {
        Self::with_backend(
            LinuxBackend,
            interface,
            is_live,
            settings,
            Box::new(BpfFilters::new()),
        )
    }
}

impl<B: PacketBackend> CaptureSession<B> {
    pub fn with_backend(
        backend: B,
        interface: impl Into<String>,
        is_live: bool,
        settings: CaptureSettings,
        filters: Box<dyn PacketFilter>,
    ) -> Result<Self, CaptureError> {
        if !is_live {
            return Err(CaptureError::OfflineUnsupported);
        }

        Ok(Self {
            backend,
            interface: interface.into(),
            settings,
            filters,
            active_filter: None,
            open: None,
            stats: CaptureStats::default(),
            discarded: 0,
            anomalies: 0,
            in_flight: false,
        })
    }

    /// Negotiate the socket and ring. Opening an open session returns its
    /// current properties.
    pub fn open(&mut self) -> Result<SourceProperties, CaptureError> {
        if let Some(open) = &self.open {
            debug!(interface = %self.interface, "already open");
            return Ok(open.properties.clone());
        }

        let capture = self.negotiate()?;
        let layout = *capture.ring.layout();
        info!(
            interface = %self.interface,
            ifindex = capture.properties.ifindex,
            fd = capture.properties.selectable_fd,
            block_size = layout.block_size,
            block_count = layout.block_count,
            fanout = ?self.settings.fanout,
            hw_timestamping = self.settings.hw_timestamping,
            "opened"
        );

        self.stats = CaptureStats::default();
        self.discarded = 0;
        self.anomalies = 0;
        self.in_flight = false;
        let properties = capture.properties.clone();
        self.open = Some(capture);
        Ok(properties)
    }

    fn negotiate(&self) -> Result<OpenCapture<B>, CaptureError> {
        let fail = |step: OpenStep| {
            let interface = self.interface.clone();
            move |source: io::Error| CaptureError::Open {
                interface,
                step,
                source,
            }
        };

        let socket = self
            .backend
            .open_socket()
            .map_err(fail(OpenStep::Socket))?;

        let ring = RxRing::create(
            &self.backend,
            &socket,
            self.settings.buffer_size,
            &self.settings.ring,
        )
        .map_err(|source| CaptureError::Ring {
            interface: self.interface.clone(),
            source,
        })?;

        let ifindex = self
            .backend
            .interface_index(&socket, &self.interface)
            .and_then(|ifindex| self.backend.bind(&socket, ifindex).map(|()| ifindex))
            .map_err(fail(OpenStep::Bind))?;

        self.enable_promiscuous(&socket, ifindex)
            .map_err(fail(OpenStep::Promiscuous))?;

        if let Some(group_id) = self.settings.fanout {
            self.backend
                .join_fanout(&socket, group_id, PACKET_FANOUT_HASH)
                .map_err(fail(OpenStep::Fanout))?;
        }

        if self.settings.hw_timestamping {
            self.backend
                .enable_hw_timestamping(&socket, &self.interface)
                .map_err(fail(OpenStep::Timestamping))?;
        }

        let properties = SourceProperties {
            path: self.interface.clone(),
            selectable_fd: socket.as_raw_fd(),
            link_type: LinkType::Ethernet,
            netmask: None,
            is_live: true,
            ifindex,
        };
        Ok(OpenCapture {
            ring,
            socket,
            properties,
        })
    }

    /// Promiscuous reception hook. Unless the setting asks for it the
    /// interface state is left untouched and promiscuous mode must not be
    /// assumed.
    fn enable_promiscuous(&self, socket: &B::Socket, ifindex: i32) -> io::Result<()> {
        if !self.settings.promiscuous {
            trace!(interface = %self.interface, "promiscuous mode not requested");
            return Ok(());
        }
        self.backend.add_promiscuous_membership(socket, ifindex)
    }

    /// Pull the next frame that passes the active filter.
    ///
    /// Rejected frames are released on the spot, so one call may walk many
    /// frames. A delivered packet stays in flight until
    /// [`done_with_packet`](Self::done_with_packet); calling this again before
    /// that returns the same packet.
    pub fn extract_next_packet(&mut self) -> Extract<'_> {
        let Some(open) = self.open.as_mut() else {
            return Extract::Empty;
        };

        if !self.in_flight {
            loop {
                let verdict = match open.ring.next_frame() {
                    None => return Extract::Empty,
                    Some(frame) => {
                        let header = capture_header(&frame);
                        if header.len == 0 || header.caplen == 0 {
                            Verdict::Degenerate(header)
                        } else if self
                            .filters
                            .apply(self.active_filter, &header, frame.data())
                        {
                            Verdict::Accept(header.len)
                        } else {
                            Verdict::Reject
                        }
                    }
                };

                match verdict {
                    Verdict::Accept(len) => {
                        self.stats.received += 1;
                        self.stats.bytes_received += u64::from(len);
                        self.in_flight = true;
                        break;
                    }
                    Verdict::Reject => {
                        open.ring.release();
                        self.discarded += 1;
                    }
                    Verdict::Degenerate(header) => {
                        open.ring.release();
                        self.anomalies += 1;
                        warn!(
                            interface = %self.interface,
                            caplen = header.caplen,
                            len = header.len,
                            "{}", EMPTY_FRAME_ANOMALY
                        );
                        return Extract::Anomaly(Anomaly {
                            name: EMPTY_FRAME_ANOMALY,
                            header,
                        });
                    }
                }
            }
        }

        match open.ring.next_frame() {
            Some(frame) => Extract::Packet(packet(frame)),
            None => {
                self.in_flight = false;
                Extract::Empty
            }
        }
    }

    /// Release the packet returned by the last successful extraction.
    pub fn done_with_packet(&mut self) {
        if !self.in_flight {
            return;
        }
        self.in_flight = false;
        if let Some(open) = self.open.as_mut() {
            open.ring.release();
        }
    }

    /// Compile `source` into filter slot `index`.
    pub fn precompile_filter(&mut self, index: usize, source: &str) -> Result<(), CaptureError> {
        self.filters.precompile(index, source)?;
        Ok(())
    }

    pub fn set_filter(&mut self, index: usize) {
        self.active_filter = Some(index);
    }

    pub fn clear_filter(&mut self) {
        self.active_filter = None;
    }

    pub fn active_filter(&self) -> Option<usize> {
        self.active_filter
    }

    /// Snapshot of the running counters.
    ///
    /// The kernel resets `PACKET_STATISTICS` whenever it is read, so each
    /// query adds the counts seen since the previous one. A closed session
    /// reports zeros.
    pub fn statistics(&mut self) -> Result<CaptureStats, CaptureError> {
        let Some(open) = self.open.as_ref() else {
            return Ok(CaptureStats::default());
        };

        let kernel = self
            .backend
            .packet_statistics(&open.socket)
            .map_err(CaptureError::Statistics)?;
        self.stats.link += kernel.packets;
        self.stats.dropped += kernel.drops;
        Ok(self.stats)
    }

    /// Release the ring and socket. Returns `false` if already closed.
    pub fn close(&mut self) -> bool {
        let Some(open) = self.open.take() else {
            return false;
        };
        self.in_flight = false;
        drop(open);
        info!(interface = %self.interface, "closed");
        true
    }

    pub fn is_open(&self) -> bool {
        self.open.is_some()
    }

    pub fn properties(&self) -> Option<&SourceProperties> {
        self.open.as_ref().map(|open| &open.properties)
    }

    pub fn interface(&self) -> &str {
        &self.interface
    }

    /// Frames consumed from the ring but rejected by the filter.
    pub fn discarded(&self) -> u64 {
        self.discarded
    }

    pub fn anomalies(&self) -> u64 {
        self.anomalies
    }
}

impl<B: PacketBackend> Drop for CaptureSession<B> {
    fn drop(&mut self) {
        self.close();
    }
}

fn capture_header(frame: &Frame<'_>) -> CaptureHeader {
    CaptureHeader {
        timestamp: frame.timestamp(),
        caplen: frame.captured_len(),
        len: frame.original_len(),
    }
}

fn packet(frame: Frame<'_>) -> Packet<'_> {
    Packet {
        link_type: LinkType::Ethernet,
        header: capture_header(&frame),
        data: frame.data(),
        vlan_tci: frame.vlan_tci(),
        hw_timestamp: frame.hw_timestamp(),
    }
}
