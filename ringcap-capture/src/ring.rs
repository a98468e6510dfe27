//! ## ringcap-capture::ring
//! **Consumer side of a TPACKET_V3 receive ring**
//!
//! The kernel fills fixed-size blocks and flips each block's status to
//! `TP_STATUS_USER` once it is ready. [`RxRing`] walks the frames of the
//! current block without copying them and hands the block back to the kernel
//! only after every frame in it has been released.
//!
//! Frame views borrow the ring, so the borrow checker guarantees that no view
//! survives the [`RxRing::release`] call that may return its block.

use std::io;
use std::mem::{self, offset_of};
use std::ptr;
use std::slice;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, trace, warn};

use crate::sys::{
    PacketBackend, RingRegion, Tpacket3Hdr, TpacketBlockDesc, TpacketHdrV1, TpacketReq3,
    BLOCK_STATUS_OFFSET, TPACKET_ALIGNMENT, TP_STATUS_KERNEL, TP_STATUS_TS_RAW_HARDWARE,
    TP_STATUS_USER, TP_STATUS_VLAN_VALID,
};

/// Maximum time the kernel holds a partially filled block, in milliseconds.
pub const DEFAULT_RETIRE_TIMEOUT_MS: u32 = 100;

/// Frame size requested from the kernel. TPACKET_V3 packs frames by their
/// real length, so this only has to be a valid, aligned value.
pub const DEFAULT_FRAME_SIZE: u32 = TPACKET_ALIGNMENT << 7;

const BLOCK_HEADER_LEN: usize = mem::size_of::<TpacketBlockDesc>();
const FRAME_HEADER_LEN: usize = mem::size_of::<Tpacket3Hdr>();

/// Errors raised while configuring or mapping the ring.
#[derive(Debug, Error)]
pub enum RingSetupError {
    #[error("invalid ring layout: {0}")]
    InvalidLayout(String),

    #[error("unable to set TPACKET version: {0}")]
    Version(#[source] io::Error),

    #[error("unable to set ring layout: {0}")]
    Layout(#[source] io::Error),

    #[error("unable to map ring memory: {0}")]
    Map(#[source] io::Error),
}

/// Tunables for the ring geometry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RingParams {
    /// Block size in bytes; `None` selects four pages.
    pub block_size: Option<u32>,
    pub frame_size: u32,
    pub retire_timeout_ms: u32,
}

impl Default for RingParams {
    fn default() -> Self {
        Self {
            block_size: None,
            frame_size: DEFAULT_FRAME_SIZE,
            retire_timeout_ms: DEFAULT_RETIRE_TIMEOUT_MS,
        }
    }
}

/// Geometry handed to the kernel through `PACKET_RX_RING`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RingLayout {
    pub block_size: u32,
    pub block_count: u32,
    pub frame_size: u32,
    pub retire_timeout_ms: u32,
}

impl RingLayout {
    /// Derive a layout that fits `buffer_size` bytes.
    pub fn for_buffer(
        buffer_size: usize,
        params: &RingParams,
        page_size: usize,
    ) -> Result<Self, RingSetupError> {
        let page_size = u32::try_from(page_size)
            .map_err(|_| RingSetupError::InvalidLayout(format!("page size {}", page_size)))?;
        let block_size = params.block_size.unwrap_or(page_size << 2);

        if page_size == 0 || block_size % page_size != 0 || !block_size.is_power_of_two() {
            return Err(RingSetupError::InvalidLayout(format!(
                "block size {} must be a power of two multiple of the page size {}",
                block_size, page_size
            )));
        }
        if params.frame_size % TPACKET_ALIGNMENT != 0
            || (params.frame_size as usize) < FRAME_HEADER_LEN
            || params.frame_size > block_size
        {
            return Err(RingSetupError::InvalidLayout(format!(
                "frame size {} must be {}-byte aligned and fit in a {} byte block",
                params.frame_size, TPACKET_ALIGNMENT, block_size
            )));
        }

        let block_count = u32::try_from(buffer_size / block_size as usize).map_err(|_| {
            RingSetupError::InvalidLayout(format!("buffer size {} is too large", buffer_size))
        })?;
        if block_count == 0 {
            return Err(RingSetupError::InvalidLayout(format!(
                "buffer size {} is smaller than one {} byte block",
                buffer_size, block_size
            )));
        }

        Ok(Self {
            block_size,
            block_count,
            frame_size: params.frame_size,
            retire_timeout_ms: params.retire_timeout_ms,
        })
    }

    pub fn frame_count(&self) -> u32 {
        (self.block_size / self.frame_size) * self.block_count
    }

    /// Bytes the kernel expects to be mapped.
    pub fn map_length(&self) -> usize {
        self.block_size as usize * self.block_count as usize
    }

    pub fn request(&self) -> TpacketReq3 {
        TpacketReq3 {
            tp_block_size: self.block_size,
            tp_block_nr: self.block_count,
            tp_frame_size: self.frame_size,
            tp_frame_nr: self.frame_count(),
            tp_retire_blk_tov: self.retire_timeout_ms,
            tp_sizeof_priv: 0,
            tp_feature_req_word: 0,
        }
    }
}

/// Traversal state: which block is current and where its next frame starts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RingCursor {
    pub block: u32,
    /// Offset of the next unreleased frame; only meaningful once `consumed > 0`.
    pub offset: u32,
    /// Frames of the current block already released.
    pub consumed: u32,
}

/// Kernel metadata of one captured frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct FrameHeader {
    pub sec: u32,
    pub nsec: u32,
    pub snaplen: u32,
    pub len: u32,
    pub status: u32,
    pub mac: u16,
    pub vlan_tci: u32,
}

/// Zero-copy view of a frame that is still owned by user space.
#[derive(Debug, Clone, Copy)]
pub struct Frame<'a> {
    header: FrameHeader,
    data: &'a [u8],
}

impl<'a> Frame<'a> {
    pub fn timestamp(&self) -> Duration {
        Duration::new(u64::from(self.header.sec), self.header.nsec)
    }

    pub fn captured_len(&self) -> u32 {
        self.header.snaplen
    }

    pub fn original_len(&self) -> u32 {
        self.header.len
    }

    /// Offset of the link-layer header from the start of the frame.
    pub fn payload_offset(&self) -> u16 {
        self.header.mac
    }

    pub fn data(&self) -> &'a [u8] {
        self.data
    }

    pub fn vlan_tci(&self) -> Option<u16> {
        (self.header.status & TP_STATUS_VLAN_VALID != 0).then_some(self.header.vlan_tci as u16)
    }

    pub fn hw_timestamp(&self) -> bool {
        self.header.status & TP_STATUS_TS_RAW_HARDWARE != 0
    }
}

#[derive(Debug, Clone, Copy)]
struct BlockSummary {
    num_pkts: u32,
    first_offset: u32,
}

/// Walks the blocks of a mapped TPACKET_V3 ring.
pub struct RxRing<R: RingRegion> {
    region: R,
    layout: RingLayout,
    cursor: RingCursor,
}

impl<R: RingRegion> RxRing<R> {
    /// Configure the kernel ring on `socket` and map it.
    pub fn create<B>(
        backend: &B,
        socket: &B::Socket,
        buffer_size: usize,
        params: &RingParams,
    ) -> Result<Self, RingSetupError>
    where
        B: PacketBackend<Region = R>,
    {
        let layout = RingLayout::for_buffer(buffer_size, params, backend.page_size())?;
        backend
            .set_tpacket_version(socket)
            .map_err(RingSetupError::Version)?;
        backend
            .set_rx_ring(socket, &layout.request())
            .map_err(RingSetupError::Layout)?;
        let region = backend
            .map_ring(socket, layout.map_length())
            .map_err(RingSetupError::Map)?;
        Self::from_region(region, layout)
    }

    /// Wrap an already mapped region.
    pub fn from_region(region: R, layout: RingLayout) -> Result<Self, RingSetupError> {
        if region.size() < layout.map_length() {
            return Err(RingSetupError::InvalidLayout(format!(
                "mapped region of {} bytes is smaller than the {} byte ring",
                region.size(),
                layout.map_length()
            )));
        }
        if region.as_ptr().as_ptr() as usize % mem::align_of::<TpacketBlockDesc>() != 0 {
            return Err(RingSetupError::InvalidLayout(
                "mapped region is not suitably aligned".into(),
            ));
        }

        debug!(
            block_size = layout.block_size,
            block_count = layout.block_count,
            frame_size = layout.frame_size,
            "rx ring ready"
        );
        Ok(Self {
            region,
            layout,
            cursor: RingCursor::default(),
        })
    }

    pub fn layout(&self) -> &RingLayout {
        &self.layout
    }

    pub fn cursor(&self) -> RingCursor {
        self.cursor
    }

    /// The next unreleased frame, or `None` if the current block still belongs
    /// to the kernel.
    ///
    /// Repeated calls without [`release`](Self::release) return the same frame.
    /// User-owned blocks that carry no frames, or whose frame offsets point
    /// outside the block, are handed straight back to the kernel.
    pub fn next_frame(&mut self) -> Option<Frame<'_>> {
        let offset = self.locate()?;
        let header = self.read_frame_header(offset);
        let start = self.block_start(self.cursor.block) + offset as usize + header.mac as usize;

        // SAFETY: `locate` verified that the header and its captured bytes lie
        // inside the current block, which user space owns until `release`.
        let data = unsafe {
            slice::from_raw_parts(
                self.region.as_ptr().as_ptr().add(start),
                header.snaplen as usize,
            )
        };
        Some(Frame { header, data })
    }

    /// Consume the frame last returned by [`next_frame`](Self::next_frame).
    ///
    /// Once the last frame of a block is released the block is returned to the
    /// kernel and the cursor wraps to the next block.
    pub fn release(&mut self) {
        let block = self.cursor.block;
        if !self.user_owned(block) {
            return;
        }

        let summary = self.block_summary(block);
        let offset = self.current_offset(&summary);
        self.cursor.consumed += 1;

        if self.cursor.consumed >= summary.num_pkts || !self.frame_in_bounds(offset) {
            self.retire_block();
            return;
        }

        let next = self.read_frame_header_raw(offset).tp_next_offset;
        match offset.checked_add(next) {
            Some(next_offset) if next != 0 => self.cursor.offset = next_offset,
            _ => {
                warn!(block, offset, "frame chain ends before the block does");
                self.retire_block();
            }
        }
    }

    fn locate(&mut self) -> Option<u32> {
        for _ in 0..self.layout.block_count {
            let block = self.cursor.block;
            if !self.user_owned(block) {
                return None;
            }

            let summary = self.block_summary(block);
            if self.cursor.consumed >= summary.num_pkts {
                trace!(block, "skipping block without frames");
                self.retire_block();
                continue;
            }

            let offset = self.current_offset(&summary);
            if self.frame_in_bounds(offset) {
                return Some(offset);
            }

            warn!(block, offset, "frame lies outside its block, handing block back");
            self.retire_block();
        }
        None
    }

    fn current_offset(&self, summary: &BlockSummary) -> u32 {
        if self.cursor.consumed == 0 {
            summary.first_offset
        } else {
            self.cursor.offset
        }
    }

    fn frame_in_bounds(&self, offset: u32) -> bool {
        let block_size = self.layout.block_size as usize;
        let offset = offset as usize;
        if offset < BLOCK_HEADER_LEN
            || offset % TPACKET_ALIGNMENT as usize != 0
            || offset + FRAME_HEADER_LEN > block_size
        {
            return false;
        }

        let header = self.read_frame_header_raw(offset as u32);
        let data_end = offset + header.tp_mac as usize + header.tp_snaplen as usize;
        header.tp_mac as usize >= FRAME_HEADER_LEN && data_end <= block_size
    }

    fn retire_block(&mut self) {
        let block = self.cursor.block;
        self.status(block).store(TP_STATUS_KERNEL, Ordering::Release);
        trace!(block, "block returned to kernel");

        self.cursor = RingCursor {
            block: (block + 1) % self.layout.block_count,
            offset: 0,
            consumed: 0,
        };
    }

    fn block_start(&self, block: u32) -> usize {
        block as usize * self.layout.block_size as usize
    }

    fn block_ptr(&self, block: u32) -> *mut u8 {
        // SAFETY: block < block_count and the region covers every block.
        unsafe { self.region.as_ptr().as_ptr().add(self.block_start(block)) }
    }

    fn status(&self, block: u32) -> &AtomicU32 {
        // SAFETY: the status word is a 4-byte aligned u32 inside the block
        // descriptor; the kernel also accesses it atomically.
        unsafe { &*(self.block_ptr(block).add(BLOCK_STATUS_OFFSET) as *const AtomicU32) }
    }

    fn user_owned(&self, block: u32) -> bool {
        self.status(block).load(Ordering::Acquire) & TP_STATUS_USER != 0
    }

    fn block_summary(&self, block: u32) -> BlockSummary {
        let hdr = self.block_ptr(block).wrapping_add(offset_of!(TpacketBlockDesc, hdr));
        // SAFETY: read only after observing TP_STATUS_USER with acquire ordering.
        unsafe {
            BlockSummary {
                num_pkts: ptr::read(hdr.add(offset_of!(TpacketHdrV1, num_pkts)) as *const u32),
                first_offset: ptr::read(
                    hdr.add(offset_of!(TpacketHdrV1, offset_to_first_pkt)) as *const u32
                ),
            }
        }
    }

    fn read_frame_header_raw(&self, offset: u32) -> Tpacket3Hdr {
        // SAFETY: callers pass offsets checked against the block bounds and
        // aligned to TPACKET_ALIGNMENT.
        unsafe {
            ptr::read(self.block_ptr(self.cursor.block).add(offset as usize) as *const Tpacket3Hdr)
        }
    }

    fn read_frame_header(&self, offset: u32) -> FrameHeader {
        let raw = self.read_frame_header_raw(offset);
        FrameHeader {
            sec: raw.tp_sec,
            nsec: raw.tp_nsec,
            snaplen: raw.tp_snaplen,
            len: raw.tp_len,
            status: raw.tp_status,
            mac: raw.tp_mac,
            vlan_tci: raw.hv1.tp_vlan_tci,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{HeapRegion, RingWriter, SimFrame};

    const BLOCK: u32 = 4096;

    fn ring(blocks: u32) -> (RxRing<HeapRegion>, RingWriter) {
        let layout = RingLayout {
            block_size: BLOCK,
            block_count: blocks,
            frame_size: DEFAULT_FRAME_SIZE,
            retire_timeout_ms: DEFAULT_RETIRE_TIMEOUT_MS,
        };
        let region = HeapRegion::zeroed(layout.map_length());
        let writer = RingWriter::new(&region, layout);
        (RxRing::from_region(region, layout).unwrap(), writer)
    }

    #[test]
    fn layout_defaults_to_four_pages() {
        let layout = RingLayout::for_buffer(1 << 20, &RingParams::default(), 4096).unwrap();
        assert_eq!(layout.block_size, 16384);
        assert_eq!(layout.block_count, 64);
        assert_eq!(layout.frame_size, 2048);
        assert_eq!(layout.frame_count(), 8 * 64);
        assert_eq!(layout.map_length(), 1 << 20);

        let req = layout.request();
        assert_eq!(req.tp_retire_blk_tov, 100);
        assert_eq!(req.tp_frame_nr, 512);
    }

    #[test]
    fn layout_rejects_tiny_buffer() {
        let err = RingLayout::for_buffer(1000, &RingParams::default(), 4096).unwrap_err();
        assert!(matches!(err, RingSetupError::InvalidLayout(_)));
    }

    #[test]
    fn layout_rejects_unaligned_block() {
        let params = RingParams {
            block_size: Some(6000),
            ..RingParams::default()
        };
        assert!(RingLayout::for_buffer(1 << 20, &params, 4096).is_err());
    }

    #[test]
    fn empty_ring_yields_nothing() {
        let (mut ring, _writer) = ring(2);
        assert!(ring.next_frame().is_none());
        assert_eq!(ring.cursor(), RingCursor::default());
    }

    #[test]
    fn frame_view_exposes_metadata() {
        let (mut ring, writer) = ring(2);
        writer.fill(
            0,
            &[SimFrame::new(b"\x01\x02\x03\x04")
                .original_len(60)
                .timestamp(17, 500)
                .vlan(42)
                .hw_timestamp()],
        );

        let frame = ring.next_frame().unwrap();
        assert_eq!(frame.data(), b"\x01\x02\x03\x04");
        assert_eq!(frame.captured_len(), 4);
        assert_eq!(frame.original_len(), 60);
        assert_eq!(frame.timestamp(), Duration::new(17, 500));
        assert_eq!(frame.payload_offset(), RingWriter::MAC_OFFSET);
        assert_eq!(frame.vlan_tci(), Some(42));
        assert!(frame.hw_timestamp());
    }

    #[test]
    fn reading_does_not_advance_cursor() {
        let (mut ring, writer) = ring(2);
        writer.fill(0, &[SimFrame::new(b"first"), SimFrame::new(b"second")]);

        assert_eq!(ring.next_frame().unwrap().data(), b"first");
        assert_eq!(ring.next_frame().unwrap().data(), b"first");
        assert_eq!(ring.cursor(), RingCursor::default());

        ring.release();
        assert_eq!(ring.next_frame().unwrap().data(), b"second");
    }

    #[test]
    fn block_returns_to_kernel_only_when_drained() {
        let (mut ring, writer) = ring(2);
        writer.fill(0, &[SimFrame::new(b"a"), SimFrame::new(b"b"), SimFrame::new(b"c")]);

        for expected in [b"a", b"b"] {
            assert_eq!(ring.next_frame().unwrap().data(), expected);
            ring.release();
            assert_eq!(writer.status(0), TP_STATUS_USER);
        }

        assert_eq!(ring.next_frame().unwrap().data(), b"c");
        ring.release();
        assert_eq!(writer.status(0), TP_STATUS_KERNEL);
        assert_eq!(ring.cursor().block, 1);
        assert!(ring.next_frame().is_none());
    }

    #[test]
    fn cursor_wraps_around_the_ring() {
        let (mut ring, writer) = ring(2);
        writer.fill(0, &[SimFrame::new(b"b0")]);
        writer.fill(1, &[SimFrame::new(b"b1")]);

        assert_eq!(ring.next_frame().unwrap().data(), b"b0");
        ring.release();
        assert_eq!(ring.next_frame().unwrap().data(), b"b1");
        ring.release();
        assert_eq!(ring.cursor().block, 0);

        writer.fill(0, &[SimFrame::new(b"again")]);
        assert_eq!(ring.next_frame().unwrap().data(), b"again");
    }

    #[test]
    fn ownership_flag_alternates() {
        let (mut ring, writer) = ring(1);
        for round in 0..3u8 {
            assert_eq!(writer.status(0), TP_STATUS_KERNEL);
            writer.fill(0, &[SimFrame::new(&[round])]);
            assert_eq!(writer.status(0), TP_STATUS_USER);
            assert_eq!(ring.next_frame().unwrap().data(), &[round]);
            ring.release();
        }
        assert_eq!(writer.status(0), TP_STATUS_KERNEL);
    }

    #[test]
    fn release_without_ready_block_is_noop() {
        let (mut ring, writer) = ring(2);
        ring.release();
        assert_eq!(ring.cursor(), RingCursor::default());
        assert_eq!(writer.status(0), TP_STATUS_KERNEL);
    }

    #[test]
    fn empty_user_block_is_skipped() {
        let (mut ring, writer) = ring(3);
        writer.fill(0, &[]);
        writer.fill(1, &[SimFrame::new(b"next")]);

        assert_eq!(ring.next_frame().unwrap().data(), b"next");
        assert_eq!(writer.status(0), TP_STATUS_KERNEL);
        assert_eq!(ring.cursor().block, 1);
    }

    #[test]
    fn corrupt_frame_offset_hands_block_back() {
        let (mut ring, writer) = ring(2);
        writer.fill(0, &[SimFrame::new(b"x")]);
        writer.corrupt_first_offset(0, BLOCK + 64);

        assert!(ring.next_frame().is_none());
        assert_eq!(writer.status(0), TP_STATUS_KERNEL);
        assert_eq!(ring.cursor().block, 1);
    }

    #[test]
    fn from_region_rejects_short_mapping() {
        let layout = RingLayout {
            block_size: BLOCK,
            block_count: 4,
            frame_size: DEFAULT_FRAME_SIZE,
            retire_timeout_ms: DEFAULT_RETIRE_TIMEOUT_MS,
        };
        let region = HeapRegion::zeroed(BLOCK as usize);
        assert!(matches!(
            RxRing::from_region(region, layout),
            Err(RingSetupError::InvalidLayout(_))
        ));
    }
}
