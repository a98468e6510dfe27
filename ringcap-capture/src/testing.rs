//! In-memory stand-ins for the kernel, used by the unit tests.

use std::alloc::{self, Layout};
use std::cell::RefCell;
use std::collections::VecDeque;
use std::io;
use std::mem::{self, offset_of};
use std::os::fd::{AsRawFd, RawFd};
use std::ptr::NonNull;
use std::rc::Rc;
use std::sync::atomic::{AtomicU32, Ordering};

use crate::ring::RingLayout;
use crate::sys::{
    KernelStats, PacketBackend, RingRegion, Tpacket3Hdr, TpacketBlockDesc, TpacketHdrV1,
    TpacketReq3, BLOCK_STATUS_OFFSET, TP_STATUS_KERNEL, TP_STATUS_TS_RAW_HARDWARE,
    TP_STATUS_USER, TP_STATUS_VLAN_VALID,
};

/// Page-aligned, zeroed heap memory posing as a kernel mapping.
pub struct HeapRegion {
    ptr: NonNull<u8>,
    layout: Layout,
}

impl HeapRegion {
    pub fn zeroed(size: usize) -> Self {
        let layout = Layout::from_size_align(size, 4096).unwrap();
        let ptr = NonNull::new(unsafe { alloc::alloc_zeroed(layout) }).unwrap();
        Self { ptr, layout }
    }
}

impl RingRegion for HeapRegion {
    fn as_ptr(&self) -> NonNull<u8> {
        self.ptr
    }

    fn size(&self) -> usize {
        self.layout.size()
    }
}

impl Drop for HeapRegion {
    fn drop(&mut self) {
        unsafe { alloc::dealloc(self.ptr.as_ptr(), self.layout) };
    }
}

/// A frame as the kernel would write it.
#[derive(Debug, Clone)]
pub struct SimFrame {
    data: Vec<u8>,
    original_len: Option<u32>,
    sec: u32,
    nsec: u32,
    vlan: Option<u16>,
    hw_timestamp: bool,
}

impl SimFrame {
    pub fn new(data: &[u8]) -> Self {
        Self {
            data: data.to_vec(),
            original_len: None,
            sec: 1_700_000_000,
            nsec: 0,
            vlan: None,
            hw_timestamp: false,
        }
    }

    pub fn original_len(mut self, len: u32) -> Self {
        self.original_len = Some(len);
        self
    }

    pub fn timestamp(mut self, sec: u32, nsec: u32) -> Self {
        self.sec = sec;
        self.nsec = nsec;
        self
    }

    pub fn vlan(mut self, tci: u16) -> Self {
        self.vlan = Some(tci);
        self
    }

    pub fn hw_timestamp(mut self) -> Self {
        self.hw_timestamp = true;
        self
    }
}

/// Plays the kernel's part: fills blocks and flips them to user ownership.
#[derive(Debug, Clone, Copy)]
pub struct RingWriter {
    base: *mut u8,
    layout: RingLayout,
}

impl RingWriter {
    pub const MAC_OFFSET: u16 = 80;
    const FIRST_OFFSET: usize = mem::size_of::<TpacketBlockDesc>();

    pub fn new<R: RingRegion>(region: &R, layout: RingLayout) -> Self {
        Self {
            base: region.as_ptr().as_ptr(),
            layout,
        }
    }

    fn block(&self, block: u32) -> *mut u8 {
        assert!(block < self.layout.block_count);
        unsafe {
            self.base
                .add(block as usize * self.layout.block_size as usize)
        }
    }

    fn status_word(&self, block: u32) -> &AtomicU32 {
        unsafe { &*(self.block(block).add(BLOCK_STATUS_OFFSET) as *const AtomicU32) }
    }

    pub fn status(&self, block: u32) -> u32 {
        self.status_word(block).load(Ordering::Acquire)
    }

    /// Write `frames` into `block` and hand it to user space.
    pub fn fill(&self, block: u32, frames: &[SimFrame]) {
        assert_eq!(
            self.status(block),
            TP_STATUS_KERNEL,
            "block {} is still owned by user space",
            block
        );
        let base = self.block(block);
        let mut offset = Self::FIRST_OFFSET;

        for (i, frame) in frames.iter().enumerate() {
            let stride = align16(Self::MAC_OFFSET as usize + frame.data.len());
            assert!(
                offset + stride <= self.layout.block_size as usize,
                "frames do not fit in one block"
            );

            let mut status = TP_STATUS_USER;
            if frame.vlan.is_some() {
                status |= TP_STATUS_VLAN_VALID;
            }
            if frame.hw_timestamp {
                status |= TP_STATUS_TS_RAW_HARDWARE;
            }

            let mut hdr = Tpacket3Hdr {
                tp_next_offset: if i + 1 == frames.len() { 0 } else { stride as u32 },
                tp_sec: frame.sec,
                tp_nsec: frame.nsec,
                tp_snaplen: frame.data.len() as u32,
                tp_len: frame.original_len.unwrap_or(frame.data.len() as u32),
                tp_status: status,
                tp_mac: Self::MAC_OFFSET,
                tp_net: Self::MAC_OFFSET + 14,
                ..Tpacket3Hdr::default()
            };
            hdr.hv1.tp_vlan_tci = u32::from(frame.vlan.unwrap_or(0));

            unsafe {
                std::ptr::write(base.add(offset) as *mut Tpacket3Hdr, hdr);
                std::ptr::copy_nonoverlapping(
                    frame.data.as_ptr(),
                    base.add(offset + Self::MAC_OFFSET as usize),
                    frame.data.len(),
                );
            }
            offset += stride;
        }

        let hdr = base.wrapping_add(offset_of!(TpacketBlockDesc, hdr));
        unsafe {
            std::ptr::write(base as *mut u32, 3);
            std::ptr::write(
                hdr.add(offset_of!(TpacketHdrV1, num_pkts)) as *mut u32,
                frames.len() as u32,
            );
            std::ptr::write(
                hdr.add(offset_of!(TpacketHdrV1, offset_to_first_pkt)) as *mut u32,
                Self::FIRST_OFFSET as u32,
            );
            std::ptr::write(
                hdr.add(offset_of!(TpacketHdrV1, blk_len)) as *mut u32,
                offset as u32,
            );
        }
        self.status_word(block)
            .store(TP_STATUS_USER, Ordering::Release);
    }

    pub fn corrupt_first_offset(&self, block: u32, offset: u32) {
        let hdr = self.block(block).wrapping_add(offset_of!(TpacketBlockDesc, hdr));
        unsafe {
            std::ptr::write(
                hdr.add(offset_of!(TpacketHdrV1, offset_to_first_pkt)) as *mut u32,
                offset,
            );
        }
    }
}

fn align16(n: usize) -> usize {
    (n + 15) & !15
}

/// Backend calls, in the order a successful open makes them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Call {
    Socket,
    Version,
    RxRing,
    Map,
    IfIndex,
    Bind,
    Promisc,
    Fanout,
    HwTimestamp,
    Stats,
}

#[derive(Default)]
pub struct BackendState {
    pub calls: Vec<Call>,
    pub fail: Option<Call>,
    pub open_sockets: usize,
    pub mapped_regions: usize,
    pub ring_request: Option<TpacketReq3>,
    pub writer: Option<RingWriter>,
    pub fanout: Option<(u16, u32)>,
    pub kernel_stats: VecDeque<io::Result<KernelStats>>,
}

/// A [`PacketBackend`] with scripted failures and leak accounting.
#[derive(Clone, Default)]
pub struct TestBackend {
    state: Rc<RefCell<BackendState>>,
}

impl TestBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing_at(call: Call) -> Self {
        let backend = Self::default();
        backend.state.borrow_mut().fail = Some(call);
        backend
    }

    pub fn fail_at(&self, call: Option<Call>) {
        self.state.borrow_mut().fail = call;
    }

    pub fn writer(&self) -> RingWriter {
        self.state.borrow().writer.expect("ring has not been mapped")
    }

    pub fn open_sockets(&self) -> usize {
        self.state.borrow().open_sockets
    }

    pub fn mapped_regions(&self) -> usize {
        self.state.borrow().mapped_regions
    }

    pub fn calls(&self) -> Vec<Call> {
        self.state.borrow().calls.clone()
    }

    pub fn fanout(&self) -> Option<(u16, u32)> {
        self.state.borrow().fanout
    }

    pub fn ring_request(&self) -> Option<TpacketReq3> {
        self.state.borrow().ring_request
    }

    pub fn push_stats(&self, stats: io::Result<KernelStats>) {
        self.state.borrow_mut().kernel_stats.push_back(stats);
    }

    fn record(&self, call: Call) -> io::Result<()> {
        let mut state = self.state.borrow_mut();
        state.calls.push(call);
        if state.fail == Some(call) {
            return Err(io::Error::from_raw_os_error(libc::EPERM));
        }
        Ok(())
    }
}

pub struct TestSocket {
    state: Rc<RefCell<BackendState>>,
}

impl AsRawFd for TestSocket {
    fn as_raw_fd(&self) -> RawFd {
        7
    }
}

impl Drop for TestSocket {
    fn drop(&mut self) {
        self.state.borrow_mut().open_sockets -= 1;
    }
}

pub struct TestRegion {
    heap: HeapRegion,
    state: Rc<RefCell<BackendState>>,
}

impl RingRegion for TestRegion {
    fn as_ptr(&self) -> NonNull<u8> {
        self.heap.as_ptr()
    }

    fn size(&self) -> usize {
        self.heap.size()
    }
}

impl Drop for TestRegion {
    fn drop(&mut self) {
        let mut state = self.state.borrow_mut();
        state.mapped_regions -= 1;
        state.writer = None;
    }
}

impl PacketBackend for TestBackend {
    type Socket = TestSocket;
    type Region = TestRegion;

    fn open_socket(&self) -> io::Result<TestSocket> {
        self.record(Call::Socket)?;
        self.state.borrow_mut().open_sockets += 1;
        Ok(TestSocket {
            state: Rc::clone(&self.state),
        })
    }

    fn set_tpacket_version(&self, _socket: &TestSocket) -> io::Result<()> {
        self.record(Call::Version)
    }

    fn set_rx_ring(&self, _socket: &TestSocket, req: &TpacketReq3) -> io::Result<()> {
        self.record(Call::RxRing)?;
        self.state.borrow_mut().ring_request = Some(*req);
        Ok(())
    }

    fn map_ring(&self, _socket: &TestSocket, size: usize) -> io::Result<TestRegion> {
        self.record(Call::Map)?;
        let req = self
            .state
            .borrow()
            .ring_request
            .expect("ring mapped before it was configured");
        let layout = RingLayout {
            block_size: req.tp_block_size,
            block_count: req.tp_block_nr,
            frame_size: req.tp_frame_size,
            retire_timeout_ms: req.tp_retire_blk_tov,
        };

        let heap = HeapRegion::zeroed(size);
        let mut state = self.state.borrow_mut();
        state.writer = Some(RingWriter::new(&heap, layout));
        state.mapped_regions += 1;
        Ok(TestRegion {
            heap,
            state: Rc::clone(&self.state),
        })
    }

    fn interface_index(&self, _socket: &TestSocket, _name: &str) -> io::Result<i32> {
        self.record(Call::IfIndex)?;
        Ok(3)
    }

    fn bind(&self, _socket: &TestSocket, _ifindex: i32) -> io::Result<()> {
        self.record(Call::Bind)
    }

    fn add_promiscuous_membership(&self, _socket: &TestSocket, _ifindex: i32) -> io::Result<()> {
        self.record(Call::Promisc)
    }

    fn join_fanout(&self, _socket: &TestSocket, group_id: u16, mode: u32) -> io::Result<()> {
        self.record(Call::Fanout)?;
        self.state.borrow_mut().fanout = Some((group_id, mode));
        Ok(())
    }

    fn enable_hw_timestamping(&self, _socket: &TestSocket, _name: &str) -> io::Result<()> {
        self.record(Call::HwTimestamp)
    }

    fn packet_statistics(&self, _socket: &TestSocket) -> io::Result<KernelStats> {
        self.record(Call::Stats)?;
        self.state
            .borrow_mut()
            .kernel_stats
            .pop_front()
            .unwrap_or(Ok(KernelStats::default()))
    }

    fn page_size(&self) -> usize {
        4096
    }
}
