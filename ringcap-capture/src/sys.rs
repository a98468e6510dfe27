//! ## ringcap-capture::sys
//! **AF_PACKET kernel boundary**
//!
//! Layouts in this module mirror `<linux/if_packet.h>` and `<linux/net_tstamp.h>`
//! and must stay bit-for-bit identical to them. Every system call the capture
//! session makes goes through [`PacketBackend`], so the session and the ring
//! walker can be driven by something other than a live kernel.

use std::ffi::CString;
use std::io;
use std::mem::{self, offset_of};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::ptr::{self, NonNull};

pub const PACKET_ADD_MEMBERSHIP: libc::c_int = 1;
pub const PACKET_RX_RING: libc::c_int = 5;
pub const PACKET_STATISTICS: libc::c_int = 6;
pub const PACKET_VERSION: libc::c_int = 10;
pub const PACKET_TIMESTAMP: libc::c_int = 17;
pub const PACKET_FANOUT: libc::c_int = 18;

pub const PACKET_MR_PROMISC: u16 = 1;
pub const PACKET_FANOUT_HASH: u32 = 0;

pub const TPACKET_V3: libc::c_int = 2;
pub const TPACKET_ALIGNMENT: u32 = 16;

pub const TP_STATUS_KERNEL: u32 = 0;
pub const TP_STATUS_USER: u32 = 1;
pub const TP_STATUS_VLAN_VALID: u32 = 1 << 4;
pub const TP_STATUS_TS_RAW_HARDWARE: u32 = 1 << 31;

pub const SIOCSHWTSTAMP: u32 = 0x89b0;
pub const HWTSTAMP_TX_OFF: libc::c_int = 0;
pub const HWTSTAMP_FILTER_ALL: libc::c_int = 1;
pub const SOF_TIMESTAMPING_RX_HARDWARE: libc::c_int = 1 << 2;
pub const SOF_TIMESTAMPING_RAW_HARDWARE: libc::c_int = 1 << 6;

const ETH_P_ALL: u16 = libc::ETH_P_ALL as u16;
const DEFAULT_PAGE_SIZE: usize = 4096;

/// `struct tpacket_req3`
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TpacketReq3 {
    pub tp_block_size: u32,
    pub tp_block_nr: u32,
    pub tp_frame_size: u32,
    pub tp_frame_nr: u32,
    pub tp_retire_blk_tov: u32,
    pub tp_sizeof_priv: u32,
    pub tp_feature_req_word: u32,
}

/// `struct tpacket_bd_ts`
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct TpacketBdTs {
    pub ts_sec: u32,
    pub ts_nsec: u32,
}

/// `struct tpacket_hdr_v1`, the only member of `union tpacket_bd_header_u`.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct TpacketHdrV1 {
    pub block_status: u32,
    pub num_pkts: u32,
    pub offset_to_first_pkt: u32,
    pub blk_len: u32,
    pub seq_num: u64,
    pub ts_first_pkt: TpacketBdTs,
    pub ts_last_pkt: TpacketBdTs,
}

/// `struct tpacket_block_desc`, found at the start of every ring block.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct TpacketBlockDesc {
    pub version: u32,
    pub offset_to_priv: u32,
    pub hdr: TpacketHdrV1,
}

/// `struct tpacket_hdr_variant1`
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct TpacketHdrVariant1 {
    pub tp_rxhash: u32,
    pub tp_vlan_tci: u32,
    pub tp_vlan_tpid: u16,
    pub tp_padding: u16,
}

/// `struct tpacket3_hdr`, the per-frame header inside a block.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct Tpacket3Hdr {
    pub tp_next_offset: u32,
    pub tp_sec: u32,
    pub tp_nsec: u32,
    pub tp_snaplen: u32,
    pub tp_len: u32,
    pub tp_status: u32,
    pub tp_mac: u16,
    pub tp_net: u16,
    pub hv1: TpacketHdrVariant1,
    pub tp_padding: [u8; 8],
}

/// `struct tpacket_stats_v3`
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct TpacketStatsV3 {
    pub tp_packets: u32,
    pub tp_drops: u32,
    pub tp_freeze_q_cnt: u32,
}

/// `struct hwtstamp_config`
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct HwtstampConfig {
    pub flags: libc::c_int,
    pub tx_type: libc::c_int,
    pub rx_filter: libc::c_int,
}

const _: () = assert!(mem::size_of::<TpacketReq3>() == 28);
const _: () = assert!(mem::size_of::<TpacketBlockDesc>() == 48);
const _: () = assert!(mem::size_of::<Tpacket3Hdr>() == 48);
const _: () = assert!(mem::size_of::<TpacketStatsV3>() == 12);

/// Byte offset of `hdr.bh1.block_status` from the start of a block.
pub const BLOCK_STATUS_OFFSET: usize =
    offset_of!(TpacketBlockDesc, hdr) + offset_of!(TpacketHdrV1, block_status);

/// Counters returned by `PACKET_STATISTICS`.
///
/// The kernel zeroes its counters on every read, so each value is the delta
/// since the previous query.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct KernelStats {
    pub packets: u64,
    pub drops: u64,
}

/// Memory shared with the kernel that backs a receive ring.
pub trait RingRegion {
    /// Start of the region. Must stay valid and fixed for the region's lifetime.
    fn as_ptr(&self) -> NonNull<u8>;

    /// Size of the region in bytes.
    fn size(&self) -> usize;
}

/// The system calls a capture session needs.
///
/// `Socket` is closed and `Region` is unmapped when dropped, so a partially
/// negotiated session unwinds by letting its locals fall out of scope.
pub trait PacketBackend {
    type Socket: AsRawFd;
    type Region: RingRegion;

    /// Raw packet socket receiving every link-layer protocol.
    fn open_socket(&self) -> io::Result<Self::Socket>;

    fn set_tpacket_version(&self, socket: &Self::Socket) -> io::Result<()>;

    fn set_rx_ring(&self, socket: &Self::Socket, req: &TpacketReq3) -> io::Result<()>;

    fn map_ring(&self, socket: &Self::Socket, size: usize) -> io::Result<Self::Region>;

    fn interface_index(&self, socket: &Self::Socket, name: &str) -> io::Result<i32>;

    fn bind(&self, socket: &Self::Socket, ifindex: i32) -> io::Result<()>;

    fn add_promiscuous_membership(&self, socket: &Self::Socket, ifindex: i32) -> io::Result<()>;

    /// Join fanout group `group_id` with distribution `mode` (e.g. [`PACKET_FANOUT_HASH`]).
    fn join_fanout(&self, socket: &Self::Socket, group_id: u16, mode: u32) -> io::Result<()>;

    /// Ask the driver for RX hardware timestamps and the socket to prefer them.
    fn enable_hw_timestamping(&self, socket: &Self::Socket, name: &str) -> io::Result<()>;

    fn packet_statistics(&self, socket: &Self::Socket) -> io::Result<KernelStats>;

    fn page_size(&self) -> usize;
}

/// A `MAP_SHARED` mapping of a packet socket's ring.
#[derive(Debug)]
pub struct MmapRegion {
    ptr: NonNull<u8>,
    len: usize,
}

impl RingRegion for MmapRegion {
    fn as_ptr(&self) -> NonNull<u8> {
        self.ptr
    }

    fn size(&self) -> usize {
        self.len
    }
}

impl Drop for MmapRegion {
    fn drop(&mut self) {
        unsafe { libc::munmap(self.ptr.as_ptr() as *mut libc::c_void, self.len) };
    }
}

/// [`PacketBackend`] talking to the running Linux kernel.
#[derive(Debug, Clone, Copy, Default)]
pub struct LinuxBackend;

impl LinuxBackend {
    fn setsockopt<T>(fd: RawFd, name: libc::c_int, value: &T) -> io::Result<()> {
        let ret = unsafe {
            libc::setsockopt(
                fd,
                libc::SOL_PACKET,
                name,
                value as *const T as *const libc::c_void,
                mem::size_of::<T>() as libc::socklen_t,
            )
        };

        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    fn ifreq(name: &str) -> io::Result<libc::ifreq> {
        let name_c = CString::new(name)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "interface name contains NUL"))?;
        let bytes = name_c.as_bytes_with_nul();

        let mut ifr: libc::ifreq = unsafe { mem::zeroed() };
        if bytes.len() > ifr.ifr_name.len() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("interface name '{}' is too long", name),
            ));
        }
        for (dst, src) in ifr.ifr_name.iter_mut().zip(bytes) {
            *dst = *src as libc::c_char;
        }
        Ok(ifr)
    }
}

impl PacketBackend for LinuxBackend {
    type Socket = OwnedFd;
    type Region = MmapRegion;

    fn open_socket(&self) -> io::Result<OwnedFd> {
        let fd = unsafe {
            libc::socket(
                libc::AF_PACKET,
                libc::SOCK_RAW | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
                ETH_P_ALL.to_be() as libc::c_int,
            )
        };

        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(unsafe { OwnedFd::from_raw_fd(fd) })
    }

    fn set_tpacket_version(&self, socket: &OwnedFd) -> io::Result<()> {
        Self::setsockopt(socket.as_raw_fd(), PACKET_VERSION, &TPACKET_V3)
    }

    fn set_rx_ring(&self, socket: &OwnedFd, req: &TpacketReq3) -> io::Result<()> {
        Self::setsockopt(socket.as_raw_fd(), PACKET_RX_RING, req)
    }

    fn map_ring(&self, socket: &OwnedFd, size: usize) -> io::Result<MmapRegion> {
        let mapped = unsafe {
            libc::mmap(
                ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                socket.as_raw_fd(),
                0,
            )
        };

        if mapped == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }
        let ptr = NonNull::new(mapped as *mut u8)
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "mmap returned a null mapping"))?;
        Ok(MmapRegion { ptr, len: size })
    }

    fn interface_index(&self, socket: &OwnedFd, name: &str) -> io::Result<i32> {
        let mut ifr = Self::ifreq(name)?;
        let ret = unsafe { libc::ioctl(socket.as_raw_fd(), libc::SIOCGIFINDEX as _, &mut ifr) };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(unsafe { ifr.ifr_ifru.ifru_ifindex })
    }

    fn bind(&self, socket: &OwnedFd, ifindex: i32) -> io::Result<()> {
        let sockaddr = libc::sockaddr_ll {
            sll_family: libc::AF_PACKET as u16,
            sll_protocol: ETH_P_ALL.to_be(),
            sll_ifindex: ifindex,
            sll_hatype: 0,
            sll_pkttype: 0,
            sll_halen: 0,
            sll_addr: [0; 8],
        };

        let ret = unsafe {
            libc::bind(
                socket.as_raw_fd(),
                &sockaddr as *const _ as *const libc::sockaddr,
                mem::size_of::<libc::sockaddr_ll>() as libc::socklen_t,
            )
        };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    fn add_promiscuous_membership(&self, socket: &OwnedFd, ifindex: i32) -> io::Result<()> {
        let mreq = libc::packet_mreq {
            mr_ifindex: ifindex,
            mr_type: PACKET_MR_PROMISC,
            mr_alen: 0,
            mr_address: [0; 8],
        };
        Self::setsockopt(socket.as_raw_fd(), PACKET_ADD_MEMBERSHIP, &mreq)
    }

    fn join_fanout(&self, socket: &OwnedFd, group_id: u16, mode: u32) -> io::Result<()> {
        let fanout_arg: u32 = u32::from(group_id) | (mode << 16);
        Self::setsockopt(socket.as_raw_fd(), PACKET_FANOUT, &fanout_arg)
    }

    fn enable_hw_timestamping(&self, socket: &OwnedFd, name: &str) -> io::Result<()> {
        let mut config = HwtstampConfig {
            flags: 0,
            tx_type: HWTSTAMP_TX_OFF,
            rx_filter: HWTSTAMP_FILTER_ALL,
        };
        let mut ifr = Self::ifreq(name)?;
        ifr.ifr_ifru.ifru_data = &mut config as *mut HwtstampConfig as *mut libc::c_char;

        let ret = unsafe { libc::ioctl(socket.as_raw_fd(), SIOCSHWTSTAMP as _, &mut ifr) };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }

        let opt: libc::c_int = SOF_TIMESTAMPING_RAW_HARDWARE | SOF_TIMESTAMPING_RX_HARDWARE;
        Self::setsockopt(socket.as_raw_fd(), PACKET_TIMESTAMP, &opt)
    }

    fn packet_statistics(&self, socket: &OwnedFd) -> io::Result<KernelStats> {
        let mut stats = TpacketStatsV3::default();
        let mut len = mem::size_of::<TpacketStatsV3>() as libc::socklen_t;

        let ret = unsafe {
            libc::getsockopt(
                socket.as_raw_fd(),
                libc::SOL_PACKET,
                PACKET_STATISTICS,
                &mut stats as *mut TpacketStatsV3 as *mut libc::c_void,
                &mut len,
            )
        };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }

        Ok(KernelStats {
            packets: u64::from(stats.tp_packets),
            drops: u64::from(stats.tp_drops),
        })
    }

    fn page_size(&self) -> usize {
        match unsafe { libc::sysconf(libc::_SC_PAGESIZE) } {
            size if size > 0 => size as usize,
            _ => DEFAULT_PAGE_SIZE,
        }
    }
}
