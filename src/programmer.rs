//! UDP client for the PIC18F network bootloader.
//!
//! Owns the retry/timeout state machine described by the wire protocol:
//! each logical operation is sent up to [`Programmer::RETRIES`] times with
//! a fresh [`Programmer::ATTEMPT_TIMEOUT`] deadline, `STATUS_INPROGRESS`
//! replies extend the current deadline without consuming a retry, and a
//! reply carrying the wrong sequence number or a source address other than
//! the pinned peer is treated as noise and ignored rather than accepted.

use std::io::ErrorKind;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket};
use std::time::{Duration, Instant};

use crate::device::{BootloaderInfo, DeviceDescriptor};
use crate::error::{Error, Result};
use crate::image::Image;
use crate::protocol::{
    self, ChecksumReply, DiscoverReply, NetworkConfig, Operation, Status, TransmitBuffer,
    ReceiveBuffer, VERSION,
};

/// Write-sector size assumed for pre-flight validation before a device's
/// descriptor is known (e.g. during the discovery handshake itself). Every
/// supported device shares this write-sector size; [`Programmer::device`]
/// supplies the real value once connected.
const DEFAULT_WRITE_SIZE: u32 = crate::device::WRITE_SIZE;

/// Fixed MAC address the programmer assigns a device during `OP_NET_CONFIG`.
const CONFIG_MAC: [u8; 6] = [0xCF, 0x8B, 0xC1, 0xB5, 0xB8, 0x0D];

/// Progress notifications emitted while [`Programmer::program`] runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgramEvent {
    Erasing { address: u32 },
    Writing { address: u32 },
}

/// Client side of the flash protocol. Talks to exactly one pinned peer at
/// a time; use [`Programmer::discover_device`] or
/// [`Programmer::connect_device`] to establish that peer before issuing
/// read/write/erase/checksum/reset calls.
pub struct Programmer {
    socket: UdpSocket,
    tx: TransmitBuffer,
    rx: ReceiveBuffer,
    peer: Option<SocketAddr>,
    accept_any_source: bool,
    bootloader: Option<BootloaderInfo>,
    device: Option<&'static DeviceDescriptor>,
}

impl Programmer {
    const RETRIES: u32 = 3;
    const ATTEMPT_TIMEOUT: Duration = Duration::from_millis(1000);

    /// Bind a UDP socket for talking to a bootloader. `bind_addr` is
    /// typically `0.0.0.0:0` to let the OS pick an ephemeral source port.
    pub fn bind(bind_addr: SocketAddr) -> Result<Self> {
        let socket = UdpSocket::bind(bind_addr)?;
        Ok(Programmer {
            socket,
            tx: TransmitBuffer::new(),
            rx: ReceiveBuffer::new(),
            peer: None,
            accept_any_source: false,
            bootloader: None,
            device: None,
        })
    }

    pub fn bootloader_info(&self) -> Option<BootloaderInfo> {
        self.bootloader
    }

    /// The device descriptor resolved from the last discovery/connect
    /// reply's device id, if it was recognized. `None` if not yet
    /// connected, or if the id didn't match a supported part.
    pub fn device(&self) -> Option<&'static DeviceDescriptor> {
        self.device
    }

    fn write_size(&self) -> u32 {
        self.device.map(|d| d.write_size).unwrap_or(DEFAULT_WRITE_SIZE)
    }

    fn erase_size(&self) -> u32 {
        self.device
            .map(|d| d.erase_size)
            .unwrap_or(crate::device::ERASE_SIZE)
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    fn check_connection(&self) -> Result<()> {
        if self.peer.is_none() {
            return Err(Error::NotConnected);
        }
        Ok(())
    }

    /// Broadcast `OP_DISCOVER` and pin the peer to whichever device
    /// answers first. Broadcast is disabled again on every exit path,
    /// whether discovery succeeds or times out.
    pub fn discover_device(&mut self, port: u16) -> Result<BootloaderInfo> {
        let broadcast = SocketAddr::new(IpAddr::V4(Ipv4Addr::BROADCAST), port);
        self.socket.set_broadcast(true)?;
        self.peer = Some(broadcast);
        self.accept_any_source = true;
        self.tx.select_operation(Operation::Discover);

        let outcome = self.send_and_wait(Operation::Discover);
        self.socket.set_broadcast(false)?;
        let from = outcome?;

        self.peer = Some(from);
        self.accept_any_source = false;
        self.finish_discovery(Operation::Discover)
    }

    /// Broadcast `OP_NET_CONFIG` to assign `ip` and a fixed MAC to
    /// whichever device answers, then pin the peer to it.
    pub fn configure_device(&mut self, ip: u32, port: u16) -> Result<BootloaderInfo> {
        let broadcast = SocketAddr::new(IpAddr::V4(Ipv4Addr::BROADCAST), port);
        self.socket.set_broadcast(true)?;
        self.peer = Some(broadcast);
        self.accept_any_source = true;
        self.tx.prepare_net_config(&NetworkConfig {
            ip,
            mac: CONFIG_MAC,
        });

        let outcome = self.send_and_wait(Operation::NetConfig);
        self.socket.set_broadcast(false)?;
        let from = outcome?;

        self.peer = Some(from);
        self.accept_any_source = false;
        self.finish_discovery(Operation::NetConfig)
    }

    /// Unicast `OP_DISCOVER` directly to a known address, without ever
    /// touching the broadcast flag.
    pub fn connect_device(&mut self, ip: Ipv4Addr, port: u16) -> Result<BootloaderInfo> {
        self.peer = Some(SocketAddr::new(IpAddr::V4(ip), port));
        self.accept_any_source = false;
        self.tx.select_operation(Operation::Discover);
        self.send_and_wait(Operation::Discover)?;
        self.finish_discovery(Operation::Discover)
    }

    fn finish_discovery(&mut self, op: Operation) -> Result<BootloaderInfo> {
        let reply = self
            .rx
            .typed_payload(op, DiscoverReply::decode, DiscoverReply::LEN)?;
        let info = BootloaderInfo {
            device_id: reply.device_id,
            version: reply.version,
            bootloader_address: reply.bootloader_address,
        };
        self.bootloader = Some(info);
        self.device = DeviceDescriptor::find(reply.device_id).ok();
        Ok(info)
    }

    /// Read `length` bytes starting at `address`. Rejects with
    /// [`Error::OutOfRange`], without sending a frame, if `length` would
    /// overflow the reply datagram's payload capacity.
    pub fn read(&mut self, address: u32, length: u16) -> Result<Vec<u8>> {
        self.check_connection()?;
        if length as usize > ReceiveBuffer::MAX_PAYLOAD {
            return Err(Error::OutOfRange(format!(
                "read length {} exceeds max payload {}",
                length,
                ReceiveBuffer::MAX_PAYLOAD
            )));
        }
        self.tx.prepare_read(&protocol::Read { address, length });
        self.send_and_wait(Operation::Read)?;
        Ok(self.rx.raw_payload(Operation::Read)?.to_vec())
    }

    /// Write exactly one device write-sector's worth of bytes. Rejects
    /// with [`Error::Unaligned`], without sending a frame, unless
    /// `address` is write-sector aligned and `data` is exactly one
    /// sector long.
    pub fn write_sector(&mut self, address: u32, data: Vec<u8>) -> Result<()> {
        self.check_connection()?;
        let write_size = self.write_size();
        if address % write_size != 0 {
            return Err(Error::Unaligned(format!(
                "write address {:#010x} is not a multiple of the write-sector size {}",
                address, write_size
            )));
        }
        if data.len() as u32 != write_size {
            return Err(Error::Unaligned(format!(
                "write buffer length {} does not match the write-sector size {}",
                data.len(),
                write_size
            )));
        }
        self.tx.prepare_write(&protocol::Write { address, data });
        self.send_and_wait(Operation::Write)?;
        Ok(())
    }

    /// Erase one flash page. Rejects with [`Error::Unaligned`], without
    /// sending a frame, unless `address` falls on an erase-page boundary.
    pub fn erase(&mut self, address: u32) -> Result<()> {
        self.check_connection()?;
        let erase_size = self.erase_size();
        if address % erase_size != 0 {
            return Err(Error::Unaligned(format!(
                "erase address {:#010x} is not a multiple of the erase-page size {}",
                address, erase_size
            )));
        }
        self.tx.prepare_erase(&protocol::Erase { address });
        self.send_and_wait(Operation::Erase)?;
        Ok(())
    }

    pub fn reset(&mut self) -> Result<()> {
        self.check_connection()?;
        self.tx.select_operation(Operation::Reset);
        self.send_and_wait(Operation::Reset)?;
        Ok(())
    }

    pub fn checksum(&mut self, address: u32, length: u32) -> Result<u32> {
        self.check_connection()?;
        if let Some(device) = self.device {
            if address as u64 + length as u64 > device.flash_size as u64 {
                return Err(Error::OutOfRange(format!(
                    "checksum range {:#010x}..{:#010x} exceeds device flash size {:#010x}",
                    address,
                    address as u64 + length as u64,
                    device.flash_size
                )));
            }
        }
        self.tx
            .prepare_checksum(&protocol::Checksum { address, length });
        self.send_and_wait(Operation::Checksum)?;
        let reply = self
            .rx
            .typed_payload(Operation::Checksum, ChecksumReply::decode, ChecksumReply::LEN)?;
        Ok(reply.checksum)
    }

    /// Plan and execute a full image write: erase every flash page touched
    /// by the image exactly once, then write every write-sector exactly
    /// once, padding with the device's idle byte (0xFF) wherever a sector
    /// is only partially covered by image data.
    pub fn program(
        &mut self,
        image: &Image,
        descriptor: &DeviceDescriptor,
        mut progress: impl FnMut(ProgramEvent),
    ) -> Result<()> {
        self.check_connection()?;

        let erase_size = descriptor.erase_size;
        let write_size = descriptor.write_size;

        let mut sections: Vec<_> = image.iter().collect();
        sections.sort_by_key(|s| s.address);

        // Highest address already erased (exclusive), the current write
        // sector's bounds, and its accumulator buffer. Sections are walked
        // in ascending address order so both erase and write sector
        // addresses only ever move forward, which is what guarantees a
        // page is erased at most once and a sector written at most once.
        let mut erase_end: u32 = 0;
        let mut sector_addr: u32 = 0;
        let mut sector_end: u32 = 0;
        let mut buffer = vec![0xffu8; write_size as usize];
        let mut sector_active = false;

        for section in sections {
            if section.end_address() > descriptor.flash_size {
                return Err(Error::OutOfRange(format!(
                    "section {:#010x}..{:#010x} exceeds flash size {:#010x}",
                    section.address,
                    section.end_address(),
                    descriptor.flash_size
                )));
            }

            let mut addr = section.address;
            while addr < section.end_address() {
                if addr >= sector_end {
                    if sector_active {
                        progress(ProgramEvent::Writing {
                            address: sector_addr,
                        });
                        self.write_sector(sector_addr, buffer.clone())?;
                    }
                    sector_addr = align_down(addr, write_size);
                    sector_end = sector_addr + write_size;
                    buffer = vec![0xffu8; write_size as usize];
                    sector_active = true;

                    if sector_addr >= erase_end {
                        let page = align_down(sector_addr, erase_size);
                        progress(ProgramEvent::Erasing { address: page });
                        self.erase(page)?;
                        erase_end = page + erase_size;
                    }
                }

                let n = (sector_end - addr).min(section.end_address() - addr) as usize;
                let src_off = (addr - section.address) as usize;
                let dst_off = (addr - sector_addr) as usize;
                buffer[dst_off..dst_off + n].copy_from_slice(&section.data[src_off..src_off + n]);
                addr += n as u32;
            }
        }

        if sector_active {
            progress(ProgramEvent::Writing {
                address: sector_addr,
            });
            self.write_sector(sector_addr, buffer)?;
        }

        Ok(())
    }

    /// Send the currently-prepared frame, retrying on timeout and
    /// extending the deadline on `STATUS_INPROGRESS`, until a terminal
    /// reply to `expect_op` arrives from the expected peer. Returns the
    /// address the accepted reply came from.
    fn send_and_wait(&mut self, expect_op: Operation) -> Result<SocketAddr> {
        let dest = self.peer.ok_or(Error::NotConnected)?;
        let frame = self.tx.finalize_for_send().to_vec();
        let seq = self.tx.sequence();

        for _attempt in 0..Self::RETRIES {
            self.socket.send_to(&frame, dest)?;

            let mut deadline = Instant::now() + Self::ATTEMPT_TIMEOUT;
            loop {
                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    break;
                }
                self.socket.set_read_timeout(Some(remaining))?;

                let (n, from) = match self.socket.recv_from(self.rx.storage_mut()) {
                    Ok(v) => v,
                    Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                        break
                    }
                    Err(e) => return Err(e.into()),
                };

                if !self.accept_any_source && Some(from) != self.peer {
                    continue;
                }

                self.rx.set_content_length(n);
                let header = match self.rx.header() {
                    Ok(h) => h,
                    Err(_) => continue,
                };
                if header.version != VERSION || header.seq != seq {
                    // Stale or unrelated datagram; tolerated silently.
                    continue;
                }
                if header.operation != expect_op as u8 {
                    continue;
                }

                let status = match Status::from_u8(header.status) {
                    Some(s) => s,
                    None => {
                        return Err(Error::ProtocolError(format!(
                            "unrecognized status byte {:#04x}",
                            header.status
                        )))
                    }
                };

                match status {
                    Status::InvSrc | Status::InvOp | Status::InvParam => {
                        return Err(Error::Denied(header.status))
                    }
                    Status::InProgress if in_progress_allowed(expect_op) => {
                        deadline = Instant::now() + Self::ATTEMPT_TIMEOUT;
                        continue;
                    }
                    _ if is_terminal_status(expect_op, status) => return Ok(from),
                    _ => {
                        return Err(Error::ProtocolError(format!(
                            "status {:?} is not valid for operation {:?}",
                            status, expect_op
                        )))
                    }
                }
            }
        }

        Err(Error::Timeout)
    }
}

/// `STATUS_INPROGRESS` is an intermediate reply only for the slow
/// operations; a `DISCOVER`/`NET_CONFIG`/`RESET` reply carrying it would be
/// a protocol violation rather than something to wait out.
fn in_progress_allowed(op: Operation) -> bool {
    matches!(
        op,
        Operation::Read | Operation::Write | Operation::Erase | Operation::Checksum
    )
}

/// The terminal-status compatibility table of the wire protocol:
/// `DISCOVER`/`NET_CONFIG`/`RESET` only ever conclude with `STATUS_OK`;
/// `READ`/`WRITE`/`CHECKSUM` conclude with `STATUS_DONE`; `ERASE` is the
/// one historical divergence and is accepted either way.
fn is_terminal_status(op: Operation, status: Status) -> bool {
    match op {
        Operation::Discover | Operation::NetConfig | Operation::Reset => status == Status::Ok,
        Operation::Read | Operation::Write | Operation::Checksum => status == Status::Done,
        Operation::Erase => matches!(status, Status::Ok | Status::Done),
    }
}

fn align_down(addr: u32, align: u32) -> u32 {
    addr - (addr % align)
}

#[allow(dead_code)]
fn align_up(addr: u32, align: u32) -> u32 {
    align_down(addr + align - 1, align)
}
