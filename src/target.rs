//! An in-process simulation of the PIC18F bootloader, speaking the same
//! wire protocol the real device does. Used by integration tests and by
//! `piclink simulate` to exercise [`crate::programmer::Programmer`]
//! without real hardware.

use std::net::{SocketAddr, UdpSocket};
use std::time::{Duration, Instant};

use crate::device::DeviceDescriptor;
use crate::error::Result;
use crate::protocol::{
    self, ChecksumReply, DiscoverReply, Header, Operation, ReceiveBuffer, Status, HEADER_LEN,
    VERSION,
};

/// A simulated device: a flash array plus the protocol state machine that
/// drives it.
pub struct Target {
    socket: UdpSocket,
    descriptor: &'static DeviceDescriptor,
    bootloader_address: u32,
    flash: Vec<u8>,
    programmer_addr: Option<SocketAddr>,
    last_seq: Option<u8>,
    rx: ReceiveBuffer,
}

impl Target {
    pub fn bind(bind_addr: SocketAddr, descriptor: &'static DeviceDescriptor) -> Result<Self> {
        let socket = UdpSocket::bind(bind_addr)?;
        Ok(Target {
            socket,
            descriptor,
            bootloader_address: 0xDEADBEEF,
            flash: vec![0xffu8; descriptor.flash_size as usize],
            programmer_addr: None,
            last_seq: None,
            rx: ReceiveBuffer::new(),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// Test accessor: current flash contents.
    pub fn flash(&self) -> &[u8] {
        &self.flash
    }

    /// Test accessor: the pinned programmer address, if any.
    pub fn programmer_addr(&self) -> Option<SocketAddr> {
        self.programmer_addr
    }

    /// Serve requests until `deadline`, or forever if `None`. Returns once
    /// the socket times out with nothing left to process.
    pub fn serve_until(&mut self, deadline: Option<Instant>) -> Result<()> {
        loop {
            let timeout = match deadline {
                Some(d) => {
                    let remaining = d.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        return Ok(());
                    }
                    Some(remaining)
                }
                None => None,
            };
            self.socket.set_read_timeout(timeout)?;

            let (n, from) = match self.socket.recv_from(self.rx.storage_mut()) {
                Ok(v) => v,
                Err(e)
                    if matches!(
                        e.kind(),
                        std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
                    ) =>
                {
                    if deadline.is_some() {
                        return Ok(());
                    }
                    continue;
                }
                Err(e) => return Err(e.into()),
            };
            self.rx.set_content_length(n);
            self.handle_frame(from)?;
        }
    }

    /// Serve a single request, waiting up to `timeout`.
    pub fn serve_one(&mut self, timeout: Duration) -> Result<()> {
        self.serve_until(Some(Instant::now() + timeout))
    }

    pub fn serve_forever(&mut self) -> Result<()> {
        self.serve_until(None)
    }

    fn handle_frame(&mut self, from: SocketAddr) -> Result<()> {
        let header = match self.rx.header() {
            Ok(h) => h,
            Err(_) => return Ok(()),
        };
        if header.version != VERSION {
            return Ok(());
        }
        let Some(op) = Operation::from_u8(header.operation) else {
            return Ok(());
        };

        // Discovery and network configuration are never pinned or
        // deduplicated: any host may ask "who are you" at any time.
        if !matches!(op, Operation::Discover | Operation::NetConfig) {
            if let Some(pinned) = self.programmer_addr {
                if pinned != from {
                    self.reply_status(from, header, Status::InvSrc);
                    return Ok(());
                }
            }
            if self.last_seq == Some(header.seq) {
                // Already answered this request; the original reply must
                // have been lost in transit. Drop the duplicate silently,
                // since re-running a write or erase is not idempotent.
                return Ok(());
            }
        }

        self.last_seq = Some(header.seq);

        match op {
            Operation::Discover | Operation::NetConfig => {
                self.programmer_addr = Some(from);
                self.reply_discover(from, header);
            }
            Operation::Erase => self.handle_erase(from, header),
            Operation::Write => self.handle_write(from, header),
            Operation::Read => self.handle_read(from, header),
            Operation::Checksum => self.handle_checksum(from, header),
            Operation::Reset => self.reply_status(from, header, Status::Ok),
        }

        Ok(())
    }

    fn reply_discover(&self, from: SocketAddr, header: Header) {
        let reply = DiscoverReply {
            version: 0x0100,
            device_id: self.descriptor.dev_id << 5,
            bootloader_address: self.bootloader_address,
        };
        self.send_payload(from, header, Status::Ok, &|buf| reply.encode(buf), DiscoverReply::LEN);
    }

    fn handle_erase(&mut self, from: SocketAddr, header: Header) {
        let payload = match self
            .rx
            .typed_payload(Operation::Erase, protocol::Erase::decode, protocol::Erase::LEN)
        {
            Ok(p) => p,
            Err(_) => {
                self.reply_status(from, header, Status::InvParam);
                return;
            }
        };

        if payload.address % self.descriptor.erase_size != 0
            || payload.address + self.descriptor.erase_size > self.descriptor.flash_size
        {
            self.reply_status(from, header, Status::InvParam);
            return;
        }

        self.reply_status(from, header, Status::InProgress);

        let start = payload.address as usize;
        let end = start + self.descriptor.erase_size as usize;
        self.flash[start..end].fill(0xff);

        self.reply_status(from, header, Status::Done);
    }

    fn handle_write(&mut self, from: SocketAddr, header: Header) {
        let write_size = self.descriptor.write_size as usize;
        let payload = match self
            .rx
            .typed_payload(Operation::Write, |buf| protocol::Write::decode(buf, write_size), 4 + write_size)
        {
            Ok(p) => p,
            Err(_) => {
                self.reply_status(from, header, Status::InvParam);
                return;
            }
        };

        if payload.address % self.descriptor.write_size != 0
            || payload.address + self.descriptor.write_size > self.descriptor.flash_size
        {
            self.reply_status(from, header, Status::InvParam);
            return;
        }

        self.reply_status(from, header, Status::InProgress);

        let start = payload.address as usize;
        self.flash[start..start + write_size].copy_from_slice(&payload.data);

        self.reply_status(from, header, Status::Done);
    }

    fn handle_read(&self, from: SocketAddr, header: Header) {
        let payload = match self
            .rx
            .typed_payload(Operation::Read, protocol::Read::decode, protocol::Read::LEN)
        {
            Ok(p) => p,
            Err(_) => {
                self.reply_status(from, header, Status::InvParam);
                return;
            }
        };

        let length = payload.length as usize;
        if length > ReceiveBuffer::MAX_PAYLOAD
            || payload.address as usize + length > self.flash.len()
        {
            self.reply_status(from, header, Status::InvParam);
            return;
        }

        self.reply_status(from, header, Status::InProgress);

        let start = payload.address as usize;
        let data = self.flash[start..start + length].to_vec();
        self.send_payload(from, header, Status::Done, &|buf| {
            buf[..data.len()].copy_from_slice(&data)
        }, data.len());
    }

    fn handle_checksum(&self, from: SocketAddr, header: Header) {
        let payload = match self.rx.typed_payload(
            Operation::Checksum,
            protocol::Checksum::decode,
            protocol::Checksum::LEN,
        ) {
            Ok(p) => p,
            Err(_) => {
                self.reply_status(from, header, Status::InvParam);
                return;
            }
        };

        let length = payload.length as usize;
        if payload.address as usize + length > self.flash.len() {
            self.reply_status(from, header, Status::InvParam);
            return;
        }

        self.reply_status(from, header, Status::InProgress);

        let start = payload.address as usize;
        let checksum = self.flash[start..start + length]
            .iter()
            .fold(0u32, |acc, &b| acc.wrapping_add(b as u32));

        let reply = ChecksumReply { checksum };
        self.send_payload(
            from,
            header,
            Status::Done,
            &|buf| reply.encode(buf),
            ChecksumReply::LEN,
        );
    }

    fn reply_status(&self, from: SocketAddr, header: Header, status: Status) {
        let mut buf = [0u8; HEADER_LEN];
        let reply = Header {
            version: VERSION,
            seq: header.seq,
            operation: header.operation,
            status: status as u8,
        };
        reply.encode(&mut buf);
        let _ = self.socket.send_to(&buf, from);
    }

    fn send_payload(
        &self,
        from: SocketAddr,
        header: Header,
        status: Status,
        encode: &dyn Fn(&mut [u8]),
        payload_len: usize,
    ) {
        let mut buf = vec![0u8; HEADER_LEN + payload_len];
        let reply = Header {
            version: VERSION,
            seq: header.seq,
            operation: header.operation,
            status: status as u8,
        };
        reply.encode(&mut buf[..HEADER_LEN]);
        encode(&mut buf[HEADER_LEN..]);
        let _ = self.socket.send_to(&buf, from);
    }
}
