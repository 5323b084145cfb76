//! The wire protocol spoken between the programmer and a PIC18F bootloader.
//!
//! Every frame is `Header` followed by an operation-specific payload.
//! Multibyte payload fields are big-endian; the header's own fields are
//! single bytes. Structs are never read directly off the wire buffer;
//! fields are encoded/decoded one at a time so layout never depends on
//! platform endianness or padding.

use crate::error::{Error, Result};

/// Default UDP port the bootloader listens on.
pub const PORT: u16 = 666;
/// Wire protocol version implemented by this crate.
pub const VERSION: u8 = 1;

pub const HEADER_LEN: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Operation {
    Discover = 0,
    NetConfig = 1,
    Read = 2,
    Write = 3,
    Erase = 4,
    Checksum = 5,
    Reset = 6,
}

impl Operation {
    pub fn from_u8(v: u8) -> Option<Self> {
        Some(match v {
            0 => Operation::Discover,
            1 => Operation::NetConfig,
            2 => Operation::Read,
            3 => Operation::Write,
            4 => Operation::Erase,
            5 => Operation::Checksum,
            6 => Operation::Reset,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Status {
    Request = 0,
    Ok = 1,
    InvOp = 2,
    InvParam = 3,
    InProgress = 4,
    Done = 5,
    InvSrc = 6,
}

impl Status {
    pub fn from_u8(v: u8) -> Option<Self> {
        Some(match v {
            0 => Status::Request,
            1 => Status::Ok,
            2 => Status::InvOp,
            3 => Status::InvParam,
            4 => Status::InProgress,
            5 => Status::Done,
            6 => Status::InvSrc,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub version: u8,
    pub seq: u8,
    pub operation: u8,
    pub status: u8,
}

impl Header {
    pub fn encode(&self, buf: &mut [u8]) {
        buf[0] = self.version;
        buf[1] = self.seq;
        buf[2] = self.operation;
        buf[3] = self.status;
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < HEADER_LEN {
            return Err(Error::ProtocolError("frame shorter than header".into()));
        }
        Ok(Header {
            version: buf[0],
            seq: buf[1],
            operation: buf[2],
            status: buf[3],
        })
    }
}

/// Reply to `OP_DISCOVER` / `OP_NET_CONFIG`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiscoverReply {
    pub version: u16,
    pub device_id: u16,
    pub bootloader_address: u32,
}

impl DiscoverReply {
    pub const LEN: usize = 8;

    pub fn encode(&self, buf: &mut [u8]) {
        buf[0..2].copy_from_slice(&self.version.to_be_bytes());
        buf[2..4].copy_from_slice(&self.device_id.to_be_bytes());
        buf[4..8].copy_from_slice(&self.bootloader_address.to_be_bytes());
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < Self::LEN {
            return Err(Error::ProtocolError("truncated DiscoverReply".into()));
        }
        Ok(DiscoverReply {
            version: u16::from_be_bytes([buf[0], buf[1]]),
            device_id: u16::from_be_bytes([buf[2], buf[3]]),
            bootloader_address: u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]),
        })
    }
}

/// `OP_NET_CONFIG` request payload.
///
/// `ip` is encoded host-endian (effectively little-endian on every
/// platform this talks to), unlike every other multi-byte field on the
/// wire: it is assigned straight from a `in_addr_t` rather than run
/// through a byte-swap. Kept as-is since both sides of the link must
/// agree on the same layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NetworkConfig {
    pub ip: u32,
    pub mac: [u8; 6],
}

impl NetworkConfig {
    pub const LEN: usize = 10;

    pub fn encode(&self, buf: &mut [u8]) {
        buf[0..4].copy_from_slice(&self.ip.to_le_bytes());
        buf[4..10].copy_from_slice(&self.mac);
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < Self::LEN {
            return Err(Error::ProtocolError("truncated NetworkConfig".into()));
        }
        let mut mac = [0u8; 6];
        mac.copy_from_slice(&buf[4..10]);
        Ok(NetworkConfig {
            ip: u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]),
            mac,
        })
    }
}

/// `OP_READ` request payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Read {
    pub address: u32,
    pub length: u16,
}

impl Read {
    pub const LEN: usize = 6;

    pub fn encode(&self, buf: &mut [u8]) {
        buf[0..4].copy_from_slice(&self.address.to_be_bytes());
        buf[4..6].copy_from_slice(&self.length.to_be_bytes());
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < Self::LEN {
            return Err(Error::ProtocolError("truncated Read".into()));
        }
        Ok(Read {
            address: u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]),
            length: u16::from_be_bytes([buf[4], buf[5]]),
        })
    }
}

/// `OP_WRITE` request payload: one write sector's worth of data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Write {
    pub address: u32,
    pub data: Vec<u8>,
}

impl Write {
    pub fn encode(&self, buf: &mut [u8]) {
        buf[0..4].copy_from_slice(&self.address.to_be_bytes());
        buf[4..4 + self.data.len()].copy_from_slice(&self.data);
    }

    pub fn decode(buf: &[u8], write_size: usize) -> Result<Self> {
        if buf.len() < 4 + write_size {
            return Err(Error::ProtocolError("truncated Write".into()));
        }
        Ok(Write {
            address: u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]),
            data: buf[4..4 + write_size].to_vec(),
        })
    }
}

/// `OP_ERASE` request payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Erase {
    pub address: u32,
}

impl Erase {
    pub const LEN: usize = 4;

    pub fn encode(&self, buf: &mut [u8]) {
        buf[0..4].copy_from_slice(&self.address.to_be_bytes());
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < Self::LEN {
            return Err(Error::ProtocolError("truncated Erase".into()));
        }
        Ok(Erase {
            address: u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]),
        })
    }
}

/// `OP_CHECKSUM` request payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Checksum {
    pub address: u32,
    pub length: u32,
}

impl Checksum {
    pub const LEN: usize = 8;

    pub fn encode(&self, buf: &mut [u8]) {
        buf[0..4].copy_from_slice(&self.address.to_be_bytes());
        buf[4..8].copy_from_slice(&self.length.to_be_bytes());
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < Self::LEN {
            return Err(Error::ProtocolError("truncated Checksum".into()));
        }
        Ok(Checksum {
            address: u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]),
            length: u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChecksumReply {
    pub checksum: u32,
}

impl ChecksumReply {
    pub const LEN: usize = 4;

    pub fn encode(&self, buf: &mut [u8]) {
        buf[0..4].copy_from_slice(&self.checksum.to_be_bytes());
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < Self::LEN {
            return Err(Error::ProtocolError("truncated ChecksumReply".into()));
        }
        Ok(ChecksumReply {
            checksum: u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]),
        })
    }
}

/// Fixed-size transmit buffer (128 B) plus the owned sequence counter.
///
/// The sequence counter is bumped exactly once per logical operation, at
/// the moment the frame is handed to the socket for its first send; all
/// retries of that operation reuse the bumped value.
pub struct TransmitBuffer {
    buf: [u8; 128],
    len: usize,
    seq: u8,
}

impl TransmitBuffer {
    pub fn new() -> Self {
        TransmitBuffer {
            buf: [0u8; 128],
            len: HEADER_LEN,
            seq: 0,
        }
    }

    pub fn sequence(&self) -> u8 {
        self.seq
    }

    pub fn operation(&self) -> u8 {
        self.buf[2]
    }

    /// Select an operation with no payload (Discover / Reset).
    pub fn select_operation(&mut self, op: Operation) {
        self.buf[2] = op as u8;
        self.len = HEADER_LEN;
    }

    pub fn prepare_net_config(&mut self, payload: &NetworkConfig) {
        self.buf[2] = Operation::NetConfig as u8;
        payload.encode(&mut self.buf[HEADER_LEN..]);
        self.len = HEADER_LEN + NetworkConfig::LEN;
    }

    pub fn prepare_read(&mut self, payload: &Read) {
        self.buf[2] = Operation::Read as u8;
        payload.encode(&mut self.buf[HEADER_LEN..]);
        self.len = HEADER_LEN + Read::LEN;
    }

    pub fn prepare_write(&mut self, payload: &Write) {
        self.buf[2] = Operation::Write as u8;
        payload.encode(&mut self.buf[HEADER_LEN..]);
        self.len = HEADER_LEN + 4 + payload.data.len();
    }

    pub fn prepare_erase(&mut self, payload: &Erase) {
        self.buf[2] = Operation::Erase as u8;
        payload.encode(&mut self.buf[HEADER_LEN..]);
        self.len = HEADER_LEN + Erase::LEN;
    }

    pub fn prepare_checksum(&mut self, payload: &Checksum) {
        self.buf[2] = Operation::Checksum as u8;
        payload.encode(&mut self.buf[HEADER_LEN..]);
        self.len = HEADER_LEN + Checksum::LEN;
    }

    /// Finalize the frame for sending: bump the sequence number on the
    /// first send of a logical operation and return the bytes to
    /// transmit. Retries must call `as_bytes` instead, which does not
    /// bump the sequence again.
    pub fn finalize_for_send(&mut self) -> &[u8] {
        self.seq = self.seq.wrapping_add(1);
        self.buf[0] = VERSION;
        self.buf[1] = self.seq;
        self.buf[3] = Status::Request as u8;
        &self.buf[..self.len]
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf[..self.len]
    }
}

impl Default for TransmitBuffer {
    fn default() -> Self {
        Self::new()
    }
}

/// Fixed-size receive buffer (1500 B).
pub struct ReceiveBuffer {
    buf: [u8; 1500],
    len: usize,
}

impl ReceiveBuffer {
    pub const BUFFER_SIZE: usize = 1500;
    pub const MAX_PAYLOAD: usize = Self::BUFFER_SIZE - HEADER_LEN;

    pub fn new() -> Self {
        ReceiveBuffer {
            buf: [0u8; 1500],
            len: 0,
        }
    }

    pub fn storage_mut(&mut self) -> &mut [u8] {
        &mut self.buf
    }

    pub fn set_content_length(&mut self, len: usize) {
        self.len = len;
    }

    pub fn header(&self) -> Result<Header> {
        Header::decode(&self.buf[..self.len])
    }

    /// Typed payload view; fails if the operation tag doesn't match or
    /// the buffer is shorter than `header + sizeof(T)`.
    pub fn typed_payload<T>(
        &self,
        expect_op: Operation,
        decode: impl FnOnce(&[u8]) -> Result<T>,
        min_len: usize,
    ) -> Result<T> {
        let header = self.header()?;
        if header.operation != expect_op as u8 {
            return Err(Error::ProtocolError(format!(
                "expected operation {:?}, reply carried {}",
                expect_op, header.operation
            )));
        }
        if self.len < HEADER_LEN + min_len {
            return Err(Error::ProtocolError("truncated reply payload".into()));
        }
        decode(&self.buf[HEADER_LEN..self.len])
    }

    /// Raw byte-slice payload view, used for `OP_READ` replies.
    pub fn raw_payload(&self, expect_op: Operation) -> Result<&[u8]> {
        let header = self.header()?;
        if header.operation != expect_op as u8 {
            return Err(Error::ProtocolError(format!(
                "expected operation {:?}, reply carried {}",
                expect_op, header.operation
            )));
        }
        Ok(&self.buf[HEADER_LEN..self.len])
    }
}

impl Default for ReceiveBuffer {
    fn default() -> Self {
        Self::new()
    }
}
