//! piclink error type and associated utilities
use thiserror::Error;

/// Possible error types when driving the PIC18F bootloader protocol.
#[derive(Error, Debug)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed firmware image: {0}")]
    Format(String),
    #[error("overlapping memory blocks at {new_addr:#010x}..{new_end:#010x} and existing section {sect_addr:#010x}..{sect_end:#010x}")]
    Overlap {
        new_addr: u32,
        new_end: u32,
        sect_addr: u32,
        sect_end: u32,
    },
    #[error("address or length not aligned to the device's sector size: {0}")]
    Unaligned(String),
    #[error("address range exceeds device flash or payload limits: {0}")]
    OutOfRange(String),
    #[error("unknown device id {0:#06x}")]
    UnknownDevice(u16),
    #[error("not connected to a target")]
    NotConnected,
    #[error("protocol error: {0}")]
    ProtocolError(String),
    #[error("target denied the operation (status {0:#04x})")]
    Denied(u8),
    #[error("target did not respond within the retry budget")]
    Timeout,
}

pub type Result<T> = std::result::Result<T, Error>;
