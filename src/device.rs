//! PIC18F device descriptors and bootloader info.

use crate::error::{Error, Result};

/// Global address-space and protocol constants shared by every supported
/// device, per the bootloader's wire contract.
pub const MAX_ADDR: u32 = 0x1FFFFF;
pub const ERASE_SIZE: u32 = 1024;
pub const WRITE_SIZE: u32 = 64;
pub const RESET_VECTOR: u32 = 0x00;

const ID_SHIFT: u32 = 5;
const REV_MASK: u16 = (1 << ID_SHIFT) - 1;

/// Static table entry describing one supported PIC18F part.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceDescriptor {
    pub dev_id: u16,
    pub name: &'static str,
    pub flash_size: u32,
    pub config_address: u32,
    pub erase_size: u32,
    pub write_size: u32,
}

impl DeviceDescriptor {
    pub const CONFIG1L: u32 = 0x300000;
    pub const CONFIG1H: u32 = 0x300001;
    pub const CONFIG2L: u32 = 0x300002;
    pub const CONFIG2H: u32 = 0x300003;
    pub const CONFIG3L: u32 = 0x300004;
    pub const CONFIG3H: u32 = 0x300005;
    pub const DEVID1: u32 = 0x3FFFFE;
    pub const DEVID2: u32 = 0x3FFFFF;
    pub const HI_PRIO_VECTOR: u32 = 0x08;
    pub const LO_PRIO_VECTOR: u32 = 0x18;

    /// Upper 11 bits of a raw device id returned by `OP_DISCOVER`.
    pub const fn id(raw_device_id: u16) -> u16 {
        raw_device_id >> ID_SHIFT
    }

    /// Lower 5 bits of a raw device id: the silicon revision.
    pub const fn revision(raw_device_id: u16) -> u8 {
        (raw_device_id & REV_MASK) as u8
    }

    /// Look up the descriptor matching a raw device id from the wire.
    pub fn find(raw_device_id: u16) -> Result<&'static DeviceDescriptor> {
        let id = Self::id(raw_device_id);
        SUPPORTED_DEVICES
            .iter()
            .find(|d| d.dev_id == id)
            .ok_or(Error::UnknownDevice(raw_device_id))
    }

    /// Look up a descriptor by its part name, e.g. for `--device` CLI args.
    pub fn find_by_name(name: &str) -> Option<&'static DeviceDescriptor> {
        SUPPORTED_DEVICES
            .iter()
            .find(|d| d.name.eq_ignore_ascii_case(name))
    }
}

const fn kb(x: u32) -> u32 {
    x * 1024
}

pub const PIC18F66J60: u16 = 0b000_1100_0000;
pub const PIC18F86J60: u16 = 0b000_1100_0001;
pub const PIC18F96J60: u16 = 0b000_1100_0010;
pub const PIC18F66J65: u16 = 0b000_1111_1000;
pub const PIC18F86J65: u16 = 0b000_1111_1010;
pub const PIC18F96J65: u16 = 0b000_1111_1100;
pub const PIC18F67J60: u16 = 0b000_1111_1001;
pub const PIC18F87J60: u16 = 0b000_1111_1011;
pub const PIC18F97J60: u16 = 0b000_1111_1101;

/// Every device id the bootloader may report.
pub static SUPPORTED_DEVICES: &[DeviceDescriptor] = &[
    DeviceDescriptor {
        dev_id: PIC18F66J60,
        name: "PIC18F66J60",
        flash_size: kb(64),
        config_address: 0xFFF8,
        erase_size: ERASE_SIZE,
        write_size: WRITE_SIZE,
    },
    DeviceDescriptor {
        dev_id: PIC18F86J60,
        name: "PIC18F86J60",
        flash_size: kb(64),
        config_address: 0xFFF8,
        erase_size: ERASE_SIZE,
        write_size: WRITE_SIZE,
    },
    DeviceDescriptor {
        dev_id: PIC18F96J60,
        name: "PIC18F96J60",
        flash_size: kb(64),
        config_address: 0xFFF8,
        erase_size: ERASE_SIZE,
        write_size: WRITE_SIZE,
    },
    DeviceDescriptor {
        dev_id: PIC18F66J65,
        name: "PIC18F66J65",
        flash_size: kb(96),
        config_address: 0x17FF8,
        erase_size: ERASE_SIZE,
        write_size: WRITE_SIZE,
    },
    DeviceDescriptor {
        dev_id: PIC18F86J65,
        name: "PIC18F86J65",
        flash_size: kb(96),
        config_address: 0x17FF8,
        erase_size: ERASE_SIZE,
        write_size: WRITE_SIZE,
    },
    DeviceDescriptor {
        dev_id: PIC18F96J65,
        name: "PIC18F96J65",
        flash_size: kb(96),
        config_address: 0x17FF8,
        erase_size: ERASE_SIZE,
        write_size: WRITE_SIZE,
    },
    DeviceDescriptor {
        dev_id: PIC18F67J60,
        name: "PIC18F67J60",
        flash_size: kb(128),
        config_address: 0x1FFF8,
        erase_size: ERASE_SIZE,
        write_size: WRITE_SIZE,
    },
    DeviceDescriptor {
        dev_id: PIC18F87J60,
        name: "PIC18F87J60",
        flash_size: kb(128),
        config_address: 0x1FFF8,
        erase_size: ERASE_SIZE,
        write_size: WRITE_SIZE,
    },
    DeviceDescriptor {
        dev_id: PIC18F97J60,
        name: "PIC18F97J60",
        flash_size: kb(128),
        config_address: 0x1FFF8,
        erase_size: ERASE_SIZE,
        write_size: WRITE_SIZE,
    },
];

/// Returned by a successful discovery handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BootloaderInfo {
    pub device_id: u16,
    pub version: u16,
    pub bootloader_address: u32,
}
