//! piclink: a network flash programmer for PIC18F6/8/9xJ60/J65 Ethernet
//! microcontrollers. Speaks a small UDP protocol to discover a bootloader
//! on the local network, load firmware from Intel HEX or ELF, and drive
//! the erase/write sequence to flash it.

pub mod device;
pub mod error;
pub mod firmware;
pub mod image;
pub mod programmer;
pub mod protocol;
pub mod target;

pub use crate::device::{BootloaderInfo, DeviceDescriptor};
pub use crate::error::{Error, Result};
pub use crate::image::{Image, Section};
pub use crate::programmer::{ProgramEvent, Programmer};
pub use crate::target::Target;
