use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};

use piclink::device::DeviceDescriptor;
use piclink::programmer::{ProgramEvent, Programmer};
use piclink::protocol::PORT;
use piclink::target::Target;

#[derive(Parser)]
#[command(name = "piclink", version, about = "Network flash programmer for PIC18F Ethernet microcontrollers")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// UDP port the bootloader listens on.
    #[arg(long, global = true, default_value_t = PORT)]
    port: u16,
}

#[derive(Subcommand)]
enum Command {
    /// Broadcast for a bootloader and print what answers.
    Discover,
    /// Assign an IP address to whichever device answers a broadcast.
    Configure {
        /// IP address to assign, e.g. 192.168.1.50
        ip: Ipv4Addr,
    },
    /// Erase and flash a firmware image onto a device.
    Program {
        /// Device's IP address.
        ip: Ipv4Addr,
        /// Path to an Intel HEX or ELF firmware image.
        file: std::path::PathBuf,
        /// Device part name, e.g. PIC18F97J60. Guessed from discovery if omitted.
        #[arg(long)]
        device: Option<String>,
    },
    /// Read a range of device memory and print it as hex.
    Read {
        ip: Ipv4Addr,
        #[arg(value_parser = parse_u32)]
        address: u32,
        length: u16,
    },
    /// Erase a single flash page.
    Erase {
        ip: Ipv4Addr,
        #[arg(value_parser = parse_u32)]
        address: u32,
    },
    /// Reset a device back into its application.
    Reset { ip: Ipv4Addr },
    /// Run an in-process simulated bootloader for local testing.
    Simulate {
        /// Device part name to simulate.
        device: String,
        /// Address to bind the simulated bootloader to.
        #[arg(long, default_value = "0.0.0.0")]
        bind: Ipv4Addr,
    },
}

fn parse_u32(s: &str) -> Result<u32, std::num::ParseIntError> {
    if let Some(hex) = s.strip_prefix("0x") {
        u32::from_str_radix(hex, 16)
    } else {
        s.parse()
    }
}

fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    match cli.command {
        Command::Discover => {
            let mut programmer = Programmer::bind(([0, 0, 0, 0], 0).into())
                .context("failed to bind a local UDP socket")?;
            let info = programmer
                .discover_device(cli.port)
                .context("no bootloader responded to discovery")?;
            let descriptor = DeviceDescriptor::find(info.device_id);
            println!("found bootloader at {}", programmer.peer().unwrap());
            match descriptor {
                Ok(d) => println!("device: {} (raw id {:#06x})", d.name, info.device_id),
                Err(_) => println!("unknown device id {:#06x}", info.device_id),
            }
            println!("bootloader version: {:#06x}", info.version);
            println!("bootloader address: {:#010x}", info.bootloader_address);
        }
        Command::Configure { ip } => {
            let mut programmer = Programmer::bind(([0, 0, 0, 0], 0).into())
                .context("failed to bind a local UDP socket")?;
            programmer
                .configure_device(u32::from(ip), cli.port)
                .context("no bootloader responded to configuration")?;
            println!("assigned {} to responding bootloader", ip);
        }
        Command::Program { ip, file, device } => {
            let image = piclink::firmware::read_firmware_from_file(&file)
                .with_context(|| format!("failed to load firmware from {}", file.display()))?;

            let mut programmer = Programmer::bind(([0, 0, 0, 0], 0).into())
                .context("failed to bind a local UDP socket")?;
            let info = programmer
                .connect_device(ip, cli.port)
                .with_context(|| format!("could not reach bootloader at {ip}"))?;

            let descriptor = match device {
                Some(name) => DeviceDescriptor::find_by_name(&name)
                    .with_context(|| format!("unknown device name {name:?}"))?,
                None => DeviceDescriptor::find(info.device_id)
                    .context("could not identify device; pass --device explicitly")?,
            };

            log::info!("image carries {} bytes of firmware", image.total_bytes());
            let bar = ProgressBar::new(descriptor.flash_size as u64 / descriptor.write_size as u64);
            bar.set_style(
                ProgressStyle::with_template("{bar:40} {pos}/{len} sectors")
                    .unwrap(),
            );

            programmer.program(&image, descriptor, |event| {
                if let ProgramEvent::Writing { .. } = event {
                    bar.inc(1);
                }
            })?;
            bar.finish();
            println!("wrote firmware to {} ({})", ip, descriptor.name);
        }
        Command::Read { ip, address, length } => {
            let mut programmer = Programmer::bind(([0, 0, 0, 0], 0).into())
                .context("failed to bind a local UDP socket")?;
            programmer
                .connect_device(ip, cli.port)
                .with_context(|| format!("could not reach bootloader at {ip}"))?;
            let data = programmer.read(address, length)?;
            println!("{}", hex::encode(&data));
        }
        Command::Erase { ip, address } => {
            let mut programmer = Programmer::bind(([0, 0, 0, 0], 0).into())
                .context("failed to bind a local UDP socket")?;
            programmer
                .connect_device(ip, cli.port)
                .with_context(|| format!("could not reach bootloader at {ip}"))?;
            programmer.erase(address)?;
            println!("erased page at {:#010x}", address);
        }
        Command::Reset { ip } => {
            let mut programmer = Programmer::bind(([0, 0, 0, 0], 0).into())
                .context("failed to bind a local UDP socket")?;
            programmer
                .connect_device(ip, cli.port)
                .with_context(|| format!("could not reach bootloader at {ip}"))?;
            programmer.reset()?;
            println!("reset {}", ip);
        }
        Command::Simulate { device, bind } => {
            let descriptor = DeviceDescriptor::find_by_name(&device)
                .with_context(|| format!("unknown device name {device:?}"))?;
            let addr = SocketAddr::new(bind.into(), cli.port);
            let mut target = Target::bind(addr, descriptor)?;
            println!("simulating {} on {}", descriptor.name, target.local_addr()?);
            loop {
                target.serve_one(Duration::from_secs(3600))?;
            }
        }
    }

    Ok(())
}

