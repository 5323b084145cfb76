//! Firmware file format loaders: Intel HEX and ELF32, both converging on
//! the [`Image`] address-keyed memory model.

use std::path::Path;
use std::str;

use object::{
    elf::{FileHeader32, SHT_NOBITS, SHT_PROGBITS, SHF_ALLOC, PT_LOAD},
    read::elf::{ElfFile, FileHeader, ProgramHeader, SectionHeader},
    Endianness, Object, ObjectSection,
};

use crate::error::{Error, Result};
use crate::image::Image;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FirmwareFormat {
    IntelHex,
    ELF,
}

/// Read a firmware file, sniffing its format from extension and contents.
pub fn read_firmware_from_file<P: AsRef<Path>>(path: P) -> Result<Image> {
    let p = path.as_ref();
    let raw = std::fs::read(p)?;

    let format = guess_format(p, &raw)?;
    log::info!("reading {} as {:?}", p.display(), format);
    match format {
        FirmwareFormat::IntelHex => {
            let text = str::from_utf8(&raw)
                .map_err(|e| Error::Format(format!("firmware is not valid UTF-8: {e}")))?;
            read_ihex(text)
        }
        FirmwareFormat::ELF => read_elf(&raw),
    }
}

fn guess_format(path: &Path, raw: &[u8]) -> Result<FirmwareFormat> {
    let ext = path
        .extension()
        .map(|s| s.to_string_lossy())
        .unwrap_or_default()
        .to_lowercase();
    if ["ihex", "ihe", "h86", "hex", "a43", "a90"].contains(&&*ext) {
        return Ok(FirmwareFormat::IntelHex);
    }

    if raw.starts_with(&[0x7f, b'E', b'L', b'F']) {
        return Ok(FirmwareFormat::ELF);
    }

    if raw.first() == Some(&b':') {
        return Ok(FirmwareFormat::IntelHex);
    }

    Err(Error::Format(format!(
        "could not determine firmware format for {}",
        path.display()
    )))
}

/// Parse an Intel HEX text image into an [`Image`].
///
/// Handles data records plus extended segment/linear address records; start
/// records are accepted and ignored, since the bootloader has no notion of
/// an entry point separate from the reset vector already in flash.
pub fn read_ihex(data: &str) -> Result<Image> {
    use ihex::Record::*;

    let mut base_address: u32 = 0;
    let mut image = Image::new();

    for record in ihex::Reader::new(data) {
        let record = record.map_err(|e| Error::Format(format!("invalid Intel HEX record: {e}")))?;
        match record {
            Data { offset, value } => {
                let address = base_address + offset as u32;
                image.add(address, &value)?;
            }
            ExtendedSegmentAddress(address) => {
                base_address = (address as u32) * 16;
            }
            ExtendedLinearAddress(address) => {
                base_address = (address as u32) << 16;
            }
            StartSegmentAddress { .. } => (),
            StartLinearAddress(_) => (),
            EndOfFile => break,
        }
    }

    Ok(image)
}

/// Parse an ELF32 image, extracting `PT_LOAD` segments at their physical
/// address the way `objcopy -O binary` would.
pub fn read_elf(elf_data: &[u8]) -> Result<Image> {
    let file_kind = object::FileKind::parse(elf_data)
        .map_err(|e| Error::Format(format!("not a recognizable object file: {e}")))?;
    if file_kind != object::FileKind::Elf32 {
        return Err(Error::Format("firmware is not a 32-bit ELF file".into()));
    }

    let elf_header = FileHeader32::<Endianness>::parse(elf_data)
        .map_err(|e| Error::Format(format!("invalid ELF header: {e}")))?;
    let endian = elf_header
        .endian()
        .map_err(|e| Error::Format(format!("invalid ELF endianness: {e}")))?;
    require_lsb_current(&elf_header, endian)?;

    let binary = ElfFile::<FileHeader32<Endianness>>::parse(elf_data)
        .map_err(|e| Error::Format(format!("could not parse ELF sections: {e}")))?;

    let mut image = Image::new();
    let mut loaded_any = false;

    for segment in elf_header
        .program_headers(endian, elf_data)
        .map_err(|e| Error::Format(format!("invalid ELF program headers: {e}")))?
    {
        if segment.p_type(endian) != PT_LOAD {
            continue;
        }

        let p_paddr: u64 = segment.p_paddr(endian).into();
        let p_memsz: u64 = segment.p_memsz(endian).into();
        let (segment_offset, segment_filesize) = segment.file_range(endian);

        if segment_filesize == 0 {
            continue;
        }
        if segment_filesize > p_memsz {
            return Err(Error::Format(
                "ELF program header has filesz greater than memsz".into(),
            ));
        }
        if (segment_offset as usize) + (segment_filesize as usize) > elf_data.len() {
            return Err(Error::Format(
                "ELF program header points past end of file".into(),
            ));
        }

        let segment_data = segment
            .data(endian, elf_data)
            .map_err(|_| Error::Format("failed to read ELF segment data".into()))?;

        log::debug!(
            "loadable segment: physical address {:#010x}, {} bytes in file, {} bytes in memory",
            p_paddr,
            segment_data.len(),
            p_memsz,
        );

        // Reserve the full memory footprint and stream only the bytes the
        // file actually carries into its front; any tail beyond filesz
        // (e.g. a segment's zero-initialized data) stays idle-filled.
        let dest = image.reserve(p_paddr as u32, p_memsz as usize)?;
        dest[..segment_data.len()].copy_from_slice(segment_data);
        loaded_any = true;
    }

    if !loaded_any {
        return Err(Error::Format("ELF file has no PT_LOAD segments".into()));
    }

    validate_section_headers(&elf_header, endian, elf_data)?;

    for section in binary.sections() {
        if let Ok(name) = section.name() {
            log::trace!("section {name} present in source ELF (informational only)");
        }
    }

    Ok(image)
}

/// Alternate loading path: build the image from `SHT_PROGBITS` /
/// `SHF_ALLOC` sections instead of `PT_LOAD` segments. Used for firmware
/// whose linker script drops program headers but still carries a
/// conventional section layout.
pub fn read_elf_by_sections(elf_data: &[u8]) -> Result<Image> {
    let file_kind = object::FileKind::parse(elf_data)
        .map_err(|e| Error::Format(format!("not a recognizable object file: {e}")))?;
    if file_kind != object::FileKind::Elf32 {
        return Err(Error::Format("firmware is not a 32-bit ELF file".into()));
    }

    let elf_header = FileHeader32::<Endianness>::parse(elf_data)
        .map_err(|e| Error::Format(format!("invalid ELF header: {e}")))?;
    let endian = elf_header
        .endian()
        .map_err(|e| Error::Format(format!("invalid ELF endianness: {e}")))?;
    require_lsb_current(&elf_header, endian)?;

    validate_section_headers(&elf_header, endian, elf_data)?;

    let mut image = Image::new();
    let mut loaded_any = false;

    for section in elf_header
        .sections(endian, elf_data)
        .map_err(|e| Error::Format(format!("invalid ELF section headers: {e}")))?
        .iter()
    {
        if section.sh_type(endian) != SHT_PROGBITS {
            continue;
        }
        if section.sh_flags(endian) & SHF_ALLOC == 0 {
            continue;
        }

        let vaddr: u64 = section.sh_addr(endian).into();
        let size: u64 = section.sh_size(endian).into();
        if size == 0 {
            continue;
        }

        let data = section
            .data(endian, elf_data)
            .map_err(|_| Error::Format("failed to read ELF section data".into()))?;

        log::debug!(
            "allocated PROGBITS section: virtual address {:#010x}, {} bytes",
            vaddr,
            data.len()
        );

        image.add(vaddr as u32, data)?;
        loaded_any = true;
    }

    if !loaded_any {
        return Err(Error::Format(
            "ELF file has no allocated PROGBITS sections".into(),
        ));
    }

    Ok(image)
}

/// Rejects anything but `ELFCLASS32` / `ELFDATA2LSB` / `EV_CURRENT`. The
/// class is already pinned by parsing with `FileHeader32`; endianness and
/// version still need an explicit check since `object` happily parses
/// big-endian or mismatched-version ELF32 headers.
fn require_lsb_current(elf_header: &FileHeader32<Endianness>, endian: Endianness) -> Result<()> {
    if !matches!(endian, Endianness::Little) {
        return Err(Error::Format(
            "only little-endian (ELFDATA2LSB) ELF firmware is supported".into(),
        ));
    }
    if elf_header.e_version(endian) != object::elf::EV_CURRENT as u32 {
        return Err(Error::Format(
            "ELF header e_version is not EV_CURRENT".into(),
        ));
    }
    Ok(())
}

/// Every section header's `offset + size` must fit the file, except
/// `SHT_NOBITS` sections (e.g. `.bss`), which carry no file content.
fn validate_section_headers(
    elf_header: &FileHeader32<Endianness>,
    endian: Endianness,
    elf_data: &[u8],
) -> Result<()> {
    let sections = elf_header
        .sections(endian, elf_data)
        .map_err(|e| Error::Format(format!("invalid ELF section headers: {e}")))?;
    for section in sections.iter() {
        if section.sh_type(endian) == SHT_NOBITS {
            continue;
        }
        let offset: u64 = section.sh_offset(endian).into();
        let size: u64 = section.sh_size(endian).into();
        if offset + size > elf_data.len() as u64 {
            return Err(Error::Format(
                "ELF section header points past end of file".into(),
            ));
        }
    }
    Ok(())
}

/// Read the raw bytes of a named ELF section, independent of program
/// headers. Used to pull out e.g. `.config` regions that a linker script
/// places outside any `PT_LOAD` segment.
pub fn section_data<'a>(elf_data: &'a [u8], name: &str) -> Result<&'a [u8]> {
    let binary = ElfFile::<FileHeader32<Endianness>>::parse(elf_data)
        .map_err(|e| Error::Format(format!("could not parse ELF sections: {e}")))?;

    binary
        .sections()
        .find(|s| s.name().map(|n| n == name).unwrap_or(false))
        .ok_or_else(|| Error::Format(format!("no section named {name:?}")))?
        .data()
        .map_err(|e| Error::Format(format!("could not read section {name:?}: {e}")))
}
