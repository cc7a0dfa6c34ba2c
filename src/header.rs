//! Header repair after a size change.
//!
//! Shifts the optional header sizes, every populated data directory, and the
//! section table entries at and after `.data` by the splice delta.

use crate::error::Result;
use crate::pe::{
    name_bytes, name_eq, name_is_empty, optional, read_u32, section, shift_u32, ImageHeaders,
    SectionHeaderRef, EMPTY_SECTION_NAME,
};

/// Name of the section that holds the spliced table.
pub const DATA_SECTION: &str = ".data";

/// Counts of header fields rewritten by [`repair_headers`].
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct HeaderStats {
    /// Data directories whose address moved.
    pub directories: usize,
    /// Whether `.data` was found and resized.
    pub data_resized: bool,
    /// Sections after `.data` that moved.
    pub sections_moved: usize,
    /// Sections given a placeholder name.
    pub renamed: usize,
}

fn shift(buf: &mut [u8], offset: usize, delta: i32, what: &str) -> Result<()> {
    let (old, new) = shift_u32(buf, offset, delta)?;
    tracing::debug!("{what:<24} 0x{old:X} -> 0x{new:X}");
    Ok(())
}

/// Adjust header fields of `buf` by `delta`.
///
/// The `.data` section grows in place; every section that follows it in the
/// table moves. Sections before `.data` are untouched. Returns the sections
/// that moved so callers can find `.reloc` without re-reading the table.
pub fn repair_headers(
    buf: &mut [u8],
    headers: &ImageHeaders,
    delta: i32,
) -> Result<(HeaderStats, Vec<SectionHeaderRef>)> {
    let mut stats = HeaderStats::default();

    shift(
        buf,
        headers.optional_field(optional::SIZE_OF_INITIALIZED_DATA),
        delta,
        "SizeOfInitializedData",
    )?;
    shift(
        buf,
        headers.optional_field(optional::SIZE_OF_IMAGE),
        delta,
        "SizeOfImage",
    )?;

    for index in 0..headers.directory_count(buf)? {
        let offset = headers.directory_offset(index);
        if read_u32(buf, offset)? != 0 {
            shift(buf, offset, delta, "DataDirectory")?;
            stats.directories += 1;
        }
    }

    let mut moved = Vec::new();
    for header in headers.sections() {
        let name = header.name(buf)?;

        if name_eq(&name, DATA_SECTION) {
            tracing::debug!("section {DATA_SECTION}");
            shift(buf, header.field_offset(section::VIRTUAL_SIZE), delta, "PhysicalAddress")?;
            shift(buf, header.field_offset(section::SIZE_OF_RAW_DATA), delta, "SizeOfRawData")?;
            stats.data_resized = true;
        } else if stats.data_resized {
            if name_is_empty(&name) {
                header.set_name(buf, EMPTY_SECTION_NAME)?;
                stats.renamed += 1;
            }
            tracing::debug!(
                "section {}",
                String::from_utf8_lossy(name_bytes(&header.name(buf)?))
            );
            shift(buf, header.field_offset(section::VIRTUAL_ADDRESS), delta, "VirtualAddress")?;
            shift(
                buf,
                header.field_offset(section::POINTER_TO_RAW_DATA),
                delta,
                "PointerToRawData",
            )?;
            stats.sections_moved += 1;
            moved.push(header);
        }
    }

    Ok((stats, moved))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pe::{dos, file, name_str, write_u16, write_u32, DOS_MAGIC, PE32PLUS_MAGIC, PE_SIGNATURE};

    const OPT: usize = 0x98;
    const SECTIONS: usize = OPT + 240;

    fn image(names: &[&str]) -> Vec<u8> {
        let mut buf = vec![0u8; 0x400];
        write_u16(&mut buf, dos::E_MAGIC, DOS_MAGIC).unwrap();
        write_u32(&mut buf, dos::E_LFANEW, 0x80).unwrap();
        write_u32(&mut buf, 0x80, PE_SIGNATURE).unwrap();
        write_u16(&mut buf, 0x84 + file::NUMBER_OF_SECTIONS, names.len() as u16).unwrap();
        write_u16(&mut buf, 0x84 + file::SIZE_OF_OPTIONAL_HEADER, 240).unwrap();
        write_u16(&mut buf, OPT, PE32PLUS_MAGIC).unwrap();
        write_u32(&mut buf, OPT + optional::SIZE_OF_INITIALIZED_DATA, 0x800).unwrap();
        write_u32(&mut buf, OPT + optional::SIZE_OF_IMAGE, 0x1000).unwrap();
        write_u32(&mut buf, OPT + optional::NUMBER_OF_RVA_AND_SIZES, 16).unwrap();
        // Relocation directory only
        write_u32(&mut buf, OPT + optional::DATA_DIRECTORIES + 5 * 8, 0xC00).unwrap();
        write_u32(&mut buf, OPT + optional::DATA_DIRECTORIES + 5 * 8 + 4, 0x10).unwrap();

        for (i, name) in names.iter().enumerate() {
            let at = SECTIONS + i * 40;
            buf[at..at + name.len()].copy_from_slice(name.as_bytes());
            let base = 0x200 + i as u32 * 0x200;
            write_u32(&mut buf, at + section::VIRTUAL_SIZE, 0x200).unwrap();
            write_u32(&mut buf, at + section::VIRTUAL_ADDRESS, base).unwrap();
            write_u32(&mut buf, at + section::SIZE_OF_RAW_DATA, 0x200).unwrap();
            write_u32(&mut buf, at + section::POINTER_TO_RAW_DATA, base).unwrap();
        }
        buf
    }

    fn sec(buf: &[u8], i: usize, field: usize) -> u32 {
        read_u32(buf, SECTIONS + i * 40 + field).unwrap()
    }

    #[test]
    fn test_repair_shifts_fields() {
        let mut buf = image(&[".text", ".data", "", ".reloc"]);
        let headers = ImageHeaders::locate(&buf).unwrap();
        let (stats, moved) = repair_headers(&mut buf, &headers, 0x30).unwrap();

        assert_eq!(read_u32(&buf, OPT + optional::SIZE_OF_INITIALIZED_DATA).unwrap(), 0x830);
        assert_eq!(read_u32(&buf, OPT + optional::SIZE_OF_IMAGE).unwrap(), 0x1030);
        assert_eq!(read_u32(&buf, OPT + optional::DATA_DIRECTORIES + 5 * 8).unwrap(), 0xC30);
        // Directory sizes are untouched
        assert_eq!(read_u32(&buf, OPT + optional::DATA_DIRECTORIES + 5 * 8 + 4).unwrap(), 0x10);
        assert_eq!(stats.directories, 1);

        // .text precedes .data: untouched
        assert_eq!(sec(&buf, 0, section::VIRTUAL_ADDRESS), 0x200);
        assert_eq!(sec(&buf, 0, section::SIZE_OF_RAW_DATA), 0x200);

        // .data grows but does not move
        assert_eq!(sec(&buf, 1, section::VIRTUAL_SIZE), 0x230);
        assert_eq!(sec(&buf, 1, section::SIZE_OF_RAW_DATA), 0x230);
        assert_eq!(sec(&buf, 1, section::VIRTUAL_ADDRESS), 0x400);
        assert_eq!(sec(&buf, 1, section::POINTER_TO_RAW_DATA), 0x400);

        // Following sections move but keep their size
        for i in 2..4 {
            let base = 0x200 + i as u32 * 0x200;
            assert_eq!(sec(&buf, i, section::VIRTUAL_ADDRESS), base + 0x30);
            assert_eq!(sec(&buf, i, section::POINTER_TO_RAW_DATA), base + 0x30);
            assert_eq!(sec(&buf, i, section::SIZE_OF_RAW_DATA), 0x200);
        }

        assert!(stats.data_resized);
        assert_eq!(stats.sections_moved, 2);
        assert_eq!(stats.renamed, 1);
        assert_eq!(moved.len(), 2);
        assert_eq!(name_str(&moved[0].name(&buf).unwrap()), EMPTY_SECTION_NAME);
        assert_eq!(name_str(&moved[1].name(&buf).unwrap()), ".reloc");
    }

    #[test]
    fn test_non_utf8_name_is_kept() {
        let mut buf = image(&[".data", "", ".reloc"]);
        let raw = [b'.', 0xE9, b'x', b'y', 0, 0, 0, 0];
        buf[SECTIONS + 40..SECTIONS + 48].copy_from_slice(&raw);

        let headers = ImageHeaders::locate(&buf).unwrap();
        let (stats, moved) = repair_headers(&mut buf, &headers, 0x10).unwrap();

        assert_eq!(stats.renamed, 0);
        assert_eq!(stats.sections_moved, 2);
        assert_eq!(moved[0].name(&buf).unwrap(), raw);
        assert_eq!(sec(&buf, 1, section::POINTER_TO_RAW_DATA), 0x410);
    }

    #[test]
    fn test_zero_delta_is_idempotent() {
        let mut buf = image(&[".text", ".data", ".reloc"]);
        let original = buf.clone();
        let headers = ImageHeaders::locate(&buf).unwrap();
        repair_headers(&mut buf, &headers, 0).unwrap();
        repair_headers(&mut buf, &headers, 0).unwrap();
        assert_eq!(buf, original);
    }

    #[test]
    fn test_negative_delta() {
        let mut buf = image(&[".data", ".reloc"]);
        let headers = ImageHeaders::locate(&buf).unwrap();
        repair_headers(&mut buf, &headers, -0x10).unwrap();
        assert_eq!(sec(&buf, 0, section::SIZE_OF_RAW_DATA), 0x1F0);
        assert_eq!(sec(&buf, 1, section::POINTER_TO_RAW_DATA), 0x3F0);
    }

    #[test]
    fn test_no_data_section() {
        let mut buf = image(&[".text", ".reloc"]);
        let headers = ImageHeaders::locate(&buf).unwrap();
        let (stats, moved) = repair_headers(&mut buf, &headers, 0x10).unwrap();
        assert!(!stats.data_resized);
        assert!(moved.is_empty());
        assert_eq!(sec(&buf, 1, section::POINTER_TO_RAW_DATA), 0x400);
    }
}
