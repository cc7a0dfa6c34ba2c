//! PE format layout and bounds-checked field access.
//!
//! The module family handled here is a PE32+ image small enough to live in a
//! 16-bit window. Headers are never reinterpreted through pointer casts: every
//! field is read or written through an accessor that knows its offset and
//! width and checks the backing buffer first. [`ImageHeaders`] resolves where
//! each header lives; [`PeImage`] is a read-only summary built on top of it.

use crate::error::{Error, Result};

// PE format constants
pub const DOS_MAGIC: u16 = 0x5A4D; // "MZ"
pub const PE_SIGNATURE: u32 = 0x0000_4550; // "PE\0\0"
pub const PE32PLUS_MAGIC: u16 = 0x020B;

pub const DOS_HEADER_SIZE: usize = 64;
pub const FILE_HEADER_SIZE: usize = 20;
pub const SECTION_HEADER_SIZE: usize = 40;
pub const DATA_DIRECTORY_SIZE: usize = 8;
pub const MAX_DATA_DIRECTORIES: usize = 16;

/// Largest module that fits the legacy addressing window.
pub const MAX_MODULE_SIZE: usize = 0xFFFF;

/// Name given to sections whose name field is empty after repair.
pub const EMPTY_SECTION_NAME: &str = ".empty";

/// DOS header field offsets.
pub mod dos {
    pub const E_MAGIC: usize = 0x00;
    pub const E_LFANEW: usize = 0x3C;
}

/// COFF file header field offsets, relative to the file header.
pub mod file {
    pub const MACHINE: usize = 0;
    pub const NUMBER_OF_SECTIONS: usize = 2;
    pub const SIZE_OF_OPTIONAL_HEADER: usize = 16;
}

/// PE32+ optional header field offsets, relative to the optional header.
pub mod optional {
    pub const MAGIC: usize = 0;
    pub const SIZE_OF_CODE: usize = 4;
    pub const SIZE_OF_INITIALIZED_DATA: usize = 8;
    pub const BASE_OF_CODE: usize = 20;
    pub const SIZE_OF_IMAGE: usize = 56;
    pub const NUMBER_OF_RVA_AND_SIZES: usize = 108;
    pub const DATA_DIRECTORIES: usize = 112;
}

/// Section header field offsets, relative to the section header.
pub mod section {
    pub const NAME: usize = 0;
    /// `Misc.VirtualSize`, also known as `Misc.PhysicalAddress`.
    pub const VIRTUAL_SIZE: usize = 8;
    pub const VIRTUAL_ADDRESS: usize = 12;
    pub const SIZE_OF_RAW_DATA: usize = 16;
    pub const POINTER_TO_RAW_DATA: usize = 20;
}

fn field(buf: &[u8], offset: usize, width: usize) -> Result<&[u8]> {
    let end = offset.checked_add(width).ok_or(Error::HeadersTooSmall {
        expected: usize::MAX,
        actual: buf.len(),
    })?;
    buf.get(offset..end).ok_or(Error::HeadersTooSmall {
        expected: end,
        actual: buf.len(),
    })
}

fn field_mut(buf: &mut [u8], offset: usize, width: usize) -> Result<&mut [u8]> {
    let len = buf.len();
    let end = offset.checked_add(width).ok_or(Error::HeadersTooSmall {
        expected: usize::MAX,
        actual: len,
    })?;
    buf.get_mut(offset..end).ok_or(Error::HeadersTooSmall {
        expected: end,
        actual: len,
    })
}

/// Read a little-endian u16.
pub fn read_u16(buf: &[u8], offset: usize) -> Result<u16> {
    let b = field(buf, offset, 2)?;
    Ok(u16::from_le_bytes([b[0], b[1]]))
}

/// Read a little-endian u32.
pub fn read_u32(buf: &[u8], offset: usize) -> Result<u32> {
    let b = field(buf, offset, 4)?;
    Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
}

/// Write a little-endian u16.
pub fn write_u16(buf: &mut [u8], offset: usize, value: u16) -> Result<()> {
    field_mut(buf, offset, 2)?.copy_from_slice(&value.to_le_bytes());
    Ok(())
}

/// Write a little-endian u32.
pub fn write_u32(buf: &mut [u8], offset: usize, value: u32) -> Result<()> {
    field_mut(buf, offset, 4)?.copy_from_slice(&value.to_le_bytes());
    Ok(())
}

/// Add a signed delta to a u32 field in place, returning `(old, new)`.
pub fn shift_u32(buf: &mut [u8], offset: usize, delta: i32) -> Result<(u32, u32)> {
    let old = read_u32(buf, offset)?;
    let new = old.wrapping_add_signed(delta);
    write_u32(buf, offset, new)?;
    Ok((old, new))
}

/// Bytes of an 8-byte section name up to its first NUL.
pub fn name_bytes(name: &[u8; 8]) -> &[u8] {
    let end = name.iter().position(|&b| b == 0).unwrap_or(8);
    &name[..end]
}

/// Whether a raw section name equals `expected`.
pub fn name_eq(name: &[u8; 8], expected: &str) -> bool {
    name_bytes(name) == expected.as_bytes()
}

/// Whether a section name field is empty.
pub fn name_is_empty(name: &[u8; 8]) -> bool {
    name[0] == 0
}

/// Trim an 8-byte section name at its first NUL for display.
///
/// Returns `""` for names that are not UTF-8; match on [`name_eq`] instead.
pub fn name_str(name: &[u8; 8]) -> &str {
    std::str::from_utf8(name_bytes(name)).unwrap_or("")
}

/// Overlay over one 40-byte section header.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SectionHeaderRef {
    /// File offset of the header.
    pub offset: usize,
}

impl SectionHeaderRef {
    pub fn name(&self, buf: &[u8]) -> Result<[u8; 8]> {
        let mut name = [0u8; 8];
        name.copy_from_slice(field(buf, self.offset + section::NAME, 8)?);
        Ok(name)
    }

    pub fn set_name(&self, buf: &mut [u8], name: &str) -> Result<()> {
        let dst = field_mut(buf, self.offset + section::NAME, 8)?;
        dst.fill(0);
        let bytes = name.as_bytes();
        let len = bytes.len().min(8);
        dst[..len].copy_from_slice(&bytes[..len]);
        Ok(())
    }

    pub fn virtual_size(&self, buf: &[u8]) -> Result<u32> {
        read_u32(buf, self.offset + section::VIRTUAL_SIZE)
    }

    pub fn virtual_address(&self, buf: &[u8]) -> Result<u32> {
        read_u32(buf, self.offset + section::VIRTUAL_ADDRESS)
    }

    pub fn size_of_raw_data(&self, buf: &[u8]) -> Result<u32> {
        read_u32(buf, self.offset + section::SIZE_OF_RAW_DATA)
    }

    pub fn pointer_to_raw_data(&self, buf: &[u8]) -> Result<u32> {
        read_u32(buf, self.offset + section::POINTER_TO_RAW_DATA)
    }

    /// Absolute offset of a field inside this header.
    pub fn field_offset(&self, rel: usize) -> usize {
        self.offset + rel
    }
}

/// Resolved positions of the DOS, NT, optional and section headers.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ImageHeaders {
    /// Offset to PE signature (e_lfanew).
    pub pe_offset: usize,
    /// Offset of the optional header.
    pub optional_offset: usize,
    /// Size of optional header.
    pub size_of_optional_header: usize,
    /// Number of sections.
    pub number_of_sections: usize,
    /// Offset of the first section header.
    pub section_table_offset: usize,
}

impl ImageHeaders {
    /// Validate the DOS and PE signatures and resolve header positions.
    pub fn locate(buf: &[u8]) -> Result<Self> {
        if buf.len() < DOS_HEADER_SIZE {
            return Err(Error::HeadersTooSmall {
                expected: DOS_HEADER_SIZE,
                actual: buf.len(),
            });
        }

        if read_u16(buf, dos::E_MAGIC)? != DOS_MAGIC {
            return Err(Error::InvalidDosSignature(dos::E_MAGIC));
        }

        let pe_offset = read_u32(buf, dos::E_LFANEW)? as usize;
        if read_u32(buf, pe_offset)? != PE_SIGNATURE {
            return Err(Error::InvalidPeSignature(pe_offset));
        }

        let file_header = pe_offset + 4;
        let number_of_sections = read_u16(buf, file_header + file::NUMBER_OF_SECTIONS)? as usize;
        let size_of_optional_header =
            read_u16(buf, file_header + file::SIZE_OF_OPTIONAL_HEADER)? as usize;
        let optional_offset = file_header + FILE_HEADER_SIZE;

        if read_u16(buf, optional_offset + optional::MAGIC)? != PE32PLUS_MAGIC {
            return Err(Error::InvalidFile("optional header is not PE32+"));
        }

        let section_table_offset = optional_offset + size_of_optional_header;
        let section_table_end = section_table_offset + number_of_sections * SECTION_HEADER_SIZE;
        if buf.len() < section_table_end {
            return Err(Error::HeadersTooSmall {
                expected: section_table_end,
                actual: buf.len(),
            });
        }

        Ok(Self {
            pe_offset,
            optional_offset,
            size_of_optional_header,
            number_of_sections,
            section_table_offset,
        })
    }

    /// Absolute offset of an optional header field.
    pub fn optional_field(&self, rel: usize) -> usize {
        self.optional_offset + rel
    }

    pub fn machine(&self, buf: &[u8]) -> Result<u16> {
        read_u16(buf, self.pe_offset + 4 + file::MACHINE)
    }

    pub fn size_of_code(&self, buf: &[u8]) -> Result<u32> {
        read_u32(buf, self.optional_field(optional::SIZE_OF_CODE))
    }

    pub fn base_of_code(&self, buf: &[u8]) -> Result<u32> {
        read_u32(buf, self.optional_field(optional::BASE_OF_CODE))
    }

    pub fn size_of_image(&self, buf: &[u8]) -> Result<u32> {
        read_u32(buf, self.optional_field(optional::SIZE_OF_IMAGE))
    }

    pub fn size_of_initialized_data(&self, buf: &[u8]) -> Result<u32> {
        read_u32(buf, self.optional_field(optional::SIZE_OF_INITIALIZED_DATA))
    }

    /// Number of data directories present, capped at the standard 16.
    pub fn directory_count(&self, buf: &[u8]) -> Result<usize> {
        let declared = read_u32(buf, self.optional_field(optional::NUMBER_OF_RVA_AND_SIZES))?;
        let room = self
            .size_of_optional_header
            .saturating_sub(optional::DATA_DIRECTORIES)
            / DATA_DIRECTORY_SIZE;
        Ok((declared as usize).min(MAX_DATA_DIRECTORIES).min(room))
    }

    /// Absolute offset of a data directory's `VirtualAddress` field.
    pub fn directory_offset(&self, index: usize) -> usize {
        self.optional_field(optional::DATA_DIRECTORIES) + index * DATA_DIRECTORY_SIZE
    }

    /// Overlay for the section header at `index`.
    pub fn section(&self, index: usize) -> SectionHeaderRef {
        SectionHeaderRef {
            offset: self.section_table_offset + index * SECTION_HEADER_SIZE,
        }
    }

    /// Overlays for every section header, in file order.
    pub fn sections(&self) -> impl Iterator<Item = SectionHeaderRef> + '_ {
        (0..self.number_of_sections).map(move |i| self.section(i))
    }

    /// Find a section by name.
    pub fn find_section(&self, buf: &[u8], name: &str) -> Result<Option<SectionHeaderRef>> {
        for header in self.sections() {
            if name_eq(&header.name(buf)?, name) {
                return Ok(Some(header));
            }
        }
        Ok(None)
    }
}

/// One data directory entry.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DataDirectory {
    pub virtual_address: u32,
    pub size: u32,
}

/// Parsed section information.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SectionInfo {
    pub name: String,
    pub virtual_size: u32,
    pub virtual_address: u32,
    pub size_of_raw_data: u32,
    pub pointer_to_raw_data: u32,
}

impl SectionInfo {
    fn read(buf: &[u8], header: SectionHeaderRef) -> Result<Self> {
        Ok(Self {
            name: String::from_utf8_lossy(name_bytes(&header.name(buf)?)).into_owned(),
            virtual_size: header.virtual_size(buf)?,
            virtual_address: header.virtual_address(buf)?,
            size_of_raw_data: header.size_of_raw_data(buf)?,
            pointer_to_raw_data: header.pointer_to_raw_data(buf)?,
        })
    }
}

/// Read-only summary of a module's headers.
#[derive(Clone, Debug)]
pub struct PeImage {
    pub headers: ImageHeaders,
    pub machine: u16,
    pub size_of_code: u32,
    pub base_of_code: u32,
    pub size_of_initialized_data: u32,
    pub size_of_image: u32,
    pub directories: Vec<DataDirectory>,
    pub sections: Vec<SectionInfo>,
}

impl PeImage {
    /// Parse PE headers from a module buffer.
    pub fn parse(buf: &[u8]) -> Result<Self> {
        let headers = ImageHeaders::locate(buf)?;

        let directories = (0..headers.directory_count(buf)?)
            .map(|i| {
                let offset = headers.directory_offset(i);
                Ok(DataDirectory {
                    virtual_address: read_u32(buf, offset)?,
                    size: read_u32(buf, offset + 4)?,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let sections = headers
            .sections()
            .map(|h| SectionInfo::read(buf, h))
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            headers,
            machine: headers.machine(buf)?,
            size_of_code: headers.size_of_code(buf)?,
            base_of_code: headers.base_of_code(buf)?,
            size_of_initialized_data: headers.size_of_initialized_data(buf)?,
            size_of_image: headers.size_of_image(buf)?,
            directories,
            sections,
        })
    }

    /// Get a section by name.
    pub fn section(&self, name: &str) -> Option<&SectionInfo> {
        self.sections.iter().find(|s| s.name == name)
    }

    /// Align a value up to the given alignment.
    #[inline]
    pub fn align_up(value: usize, alignment: usize) -> usize {
        (value + alignment - 1) & !(alignment - 1)
    }
}
