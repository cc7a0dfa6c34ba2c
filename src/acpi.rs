//! ACPI table location inside a module buffer.

use crate::error::{Error, Result};
use crate::pe::{read_u16, DOS_MAGIC, MAX_MODULE_SIZE};

/// Signature of the Differentiated System Description Table.
pub const DSDT_SIGNATURE: [u8; 4] = *b"DSDT";

/// Offset of the length field from the start of a table.
pub const LENGTH_FIELD_OFFSET: usize = 4;

/// A located table: a position and length into a module buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AcpiTable {
    pub signature: [u8; 4],
    /// Offset of the signature within the module.
    pub offset: usize,
    /// Declared table length.
    pub length: usize,
}

impl AcpiTable {
    /// Byte range of the table within the module.
    pub fn range(&self) -> std::ops::Range<usize> {
        self.offset..self.offset + self.length
    }

    /// Borrow the table body out of the module it was located in.
    pub fn bytes<'a>(&self, module: &'a [u8]) -> Option<&'a [u8]> {
        module.get(self.offset..self.offset.checked_add(self.length)?)
    }
}

/// Read the declared length of a table starting at `offset`.
///
/// Only the two bytes at +4 and +5 are consulted, so lengths above 0xFFFF
/// are truncated to their low 16 bits.
pub fn declared_length(buf: &[u8], offset: usize) -> Result<usize> {
    read_u16(buf, offset + LENGTH_FIELD_OFFSET)
        .map(usize::from)
        .map_err(|_| Error::InvalidLength {
            offset,
            length: LENGTH_FIELD_OFFSET + 2,
            available: buf.len().saturating_sub(offset),
        })
}

/// Locate the first table carrying `signature` in a module.
pub fn locate_table(module: &[u8], signature: &[u8; 4]) -> Result<AcpiTable> {
    if module.is_empty() {
        return Err(Error::InvalidFile("module is empty"));
    }

    if module.len() > MAX_MODULE_SIZE {
        return Err(Error::FileTooLarge {
            size: module.len(),
            limit: MAX_MODULE_SIZE,
        });
    }

    if read_u16(module, 0).ok() != Some(DOS_MAGIC) {
        return Err(Error::InvalidFile("module does not start with an MZ header"));
    }

    let offset = module
        .windows(signature.len())
        .position(|w| w == signature)
        .ok_or_else(|| Error::NotFound(String::from_utf8_lossy(signature).into_owned()))?;

    let length = declared_length(module, offset)?;
    let available = module.len() - offset;
    if length > available {
        return Err(Error::InvalidLength {
            offset,
            length,
            available,
        });
    }

    tracing::debug!(offset = format_args!("0x{offset:X}"), length = format_args!("0x{length:X}"), "located table");

    Ok(AcpiTable {
        signature: *signature,
        offset,
        length,
    })
}

/// Locate a table and return its bytes.
pub fn extract_table<'a>(module: &'a [u8], signature: &[u8; 4]) -> Result<&'a [u8]> {
    let table = locate_table(module, signature)?;
    table.bytes(module).ok_or(Error::InvalidLength {
        offset: table.offset,
        length: table.length,
        available: module.len().saturating_sub(table.offset),
    })
}
