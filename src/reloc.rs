//! Base relocation repair.
//!
//! The module family addresses its relocated data through a fixed segment:
//! every populated block is rebased onto the 4 KiB page that contains the end
//! of the resized module, and each entry's 12-bit page offset is shifted by the
//! splice delta. An entry that wraps past the page boundary while an earlier
//! entry of the same block did not leaves the block non-monotonic; that case
//! is reported as [`Error::RelocationOverflow`] together with the padding that
//! pushes the earlier entry across the boundary as well.

use crate::error::{Error, Result};
use crate::pe::{read_u16, read_u32, write_u16, write_u32};

/// Name of the base relocation section.
pub const RELOC_SECTION: &str = ".reloc";

/// `VirtualAddress` + `SizeOfBlock`.
pub const BLOCK_HEADER_SIZE: usize = 8;

/// IMAGE_REL_BASED_DIR64.
pub const REL_BASED_DIR64: u16 = 0xA;

const PAGE_MASK: usize = 0xF000;
const OFFSET_MASK: u16 = 0x0FFF;

/// Overlay over one base relocation block.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RelocationBlock {
    /// File offset of the block header.
    pub offset: usize,
    /// Page RVA.
    pub virtual_address: u32,
    /// Declared size including the header.
    pub size_of_block: u32,
}

impl RelocationBlock {
    /// Read the block header at `offset`, rejecting sizes that cannot advance
    /// the walk or that run past the buffer.
    pub fn read(buf: &[u8], offset: usize) -> Result<Self> {
        let virtual_address = read_u32(buf, offset)?;
        let size_of_block = read_u32(buf, offset + 4)?;

        let end = offset.checked_add(size_of_block as usize);
        if (size_of_block as usize) < BLOCK_HEADER_SIZE || end.map_or(true, |e| e > buf.len()) {
            return Err(Error::InvalidRelocationBlock {
                offset,
                size: size_of_block,
            });
        }

        Ok(Self {
            offset,
            virtual_address,
            size_of_block,
        })
    }

    /// Number of 16-bit entries, padding included.
    pub fn entry_count(&self) -> usize {
        (self.size_of_block as usize - BLOCK_HEADER_SIZE) / 2
    }

    /// File offset of entry `index`.
    pub fn entry_offset(&self, index: usize) -> usize {
        self.offset + BLOCK_HEADER_SIZE + index * 2
    }

    /// Raw entries of the block.
    pub fn entries(&self, buf: &[u8]) -> Result<Vec<u16>> {
        (0..self.entry_count())
            .map(|i| read_u16(buf, self.entry_offset(i)))
            .collect()
    }

    /// Address an entry's page offset points at. Wraps on malformed bases.
    pub fn target(&self, page_offset: u16) -> u32 {
        self.virtual_address.wrapping_add(u32::from(page_offset))
    }
}

/// Split a raw entry into `(type, offset)`.
#[inline]
pub fn split_entry(entry: u16) -> (u16, u16) {
    (entry >> 12, entry & OFFSET_MASK)
}

/// Walk the block list of a relocation section.
///
/// Blocks are consumed until their summed sizes reach `virtual_size`.
pub fn walk_blocks(buf: &[u8], start: usize, virtual_size: u32) -> Result<Vec<RelocationBlock>> {
    let mut blocks = Vec::new();
    let mut cursor = start;
    let mut consumed = 0u32;

    while consumed < virtual_size {
        let block = RelocationBlock::read(buf, cursor)?;
        cursor += block.size_of_block as usize;
        consumed = consumed.saturating_add(block.size_of_block);
        blocks.push(block);
    }

    Ok(blocks)
}

/// Counts of relocation fields rewritten by [`repair_relocations`].
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RelocStats {
    /// Blocks visited.
    pub blocks: usize,
    /// Blocks whose base moved.
    pub rebased: usize,
    /// Entries rewritten.
    pub entries: usize,
}

/// Padding that carries an entry at `offset` across the next page boundary.
#[inline]
pub fn overflow_padding(offset: u16) -> u16 {
    (0x10 + (0x1000 - offset)) & 0xFF0
}

/// Rebase every block of the relocation section at `start` and shift its
/// entries by `delta`.
///
/// `new_len` is the length of the rebuilt module. On overflow the buffer is
/// left partially rewritten and must be discarded.
pub fn repair_relocations(
    buf: &mut [u8],
    start: usize,
    virtual_size: u32,
    new_len: usize,
    delta: i32,
) -> Result<RelocStats> {
    let new_base = (new_len & PAGE_MASK) as u32;
    let mut stats = RelocStats::default();

    for block in walk_blocks(buf, start, virtual_size)? {
        stats.blocks += 1;

        let old_base = block.virtual_address;
        if old_base == 0 {
            tracing::debug!("block 0x{:X}: base 0, left as is", block.offset);
            continue;
        }

        write_u32(buf, block.offset, new_base)?;
        stats.rebased += 1;
        tracing::debug!("virtual base address     0x{old_base:04X} -> 0x{new_base:04X}");

        let count = block.entry_count();
        let mut previous: Option<u16> = None;

        for index in 0..count {
            let at = block.entry_offset(index);
            let raw = read_u16(buf, at)?;
            if raw == 0 {
                continue;
            }

            let (_, offset) = split_entry(raw);
            let shifted = (offset as i32 + delta) as u16 & OFFSET_MASK;

            if let Some(prev) = previous {
                if shifted < prev && index + 1 < count {
                    let next_padding = overflow_padding(prev);
                    tracing::warn!(
                        "entry {index} of block 0x{:X} wrapped (0x{prev:03X} > 0x{shifted:03X}), need 0x{next_padding:X} more padding",
                        block.offset
                    );
                    return Err(Error::RelocationOverflow { next_padding });
                }
            }

            let entry = (REL_BASED_DIR64 << 12) | shifted;
            write_u16(buf, at, entry)?;
            stats.entries += 1;
            previous = Some(shifted);

            tracing::debug!(
                "table index {index:<12} 0x{:04X} -> 0x{:04X}",
                old_base as u64 + offset as u64,
                new_base as u64 + shifted as u64
            );
        }
    }

    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Lay out blocks back to back starting at 0x10.
    fn section(blocks: &[(u32, Vec<u16>)]) -> (Vec<u8>, u32) {
        let mut buf = vec![0u8; 0x10];
        for (base, entries) in blocks {
            buf.extend_from_slice(&base.to_le_bytes());
            let size = (BLOCK_HEADER_SIZE + entries.len() * 2) as u32;
            buf.extend_from_slice(&size.to_le_bytes());
            for e in entries {
                buf.extend_from_slice(&e.to_le_bytes());
            }
        }
        let total = (buf.len() - 0x10) as u32;
        buf.resize(buf.len() + 0x10, 0);
        (buf, total)
    }

    fn entry(buf: &[u8], block_offset: usize, index: usize) -> u16 {
        read_u16(buf, block_offset + BLOCK_HEADER_SIZE + index * 2).unwrap()
    }

    #[test]
    fn test_walk_blocks() {
        let (buf, total) = section(&[(0x1000, vec![0xA010, 0xA020]), (0x2000, vec![0xA030, 0])]);
        let blocks = walk_blocks(&buf, 0x10, total).unwrap();
        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks[0].offset, 0x10);
        assert_eq!(blocks[1].offset, 0x1C);
        assert_eq!(blocks[1].virtual_address, 0x2000);
        assert_eq!(blocks[1].entries(&buf).unwrap(), vec![0xA030, 0]);
    }

    #[test]
    fn test_target_wraps() {
        let block = RelocationBlock {
            offset: 0,
            virtual_address: 0x3000,
            size_of_block: 0x0C,
        };
        assert_eq!(block.target(0x123), 0x3123);

        let block = RelocationBlock {
            virtual_address: u32::MAX - 0x10,
            ..block
        };
        assert_eq!(block.target(0x20), 0x0F);
    }

    #[test]
    fn test_rebase_and_shift() {
        let (mut buf, total) = section(&[(0x3000, vec![0xA100, 0xA200, 0x0000])]);
        let stats = repair_relocations(&mut buf, 0x10, total, 0x4A50, 0x20).unwrap();

        assert_eq!(read_u32(&buf, 0x10).unwrap(), 0x4000);
        assert_eq!(entry(&buf, 0x10, 0), 0xA120);
        assert_eq!(entry(&buf, 0x10, 1), 0xA220);
        // Padding stays zero
        assert_eq!(entry(&buf, 0x10, 2), 0);
        assert_eq!(stats, RelocStats { blocks: 1, rebased: 1, entries: 2 });
    }

    #[test]
    fn test_zero_base_block_untouched() {
        let (mut buf, total) = section(&[(0, vec![0x3100, 0x3200])]);
        let before = buf.clone();
        let stats = repair_relocations(&mut buf, 0x10, total, 0x5000, 0x40).unwrap();
        assert_eq!(buf, before);
        assert_eq!(stats.rebased, 0);
    }

    #[test]
    fn test_type_is_forced_to_dir64() {
        let (mut buf, total) = section(&[(0x1000, vec![0x3100, 0])]);
        repair_relocations(&mut buf, 0x10, total, 0x2000, 0x10).unwrap();
        assert_eq!(entry(&buf, 0x10, 0), 0xA110);
    }

    #[test]
    fn test_split_block_overflows() {
        // 0xF00 stays in page, 0xFFE wraps to 0x00E
        let (mut buf, total) = section(&[(0x1000, vec![0xAF00, 0xAFFE, 0x0000])]);
        let err = repair_relocations(&mut buf, 0x10, total, 0x2000, 0x10).unwrap_err();
        assert!(matches!(
            err,
            Error::RelocationOverflow { next_padding: 0x100 }
        ));
        assert_eq!(overflow_padding(0xF10), 0x100);
    }

    #[test]
    fn test_overflow_padding_resolves_split() {
        // Retrying with the suggested padding carries both entries across
        let (mut buf, total) = section(&[(0x1000, vec![0xAF00, 0xAFFE, 0x0000])]);
        repair_relocations(&mut buf, 0x10, total, 0x2000, 0x110).unwrap();
        assert_eq!(entry(&buf, 0x10, 0), 0xA010);
        assert_eq!(entry(&buf, 0x10, 1), 0xA10E);
    }

    #[test]
    fn test_lone_wrapping_entry_is_consistent() {
        let (mut buf, total) = section(&[(0x1000, vec![0xAFFE, 0x0000])]);
        repair_relocations(&mut buf, 0x10, total, 0x2000, 0x10).unwrap();
        assert_eq!(entry(&buf, 0x10, 0), 0xA00E);
    }

    #[test]
    fn test_last_slot_is_exempt() {
        let (mut buf, total) = section(&[(0x1000, vec![0xAF00, 0xAFFE])]);
        repair_relocations(&mut buf, 0x10, total, 0x2000, 0x10).unwrap();
        assert_eq!(entry(&buf, 0x10, 1), 0xA00E);
    }

    #[test]
    fn test_rewritten_offsets_stay_in_page() {
        let (mut buf, total) = section(&[(0x1000, vec![0xA001, 0xA7FF, 0xAFF0, 0])]);
        repair_relocations(&mut buf, 0x10, total, 0x2000, -0x1).unwrap();
        for (i, expected) in [0xA000, 0xA7FE, 0xAFEF].into_iter().enumerate() {
            let value = entry(&buf, 0x10, i);
            assert_eq!(value, expected);
            assert_ne!(value, 0);
            assert!(split_entry(value).1 <= 0xFFF);
        }
    }

    #[test]
    fn test_invalid_block_size() {
        let mut buf = vec![0u8; 0x20];
        buf[0..4].copy_from_slice(&0x1000u32.to_le_bytes());
        buf[4..8].copy_from_slice(&4u32.to_le_bytes());
        assert!(matches!(
            repair_relocations(&mut buf, 0, 0x10, 0x2000, 0x10),
            Err(Error::InvalidRelocationBlock { offset: 0, size: 4 })
        ));

        buf[4..8].copy_from_slice(&0x40u32.to_le_bytes());
        assert!(matches!(
            walk_blocks(&buf, 0, 0x10),
            Err(Error::InvalidRelocationBlock { offset: 0, size: 0x40 })
        ));
    }
}
