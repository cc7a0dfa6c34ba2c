//! Pointer literal scanning in machine code.
//!
//! The relocation table does not cover every pointer in the module: RIP-relative
//! and absolute references into the data region are baked into instructions.
//! This module decodes the code span as x86-64, picks out instructions whose
//! memory operand displacement looks like a data pointer, and shifts the
//! 16-bit literal in place. Instruction lengths never change.

use crate::error::{Error, Result};

use iced_x86::{Decoder, DecoderOptions, Instruction, OpKind, Register};

/// Offset of the patched literal from the start of a matching instruction.
///
/// Matches `REX + opcode + ModRM` followed by a disp32.
pub const LITERAL_OFFSET: usize = 3;

/// Configuration for the literal scanner.
#[derive(Clone, Debug)]
pub struct ScannerConfig {
    /// Displacements must be strictly greater than this.
    pub min_disp: i64,
    /// Displacements must be strictly less than this.
    pub max_disp: i64,
    /// Decoder bitness.
    pub bitness: u32,
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            min_disp: 0x900,  // Skip stack and frame offsets
            max_disp: 0xF000, // Stay inside the 16-bit window
            bitness: 64,
        }
    }
}

/// A matched instruction and the literal rewritten for it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LiteralHit {
    /// Offset of the instruction within the scanned span.
    pub offset: usize,
    /// Length of the instruction.
    pub len: usize,
    /// Raw displacement that triggered the match.
    pub displacement: i64,
    /// Literal before patching.
    pub old_value: u16,
    /// Literal after patching.
    pub new_value: u16,
}

/// Outcome of one scan.
#[derive(Clone, Debug, Default)]
pub struct ScanReport {
    /// Instructions decoded before the first invalid one.
    pub decoded: usize,
    /// Literals rewritten.
    pub hits: Vec<LiteralHit>,
    /// Matches whose literal would fall outside the span.
    pub skipped: usize,
}

impl ScanReport {
    /// Number of patched literals.
    pub fn patched(&self) -> usize {
        self.hits.len()
    }
}

/// Displacement-window scanner over a code span.
pub struct LiteralScanner {
    config: ScannerConfig,
}

impl LiteralScanner {
    /// Create a new scanner with the given configuration.
    pub fn new(config: ScannerConfig) -> Self {
        Self { config }
    }

    /// The raw encoded displacement of an instruction's memory operand, if any.
    ///
    /// The decoder reports RIP-relative operands as an absolute target, so the
    /// next IP is subtracted back out.
    pub fn memory_displacement(instr: &Instruction) -> Option<i64> {
        let has_memory = (0..instr.op_count()).any(|i| instr.op_kind(i) == OpKind::Memory);
        if !has_memory {
            return None;
        }

        let disp = instr.memory_displacement64();
        let raw = match instr.memory_base() {
            Register::RIP | Register::EIP => disp.wrapping_sub(instr.next_ip()),
            _ => disp,
        };
        Some(raw as i64)
    }

    fn in_window(&self, disp: i64) -> bool {
        disp > self.config.min_disp && disp < self.config.max_disp
    }

    /// Decode `code` once and collect the offsets of matching instructions.
    ///
    /// Decoding stops at the first invalid instruction.
    pub fn find_matches(&self, code: &[u8]) -> Result<(usize, Vec<(usize, usize, i64)>)> {
        let mut decoder =
            Decoder::try_with_ip(self.config.bitness, code, 0, DecoderOptions::NONE).map_err(
                |_| Error::DecodeFailed {
                    offset: 0,
                    len: code.len(),
                },
            )?;
        let mut instr = Instruction::default();
        let mut decoded = 0usize;
        let mut matches = Vec::new();

        while decoder.can_decode() {
            decoder.decode_out(&mut instr);
            if instr.is_invalid() {
                break;
            }
            decoded += 1;

            if let Some(disp) = Self::memory_displacement(&instr) {
                if self.in_window(disp) {
                    matches.push((instr.ip() as usize, instr.len(), disp));
                }
            }
        }

        if decoded == 0 {
            return Err(Error::Empty);
        }

        Ok((decoded, matches))
    }

    /// Scan `code` and add `delta` to every matched literal in place.
    pub fn patch(&self, code: &mut [u8], delta: i32) -> Result<ScanReport> {
        let (decoded, matches) = self.find_matches(code)?;
        let mut report = ScanReport {
            decoded,
            ..Default::default()
        };

        for (offset, len, displacement) in matches {
            let at = offset + LITERAL_OFFSET;
            let Some(slot) = code.get_mut(at..at + 2) else {
                report.skipped += 1;
                continue;
            };

            let old_value = u16::from_le_bytes([slot[0], slot[1]]);
            let new_value = old_value.wrapping_add(delta as u16);
            slot.copy_from_slice(&new_value.to_le_bytes());

            tracing::debug!(
                offset = format_args!("0x{offset:X}"),
                disp = format_args!("0x{displacement:X}"),
                "literal 0x{old_value:04X} -> 0x{new_value:04X}"
            );

            report.hits.push(LiteralHit {
                offset,
                len,
                displacement,
                old_value,
                new_value,
            });
        }

        Ok(report)
    }
}

impl Default for LiteralScanner {
    fn default() -> Self {
        Self::new(ScannerConfig::default())
    }
}
