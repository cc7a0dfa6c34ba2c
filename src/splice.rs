//! Table splicing.
//!
//! This module ties the pieces together: it replaces the table bytes inside a
//! module, pads the result to a 16-byte boundary, and runs header, relocation
//! and code repair over the rebuilt buffer. A relocation overflow is retried
//! internally with more carry padding, up to [`SpliceConfig::max_attempts`].

use crate::acpi::{declared_length, locate_table, DSDT_SIGNATURE};
use crate::error::{Error, Result};
use crate::header::{repair_headers, HeaderStats};
use crate::pe::{name_eq, ImageHeaders, PeImage, MAX_MODULE_SIZE};
use crate::reloc::{repair_relocations, RelocStats, RELOC_SECTION};
use crate::scanner::{LiteralScanner, ScanReport, ScannerConfig};

/// Alignment of the rebuilt module length.
pub const MODULE_ALIGNMENT: usize = 0x10;

/// Marker of a module layout the engine cannot patch.
pub const UNPATCHABLE_SECTION: &[u8] = b".ROM";

/// Progress stage during a splice.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProgressStage {
    Validating,
    Building,
    PatchingHeaders,
    PatchingRelocations,
    PatchingCode,
    Retrying,
    Complete,
}

impl ProgressStage {
    /// Get a human-readable name for the stage.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Validating => "Validating input",
            Self::Building => "Building module",
            Self::PatchingHeaders => "Patching headers",
            Self::PatchingRelocations => "Patching relocations",
            Self::PatchingCode => "Patching code",
            Self::Retrying => "Retrying with more padding",
            Self::Complete => "Complete",
        }
    }
}

/// Progress information during a splice.
#[derive(Clone, Debug)]
pub struct ProgressInfo {
    /// Current stage.
    pub stage: ProgressStage,
    /// Attempt number, starting at 1.
    pub attempt: usize,
    /// Size delta of the current attempt.
    pub delta: i32,
    /// Carry padding of the current attempt.
    pub carry_padding: u16,
    /// Literals patched so far.
    pub patched: usize,
}

/// Progress callback type.
pub type ProgressCallback = Box<dyn Fn(&ProgressInfo) + Send + Sync>;

/// Configuration for the splice operation.
pub struct SpliceConfig {
    /// Signature of the table being replaced.
    pub signature: [u8; 4],
    /// Byte pattern whose presence makes a module unpatchable.
    pub unpatchable_marker: Vec<u8>,
    /// Upper bound on overflow retries.
    pub max_attempts: usize,
    /// Literal scanner configuration.
    pub scanner: ScannerConfig,
    /// Fail when the code pass patches nothing.
    pub require_code_patch: bool,
    /// Progress callback.
    pub progress_callback: Option<ProgressCallback>,
}

impl std::fmt::Debug for SpliceConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpliceConfig")
            .field("signature", &String::from_utf8_lossy(&self.signature))
            .field("unpatchable_marker", &String::from_utf8_lossy(&self.unpatchable_marker))
            .field("max_attempts", &self.max_attempts)
            .field("scanner", &self.scanner)
            .field("require_code_patch", &self.require_code_patch)
            .field("progress_callback", &self.progress_callback.is_some())
            .finish()
    }
}

impl Default for SpliceConfig {
    fn default() -> Self {
        Self {
            signature: DSDT_SIGNATURE,
            unpatchable_marker: UNPATCHABLE_SECTION.to_vec(),
            max_attempts: 8,
            scanner: ScannerConfig::default(),
            require_code_patch: true,
            progress_callback: None,
        }
    }
}

impl SpliceConfig {
    /// Default configuration for a table with another signature.
    pub fn with_signature(signature: [u8; 4]) -> Self {
        Self {
            signature,
            ..Default::default()
        }
    }
}

/// Size arithmetic of one splice attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SizeDelta {
    /// New table length minus old table length.
    pub raw: i32,
    /// Zero bytes that round the new length up to [`MODULE_ALIGNMENT`].
    pub padding: u16,
    /// Extra zero bytes carried over from a previous overflow.
    pub carry_padding: u16,
}

impl SizeDelta {
    /// Compute the delta for replacing `old_table_len` bytes of an
    /// `old_len`-byte module with `new_table_len` bytes.
    pub fn compute(old_len: usize, old_table_len: usize, new_table_len: usize, carry_padding: u16) -> Self {
        let raw = new_table_len as i32 - old_table_len as i32;
        let unpadded = (old_len as i64 + raw as i64).max(0) as usize;
        let padding = (PeImage::align_up(unpadded, MODULE_ALIGNMENT) - unpadded) as u16;
        Self {
            raw,
            padding,
            carry_padding,
        }
    }

    /// Zero bytes inserted after the table.
    pub fn fill(&self) -> usize {
        self.padding as usize + self.carry_padding as usize
    }

    /// Total shift applied to everything after the table.
    pub fn total(&self) -> i32 {
        self.raw + self.fill() as i32
    }
}

/// Result of a successful splice.
#[derive(Clone, Debug)]
pub struct SpliceOutcome {
    /// The rebuilt module.
    pub module: Vec<u8>,
    /// Size arithmetic of the successful attempt.
    pub delta: SizeDelta,
    /// Attempts made, including the successful one.
    pub attempts: usize,
    /// Header fields rewritten.
    pub headers: HeaderStats,
    /// Relocation fields rewritten, if the module has a `.reloc` section.
    pub relocations: Option<RelocStats>,
    /// Code literals rewritten.
    pub scan: ScanReport,
}

/// Table splicer.
pub struct Splicer {
    config: SpliceConfig,
}

impl Splicer {
    /// Create a splicer with the given configuration.
    pub fn new(config: SpliceConfig) -> Self {
        Self { config }
    }

    /// The active configuration.
    pub fn config(&self) -> &SpliceConfig {
        &self.config
    }

    fn report(&self, stage: ProgressStage, attempt: usize, delta: &SizeDelta, patched: usize) {
        if let Some(ref cb) = self.config.progress_callback {
            cb(&ProgressInfo {
                stage,
                attempt,
                delta: delta.total(),
                carry_padding: delta.carry_padding,
                patched,
            });
        }
    }

    /// Check the replacement table and return its declared length.
    fn validate_table(&self, new_table: &[u8]) -> Result<usize> {
        if !new_table.starts_with(&self.config.signature) {
            return Err(Error::InvalidFile("replacement table has an invalid header"));
        }

        let declared = declared_length(new_table, 0)?;
        if declared != new_table.len() {
            return Err(Error::SizeMismatch {
                declared,
                actual: new_table.len(),
            });
        }
        Ok(declared)
    }

    fn validate_module(&self, old_module: &[u8], old_offset: usize, old_len: usize) -> Result<ImageHeaders> {
        if old_module.len() > MAX_MODULE_SIZE {
            return Err(Error::FileTooLarge {
                size: old_module.len(),
                limit: MAX_MODULE_SIZE,
            });
        }

        let marker = &self.config.unpatchable_marker;
        if !marker.is_empty() && old_module.windows(marker.len()).any(|w| w == marker.as_slice()) {
            return Err(Error::UnsupportedSection(
                String::from_utf8_lossy(marker).into_owned(),
            ));
        }

        let headers = ImageHeaders::locate(old_module)?;

        let end = old_offset.checked_add(old_len).filter(|&e| e <= old_module.len());
        if end.is_none() {
            return Err(Error::InvalidLength {
                offset: old_offset,
                length: old_len,
                available: old_module.len().saturating_sub(old_offset),
            });
        }

        let header_end = headers.section(headers.number_of_sections).offset;
        if old_offset < header_end {
            return Err(Error::InvalidFile("table overlaps the image headers"));
        }

        Ok(headers)
    }

    /// Run a single splice attempt.
    ///
    /// Replaces `old_len` bytes at `old_offset` with `new_table`, inserting
    /// `carry_padding` extra zero bytes. A [`Error::RelocationOverflow`] carries
    /// the padding to add before retrying.
    pub fn splice(
        &self,
        old_module: &[u8],
        old_offset: usize,
        old_len: usize,
        new_table: &[u8],
        carry_padding: u16,
    ) -> Result<SpliceOutcome> {
        self.splice_attempt(old_module, old_offset, old_len, new_table, carry_padding, 1)
    }

    fn splice_attempt(
        &self,
        old_module: &[u8],
        old_offset: usize,
        old_len: usize,
        new_table: &[u8],
        carry_padding: u16,
        attempt: usize,
    ) -> Result<SpliceOutcome> {
        let new_len = self.validate_table(new_table)?;
        let headers = self.validate_module(old_module, old_offset, old_len)?;

        let delta = SizeDelta::compute(old_module.len(), old_len, new_len, carry_padding);
        self.report(ProgressStage::Validating, attempt, &delta, 0);

        let final_len = old_module.len() as i64 + delta.total() as i64;
        if final_len > MAX_MODULE_SIZE as i64 {
            return Err(Error::BufferTooSmall {
                size: final_len as usize,
                limit: MAX_MODULE_SIZE,
            });
        }

        // Copy data till the table, the new table, the padding, then the rest
        self.report(ProgressStage::Building, attempt, &delta, 0);
        let mut module = Vec::with_capacity(final_len as usize);
        module.extend_from_slice(&old_module[..old_offset]);
        module.extend_from_slice(new_table);
        module.resize(module.len() + delta.fill(), 0);
        module.extend_from_slice(&old_module[old_offset + old_len..]);
        debug_assert_eq!(module.len() as i64, final_len);

        tracing::info!(
            "splicing 0x{:X} bytes at 0x{:X} over 0x{:X} (delta 0x{:X}, padding 0x{:X}, carry 0x{:X})",
            new_len,
            old_offset,
            old_len,
            delta.total(),
            delta.padding,
            delta.carry_padding
        );

        self.report(ProgressStage::PatchingHeaders, attempt, &delta, 0);
        let (header_stats, moved) = repair_headers(&mut module, &headers, delta.total())?;

        // Only a relocation section that sits after the table moves with it
        self.report(ProgressStage::PatchingRelocations, attempt, &delta, 0);
        let mut relocations = None;
        for section in moved {
            if !name_eq(&section.name(&module)?, RELOC_SECTION) {
                continue;
            }
            let start = section.pointer_to_raw_data(&module)? as usize;
            let virtual_size = section.virtual_size(&module)?;
            let module_len = module.len();
            relocations = Some(repair_relocations(
                &mut module,
                start,
                virtual_size,
                module_len,
                delta.total(),
            )?);
            break;
        }
        if relocations.is_none() {
            tracing::debug!("no {RELOC_SECTION} section after the table");
        }

        self.report(ProgressStage::PatchingCode, attempt, &delta, 0);
        let scan = self.patch_code(&mut module, &headers, delta.total())?;

        tracing::info!(
            "patched {} header fields, {} relocations, {} code literals",
            header_stats.directories + header_stats.sections_moved + 2,
            relocations.as_ref().map_or(0, |r| r.entries),
            scan.patched()
        );

        self.report(ProgressStage::Complete, attempt, &delta, scan.patched());
        Ok(SpliceOutcome {
            module,
            delta,
            attempts: attempt,
            headers: header_stats,
            relocations,
            scan,
        })
    }

    /// Shift pointer literals in the code span of `module`.
    fn patch_code(&self, module: &mut [u8], headers: &ImageHeaders, delta: i32) -> Result<ScanReport> {
        let base = headers.base_of_code(module)? as usize;
        let size = headers.size_of_code(module)? as usize;

        if base >= module.len() {
            return Err(Error::DecodeFailed {
                offset: base,
                len: size,
            });
        }

        // The final byte of the code span is not decoded
        let end = base.saturating_add(size.saturating_sub(1)).min(module.len());
        if base == end {
            return Err(Error::Empty);
        }

        let scanner = LiteralScanner::new(self.config.scanner.clone());
        let report = scanner.patch(&mut module[base..end], delta)?;

        if report.patched() == 0 && self.config.require_code_patch {
            tracing::warn!("decoded {} instructions, none patched", report.decoded);
            return Err(Error::PatchFailed);
        }
        Ok(report)
    }

    /// Replace the table located in `old_module` with `new_table`, retrying
    /// relocation overflows with growing carry padding.
    pub fn splice_table(&self, old_module: &[u8], new_table: &[u8]) -> Result<SpliceOutcome> {
        let table = locate_table(old_module, &self.config.signature)?;
        let mut carry_padding = 0u16;
        let mut attempt = 1;

        loop {
            match self.splice_attempt(
                old_module,
                table.offset,
                table.length,
                new_table,
                carry_padding,
                attempt,
            ) {
                Err(Error::RelocationOverflow { next_padding }) => {
                    if attempt >= self.config.max_attempts {
                        return Err(Error::RetryLimitExceeded {
                            attempts: attempt,
                            padding: carry_padding,
                        });
                    }
                    carry_padding = carry_padding.saturating_add(next_padding);
                    tracing::warn!(
                        "attempt {attempt} overflowed, retrying with carry padding 0x{carry_padding:X}"
                    );
                    attempt += 1;
                    let delta = SizeDelta::compute(old_module.len(), table.length, new_table.len(), carry_padding);
                    self.report(ProgressStage::Retrying, attempt, &delta, 0);
                }
                result => return result,
            }
        }
    }
}

impl Default for Splicer {
    fn default() -> Self {
        Self::new(SpliceConfig::default())
    }
}

/// Replace the table carrying `signature` in `old_module` with `new_table`.
pub fn splice_table(old_module: &[u8], signature: &[u8; 4], new_table: &[u8]) -> Result<Vec<u8>> {
    Splicer::new(SpliceConfig::with_signature(*signature))
        .splice_table(old_module, new_table)
        .map(|outcome| outcome.module)
}
