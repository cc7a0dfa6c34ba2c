//! Error types for dsdt2bios.

use thiserror::Error;

/// Result type alias using our error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while locating, splicing or repairing a module.
#[derive(Error, Debug)]
pub enum Error {
    #[error("invalid file: {0}")]
    InvalidFile(&'static str),

    #[error("invalid DOS signature at offset 0x{0:X}")]
    InvalidDosSignature(usize),

    #[error("invalid PE signature at offset 0x{0:X}")]
    InvalidPeSignature(usize),

    #[error("table signature '{0}' not found")]
    NotFound(String),

    #[error("declared table length 0x{length:X} at offset 0x{offset:X} exceeds the 0x{available:X} remaining bytes")]
    InvalidLength {
        offset: usize,
        length: usize,
        available: usize,
    },

    #[error("table declares length 0x{declared:X} but 0x{actual:X} bytes were supplied")]
    SizeMismatch { declared: usize, actual: usize },

    #[error("module size 0x{size:X} exceeds limit of 0x{limit:X}")]
    FileTooLarge { size: usize, limit: usize },

    #[error("final size 0x{size:X} exceeds limit of 0x{limit:X}")]
    BufferTooSmall { size: usize, limit: usize },

    #[error("module contains unpatchable section '{0}'")]
    UnsupportedSection(String),

    #[error("relocation offset crossed a page boundary, retry with 0x{next_padding:X} bytes of padding")]
    RelocationOverflow { next_padding: u16 },

    #[error("relocation overflow persisted after {attempts} attempts (padding 0x{padding:X})")]
    RetryLimitExceeded { attempts: usize, padding: u16 },

    #[error("invalid relocation block at offset 0x{offset:X} (size: 0x{size:X})")]
    InvalidRelocationBlock { offset: usize, size: u32 },

    #[error("no pointer literals were patched in the code section")]
    PatchFailed,

    #[error("failed to decode code section at offset 0x{offset:X} (length: 0x{len:X})")]
    DecodeFailed { offset: usize, len: usize },

    #[error("code section decoded to zero instructions")]
    Empty,

    #[error("PE headers too small: expected {expected}, got {actual}")]
    HeadersTooSmall { expected: usize, actual: usize },

    #[error("module not found: {0}")]
    ModuleNotFound(String),
}

impl Error {
    /// Whether the splice can be retried with more carry padding.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::RelocationOverflow { .. })
    }
}
