//! # dsdt2bios
//!
//! Replaces the ACPI DSDT embedded in a legacy BIOS board-info PE32+ module and
//! repairs everything the size change moves.
//!
//! ## Overview
//!
//! The module carries its DSDT inside `.data`. Swapping in a table of another
//! size shifts every byte after it, so the splice:
//!
//! 1. Rebuilds the module around the new table, padded to a 16-byte boundary
//! 2. Shifts optional header sizes, data directories and the section table
//! 3. Rebases the base relocation blocks onto the module's last 4 KiB page
//! 4. Decodes the code section and shifts pointer literals baked into it
//!
//! The module must stay within a 16-bit (0xFFFF byte) window. A relocation
//! block whose offsets straddle a page boundary after the shift is retried with
//! extra padding until it no longer does.
//!
//! ## Usage
//!
//! ```no_run
//! let module = std::fs::read("AmiBoardInfo.bin")?;
//! let dsdt = std::fs::read("DSDT.aml")?;
//! let patched = dsdt2bios::splice_table(&module, b"DSDT", &dsdt)?;
//! std::fs::write("AmiBoardInfo.patched.bin", patched)?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

#![warn(clippy::all)]
#![warn(rust_2018_idioms)]

pub mod error;
pub mod pe;
pub mod acpi;
pub mod scanner;
pub mod header;
pub mod reloc;
pub mod splice;
pub mod store;

pub use error::{Error, Result};
pub use acpi::{extract_table, locate_table, AcpiTable, DSDT_SIGNATURE};
pub use pe::PeImage;
pub use splice::{
    splice_table, ProgressCallback, ProgressInfo, ProgressStage, SizeDelta, SpliceConfig,
    SpliceOutcome, Splicer,
};
pub use store::{inject_table, ExtractMode, MemoryStore, ModuleStore, ReplaceMode};
