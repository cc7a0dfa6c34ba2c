//! dsdt2bios CLI - DSDT replacement for board-info PE modules.
//!
//! Operates on a raw module file that has already been extracted from the
//! firmware image; re-inserting the result is left to the firmware tooling.

use anyhow::Context;
use bytesize::ByteSize;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use dsdt2bios::pe::{name_str, ImageHeaders};
use dsdt2bios::reloc::{split_entry, walk_blocks, RELOC_SECTION};
use dsdt2bios::{
    extract_table, locate_table, PeImage, ProgressInfo, SpliceConfig, Splicer, DSDT_SIGNATURE,
};

/// Replace the ACPI DSDT inside a BIOS board-info module and repair its offsets.
#[derive(Parser)]
#[command(name = "dsdt2bios")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Log every rewritten field
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write the embedded table to a file
    Extract {
        /// Module file (PE32+ body)
        #[arg(short, long)]
        module: PathBuf,

        /// Output file path
        #[arg(short, long)]
        output: PathBuf,

        /// Table signature
        #[arg(long, default_value = "DSDT", value_parser = parse_signature)]
        signature: [u8; 4],
    },

    /// Replace the embedded table and write the repaired module
    Inject {
        /// Module file (PE32+ body)
        #[arg(short, long)]
        module: PathBuf,

        /// Replacement table
        #[arg(short, long)]
        table: PathBuf,

        /// Output file path
        #[arg(short, long)]
        output: PathBuf,

        /// Maximum attempts when relocations overflow a page
        #[arg(long, default_value = "8")]
        max_attempts: usize,

        /// Accept a result in which no code literal was patched
        #[arg(long)]
        allow_unpatched_code: bool,
    },

    /// Print headers, sections and relocation blocks of a module
    Info {
        /// Module file (PE32+ body)
        #[arg(short, long)]
        module: PathBuf,
    },
}

fn parse_signature(s: &str) -> Result<[u8; 4], String> {
    s.as_bytes()
        .try_into()
        .map_err(|_| format!("signature must be 4 ASCII bytes, got '{s}'"))
}

fn main() -> anyhow::Result<()> {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let cli = Cli::parse();

    // Initialize logging
    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)))
        .init();

    match cli.command {
        Commands::Extract {
            module,
            output,
            signature,
        } => extract(&module, &output, &signature)?,

        Commands::Inject {
            module,
            table,
            output,
            max_attempts,
            allow_unpatched_code,
        } => inject(&module, &table, &output, max_attempts, allow_unpatched_code)?,

        Commands::Info { module } => info(&module)?,
    }

    Ok(())
}

fn read(path: &PathBuf) -> anyhow::Result<Vec<u8>> {
    std::fs::read(path).with_context(|| format!("failed to read {}", path.display()))
}

fn extract(module: &PathBuf, output: &PathBuf, signature: &[u8; 4]) -> anyhow::Result<()> {
    let data = read(module)?;
    let table = extract_table(&data, signature)?;

    std::fs::write(output, table)
        .with_context(|| format!("failed to write {}", output.display()))?;

    println!(
        "Extracted {} ({}) to {}",
        String::from_utf8_lossy(signature),
        ByteSize::b(table.len() as u64),
        output.display()
    );
    Ok(())
}

fn inject(
    module: &PathBuf,
    table: &PathBuf,
    output: &PathBuf,
    max_attempts: usize,
    allow_unpatched_code: bool,
) -> anyhow::Result<()> {
    let data = read(module)?;
    let new_table = read(table)?;

    println!("Injecting {} into {}", table.display(), module.display());

    let config = SpliceConfig {
        max_attempts,
        require_code_patch: !allow_unpatched_code,
        progress_callback: Some(Box::new(|info: &ProgressInfo| {
            tracing::info!(
                attempt = info.attempt,
                delta = format_args!("0x{:X}", info.delta),
                "{}",
                info.stage.name()
            );
        })),
        ..Default::default()
    };

    let outcome = Splicer::new(config)
        .splice_table(&data, &new_table)
        .context("failed to patch the module")?;

    std::fs::write(output, &outcome.module)
        .with_context(|| format!("failed to write {}", output.display()))?;

    println!(
        "Patched module: {} -> {} (delta 0x{:X}, {} attempt(s), {} code literal(s))",
        ByteSize::b(data.len() as u64),
        ByteSize::b(outcome.module.len() as u64),
        outcome.delta.total(),
        outcome.attempts,
        outcome.scan.patched()
    );
    println!("Output: {}", output.display());
    Ok(())
}

fn info(module: &PathBuf) -> anyhow::Result<()> {
    let data = read(module)?;
    let image = PeImage::parse(&data)?;

    println!("Module: {} ({})", module.display(), ByteSize::b(data.len() as u64));
    println!("Machine                 0x{:04X}", image.machine);
    println!("BaseOfCode              0x{:X}", image.base_of_code);
    println!("SizeOfCode              0x{:X}", image.size_of_code);
    println!("SizeOfInitializedData   0x{:X}", image.size_of_initialized_data);
    println!("SizeOfImage             0x{:X}", image.size_of_image);

    for (i, dir) in image.directories.iter().enumerate() {
        if dir.virtual_address != 0 {
            println!("DataDirectory[{i:>2}]       0x{:X} (0x{:X})", dir.virtual_address, dir.size);
        }
    }

    println!("\n{:<8} {:>10} {:>10} {:>10} {:>10}", "Name", "VAddr", "VSize", "RawPtr", "RawSize");
    for s in &image.sections {
        println!(
            "{:<8} {:>#10X} {:>#10X} {:>#10X} {:>#10X}",
            s.name, s.virtual_address, s.virtual_size, s.pointer_to_raw_data, s.size_of_raw_data
        );
    }

    match locate_table(&data, &DSDT_SIGNATURE) {
        Ok(table) => println!("\nDSDT at 0x{:X} ({})", table.offset, ByteSize::b(table.length as u64)),
        Err(e) => println!("\nDSDT: {e}"),
    }

    let headers = ImageHeaders::locate(&data)?;
    if let Some(reloc) = headers.find_section(&data, RELOC_SECTION)? {
        let start = reloc.pointer_to_raw_data(&data)? as usize;
        let blocks = walk_blocks(&data, start, reloc.virtual_size(&data)?)?;
        println!(
            "\nRelocations ({} block(s)) in {}",
            blocks.len(),
            name_str(&reloc.name(&data)?)
        );
        for block in blocks {
            let entries = block.entries(&data)?;
            let live = entries.iter().filter(|&&e| e != 0).count();
            println!(
                "  page 0x{:04X}  size 0x{:X}  {} entries",
                block.virtual_address, block.size_of_block, live
            );
            for entry in entries.into_iter().filter(|&e| e != 0) {
                let (kind, offset) = split_entry(entry);
                println!("    type {kind:>2}  0x{:04X}", block.target(offset));
            }
        }
    }

    Ok(())
}
