//! Module store seam.
//!
//! The firmware container that holds the module is an external collaborator.
//! Anything that can hand out a module's bytes by identifier and take them back
//! implements [`ModuleStore`]; [`inject_table`] runs the full
//! extract-splice-replace flow against it. Compression and tree search stay
//! on the container's side.

use std::collections::HashMap;

use crate::error::{Error, Result};
use crate::splice::{SpliceConfig, SpliceOutcome, Splicer};

/// What to extract from a stored module record.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExtractMode {
    /// Header and body.
    Whole,
    /// Body only.
    Body,
}

/// How to write a module back into its record.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReplaceMode {
    /// Bytes are a complete record.
    AsIs,
    /// Bytes replace the body; the record header is rebuilt by the store.
    Body,
}

/// A container that stores modules by identifier.
pub trait ModuleStore {
    /// Fetch the bytes of a module.
    fn extract(&self, id: &str, mode: ExtractMode) -> Result<Vec<u8>>;

    /// Overwrite the bytes of a module.
    fn replace(&mut self, id: &str, bytes: &[u8], mode: ReplaceMode) -> Result<()>;
}

/// Flat in-memory store; records have no header, so both modes act on the
/// raw bytes.
#[derive(Clone, Debug, Default)]
pub struct MemoryStore {
    modules: HashMap<String, Vec<u8>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or overwrite a module.
    pub fn insert(&mut self, id: impl Into<String>, bytes: Vec<u8>) {
        self.modules.insert(id.into(), bytes);
    }

    pub fn get(&self, id: &str) -> Option<&[u8]> {
        self.modules.get(id).map(Vec::as_slice)
    }

    /// Consume the store and return one module.
    pub fn into_module(mut self, id: &str) -> Option<Vec<u8>> {
        self.modules.remove(id)
    }
}

impl ModuleStore for MemoryStore {
    fn extract(&self, id: &str, _mode: ExtractMode) -> Result<Vec<u8>> {
        self.get(id)
            .map(<[u8]>::to_vec)
            .ok_or_else(|| Error::ModuleNotFound(id.to_string()))
    }

    fn replace(&mut self, id: &str, bytes: &[u8], _mode: ReplaceMode) -> Result<()> {
        let slot = self
            .modules
            .get_mut(id)
            .ok_or_else(|| Error::ModuleNotFound(id.to_string()))?;
        *slot = bytes.to_vec();
        Ok(())
    }
}

/// Splice `new_table` into the module `id` of `store`.
///
/// The store is only written when the splice succeeds.
pub fn inject_table<S: ModuleStore + ?Sized>(
    store: &mut S,
    id: &str,
    new_table: &[u8],
    config: SpliceConfig,
) -> Result<SpliceOutcome> {
    if !new_table.starts_with(&config.signature) {
        return Err(Error::InvalidFile("replacement table has an invalid header"));
    }

    let module = store.extract(id, ExtractMode::Body)?;
    tracing::info!("extracted {id} ({} bytes)", module.len());

    let outcome = Splicer::new(config).splice_table(&module, new_table)?;

    store.replace(id, &outcome.module, ReplaceMode::Body)?;
    tracing::info!("replaced {id} ({} bytes)", outcome.module.len());

    Ok(outcome)
}
