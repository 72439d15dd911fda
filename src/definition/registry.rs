// src/definition/registry.rs

//! In-memory registry of definitions by digest
//!
//! The registry remembers every definition it has hashed so a bare digest
//! can be turned back into a definition without touching disk. On a miss
//! it falls back to the store's `.def` file and verifies the reloaded
//! definition still hashes to the digest it was requested under.

use crate::definition::{codec, Definition};
use crate::error::{Error, Result};
use crate::hash::Digest;
use std::collections::HashMap;
use std::sync::Mutex;

/// Loads the raw `.def` bytes for a digest, usually from the artifact store
pub type DefMissHandler = dyn Fn(&Digest) -> Result<Vec<u8>> + Send + Sync;

pub struct DefinitionRegistry {
    known: Mutex<HashMap<Digest, Definition>>,
    on_miss: Box<DefMissHandler>,
}

impl DefinitionRegistry {
    pub fn new(on_miss: Box<DefMissHandler>) -> Self {
        Self {
            known: Mutex::new(HashMap::new()),
            on_miss,
        }
    }

    /// Hash a definition and remember it for later lookup
    pub fn hash(&self, def: &Definition) -> Digest {
        let digest = codec::hash_definition(def);
        self.known
            .lock()
            .expect("definition registry lock poisoned")
            .entry(digest)
            .or_insert_with(|| def.clone());
        digest
    }

    /// Look up a definition by digest
    ///
    /// Falls back to the miss handler (the store's `.def` file) and
    /// rejects with `CorruptStore` when the reloaded definition does not
    /// re-hash to `digest`.
    pub fn definition_by_hash(&self, digest: &Digest) -> Result<Definition> {
        if let Some(def) = self
            .known
            .lock()
            .expect("definition registry lock poisoned")
            .get(digest)
        {
            return Ok(def.clone());
        }

        let bytes = (self.on_miss)(digest)?;
        let def = codec::unmarshal_definition(&bytes, &|nested| self.definition_by_hash(nested))?;

        let actual = codec::hash_definition(&def);
        if actual != *digest {
            return Err(Error::CorruptStore {
                hash: digest.to_hex(),
                reason: format!("definition re-hashes to {}", actual),
            });
        }

        self.known
            .lock()
            .expect("definition registry lock poisoned")
            .insert(*digest, def.clone());

        Ok(def)
    }
}
