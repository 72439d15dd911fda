// src/store.rs

//! On-disk artifact store keyed by definition digest
//!
//! The store directory contains only four kinds of entries, all named by
//! lowercase hex digest: `<hex>.bin` (artifact bytes), `<hex>.def`
//! (serialized definition), and the empty tag files `<hex>.downloaded`
//! and `<hex>.redistributable`. Artifact writes are atomic: bytes land in
//! `<hex>.bin.tmp`, are fsynced, and are renamed into place, so a partial
//! `.bin` is never observable.

use crate::error::{Error, Result};
use crate::hash::Digest;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Artifact bytes
pub const SUFFIX_BIN: &str = ".bin";
/// Serialized definition
pub const SUFFIX_DEF: &str = ".def";
/// Marks bytes supplied by the distribution mirror instead of a local build
pub const SUFFIX_DOWNLOADED: &str = ".downloaded";
/// Marks artifacts eligible for upload to a distribution mirror
pub const SUFFIX_REDISTRIBUTABLE: &str = ".redistributable";

const SUFFIX_TMP: &str = ".bin.tmp";
const SUFFIX_CORRUPT: &str = ".bin.corrupt";

/// Content-addressed artifact storage rooted at the build directory
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    /// Open (creating if needed) a store rooted at `root`
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    /// The store's root directory
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path of an entry for `digest` with the given suffix
    pub fn path_for(&self, digest: &Digest, suffix: &str) -> PathBuf {
        self.root.join(format!("{}{}", digest.to_hex(), suffix))
    }

    /// Path of the temporary file a build writes into before rename
    pub fn tmp_path(&self, digest: &Digest) -> PathBuf {
        self.path_for(digest, SUFFIX_TMP)
    }

    /// True when the artifact bytes for `digest` exist
    pub fn has(&self, digest: &Digest) -> bool {
        self.path_for(digest, SUFFIX_BIN).exists()
    }

    /// Open the artifact bytes for `digest`
    pub fn open_artifact(&self, digest: &Digest) -> Result<File> {
        let path = self.path_for(digest, SUFFIX_BIN);
        File::open(&path).map_err(|e| {
            if e.kind() == io::ErrorKind::NotFound {
                Error::NotFound(format!("artifact {}", digest))
            } else {
                Error::Io(e)
            }
        })
    }

    /// Atomically write artifact bytes from a reader
    ///
    /// Streams into `<hex>.bin.tmp`, fsyncs, renames. The tmp file is
    /// removed on any failure.
    pub fn put(&self, digest: &Digest, reader: &mut dyn Read) -> Result<u64> {
        let tmp = self.tmp_path(digest);

        let mut file = File::create(&tmp)?;
        let written = match io::copy(reader, &mut file) {
            Ok(n) => n,
            Err(e) => {
                drop(file);
                let _ = fs::remove_file(&tmp);
                return Err(Error::Io(e));
            }
        };

        if let Err(e) = file.sync_all() {
            drop(file);
            let _ = fs::remove_file(&tmp);
            return Err(Error::Io(e));
        }
        drop(file);

        self.commit_tmp(digest)?;
        Ok(written)
    }

    /// Rename an already-written tmp file into place
    ///
    /// Used both by [`ArtifactStore::put`] and by the engine when a build
    /// wrote its own output under the tmp path. Removes the tmp file if
    /// the rename fails.
    pub fn commit_tmp(&self, digest: &Digest) -> Result<()> {
        let tmp = self.tmp_path(digest);
        let bin = self.path_for(digest, SUFFIX_BIN);

        fs::rename(&tmp, &bin).map_err(|e| {
            let _ = fs::remove_file(&tmp);
            Error::Io(e)
        })?;

        debug!(artifact = %digest, "committed");
        Ok(())
    }

    /// Remove a stale tmp file if one exists
    pub fn discard_tmp(&self, digest: &Digest) {
        let tmp = self.tmp_path(digest);
        if tmp.exists() {
            let _ = fs::remove_file(&tmp);
        }
    }

    /// Write an empty tag file for `digest`
    pub fn mark(&self, digest: &Digest, suffix: &str) -> Result<()> {
        let path = self.path_for(digest, suffix);
        OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(path)?;
        Ok(())
    }

    /// True when the tag file exists
    pub fn is_marked(&self, digest: &Digest, suffix: &str) -> bool {
        self.path_for(digest, suffix).exists()
    }

    /// Write the serialized definition next to the artifact
    pub fn put_definition(&self, digest: &Digest, bytes: &[u8]) -> Result<()> {
        let path = self.path_for(digest, SUFFIX_DEF);
        let mut file = File::create(path)?;
        file.write_all(bytes)?;
        Ok(())
    }

    /// Read the serialized definition for `digest`
    pub fn definition_bytes(&self, digest: &Digest) -> Result<Vec<u8>> {
        let path = self.path_for(digest, SUFFIX_DEF);
        fs::read(&path).map_err(|e| {
            if e.kind() == io::ErrorKind::NotFound {
                Error::NotFound(format!("definition {}", digest))
            } else {
                Error::Io(e)
            }
        })
    }

    /// Modification time of the artifact bytes, if they exist
    pub fn artifact_mtime(&self, digest: &Digest) -> Option<std::time::SystemTime> {
        fs::metadata(self.path_for(digest, SUFFIX_BIN))
            .and_then(|m| m.modified())
            .ok()
    }

    /// Every digest with a serialized definition in the store
    pub fn all_hashes(&self) -> Result<Vec<String>> {
        let mut hashes = Vec::new();

        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if let Some(stem) = name.strip_suffix(SUFFIX_DEF) {
                hashes.push(stem.to_string());
            }
        }

        hashes.sort();
        Ok(hashes)
    }

    /// Move a damaged artifact aside so the next build starts fresh
    pub fn quarantine(&self, digest: &Digest) -> Result<()> {
        let bin = self.path_for(digest, SUFFIX_BIN);
        let corrupt = self.path_for(digest, SUFFIX_CORRUPT);

        warn!(artifact = %digest, "quarantining corrupt artifact");
        fs::rename(&bin, &corrupt)?;
        Ok(())
    }
}
