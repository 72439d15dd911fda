// src/hash.rs

//! Content hashing for definition identity
//!
//! Every build artifact is identified by the SHA-256 hash of its
//! definition's canonical encoding. Digests render as lowercase hex
//! (64 characters) and double as on-disk filenames in the artifact store.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};
use std::fmt;
use std::io::Read;
use std::str::FromStr;

/// Length of a digest in bytes
pub const DIGEST_LEN: usize = 32;

/// Length of a digest rendered as lowercase hex
pub const DIGEST_HEX_LEN: usize = 64;

/// A SHA-256 digest identifying a definition and its artifact
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Digest([u8; DIGEST_LEN]);

impl Digest {
    /// Wrap raw digest bytes
    pub fn from_bytes(bytes: [u8; DIGEST_LEN]) -> Self {
        Self(bytes)
    }

    /// Get the raw digest bytes
    #[inline]
    pub fn as_bytes(&self) -> &[u8; DIGEST_LEN] {
        &self.0
    }

    /// Render as a lowercase hex string suitable for a store filename
    pub fn to_hex(&self) -> String {
        let mut out = String::with_capacity(DIGEST_HEX_LEN);
        for b in &self.0 {
            use fmt::Write;
            let _ = write!(out, "{:02x}", b);
        }
        out
    }

    /// Parse a 64-character hex string
    pub fn parse(s: &str) -> Result<Self> {
        if s.len() != DIGEST_HEX_LEN {
            return Err(Error::InvalidDefinition(format!(
                "digest must be {} hex characters, got {}",
                DIGEST_HEX_LEN,
                s.len()
            )));
        }

        let mut bytes = [0u8; DIGEST_LEN];
        for (i, chunk) in s.as_bytes().chunks(2).enumerate() {
            let pair = std::str::from_utf8(chunk)
                .map_err(|_| Error::InvalidDefinition(format!("invalid hex in digest: {}", s)))?;
            bytes[i] = u8::from_str_radix(pair, 16)
                .map_err(|_| Error::InvalidDefinition(format!("invalid hex in digest: {}", s)))?;
        }

        Ok(Self(bytes))
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Digest({})", self.to_hex())
    }
}

impl FromStr for Digest {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl Serialize for Digest {
    fn serialize<S: serde::Serializer>(
        &self,
        serializer: S,
    ) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Digest {
    fn deserialize<D: serde::Deserializer<'de>>(
        deserializer: D,
    ) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Digest::parse(&s).map_err(serde::de::Error::custom)
    }
}

/// Incremental SHA-256 hasher
pub struct Hasher {
    state: Sha256,
}

impl Hasher {
    pub fn new() -> Self {
        Self {
            state: Sha256::new(),
        }
    }

    /// Feed more data into the hasher
    pub fn update(&mut self, data: &[u8]) {
        self.state.update(data);
    }

    /// Finalize and return the digest
    pub fn finalize(self) -> Digest {
        let out = self.state.finalize();
        let mut bytes = [0u8; DIGEST_LEN];
        bytes.copy_from_slice(&out);
        Digest(bytes)
    }
}

impl Default for Hasher {
    fn default() -> Self {
        Self::new()
    }
}

/// Hash a byte slice
pub fn hash_bytes(data: &[u8]) -> Digest {
    let mut hasher = Hasher::new();
    hasher.update(data);
    hasher.finalize()
}

/// Hash all data from a reader, streaming in 8 KiB chunks
pub fn hash_reader<R: Read>(reader: &mut R) -> Result<Digest> {
    let mut hasher = Hasher::new();
    let mut buffer = [0u8; 8192];

    loop {
        let n = reader.read(&mut buffer)?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
    }

    Ok(hasher.finalize())
}
