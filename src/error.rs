// src/error.rs

//! Crate-wide error type and result alias.
//!
//! The planner treats `NotFound` specially: when a dependency group option
//! cannot be located it moves on to the next option instead of failing the
//! whole plan. Every other kind propagates unchanged to the caller.

use thiserror::Error;

/// Result alias used throughout the crate
pub type Result<T> = std::result::Result<T, Error>;

/// Errors produced by the build engine, planner, fetchers, and store
#[derive(Error, Debug)]
pub enum Error {
    /// An artifact, package, or definition could not be located.
    ///
    /// Dependency resolution converts this into "try the next option in the
    /// group"; everywhere else it is surfaced to the caller.
    #[error("not found: {0}")]
    NotFound(String),

    /// Two selected packages claim conflicting short names
    #[error("package {a} conflicts with installed package {b}")]
    Conflict { a: String, b: String },

    /// No option in a dependency group could be installed
    #[error("no option satisfied dependency group [{group}] (required by {path})")]
    UnresolvedGroup { group: String, path: String },

    /// A transport-level failure (DNS, connect, read) during a fetch
    #[error("network error fetching {url}: {reason}")]
    Network { url: String, reason: String },

    /// A non-success, non-404 HTTP response
    #[error("bad status {status} from {url}")]
    BadStatus { status: u16, url: String },

    /// Response body length did not match the declared expected size
    #[error("size mismatch for {url}: expected {expected} bytes, got {actual}")]
    SizeMismatch {
        url: String,
        expected: u64,
        actual: u64,
    },

    /// An on-disk `.def` file no longer hashes to its filename
    #[error("corrupt store entry {hash}: {reason}")]
    CorruptStore { hash: String, reason: String },

    /// A definition could not be encoded, decoded, or executed
    #[error("invalid definition: {0}")]
    InvalidDefinition(String),

    /// An operation requires a collaborator that is not registered,
    /// e.g. an ext4 image writer or a hypervisor launcher
    #[error("unsupported operation: {0}")]
    Unsupported(String),

    /// Cancellation was requested; no invariant has been violated
    #[error("interrupted")]
    Interrupted,

    /// A mirror name was used that is not present in the mirror table
    #[error("mirror {0} is not defined")]
    UnknownMirror(String),

    /// Malformed upstream index data
    #[error("failed to parse {what}: {reason}")]
    Parse { what: String, reason: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// True when this error means "the thing does not exist" rather than
    /// "something went wrong looking for it".
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_))
    }
}
