// src/lib.rs

//! rootforge
//!
//! On-demand assembly of minimal Linux virtual-machine root filesystems
//! from declarative recipes, built around a content-addressed build
//! engine and a package-resolution planner.
//!
//! # Architecture
//!
//! - Definitions-first: every artifact is described by a pure value whose
//!   identity is the SHA-256 hash of its canonical encoding
//! - Write-once store: artifacts land atomically at `<hash>.bin` and are
//!   memoized in memory, on disk, and optionally via a distribution mirror
//! - Uniform packages: five upstream index formats (Alpine, Debian, RPM,
//!   Arch, PyPI) parse into one `Package` model the planner consumes
//! - Deterministic plans: resolution is depth-first with short-name
//!   memoization; identical inputs produce bit-identical plans
//!
//! The embedded scripting frontend, hypervisor launcher, ext4 writer, and
//! in-VM init agent are external collaborators; this crate exposes the
//! seams they plug into ([`engine::BuiltinProvider`],
//! [`assembler::BlockImageWriter`], [`engine::VmTemplate`]).

pub mod assembler;
pub mod cancel;
pub mod compression;
pub mod config;
pub mod definition;
pub mod engine;
mod error;
pub mod fetch;
pub mod hash;
pub mod model;
pub mod planner;
pub mod repo;
pub mod store;
pub mod version;

pub use cancel::CancelToken;
pub use config::{CoreConfig, RecipeConfig};
pub use definition::{Definition, Directive, OutputFormat};
pub use engine::{
    BuildEngine, BuildContext, BuildOptions, BuildOutcome, BuildProduct, VmTemplate,
};
pub use error::{Error, Result};
pub use hash::Digest;
pub use model::{Package, PackageName, PackageQuery};
pub use planner::{InstallationPlan, PlanOptions, Planner};
pub use repo::{BuilderRegistry, DistroBuilder, FetcherStatus, Repository};
pub use store::ArtifactStore;
