// src/assembler/mod.rs

//! Filesystem assembly from directives
//!
//! Building an image happens in two passes. **Flattening** consumes the
//! structural directives: `AddPackage` names accumulate and are expanded
//! through an injected handler (which re-queries the planner and returns
//! archive directives for the selected packages), and `Interaction`
//! selects the VM interaction mode. **Application** then walks the
//! surviving directives in order against a [`VirtualTree`].
//!
//! Runtime directives (`RunCommand`, `Environment`, `ExportPort`) cannot
//! act inside a filesystem build; they are serialized to `/init.json` for
//! the in-VM init agent, which is an external collaborator.

pub mod archive;
pub mod formats;
pub mod tree;

pub use archive::{decompress_archive, extract_tar, write_tar};
pub use formats::normalize_to_tar;
pub use tree::{NodeMeta, TreeNode, VirtualTree};

use crate::definition::{Definition, Directive};
use crate::error::{Error, Result};
use serde::Serialize;
use std::io::Write;
use tracing::debug;

/// The result of the flattening pre-pass
#[derive(Debug, Clone, Default)]
pub struct FlattenedBuild {
    /// Directives that materialize filesystem content, in order
    pub fs_directives: Vec<Directive>,
    /// Commands the guest runs at boot
    pub commands: Vec<String>,
    /// Environment for those commands
    pub environment: Vec<String>,
    /// Ports forwarded out of the guest
    pub ports: Vec<(String, u16)>,
    /// Interaction mode chosen by the last `Interaction` directive
    pub interaction: Option<String>,
}

/// Flatten a directive list
///
/// `expand_packages` receives the accumulated `AddPackage` names (in
/// first-appearance order) and returns the directives that install them;
/// those run before everything else so packages form the base layer.
pub fn flatten(
    directives: &[Directive],
    expand_packages: impl FnOnce(&[String]) -> Result<Vec<Directive>>,
) -> Result<FlattenedBuild> {
    let mut flat = FlattenedBuild::default();
    let mut packages: Vec<String> = Vec::new();

    for directive in directives {
        match directive {
            Directive::AddPackage { name } => {
                if !packages.contains(name) {
                    packages.push(name.clone());
                }
            }
            Directive::Interaction { mode } => {
                flat.interaction = Some(mode.clone());
            }
            Directive::RunCommand { command } => {
                flat.commands.push(command.clone());
            }
            Directive::Environment { vars } => {
                flat.environment.extend(vars.iter().cloned());
            }
            Directive::ExportPort { name, port } => {
                flat.ports.push((name.clone(), *port));
            }
            other => flat.fs_directives.push(other.clone()),
        }
    }

    if !packages.is_empty() {
        debug!(packages = packages.len(), "expanding package directives");
        let expanded = expand_packages(&packages)?;
        let mut fs_directives = expanded;
        fs_directives.append(&mut flat.fs_directives);
        flat.fs_directives = fs_directives;
    }

    Ok(flat)
}

/// Materializes directive inputs during application
///
/// The engine implements this by building nested definitions; tests use
/// in-memory fakes.
pub trait DirectiveSource {
    /// The artifact bytes of a nested definition
    fn definition_bytes(&mut self, def: &Definition) -> Result<Vec<u8>>;

    /// The contents of a host file referenced by `LocalFile`
    fn host_file(&mut self, path: &str) -> Result<Vec<u8>> {
        Ok(std::fs::read(path)?)
    }

    /// A built-in executable (init agent, guest tools)
    fn builtin(&mut self, name: &str, architecture: &str) -> Result<Vec<u8>> {
        Err(Error::Unsupported(format!(
            "no provider for builtin {} ({})",
            name, architecture
        )))
    }
}

/// Guest path of the serialized boot manifest
pub const INIT_MANIFEST_PATH: &str = "/init.json";

#[derive(Debug, Serialize)]
struct InitManifest<'a> {
    #[serde(skip_serializing_if = "Vec::is_empty")]
    commands: Vec<&'a str>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    environment: Vec<&'a str>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    ports: Vec<(&'a str, u16)>,
}

/// Apply flattened directives and produce the populated tree
///
/// When the build carries commands, environment, or ports, they are
/// written as the init manifest at [`INIT_MANIFEST_PATH`].
pub fn assemble(flat: &FlattenedBuild, source: &mut dyn DirectiveSource) -> Result<VirtualTree> {
    let mut virtual_tree = VirtualTree::new();
    apply_directives(&mut virtual_tree, &flat.fs_directives, source)?;

    if !flat.commands.is_empty() || !flat.environment.is_empty() || !flat.ports.is_empty() {
        let manifest = InitManifest {
            commands: flat.commands.iter().map(String::as_str).collect(),
            environment: flat.environment.iter().map(String::as_str).collect(),
            ports: flat
                .ports
                .iter()
                .map(|(name, port)| (name.as_str(), *port))
                .collect(),
        };
        virtual_tree.create_file(
            INIT_MANIFEST_PATH,
            serde_json::to_vec_pretty(&manifest)?,
            NodeMeta::file(),
        )?;
    }

    Ok(virtual_tree)
}

/// Apply content directives in order to a mutable tree
pub fn apply_directives(
    virtual_tree: &mut VirtualTree,
    directives: &[Directive],
    source: &mut dyn DirectiveSource,
) -> Result<()> {
    for directive in directives {
        match directive {
            Directive::AddFile { path, source: def } => {
                let content = source.definition_bytes(def)?;
                virtual_tree.create_file(path, content, NodeMeta::file())?;
            }
            Directive::LocalFile {
                host_path,
                guest_path,
            } => {
                let content = source.host_file(host_path)?;
                virtual_tree.create_file(guest_path, content, NodeMeta::file())?;
            }
            Directive::Archive {
                source: def,
                target_prefix,
            } => {
                let bytes = source.definition_bytes(def)?;
                let reader = decompress_archive(&bytes, "")?;
                let entries = extract_tar(virtual_tree, reader, target_prefix)?;
                debug!(definition = %def.tag(), entries, "extracted archive");
            }
            Directive::Builtin {
                name,
                architecture,
                guest_path,
            } => {
                let content = source.builtin(name, architecture)?;
                virtual_tree.create_file(guest_path, content, NodeMeta::executable())?;
            }
            other => {
                return Err(Error::InvalidDefinition(format!(
                    "directive {:?} must be consumed by flattening",
                    other
                )))
            }
        }
    }

    Ok(())
}

/// Seam for the external ext4 image writer
///
/// The core serializes trees as tar itself; block-image output delegates
/// to whichever writer the embedding application registers.
pub trait BlockImageWriter: Send + Sync {
    fn write_image(
        &self,
        virtual_tree: &VirtualTree,
        storage_mb: u64,
        out: &mut dyn Write,
    ) -> Result<()>;
}
