// src/definition/mod.rs

//! Build definitions: pure values describing how to compute an artifact
//!
//! A [`Definition`] is immutable once hashed. Its identity is the SHA-256
//! digest of its canonical encoding, in which nested definitions appear
//! only as their own digests, so a definition's hash covers the full
//! dependency closure. Anything impure (a host file, sealed bytes) enters
//! the graph through [`Definition::ConstantHash`] with a caller-supplied
//! digest.

mod codec;
mod registry;

pub use codec::{encode_definition, hash_definition, marshal_definition, unmarshal_definition};
pub use registry::DefinitionRegistry;

use crate::hash::Digest;
use crate::model::PackageQuery;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Output format of a filesystem build
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    /// A tar stream of the assembled tree
    Tar,
    /// An ext4 block image written through the registered image writer
    Ext4,
}

impl OutputFormat {
    pub fn name(&self) -> &'static str {
        match self {
            OutputFormat::Tar => "tar",
            OutputFormat::Ext4 => "ext4",
        }
    }
}

/// One step in assembling a root filesystem or VM
///
/// `AddPackage` and `Interaction` are structural: the flattening pre-pass
/// consumes them to rewrite the plan. Every other directive survives to
/// the image builder or the VM template.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Directive {
    /// Place the artifact of `source` at `path` inside the image
    AddFile { path: String, source: Definition },
    /// Copy a host file into the image
    LocalFile {
        host_path: String,
        guest_path: String,
    },
    /// Extract the archive artifact of `source` under `target_prefix`
    Archive {
        source: Definition,
        target_prefix: String,
    },
    /// Run a command inside the guest at boot
    RunCommand { command: String },
    /// Set environment variables for guest commands
    Environment { vars: Vec<String> },
    /// Forward a guest port out of the VM
    ExportPort { name: String, port: u16 },
    /// Place a built-in executable (init, guest agent) into the image
    Builtin {
        name: String,
        architecture: String,
        guest_path: String,
    },
    /// Structural: add a package query to the plan during flattening
    AddPackage { name: String },
    /// Structural: select the VM interaction mode during flattening
    Interaction { mode: String },
}

impl Directive {
    /// True for directives consumed by the flattening pre-pass
    pub fn is_structural(&self) -> bool {
        matches!(
            self,
            Directive::AddPackage { .. } | Directive::Interaction { .. }
        )
    }

    /// Nested definitions referenced by this directive
    pub fn children(&self) -> Vec<&Definition> {
        match self {
            Directive::AddFile { source, .. } | Directive::Archive { source, .. } => {
                vec![source]
            }
            _ => Vec::new(),
        }
    }
}

/// A pure, hashable description of how to compute an artifact
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Definition {
    /// Download a URL (possibly `mirror://`) and cache the body
    FetchHttp {
        url: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        expected_size: Option<u64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        accept: Option<String>,
    },
    /// Normalize the artifact of `base` into an uncompressed tar archive
    ReadArchive {
        base: Box<Definition>,
        format_hint: String,
    },
    /// External sealed bytes; the caller supplies the digest
    ConstantHash { hash: Digest, opener: String },
    /// Resolve a package query set against a named builder's repository
    Plan {
        builder: String,
        architecture: String,
        queries: Vec<PackageQuery>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        tags: Vec<String>,
    },
    /// Assemble a root filesystem from directives
    BuildFs {
        directives: Vec<Directive>,
        output_format: OutputFormat,
    },
    /// Assemble the launch template of a virtual machine
    BuildVm {
        directives: Vec<Directive>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        kernel: Option<Box<Definition>>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        initramfs: Option<Box<Definition>>,
        output_name: String,
        cpu_cores: u32,
        memory_mb: u64,
        architecture: String,
        storage_mb: u64,
        interaction: String,
        #[serde(default, skip_serializing_if = "std::ops::Not::not")]
        debug: bool,
    },
}

impl Definition {
    /// Compute this definition's content digest
    pub fn hash(&self) -> Digest {
        hash_definition(self)
    }

    /// A human-readable short name used in logs and error messages
    pub fn tag(&self) -> String {
        match self {
            Definition::FetchHttp { url, .. } => format!("fetch_http({})", url),
            Definition::ReadArchive { base, .. } => format!("read_archive({})", base.tag()),
            Definition::ConstantHash { hash, .. } => {
                format!("constant_hash({})", &hash.to_hex()[..12])
            }
            Definition::Plan {
                builder,
                architecture,
                ..
            } => format!("plan({}-{})", builder, architecture),
            Definition::BuildFs { output_format, .. } => {
                format!("build_fs({})", output_format.name())
            }
            Definition::BuildVm { output_name, .. } => format!("build_vm({})", output_name),
        }
    }

    /// Nested definitions referenced directly by this one
    pub fn children(&self) -> Vec<&Definition> {
        match self {
            Definition::FetchHttp { .. }
            | Definition::ConstantHash { .. }
            | Definition::Plan { .. } => Vec::new(),
            Definition::ReadArchive { base, .. } => vec![base.as_ref()],
            Definition::BuildFs { directives, .. } => {
                directives.iter().flat_map(|d| d.children()).collect()
            }
            Definition::BuildVm {
                directives,
                kernel,
                initramfs,
                ..
            } => {
                let mut out: Vec<&Definition> =
                    directives.iter().flat_map(|d| d.children()).collect();
                if let Some(k) = kernel {
                    out.push(k.as_ref());
                }
                if let Some(i) = initramfs {
                    out.push(i.as_ref());
                }
                out
            }
        }
    }

    /// True when this definition may be served from a distribution mirror
    ///
    /// Fetched and normalized archives come from public URLs and can be
    /// redistributed; plans and images are user definitions, and constant
    /// hashes are sealed local bytes.
    pub fn redistributable(&self) -> bool {
        matches!(
            self,
            Definition::FetchHttp { .. } | Definition::ReadArchive { .. }
        )
    }
}

impl fmt::Display for Definition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.tag())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fetch(url: &str) -> Definition {
        Definition::FetchHttp {
            url: url.into(),
            expected_size: None,
            accept: None,
        }
    }

    #[test]
    fn test_identical_definitions_hash_identically() {
        assert_eq!(fetch("http://example/x").hash(), fetch("http://example/x").hash());
        assert_ne!(fetch("http://example/x").hash(), fetch("http://example/y").hash());
    }

    #[test]
    fn test_nested_hash_changes_parent_hash() {
        let a = Definition::ReadArchive {
            base: Box::new(fetch("http://example/a.tar.gz")),
            format_hint: "tar.gz".into(),
        };
        let b = Definition::ReadArchive {
            base: Box::new(fetch("http://example/b.tar.gz")),
            format_hint: "tar.gz".into(),
        };
        assert_ne!(a.hash(), b.hash());
    }

    #[test]
    fn test_children_walk_directives() {
        let def = Definition::BuildFs {
            directives: vec![
                Directive::Archive {
                    source: fetch("http://example/base.tar.gz"),
                    target_prefix: "/".into(),
                },
                Directive::RunCommand {
                    command: "ls".into(),
                },
                Directive::AddFile {
                    path: "/etc/motd".into(),
                    source: fetch("http://example/motd"),
                },
            ],
            output_format: OutputFormat::Tar,
        };
        assert_eq!(def.children().len(), 2);
    }

    #[test]
    fn test_structural_directives() {
        assert!(Directive::AddPackage {
            name: "busybox".into()
        }
        .is_structural());
        assert!(Directive::Interaction {
            mode: "ssh".into()
        }
        .is_structural());
        assert!(!Directive::RunCommand {
            command: "ls".into()
        }
        .is_structural());
    }

    #[test]
    fn test_redistributable_variants() {
        assert!(fetch("http://example/x").redistributable());
        assert!(Definition::ReadArchive {
            base: Box::new(fetch("http://example/x")),
            format_hint: "tar".into(),
        }
        .redistributable());
        assert!(!Definition::Plan {
            builder: "alpine@3.20".into(),
            architecture: "x86_64".into(),
            queries: vec![],
            tags: vec![],
        }
        .redistributable());
        assert!(!Definition::ConstantHash {
            hash: crate::hash::hash_bytes(b"sealed"),
            opener: "host".into(),
        }
        .redistributable());
    }

    #[test]
    fn test_tag_is_short_and_human_readable() {
        let def = fetch("http://example/x");
        assert_eq!(def.tag(), "fetch_http(http://example/x)");
        assert_eq!(def.to_string(), def.tag());
    }
}
