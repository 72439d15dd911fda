// src/assembler/tree.rs

//! In-memory virtual directory tree
//!
//! The assembler applies directives to this tree before serializing it as
//! an image. Children are kept in a `BTreeMap`, so iteration order is
//! deterministic and two identical directive sequences produce identical
//! archives. Writes are last-write-wins: extracting an archive and then
//! adding a file at the same path replaces the archive's entry.

use crate::error::{Error, Result};
use std::collections::BTreeMap;

/// Ownership, permissions, and timestamp carried by every node
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeMeta {
    pub mode: u32,
    pub uid: u64,
    pub gid: u64,
    /// Seconds since the epoch
    pub mtime: u64,
}

impl NodeMeta {
    pub fn file() -> Self {
        Self {
            mode: 0o644,
            uid: 0,
            gid: 0,
            mtime: 0,
        }
    }

    pub fn directory() -> Self {
        Self {
            mode: 0o755,
            uid: 0,
            gid: 0,
            mtime: 0,
        }
    }

    pub fn executable() -> Self {
        Self {
            mode: 0o755,
            ..Self::file()
        }
    }
}

/// One node in the virtual tree
#[derive(Debug, Clone)]
pub enum TreeNode {
    Directory {
        meta: NodeMeta,
        entries: BTreeMap<String, TreeNode>,
    },
    File {
        meta: NodeMeta,
        content: Vec<u8>,
    },
    Symlink {
        meta: NodeMeta,
        target: String,
    },
    /// Hard link to an earlier entry, by absolute path
    Hardlink { target: String },
}

impl TreeNode {
    pub fn is_directory(&self) -> bool {
        matches!(self, TreeNode::Directory { .. })
    }

    fn empty_directory() -> Self {
        TreeNode::Directory {
            meta: NodeMeta::directory(),
            entries: BTreeMap::new(),
        }
    }
}

/// A mutable virtual filesystem rooted at `/`
#[derive(Debug, Clone)]
pub struct VirtualTree {
    root: TreeNode,
}

impl Default for VirtualTree {
    fn default() -> Self {
        Self::new()
    }
}

impl VirtualTree {
    pub fn new() -> Self {
        Self {
            root: TreeNode::empty_directory(),
        }
    }

    /// Split a path into normalized components
    fn components(path: &str) -> Vec<&str> {
        path.split('/')
            .filter(|c| !c.is_empty() && *c != ".")
            .collect()
    }

    /// Create every directory along `path`, returning an error when a
    /// non-directory is in the way
    pub fn mkdir_p(&mut self, path: &str) -> Result<()> {
        self.mkdir_with_meta(path, NodeMeta::directory())
    }

    /// Like [`VirtualTree::mkdir_p`] with explicit metadata on the leaf
    pub fn mkdir_with_meta(&mut self, path: &str, meta: NodeMeta) -> Result<()> {
        let components = Self::components(path);
        let mut node = &mut self.root;

        for (i, component) in components.iter().enumerate() {
            let TreeNode::Directory { entries, .. } = node else {
                return Err(Error::InvalidDefinition(format!(
                    "{} is not a directory",
                    components[..i].join("/")
                )));
            };

            node = entries
                .entry(component.to_string())
                .or_insert_with(TreeNode::empty_directory);
        }

        if let TreeNode::Directory {
            meta: existing, ..
        } = node
        {
            *existing = meta;
            Ok(())
        } else {
            Err(Error::InvalidDefinition(format!(
                "{} exists and is not a directory",
                path
            )))
        }
    }

    /// Insert a node at `path`, creating parent directories
    ///
    /// Replaces any existing node at the path.
    pub fn insert(&mut self, path: &str, new_node: TreeNode) -> Result<()> {
        let components = Self::components(path);
        let Some((leaf, parents)) = components.split_last() else {
            return Err(Error::InvalidDefinition(
                "cannot replace the root directory".into(),
            ));
        };

        let mut node = &mut self.root;
        for (i, component) in parents.iter().enumerate() {
            let TreeNode::Directory { entries, .. } = node else {
                return Err(Error::InvalidDefinition(format!(
                    "{} is not a directory",
                    parents[..i].join("/")
                )));
            };

            node = entries
                .entry(component.to_string())
                .or_insert_with(TreeNode::empty_directory);
        }

        let TreeNode::Directory { entries, .. } = node else {
            return Err(Error::InvalidDefinition(format!(
                "parent of {} is not a directory",
                path
            )));
        };

        entries.insert(leaf.to_string(), new_node);
        Ok(())
    }

    /// Create or replace a regular file
    pub fn create_file(&mut self, path: &str, content: Vec<u8>, meta: NodeMeta) -> Result<()> {
        self.insert(path, TreeNode::File { meta, content })
    }

    /// Create or replace a symlink
    pub fn symlink(&mut self, path: &str, target: impl Into<String>, meta: NodeMeta) -> Result<()> {
        self.insert(
            path,
            TreeNode::Symlink {
                meta,
                target: target.into(),
            },
        )
    }

    /// Create or replace a hard link
    pub fn hardlink(&mut self, path: &str, target: impl Into<String>) -> Result<()> {
        self.insert(
            path,
            TreeNode::Hardlink {
                target: target.into(),
            },
        )
    }

    /// Look up a node without following symlinks
    pub fn open_path(&self, path: &str) -> Option<&TreeNode> {
        let mut node = &self.root;

        for component in Self::components(path) {
            let TreeNode::Directory { entries, .. } = node else {
                return None;
            };
            node = entries.get(component)?;
        }

        Some(node)
    }

    /// Total bytes of regular file content
    pub fn total_size(&self) -> u64 {
        fn walk(node: &TreeNode) -> u64 {
            match node {
                TreeNode::File { content, .. } => content.len() as u64,
                TreeNode::Directory { entries, .. } => entries.values().map(walk).sum(),
                _ => 0,
            }
        }
        walk(&self.root)
    }

    /// Visit every node depth-first in deterministic (sorted) order
    ///
    /// The callback receives absolute paths without a leading slash,
    /// directories before their contents.
    pub fn walk<'a>(&'a self, mut visit: impl FnMut(&str, &'a TreeNode)) {
        fn recurse<'a>(
            prefix: &str,
            node: &'a TreeNode,
            visit: &mut impl FnMut(&str, &'a TreeNode),
        ) {
            if let TreeNode::Directory { entries, .. } = node {
                for (name, child) in entries {
                    let path = if prefix.is_empty() {
                        name.clone()
                    } else {
                        format!("{}/{}", prefix, name)
                    };
                    visit(&path, child);
                    recurse(&path, child, visit);
                }
            }
        }
        recurse("", &self.root, &mut visit);
    }
}
