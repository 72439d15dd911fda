// src/assembler/archive.rs

//! Archive extraction into the virtual tree, and tar serialization out
//! of it
//!
//! Extraction preserves mode, uid/gid, and mtime, materializes symlinks
//! and hard links, and overwrites earlier entries (last write wins).
//! Serialization walks the tree in its deterministic order, so a given
//! tree always produces the same tar stream.

use crate::assembler::tree::{NodeMeta, TreeNode, VirtualTree};
use crate::compression::{create_decoder, CompressionFormat};
use crate::error::{Error, Result};
use std::io::{Read, Write};
use std::path::PathBuf;

fn archive_error(e: impl std::fmt::Display) -> Error {
    Error::Parse {
        what: "archive".into(),
        reason: e.to_string(),
    }
}

/// Extract a tar stream into the tree under `target_prefix`
pub fn extract_tar(
    tree: &mut VirtualTree,
    reader: impl Read,
    target_prefix: &str,
) -> Result<usize> {
    let mut archive = tar::Archive::new(reader);
    let mut count = 0;

    for entry in archive.entries().map_err(archive_error)? {
        let mut entry = entry.map_err(archive_error)?;

        let raw_path = entry.path().map_err(archive_error)?;
        let name = raw_path.to_string_lossy().into_owned();
        let name = name.trim_start_matches("./").trim_end_matches('/');
        if name.is_empty() {
            continue;
        }
        let guest_path = join_prefix(target_prefix, name);

        let header = entry.header();
        let meta = NodeMeta {
            mode: header.mode().map_err(archive_error)?,
            uid: header.uid().map_err(archive_error)?,
            gid: header.gid().map_err(archive_error)?,
            mtime: header.mtime().map_err(archive_error)?,
        };

        match header.entry_type() {
            tar::EntryType::Directory => {
                tree.mkdir_with_meta(&guest_path, meta)?;
            }
            tar::EntryType::Regular | tar::EntryType::Continuous => {
                let mut content = Vec::with_capacity(entry.size() as usize);
                entry.read_to_end(&mut content)?;
                tree.create_file(&guest_path, content, meta)?;
            }
            tar::EntryType::Symlink => {
                let target = link_target(&entry)?;
                tree.symlink(&guest_path, target, meta)?;
            }
            tar::EntryType::Link => {
                let target = link_target(&entry)?;
                tree.hardlink(&guest_path, join_prefix(target_prefix, &target))?;
            }
            // Devices, FIFOs, and friends have no representation in the
            // tree; skip them.
            _ => continue,
        }

        count += 1;
    }

    Ok(count)
}

fn link_target(entry: &tar::Entry<'_, impl Read>) -> Result<String> {
    let target: Option<PathBuf> = entry
        .link_name()
        .map_err(archive_error)?
        .map(|c| c.into_owned());
    target
        .map(|p| p.to_string_lossy().into_owned())
        .ok_or_else(|| archive_error("link entry without target"))
}

fn join_prefix(prefix: &str, name: &str) -> String {
    let prefix = prefix.trim_matches('/');
    if prefix.is_empty() {
        format!("/{}", name)
    } else {
        format!("/{}/{}", prefix, name)
    }
}

/// Decompress an archive using the format hint, falling back to magic
/// bytes when the hint is absent or unknown
///
/// The result is the raw tar stream; normalizing a `ReadArchive`
/// definition is exactly this decompression.
pub fn decompress_archive<'a>(data: &'a [u8], format_hint: &str) -> Result<Box<dyn Read + 'a>> {
    let format = match CompressionFormat::from_extension(format_hint) {
        CompressionFormat::None => CompressionFormat::from_magic_bytes(data),
        known => known,
    };
    create_decoder(data, format)
}

/// Serialize the tree as a tar stream
pub fn write_tar(tree: &VirtualTree, writer: impl Write) -> Result<()> {
    let mut builder = tar::Builder::new(writer);

    let mut result = Ok(());
    tree.walk(|path, node| {
        if result.is_err() {
            return;
        }
        result = append_node(&mut builder, path, node);
    });
    result?;

    builder.finish().map_err(Error::Io)?;
    Ok(())
}

fn append_node(
    builder: &mut tar::Builder<impl Write>,
    path: &str,
    node: &TreeNode,
) -> Result<()> {
    let mut header = tar::Header::new_gnu();

    match node {
        TreeNode::Directory { meta, .. } => {
            header.set_entry_type(tar::EntryType::Directory);
            set_meta(&mut header, meta);
            header.set_size(0);
            builder
                .append_data(&mut header, format!("{}/", path), std::io::empty())
                .map_err(Error::Io)?;
        }
        TreeNode::File { meta, content } => {
            header.set_entry_type(tar::EntryType::Regular);
            set_meta(&mut header, meta);
            header.set_size(content.len() as u64);
            builder
                .append_data(&mut header, path, content.as_slice())
                .map_err(Error::Io)?;
        }
        TreeNode::Symlink { meta, target } => {
            header.set_entry_type(tar::EntryType::Symlink);
            set_meta(&mut header, meta);
            header.set_size(0);
            builder
                .append_link(&mut header, path, target)
                .map_err(Error::Io)?;
        }
        TreeNode::Hardlink { target } => {
            header.set_entry_type(tar::EntryType::Link);
            set_meta(&mut header, &NodeMeta::file());
            header.set_size(0);
            builder
                .append_link(&mut header, path, target.trim_start_matches('/'))
                .map_err(Error::Io)?;
        }
    }

    Ok(())
}

fn set_meta(header: &mut tar::Header, meta: &NodeMeta) {
    header.set_mode(meta.mode);
    header.set_uid(meta.uid);
    header.set_gid(meta.gid);
    header.set_mtime(meta.mtime);
}
