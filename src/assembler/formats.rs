// src/assembler/formats.rs

//! Package-archive normalization
//!
//! `ReadArchive` definitions turn heterogeneous package payloads into one
//! canonical form: an uncompressed tar stream with deterministic entry
//! order. Compressed tars (Alpine `.apk`, Arch `.pkg.tar.zst`, plain
//! tarballs) just decompress; Debian `.deb` files unwrap their `ar`
//! envelope to reach `data.tar.*`; RPMs parse through the `rpm` crate
//! and convert their compressed cpio payload.

use crate::assembler::archive::{decompress_archive, extract_tar, write_tar};
use crate::assembler::tree::{NodeMeta, VirtualTree};
use crate::compression::decompress_auto;
use crate::error::{Error, Result};
use std::io::{Cursor, Read};

fn format_error(what: &str, reason: impl std::fmt::Display) -> Error {
    Error::Parse {
        what: what.into(),
        reason: reason.to_string(),
    }
}

/// Normalize an archive into canonical tar bytes
///
/// The hint is a filename-ish string (`tar.gz`, `apk`, `deb`, `rpm`);
/// an empty or unknown hint falls back to magic-byte detection of a
/// compressed tar.
pub fn normalize_to_tar(data: &[u8], format_hint: &str) -> Result<Vec<u8>> {
    let mut virtual_tree = VirtualTree::new();

    if format_hint.ends_with("deb") {
        let payload = deb_payload(data)?;
        let tar = decompress_auto(&payload)?;
        extract_tar(&mut virtual_tree, tar.as_slice(), "/")?;
    } else if format_hint.ends_with("rpm") {
        let package = rpm::Package::parse(&mut Cursor::new(data))
            .map_err(|e| format_error("rpm package", e))?;
        let cpio = decompress_auto(&package.content)?;
        extract_cpio(&mut virtual_tree, cpio.as_slice())?;
    } else {
        let reader = decompress_archive(data, format_hint)?;
        extract_tar(&mut virtual_tree, reader, "/")?;
    }

    let mut out = Vec::new();
    write_tar(&virtual_tree, &mut out)?;
    Ok(out)
}

// ---------------------------------------------------------------------------
// ar envelopes (.deb)
// ---------------------------------------------------------------------------

const AR_MAGIC: &[u8] = b"!<arch>\n";
const AR_HEADER_SIZE: usize = 60;

/// Extract the `data.tar.*` member from a Debian package
pub fn deb_payload(data: &[u8]) -> Result<Vec<u8>> {
    if !data.starts_with(AR_MAGIC) {
        return Err(format_error("deb package", "missing ar magic"));
    }

    let mut offset = AR_MAGIC.len();

    while offset + AR_HEADER_SIZE <= data.len() {
        let header = &data[offset..offset + AR_HEADER_SIZE];
        offset += AR_HEADER_SIZE;

        let name = std::str::from_utf8(&header[0..16])
            .map_err(|e| format_error("deb package", e))?
            .trim_end();
        let size: usize = std::str::from_utf8(&header[48..58])
            .map_err(|e| format_error("deb package", e))?
            .trim_end()
            .parse()
            .map_err(|e| format_error("deb package", e))?;

        if offset + size > data.len() {
            return Err(format_error("deb package", "truncated ar member"));
        }

        if name.starts_with("data.tar") {
            return Ok(data[offset..offset + size].to_vec());
        }

        // Members are 2-byte aligned.
        offset += size + (size % 2);
    }

    Err(format_error("deb package", "no data.tar member"))
}

// ---------------------------------------------------------------------------
// cpio (newc) payloads
// ---------------------------------------------------------------------------

const CPIO_HEADER_SIZE: usize = 110;
const CPIO_MAGIC_NEWC: &[u8] = b"070701";
const CPIO_MAGIC_CRC: &[u8] = b"070702";

const MODE_TYPE_MASK: u32 = 0o170000;
const MODE_DIRECTORY: u32 = 0o040000;
const MODE_REGULAR: u32 = 0o100000;
const MODE_SYMLINK: u32 = 0o120000;

struct CpioEntry {
    name: String,
    mode: u32,
    uid: u32,
    gid: u32,
    mtime: u64,
    content: Vec<u8>,
}

/// Extract a newc cpio archive into the tree
pub fn extract_cpio(virtual_tree: &mut VirtualTree, mut reader: impl Read) -> Result<usize> {
    let mut count = 0;

    while let Some(entry) = next_cpio_entry(&mut reader)? {
        // RPM payload names are "./path"; normalize to absolute.
        let name = entry.name.trim_start_matches('.').trim_start_matches('/');
        if name.is_empty() {
            continue;
        }
        let path = format!("/{}", name);

        let meta = NodeMeta {
            mode: entry.mode & 0o7777,
            uid: entry.uid as u64,
            gid: entry.gid as u64,
            mtime: entry.mtime,
        };

        match entry.mode & MODE_TYPE_MASK {
            MODE_DIRECTORY => virtual_tree.mkdir_with_meta(&path, meta)?,
            MODE_REGULAR => virtual_tree.create_file(&path, entry.content, meta)?,
            MODE_SYMLINK => {
                let target = String::from_utf8_lossy(&entry.content).into_owned();
                virtual_tree.symlink(&path, target, meta)?;
            }
            _ => continue,
        }

        count += 1;
    }

    Ok(count)
}

fn next_cpio_entry(reader: &mut impl Read) -> Result<Option<CpioEntry>> {
    let mut header = [0u8; CPIO_HEADER_SIZE];
    match reader.read_exact(&mut header) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(Error::Io(e)),
    }

    let magic = &header[0..6];
    if magic != CPIO_MAGIC_NEWC && magic != CPIO_MAGIC_CRC {
        return Err(format_error(
            "cpio payload",
            format!("bad magic {:?}", String::from_utf8_lossy(magic)),
        ));
    }

    let parse_hex = |start: usize| -> Result<u32> {
        let text = std::str::from_utf8(&header[start..start + 8])
            .map_err(|e| format_error("cpio payload", e))?;
        u32::from_str_radix(text, 16).map_err(|e| format_error("cpio payload", e))
    };

    let mode = parse_hex(14)?;
    let uid = parse_hex(22)?;
    let gid = parse_hex(30)?;
    let mtime = parse_hex(46)? as u64;
    let filesize = parse_hex(54)? as usize;
    let namesize = parse_hex(94)? as usize;

    let mut name_buf = vec![0u8; namesize];
    reader.read_exact(&mut name_buf)?;
    if name_buf.last() == Some(&0) {
        name_buf.pop();
    }
    let name = String::from_utf8_lossy(&name_buf).into_owned();

    if name == "TRAILER!!!" {
        return Ok(None);
    }

    // Names and contents are 4-byte aligned.
    skip_padding(reader, (CPIO_HEADER_SIZE + namesize) % 4)?;

    let mut content = vec![0u8; filesize];
    reader.read_exact(&mut content)?;
    skip_padding(reader, filesize % 4)?;

    Ok(Some(CpioEntry {
        name,
        mode,
        uid,
        gid,
        mtime,
        content,
    }))
}

fn skip_padding(reader: &mut impl Read, used: usize) -> Result<()> {
    let pad = (4 - used % 4) % 4;
    if pad > 0 {
        let mut skip = [0u8; 3];
        reader.read_exact(&mut skip[..pad])?;
    }
    Ok(())
}
