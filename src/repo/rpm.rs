// src/repo/rpm.rs

//! RPM repodata fetcher (Fedora, openSUSE, and friends)
//!
//! Reads `repodata/repomd.xml` to locate the primary metadata, downloads
//! and decompresses it, then scans `<package>` elements for name,
//! epoch/version/release, architecture, location, and the
//! `rpm:requires`/`rpm:provides`/`rpm:conflicts` entry lists.
//!
//! The scanning here is a deliberately small subset of XML: repodata is
//! machine-generated with one known shape, so matching tags and
//! attributes textually keeps the dependency surface flat.

use crate::compression::decompress_auto;
use crate::definition::Definition;
use crate::error::{Error, Result};
use crate::fetch::FetchOptions;
use crate::model::{PackageName, PackageQuery, QueryGroup};
use crate::repo::{FetchContext, IndexFetcher, RepositorySink};
use std::io::Read;
use std::time::Duration;
use tracing::debug;

const INDEX_EXPIRE: Duration = Duration::from_secs(24 * 60 * 60);

pub struct RpmFetcher {
    /// Mirror base, e.g. `mirror://fedora`
    pub mirror: String,
    /// Distribution namespace recorded on packages
    pub namespace: String,
}

impl RpmFetcher {
    pub fn new(mirror: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            mirror: mirror.into(),
            namespace: namespace.into(),
        }
    }
}

impl IndexFetcher for RpmFetcher {
    fn distro(&self) -> &str {
        "rpm"
    }

    fn load(&self, ctx: &FetchContext<'_>, sink: &mut RepositorySink) -> Result<()> {
        let opts = FetchOptions {
            use_etag: true,
            fast: true,
            expire_time: Some(INDEX_EXPIRE),
            ..Default::default()
        };

        let repomd_url = format!("{}/repodata/repomd.xml", self.mirror);
        let Some(mut fetched) = ctx.http.fetch(&repomd_url, &opts, &ctx.cancel)? else {
            return Err(Error::NotFound(format!("repomd.xml at {}", repomd_url)));
        };

        let mut repomd = String::new();
        fetched.file.read_to_string(&mut repomd)?;

        let primary_href = find_primary_href(&repomd).ok_or_else(|| Error::Parse {
            what: "repomd.xml".into(),
            reason: "no primary data entry".into(),
        })?;

        let primary_url = format!("{}/{}", self.mirror, primary_href);
        let Some(mut fetched) = ctx.http.fetch(&primary_url, &opts, &ctx.cancel)? else {
            return Err(Error::NotFound(format!("primary metadata at {}", primary_url)));
        };

        let mut compressed = Vec::new();
        fetched.file.read_to_end(&mut compressed)?;
        let primary = String::from_utf8(decompress_auto(&compressed)?).map_err(|e| {
            Error::Parse {
                what: "primary.xml".into(),
                reason: e.to_string(),
            }
        })?;

        let count = parse_primary(&primary, &ctx.architecture, |record| {
            self.emit(sink, record)
        })?;

        debug!(packages = count, "parsed primary.xml");
        Ok(())
    }
}

impl RpmFetcher {
    fn emit(&self, sink: &mut RepositorySink, record: PrimaryRecord) -> Result<()> {
        let version = if record.epoch.is_empty() || record.epoch == "0" {
            format!("{}-{}", record.version, record.release)
        } else {
            format!("{}:{}-{}", record.epoch, record.version, record.release)
        };

        let pkg_name = PackageName::new(&record.name, version)
            .with_architecture(&record.arch)
            .with_namespace(&self.namespace);

        let mut builder = sink
            .add_package(pkg_name)
            .description(record.summary.clone());

        if !record.location.is_empty() {
            builder = builder.source(Definition::FetchHttp {
                url: format!("{}/{}", self.mirror, record.location),
                expected_size: record.size,
                accept: None,
            });
        }
        if let Some(size) = record.size {
            builder = builder.size(size);
        }

        for entry in &record.requires {
            builder = builder.depends_group(vec![self.entry_query(entry)]);
        }
        for entry in &record.provides {
            builder = builder.alias(vec![self.entry_query(entry)]);
        }
        for entry in &record.conflicts {
            builder = builder.conflict(vec![self.entry_query(entry)]);
        }

        sink.push(builder.finish());
        Ok(())
    }

    fn entry_query(&self, entry: &RpmEntry) -> PackageQuery {
        let mut query = match (&entry.flags, &entry.version) {
            (Some(flags), Some(version)) => {
                let op = match flags.as_str() {
                    "GE" | "GT" => ">=",
                    "LE" | "LT" => "<",
                    _ => "=",
                };
                PackageQuery::with_version(&entry.name, format!("{}{}", op, version))
            }
            _ => PackageQuery::any(&entry.name),
        };
        query.namespace = self.namespace.clone();
        query
    }
}

/// Locate the primary metadata href inside repomd.xml
fn find_primary_href(repomd: &str) -> Option<String> {
    for block in tag_blocks(repomd, "data") {
        if attr_value(&block.open_tag, "type").as_deref() != Some("primary") {
            continue;
        }
        for location in tag_blocks(&block.body, "location") {
            if let Some(href) = attr_value(&location.open_tag, "href") {
                return Some(href);
            }
        }
    }
    None
}

#[derive(Debug, Default)]
struct PrimaryRecord {
    name: String,
    arch: String,
    epoch: String,
    version: String,
    release: String,
    summary: String,
    location: String,
    size: Option<u64>,
    requires: Vec<RpmEntry>,
    provides: Vec<RpmEntry>,
    conflicts: Vec<RpmEntry>,
}

#[derive(Debug)]
struct RpmEntry {
    name: String,
    flags: Option<String>,
    version: Option<String>,
}

/// Scan `<package>` elements, filtering by architecture
///
/// `noarch` packages always match.
fn parse_primary(
    primary: &str,
    architecture: &str,
    mut emit: impl FnMut(PrimaryRecord) -> Result<()>,
) -> Result<usize> {
    let mut count = 0;

    for block in tag_blocks(primary, "package") {
        let mut record = PrimaryRecord {
            name: tag_text(&block.body, "name").unwrap_or_default(),
            arch: tag_text(&block.body, "arch").unwrap_or_default(),
            summary: tag_text(&block.body, "summary").unwrap_or_default(),
            ..Default::default()
        };

        if !record.arch.is_empty() && record.arch != architecture && record.arch != "noarch" {
            continue;
        }

        if let Some(version_tag) = first_tag(&block.body, "version") {
            record.epoch = attr_value(&version_tag, "epoch").unwrap_or_default();
            record.version = attr_value(&version_tag, "ver").unwrap_or_default();
            record.release = attr_value(&version_tag, "rel").unwrap_or_default();
        }

        if let Some(location_tag) = first_tag(&block.body, "location") {
            record.location = attr_value(&location_tag, "href").unwrap_or_default();
        }

        if let Some(size_tag) = first_tag(&block.body, "size") {
            record.size = attr_value(&size_tag, "package").and_then(|s| s.parse().ok());
        }

        for requires in tag_blocks(&block.body, "rpm:requires") {
            record.requires = parse_entries(&requires.body);
        }
        for provides in tag_blocks(&block.body, "rpm:provides") {
            record.provides = parse_entries(&provides.body);
        }
        for conflicts in tag_blocks(&block.body, "rpm:conflicts") {
            record.conflicts = parse_entries(&conflicts.body);
        }

        if record.name.is_empty() {
            continue;
        }

        emit(record)?;
        count += 1;
    }

    Ok(count)
}

fn parse_entries(body: &str) -> Vec<RpmEntry> {
    let mut entries = Vec::new();

    for tag in all_tags(body, "rpm:entry") {
        let Some(name) = attr_value(&tag, "name") else {
            continue;
        };
        // File and rpmlib pseudo-dependencies don't resolve to packages.
        if name.starts_with('/') || name.starts_with("rpmlib(") {
            continue;
        }
        entries.push(RpmEntry {
            name,
            flags: attr_value(&tag, "flags"),
            version: attr_value(&tag, "ver"),
        });
    }

    entries
}

// --- minimal XML scanning helpers -----------------------------------------

struct TagBlock {
    open_tag: String,
    body: String,
}

/// All `<name ...>...</name>` blocks at any depth, textually scanned
fn tag_blocks(text: &str, name: &str) -> Vec<TagBlock> {
    let open_prefix = format!("<{}", name);
    let close = format!("</{}>", name);
    let mut blocks = Vec::new();
    let mut search_from = 0;

    while let Some(rel_start) = text[search_from..].find(&open_prefix) {
        let start = search_from + rel_start;
        let after_name = start + open_prefix.len();

        // Reject prefix matches like <packager> when scanning for <package>.
        match text[after_name..].chars().next() {
            Some(c) if c == ' ' || c == '>' || c == '\t' || c == '\n' || c == '/' => {}
            _ => {
                search_from = after_name;
                continue;
            }
        }

        let Some(tag_end_rel) = text[start..].find('>') else {
            break;
        };
        let tag_end = start + tag_end_rel;
        let open_tag = text[start..=tag_end].to_string();

        if open_tag.ends_with("/>") {
            blocks.push(TagBlock {
                open_tag,
                body: String::new(),
            });
            search_from = tag_end + 1;
            continue;
        }

        let Some(close_rel) = text[tag_end..].find(&close) else {
            break;
        };
        let close_start = tag_end + close_rel;
        blocks.push(TagBlock {
            open_tag,
            body: text[tag_end + 1..close_start].to_string(),
        });
        search_from = close_start + close.len();
    }

    blocks
}

/// The first opening tag `<name ...>` (or self-closing), as raw text
fn first_tag(text: &str, name: &str) -> Option<String> {
    all_tags(text, name).into_iter().next()
}

fn all_tags(text: &str, name: &str) -> Vec<String> {
    tag_blocks(text, name)
        .into_iter()
        .map(|b| b.open_tag)
        .collect()
}

/// Text content of the first `<name>text</name>` element
fn tag_text(text: &str, name: &str) -> Option<String> {
    tag_blocks(text, name)
        .into_iter()
        .next()
        .map(|b| b.body.trim().to_string())
        .filter(|s| !s.is_empty())
}

/// Value of `key="value"` inside an opening tag
fn attr_value(tag: &str, key: &str) -> Option<String> {
    let needle = format!("{}=\"", key);
    let start = tag.find(&needle)? + needle.len();
    let end = tag[start..].find('"')? + start;
    Some(tag[start..end].to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    const REPOMD: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<repomd xmlns="http://linux.duke.edu/metadata/repo">
  <data type="filelists">
    <location href="repodata/abc-filelists.xml.gz"/>
  </data>
  <data type="primary">
    <checksum type="sha256">abc123</checksum>
    <location href="repodata/abc-primary.xml.gz"/>
  </data>
</repomd>
"#;

    const PRIMARY: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<metadata xmlns="http://linux.duke.edu/metadata/common" xmlns:rpm="http://linux.duke.edu/metadata/rpm" packages="2">
<package type="rpm">
  <name>bash</name>
  <arch>x86_64</arch>
  <version epoch="0" ver="5.2.26" rel="3.fc40"/>
  <summary>The GNU Bourne Again shell</summary>
  <size package="1856529" installed="8594823"/>
  <location href="Packages/b/bash-5.2.26-3.fc40.x86_64.rpm"/>
  <format>
    <rpm:provides>
      <rpm:entry name="bash" flags="EQ" epoch="0" ver="5.2.26" rel="3.fc40"/>
      <rpm:entry name="/bin/bash"/>
    </rpm:provides>
    <rpm:requires>
      <rpm:entry name="glibc" flags="GE" ver="2.39"/>
      <rpm:entry name="rpmlib(CompressedFileNames)" flags="LE" ver="3.0.4-1"/>
      <rpm:entry name="ncurses-libs"/>
    </rpm:requires>
  </format>
</package>
<package type="rpm">
  <name>bash-doc</name>
  <arch>aarch64</arch>
  <version epoch="0" ver="5.2.26" rel="3.fc40"/>
  <summary>Documentation files for bash</summary>
  <location href="Packages/b/bash-doc-5.2.26-3.fc40.aarch64.rpm"/>
</package>
</metadata>
"#;

    #[test]
    fn test_find_primary_href() {
        assert_eq!(
            find_primary_href(REPOMD).unwrap(),
            "repodata/abc-primary.xml.gz"
        );
    }

    #[test]
    fn test_parse_primary_filters_architecture() {
        let mut records = Vec::new();
        let count = parse_primary(PRIMARY, "x86_64", |record| {
            records.push(record);
            Ok(())
        })
        .unwrap();

        // The aarch64 package is skipped.
        assert_eq!(count, 1);
        let bash = &records[0];
        assert_eq!(bash.name, "bash");
        assert_eq!(bash.version, "5.2.26");
        assert_eq!(bash.release, "3.fc40");
        assert_eq!(bash.location, "Packages/b/bash-5.2.26-3.fc40.x86_64.rpm");
        assert_eq!(bash.size, Some(1856529));
    }

    #[test]
    fn test_pseudo_dependencies_are_dropped() {
        let mut records = Vec::new();
        parse_primary(PRIMARY, "x86_64", |record| {
            records.push(record);
            Ok(())
        })
        .unwrap();

        let requires: Vec<&str> = records[0].requires.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(requires, vec!["glibc", "ncurses-libs"]);

        let provides: Vec<&str> = records[0].provides.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(provides, vec!["bash"]);
    }

    #[test]
    fn test_emit_packages() {
        let fetcher = RpmFetcher::new("mirror://fedora", "fedora");
        let mut sink = RepositorySink::new("rpm", false);

        parse_primary(PRIMARY, "x86_64", |record| fetcher.emit(&mut sink, record)).unwrap();

        let repo = sink.repository;
        let bash = repo.search(&PackageQuery::any("bash"), 10)[0];

        assert_eq!(bash.name.version, "5.2.26-3.fc40");
        assert_eq!(bash.name.architecture, "x86_64");
        assert_eq!(bash.depends.len(), 2);

        let glibc = &bash.depends[0][0];
        assert_eq!(glibc.name, "glibc");
        assert!(glibc.accepts_version("2.39"));
        assert!(!glibc.accepts_version("2.38"));

        match &bash.sources[0] {
            Definition::FetchHttp { url, .. } => {
                assert_eq!(
                    url,
                    "mirror://fedora/Packages/b/bash-5.2.26-3.fc40.x86_64.rpm"
                );
            }
            other => panic!("unexpected source {:?}", other),
        }
    }

    #[test]
    fn test_epoch_prefixes_version() {
        let fetcher = RpmFetcher::new("mirror://fedora", "fedora");
        let mut sink = RepositorySink::new("rpm", false);

        let record = PrimaryRecord {
            name: "dnf".into(),
            arch: "x86_64".into(),
            epoch: "1".into(),
            version: "4.19".into(),
            release: "1.fc40".into(),
            ..Default::default()
        };
        fetcher.emit(&mut sink, record).unwrap();

        let repo = sink.repository;
        let dnf = repo.search(&PackageQuery::any("dnf"), 10)[0];
        assert_eq!(dnf.name.version, "1:4.19-1.fc40");
    }

    #[test]
    fn test_attr_value() {
        assert_eq!(
            attr_value(r#"<location href="x/y.rpm"/>"#, "href").unwrap(),
            "x/y.rpm"
        );
        assert_eq!(attr_value(r#"<location/>"#, "href"), None);
    }

    #[test]
    fn test_tag_blocks_rejects_prefix_names() {
        let text = "<packager>someone</packager><package><name>x</name></package>";
        let blocks = tag_blocks(text, "package");
        assert_eq!(blocks.len(), 1);
        assert!(blocks[0].body.contains("<name>x</name>"));
    }

    #[test]
    fn test_entry_query_flag_mapping() {
        let fetcher = RpmFetcher::new("mirror://fedora", "fedora");
        let entry = RpmEntry {
            name: "glibc".into(),
            flags: Some("LT".into()),
            version: Some("3.0".into()),
        };
        let query = fetcher.entry_query(&entry);
        assert!(query.accepts_version("2.9"));
        assert!(!query.accepts_version("3.0"));
    }
}
