// src/repo/alpine.rs

//! Alpine Linux APKINDEX fetcher
//!
//! Downloads `APKINDEX.tar.gz` for each configured repository, extracts
//! the `APKINDEX` member, and parses its single-letter record lines.
//! Blocks are separated by blank lines; the fields used here are
//! `P` (name), `V` (version), `A` (arch), `S`/`I` (sizes), `T`
//! (description), `L` (license), `D` (depends), and `p` (provides).

use crate::compression::{decompress, CompressionFormat};
use crate::definition::Definition;
use crate::error::{Error, Result};
use crate::fetch::FetchOptions;
use crate::model::{PackageName, PackageQuery};
use crate::repo::{FetchContext, IndexFetcher, RepositorySink};
use std::collections::BTreeMap;
use std::io::Read;
use std::time::Duration;
use tracing::debug;

/// Refresh the index at most once a day
const INDEX_EXPIRE: Duration = Duration::from_secs(24 * 60 * 60);

pub struct AlpineFetcher {
    /// Mirror base, e.g. `mirror://alpine`
    pub mirror: String,
    /// Release branch, e.g. `v3.20`
    pub version: String,
    /// Repository components, e.g. `main`, `community`
    pub repositories: Vec<String>,
}

impl AlpineFetcher {
    pub fn new(mirror: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            mirror: mirror.into(),
            version: version.into(),
            repositories: vec!["main".into(), "community".into()],
        }
    }

    fn index_url(&self, repository: &str, arch: &str) -> String {
        format!(
            "{}/{}/{}/{}/APKINDEX.tar.gz",
            self.mirror, self.version, repository, arch
        )
    }

    fn package_url(&self, repository: &str, arch: &str, name: &str, version: &str) -> String {
        format!(
            "{}/{}/{}/{}/{}-{}.apk",
            self.mirror, self.version, repository, arch, name, version
        )
    }
}

impl IndexFetcher for AlpineFetcher {
    fn distro(&self) -> &str {
        "alpine"
    }

    fn load(&self, ctx: &FetchContext<'_>, sink: &mut RepositorySink) -> Result<()> {
        for repository in &self.repositories {
            ctx.cancel.check()?;

            let url = self.index_url(repository, &ctx.architecture);
            let opts = FetchOptions {
                use_etag: true,
                fast: true,
                expire_time: Some(INDEX_EXPIRE),
                ..Default::default()
            };

            let Some(mut fetched) = ctx.http.fetch(&url, &opts, &ctx.cancel)? else {
                return Err(Error::NotFound(format!("APKINDEX at {}", url)));
            };

            let mut compressed = Vec::new();
            fetched.file.read_to_end(&mut compressed)?;
            let index = extract_apkindex(&compressed)?;

            let count = parse_apkindex(&index, |record| {
                self.emit(sink, record, repository, &ctx.architecture)
            })?;

            debug!(repository = %repository, packages = count, "parsed APKINDEX");
        }

        Ok(())
    }
}

impl AlpineFetcher {
    fn emit(
        &self,
        sink: &mut RepositorySink,
        record: &BTreeMap<char, Vec<String>>,
        repository: &str,
        arch: &str,
    ) -> Result<()> {
        let name = field(record, 'P')?;
        let version = field(record, 'V')?;

        let pkg_name = PackageName::new(&name, &version)
            .with_architecture(field(record, 'A').unwrap_or_else(|_| arch.to_string()))
            .with_namespace("alpine")
            .with_tags(vec![repository.to_string()]);

        let mut builder = sink.add_package(pkg_name).source(Definition::FetchHttp {
            url: self.package_url(repository, arch, &name, &version),
            expected_size: field(record, 'S').ok().and_then(|s| s.parse().ok()),
            accept: None,
        });

        if let Ok(description) = field(record, 'T') {
            builder = builder.description(description);
        }
        if let Ok(license) = field(record, 'L') {
            builder = builder.license(license);
        }
        if let Ok(size) = field(record, 'S') {
            if let Ok(size) = size.parse() {
                builder = builder.size(size);
            }
        }
        if let Ok(installed) = field(record, 'I') {
            if let Ok(installed) = installed.parse() {
                builder = builder.installed_size(installed);
            }
        }

        for dep in record.get(&'D').map(Vec::as_slice).unwrap_or(&[]) {
            for item in dep.split_whitespace() {
                match parse_apk_dependency(item) {
                    ApkDependency::Conflict(query) => builder = builder.conflict(vec![query]),
                    ApkDependency::Requires(query) => {
                        builder = builder.depends_group(vec![query])
                    }
                }
            }
        }

        for provides in record.get(&'p').map(Vec::as_slice).unwrap_or(&[]) {
            for item in provides.split_whitespace() {
                builder = builder.alias(vec![parse_apk_provide(item)]);
            }
        }

        sink.push(builder.finish());
        Ok(())
    }
}

/// Gunzip the index archive and pull out the `APKINDEX` member
fn extract_apkindex(compressed: &[u8]) -> Result<String> {
    let tar_bytes = decompress(compressed, CompressionFormat::Gzip)?;
    let mut archive = tar::Archive::new(tar_bytes.as_slice());

    for entry in archive.entries().map_err(|e| Error::Parse {
        what: "APKINDEX.tar.gz".into(),
        reason: e.to_string(),
    })? {
        let mut entry = entry.map_err(|e| Error::Parse {
            what: "APKINDEX.tar.gz".into(),
            reason: e.to_string(),
        })?;

        let is_index = entry
            .path()
            .map(|p| p.as_os_str() == "APKINDEX")
            .unwrap_or(false);
        if is_index {
            let mut contents = String::new();
            entry.read_to_string(&mut contents)?;
            return Ok(contents);
        }
    }

    Err(Error::Parse {
        what: "APKINDEX.tar.gz".into(),
        reason: "no APKINDEX member in archive".into(),
    })
}

/// Walk APKINDEX blocks, invoking `emit` per record; returns the count
fn parse_apkindex(
    index: &str,
    mut emit: impl FnMut(&BTreeMap<char, Vec<String>>) -> Result<()>,
) -> Result<usize> {
    let mut record: BTreeMap<char, Vec<String>> = BTreeMap::new();
    let mut count = 0;

    for line in index.lines().chain(std::iter::once("")) {
        if line.is_empty() {
            if !record.is_empty() {
                emit(&record)?;
                count += 1;
                record.clear();
            }
            continue;
        }

        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let mut chars = key.chars();
        let (Some(key), None) = (chars.next(), chars.next()) else {
            continue;
        };

        record.entry(key).or_default().push(value.to_string());
    }

    Ok(count)
}

fn field(record: &BTreeMap<char, Vec<String>>, key: char) -> Result<String> {
    record
        .get(&key)
        .and_then(|values| values.first())
        .cloned()
        .ok_or_else(|| Error::Parse {
            what: "APKINDEX record".into(),
            reason: format!("missing {}: field", key),
        })
}

enum ApkDependency {
    Requires(PackageQuery),
    Conflict(PackageQuery),
}

/// Parse one `D:` item: `musl>=1.2`, `so:libc.musl-x86_64.so.1`,
/// `!incompatible-pkg`
fn parse_apk_dependency(item: &str) -> ApkDependency {
    if let Some(rest) = item.strip_prefix('!') {
        return ApkDependency::Conflict(split_constraint(rest));
    }
    ApkDependency::Requires(split_constraint(item))
}

/// Parse one `p:` item: `cmd:busybox=1.36.1-r5`, `/bin/sh`
fn parse_apk_provide(item: &str) -> PackageQuery {
    split_constraint(item)
}

/// Split `name<op>version` without disturbing `:` inside provide names
///
/// apk's `>` and `<=` don't exist in the query grammar; they normalize to
/// the nearest representable bound.
fn split_constraint(item: &str) -> PackageQuery {
    for (op, mapped) in [(">=", ">="), ("<=", "<"), ("=", "="), ("<", "<"), (">", ">=")] {
        if let Some(pos) = item.find(op) {
            let (name, rest) = item.split_at(pos);
            let version = &rest[op.len()..];
            if !name.is_empty() && !version.is_empty() {
                let mut query =
                    PackageQuery::with_version(name, format!("{}{}", mapped, version));
                query.namespace = "alpine".into();
                return query;
            }
        }
    }

    let mut query = PackageQuery::any(item);
    query.namespace = "alpine".into();
    query
}
