// src/repo/archlinux.rs

//! Arch Linux pacman database fetcher
//!
//! Downloads `<repo>.db` (a compressed tar of `<name>-<version>/desc`
//! files) and parses the `%SECTION%` format: a section header line
//! followed by one value per line until a blank line.

use crate::compression::{create_decoder, CompressionFormat};
use crate::definition::Definition;
use crate::error::{Error, Result};
use crate::fetch::FetchOptions;
use crate::model::{PackageName, PackageQuery};
use crate::repo::{FetchContext, IndexFetcher, RepositorySink};
use std::collections::BTreeMap;
use std::io::Read;
use std::time::Duration;
use tracing::debug;

const INDEX_EXPIRE: Duration = Duration::from_secs(24 * 60 * 60);

pub struct ArchFetcher {
    /// Mirror base, e.g. `mirror://archlinux`
    pub mirror: String,
    /// Database names, e.g. `core`, `extra`
    pub repositories: Vec<String>,
}

impl ArchFetcher {
    pub fn new(mirror: impl Into<String>) -> Self {
        Self {
            mirror: mirror.into(),
            repositories: vec!["core".into(), "extra".into()],
        }
    }

    fn db_url(&self, repository: &str, arch: &str) -> String {
        format!("{}/{}/os/{}/{}.db", self.mirror, repository, arch, repository)
    }

    fn package_url(&self, repository: &str, arch: &str, filename: &str) -> String {
        format!("{}/{}/os/{}/{}", self.mirror, repository, arch, filename)
    }
}

impl IndexFetcher for ArchFetcher {
    fn distro(&self) -> &str {
        "archlinux"
    }

    fn load(&self, ctx: &FetchContext<'_>, sink: &mut RepositorySink) -> Result<()> {
        for repository in &self.repositories {
            ctx.cancel.check()?;

            let url = self.db_url(repository, &ctx.architecture);
            let opts = FetchOptions {
                use_etag: true,
                fast: true,
                expire_time: Some(INDEX_EXPIRE),
                ..Default::default()
            };

            let Some(mut fetched) = ctx.http.fetch(&url, &opts, &ctx.cancel)? else {
                return Err(Error::NotFound(format!("pacman database at {}", url)));
            };

            let mut compressed = Vec::new();
            fetched.file.read_to_end(&mut compressed)?;

            let count = parse_pacman_db(&compressed, |desc| {
                self.emit(sink, desc, repository, &ctx.architecture)
            })?;

            debug!(repository = %repository, packages = count, "parsed pacman database");
        }

        Ok(())
    }
}

impl ArchFetcher {
    fn emit(
        &self,
        sink: &mut RepositorySink,
        desc: &BTreeMap<String, Vec<String>>,
        repository: &str,
        arch: &str,
    ) -> Result<()> {
        let name = first(desc, "NAME")?;
        let version = first(desc, "VERSION")?;

        let pkg_name = PackageName::new(&name, &version)
            .with_architecture(first(desc, "ARCH").unwrap_or_else(|_| arch.to_string()))
            .with_namespace("archlinux")
            .with_tags(vec![repository.to_string()]);

        let mut builder = sink.add_package(pkg_name);

        if let Ok(filename) = first(desc, "FILENAME") {
            builder = builder.source(Definition::FetchHttp {
                url: self.package_url(repository, arch, &filename),
                expected_size: first(desc, "CSIZE").ok().and_then(|s| s.parse().ok()),
                accept: None,
            });
        }
        if let Ok(description) = first(desc, "DESC") {
            builder = builder.description(description);
        }
        if let Ok(license) = first(desc, "LICENSE") {
            builder = builder.license(license);
        }
        if let Ok(size) = first(desc, "CSIZE") {
            if let Ok(size) = size.parse() {
                builder = builder.size(size);
            }
        }
        if let Ok(size) = first(desc, "ISIZE") {
            if let Ok(size) = size.parse() {
                builder = builder.installed_size(size);
            }
        }

        for dep in desc.get("DEPENDS").map(Vec::as_slice).unwrap_or(&[]) {
            builder = builder.depends_group(vec![parse_pacman_relation(dep)]);
        }
        for dep in desc.get("OPTDEPENDS").map(Vec::as_slice).unwrap_or(&[]) {
            // Entries look like "package: reason"; optional means recommended.
            let name = dep.split(':').next().unwrap_or(dep).trim();
            if name.is_empty() {
                continue;
            }
            let mut query = parse_pacman_relation(name);
            query.recommended = true;
            builder = builder.depends_group(vec![query]);
        }
        for provide in desc.get("PROVIDES").map(Vec::as_slice).unwrap_or(&[]) {
            builder = builder.alias(vec![parse_pacman_relation(provide)]);
        }
        for conflict in desc.get("CONFLICTS").map(Vec::as_slice).unwrap_or(&[]) {
            builder = builder.conflict(vec![parse_pacman_relation(conflict)]);
        }

        sink.push(builder.finish());
        Ok(())
    }
}

/// Decompress the database and parse every `desc` member
fn parse_pacman_db(
    compressed: &[u8],
    mut emit: impl FnMut(&BTreeMap<String, Vec<String>>) -> Result<()>,
) -> Result<usize> {
    let format = CompressionFormat::from_magic_bytes(compressed);
    let reader = create_decoder(compressed, format)?;
    let mut archive = tar::Archive::new(reader);
    let mut count = 0;

    for entry in archive.entries().map_err(|e| Error::Parse {
        what: "pacman database".into(),
        reason: e.to_string(),
    })? {
        let mut entry = entry.map_err(|e| Error::Parse {
            what: "pacman database".into(),
            reason: e.to_string(),
        })?;

        let is_desc = entry
            .path()
            .map(|p| p.file_name().map(|n| n == "desc").unwrap_or(false))
            .unwrap_or(false);
        if !is_desc {
            continue;
        }

        let mut contents = String::new();
        entry.read_to_string(&mut contents)?;
        emit(&parse_desc(&contents))?;
        count += 1;
    }

    Ok(count)
}

/// Parse one `desc` file into `%SECTION%` → values
fn parse_desc(contents: &str) -> BTreeMap<String, Vec<String>> {
    let mut sections: BTreeMap<String, Vec<String>> = BTreeMap::new();
    let mut current: Option<String> = None;

    for line in contents.lines() {
        if line.is_empty() {
            current = None;
            continue;
        }

        if let Some(section) = line.strip_prefix('%').and_then(|l| l.strip_suffix('%')) {
            current = Some(section.to_string());
            sections.entry(section.to_string()).or_default();
            continue;
        }

        if let Some(section) = &current {
            sections
                .get_mut(section)
                .expect("section exists once named")
                .push(line.to_string());
        }
    }

    sections
}

fn first(desc: &BTreeMap<String, Vec<String>>, key: &str) -> Result<String> {
    desc.get(key)
        .and_then(|values| values.first())
        .cloned()
        .ok_or_else(|| Error::Parse {
            what: "desc file".into(),
            reason: format!("missing %{}% section", key),
        })
}

/// Parse `name`, `name>=1.2`, or `name=1.2` relations
fn parse_pacman_relation(text: &str) -> PackageQuery {
    for (op, mapped) in [(">=", ">="), ("<=", "<"), ("=", "="), ("<", "<"), (">", ">=")] {
        if let Some(pos) = text.find(op) {
            let (name, rest) = text.split_at(pos);
            let version = &rest[op.len()..];
            if !name.is_empty() && !version.is_empty() {
                let mut query =
                    PackageQuery::with_version(name, format!("{}{}", mapped, version));
                query.namespace = "archlinux".into();
                return query;
            }
        }
    }

    let mut query = PackageQuery::any(text);
    query.namespace = "archlinux".into();
    query
}
