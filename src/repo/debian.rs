// src/repo/debian.rs

//! Debian/Ubuntu `Packages` index fetcher
//!
//! Downloads `dists/<release>/<component>/binary-<arch>/Packages.gz` and
//! parses its RFC 822 stanzas. `Depends` alternatives (`a | b`) become
//! option groups; `Recommends` become groups whose single option carries
//! the recommended flag; `Provides` become aliases.

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

pub struct DebianFetcher {
    /// Mirror base, e.g. `mirror://debian`
    pub mirror: String,
    /// Release name, e.g. `bookworm`
    pub release: String,
    /// Archive components, e.g. `main`
    pub components: Vec<String>,
    /// Distribution namespace recorded on packages (`debian` or `ubuntu`)
    pub namespace: String,
}

impl DebianFetcher {
    pub fn new(mirror: impl Into<String>, release: impl Into<String>) -> Self {
        Self {
            mirror: mirror.into(),
            release: release.into(),
            components: vec!["main".into()],
            namespace: "debian".into(),
        }
    }

    fn index_url(&self, component: &str, arch: &str) -> String {
        format!(
            "{}/dists/{}/{}/binary-{}/Packages.gz",
            self.mirror, self.release, component, debian_arch(arch)
        )
    }
}

/// Debian spells architectures differently from the kernel
fn debian_arch(arch: &str) -> &str {
    match arch {
        "x86_64" => "amd64",
        "aarch64" => "arm64",
        other => other,
    }
}

impl IndexFetcher for DebianFetcher {
    fn distro(&self) -> &str {
        "debian"
    }

    fn load(&self, ctx: &FetchContext<'_>, sink: &mut RepositorySink) -> Result<()> {
        for component in &self.components {
            ctx.cancel.check()?;

            let url = self.index_url(component, &ctx.architecture);
            let opts = FetchOptions {
                use_etag: true,
                fast: true,
                expire_time: Some(INDEX_EXPIRE),
                ..Default::default()
            };

            let Some(mut fetched) = ctx.http.fetch(&url, &opts, &ctx.cancel)? else {
                return Err(Error::NotFound(format!("Packages index at {}", url)));
            };

            let mut compressed = Vec::new();
            fetched.file.read_to_end(&mut compressed)?;
            let index = String::from_utf8(decompress_auto(&compressed)?).map_err(|e| {
                Error::Parse {
                    what: "Packages index".into(),
                    reason: e.to_string(),
                }
            })?;

            let count = parse_packages_index(&index, |stanza| {
                self.emit(sink, stanza, component)
            })?;

            debug!(component = %component, packages = count, "parsed Packages index");
        }

        Ok(())
    }
}

impl DebianFetcher {
    fn emit(&self, sink: &mut RepositorySink, stanza: &Stanza, component: &str) -> Result<()> {
        let name = stanza.required("Package")?;
        let version = stanza.required("Version")?;

        let pkg_name = PackageName::new(&name, &version)
            .with_architecture(stanza.get("Architecture").unwrap_or_default())
            .with_namespace(&self.namespace)
            .with_tags(vec![component.to_string()]);

        let mut builder = sink.add_package(pkg_name);

        if let Some(filename) = stanza.get("Filename") {
            builder = builder.source(Definition::FetchHttp {
                url: format!("{}/{}", self.mirror, filename),
                expected_size: stanza.get("Size").and_then(|s| s.parse().ok()),
                accept: None,
            });
        }

        if let Some(description) = stanza.get("Description") {
            builder = builder.description(description);
        }
        if let Some(size) = stanza.get("Size").and_then(|s| s.parse().ok()) {
            builder = builder.size(size);
        }
        if let Some(installed) = stanza.get("Installed-Size").and_then(|s| s.parse::<u64>().ok())
        {
            // Installed-Size is in KiB.
            builder = builder.installed_size(installed * 1024);
        }

        for group in parse_relation_field(
            stanza.get("Depends").as_deref().unwrap_or(""),
            &self.namespace,
            false,
        ) {
            builder = builder.depends_group(group);
        }
        for group in parse_relation_field(
            stanza.get("Pre-Depends").as_deref().unwrap_or(""),
            &self.namespace,
            false,
        ) {
            builder = builder.depends_group(group);
        }
        for group in parse_relation_field(
            stanza.get("Recommends").as_deref().unwrap_or(""),
            &self.namespace,
            true,
        ) {
            builder = builder.depends_group(group);
        }
        for group in parse_relation_field(
            stanza.get("Provides").as_deref().unwrap_or(""),
            &self.namespace,
            false,
        ) {
            builder = builder.alias(group);
        }
        for group in parse_relation_field(
            stanza.get("Conflicts").as_deref().unwrap_or(""),
            &self.namespace,
            false,
        ) {
            builder = builder.conflict(group);
        }

        sink.push(builder.finish());
        Ok(())
    }
}

/// One RFC 822 stanza as ordered key/value pairs
struct Stanza {
    fields: Vec<(String, String)>,
}

impl Stanza {
    fn get(&self, key: &str) -> Option<String> {
        self.fields
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.clone())
    }

    fn required(&self, key: &str) -> Result<String> {
        self.get(key).ok_or_else(|| Error::Parse {
            what: "Packages stanza".into(),
            reason: format!("missing {} field", key),
        })
    }
}

/// Walk stanzas in a Packages index, invoking `emit` for each
fn parse_packages_index(
    index: &str,
    mut emit: impl FnMut(&Stanza) -> Result<()>,
) -> Result<usize> {
    let mut fields: Vec<(String, String)> = Vec::new();
    let mut count = 0;

    for line in index.lines().chain(std::iter::once("")) {
        if line.is_empty() {
            if !fields.is_empty() {
                emit(&Stanza {
                    fields: std::mem::take(&mut fields),
                })?;
                count += 1;
            }
            continue;
        }

        // Continuation lines extend the previous field.
        if line.starts_with([' ', '\t']) {
            if let Some((_, value)) = fields.last_mut() {
                value.push('\n');
                value.push_str(line.trim_start());
            }
            continue;
        }

        if let Some((key, value)) = line.split_once(':') {
            fields.push((key.trim().to_string(), value.trim().to_string()));
        }
    }

    Ok(count)
}

/// Parse a relationship field (`Depends`, `Provides`, ...)
///
/// Comma separates groups; `|` separates alternatives within a group;
/// a parenthesized `(op version)` constrains an alternative. dpkg's
/// strict `<<`/`>>` normalize to the nearest representable bound.
fn parse_relation_field(field: &str, namespace: &str, recommended: bool) -> Vec<QueryGroup> {
    let mut groups = Vec::new();

    for group_text in field.split(',') {
        let group_text = group_text.trim();
        if group_text.is_empty() {
            continue;
        }

        let mut group = Vec::new();
        for option_text in group_text.split('|') {
            let option_text = option_text.trim();
            if option_text.is_empty() {
                continue;
            }

            let mut query = parse_relation(option_text, namespace);
            query.recommended = recommended;
            group.push(query);
        }

        if !group.is_empty() {
            groups.push(group);
        }
    }

    groups
}

fn parse_relation(text: &str, namespace: &str) -> PackageQuery {
    let (name, constraint) = match text.split_once('(') {
        Some((name, rest)) => (name.trim(), Some(rest.trim_end_matches(')').trim())),
        None => (text.trim(), None),
    };

    // Strip architecture qualifiers like "libc6:amd64".
    let name = name.split(':').next().unwrap_or(name);

    let mut query = match constraint {
        Some(constraint) => {
            let predicate = parse_dpkg_constraint(constraint);
            PackageQuery::with_version(name, predicate)
        }
        None => PackageQuery::any(name),
    };
    query.namespace = namespace.to_string();
    query
}

fn parse_dpkg_constraint(constraint: &str) -> String {
    let (op, version) = match constraint.split_once(' ') {
        Some((op, version)) => (op.trim(), version.trim()),
        None => ("=", constraint.trim()),
    };

    let mapped = match op {
        ">=" | ">>" => ">=",
        "<=" | "<<" => "<",
        "=" => "=",
        _ => "=",
    };

    format!("{}{}", mapped, version)
}
