// src/repo/pypi.rs

//! PyPI simple-API fetcher
//!
//! PyPI has no enumerable index, so this fetcher is seeded with package
//! names and queries `GET <base>/simple/<name>/` with the JSON content
//! type (`application/vnd.pypi.simple.v1+json`) for each. One package
//! record is emitted per released version, sourced from the best
//! distribution file for that version (a pure wheel when available,
//! otherwise the sdist).
//!
//! The simple API does not expose dependency metadata, so PyPI packages
//! carry no `depends` groups. Name matching is case-insensitive, per the
//! ecosystem's normalization rules.

use crate::definition::Definition;
use crate::error::{Error, Result};
use crate::fetch::FetchOptions;
use crate::model::{PackageName, PackageQuery};
use crate::repo::{FetchContext, IndexFetcher, RepositorySink};
use serde::Deserialize;
use std::io::Read;
use std::time::Duration;
use tracing::debug;

const INDEX_EXPIRE: Duration = Duration::from_secs(6 * 60 * 60);

const SIMPLE_JSON_ACCEPT: &str = "application/vnd.pypi.simple.v1+json";

pub struct PypiFetcher {
    /// API base, e.g. `https://pypi.org` or `mirror://pypi`
    pub base: String,
    /// Package names to materialize
    pub seeds: Vec<String>,
}

impl PypiFetcher {
    pub fn new(base: impl Into<String>, seeds: Vec<String>) -> Self {
        Self {
            base: base.into(),
            seeds,
        }
    }

    fn project_url(&self, name: &str) -> String {
        format!("{}/simple/{}/", self.base, normalize_name(name))
    }
}

/// PEP 503 name normalization: runs of `-`, `_`, `.` become one `-`
fn normalize_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut last_sep = false;

    for c in name.chars() {
        if c == '-' || c == '_' || c == '.' {
            if !last_sep {
                out.push('-');
            }
            last_sep = true;
        } else {
            out.push(c.to_ascii_lowercase());
            last_sep = false;
        }
    }

    out
}

#[derive(Debug, Deserialize)]
struct SimpleProject {
    name: String,
    #[serde(default)]
    versions: Vec<String>,
    #[serde(default)]
    files: Vec<SimpleFile>,
}

#[derive(Debug, Deserialize)]
struct SimpleFile {
    filename: String,
    url: String,
    #[serde(default)]
    size: Option<u64>,
}

impl IndexFetcher for PypiFetcher {
    fn distro(&self) -> &str {
        "pypi"
    }

    fn case_insensitive(&self) -> bool {
        true
    }

    fn load(&self, ctx: &FetchContext<'_>, sink: &mut RepositorySink) -> Result<()> {
        for seed in &self.seeds {
            ctx.cancel.check()?;

            let url = self.project_url(seed);
            let opts = FetchOptions {
                accept: Some(SIMPLE_JSON_ACCEPT.into()),
                use_etag: true,
                fast: true,
                expire_time: Some(INDEX_EXPIRE),
                ..Default::default()
            };

            let Some(mut fetched) = ctx.http.fetch(&url, &opts, &ctx.cancel)? else {
                debug!(package = %seed, "not on PyPI, skipping seed");
                continue;
            };

            let mut body = Vec::new();
            fetched.file.read_to_end(&mut body)?;
            let project: SimpleProject =
                serde_json::from_slice(&body).map_err(|e| Error::Parse {
                    what: format!("simple API response for {}", seed),
                    reason: e.to_string(),
                })?;

            let count = self.emit(sink, &project)?;
            debug!(package = %seed, versions = count, "loaded from PyPI");
        }

        Ok(())
    }
}

impl PypiFetcher {
    fn emit(&self, sink: &mut RepositorySink, project: &SimpleProject) -> Result<usize> {
        let normalized = normalize_name(&project.name);
        let mut count = 0;

        for version in &project.versions {
            let Some(file) = best_file(&normalized, version, &project.files) else {
                continue;
            };

            let pkg_name = PackageName::new(&project.name, version).with_namespace("pypi");

            let package = sink
                .add_package(pkg_name)
                .source(Definition::FetchHttp {
                    url: file.url.clone(),
                    expected_size: file.size,
                    accept: None,
                })
                .metadata("filename", file.filename.clone())
                .finish();

            sink.push(package);
            count += 1;
        }

        Ok(count)
    }
}

/// Pick the best distribution file for a version: a pure wheel first,
/// any other wheel second, an sdist last
fn best_file<'a>(
    normalized_name: &str,
    version: &str,
    files: &'a [SimpleFile],
) -> Option<&'a SimpleFile> {
    let matching: Vec<&SimpleFile> = files
        .iter()
        .filter(|f| file_matches_version(normalized_name, version, &f.filename))
        .collect();

    matching
        .iter()
        .find(|f| f.filename.ends_with("-py3-none-any.whl"))
        .or_else(|| matching.iter().find(|f| f.filename.ends_with(".whl")))
        .or_else(|| matching.iter().find(|f| f.filename.ends_with(".tar.gz")))
        .copied()
}

/// Check a distribution filename against `name-version`
fn file_matches_version(normalized_name: &str, version: &str, filename: &str) -> bool {
    let normalized_file = normalize_name(filename);
    let prefix = format!("{}-{}", normalized_name, normalize_name(version));

    normalized_file.starts_with(&prefix)
        && normalized_file[prefix.len()..]
            .chars()
            .next()
            .map(|c| c == '-')
            .unwrap_or(true)
}
