// src/model/mod.rs

//! Uniform package model shared by every repository fetcher
//!
//! Fetchers parse wildly different upstream index formats, but all of them
//! emit [`Package`] records through a [`PackageBuilder`]. The planner only
//! ever sees this model.

use crate::definition::Definition;
use crate::error::{Error, Result};
use crate::version::VersionPredicate;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// A package identity: name plus optional version, architecture,
/// namespace, and tags
///
/// The "short name" (`namespace:name`, or bare `name` when unnamespaced)
/// is the dependency-resolution identity; a plan never contains two
/// packages with the same short name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PackageName {
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub version: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub architecture: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub namespace: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
}

impl PackageName {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            architecture: String::new(),
            namespace: String::new(),
            tags: Vec::new(),
        }
    }

    pub fn with_architecture(mut self, architecture: impl Into<String>) -> Self {
        self.architecture = architecture.into();
        self
    }

    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    pub fn with_tags(mut self, tags: Vec<String>) -> Self {
        self.tags = tags;
        self
    }

    /// The dependency-resolution identity of this package
    pub fn short_name(&self) -> String {
        if self.namespace.is_empty() {
            self.name.clone()
        } else {
            format!("{}:{}", self.namespace, self.name)
        }
    }
}

impl fmt::Display for PackageName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.short_name())?;
        if !self.version.is_empty() {
            write!(f, "-{}", self.version)?;
        }
        if !self.architecture.is_empty() {
            write!(f, ".{}", self.architecture)?;
        }
        Ok(())
    }
}

/// A single query over package repositories
///
/// Several queries may share a name to express or-of-versions; inside a
/// dependency group a query may be flagged `recommended`, which planner
/// options can exclude.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageQuery {
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub namespace: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub architecture: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    #[serde(
        default = "default_predicate_text",
        skip_serializing_if = "is_default_predicate_text"
    )]
    pub predicate: String,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub recommended: bool,
}

fn default_predicate_text() -> String {
    "*".to_string()
}

fn is_default_predicate_text(s: &str) -> bool {
    s.is_empty() || s == "*"
}

impl PackageQuery {
    /// A query matching any version of `name`
    pub fn any(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: String::new(),
            architecture: String::new(),
            tags: Vec::new(),
            predicate: default_predicate_text(),
            recommended: false,
        }
    }

    /// A query with an explicit version predicate string
    pub fn with_version(name: impl Into<String>, predicate: impl Into<String>) -> Self {
        Self {
            predicate: predicate.into(),
            ..Self::any(name)
        }
    }

    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    pub fn with_architecture(mut self, architecture: impl Into<String>) -> Self {
        self.architecture = architecture.into();
        self
    }

    pub fn recommended(mut self) -> Self {
        self.recommended = true;
        self
    }

    /// Parse the surface syntax `name[@distro][:arch][op version]`
    ///
    /// `op ∈ {=, >=, <}` and the version may end in `*` for a prefix
    /// match: `musl@alpine:x86_64>=1.2`, `openssl=3.0*`, `busybox`.
    pub fn parse(s: &str) -> Result<Self> {
        let s = s.trim();
        if s.is_empty() {
            return Err(Error::Parse {
                what: "package query".into(),
                reason: "empty query".into(),
            });
        }

        let op_pos = s.find(['=', '>', '<']);
        let (name_part, predicate) = match op_pos {
            Some(pos) => {
                let pred = VersionPredicate::parse(&s[pos..])?;
                (&s[..pos], pred.to_string())
            }
            None => (s, default_predicate_text()),
        };

        let (name_part, architecture) = match name_part.split_once(':') {
            Some((n, arch)) => (n, arch.to_string()),
            None => (name_part, String::new()),
        };

        let (name, namespace) = match name_part.split_once('@') {
            Some((n, ns)) => (n.to_string(), ns.to_string()),
            None => (name_part.to_string(), String::new()),
        };

        if name.is_empty() {
            return Err(Error::Parse {
                what: "package query".into(),
                reason: format!("no package name in {:?}", s),
            });
        }

        Ok(Self {
            name,
            namespace,
            architecture,
            tags: Vec::new(),
            predicate,
            recommended: false,
        })
    }

    /// The short name this query resolves under
    pub fn short_name(&self) -> String {
        if self.namespace.is_empty() {
            self.name.clone()
        } else {
            format!("{}:{}", self.namespace, self.name)
        }
    }

    /// The parsed version predicate
    pub fn version_predicate(&self) -> Result<VersionPredicate> {
        VersionPredicate::parse(&self.predicate)
    }

    /// Check whether an already-selected version still satisfies this query
    pub fn accepts_version(&self, version: &str) -> bool {
        self.version_predicate()
            .map(|p| p.matches(version))
            .unwrap_or(false)
    }
}

impl fmt::Display for PackageQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)?;
        if !self.namespace.is_empty() {
            write!(f, "@{}", self.namespace)?;
        }
        if !self.architecture.is_empty() {
            write!(f, ":{}", self.architecture)?;
        }
        if !is_default_predicate_text(&self.predicate) {
            write!(f, "{}", self.predicate)?;
        }
        Ok(())
    }
}

/// A dependency group: satisfied by installing ANY one member
pub type QueryGroup = Vec<PackageQuery>;

/// A package as seen by the planner
///
/// `depends`, `aliases`, and `conflicts` all share the option-group shape;
/// `sources` are the definitions that fetch this package's archives.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Package {
    pub name: PackageName,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub license: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub installed_size: Option<u64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sources: Vec<Definition>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends: Vec<QueryGroup>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub aliases: Vec<QueryGroup>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conflicts: Vec<QueryGroup>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, String>,
}

impl Package {
    /// Check whether this package satisfies a query
    ///
    /// Name equality honors the repository's case-sensitivity policy; the
    /// query's architecture must match or be empty; the query's tags must
    /// be a subset of the package's tags.
    pub fn matches(&self, query: &PackageQuery, case_insensitive: bool) -> bool {
        let names_agree = if case_insensitive {
            self.name.name.eq_ignore_ascii_case(&query.name)
        } else {
            self.name.name == query.name
        };
        if !names_agree {
            return false;
        }

        if !query.namespace.is_empty() && self.name.namespace != query.namespace {
            return false;
        }

        if !query.architecture.is_empty()
            && !self.name.architecture.is_empty()
            && self.name.architecture != query.architecture
        {
            return false;
        }

        if !query
            .tags
            .iter()
            .all(|tag| self.name.tags.contains(tag))
        {
            return false;
        }

        match query.version_predicate() {
            Ok(predicate) => predicate.matches(&self.name.version),
            Err(_) => false,
        }
    }

    /// The dependency-resolution identity of this package
    pub fn short_name(&self) -> String {
        self.name.short_name()
    }
}

/// Incrementally assembles a [`Package`] inside a fetcher
///
/// Obtained from the repository sink's `add_package`; `finish` hands the
/// completed record back to the repository.
#[derive(Debug)]
pub struct PackageBuilder {
    package: Package,
}

impl PackageBuilder {
    pub fn new(name: PackageName) -> Self {
        Self {
            package: Package {
                name,
                description: String::new(),
                license: String::new(),
                size: None,
                installed_size: None,
                sources: Vec::new(),
                depends: Vec::new(),
                aliases: Vec::new(),
                conflicts: Vec::new(),
                metadata: BTreeMap::new(),
            },
        }
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.package.description = description.into();
        self
    }

    pub fn license(mut self, license: impl Into<String>) -> Self {
        self.package.license = license.into();
        self
    }

    pub fn size(mut self, size: u64) -> Self {
        self.package.size = Some(size);
        self
    }

    pub fn installed_size(mut self, size: u64) -> Self {
        self.package.installed_size = Some(size);
        self
    }

    pub fn source(mut self, source: Definition) -> Self {
        self.package.sources.push(source);
        self
    }

    pub fn depends_group(mut self, group: QueryGroup) -> Self {
        if !group.is_empty() {
            self.package.depends.push(group);
        }
        self
    }

    pub fn alias(mut self, group: QueryGroup) -> Self {
        if !group.is_empty() {
            self.package.aliases.push(group);
        }
        self
    }

    pub fn conflict(mut self, group: QueryGroup) -> Self {
        if !group.is_empty() {
            self.package.conflicts.push(group);
        }
        self
    }

    pub fn metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.package.metadata.insert(key.into(), value.into());
        self
    }

    pub fn finish(self) -> Package {
        self.package
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pkg(name: &str, version: &str) -> Package {
        PackageBuilder::new(PackageName::new(name, version)).finish()
    }

    #[test]
    fn test_short_name() {
        let plain = PackageName::new("busybox", "1.36");
        assert_eq!(plain.short_name(), "busybox");

        let namespaced = PackageName::new("requests", "2.31").with_namespace("pypi");
        assert_eq!(namespaced.short_name(), "pypi:requests");
    }

    #[test]
    fn test_query_parse_plain() {
        let q = PackageQuery::parse("busybox").unwrap();
        assert_eq!(q.name, "busybox");
        assert!(q.namespace.is_empty());
        assert!(q.accepts_version("99"));
    }

    #[test]
    fn test_query_parse_full_surface() {
        let q = PackageQuery::parse("musl@alpine:x86_64>=1.2").unwrap();
        assert_eq!(q.name, "musl");
        assert_eq!(q.namespace, "alpine");
        assert_eq!(q.architecture, "x86_64");
        assert!(q.accepts_version("1.2.4"));
        assert!(!q.accepts_version("1.1"));
    }

    #[test]
    fn test_query_parse_prefix() {
        let q = PackageQuery::parse("openssl=3.0*").unwrap();
        assert!(q.accepts_version("3.0.13"));
        assert!(!q.accepts_version("3.1.0"));
    }

    #[test]
    fn test_query_parse_range() {
        let q = PackageQuery::parse("foo>=1.1,<2.0").unwrap();
        assert!(q.accepts_version("1.2"));
        assert!(!q.accepts_version("2.0"));
    }

    #[test]
    fn test_query_parse_rejects_empty_name() {
        assert!(PackageQuery::parse("").is_err());
        assert!(PackageQuery::parse(">=1.0").is_err());
    }

    #[test]
    fn test_query_display_round_trip() {
        for text in ["busybox", "musl@alpine:x86_64>=1.2", "foo>=1.1,<2.0"] {
            let q = PackageQuery::parse(text).unwrap();
            let again = PackageQuery::parse(&q.to_string()).unwrap();
            assert_eq!(q, again, "{} did not round trip", text);
        }
    }

    #[test]
    fn test_package_matches_version() {
        let p = pkg("foo", "1.2");
        assert!(p.matches(&PackageQuery::with_version("foo", ">=1.1,<2.0"), false));
        assert!(!p.matches(&PackageQuery::with_version("foo", ">=2.0"), false));
    }

    #[test]
    fn test_package_matches_case_policy() {
        let p = pkg("Django", "5.0");
        let q = PackageQuery::any("django");
        assert!(p.matches(&q, true));
        assert!(!p.matches(&q, false));
    }

    #[test]
    fn test_package_matches_architecture() {
        let mut p = pkg("foo", "1.0");
        p.name.architecture = "x86_64".into();

        assert!(p.matches(&PackageQuery::any("foo"), false));
        assert!(p.matches(
            &PackageQuery::any("foo").with_architecture("x86_64"),
            false
        ));
        assert!(!p.matches(
            &PackageQuery::any("foo").with_architecture("aarch64"),
            false
        ));
    }

    #[test]
    fn test_package_matches_tags_subset() {
        let mut p = pkg("foo", "1.0");
        p.name.tags = vec!["main".into(), "release".into()];

        let mut q = PackageQuery::any("foo");
        q.tags = vec!["main".into()];
        assert!(p.matches(&q, false));

        q.tags = vec!["main".into(), "testing".into()];
        assert!(!p.matches(&q, false));
    }

    #[test]
    fn test_builder_collects_groups() {
        let p = PackageBuilder::new(PackageName::new("a", "1.0"))
            .description("test package")
            .depends_group(vec![PackageQuery::any("b"), PackageQuery::any("c")])
            .depends_group(vec![])
            .alias(vec![PackageQuery::any("a-alias")])
            .conflict(vec![PackageQuery::any("a-old")])
            .metadata("origin", "unit-test")
            .finish();

        assert_eq!(p.depends.len(), 1);
        assert_eq!(p.depends[0].len(), 2);
        assert_eq!(p.aliases.len(), 1);
        assert_eq!(p.conflicts.len(), 1);
        assert_eq!(p.metadata.get("origin").unwrap(), "unit-test");
    }
}
