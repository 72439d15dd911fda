// src/repo/mod.rs

//! Repository fetcher framework
//!
//! A distribution builder ("alpine@3.20" for x86_64) owns one repository
//! populated by a format-specific index fetcher. Fetchers download their
//! index through the shared HTTP layer, parse it, and emit uniform
//! [`Package`](crate::model::Package) records; the planner only ever sees
//! the uniform model.
//!
//! Builders load lazily on first use or eagerly via
//! [`BuilderRegistry::load_all`]. A failed fetcher disables its own
//! repository for the session without affecting the others.

pub mod alpine;
pub mod archlinux;
pub mod debian;
pub mod pypi;
pub mod rpm;

use crate::cancel::CancelToken;
use crate::error::{Error, Result};
use crate::fetch::HttpFetcher;
use crate::model::{Package, PackageName, PackageBuilder, PackageQuery};
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tracing::{debug, info, warn};

/// Lifecycle of a builder's repository
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetcherStatus {
    NotStarted,
    Loading,
    Ready,
    Failed,
}

impl fmt::Display for FetcherStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FetcherStatus::NotStarted => "not started",
            FetcherStatus::Loading => "loading",
            FetcherStatus::Ready => "ready",
            FetcherStatus::Failed => "failed",
        };
        write!(f, "{}", name)
    }
}

/// An in-memory package collection with ordered name lookup
///
/// Besides the primary name index, an alias index maps every provided
/// name (`sh`, `so:libc.musl-x86_64.so.1`) to its providers so
/// dependencies on virtual packages resolve without being installed
/// first.
#[derive(Debug, Default)]
pub struct Repository {
    distro: String,
    case_insensitive: bool,
    packages: BTreeMap<String, Vec<Package>>,
    aliases: BTreeMap<String, Vec<AliasEntry>>,
}

/// One provider of an alias name
#[derive(Debug, Clone)]
struct AliasEntry {
    /// Primary index key of the providing package
    provider_key: String,
    /// Position among packages sharing that key
    provider_index: usize,
    /// Version the alias was declared at, when exact
    version: Option<String>,
}

impl Repository {
    pub fn new(distro: impl Into<String>, case_insensitive: bool) -> Self {
        Self {
            distro: distro.into(),
            case_insensitive,
            packages: BTreeMap::new(),
            aliases: BTreeMap::new(),
        }
    }

    pub fn distro(&self) -> &str {
        &self.distro
    }

    /// Whether name matching ignores ASCII case for this ecosystem
    pub fn case_insensitive(&self) -> bool {
        self.case_insensitive
    }

    fn key_for(&self, name: &str) -> String {
        if self.case_insensitive {
            name.to_ascii_lowercase()
        } else {
            name.to_string()
        }
    }

    /// Add a package to the collection, indexing its aliases
    pub fn add(&mut self, package: Package) {
        let key = self.key_for(&package.name.name);
        let provider_index = self.packages.get(&key).map(Vec::len).unwrap_or(0);

        for group in &package.aliases {
            for alias in group {
                let alias_key = self.key_for(&alias.name);
                let version = match alias.version_predicate() {
                    Ok(crate::version::VersionPredicate::Exact(v)) => Some(v),
                    _ => None,
                };
                self.aliases.entry(alias_key).or_default().push(AliasEntry {
                    provider_key: key.clone(),
                    provider_index,
                    version,
                });
            }
        }

        self.packages.entry(key).or_default().push(package);
    }

    /// Number of distinct package names
    pub fn len(&self) -> usize {
        self.packages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.packages.is_empty()
    }

    /// Find packages satisfying a query, in insertion order, capped at
    /// `max_results`
    ///
    /// When no package carries the queried name, providers that declare
    /// it as an alias are returned instead; the query's version predicate
    /// then applies to the alias's declared version (falling back to the
    /// provider's own version).
    pub fn search(&self, query: &PackageQuery, max_results: usize) -> Vec<&Package> {
        let key = self.key_for(&query.name);
        let max_results = max_results.max(1);

        if let Some(candidates) = self.packages.get(&key) {
            let found: Vec<&Package> = candidates
                .iter()
                .filter(|p| p.matches(query, self.case_insensitive))
                .take(max_results)
                .collect();
            if !found.is_empty() {
                return found;
            }
        }

        self.search_aliases(query, &key, max_results)
    }

    fn search_aliases(&self, query: &PackageQuery, key: &str, max_results: usize) -> Vec<&Package> {
        let Some(entries) = self.aliases.get(key) else {
            return Vec::new();
        };

        let mut found = Vec::new();
        for entry in entries {
            let Some(provider) = self
                .packages
                .get(&entry.provider_key)
                .and_then(|list| list.get(entry.provider_index))
            else {
                continue;
            };

            let alias_version = entry
                .version
                .as_deref()
                .unwrap_or(provider.name.version.as_str());
            let satisfied = query
                .version_predicate()
                .map(|p| p.matches(alias_version))
                .unwrap_or(false);

            if satisfied && !found.iter().any(|p: &&Package| std::ptr::eq(*p, provider)) {
                found.push(provider);
                if found.len() >= max_results {
                    break;
                }
            }
        }

        found
    }
}

/// Write half of a repository handed to fetchers during load
pub struct RepositorySink {
    repository: Repository,
}

impl RepositorySink {
    fn new(distro: impl Into<String>, case_insensitive: bool) -> Self {
        Self {
            repository: Repository::new(distro, case_insensitive),
        }
    }

    /// Start a package record; hand the finished builder to
    /// [`RepositorySink::push`]
    pub fn add_package(&self, name: PackageName) -> PackageBuilder {
        PackageBuilder::new(name)
    }

    /// Commit a finished package to the repository
    pub fn push(&mut self, package: Package) {
        self.repository.add(package);
    }

    /// Number of distinct names committed so far
    pub fn len(&self) -> usize {
        self.repository.len()
    }

    pub fn is_empty(&self) -> bool {
        self.repository.is_empty()
    }
}

/// Everything a fetcher needs while loading an index
pub struct FetchContext<'a> {
    pub http: &'a HttpFetcher,
    pub cancel: CancelToken,
    pub architecture: String,
}

/// A format-specific index parser
///
/// Implementations download their index (through `ctx.http`), parse it,
/// and emit packages into the sink. `args` given at construction select
/// the concrete index (release, repo components, seed packages).
pub trait IndexFetcher: Send + Sync {
    /// Distribution family name ("alpine", "debian", ...)
    fn distro(&self) -> &str;

    /// Whether this ecosystem matches package names case-insensitively
    fn case_insensitive(&self) -> bool {
        false
    }

    /// Populate the sink from the upstream index
    fn load(&self, ctx: &FetchContext<'_>, sink: &mut RepositorySink) -> Result<()>;
}

struct BuilderState {
    status: FetcherStatus,
    last_updated: Option<DateTime<Utc>>,
    repository: Option<Arc<Repository>>,
    failure: Option<String>,
}

/// A named distribution builder: one fetcher plus its loaded repository
pub struct DistroBuilder {
    name: String,
    display_name: String,
    architecture: String,
    fetcher: Box<dyn IndexFetcher>,
    state: Mutex<BuilderState>,
}

impl fmt::Debug for DistroBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DistroBuilder")
            .field("name", &self.name)
            .field("display_name", &self.display_name)
            .field("architecture", &self.architecture)
            .finish()
    }
}

impl DistroBuilder {
    pub fn new(
        name: impl Into<String>,
        display_name: impl Into<String>,
        architecture: impl Into<String>,
        fetcher: Box<dyn IndexFetcher>,
    ) -> Self {
        Self {
            name: name.into(),
            display_name: display_name.into(),
            architecture: architecture.into(),
            fetcher,
            state: Mutex::new(BuilderState {
                status: FetcherStatus::NotStarted,
                last_updated: None,
                repository: None,
                failure: None,
            }),
        }
    }

    /// The registry key: `name-architecture`
    pub fn key(&self) -> String {
        builder_key(&self.name, &self.architecture)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn display_name(&self) -> &str {
        &self.display_name
    }

    pub fn architecture(&self) -> &str {
        &self.architecture
    }

    pub fn status(&self) -> FetcherStatus {
        self.state.lock().expect("builder state poisoned").status
    }

    pub fn last_updated(&self) -> Option<DateTime<Utc>> {
        self.state
            .lock()
            .expect("builder state poisoned")
            .last_updated
    }

    pub fn loaded(&self) -> bool {
        self.status() == FetcherStatus::Ready
    }

    /// Load the repository from upstream
    ///
    /// Failure marks the builder `Failed` and remembers the reason; the
    /// builder stays registered so other repositories keep working.
    pub fn load(&self, http: &HttpFetcher, cancel: &CancelToken) -> Result<()> {
        {
            let mut state = self.state.lock().expect("builder state poisoned");
            if state.status == FetcherStatus::Ready {
                return Ok(());
            }
            state.status = FetcherStatus::Loading;
        }

        let ctx = FetchContext {
            http,
            cancel: cancel.clone(),
            architecture: self.architecture.clone(),
        };
        let mut sink = RepositorySink::new(
            self.fetcher.distro().to_string(),
            self.fetcher.case_insensitive(),
        );

        let start = Instant::now();
        match self.fetcher.load(&ctx, &mut sink) {
            Ok(()) => {
                info!(
                    builder = %self.display_name,
                    arch = %self.architecture,
                    packages = sink.len(),
                    took = ?start.elapsed(),
                    "loaded"
                );
                let mut state = self.state.lock().expect("builder state poisoned");
                state.status = FetcherStatus::Ready;
                state.last_updated = Some(Utc::now());
                state.repository = Some(Arc::new(sink.repository));
                Ok(())
            }
            Err(e) => {
                warn!(
                    builder = %self.display_name,
                    arch = %self.architecture,
                    error = %e,
                    "fetcher failed, disabling repository for this session"
                );
                let mut state = self.state.lock().expect("builder state poisoned");
                state.status = FetcherStatus::Failed;
                state.failure = Some(e.to_string());
                Err(e)
            }
        }
    }

    /// The loaded repository
    ///
    /// `NotFound` before a successful load; a failed load reports the
    /// recorded reason.
    pub fn repository(&self) -> Result<Arc<Repository>> {
        let state = self.state.lock().expect("builder state poisoned");
        match state.status {
            FetcherStatus::Ready => Ok(state
                .repository
                .clone()
                .expect("ready builder has a repository")),
            FetcherStatus::Failed => Err(Error::NotFound(format!(
                "repository {} is disabled: {}",
                self.display_name,
                state.failure.as_deref().unwrap_or("load failed")
            ))),
            _ => Err(Error::NotFound(format!(
                "repository {} has not been loaded",
                self.display_name
            ))),
        }
    }

    /// Inject an already-populated repository (tests and local overlays)
    pub fn provide_repository(&self, repository: Repository) {
        let mut state = self.state.lock().expect("builder state poisoned");
        state.status = FetcherStatus::Ready;
        state.last_updated = Some(Utc::now());
        state.repository = Some(Arc::new(repository));
    }
}

fn builder_key(name: &str, architecture: &str) -> String {
    format!("{}-{}", name, architecture)
}

/// All registered distribution builders, keyed `name-architecture`
#[derive(Default)]
pub struct BuilderRegistry {
    builders: Mutex<HashMap<String, Arc<DistroBuilder>>>,
}

impl BuilderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_builder(&self, builder: DistroBuilder) {
        let key = builder.key();
        self.builders
            .lock()
            .expect("builder registry poisoned")
            .insert(key, Arc::new(builder));
    }

    /// Look up a builder, loading its repository on first use
    pub fn builder(
        &self,
        name: &str,
        architecture: &str,
        http: &HttpFetcher,
        cancel: &CancelToken,
    ) -> Result<Arc<DistroBuilder>> {
        let key = builder_key(name, architecture);
        let builder = self
            .builders
            .lock()
            .expect("builder registry poisoned")
            .get(&key)
            .cloned()
            .ok_or_else(|| {
                Error::NotFound(format!("builder {} for arch {}", name, architecture))
            })?;

        if !builder.loaded() {
            builder.load(http, cancel)?;
        }

        Ok(builder)
    }

    /// All registered builders, in key order
    pub fn all(&self) -> Vec<Arc<DistroBuilder>> {
        let builders = self.builders.lock().expect("builder registry poisoned");
        let mut all: Vec<_> = builders.values().cloned().collect();
        all.sort_by_key(|b| b.key());
        all
    }

    /// Warm every registered builder
    ///
    /// With `parallel > 1` builders load on a bounded worker pool; one
    /// failed fetcher does not stop the others, and the first failure is
    /// reported after all workers finish.
    pub fn load_all(
        &self,
        http: &HttpFetcher,
        cancel: &CancelToken,
        parallel: usize,
    ) -> Result<()> {
        let pending: VecDeque<Arc<DistroBuilder>> =
            self.all().into_iter().filter(|b| !b.loaded()).collect();
        if pending.is_empty() {
            return Ok(());
        }

        if parallel <= 1 {
            let mut first_failure = None;
            for builder in pending {
                if let Err(e) = builder.load(http, cancel) {
                    first_failure.get_or_insert(e);
                }
            }
            return match first_failure {
                Some(e) => Err(e),
                None => Ok(()),
            };
        }

        let queue = Mutex::new(pending);
        let failures: Mutex<Vec<Error>> = Mutex::new(Vec::new());
        let workers = parallel.min(self.all().len()).max(1);

        std::thread::scope(|scope| {
            for _ in 0..workers {
                scope.spawn(|| loop {
                    let next = queue.lock().expect("load queue poisoned").pop_front();
                    let Some(builder) = next else { break };

                    debug!(builder = %builder.display_name(), "loading");
                    if let Err(e) = builder.load(http, cancel) {
                        failures.lock().expect("failure list poisoned").push(e);
                    }
                });
            }
        });

        let mut failures = failures.into_inner().expect("failure list poisoned");
        if failures.is_empty() {
            Ok(())
        } else {
            Err(failures.remove(0))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct StaticFetcher {
        packages: Vec<(&'static str, &'static str)>,
        fail: bool,
    }

    impl IndexFetcher for StaticFetcher {
        fn distro(&self) -> &str {
            "static"
        }

        fn load(&self, _ctx: &FetchContext<'_>, sink: &mut RepositorySink) -> Result<()> {
            if self.fail {
                return Err(Error::Network {
                    url: "http://example/index".into(),
                    reason: "connection refused".into(),
                });
            }
            for (name, version) in &self.packages {
                let pkg = sink.add_package(PackageName::new(*name, *version)).finish();
                sink.push(pkg);
            }
            Ok(())
        }
    }

    fn http() -> (tempfile::TempDir, HttpFetcher) {
        let dir = tempfile::tempdir().unwrap();
        let http = HttpFetcher::new(dir.path().join("fetch"), 10).unwrap();
        (dir, http)
    }

    #[test]
    fn test_repository_search_with_predicate() {
        let mut repo = Repository::new("test", false);
        for version in ["1.0", "1.2", "2.0"] {
            repo.add(PackageBuilder::new(PackageName::new("foo", version)).finish());
        }

        let query = PackageQuery::with_version("foo", ">=1.1,<2.0");
        let found = repo.search(&query, 10);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].name.version, "1.2");
    }

    #[test]
    fn test_repository_search_caps_results() {
        let mut repo = Repository::new("test", false);
        for version in ["1.0", "1.1", "1.2", "1.3"] {
            repo.add(PackageBuilder::new(PackageName::new("foo", version)).finish());
        }

        assert_eq!(repo.search(&PackageQuery::any("foo"), 2).len(), 2);
    }

    #[test]
    fn test_alias_search_finds_provider() {
        let mut repo = Repository::new("test", false);
        repo.add(
            PackageBuilder::new(PackageName::new("bash", "5.2"))
                .alias(vec![PackageQuery::with_version("sh", "=5.2")])
                .finish(),
        );

        // No package is named "sh", but bash provides it.
        let found = repo.search(&PackageQuery::any("sh"), 10);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].name.name, "bash");

        // The alias version participates in predicate matching.
        assert!(repo
            .search(&PackageQuery::with_version("sh", ">=6.0"), 10)
            .is_empty());
    }

    #[test]
    fn test_case_insensitive_repository() {
        let mut repo = Repository::new("pypi", true);
        repo.add(PackageBuilder::new(PackageName::new("Django", "5.0")).finish());

        assert_eq!(repo.search(&PackageQuery::any("django"), 10).len(), 1);
        assert_eq!(repo.search(&PackageQuery::any("DJANGO"), 10).len(), 1);
    }

    #[test]
    fn test_builder_lifecycle() {
        let (_dir, http) = http();
        let builder = DistroBuilder::new(
            "static@1",
            "Static Test Repo",
            "x86_64",
            Box::new(StaticFetcher {
                packages: vec![("foo", "1.0")],
                fail: false,
            }),
        );

        assert_eq!(builder.status(), FetcherStatus::NotStarted);
        assert!(builder.repository().is_err());

        builder.load(&http, &CancelToken::new()).unwrap();
        assert_eq!(builder.status(), FetcherStatus::Ready);
        assert!(builder.last_updated().is_some());
        assert_eq!(builder.repository().unwrap().len(), 1);
    }

    #[test]
    fn test_failed_builder_is_disabled_not_fatal() {
        let (_dir, http) = http();
        let registry = BuilderRegistry::new();
        registry.add_builder(DistroBuilder::new(
            "bad@1",
            "Broken Repo",
            "x86_64",
            Box::new(StaticFetcher {
                packages: vec![],
                fail: true,
            }),
        ));
        registry.add_builder(DistroBuilder::new(
            "good@1",
            "Working Repo",
            "x86_64",
            Box::new(StaticFetcher {
                packages: vec![("foo", "1.0")],
                fail: false,
            }),
        ));

        let cancel = CancelToken::new();
        // load_all reports the failure but still loads the healthy builder.
        assert!(registry.load_all(&http, &cancel, 4).is_err());

        let good = registry
            .builder("good@1", "x86_64", &http, &cancel)
            .unwrap();
        assert!(good.loaded());

        let bad = registry.builders.lock().unwrap()["bad@1-x86_64"].clone();
        assert_eq!(bad.status(), FetcherStatus::Failed);
        assert!(bad.repository().unwrap_err().is_not_found());
    }

    #[test]
    fn test_builder_registry_lazy_load() {
        let (_dir, http) = http();
        let registry = BuilderRegistry::new();
        registry.add_builder(DistroBuilder::new(
            "static@1",
            "Static Test Repo",
            "x86_64",
            Box::new(StaticFetcher {
                packages: vec![("foo", "1.0")],
                fail: false,
            }),
        ));

        let cancel = CancelToken::new();
        let builder = registry
            .builder("static@1", "x86_64", &http, &cancel)
            .unwrap();
        assert!(builder.loaded());

        assert!(registry
            .builder("missing@1", "x86_64", &http, &cancel)
            .unwrap_err()
            .is_not_found());
    }
}
