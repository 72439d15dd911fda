// src/planner/mod.rs

//! Installation planner
//!
//! Given a query set and a stack of repositories, the planner produces an
//! [`InstallationPlan`]: an ordered package list in which every package
//! appears after all of its dependencies, plus the dependency graph that
//! got it there.
//!
//! Resolution is depth-first with short-name memoization. Each short name
//! is added at most once, so the recursion is bounded by the number of
//! distinct short names; given identical repositories, queries, and
//! options the output is bit-identical.

mod graph;

pub use graph::{DependencyEdge, DependencyGraph, ROOT};

use crate::error::{Error, Result};
use crate::model::{Package, PackageQuery, QueryGroup};
use crate::repo::Repository;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

/// Options controlling candidate selection and recursion
#[derive(Debug, Clone)]
pub struct PlanOptions {
    /// Skip dependency options flagged `recommended`
    pub exclude_recommends: bool,
    /// When several candidates match, restrict to this architecture if
    /// any candidate has it
    pub prefer_architecture: Option<String>,
    /// Cap on candidates considered per query
    pub max_results: usize,
}

impl Default for PlanOptions {
    fn default() -> Self {
        Self {
            exclude_recommends: false,
            prefer_architecture: None,
            max_results: 100,
        }
    }
}

/// The planner's output: packages in installation order plus the
/// dependency edges between their short names
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstallationPlan {
    pub packages: Vec<Package>,
    pub edges: Vec<(String, String)>,
}

impl InstallationPlan {
    /// Rebuild the dependency graph from the recorded edges
    pub fn graph(&self) -> DependencyGraph {
        let mut graph = DependencyGraph::new();
        for package in &self.packages {
            graph.add_node(package.short_name());
        }
        for (parent, child) in &self.edges {
            graph.add_edge(parent.clone(), child.clone());
        }
        graph
    }

    /// Direct dependencies recorded for a short name
    pub fn dependencies_of(&self, short_name: &str) -> Vec<String> {
        self.edges
            .iter()
            .filter(|(parent, _)| parent == short_name)
            .map(|(_, child)| child.clone())
            .collect()
    }
}

/// Depth-first multi-source resolver
pub struct Planner {
    repositories: Vec<Arc<Repository>>,
    options: PlanOptions,
    installed: BTreeMap<String, String>,
    installed_packages: BTreeMap<String, Package>,
    order: Vec<String>,
    edges: Vec<(String, String)>,
    path: Vec<String>,
}

impl Planner {
    pub fn new(repositories: Vec<Arc<Repository>>, options: PlanOptions) -> Self {
        Self {
            repositories,
            options,
            installed: BTreeMap::new(),
            installed_packages: BTreeMap::new(),
            order: Vec::new(),
            edges: Vec::new(),
            path: Vec::new(),
        }
    }

    /// Resolve the query set into an installation plan
    pub fn plan(mut self, queries: &[PackageQuery]) -> Result<InstallationPlan> {
        for query in queries {
            self.install(ROOT, query)?;
        }

        let packages = self
            .order
            .iter()
            .map(|short_name| {
                self.installed_packages
                    .get(short_name)
                    .cloned()
                    .expect("ordered short name is installed")
            })
            .collect();

        Ok(InstallationPlan {
            packages,
            edges: self.edges,
        })
    }

    fn install(&mut self, parent: &str, query: &PackageQuery) -> Result<()> {
        let query_short = query.short_name();

        // Memoization: a short name satisfied once is satisfied forever.
        if let Some(version) = self.installed.get(&query_short) {
            if query.accepts_version(version) {
                self.record_edge(parent, &query_short);
                return Ok(());
            }
            let installed = &self.installed_packages[&query_short];
            return Err(Error::Conflict {
                a: format!("{}", query),
                b: format!("{}", installed.name),
            });
        }

        let package = self.select(query)?;
        let short_name = package.short_name();

        // The query may have resolved through an alias to an
        // already-installed provider.
        if let Some(version) = self.installed.get(&short_name) {
            if package.name.version == *version {
                self.record_edge(parent, &short_name);
                self.record_aliases(&package);
                return Ok(());
            }
            let installed = &self.installed_packages[&short_name];
            return Err(Error::Conflict {
                a: format!("{}", package.name),
                b: format!("{}", installed.name),
            });
        }

        debug!(package = %package.name, query = %query, "selected");

        self.installed
            .insert(short_name.clone(), package.name.version.clone());
        self.installed_packages
            .insert(short_name.clone(), package.clone());

        // Conflicts are checked before aliases are recorded so a package
        // never trips over its own provides.
        self.check_conflicts(&package)?;
        self.record_aliases(&package);

        self.path.push(short_name.clone());
        let result = self.install_dependencies(&package, &short_name);
        self.path.pop();
        result?;

        self.order.push(short_name.clone());
        self.record_edge(parent, &short_name);

        Ok(())
    }

    /// Search every repository and choose one candidate
    fn select(&self, query: &PackageQuery) -> Result<Package> {
        let mut candidates: Vec<&Package> = Vec::new();

        for repository in &self.repositories {
            let remaining = self.options.max_results.saturating_sub(candidates.len());
            if remaining == 0 {
                break;
            }
            candidates.extend(repository.search(query, remaining));
        }

        if candidates.is_empty() {
            return Err(Error::NotFound(format!(
                "package {} (required by {})",
                query,
                self.path_display()
            )));
        }

        if candidates.len() > 1 {
            if let Some(preferred) = &self.options.prefer_architecture {
                let subset: Vec<&Package> = candidates
                    .iter()
                    .copied()
                    .filter(|p| p.name.architecture == *preferred)
                    .collect();
                if !subset.is_empty() {
                    candidates = subset;
                }
            }
        }

        Ok(candidates[0].clone())
    }

    fn check_conflicts(&self, package: &Package) -> Result<()> {
        for group in &package.conflicts {
            for conflict in group {
                let conflict_short = conflict.short_name();
                if conflict_short == package.short_name() {
                    continue;
                }

                if let Some(installed_version) = self.installed.get(&conflict_short) {
                    if conflict.accepts_version(installed_version) {
                        let installed = &self.installed_packages[&conflict_short];
                        return Err(Error::Conflict {
                            a: format!("{}", package.name),
                            b: format!("{}", installed.name),
                        });
                    }
                }
            }
        }
        Ok(())
    }

    /// Record the package's provides under their short names
    ///
    /// First provider wins; re-adding an alias is idempotent.
    fn record_aliases(&mut self, package: &Package) {
        for group in &package.aliases {
            for alias in group {
                let alias_short = alias.short_name();
                if self.installed.contains_key(&alias_short) {
                    continue;
                }

                let version = match alias.version_predicate() {
                    Ok(crate::version::VersionPredicate::Exact(v)) => v,
                    _ => package.name.version.clone(),
                };

                self.installed.insert(alias_short.clone(), version);
                self.installed_packages
                    .insert(alias_short, package.clone());
            }
        }
    }

    fn install_dependencies(&mut self, package: &Package, short_name: &str) -> Result<()> {
        for group in &package.depends {
            self.install_group(group, short_name)?;
        }
        Ok(())
    }

    /// Satisfy one option group: any member will do
    ///
    /// `NotFound` moves on to the next option; any other failure aborts
    /// the plan. A group whose every option was skipped as recommended is
    /// satisfied by omission.
    fn install_group(&mut self, group: &QueryGroup, parent: &str) -> Result<()> {
        let mut attempted = false;

        for option in group {
            if option.recommended && self.options.exclude_recommends {
                continue;
            }
            attempted = true;

            match self.install(parent, option) {
                Ok(()) => return Ok(()),
                Err(e) if e.is_not_found() => {
                    debug!(option = %option, "option unavailable, trying next");
                }
                Err(e) => return Err(e),
            }
        }

        if !attempted {
            return Ok(());
        }

        Err(Error::UnresolvedGroup {
            group: group
                .iter()
                .map(|q| q.to_string())
                .collect::<Vec<_>>()
                .join(" | "),
            path: self.path_display(),
        })
    }

    fn record_edge(&mut self, parent: &str, child: &str) {
        let edge = (parent.to_string(), child.to_string());
        if !self.edges.contains(&edge) {
            self.edges.push(edge);
        }
    }

    fn path_display(&self) -> String {
        if self.path.is_empty() {
            "user request".to_string()
        } else {
            self.path.join(" -> ")
        }
    }
}
