// tests/planner.rs

//! Planner scenarios against in-memory repositories.

use rootforge::model::PackageBuilder;
use rootforge::{
    Error, InstallationPlan, Package, PackageName, PackageQuery, PlanOptions, Planner, Repository,
};
use std::sync::Arc;

fn repo_with(packages: Vec<Package>) -> Arc<Repository> {
    let mut repo = Repository::new("test", false);
    for package in packages {
        repo.add(package);
    }
    Arc::new(repo)
}

fn simple(name: &str, version: &str) -> Package {
    PackageBuilder::new(PackageName::new(name, version)).finish()
}

#[test]
fn test_version_predicate_selects_exact_candidate() {
    // Repository with foo-1.0, foo-1.2, foo-2.0; query foo>=1.1,<2.0.
    let repo = repo_with(vec![
        simple("foo", "1.0"),
        simple("foo", "1.2"),
        simple("foo", "2.0"),
    ]);

    let plan = Planner::new(vec![repo], PlanOptions::default())
        .plan(&[PackageQuery::parse("foo>=1.1,<2.0").unwrap()])
        .unwrap();

    assert_eq!(plan.packages.len(), 1);
    assert_eq!(plan.packages[0].name.version, "1.2");
}

#[test]
fn test_recommends_toggle() {
    let make_repo = || {
        repo_with(vec![
            PackageBuilder::new(PackageName::new("a", "1.0"))
                .depends_group(vec![
                    PackageQuery::any("b").recommended(),
                    PackageQuery::any("c"),
                ])
                .finish(),
            simple("b", "1.0"),
            simple("c", "1.0"),
        ])
    };

    // With recommends excluded, selecting a also selects c.
    let plan = Planner::new(
        vec![make_repo()],
        PlanOptions {
            exclude_recommends: true,
            ..Default::default()
        },
    )
    .plan(&[PackageQuery::any("a")])
    .unwrap();
    let names: Vec<&str> = plan.packages.iter().map(|p| p.name.name.as_str()).collect();
    assert_eq!(names, vec!["c", "a"]);

    // With recommends included, selecting a selects b.
    let plan = Planner::new(vec![make_repo()], PlanOptions::default())
        .plan(&[PackageQuery::any("a")])
        .unwrap();
    let names: Vec<&str> = plan.packages.iter().map(|p| p.name.name.as_str()).collect();
    assert_eq!(names, vec!["b", "a"]);
}

#[test]
fn test_conflicting_openssl_claims() {
    // openssl-1.1 and openssl-3 each provide and conflict on "openssl".
    let repo = repo_with(vec![
        PackageBuilder::new(PackageName::new("openssl1.1", "1.1.1w"))
            .alias(vec![PackageQuery::with_version("openssl", "=1.1.1w")])
            .conflict(vec![PackageQuery::any("openssl")])
            .finish(),
        PackageBuilder::new(PackageName::new("openssl3", "3.0.13"))
            .alias(vec![PackageQuery::with_version("openssl", "=3.0.13")])
            .conflict(vec![PackageQuery::any("openssl")])
            .finish(),
        PackageBuilder::new(PackageName::new("pkg-needing-openssl3", "1.0"))
            .depends_group(vec![PackageQuery::any("openssl3")])
            .finish(),
    ]);

    let err = Planner::new(vec![repo], PlanOptions::default())
        .plan(&[
            PackageQuery::any("openssl1.1"),
            PackageQuery::any("pkg-needing-openssl3"),
        ])
        .unwrap_err();

    // The error names both parties.
    match err {
        Error::Conflict { a, b } => {
            assert!(a.contains("openssl3"));
            assert!(b.contains("openssl1.1"));
        }
        other => panic!("expected a conflict, got {:?}", other),
    }
}

#[test]
fn test_plan_iteration_respects_dependencies() {
    let repo = repo_with(vec![
        PackageBuilder::new(PackageName::new("web-stack", "1.0"))
            .depends_group(vec![PackageQuery::any("http-server")])
            .depends_group(vec![PackageQuery::any("tls")])
            .finish(),
        PackageBuilder::new(PackageName::new("http-server", "2.4"))
            .depends_group(vec![PackageQuery::any("libc")])
            .depends_group(vec![PackageQuery::any("tls")])
            .finish(),
        PackageBuilder::new(PackageName::new("tls", "3.0"))
            .depends_group(vec![PackageQuery::any("libc")])
            .finish(),
        simple("libc", "2.39"),
    ]);

    let plan = Planner::new(vec![repo], PlanOptions::default())
        .plan(&[PackageQuery::any("web-stack")])
        .unwrap();

    let position = |name: &str| {
        plan.packages
            .iter()
            .position(|p| p.name.name == name)
            .unwrap_or_else(|| panic!("{} missing from plan", name))
    };

    // Every package appears after all of its dependencies.
    for (parent, child) in &plan.edges {
        if parent == rootforge::planner::ROOT {
            continue;
        }
        assert!(
            position(child) < position(parent),
            "{} should precede {}",
            child,
            parent
        );
    }

    // The recorded graph agrees and is acyclic.
    let order = plan.graph().topological_order().expect("plan is acyclic");
    assert_eq!(order.len(), plan.packages.len());
}

#[test]
fn test_equal_inputs_produce_identical_plans() {
    let build = || {
        let repo = repo_with(vec![
            PackageBuilder::new(PackageName::new("app", "1.0"))
                .depends_group(vec![PackageQuery::any("lib1")])
                .depends_group(vec![PackageQuery::any("lib2")])
                .finish(),
            simple("lib1", "1.0"),
            simple("lib2", "1.0"),
        ]);
        Planner::new(vec![repo], PlanOptions::default())
            .plan(&[PackageQuery::any("app")])
            .unwrap()
    };

    let a = serde_json::to_vec(&build()).unwrap();
    let b = serde_json::to_vec(&build()).unwrap();
    assert_eq!(a, b);
}

#[test]
fn test_plan_survives_serialization() {
    let repo = repo_with(vec![
        PackageBuilder::new(PackageName::new("app", "1.0"))
            .depends_group(vec![PackageQuery::any("lib")])
            .finish(),
        simple("lib", "1.0"),
    ]);

    let plan = Planner::new(vec![repo], PlanOptions::default())
        .plan(&[PackageQuery::any("app")])
        .unwrap();

    let json = serde_json::to_vec_pretty(&plan).unwrap();
    let back: InstallationPlan = serde_json::from_slice(&json).unwrap();

    assert_eq!(back.packages.len(), plan.packages.len());
    assert_eq!(back.edges, plan.edges);
    assert_eq!(back.dependencies_of("app"), vec!["lib".to_string()]);
}

#[test]
fn test_missing_package_reports_not_found() {
    let repo = repo_with(vec![]);
    let err = Planner::new(vec![repo], PlanOptions::default())
        .plan(&[PackageQuery::any("ghost")])
        .unwrap_err();

    assert!(err.is_not_found());
    assert!(err.to_string().contains("ghost"));
}
