// tests/workflow.rs

//! Full pipeline: a recipe resolved against a loopback Alpine mirror,
//! through the planner and build engine, down to a root filesystem and
//! VM template.

mod common;

use common::{test_engine, TestServer};
use rootforge::repo::alpine::AlpineFetcher;
use rootforge::repo::DistroBuilder;
use rootforge::{CancelToken, RecipeConfig};
use std::io::Write;

/// Build a gzipped tar from (name, mode, content) triples.
fn tar_gz(entries: &[(&str, u32, &[u8])]) -> Vec<u8> {
    let mut builder = tar::Builder::new(Vec::new());
    for (name, mode, content) in entries {
        let mut header = tar::Header::new_gnu();
        header.set_entry_type(tar::EntryType::Regular);
        header.set_size(content.len() as u64);
        header.set_mode(*mode);
        header.set_mtime(1700000000);
        header.set_uid(0);
        header.set_gid(0);
        header.set_cksum();
        builder.append_data(&mut header, *name, *content).unwrap();
    }
    let tar_bytes = builder.into_inner().unwrap();

    let mut encoder = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
    encoder.write_all(&tar_bytes).unwrap();
    encoder.finish().unwrap()
}

const APKINDEX: &str = "\
C:Q1abc=
P:busybox
V:1.36.1-r5
A:x86_64
T:Size optimized toolbox
L:GPL-2.0-only
D:musl>=1.2

C:Q1def=
P:musl
V:1.2.4-r2
A:x86_64
T:the musl c library
L:MIT
";

#[test]
fn test_recipe_to_vm_template() {
    let server = TestServer::start();

    // Package index for main; community is empty but must exist.
    server.route(
        "/v3.20/main/x86_64/APKINDEX.tar.gz",
        tar_gz(&[("APKINDEX", 0o644, APKINDEX.as_bytes())]),
    );
    server.route(
        "/v3.20/community/x86_64/APKINDEX.tar.gz",
        tar_gz(&[("APKINDEX", 0o644, b"")]),
    );

    // The package archives themselves.
    server.route(
        "/v3.20/main/x86_64/busybox-1.36.1-r5.apk",
        tar_gz(&[("bin/busybox", 0o755, b"busybox ELF")]),
    );
    server.route(
        "/v3.20/main/x86_64/musl-1.2.4-r2.apk",
        tar_gz(&[("lib/ld-musl-x86_64.so.1", 0o755, b"musl ELF")]),
    );

    let (_dir, engine) = test_engine();
    engine
        .http()
        .add_mirror("alpine", vec![server.base_url().to_string()]);

    engine.add_builder(DistroBuilder::new(
        "alpine@3.20",
        "Alpine Linux 3.20",
        "x86_64",
        Box::new(AlpineFetcher::new("mirror://alpine", "v3.20")),
    ));

    let recipe: RecipeConfig = serde_json::from_str(
        r#"{
            "builder": "alpine@3.20",
            "architecture": "x86_64",
            "packages": ["busybox"],
            "commands": ["echo ready"],
            "forward_ports": [{"name": "web", "port": 8080}],
            "cpu_cores": 2,
            "memory_mb": 256,
            "storage_mb": 512
        }"#,
    )
    .unwrap();

    let def = recipe.to_definition().unwrap();
    let ctx = engine.new_context(CancelToken::new());
    let (template_path, template) = engine.build_template(&ctx, &def).unwrap();

    assert!(template_path.exists());
    assert_eq!(template.cpu_cores, 2);
    assert_eq!(template.memory_mb, 256);
    assert_eq!(template.architecture, "x86_64");
    assert_eq!(template.ports, vec![("web".to_string(), 8080)]);

    // The rootfs contains busybox AND its resolved dependency musl.
    let rootfs_digest = rootforge::Digest::parse(&template.rootfs).unwrap();
    let rootfs = engine.store().open_artifact(&rootfs_digest).unwrap();
    let mut archive = tar::Archive::new(rootfs);
    let names: Vec<String> = archive
        .entries()
        .unwrap()
        .map(|e| e.unwrap().path().unwrap().display().to_string())
        .collect();

    assert!(names.contains(&"bin/busybox".to_string()));
    assert!(names.contains(&"lib/ld-musl-x86_64.so.1".to_string()));
    // Boot commands were serialized for the init agent.
    assert!(names.contains(&"init.json".to_string()));

    // Both package archives were fetched exactly once.
    assert_eq!(server.hit_count("/v3.20/main/x86_64/busybox-1.36.1-r5.apk"), 1);
    assert_eq!(server.hit_count("/v3.20/main/x86_64/musl-1.2.4-r2.apk"), 1);

    // Rebuilding the same recipe is fully cached.
    let again = engine
        .build(&ctx, &def, rootforge::BuildOptions::default())
        .unwrap();
    assert_eq!(again.hash.to_hex(), template_path
        .file_stem()
        .unwrap()
        .to_string_lossy());
    assert_eq!(server.hit_count("/v3.20/main/x86_64/busybox-1.36.1-r5.apk"), 1);
}
