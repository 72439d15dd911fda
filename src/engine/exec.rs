// src/engine/exec.rs

//! Definition executors
//!
//! One function per definition variant, dispatched from
//! [`BuildEngine::build`](super::BuildEngine::build). Executors return
//! `None` to reuse the existing artifact or a [`ResultWriter`] producing
//! the new bytes; nested definitions are built through the context, which
//! is how dependency edges establish their happens-before ordering.

use super::{BuildContext, BuildOptions, ResultWriter};
use crate::assembler::{
    assemble, flatten, write_tar, DirectiveSource, FlattenedBuild, VirtualTree,
};
use crate::config::native_architecture;
use crate::definition::{Definition, Directive, OutputFormat};
use crate::error::{Error, Result};
use crate::fetch::FetchOptions;
use crate::model::PackageQuery;
use crate::planner::{InstallationPlan, PlanOptions, Planner};
use indicatif::{ProgressBar, ProgressStyle};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{self, Write};
use std::time::{Duration, SystemTime};
use tracing::debug;

/// How long a fetched URL stays fresh before ETag revalidation
const ETAG_WINDOW: Duration = Duration::from_secs(24 * 60 * 60);

/// Serialized launch parameters of a virtual machine
///
/// This is the `build_vm` artifact: everything the external VM launcher
/// needs, with artifact references as store digests. Producing it never
/// touches a hypervisor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VmTemplate {
    pub output_name: String,
    pub cpu_cores: u32,
    pub memory_mb: u64,
    pub architecture: String,
    pub storage_mb: u64,
    pub interaction: String,
    #[serde(default)]
    pub debug: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kernel: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initramfs: Option<String>,
    /// Digest of the root filesystem artifact
    pub rootfs: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ports: Vec<(String, u16)>,
}

struct BytesResult(Vec<u8>);

impl ResultWriter for BytesResult {
    fn write_result(&mut self, out: Option<&mut File>) -> Result<()> {
        let out = out.ok_or_else(|| {
            Error::InvalidDefinition("byte result expects an engine-provided output".into())
        })?;
        out.write_all(&self.0)?;
        Ok(())
    }
}

struct StreamResult(File);

impl ResultWriter for StreamResult {
    fn write_result(&mut self, out: Option<&mut File>) -> Result<()> {
        let out = out.ok_or_else(|| {
            Error::InvalidDefinition("stream result expects an engine-provided output".into())
        })?;
        io::copy(&mut self.0, out)?;
        Ok(())
    }
}

/// The executor wrote the tmp file itself; nothing left to stream
struct SelfWritten;

impl ResultWriter for SelfWritten {
    fn write_result(&mut self, _out: Option<&mut File>) -> Result<()> {
        Ok(())
    }
}

/// Execute a definition, producing its result writer
pub fn execute<'a>(
    def: &'a Definition,
    ctx: &'a BuildContext<'_>,
) -> Result<Option<Box<dyn ResultWriter + 'a>>> {
    match def {
        Definition::FetchHttp {
            url,
            expected_size,
            accept,
        } => fetch_http(ctx, url, *expected_size, accept.clone()),
        Definition::ReadArchive { base, format_hint } => read_archive(ctx, base, format_hint),
        Definition::ConstantHash { hash, opener } => constant_hash(ctx, hash, opener),
        Definition::Plan {
            builder,
            architecture,
            queries,
            tags,
        } => plan(ctx, builder, architecture, queries, tags),
        Definition::BuildFs {
            directives,
            output_format,
        } => build_fs(ctx, directives, *output_format),
        Definition::BuildVm { .. } => build_vm(ctx, def),
    }
}

fn fetch_http<'a>(
    ctx: &'a BuildContext<'_>,
    url: &str,
    expected_size: Option<u64>,
    accept: Option<String>,
) -> Result<Option<Box<dyn ResultWriter + 'a>>> {
    let opts = FetchOptions {
        expected_size,
        accept,
        use_etag: true,
        expire_time: Some(ETAG_WINDOW),
        ..Default::default()
    };

    let progress = ProgressBar::new(expected_size.unwrap_or(0)).with_style(
        ProgressStyle::with_template("{msg} {bytes}/{total_bytes} {wide_bar}")
            .expect("Invalid progress bar template"),
    );

    let fetched = ctx.engine().http().fetch_with_progress(
        url,
        &opts,
        ctx.cancel_token(),
        Some(&progress),
    )?;
    progress.finish_and_clear();

    let Some(fetched) = fetched else {
        return Err(Error::NotFound(format!("{} (HTTP 404)", url)));
    };

    Ok(Some(Box::new(StreamResult(fetched.file))))
}

fn read_archive<'a>(
    ctx: &'a BuildContext<'_>,
    base: &Definition,
    format_hint: &str,
) -> Result<Option<Box<dyn ResultWriter + 'a>>> {
    let bytes = ctx.build_bytes(base)?;
    let tar = crate::assembler::normalize_to_tar(&bytes, format_hint)?;
    Ok(Some(Box::new(BytesResult(tar))))
}

fn constant_hash<'a>(
    ctx: &'a BuildContext<'_>,
    hash: &crate::hash::Digest,
    opener: &str,
) -> Result<Option<Box<dyn ResultWriter + 'a>>> {
    match ctx.engine().store().open_artifact(hash) {
        Ok(file) => Ok(Some(Box::new(StreamResult(file)))),
        Err(e) if e.is_not_found() => Err(Error::NotFound(format!(
            "sealed bytes {} (opener {})",
            hash, opener
        ))),
        Err(e) => Err(e),
    }
}

fn plan<'a>(
    ctx: &'a BuildContext<'_>,
    builder: &str,
    architecture: &str,
    queries: &[PackageQuery],
    tags: &[String],
) -> Result<Option<Box<dyn ResultWriter + 'a>>> {
    let engine = ctx.engine();
    let distro_builder = engine.builders().builder(
        builder,
        architecture,
        engine.http(),
        ctx.cancel_token(),
    )?;
    let repository = distro_builder.repository()?;

    let options = PlanOptions {
        exclude_recommends: tags.iter().any(|t| t == "exclude_recommends"),
        prefer_architecture: Some(architecture.to_string()),
        ..Default::default()
    };

    let installation = Planner::new(vec![repository], options).plan(queries)?;
    debug!(
        builder,
        packages = installation.packages.len(),
        "plan resolved"
    );

    Ok(Some(Box::new(BytesResult(serde_json::to_vec_pretty(
        &installation,
    )?))))
}

/// Materializes directive inputs by building nested definitions
struct ContextSource<'a, 'e> {
    ctx: &'a BuildContext<'e>,
}

impl DirectiveSource for ContextSource<'_, '_> {
    fn definition_bytes(&mut self, def: &Definition) -> Result<Vec<u8>> {
        self.ctx.build_bytes(def)
    }

    fn builtin(&mut self, name: &str, architecture: &str) -> Result<Vec<u8>> {
        match &self.ctx.engine().builtin_provider {
            Some(provider) => provider.open(name, architecture),
            None => Err(Error::Unsupported(format!(
                "no provider for builtin {} ({})",
                name, architecture
            ))),
        }
    }
}

fn build_fs<'a>(
    ctx: &'a BuildContext<'_>,
    directives: &[Directive],
    output_format: OutputFormat,
) -> Result<Option<Box<dyn ResultWriter + 'a>>> {
    let flat = flatten(directives, |names| {
        expand_packages(ctx, names, native_architecture())
    })?;

    let mut source = ContextSource { ctx };
    let virtual_tree = assemble(&flat, &mut source)?;

    serialize_tree(ctx, &virtual_tree, output_format, 0)
}

fn serialize_tree<'a>(
    ctx: &'a BuildContext<'_>,
    virtual_tree: &VirtualTree,
    output_format: OutputFormat,
    storage_mb: u64,
) -> Result<Option<Box<dyn ResultWriter + 'a>>> {
    match output_format {
        OutputFormat::Tar => {
            let mut out = Vec::new();
            write_tar(virtual_tree, &mut out)?;
            Ok(Some(Box::new(BytesResult(out))))
        }
        OutputFormat::Ext4 => {
            let Some(writer) = &ctx.engine().image_writer else {
                return Err(Error::Unsupported(
                    "ext4 output requires a registered block image writer".into(),
                ));
            };

            // Large images stream straight into the tmp file rather than
            // through memory; the engine only renames afterwards.
            let tmp = ctx.tmp_path()?.clone();
            let mut out = File::create(&tmp)?;
            writer.write_image(virtual_tree, storage_mb, &mut out)?;
            out.sync_all()?;
            ctx.set_created_output();

            Ok(Some(Box::new(SelfWritten)))
        }
    }
}

fn build_vm<'a>(
    ctx: &'a BuildContext<'_>,
    def: &'a Definition,
) -> Result<Option<Box<dyn ResultWriter + 'a>>> {
    let Definition::BuildVm {
        directives,
        kernel,
        initramfs,
        output_name,
        cpu_cores,
        memory_mb,
        architecture,
        storage_mb,
        interaction,
        debug: debug_flag,
    } = def
    else {
        return Err(Error::InvalidDefinition(format!(
            "{} is not a build_vm definition",
            def.tag()
        )));
    };

    let flat = flatten(directives, |names| expand_packages(ctx, names, architecture))?;

    // The root filesystem is its own definition so it caches and
    // redistributes independently of the VM parameters.
    let rootfs_def = Definition::BuildFs {
        directives: reconstitute_directives(&flat),
        output_format: OutputFormat::Tar,
    };
    let rootfs = ctx.build(&rootfs_def, BuildOptions::default())?;

    let kernel_hash = match kernel {
        Some(k) => Some(ctx.build(k, BuildOptions::default())?.hash.to_hex()),
        None => None,
    };
    let initramfs_hash = match initramfs {
        Some(i) => Some(ctx.build(i, BuildOptions::default())?.hash.to_hex()),
        None => None,
    };

    let template = VmTemplate {
        output_name: output_name.clone(),
        cpu_cores: *cpu_cores,
        memory_mb: *memory_mb,
        architecture: architecture.clone(),
        storage_mb: *storage_mb,
        interaction: flat
            .interaction
            .clone()
            .unwrap_or_else(|| interaction.clone()),
        debug: *debug_flag,
        kernel: kernel_hash,
        initramfs: initramfs_hash,
        rootfs: rootfs.hash.to_hex(),
        ports: flat.ports.clone(),
    };

    Ok(Some(Box::new(BytesResult(serde_json::to_vec_pretty(
        &template,
    )?))))
}

/// Rebuild the directive list a flattened build represents, minus the
/// structural directives that were consumed
fn reconstitute_directives(flat: &FlattenedBuild) -> Vec<Directive> {
    let mut directives = flat.fs_directives.clone();

    for command in &flat.commands {
        directives.push(Directive::RunCommand {
            command: command.clone(),
        });
    }
    if !flat.environment.is_empty() {
        directives.push(Directive::Environment {
            vars: flat.environment.clone(),
        });
    }
    for (name, port) in &flat.ports {
        directives.push(Directive::ExportPort {
            name: name.clone(),
            port: *port,
        });
    }

    directives
}

/// Expand accumulated `AddPackage` names into archive directives
///
/// Names use the query surface `name@builder[:arch][op version]`; the
/// namespace selects the builder, then a `Plan` definition per builder
/// resolves the queries and each selected package contributes one
/// normalized archive per source.
fn expand_packages(
    ctx: &BuildContext<'_>,
    names: &[String],
    architecture: &str,
) -> Result<Vec<Directive>> {
    let mut by_builder: BTreeMap<String, Vec<PackageQuery>> = BTreeMap::new();

    for name in names {
        let mut query = PackageQuery::parse(name)?;
        let builder = std::mem::take(&mut query.namespace);
        if builder.is_empty() {
            return Err(Error::InvalidDefinition(format!(
                "package {} does not name a builder (expected name@builder)",
                name
            )));
        }
        by_builder.entry(builder).or_default().push(query);
    }

    let mut directives = Vec::new();

    for (builder, queries) in by_builder {
        let plan_def = Definition::Plan {
            builder,
            architecture: architecture.to_string(),
            queries,
            tags: Vec::new(),
        };

        let plan_bytes = ctx.build_bytes(&plan_def)?;
        let installation: InstallationPlan = serde_json::from_slice(&plan_bytes)?;

        for package in &installation.packages {
            for source in &package.sources {
                directives.push(Directive::Archive {
                    source: Definition::ReadArchive {
                        base: Box::new(source.clone()),
                        format_hint: source_hint(source),
                    },
                    target_prefix: "/".into(),
                });
            }
        }
    }

    Ok(directives)
}

fn source_hint(def: &Definition) -> String {
    match def {
        Definition::FetchHttp { url, .. } => url
            .split(['?', '#'])
            .next()
            .unwrap_or(url)
            .rsplit('/')
            .next()
            .unwrap_or("")
            .to_string(),
        _ => String::new(),
    }
}

/// Per-variant staleness predicate
///
/// `mtime` is the existing artifact's modification time. Fetches go
/// stale when their ETag window passes; composite definitions go stale
/// when any nested definition does, or when a nested artifact is newer
/// than this one. Sealed bytes and resolved plans never rebuild.
pub fn needs_rebuild(
    def: &Definition,
    ctx: &BuildContext<'_>,
    mtime: SystemTime,
) -> Result<bool> {
    match def {
        Definition::FetchHttp { url, .. } => {
            if ctx.engine().http().is_fresh(url, ETAG_WINDOW) {
                return Ok(false);
            }
            let age = mtime.elapsed().unwrap_or(Duration::ZERO);
            Ok(age > ETAG_WINDOW)
        }
        Definition::ConstantHash { .. } => Ok(false),
        Definition::Plan { .. } => Ok(false),
        Definition::ReadArchive { .. } | Definition::BuildFs { .. } | Definition::BuildVm { .. } => {
            nested_needs_rebuild(&def.children(), ctx, mtime)
        }
    }
}

fn nested_needs_rebuild(
    children: &[&Definition],
    ctx: &BuildContext<'_>,
    my_mtime: SystemTime,
) -> Result<bool> {
    let engine = ctx.engine();

    for child in children {
        let child_digest = engine.hash_definition(child);

        let Some(child_mtime) = engine.store().artifact_mtime(&child_digest) else {
            // An upstream input is missing entirely.
            return Ok(true);
        };

        if needs_rebuild(child, ctx, child_mtime)? {
            return Ok(true);
        }

        if child_mtime > my_mtime {
            return Ok(true);
        }
    }

    Ok(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancel::CancelToken;
    use crate::config::CoreConfig;
    use crate::engine::{BuildEngine, BuildOutcome};
    use crate::hash::hash_bytes;
    use crate::model::{PackageBuilder, PackageName};
    use crate::repo::{DistroBuilder, IndexFetcher, Repository, RepositorySink};
    use std::io::{Cursor, Read};

    struct NoopFetcher;

    impl IndexFetcher for NoopFetcher {
        fn distro(&self) -> &str {
            "static"
        }

        fn load(
            &self,
            _ctx: &crate::repo::FetchContext<'_>,
            _sink: &mut RepositorySink,
        ) -> Result<()> {
            Ok(())
        }
    }

    fn test_engine() -> (tempfile::TempDir, BuildEngine) {
        let dir = tempfile::tempdir().unwrap();
        let engine = BuildEngine::new(CoreConfig::new(dir.path().join("build"))).unwrap();
        (dir, engine)
    }

    /// Seal bytes into the store and return a definition for them
    fn sealed(engine: &BuildEngine, bytes: &[u8]) -> Definition {
        let digest = hash_bytes(bytes);
        engine.store().put(&digest, &mut Cursor::new(bytes)).unwrap();
        Definition::ConstantHash {
            hash: digest,
            opener: "test".into(),
        }
    }

    fn sealed_tar(engine: &BuildEngine, entries: &[(&str, &[u8])]) -> Definition {
        let mut builder = tar::Builder::new(Vec::new());
        for (name, content) in entries {
            let mut header = tar::Header::new_gnu();
            header.set_entry_type(tar::EntryType::Regular);
            header.set_size(content.len() as u64);
            header.set_mode(0o644);
            header.set_uid(0);
            header.set_gid(0);
            header.set_cksum();
            builder.append_data(&mut header, *name, *content).unwrap();
        }
        sealed(engine, &builder.into_inner().unwrap())
    }

    #[test]
    fn test_build_fs_from_directives() {
        let (_dir, engine) = test_engine();
        let ctx = engine.new_context(CancelToken::new());

        let def = Definition::BuildFs {
            directives: vec![
                Directive::Archive {
                    source: sealed_tar(&engine, &[("bin/busybox", b"ELF")]),
                    target_prefix: "/".into(),
                },
                Directive::AddFile {
                    path: "/etc/motd".into(),
                    source: sealed(&engine, b"welcome\n"),
                },
                Directive::RunCommand {
                    command: "echo booted".into(),
                },
            ],
            output_format: OutputFormat::Tar,
        };

        let mut product = engine
            .build(&ctx, &def, crate::engine::BuildOptions::default())
            .unwrap();
        assert_eq!(product.outcome, BuildOutcome::Built);

        let mut bytes = Vec::new();
        product.file.read_to_end(&mut bytes).unwrap();

        let mut tree = crate::assembler::VirtualTree::new();
        crate::assembler::extract_tar(&mut tree, bytes.as_slice(), "/").unwrap();

        assert!(tree.open_path("/bin/busybox").is_some());
        assert!(tree.open_path("/etc/motd").is_some());
        // Commands land in the init manifest.
        assert!(tree
            .open_path(crate::assembler::INIT_MANIFEST_PATH)
            .is_some());
    }

    #[test]
    fn test_build_fs_ext4_without_writer_is_unsupported() {
        let (_dir, engine) = test_engine();
        let ctx = engine.new_context(CancelToken::new());

        let def = Definition::BuildFs {
            directives: vec![],
            output_format: OutputFormat::Ext4,
        };

        let err = engine
            .build(&ctx, &def, crate::engine::BuildOptions::default())
            .unwrap_err();
        assert!(matches!(err, Error::Unsupported(_)));

        let digest = engine.hash_definition(&def);
        assert!(!engine.store().tmp_path(&digest).exists());
    }

    #[test]
    fn test_plan_definition_resolves_against_builder() {
        let (_dir, engine) = test_engine();
        let ctx = engine.new_context(CancelToken::new());

        let mut repo = Repository::new("static", false);
        repo.add(
            PackageBuilder::new(PackageName::new("busybox", "1.36"))
                .source(Definition::FetchHttp {
                    url: "mirror://static/busybox-1.36.apk".into(),
                    expected_size: None,
                    accept: None,
                })
                .finish(),
        );

        let builder = DistroBuilder::new("static@1", "Static", "x86_64", Box::new(NoopFetcher));
        builder.provide_repository(repo);
        engine.add_builder(builder);

        let def = Definition::Plan {
            builder: "static@1".into(),
            architecture: "x86_64".into(),
            queries: vec![PackageQuery::any("busybox")],
            tags: vec![],
        };

        let mut product = engine
            .build(&ctx, &def, crate::engine::BuildOptions::default())
            .unwrap();
        let mut bytes = Vec::new();
        product.file.read_to_end(&mut bytes).unwrap();

        let installation: InstallationPlan = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(installation.packages.len(), 1);
        assert_eq!(installation.packages[0].name.name, "busybox");
    }

    #[test]
    fn test_build_vm_produces_template() {
        let (_dir, engine) = test_engine();
        let ctx = engine.new_context(CancelToken::new());

        let kernel = sealed(&engine, b"vmlinuz bytes");
        let def = Definition::BuildVm {
            directives: vec![
                Directive::Archive {
                    source: sealed_tar(&engine, &[("bin/sh", b"ELF")]),
                    target_prefix: "/".into(),
                },
                Directive::ExportPort {
                    name: "ssh".into(),
                    port: 22,
                },
                Directive::Interaction {
                    mode: "ssh".into(),
                },
            ],
            kernel: Some(Box::new(kernel)),
            initramfs: None,
            output_name: "test-vm".into(),
            cpu_cores: 2,
            memory_mb: 512,
            architecture: "x86_64".into(),
            storage_mb: 1024,
            interaction: "serial".into(),
            debug: false,
        };

        let (path, template) = engine.build_template(&ctx, &def).unwrap();
        assert!(path.exists());

        assert_eq!(template.output_name, "test-vm");
        assert_eq!(template.cpu_cores, 2);
        // The Interaction directive overrides the definition field.
        assert_eq!(template.interaction, "ssh");
        assert_eq!(template.ports, vec![("ssh".to_string(), 22)]);
        assert!(template.kernel.is_some());
        assert!(template.initramfs.is_none());

        // The referenced rootfs artifact exists and is a tar.
        let rootfs_digest = crate::hash::Digest::parse(&template.rootfs).unwrap();
        assert!(engine.store().has(&rootfs_digest));

        let rootfs = engine.store().open_artifact(&rootfs_digest).unwrap();
        let mut archive = tar::Archive::new(rootfs);
        let names: Vec<String> = archive
            .entries()
            .unwrap()
            .map(|e| e.unwrap().path().unwrap().display().to_string())
            .collect();
        assert!(names.contains(&"bin/sh".to_string()));
    }

    #[test]
    fn test_build_template_rejects_other_variants() {
        let (_dir, engine) = test_engine();
        let ctx = engine.new_context(CancelToken::new());

        let def = sealed(&engine, b"not a vm");
        assert!(matches!(
            engine.build_template(&ctx, &def).unwrap_err(),
            Error::InvalidDefinition(_)
        ));
    }

    #[test]
    fn test_expand_packages_requires_builder_namespace() {
        let (_dir, engine) = test_engine();
        let ctx = engine.new_context(CancelToken::new());

        let err = expand_packages(&ctx, &["busybox".to_string()], "x86_64").unwrap_err();
        assert!(matches!(err, Error::InvalidDefinition(_)));
    }

    #[test]
    fn test_source_hint_from_url() {
        let def = Definition::FetchHttp {
            url: "mirror://alpine/v3.20/main/x86_64/busybox-1.36.1-r5.apk".into(),
            expected_size: None,
            accept: None,
        };
        assert_eq!(source_hint(&def), "busybox-1.36.1-r5.apk");
    }

    #[test]
    fn test_constant_hash_never_rebuilds() {
        let (_dir, engine) = test_engine();
        let ctx = engine.new_context(CancelToken::new());

        let def = sealed(&engine, b"stable");
        assert!(!needs_rebuild(&def, &ctx, SystemTime::now()).unwrap());
    }

    #[test]
    fn test_composite_rebuilds_when_nested_artifact_missing() {
        let (_dir, engine) = test_engine();
        let ctx = engine.new_context(CancelToken::new());

        let def = Definition::ReadArchive {
            base: Box::new(Definition::FetchHttp {
                url: "http://example/never-built.tar.gz".into(),
                expected_size: None,
                accept: None,
            }),
            format_hint: "tar.gz".into(),
        };

        assert!(needs_rebuild(&def, &ctx, SystemTime::now()).unwrap());
    }

    #[test]
    fn test_composite_fresh_when_nested_artifact_older() {
        let (_dir, engine) = test_engine();
        let ctx = engine.new_context(CancelToken::new());

        let base = sealed(&engine, b"nested bytes");
        let base_digest = engine.hash_definition(&base);
        engine
            .store()
            .put(&base_digest, &mut Cursor::new(b"nested artifact"))
            .unwrap();

        let def = Definition::ReadArchive {
            base: Box::new(base),
            format_hint: "tar".into(),
        };

        // The parent artifact is newer than the nested one.
        let later = SystemTime::now() + Duration::from_secs(60);
        assert!(!needs_rebuild(&def, &ctx, later).unwrap());

        // And stale when the nested artifact is newer.
        let earlier = SystemTime::now() - Duration::from_secs(60);
        assert!(needs_rebuild(&def, &ctx, earlier).unwrap());
    }
}
