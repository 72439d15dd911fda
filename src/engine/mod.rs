// src/engine/mod.rs

//! Content-addressed build engine
//!
//! [`BuildEngine::build`] executes a definition and memoizes the result
//! three ways: an in-memory cache for repeat calls in one process, the
//! on-disk artifact store across processes, and (for redistributable
//! definitions) a distribution mirror shared across machines.
//!
//! The write protocol is atomic: builders produce bytes into
//! `<hash>.bin.tmp`, which is fsynced and renamed into place. A partial
//! `.bin` is never observable, and any failure removes the tmp file.
//! Concurrent builds of one hash are collapsed to a single computation by
//! a per-hash lock.

mod exec;

pub use exec::VmTemplate;

use crate::assembler::BlockImageWriter;
use crate::cancel::CancelToken;
use crate::config::CoreConfig;
use crate::definition::{Definition, DefinitionRegistry};
use crate::error::{Error, Result};
use crate::fetch::{FetchOptions, HttpFetcher};
use crate::hash::Digest;
use crate::repo::{BuilderRegistry, DistroBuilder};
use crate::store::{
    ArtifactStore, SUFFIX_DOWNLOADED, SUFFIX_REDISTRIBUTABLE,
};
use std::collections::HashMap;
use std::fs::File;
use std::io::{Read, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

/// How a build request was satisfied
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildOutcome {
    /// The definition was executed locally
    Built,
    /// An existing artifact was reused
    Cached,
    /// The artifact came from the distribution mirror
    Downloaded,
}

/// Options for a single build call
#[derive(Debug, Clone, Copy, Default)]
pub struct BuildOptions {
    /// Skip every cache and execute the definition again
    pub always_rebuild: bool,
}

/// Per-definition status record kept for observability
#[derive(Debug, Clone)]
pub struct BuildStatus {
    pub tag: String,
    pub outcome: BuildOutcome,
}

/// A successful build: an open artifact plus its identity
#[derive(Debug)]
pub struct BuildProduct {
    pub file: File,
    pub path: PathBuf,
    pub hash: Digest,
    pub outcome: BuildOutcome,
}

/// What a definition execution hands back to the engine
///
/// `None` from the executor means "reuse the existing artifact". A
/// writer either streams bytes into the engine-provided tmp file or,
/// when the executor already created the tmp itself (observed via the
/// context flag), finalizes with `write_result(None)`.
pub trait ResultWriter {
    fn write_result(&mut self, out: Option<&mut File>) -> Result<()>;
}

/// Supplies built-in executables (init agent, guest tools) to
/// `Builtin` directives
pub trait BuiltinProvider: Send + Sync {
    fn open(&self, name: &str, architecture: &str) -> Result<Vec<u8>>;
}

struct CachedBuild {
    path: PathBuf,
    outcome: BuildOutcome,
}

/// The build engine and its shared state
pub struct BuildEngine {
    config: CoreConfig,
    store: ArtifactStore,
    http: Arc<HttpFetcher>,
    registry: Arc<DefinitionRegistry>,
    builders: BuilderRegistry,
    image_writer: Option<Box<dyn BlockImageWriter>>,
    builtin_provider: Option<Box<dyn BuiltinProvider>>,
    distribution_server: Mutex<Option<String>>,
    memory_cache: Mutex<HashMap<Digest, CachedBuild>>,
    statuses: Mutex<HashMap<Digest, BuildStatus>>,
    flight_locks: Mutex<HashMap<Digest, Arc<Mutex<()>>>>,
}

impl BuildEngine {
    pub fn new(config: CoreConfig) -> Result<Self> {
        let store = ArtifactStore::open(&config.build_dir)?;
        let http = Arc::new(HttpFetcher::new(
            config.build_dir.join("fetch"),
            config.parallel_fetchers,
        )?);

        for (name, urls) in &config.mirror_table {
            http.add_mirror(name.clone(), urls.clone());
        }

        let miss_store = store.clone();
        let registry = Arc::new(DefinitionRegistry::new(Box::new(move |digest| {
            miss_store.definition_bytes(digest)
        })));

        let engine = Self {
            config,
            store,
            http,
            registry,
            builders: BuilderRegistry::new(),
            image_writer: None,
            builtin_provider: None,
            distribution_server: Mutex::new(None),
            memory_cache: Mutex::new(HashMap::new()),
            statuses: Mutex::new(HashMap::new()),
            flight_locks: Mutex::new(HashMap::new()),
        };

        if let Some(server) = engine.config.distribution_server.clone() {
            if let Err(e) = engine.set_distribution_server(&server) {
                warn!(server = %server, error = %e, "distribution server unavailable, continuing without it");
            }
        }

        Ok(engine)
    }

    /// Register the external ext4 image writer
    pub fn with_image_writer(mut self, writer: Box<dyn BlockImageWriter>) -> Self {
        self.image_writer = Some(writer);
        self
    }

    /// Register the provider of built-in executables
    pub fn with_builtin_provider(mut self, provider: Box<dyn BuiltinProvider>) -> Self {
        self.builtin_provider = Some(provider);
        self
    }

    pub fn store(&self) -> &ArtifactStore {
        &self.store
    }

    pub fn http(&self) -> &HttpFetcher {
        &self.http
    }

    pub fn builders(&self) -> &BuilderRegistry {
        &self.builders
    }

    /// Register a distribution builder
    pub fn add_builder(&self, builder: DistroBuilder) {
        self.builders.add_builder(builder);
    }

    /// Warm every registered repository fetcher
    pub fn load_all_builders(&self, cancel: &CancelToken) -> Result<()> {
        self.builders
            .load_all(&self.http, cancel, self.config.parallel_fetchers)
    }

    /// Probe and adopt a distribution mirror
    ///
    /// The mirror must answer `GET /health` with body `OK`.
    pub fn set_distribution_server(&self, server: &str) -> Result<()> {
        let url = format!("{}/health", server.trim_end_matches('/'));
        let fetched = self
            .http
            .fetch(&url, &FetchOptions::default(), &CancelToken::new())?
            .ok_or_else(|| Error::NotFound(format!("health endpoint {}", url)))?;

        let mut body = String::new();
        let mut file = fetched.file;
        file.read_to_string(&mut body)?;

        if body.trim() != "OK" {
            return Err(Error::Network {
                url,
                reason: format!("unexpected health response {:?}", body.trim()),
            });
        }

        info!(server, "distribution server enabled");
        *self
            .distribution_server
            .lock()
            .expect("distribution server lock poisoned") = Some(server.trim_end_matches('/').to_string());
        Ok(())
    }

    fn distribution_server(&self) -> Option<String> {
        self.distribution_server
            .lock()
            .expect("distribution server lock poisoned")
            .clone()
    }

    /// Create a root build context
    pub fn new_context(&self, cancel: CancelToken) -> BuildContext<'_> {
        BuildContext {
            engine: self,
            source_tag: None,
            tmp_path: None,
            created_output: AtomicBool::new(false),
            cancel,
        }
    }

    /// Hash a definition, remembering it in the registry
    pub fn hash_definition(&self, def: &Definition) -> Digest {
        self.registry.hash(def)
    }

    /// Reload a definition from memory or its `.def` file
    pub fn definition_by_hash(&self, digest: &Digest) -> Result<Definition> {
        self.registry.definition_by_hash(digest)
    }

    /// Every digest present in the store
    pub fn all_hashes(&self) -> Result<Vec<String>> {
        self.store.all_hashes()
    }

    /// The recorded status of a definition, if it was built this session
    pub fn status(&self, def: &Definition) -> Option<BuildStatus> {
        let digest = self.registry.hash(def);
        self.statuses
            .lock()
            .expect("status map poisoned")
            .get(&digest)
            .cloned()
    }

    fn record_status(&self, digest: Digest, tag: String, outcome: BuildOutcome) {
        self.statuses
            .lock()
            .expect("status map poisoned")
            .insert(digest, BuildStatus { tag, outcome });
    }

    fn flight_lock(&self, digest: Digest) -> Arc<Mutex<()>> {
        self.flight_locks
            .lock()
            .expect("flight lock table poisoned")
            .entry(digest)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    fn memory_hit(&self, digest: &Digest) -> Option<Result<BuildProduct>> {
        let cache = self.memory_cache.lock().expect("memory cache poisoned");
        let cached = cache.get(digest)?;
        Some(File::open(&cached.path).map_err(Error::Io).map(|file| {
            BuildProduct {
                file,
                path: cached.path.clone(),
                hash: *digest,
                outcome: cached.outcome,
            }
        }))
    }

    /// Build a definition
    ///
    /// Returns the artifact and how it was obtained. Concurrent calls
    /// with the same hash perform exactly one computation.
    pub fn build(
        &self,
        ctx: &BuildContext<'_>,
        def: &Definition,
        opts: BuildOptions,
    ) -> Result<BuildProduct> {
        ctx.cancel.check()?;

        let digest = self.registry.hash(def);

        if let Some(hit) = self.memory_hit(&digest) {
            return hit;
        }

        let lock = self.flight_lock(digest);
        let _guard = lock.lock().expect("flight lock poisoned");

        // Another worker may have finished while this one waited.
        if let Some(hit) = self.memory_hit(&digest) {
            return hit;
        }

        let tag = def.tag();
        let bin_path = self.store.path_for(&digest, crate::store::SUFFIX_BIN);
        let child = ctx.child(def, self.store.tmp_path(&digest));

        if !opts.always_rebuild {
            if let Some(mtime) = self.store.artifact_mtime(&digest) {
                let needs_rebuild = if !self.store.is_marked(&digest, SUFFIX_DOWNLOADED) {
                    exec::needs_rebuild(def, &child, mtime)?
                } else {
                    // Redistributed results count as user definitions.
                    self.config.rebuild_user_definitions
                };

                if !needs_rebuild {
                    debug!(tag = %tag, "cached");
                    return self.finish(digest, tag, BuildOutcome::Cached, bin_path);
                }
                debug!(tag = %tag, "rebuild requested");
            } else {
                debug!(tag = %tag, "building");
            }
        } else {
            debug!(tag = %tag, "building (rebuild forced)");
        }

        // Persist the definition before producing bytes so the hash can
        // always be resolved back to an inspectable definition.
        let def_bytes = crate::definition::marshal_definition(def)?;
        self.store.put_definition(&digest, &def_bytes)?;

        if let Some(server) = self.distribution_server() {
            if def.redistributable() {
                if self.try_download(&server, &digest, &child)? {
                    info!(tag = %tag, "downloaded from distribution server");
                    self.store.mark(&digest, SUFFIX_REDISTRIBUTABLE)?;
                    return self.finish(digest, tag, BuildOutcome::Downloaded, bin_path);
                }
            }
        }

        let result = match exec::execute(def, &child) {
            Ok(result) => result,
            Err(e) => {
                self.store.discard_tmp(&digest);
                return Err(e);
            }
        };

        let Some(mut writer) = result else {
            // The executor is telling us the existing artifact is valid.
            debug!(tag = %tag, "executor reused existing artifact");
            return self.finish(digest, tag, BuildOutcome::Cached, bin_path);
        };

        self.write_and_commit(&digest, writer.as_mut(), &child)?;

        if def.redistributable() {
            self.store.mark(&digest, SUFFIX_REDISTRIBUTABLE)?;
        }

        info!(tag = %tag, artifact = %digest, "built");
        self.finish(digest, tag, BuildOutcome::Built, bin_path)
    }

    /// Stream a writer's output through the tmp path and rename it live
    fn write_and_commit(
        &self,
        digest: &Digest,
        writer: &mut dyn ResultWriter,
        child: &BuildContext<'_>,
    ) -> Result<()> {
        if !child.has_created_output() {
            let tmp = self.store.tmp_path(digest);
            let mut out = match File::create(&tmp) {
                Ok(f) => f,
                Err(e) => {
                    self.store.discard_tmp(digest);
                    return Err(Error::Io(e));
                }
            };

            if let Err(e) = writer.write_result(Some(&mut out)) {
                drop(out);
                self.store.discard_tmp(digest);
                return Err(e);
            }
            if let Err(e) = out.sync_all() {
                drop(out);
                self.store.discard_tmp(digest);
                return Err(Error::Io(e));
            }
        } else {
            // The executor created the tmp file itself; let it finalize.
            if let Err(e) = writer.write_result(None) {
                self.store.discard_tmp(digest);
                return Err(e);
            }
        }

        self.store.commit_tmp(digest)
    }

    fn finish(
        &self,
        digest: Digest,
        tag: String,
        outcome: BuildOutcome,
        path: PathBuf,
    ) -> Result<BuildProduct> {
        self.record_status(digest, tag, outcome);
        self.memory_cache
            .lock()
            .expect("memory cache poisoned")
            .insert(
                digest,
                CachedBuild {
                    path: path.clone(),
                    outcome,
                },
            );

        let file = File::open(&path)?;
        Ok(BuildProduct {
            file,
            path,
            hash: digest,
            outcome,
        })
    }

    /// Try the distribution mirror; `Ok(true)` when the artifact landed
    fn try_download(
        &self,
        server: &str,
        digest: &Digest,
        child: &BuildContext<'_>,
    ) -> Result<bool> {
        let url = format!("{}/result/{}", server, digest);

        let Some(mut fetched) =
            self.http
                .fetch(&url, &FetchOptions::default(), &child.cancel)?
        else {
            return Ok(false);
        };

        self.store.put(digest, &mut fetched.file)?;
        self.store.mark(digest, SUFFIX_DOWNLOADED)?;
        Ok(true)
    }

    /// Build a `BuildVm` definition's launch template
    ///
    /// This is the template-mode contract: the flattened VM parameters
    /// are serialized without invoking any hypervisor, and the caller
    /// receives the template path alongside the parsed template.
    pub fn build_template(
        &self,
        ctx: &BuildContext<'_>,
        def: &Definition,
    ) -> Result<(PathBuf, VmTemplate)> {
        if !matches!(def, Definition::BuildVm { .. }) {
            return Err(Error::InvalidDefinition(format!(
                "{} is not a build_vm definition",
                def.tag()
            )));
        }

        let product = self.build(ctx, def, BuildOptions::default())?;
        let mut body = String::new();
        let mut file = product.file;
        file.read_to_string(&mut body)?;
        let template: VmTemplate = serde_json::from_str(&body)?;
        Ok((product.path, template))
    }

    /// Pretty-print a definition and, when its artifact exists and is an
    /// archive, list the archive entries
    pub fn inspect(&self, def: &Definition, out: &mut dyn Write) -> Result<()> {
        let digest = self.registry.hash(def);
        let def_bytes = crate::definition::marshal_definition(def)?;

        writeln!(out, "definition {}:", digest)?;
        out.write_all(&def_bytes)?;
        writeln!(out)?;

        if !self.store.has(&digest) {
            writeln!(out, "artifact not built")?;
            return Ok(());
        }

        let file = self.store.open_artifact(&digest)?;
        let mut archive = tar::Archive::new(file);
        let Ok(entries) = archive.entries() else {
            writeln!(out, "artifact is not an archive")?;
            return Ok(());
        };

        writeln!(out, "archive entries:")?;
        for entry in entries {
            let Ok(entry) = entry else {
                writeln!(out, "artifact is not an archive")?;
                return Ok(());
            };
            let header = entry.header();
            writeln!(
                out,
                "{} {:04}:{:04} {:>10} {}",
                match header.entry_type() {
                    tar::EntryType::Directory => "D",
                    tar::EntryType::Symlink => "S",
                    tar::EntryType::Link => "L",
                    _ => "R",
                },
                header.uid().unwrap_or(0),
                header.gid().unwrap_or(0),
                entry.size(),
                entry.path().map(|p| p.display().to_string()).unwrap_or_default()
            )?;
        }

        Ok(())
    }

    /// Verify an on-disk definition re-hashes to its filename, or
    /// quarantine the artifact
    ///
    /// Returns the reloaded definition on success. On a hash mismatch
    /// the artifact is moved aside so the next build starts fresh, and
    /// `CorruptStore` is returned.
    pub fn verify_stored_definition(&self, digest: &Digest) -> Result<Definition> {
        match self.registry.definition_by_hash(digest) {
            Ok(def) => Ok(def),
            Err(e @ Error::CorruptStore { .. }) => {
                if self.store.has(digest) {
                    self.store.quarantine(digest)?;
                }
                self.memory_cache
                    .lock()
                    .expect("memory cache poisoned")
                    .remove(digest);
                Err(e)
            }
            Err(e) => Err(e),
        }
    }
}

/// Per-build context threaded through executors
///
/// Carries the parent definition's tag for error reporting, the tmp path
/// a builder may write into directly, and the cancellation token.
pub struct BuildContext<'e> {
    engine: &'e BuildEngine,
    source_tag: Option<String>,
    tmp_path: Option<PathBuf>,
    created_output: AtomicBool,
    cancel: CancelToken,
}

impl<'e> BuildContext<'e> {
    fn child(&self, def: &Definition, tmp_path: PathBuf) -> BuildContext<'e> {
        BuildContext {
            engine: self.engine,
            source_tag: Some(def.tag()),
            tmp_path: Some(tmp_path),
            created_output: AtomicBool::new(false),
            cancel: self.cancel.clone(),
        }
    }

    pub fn engine(&self) -> &'e BuildEngine {
        self.engine
    }

    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    /// The tag of the definition this context was created for
    pub fn source_tag(&self) -> &str {
        self.source_tag.as_deref().unwrap_or("<root>")
    }

    /// The tmp path the current build may write into directly
    pub fn tmp_path(&self) -> Result<&PathBuf> {
        self.tmp_path
            .as_ref()
            .ok_or_else(|| Error::InvalidDefinition("root context has no output".into()))
    }

    /// Record that the builder created the tmp output itself
    pub fn set_created_output(&self) {
        self.created_output.store(true, Ordering::SeqCst);
    }

    pub fn has_created_output(&self) -> bool {
        self.created_output.load(Ordering::SeqCst)
    }

    /// Recursively build a nested definition
    pub fn build(&self, def: &Definition, opts: BuildOptions) -> Result<BuildProduct> {
        self.engine.build(self, def, opts)
    }

    /// Build a nested definition and read its artifact fully
    pub fn build_bytes(&self, def: &Definition) -> Result<Vec<u8>> {
        let mut product = self.build(def, BuildOptions::default())?;
        let mut bytes = Vec::new();
        product.file.read_to_end(&mut bytes)?;
        Ok(bytes)
    }
}
