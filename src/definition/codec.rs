// src/definition/codec.rs

//! Canonical encoding, hashing, and on-disk serialization of definitions
//!
//! Two encodings exist with different jobs:
//!
//! - The **canonical binary encoding** is what gets hashed: a tag byte per
//!   variant, fields in declared order, length-prefixed variable fields,
//!   and nested definitions replaced by their 32-byte digest. It is never
//!   written to disk.
//! - The **`.def` JSON encoding** is what the store persists next to each
//!   artifact: `{"kind": "...", fields...}` with nested definitions as
//!   `{"ref": "<hex>"}`. It exists so a bare hash can be turned back into
//!   an inspectable definition.

use crate::definition::{Definition, Directive, OutputFormat};
use crate::error::{Error, Result};
use crate::hash::{hash_bytes, Digest};
use crate::model::PackageQuery;
use serde_json::{json, Map, Value};

// ---------------------------------------------------------------------------
// Canonical binary encoding
// ---------------------------------------------------------------------------

const TAG_FETCH_HTTP: u8 = 1;
const TAG_READ_ARCHIVE: u8 = 2;
const TAG_CONSTANT_HASH: u8 = 3;
const TAG_PLAN: u8 = 4;
const TAG_BUILD_FS: u8 = 5;
const TAG_BUILD_VM: u8 = 6;

const DIR_ADD_FILE: u8 = 1;
const DIR_LOCAL_FILE: u8 = 2;
const DIR_ARCHIVE: u8 = 3;
const DIR_RUN_COMMAND: u8 = 4;
const DIR_ENVIRONMENT: u8 = 5;
const DIR_EXPORT_PORT: u8 = 6;
const DIR_BUILTIN: u8 = 7;
const DIR_ADD_PACKAGE: u8 = 8;
const DIR_INTERACTION: u8 = 9;

struct Encoder {
    buf: Vec<u8>,
}

impl Encoder {
    fn new() -> Self {
        Self { buf: Vec::new() }
    }

    fn u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    fn u16(&mut self, v: u16) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    fn u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    fn u64(&mut self, v: u64) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    fn boolean(&mut self, v: bool) {
        self.buf.push(v as u8);
    }

    fn str(&mut self, s: &str) {
        self.u64(s.len() as u64);
        self.buf.extend_from_slice(s.as_bytes());
    }

    fn opt_str(&mut self, s: &Option<String>) {
        match s {
            Some(s) => {
                self.u8(1);
                self.str(s);
            }
            None => self.u8(0),
        }
    }

    fn opt_u64(&mut self, v: &Option<u64>) {
        match v {
            Some(v) => {
                self.u8(1);
                self.u64(*v);
            }
            None => self.u8(0),
        }
    }

    fn digest(&mut self, d: &Digest) {
        self.buf.extend_from_slice(d.as_bytes());
    }

    fn str_list(&mut self, items: &[String]) {
        self.u64(items.len() as u64);
        for item in items {
            self.str(item);
        }
    }

    // Nested definitions are hashed by embedding their digest as a leaf,
    // so a parent's hash covers the full dependency closure.
    fn nested(&mut self, def: &Definition) {
        self.digest(&hash_definition(def));
    }

    fn opt_nested(&mut self, def: &Option<Box<Definition>>) {
        match def {
            Some(d) => {
                self.u8(1);
                self.nested(d);
            }
            None => self.u8(0),
        }
    }

    fn query(&mut self, q: &PackageQuery) {
        self.str(&q.name);
        self.str(&q.namespace);
        self.str(&q.architecture);
        self.str_list(&q.tags);
        self.str(&q.predicate);
        self.boolean(q.recommended);
    }

    fn directive(&mut self, d: &Directive) {
        match d {
            Directive::AddFile { path, source } => {
                self.u8(DIR_ADD_FILE);
                self.str(path);
                self.nested(source);
            }
            Directive::LocalFile {
                host_path,
                guest_path,
            } => {
                self.u8(DIR_LOCAL_FILE);
                self.str(host_path);
                self.str(guest_path);
            }
            Directive::Archive {
                source,
                target_prefix,
            } => {
                self.u8(DIR_ARCHIVE);
                self.nested(source);
                self.str(target_prefix);
            }
            Directive::RunCommand { command } => {
                self.u8(DIR_RUN_COMMAND);
                self.str(command);
            }
            Directive::Environment { vars } => {
                self.u8(DIR_ENVIRONMENT);
                self.str_list(vars);
            }
            Directive::ExportPort { name, port } => {
                self.u8(DIR_EXPORT_PORT);
                self.str(name);
                self.u16(*port);
            }
            Directive::Builtin {
                name,
                architecture,
                guest_path,
            } => {
                self.u8(DIR_BUILTIN);
                self.str(name);
                self.str(architecture);
                self.str(guest_path);
            }
            Directive::AddPackage { name } => {
                self.u8(DIR_ADD_PACKAGE);
                self.str(name);
            }
            Directive::Interaction { mode } => {
                self.u8(DIR_INTERACTION);
                self.str(mode);
            }
        }
    }

    fn directives(&mut self, items: &[Directive]) {
        self.u64(items.len() as u64);
        for d in items {
            self.directive(d);
        }
    }
}

/// Produce the canonical binary encoding of a definition
pub fn encode_definition(def: &Definition) -> Vec<u8> {
    let mut enc = Encoder::new();

    match def {
        Definition::FetchHttp {
            url,
            expected_size,
            accept,
        } => {
            enc.u8(TAG_FETCH_HTTP);
            enc.str(url);
            enc.opt_u64(expected_size);
            enc.opt_str(accept);
        }
        Definition::ReadArchive { base, format_hint } => {
            enc.u8(TAG_READ_ARCHIVE);
            enc.nested(base);
            enc.str(format_hint);
        }
        Definition::ConstantHash { hash, opener } => {
            enc.u8(TAG_CONSTANT_HASH);
            enc.digest(hash);
            enc.str(opener);
        }
        Definition::Plan {
            builder,
            architecture,
            queries,
            tags,
        } => {
            enc.u8(TAG_PLAN);
            enc.str(builder);
            enc.str(architecture);
            enc.u64(queries.len() as u64);
            for q in queries {
                enc.query(q);
            }
            enc.str_list(tags);
        }
        Definition::BuildFs {
            directives,
            output_format,
        } => {
            enc.u8(TAG_BUILD_FS);
            enc.directives(directives);
            enc.u8(match output_format {
                OutputFormat::Tar => 0,
                OutputFormat::Ext4 => 1,
            });
        }
        Definition::BuildVm {
            directives,
            kernel,
            initramfs,
            output_name,
            cpu_cores,
            memory_mb,
            architecture,
            storage_mb,
            interaction,
            debug,
        } => {
            enc.u8(TAG_BUILD_VM);
            enc.directives(directives);
            enc.opt_nested(kernel);
            enc.opt_nested(initramfs);
            enc.str(output_name);
            enc.u32(*cpu_cores);
            enc.u64(*memory_mb);
            enc.str(architecture);
            enc.u64(*storage_mb);
            enc.str(interaction);
            enc.boolean(*debug);
        }
    }

    enc.buf
}

/// Hash a definition: SHA-256 over its canonical encoding
pub fn hash_definition(def: &Definition) -> Digest {
    hash_bytes(&encode_definition(def))
}

// ---------------------------------------------------------------------------
// .def JSON encoding
// ---------------------------------------------------------------------------

fn ref_value(def: &Definition) -> Value {
    json!({ "ref": hash_definition(def).to_hex() })
}

fn directive_to_wire(d: &Directive) -> Value {
    match d {
        Directive::AddFile { path, source } => json!({
            "kind": "add_file",
            "path": path,
            "source": ref_value(source),
        }),
        Directive::LocalFile {
            host_path,
            guest_path,
        } => json!({
            "kind": "local_file",
            "host_path": host_path,
            "guest_path": guest_path,
        }),
        Directive::Archive {
            source,
            target_prefix,
        } => json!({
            "kind": "archive",
            "source": ref_value(source),
            "target_prefix": target_prefix,
        }),
        Directive::RunCommand { command } => json!({
            "kind": "run_command",
            "command": command,
        }),
        Directive::Environment { vars } => json!({
            "kind": "environment",
            "vars": vars,
        }),
        Directive::ExportPort { name, port } => json!({
            "kind": "export_port",
            "name": name,
            "port": port,
        }),
        Directive::Builtin {
            name,
            architecture,
            guest_path,
        } => json!({
            "kind": "builtin",
            "name": name,
            "architecture": architecture,
            "guest_path": guest_path,
        }),
        Directive::AddPackage { name } => json!({
            "kind": "add_package",
            "name": name,
        }),
        Directive::Interaction { mode } => json!({
            "kind": "interaction",
            "mode": mode,
        }),
    }
}

fn definition_to_wire(def: &Definition) -> Value {
    match def {
        Definition::FetchHttp {
            url,
            expected_size,
            accept,
        } => {
            let mut obj = Map::new();
            obj.insert("kind".into(), json!("fetch_http"));
            obj.insert("url".into(), json!(url));
            if let Some(size) = expected_size {
                obj.insert("expected_size".into(), json!(size));
            }
            if let Some(accept) = accept {
                obj.insert("accept".into(), json!(accept));
            }
            Value::Object(obj)
        }
        Definition::ReadArchive { base, format_hint } => json!({
            "kind": "read_archive",
            "base": ref_value(base),
            "format_hint": format_hint,
        }),
        Definition::ConstantHash { hash, opener } => json!({
            "kind": "constant_hash",
            "hash": hash.to_hex(),
            "opener": opener,
        }),
        Definition::Plan {
            builder,
            architecture,
            queries,
            tags,
        } => json!({
            "kind": "plan",
            "builder": builder,
            "architecture": architecture,
            "queries": queries,
            "tags": tags,
        }),
        Definition::BuildFs {
            directives,
            output_format,
        } => json!({
            "kind": "build_fs",
            "directives": directives.iter().map(directive_to_wire).collect::<Vec<_>>(),
            "output_format": output_format.name(),
        }),
        Definition::BuildVm {
            directives,
            kernel,
            initramfs,
            output_name,
            cpu_cores,
            memory_mb,
            architecture,
            storage_mb,
            interaction,
            debug,
        } => {
            let mut obj = Map::new();
            obj.insert("kind".into(), json!("build_vm"));
            obj.insert(
                "directives".into(),
                Value::Array(directives.iter().map(directive_to_wire).collect()),
            );
            if let Some(k) = kernel {
                obj.insert("kernel".into(), ref_value(k));
            }
            if let Some(i) = initramfs {
                obj.insert("initramfs".into(), ref_value(i));
            }
            obj.insert("output_name".into(), json!(output_name));
            obj.insert("cpu_cores".into(), json!(cpu_cores));
            obj.insert("memory_mb".into(), json!(memory_mb));
            obj.insert("architecture".into(), json!(architecture));
            obj.insert("storage_mb".into(), json!(storage_mb));
            obj.insert("interaction".into(), json!(interaction));
            obj.insert("debug".into(), json!(debug));
            Value::Object(obj)
        }
    }
}

/// Serialize a definition to the `.def` JSON form
pub fn marshal_definition(def: &Definition) -> Result<Vec<u8>> {
    let value = definition_to_wire(def);
    Ok(serde_json::to_vec_pretty(&value)?)
}

/// A callback that turns a nested `{"ref": ...}` digest back into a
/// definition, usually by reading another `.def` file from the store
pub type RefResolver<'a> = dyn Fn(&Digest) -> Result<Definition> + 'a;

fn get_str(obj: &Map<String, Value>, key: &str) -> Result<String> {
    obj.get(key)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| Error::InvalidDefinition(format!("missing string field {:?}", key)))
}

fn get_u64(obj: &Map<String, Value>, key: &str) -> Result<u64> {
    obj.get(key)
        .and_then(Value::as_u64)
        .ok_or_else(|| Error::InvalidDefinition(format!("missing integer field {:?}", key)))
}

fn get_bool(obj: &Map<String, Value>, key: &str) -> bool {
    obj.get(key).and_then(Value::as_bool).unwrap_or(false)
}

fn get_str_list(obj: &Map<String, Value>, key: &str) -> Vec<String> {
    obj.get(key)
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

fn resolve_ref(value: &Value, resolver: &RefResolver) -> Result<Definition> {
    let obj = value
        .as_object()
        .ok_or_else(|| Error::InvalidDefinition("nested definition is not an object".into()))?;
    let hex = get_str(obj, "ref")?;
    let digest = Digest::parse(&hex)?;
    resolver(&digest)
}

fn directive_from_wire(value: &Value, resolver: &RefResolver) -> Result<Directive> {
    let obj = value
        .as_object()
        .ok_or_else(|| Error::InvalidDefinition("directive is not an object".into()))?;
    let kind = get_str(obj, "kind")?;

    match kind.as_str() {
        "add_file" => Ok(Directive::AddFile {
            path: get_str(obj, "path")?,
            source: resolve_ref(
                obj.get("source")
                    .ok_or_else(|| Error::InvalidDefinition("add_file missing source".into()))?,
                resolver,
            )?,
        }),
        "local_file" => Ok(Directive::LocalFile {
            host_path: get_str(obj, "host_path")?,
            guest_path: get_str(obj, "guest_path")?,
        }),
        "archive" => Ok(Directive::Archive {
            source: resolve_ref(
                obj.get("source")
                    .ok_or_else(|| Error::InvalidDefinition("archive missing source".into()))?,
                resolver,
            )?,
            target_prefix: get_str(obj, "target_prefix")?,
        }),
        "run_command" => Ok(Directive::RunCommand {
            command: get_str(obj, "command")?,
        }),
        "environment" => Ok(Directive::Environment {
            vars: get_str_list(obj, "vars"),
        }),
        "export_port" => Ok(Directive::ExportPort {
            name: get_str(obj, "name")?,
            port: get_u64(obj, "port")? as u16,
        }),
        "builtin" => Ok(Directive::Builtin {
            name: get_str(obj, "name")?,
            architecture: get_str(obj, "architecture")?,
            guest_path: get_str(obj, "guest_path")?,
        }),
        "add_package" => Ok(Directive::AddPackage {
            name: get_str(obj, "name")?,
        }),
        "interaction" => Ok(Directive::Interaction {
            mode: get_str(obj, "mode")?,
        }),
        other => Err(Error::InvalidDefinition(format!(
            "unknown directive kind {:?}",
            other
        ))),
    }
}

fn directives_from_wire(obj: &Map<String, Value>, resolver: &RefResolver) -> Result<Vec<Directive>> {
    obj.get("directives")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .map(|item| directive_from_wire(item, resolver))
                .collect()
        })
        .unwrap_or_else(|| Ok(Vec::new()))
}

/// Deserialize a `.def` JSON document back into a definition
///
/// Nested `{"ref": ...}` entries are resolved through `resolver`. The
/// caller is responsible for verifying that the result re-hashes to the
/// digest the document was stored under.
pub fn unmarshal_definition(bytes: &[u8], resolver: &RefResolver) -> Result<Definition> {
    let value: Value = serde_json::from_slice(bytes)?;
    definition_from_wire(&value, resolver)
}

fn definition_from_wire(value: &Value, resolver: &RefResolver) -> Result<Definition> {
    let obj = value
        .as_object()
        .ok_or_else(|| Error::InvalidDefinition("definition is not an object".into()))?;
    let kind = get_str(obj, "kind")?;

    match kind.as_str() {
        "fetch_http" => Ok(Definition::FetchHttp {
            url: get_str(obj, "url")?,
            expected_size: obj.get("expected_size").and_then(Value::as_u64),
            accept: obj
                .get("accept")
                .and_then(Value::as_str)
                .map(str::to_string),
        }),
        "read_archive" => Ok(Definition::ReadArchive {
            base: Box::new(resolve_ref(
                obj.get("base")
                    .ok_or_else(|| Error::InvalidDefinition("read_archive missing base".into()))?,
                resolver,
            )?),
            format_hint: get_str(obj, "format_hint")?,
        }),
        "constant_hash" => Ok(Definition::ConstantHash {
            hash: Digest::parse(&get_str(obj, "hash")?)?,
            opener: get_str(obj, "opener")?,
        }),
        "plan" => {
            let queries = obj
                .get("queries")
                .cloned()
                .unwrap_or_else(|| Value::Array(Vec::new()));
            Ok(Definition::Plan {
                builder: get_str(obj, "builder")?,
                architecture: get_str(obj, "architecture")?,
                queries: serde_json::from_value(queries)?,
                tags: get_str_list(obj, "tags"),
            })
        }
        "build_fs" => {
            let output_format = match get_str(obj, "output_format")?.as_str() {
                "tar" => OutputFormat::Tar,
                "ext4" => OutputFormat::Ext4,
                other => {
                    return Err(Error::InvalidDefinition(format!(
                        "unknown output format {:?}",
                        other
                    )))
                }
            };
            Ok(Definition::BuildFs {
                directives: directives_from_wire(obj, resolver)?,
                output_format,
            })
        }
        "build_vm" => Ok(Definition::BuildVm {
            directives: directives_from_wire(obj, resolver)?,
            kernel: match obj.get("kernel") {
                Some(v) => Some(Box::new(resolve_ref(v, resolver)?)),
                None => None,
            },
            initramfs: match obj.get("initramfs") {
                Some(v) => Some(Box::new(resolve_ref(v, resolver)?)),
                None => None,
            },
            output_name: get_str(obj, "output_name")?,
            cpu_cores: get_u64(obj, "cpu_cores")? as u32,
            memory_mb: get_u64(obj, "memory_mb")?,
            architecture: get_str(obj, "architecture")?,
            storage_mb: get_u64(obj, "storage_mb")?,
            interaction: get_str(obj, "interaction")?,
            debug: get_bool(obj, "debug"),
        }),
        other => Err(Error::InvalidDefinition(format!(
            "unknown definition kind {:?}",
            other
        ))),
    }
}
