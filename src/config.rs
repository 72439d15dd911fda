// src/config.rs

//! Core and recipe configuration
//!
//! [`CoreConfig`] is what the engine consumes directly. [`RecipeConfig`]
//! is the parsed form of the user-facing recipe files; upstream callers
//! parse JSON (or hand over an equivalent structure) and convert it into
//! a `BuildVm` definition with [`RecipeConfig::to_definition`].

use crate::definition::{Definition, Directive, OutputFormat};
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

fn default_parallel_fetchers() -> usize {
    10
}

/// Engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoreConfig {
    /// Root of the artifact store
    pub build_dir: PathBuf,
    /// Distribution mirror base URL, if redistribution is enabled
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub distribution_server: Option<String>,
    /// Rebuild artifacts that were downloaded from the mirror
    #[serde(default)]
    pub rebuild_user_definitions: bool,
    /// Bound on concurrently loading repository fetchers
    #[serde(default = "default_parallel_fetchers")]
    pub parallel_fetchers: usize,
    /// Mirror name to candidate base URLs
    #[serde(default)]
    pub mirror_table: HashMap<String, Vec<String>>,
}

impl CoreConfig {
    pub fn new(build_dir: impl Into<PathBuf>) -> Self {
        Self {
            build_dir: build_dir.into(),
            distribution_server: None,
            rebuild_user_definitions: false,
            parallel_fetchers: default_parallel_fetchers(),
            mirror_table: HashMap::new(),
        }
    }
}

/// The host's architecture in kernel spelling
pub fn native_architecture() -> &'static str {
    match std::env::consts::ARCH {
        "x86_64" => "x86_64",
        "aarch64" => "aarch64",
        other => other,
    }
}

fn default_cpu_cores() -> u32 {
    1
}

fn default_memory_mb() -> u64 {
    1024
}

fn default_storage_mb() -> u64 {
    1024
}

/// A host file mapped into the guest
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecipeFile {
    pub host_path: String,
    pub guest_path: String,
}

/// A forwarded port
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForwardPort {
    pub name: String,
    pub port: u16,
}

/// Parsed form of a user recipe
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RecipeConfig {
    /// Distribution builder, e.g. `alpine@3.20`
    pub builder: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub architecture: Option<String>,
    #[serde(default)]
    pub packages: Vec<String>,
    #[serde(default)]
    pub files: Vec<RecipeFile>,
    /// URLs of extra archives extracted into the image root
    #[serde(default)]
    pub archives: Vec<String>,
    #[serde(default)]
    pub commands: Vec<String>,
    #[serde(default)]
    pub environment: Vec<String>,
    /// Named macro invocations expanded by the scripting frontend
    #[serde(default)]
    pub macros: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(default)]
    pub no_scripts: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub init: Option<String>,
    #[serde(default)]
    pub forward_ports: Vec<ForwardPort>,
    #[serde(default = "default_cpu_cores")]
    pub cpu_cores: u32,
    #[serde(default = "default_memory_mb")]
    pub memory_mb: u64,
    #[serde(default = "default_storage_mb")]
    pub storage_mb: u64,
    #[serde(default)]
    pub experimental_flags: Vec<String>,
    #[serde(default)]
    pub debug: bool,
}

impl RecipeConfig {
    /// Load a recipe from a JSON file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let bytes = std::fs::read(path.as_ref())?;
        let recipe: RecipeConfig = serde_json::from_slice(&bytes)?;
        recipe.validate()?;
        Ok(recipe)
    }

    pub fn validate(&self) -> Result<()> {
        if self.builder.is_empty() {
            return Err(Error::Parse {
                what: "recipe".into(),
                reason: "no builder named".into(),
            });
        }
        Ok(())
    }

    /// The architecture this recipe targets
    pub fn architecture(&self) -> String {
        self.architecture
            .clone()
            .unwrap_or_else(|| native_architecture().to_string())
    }

    /// Convert the recipe into a `BuildVm` definition
    ///
    /// Package names gain the builder as their namespace so the plan
    /// expansion knows which repository to query.
    pub fn to_definition(&self) -> Result<Definition> {
        self.validate()?;

        let mut directives = Vec::new();

        for package in &self.packages {
            let name = if package.contains('@') {
                package.clone()
            } else {
                format!("{}@{}", package, self.builder)
            };
            directives.push(Directive::AddPackage { name });
        }

        for archive in &self.archives {
            directives.push(Directive::Archive {
                source: Definition::ReadArchive {
                    base: Box::new(Definition::FetchHttp {
                        url: archive.clone(),
                        expected_size: None,
                        accept: None,
                    }),
                    format_hint: archive.clone(),
                },
                target_prefix: "/".into(),
            });
        }

        for file in &self.files {
            directives.push(Directive::LocalFile {
                host_path: file.host_path.clone(),
                guest_path: file.guest_path.clone(),
            });
        }

        if !self.no_scripts {
            for command in &self.commands {
                directives.push(Directive::RunCommand {
                    command: command.clone(),
                });
            }
        }
        if !self.environment.is_empty() {
            directives.push(Directive::Environment {
                vars: self.environment.clone(),
            });
        }

        for port in &self.forward_ports {
            directives.push(Directive::ExportPort {
                name: port.name.clone(),
                port: port.port,
            });
        }

        if let Some(init) = &self.init {
            directives.push(Directive::Builtin {
                name: init.clone(),
                architecture: self.architecture(),
                guest_path: "/sbin/init".into(),
            });
        }

        Ok(Definition::BuildVm {
            directives,
            kernel: None,
            initramfs: None,
            output_name: self
                .output
                .clone()
                .unwrap_or_else(|| format!("{}.img", self.builder.replace('@', "-"))),
            cpu_cores: self.cpu_cores,
            memory_mb: self.memory_mb,
            architecture: self.architecture(),
            storage_mb: self.storage_mb,
            interaction: "serial".into(),
            debug: self.debug,
        })
    }

    /// Convert the recipe into a bare filesystem build
    pub fn to_fs_definition(&self, output_format: OutputFormat) -> Result<Definition> {
        let Definition::BuildVm { directives, .. } = self.to_definition()? else {
            unreachable!("to_definition returns a build_vm");
        };

        Ok(Definition::BuildFs {
            directives,
            output_format,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"{
        "builder": "alpine@3.20",
        "packages": ["busybox", "musl@alpine@3.20"],
        "commands": ["echo ready"],
        "forward_ports": [{"name": "web", "port": 8080}],
        "cpu_cores": 2,
        "memory_mb": 512,
        "storage_mb": 2048
    }"#;

    #[test]
    fn test_parse_recipe_json() {
        let recipe: RecipeConfig = serde_json::from_str(SAMPLE).unwrap();
        assert_eq!(recipe.builder, "alpine@3.20");
        assert_eq!(recipe.packages.len(), 2);
        assert_eq!(recipe.cpu_cores, 2);
        assert_eq!(recipe.memory_mb, 512);
        // Unspecified fields keep their defaults.
        assert!(!recipe.debug);
        assert!(recipe.files.is_empty());
    }

    #[test]
    fn test_to_definition_namespaces_packages() {
        let recipe: RecipeConfig = serde_json::from_str(SAMPLE).unwrap();
        let def = recipe.to_definition().unwrap();

        let Definition::BuildVm {
            directives,
            cpu_cores,
            storage_mb,
            ..
        } = def
        else {
            panic!("expected build_vm");
        };

        assert_eq!(cpu_cores, 2);
        assert_eq!(storage_mb, 2048);

        let package_names: Vec<&str> = directives
            .iter()
            .filter_map(|d| match d {
                Directive::AddPackage { name } => Some(name.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(
            package_names,
            vec!["busybox@alpine@3.20", "musl@alpine@3.20"]
        );
    }

    #[test]
    fn test_no_scripts_drops_commands() {
        let mut recipe: RecipeConfig = serde_json::from_str(SAMPLE).unwrap();
        recipe.no_scripts = true;

        let Definition::BuildVm { directives, .. } = recipe.to_definition().unwrap() else {
            panic!("expected build_vm");
        };

        assert!(!directives
            .iter()
            .any(|d| matches!(d, Directive::RunCommand { .. })));
    }

    #[test]
    fn test_empty_builder_is_rejected() {
        let recipe = RecipeConfig::default();
        assert!(recipe.to_definition().is_err());
    }

    #[test]
    fn test_core_config_defaults() {
        let config: CoreConfig = serde_json::from_str(r#"{"build_dir": "/tmp/build"}"#).unwrap();
        assert_eq!(config.parallel_fetchers, 10);
        assert!(!config.rebuild_user_definitions);
        assert!(config.distribution_server.is_none());
        assert!(config.mirror_table.is_empty());
    }

    #[test]
    fn test_identical_recipes_produce_identical_definitions() {
        let a: RecipeConfig = serde_json::from_str(SAMPLE).unwrap();
        let b: RecipeConfig = serde_json::from_str(SAMPLE).unwrap();
        assert_eq!(
            a.to_definition().unwrap().hash(),
            b.to_definition().unwrap().hash()
        );
    }
}
