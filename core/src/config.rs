//! Engine configuration
//!
//! Layering, lowest to highest priority:
//! 1. Built-in defaults
//! 2. TOML file (`--config`, `FLOWGATE_CONFIG_PATH`, or `./flowgate.toml` if present)
//! 3. Environment variables, `FLOWGATE_` prefix with `__` between sections
//!    (e.g. `FLOWGATE_STORAGE__BACKEND=sqlite`)
//! 4. Explicit builder overrides
//!
//! A `.env` file is loaded first. The resulting [`EngineConfig`] is passed
//! into each run; nothing here is process-global.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

pub const ENV_PREFIX: &str = "FLOWGATE";
pub const CONFIG_PATH_ENV: &str = "FLOWGATE_CONFIG_PATH";
const DEFAULT_CONFIG_FILE: &str = "flowgate.toml";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub capabilities: CapabilityConfig,

    #[serde(default)]
    pub mutation: MutationPolicyConfig,

    #[serde(default)]
    pub limits: LimitsConfig,

    #[serde(default)]
    pub artifacts: ArtifactsConfig,

    /// Base directory relative filesystem targets are resolved against
    #[serde(default)]
    pub project_root: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    #[default]
    Memory,
    Sqlite,
    Postgres,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default)]
    pub backend: StorageBackend,

    #[serde(default = "default_database_url")]
    pub database_url: String,

    /// Seconds to wait for the database connection
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::default(),
            database_url: default_database_url(),
            connect_timeout_secs: default_connect_timeout_secs(),
        }
    }
}

fn default_database_url() -> String {
    "sqlite::memory:".to_string()
}

fn default_connect_timeout_secs() -> u64 {
    30
}

/// Guarantee table: `no_<effect>` to forbidden (`true`) or explicitly allowed (`false`)
pub type Guarantees = BTreeMap<String, bool>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PackConfig {
    pub name: String,
    #[serde(default)]
    pub guarantees: Guarantees,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CapabilityConfig {
    /// Installed packs, in declaration order
    #[serde(default)]
    pub packs: Vec<PackConfig>,

    /// App-level policy
    #[serde(default)]
    pub policy: Guarantees,

    /// Per-tool overrides, keyed by tool name
    #[serde(default)]
    pub tools: BTreeMap<String, Guarantees>,

    /// Filesystem effects must target a path under one of these roots
    #[serde(default)]
    pub allowed_roots: Vec<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MutationPolicyConfig {
    /// Flows that mutate records must declare a `requires` rule
    #[serde(default = "default_true")]
    pub require_rule: bool,

    /// Flows that mutate records must be marked audited
    #[serde(default)]
    pub audit_required: bool,
}

impl Default for MutationPolicyConfig {
    fn default() -> Self {
        Self {
            require_rule: true,
            audit_required: false,
        }
    }
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LimitsConfig {
    #[serde(default = "default_max_call_depth")]
    pub max_call_depth: usize,

    #[serde(default = "default_max_parallel_branches")]
    pub max_parallel_branches: usize,

    #[serde(default = "default_max_async_tasks")]
    pub max_async_tasks: usize,

    /// Iteration cap for `repeat while` loops without their own limit
    #[serde(default = "default_max_loop_iterations")]
    pub max_loop_iterations: u64,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_call_depth: default_max_call_depth(),
            max_parallel_branches: default_max_parallel_branches(),
            max_async_tasks: default_max_async_tasks(),
            max_loop_iterations: default_max_loop_iterations(),
        }
    }
}

fn default_max_call_depth() -> usize {
    64
}

fn default_max_parallel_branches() -> usize {
    32
}

fn default_max_async_tasks() -> usize {
    256
}

fn default_max_loop_iterations() -> u64 {
    10_000
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ArtifactsConfig {
    /// Directory `last_execution.json` is written to; disabled when unset
    #[serde(default)]
    pub dir: Option<PathBuf>,
}

impl EngineConfig {
    pub fn builder() -> EngineConfigBuilder {
        EngineConfigBuilder::default()
    }

    /// Load configuration from the default sources
    pub fn load() -> Result<Self> {
        Self::builder().build()
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to render configuration as TOML")
    }
}

#[derive(Debug, Default)]
pub struct EngineConfigBuilder {
    config_path: Option<PathBuf>,
    database_url: Option<String>,
    backend: Option<StorageBackend>,
    artifacts_dir: Option<PathBuf>,
    skip_env: bool,
}

impl EngineConfigBuilder {
    pub fn config_path(mut self, path: Option<PathBuf>) -> Self {
        self.config_path = path;
        self
    }

    pub fn database_url(mut self, url: Option<String>) -> Self {
        self.database_url = url;
        self
    }

    pub fn backend(mut self, backend: Option<StorageBackend>) -> Self {
        self.backend = backend;
        self
    }

    pub fn artifacts_dir(mut self, dir: Option<PathBuf>) -> Self {
        self.artifacts_dir = dir;
        self
    }

    /// Ignore `.env` and `FLOWGATE_*` variables
    pub fn skip_env(mut self) -> Self {
        self.skip_env = true;
        self
    }

    pub fn build(self) -> Result<EngineConfig> {
        if !self.skip_env {
            dotenvy::dotenv().ok();
        }

        let defaults =
            config::Config::try_from(&EngineConfig::default()).context("Failed to encode default configuration")?;
        let mut builder = config::Config::builder().add_source(defaults);

        let env_path = if self.skip_env {
            None
        } else {
            std::env::var(CONFIG_PATH_ENV).ok().map(PathBuf::from)
        };
        match self.config_path.or(env_path) {
            Some(path) => {
                if !path.exists() {
                    bail!("Config file not found: {}", path.display());
                }
                builder = builder.add_source(
                    config::File::from(path)
                        .format(config::FileFormat::Toml)
                        .required(true),
                );
            }
            None => {
                builder = builder.add_source(
                    config::File::with_name(DEFAULT_CONFIG_FILE)
                        .format(config::FileFormat::Toml)
                        .required(false),
                );
            }
        }

        if !self.skip_env {
            builder = builder.add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            );
        }

        let mut config: EngineConfig = builder
            .build()
            .context("Failed to load configuration")?
            .try_deserialize()
            .context("Invalid configuration")?;

        if let Some(url) = self.database_url {
            config.storage.database_url = url;
        }
        if let Some(backend) = self.backend {
            config.storage.backend = backend;
        }
        if let Some(dir) = self.artifacts_dir {
            config.artifacts.dir = Some(dir);
        }

        validate(&config)?;
        Ok(config)
    }
}

fn validate(config: &EngineConfig) -> Result<()> {
    if config.storage.backend == StorageBackend::Postgres
        && !(config.storage.database_url.starts_with("postgres://")
            || config.storage.database_url.starts_with("postgresql://"))
    {
        bail!(
            "Postgres backend needs a postgres:// database URL, got '{}'",
            config.storage.database_url
        );
    }
    for name in config
        .capabilities
        .policy
        .keys()
        .chain(config.capabilities.packs.iter().flat_map(|p| p.guarantees.keys()))
        .chain(config.capabilities.tools.values().flat_map(|g| g.keys()))
    {
        if crate::interpreter::types::Effect::from_guarantee(name).is_none() {
            bail!("Unknown guarantee '{}'", name);
        }
    }
    if config.limits.max_call_depth == 0 {
        bail!("limits.max_call_depth must be at least 1");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_temp(contents: &str) -> PathBuf {
        let path = std::env::temp_dir().join(format!("flowgate-{}.toml", uuid::Uuid::new_v4()));
        std::fs::write(&path, contents).unwrap();
        path
    }

    #[test]
    fn test_defaults() {
        let config = EngineConfig::builder().skip_env().build().unwrap();
        assert_eq!(config.storage.backend, StorageBackend::Memory);
        assert!(config.mutation.require_rule);
        assert!(!config.mutation.audit_required);
        assert_eq!(config.limits.max_async_tasks, 256);
        assert_eq!(config.limits.max_loop_iterations, 10_000);
        assert!(config.artifacts.dir.is_none());
    }

    #[test]
    fn test_toml_file_layers_over_defaults() {
        let path = write_temp(
            r#"
            [storage]
            backend = "sqlite"

            [mutation]
            audit_required = true

            [capabilities.policy]
            no_network = true

            [capabilities.tools.fetch]
            no_network = false

            [[capabilities.packs]]
            name = "files"
            guarantees = { no_filesystem_write = true }
            "#,
        );

        let config = EngineConfig::builder().skip_env().config_path(Some(path.clone())).build().unwrap();
        std::fs::remove_file(path).ok();

        assert_eq!(config.storage.backend, StorageBackend::Sqlite);
        assert_eq!(config.storage.database_url, "sqlite::memory:");
        assert_eq!(config.storage.connect_timeout_secs, 30);
        assert!(config.mutation.audit_required);
        assert!(config.mutation.require_rule);
        assert_eq!(config.capabilities.policy.get("no_network"), Some(&true));
        assert_eq!(config.capabilities.tools["fetch"].get("no_network"), Some(&false));
        assert_eq!(config.capabilities.packs[0].name, "files");
    }

    #[test]
    fn test_builder_overrides_win() {
        let path = write_temp("[storage]\nbackend = \"sqlite\"\n");
        let config = EngineConfig::builder()
            .skip_env()
            .config_path(Some(path.clone()))
            .backend(Some(StorageBackend::Memory))
            .database_url(Some("sqlite:flowgate.db".to_string()))
            .build()
            .unwrap();
        std::fs::remove_file(path).ok();

        assert_eq!(config.storage.backend, StorageBackend::Memory);
        assert_eq!(config.storage.database_url, "sqlite:flowgate.db");
    }

    #[test]
    fn test_unknown_guarantee_is_rejected() {
        let path = write_temp("[capabilities.policy]\nno_teleport = true\n");
        let err = EngineConfig::builder().skip_env().config_path(Some(path.clone())).build();
        std::fs::remove_file(path).ok();
        assert!(err.unwrap_err().to_string().contains("no_teleport"));
    }

    #[test]
    fn test_postgres_requires_postgres_url() {
        let result = EngineConfig::builder()
            .skip_env()
            .backend(Some(StorageBackend::Postgres))
            .build();
        assert!(result.is_err());
    }

    #[test]
    fn test_missing_config_file_is_an_error() {
        let result = EngineConfig::builder()
            .skip_env()
            .config_path(Some(PathBuf::from("/nonexistent/flowgate.toml")))
            .build();
        assert!(result.is_err());
    }
}
