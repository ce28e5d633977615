//! `vault.toml` loading and path resolution.
//!
//! Every section is optional. Precedence for the database file is
//! `--db`, then `VAULT_DATA_DIR`, then `[store] path`, then `~/.vault/vault.db`.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use serde::Deserialize;
use vault_core::{LedgerStore, MemoryStore, RateTable};

pub const CONFIG_FILE: &str = "vault.toml";
pub const DEFAULT_BIND: &str = "127.0.0.1:8000";

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub server: ServerConfig,
    pub store: StoreConfig,
    /// Per-type overrides layered over the standard rates.
    pub rates: BTreeMap<String, f64>,
    pub memory: MemoryConfig,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerConfig {
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: DEFAULT_BIND.to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StoreConfig {
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MemoryConfig {
    pub dimension: usize,
    pub match_threshold: f64,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            dimension: vault_core::memory::DEFAULT_DIMENSION,
            match_threshold: vault_core::memory::DEFAULT_MATCH_THRESHOLD,
        }
    }
}

impl Config {
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("invalid vault configuration")
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        Self::parse(&content).with_context(|| format!("in {}", path.display()))
    }

    /// Load `path` when given, defaults otherwise.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => {
                tracing::debug!(path = %path.display(), "loading config");
                Self::load(path)
            }
            None => Ok(Self::default()),
        }
    }

    pub fn rate_table(&self) -> Result<RateTable> {
        RateTable::default()
            .with_overrides(self.rates.clone())
            .context("invalid [rates] entry")
    }

    pub fn memory_store(&self, ledger: Arc<dyn LedgerStore>) -> MemoryStore {
        MemoryStore::new(ledger)
            .with_dimension(self.memory.dimension)
            .with_match_threshold(self.memory.match_threshold)
    }
}

/// Directory holding the database and the default config file.
pub fn data_dir(env_data_dir: Option<PathBuf>) -> PathBuf {
    env_data_dir.unwrap_or_else(vault_store::default_base_dir)
}

/// The config file to read, if any: an explicit path (flag or
/// `VAULT_CONFIG`) always wins; otherwise `vault.toml` in the data
/// directory when it exists.
pub fn resolve_config_path(explicit: Option<PathBuf>, data_dir: &Path) -> Option<PathBuf> {
    explicit.or_else(|| {
        let candidate = data_dir.join(CONFIG_FILE);
        candidate.exists().then_some(candidate)
    })
}

pub fn resolve_db_path(
    flag: Option<&Path>,
    env_data_dir: Option<&Path>,
    config: &Config,
) -> PathBuf {
    if let Some(path) = flag {
        return path.to_path_buf();
    }
    if let Some(dir) = env_data_dir {
        return dir.join(vault_store::DB_FILE);
    }
    config
        .store
        .path
        .clone()
        .unwrap_or_else(vault_store::default_db_path)
}
