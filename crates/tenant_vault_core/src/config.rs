//! Runtime configuration, read from `TENANT_VAULT_*` environment variables.
//!
//!   TENANT_VAULT_DATABASE_URL           Postgres connection string
//!   TENANT_VAULT_DB_SCHEMA              schema holding tenant tables (default: public)
//!   TENANT_VAULT_CATALOG                catalog YAML path (default: built-in business catalog)
//!   TENANT_VAULT_ARCHIVE_DIR            archive root (default: ./archive)
//!   TENANT_VAULT_MIRROR_DIR             optional local mirror root
//!   TENANT_VAULT_BATCH_SIZE             restore insert batch size (default: 1000)
//!   TENANT_VAULT_SNAPSHOT_TIMEOUT_SECS  default: 300
//!   TENANT_VAULT_RESTORE_TIMEOUT_SECS   default: 600
//!   TENANT_VAULT_RETAIN_SNAPSHOTS       timestamped snapshots kept per tenant (default: 7)

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{anyhow, Context};

use crate::catalog::Catalog;
use crate::restore::DEFAULT_BATCH_SIZE;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupSettings {
    pub batch_size: usize,
    pub snapshot_timeout: Duration,
    pub restore_timeout: Duration,
    pub retain_snapshots: usize,
}

impl Default for BackupSettings {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            snapshot_timeout: Duration::from_secs(300),
            restore_timeout: Duration::from_secs(600),
            retain_snapshots: 7,
        }
    }
}

#[derive(Debug, Clone)]
pub struct VaultConfig {
    pub database_url: Option<String>,
    pub db_schema: String,
    pub catalog_path: Option<PathBuf>,
    pub archive_dir: PathBuf,
    pub mirror_dir: Option<PathBuf>,
    pub settings: BackupSettings,
}

impl VaultConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup; `from_env` passes the process environment.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let defaults = BackupSettings::default();

        Ok(Self {
            database_url: get("TENANT_VAULT_DATABASE_URL"),
            db_schema: get("TENANT_VAULT_DB_SCHEMA").unwrap_or_else(|| "public".into()),
            catalog_path: get("TENANT_VAULT_CATALOG").map(PathBuf::from),
            archive_dir: get("TENANT_VAULT_ARCHIVE_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./archive")),
            mirror_dir: get("TENANT_VAULT_MIRROR_DIR").map(PathBuf::from),
            settings: BackupSettings {
                batch_size: parse(&get, "TENANT_VAULT_BATCH_SIZE")?
                    .unwrap_or(defaults.batch_size),
                snapshot_timeout: parse(&get, "TENANT_VAULT_SNAPSHOT_TIMEOUT_SECS")?
                    .map(Duration::from_secs)
                    .unwrap_or(defaults.snapshot_timeout),
                restore_timeout: parse(&get, "TENANT_VAULT_RESTORE_TIMEOUT_SECS")?
                    .map(Duration::from_secs)
                    .unwrap_or(defaults.restore_timeout),
                retain_snapshots: parse(&get, "TENANT_VAULT_RETAIN_SNAPSHOTS")?
                    .unwrap_or(defaults.retain_snapshots),
            },
        })
    }

    /// Load and validate the catalog. A bad catalog must stop the process.
    pub fn load_catalog(&self) -> anyhow::Result<Catalog> {
        let catalog = match &self.catalog_path {
            Some(path) => {
                let source = std::fs::read_to_string(path)
                    .with_context(|| format!("reading catalog {}", path.display()))?;
                Catalog::from_yaml(&source)
            }
            None => Catalog::business(),
        };
        catalog.map_err(|e| anyhow!(e).context("invalid entity catalog"))
    }
}

fn parse<T: std::str::FromStr>(
    get: &impl Fn(&str) -> Option<String>,
    key: &str,
) -> anyhow::Result<Option<T>>
where
    T::Err: std::fmt::Display,
{
    get(key)
        .map(|raw| {
            raw.trim()
                .parse::<T>()
                .map_err(|e| anyhow!("{key}={raw}: {e}"))
        })
        .transpose()
}
