//! tenant-vault: operator CLI for tenant snapshots, restores and audit checks.
//!
//! Configuration comes from `TENANT_VAULT_*` environment variables (a `.env`
//! file is honoured); see `tenant_vault_core::config`.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand, ValueEnum};

use tenant_vault_core::ports::ArchiveSink;
use tenant_vault_core::{
    AuditFilter, AuditRecorder, BackupService, FsArchiveSink, MirroredArchive, ScopeStrategy,
    SnapshotArchive, VaultConfig,
};
use tenant_vault_postgres::PgStores;

#[derive(Parser)]
#[command(name = "tenant-vault")]
#[command(about = "Per-tenant snapshot/restore and audit-chain verification")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Validate the entity catalog and print it in dependency order
    CheckCatalog,

    /// Snapshot one tenant into the archive
    Snapshot {
        #[arg(long)]
        tenant: String,
        #[arg(long, env = "TENANT_VAULT_ACTOR")]
        actor: Option<String>,
    },

    /// Restore one tenant from its latest archived snapshot, or from a file
    Restore {
        #[arg(long)]
        tenant: String,
        #[arg(long, env = "TENANT_VAULT_ACTOR")]
        actor: Option<String>,
        /// Snapshot JSON to restore instead of the latest archive
        #[arg(long)]
        file: Option<PathBuf>,
    },

    /// List archived snapshots of a tenant, oldest first
    ListSnapshots {
        #[arg(long)]
        tenant: String,
    },

    /// Recompute and check a tenant's audit chain
    VerifyChain {
        #[arg(long)]
        tenant: String,
    },

    /// Export a tenant's audit events
    AuditExport {
        #[arg(long)]
        tenant: String,
        /// RFC 3339 lower bound (inclusive)
        #[arg(long)]
        from: Option<DateTime<Utc>>,
        /// RFC 3339 upper bound (inclusive)
        #[arg(long)]
        to: Option<DateTime<Utc>>,
        /// Restrict to these event types (repeatable)
        #[arg(long = "event-type")]
        event_types: Vec<String>,
        #[arg(long, value_enum, default_value_t = ExportFormat::Text)]
        format: ExportFormat,
    },

    /// Create the audit table and its append-only trigger
    Migrate,
}

#[derive(Clone, Copy, ValueEnum)]
enum ExportFormat {
    Text,
    Json,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,tenant_vault_core=debug".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = VaultConfig::from_env()?;

    match cli.command {
        Command::CheckCatalog => check_catalog(&config),
        Command::Migrate => {
            let stores = connect(&config).await?;
            stores.audit.ensure_schema().await
        }
        Command::Snapshot { tenant, actor } => {
            let service = build_service(&config).await?;
            let outcome = service
                .spawn_backup(tenant, actor)
                .await
                .context("snapshot task panicked")??;
            for warning in &outcome.warnings {
                tracing::warn!(%warning, "snapshot warning");
            }
            println!("{}", serde_json::to_string_pretty(&outcome)?);
            Ok(())
        }
        Command::Restore {
            tenant,
            actor,
            file,
        } => {
            let service = build_service(&config).await?;
            let handle = match file {
                Some(path) => {
                    let payload = tokio::fs::read(&path)
                        .await
                        .with_context(|| format!("reading {}", path.display()))?;
                    service.spawn_restore_upload(tenant, actor, payload)
                }
                None => service.spawn_restore_latest(tenant, actor),
            };
            let report = handle.await.context("restore task panicked")??;
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
        Command::ListSnapshots { tenant } => {
            let service = build_service(&config).await?;
            for key in service.list_snapshots(&tenant).await? {
                println!("{key}");
            }
            Ok(())
        }
        Command::VerifyChain { tenant } => {
            let service = build_service(&config).await?;
            let report = service.verify_audit(&tenant).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            if !report.is_intact() {
                bail!(
                    "audit chain for {tenant} has {} finding(s)",
                    report.findings.len()
                );
            }
            Ok(())
        }
        Command::AuditExport {
            tenant,
            from,
            to,
            event_types,
            format,
        } => {
            let service = build_service(&config).await?;
            let filter = AuditFilter {
                from,
                to,
                event_types,
            };
            match format {
                ExportFormat::Text => print!("{}", service.export_audit_text(&tenant, &filter).await?),
                ExportFormat::Json => {
                    let events = service.export_audit(&tenant, &filter).await?;
                    println!("{}", serde_json::to_string_pretty(&events)?);
                }
            }
            Ok(())
        }
    }
}

fn check_catalog(config: &VaultConfig) -> Result<()> {
    let catalog = config.load_catalog()?;
    for spec in catalog.iter() {
        let scope = match &spec.scope {
            ScopeStrategy::Direct { column } => format!("direct on {column}"),
            ScopeStrategy::JoinThroughParent {
                parent,
                foreign_key,
            } => format!("via {parent} on {foreign_key}"),
        };
        println!("{:<24} pk={:<12} {scope}", spec.name, spec.primary_key);
    }
    println!("{} entities OK", catalog.len());
    Ok(())
}

async fn connect(config: &VaultConfig) -> Result<PgStores> {
    let database_url = config
        .database_url
        .as_deref()
        .context("TENANT_VAULT_DATABASE_URL must be set")?;
    PgStores::connect(database_url, &config.db_schema).await
}

async fn build_service(config: &VaultConfig) -> Result<Arc<BackupService>> {
    let catalog = Arc::new(config.load_catalog()?);
    let stores = connect(config).await?;

    let mut sink = MirroredArchive::new(Arc::new(FsArchiveSink::new(&config.archive_dir)));
    if let Some(mirror) = &config.mirror_dir {
        sink = sink.with_mirror(Arc::new(FsArchiveSink::new(mirror)));
    }
    let sink: Arc<dyn ArchiveSink> = Arc::new(sink);
    let archive = SnapshotArchive::new(sink, config.settings.retain_snapshots);

    Ok(Arc::new(BackupService::new(
        catalog,
        stores.persistence.clone(),
        archive,
        AuditRecorder::new(stores.audit.clone()),
        config.settings.clone(),
    )))
}
