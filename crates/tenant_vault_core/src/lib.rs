//! Tenant vault core: per-tenant snapshot/restore over a declared entity
//! catalog, and a tamper-evident hash-chained audit log.
//!
//! Storage is reached only through the traits in [`ports`]; the Postgres
//! adapter lives in `tenant_vault_postgres`, and [`memory`] provides an
//! in-process implementation.

pub mod archive;
pub mod audit;
pub mod builder;
pub mod catalog;
pub mod config;
pub mod error;
pub mod memory;
pub mod ports;
pub mod restore;
pub mod service;
pub mod snapshot;

pub use archive::{
    ArchiveKey, ArchivedSnapshot, FsArchiveSink, MemoryArchiveSink, MirroredArchive,
    SnapshotArchive,
};
pub use audit::{AuditEvent, AuditFilter, AuditRecorder, ChainFinding, ChainReport, EventDraft};
pub use builder::{SnapshotBuilder, SnapshotOutcome, SnapshotWarning};
pub use catalog::{Catalog, EntitySpec, ScopeStrategy};
pub use config::{BackupSettings, VaultConfig};
pub use error::{CatalogError, ValidationError, VaultError};
pub use restore::{restore_lock_key, RestoreExecutor, RestoreReport};
pub use service::{BackupOutcome, BackupService, RestoreSource};
pub use snapshot::{RowRecord, Snapshot, SNAPSHOT_SCHEMA_VERSION};
