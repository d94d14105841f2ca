//! BackupService: composes catalog, store, archive and audit recorder into the
//! operations upstream triggers call.
//!
//! Snapshot, restore and audit work is long-running; callers on request paths
//! should go through the `spawn_*` helpers so it runs as a background task.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tokio::sync::{OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};
use tokio::task::JoinHandle;

use crate::archive::{ArchiveKey, ArchivedSnapshot, SnapshotArchive, SNAPSHOT_FOLDER};
use crate::audit::{event_types, export_text, AuditEvent, AuditFilter, AuditRecorder, ChainReport, EventDraft};
use crate::builder::{SnapshotBuilder, SnapshotWarning};
use crate::catalog::Catalog;
use crate::config::BackupSettings;
use crate::error::VaultError;
use crate::ports::{PersistenceAdapter, Result};
use crate::restore::{RestoreExecutor, RestoreReport};
use crate::snapshot::Snapshot;

/// Per-tenant reader/writer guards for this process. Snapshots share, restores
/// exclude. Different tenants never contend.
#[derive(Default)]
struct TenantGuards {
    locks: Mutex<HashMap<String, Arc<RwLock<()>>>>,
}

impl TenantGuards {
    fn lock_for(&self, tenant_id: &str) -> Arc<RwLock<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|p| p.into_inner());
        Arc::clone(locks.entry(tenant_id.to_string()).or_default())
    }

    /// Waits for any in-flight restore of the tenant to finish.
    async fn shared(&self, tenant_id: &str) -> OwnedRwLockReadGuard<()> {
        self.lock_for(tenant_id).read_owned().await
    }

    /// Rejects instead of queueing: replaying a stale snapshot is destructive.
    fn exclusive(&self, tenant_id: &str) -> Result<OwnedRwLockWriteGuard<()>> {
        self.lock_for(tenant_id)
            .try_write_owned()
            .map_err(|_| VaultError::Busy(tenant_id.to_string()))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupOutcome {
    pub tenant_id: String,
    pub archived: ArchivedSnapshot,
    pub row_counts: BTreeMap<String, usize>,
    pub warnings: Vec<SnapshotWarning>,
}

/// Where a restore's snapshot came from, recorded in the audit trail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestoreSource {
    LatestArchive,
    Upload,
}

impl RestoreSource {
    fn as_str(self) -> &'static str {
        match self {
            Self::LatestArchive => "latest_archive",
            Self::Upload => "upload",
        }
    }
}

pub struct BackupService {
    catalog: Arc<Catalog>,
    store: Arc<dyn PersistenceAdapter>,
    archive: SnapshotArchive,
    recorder: AuditRecorder,
    settings: BackupSettings,
    guards: TenantGuards,
}

impl BackupService {
    pub fn new(
        catalog: Arc<Catalog>,
        store: Arc<dyn PersistenceAdapter>,
        archive: SnapshotArchive,
        recorder: AuditRecorder,
        settings: BackupSettings,
    ) -> Self {
        Self {
            catalog,
            store,
            archive,
            recorder,
            settings,
            guards: TenantGuards::default(),
        }
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    /// For business operations that certify themselves in the audit chain.
    pub fn recorder(&self) -> &AuditRecorder {
        &self.recorder
    }

    /// Build a snapshot of the tenant, archive it and record the event.
    pub async fn backup(&self, tenant_id: &str, actor_id: Option<&str>) -> Result<BackupOutcome> {
        ArchiveKey::prefix(tenant_id, SNAPSHOT_FOLDER)?;
        let limit = self.settings.snapshot_timeout;

        let built = tokio::time::timeout(limit, async {
            let _guard = self.guards.shared(tenant_id).await;
            SnapshotBuilder::new(&self.catalog, self.store.as_ref())
                .build(tenant_id)
                .await
        })
        .await
        .map_err(|_| {
            tracing::warn!(tenant_id, ?limit, "snapshot build timed out");
            VaultError::TimedOut {
                seconds: limit.as_secs(),
                retryable: true,
            }
        })?;

        let partial = !built.warnings.is_empty();
        let archived = if partial {
            tracing::warn!(
                tenant_id,
                skipped = built.warnings.len(),
                "snapshot incomplete, latest left on previous snapshot"
            );
            self.archive.store_partial(&built.snapshot).await?
        } else {
            self.archive.store(&built.snapshot).await?
        };
        let row_counts = built.snapshot.row_counts();

        self.recorder
            .append_event(
                EventDraft::new(
                    tenant_id,
                    event_types::SNAPSHOT_CREATED,
                    format!(
                        "snapshot of {} rows archived at {}",
                        built.snapshot.total_rows(),
                        archived.key
                    ),
                )
                .actor(actor_id)
                .metadata(serde_json::json!({
                    "key": archived.key,
                    "digest": archived.digest,
                    "row_counts": row_counts,
                    "warnings": built.warnings,
                    "partial": partial,
                })),
            )
            .await;

        Ok(BackupOutcome {
            tenant_id: tenant_id.to_string(),
            archived,
            row_counts,
            warnings: built.warnings,
        })
    }

    pub async fn restore_latest(
        &self,
        tenant_id: &str,
        actor_id: Option<&str>,
    ) -> Result<RestoreReport> {
        let snapshot = self.archive.load_latest(tenant_id).await?;
        self.restore_snapshot(tenant_id, actor_id, &snapshot, RestoreSource::LatestArchive)
            .await
    }

    /// Shape-validate a caller-uploaded payload, then restore it.
    pub async fn restore_upload(
        &self,
        tenant_id: &str,
        actor_id: Option<&str>,
        payload: &[u8],
    ) -> Result<RestoreReport> {
        let snapshot = Snapshot::from_upload(tenant_id, payload)?;
        self.restore_snapshot(tenant_id, actor_id, &snapshot, RestoreSource::Upload)
            .await
    }

    pub async fn restore_snapshot(
        &self,
        tenant_id: &str,
        actor_id: Option<&str>,
        snapshot: &Snapshot,
        source: RestoreSource,
    ) -> Result<RestoreReport> {
        let _guard = self.guards.exclusive(tenant_id)?;

        let result = RestoreExecutor::new(&self.catalog, self.store.as_ref())
            .with_batch_size(self.settings.batch_size)
            .restore_within(tenant_id, snapshot, self.settings.restore_timeout)
            .await;

        let draft = match &result {
            Ok(report) => EventDraft::new(
                tenant_id,
                event_types::RESTORE_COMPLETED,
                format!(
                    "restored {} rows from {}",
                    report.total_inserted(),
                    source.as_str()
                ),
            )
            .metadata(serde_json::json!({
                "source": source.as_str(),
                "digest": snapshot.content_digest(),
                "snapshot_created_at": snapshot.created_at,
                "inserted": report.inserted,
                "deleted": report.deleted,
                "warnings": report.warnings,
            })),
            Err(e) => EventDraft::new(
                tenant_id,
                event_types::RESTORE_FAILED,
                format!("restore from {} rolled back: {e}", source.as_str()),
            )
            .metadata(serde_json::json!({
                "source": source.as_str(),
                "digest": snapshot.content_digest(),
            })),
        };
        self.recorder.append_event(draft.actor(actor_id)).await;

        result
    }

    pub async fn list_snapshots(&self, tenant_id: &str) -> Result<Vec<String>> {
        self.archive.list(tenant_id).await
    }

    pub async fn verify_audit(&self, tenant_id: &str) -> Result<ChainReport> {
        self.recorder.verify(tenant_id).await
    }

    pub async fn export_audit(
        &self,
        tenant_id: &str,
        filter: &AuditFilter,
    ) -> Result<Vec<AuditEvent>> {
        self.recorder.events(tenant_id, filter).await
    }

    pub async fn export_audit_text(&self, tenant_id: &str, filter: &AuditFilter) -> Result<String> {
        let events = self.recorder.events(tenant_id, filter).await?;
        Ok(export_text(tenant_id, filter, &events))
    }

    // ── Background execution ──

    pub fn spawn_backup(
        self: &Arc<Self>,
        tenant_id: String,
        actor_id: Option<String>,
    ) -> JoinHandle<Result<BackupOutcome>> {
        let service = Arc::clone(self);
        tokio::spawn(async move { service.backup(&tenant_id, actor_id.as_deref()).await })
    }

    /// Aborting the returned handle drops the restore transaction uncommitted.
    pub fn spawn_restore_latest(
        self: &Arc<Self>,
        tenant_id: String,
        actor_id: Option<String>,
    ) -> JoinHandle<Result<RestoreReport>> {
        let service = Arc::clone(self);
        tokio::spawn(async move {
            service
                .restore_latest(&tenant_id, actor_id.as_deref())
                .await
        })
    }

    pub fn spawn_restore_upload(
        self: &Arc<Self>,
        tenant_id: String,
        actor_id: Option<String>,
        payload: Vec<u8>,
    ) -> JoinHandle<Result<RestoreReport>> {
        let service = Arc::clone(self);
        tokio::spawn(async move {
            service
                .restore_upload(&tenant_id, actor_id.as_deref(), &payload)
                .await
        })
    }
}
