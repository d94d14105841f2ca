//! Restore executor: replays a snapshot wholesale inside one transaction.
//!
//! 1. Take the tenant's exclusive restore lock (fail fast on contention).
//! 2. Delete in reverse catalog order. `JoinThroughParent` rows are anchored to
//!    the *live* parent ids, not the snapshot's, so stale rows go too.
//! 3. Insert in forward catalog order, in fixed-size batches, keys verbatim.
//!
//! Any error, timeout or cancellation drops the transaction uncommitted.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::catalog::{Catalog, ScopeStrategy};
use crate::error::{ValidationError, VaultError};
use crate::ports::{PersistenceAdapter, Predicate, Result, StoreTransaction};
use crate::snapshot::Snapshot;

pub const DEFAULT_BATCH_SIZE: usize = 1000;

/// Advisory lock key guarding restores of one tenant.
pub fn restore_lock_key(tenant_id: &str) -> String {
    format!("tenant_restore:{tenant_id}")
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestoreReport {
    pub tenant_id: String,
    pub deleted: BTreeMap<String, u64>,
    pub inserted: BTreeMap<String, u64>,
    pub warnings: Vec<String>,
}

impl RestoreReport {
    pub fn total_inserted(&self) -> u64 {
        self.inserted.values().sum()
    }
}

pub struct RestoreExecutor<'a> {
    catalog: &'a Catalog,
    store: &'a dyn PersistenceAdapter,
    batch_size: usize,
}

impl<'a> RestoreExecutor<'a> {
    pub fn new(catalog: &'a Catalog, store: &'a dyn PersistenceAdapter) -> Self {
        Self {
            catalog,
            store,
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Restore under a deadline. Expiry drops the in-flight transaction, which
    /// rolls back; nothing is ever partially committed.
    pub async fn restore_within(
        &self,
        tenant_id: &str,
        snapshot: &Snapshot,
        limit: Duration,
    ) -> Result<RestoreReport> {
        match tokio::time::timeout(limit, self.restore(tenant_id, snapshot)).await {
            Ok(result) => result,
            Err(_) => {
                tracing::error!(tenant_id, ?limit, "restore timed out, rolled back");
                Err(VaultError::TimedOut {
                    seconds: limit.as_secs(),
                    retryable: false,
                })
            }
        }
    }

    pub async fn restore(&self, tenant_id: &str, snapshot: &Snapshot) -> Result<RestoreReport> {
        if snapshot.tenant_id != tenant_id {
            return Err(ValidationError::TenantMismatch {
                expected: tenant_id.to_string(),
                found: snapshot.tenant_id.clone(),
            }
            .into());
        }

        let mut tx = self.store.begin().await?;
        match self.replay(tx.as_mut(), tenant_id, snapshot).await {
            Ok(report) => {
                tx.commit().await?;
                tracing::info!(
                    tenant_id,
                    rows = report.total_inserted(),
                    warnings = report.warnings.len(),
                    "restore committed"
                );
                Ok(report)
            }
            Err(e) => {
                if let Err(rb) = tx.rollback().await {
                    tracing::warn!(tenant_id, error = %rb, "explicit rollback failed");
                }
                tracing::error!(tenant_id, error = %e, "restore rolled back");
                Err(e)
            }
        }
    }

    async fn replay(
        &self,
        tx: &mut dyn StoreTransaction,
        tenant_id: &str,
        snapshot: &Snapshot,
    ) -> Result<RestoreReport> {
        if !tx.try_advisory_lock(&restore_lock_key(tenant_id)).await? {
            return Err(VaultError::Busy(tenant_id.to_string()));
        }

        let mut report = RestoreReport {
            tenant_id: tenant_id.to_string(),
            ..Default::default()
        };

        for name in snapshot.tables.keys() {
            if !self.catalog.contains(name) {
                report
                    .warnings
                    .push(format!("{name}: not in catalog, ignored"));
            }
        }

        let mut missing = HashSet::new();
        for spec in self.catalog.iter() {
            if !snapshot.tables.contains_key(&spec.name) {
                report
                    .warnings
                    .push(format!("{}: absent from snapshot, restored empty", spec.name));
            }
            if !tx.table_exists(&spec.name).await? {
                missing.insert(spec.name.as_str());
            }
        }

        for spec in self.catalog.iter() {
            if missing.contains(spec.name.as_str()) {
                let rows = snapshot.rows(&spec.name).len();
                tracing::warn!(tenant_id, entity = %spec.name, rows, "entity missing in destination, skipped");
                report.warnings.push(format!(
                    "{}: missing in destination schema, skipped ({rows} rows)",
                    spec.name
                ));
                continue;
            }
            if let Some(parent) = spec.parent() {
                if missing.contains(parent) && !snapshot.rows(&spec.name).is_empty() {
                    return Err(VaultError::SchemaMismatch(format!(
                        "{} has rows referencing {parent}, which is missing in destination",
                        spec.name
                    )));
                }
            }
        }

        // Live ids, resolved parents-first before anything is deleted.
        let mut live: HashMap<&str, Vec<String>> = HashMap::new();
        for spec in self.catalog.iter() {
            if missing.contains(spec.name.as_str()) {
                continue;
            }
            let keys = match &spec.scope {
                ScopeStrategy::Direct { column } => {
                    tx.select_keys(
                        &spec.name,
                        &spec.primary_key,
                        &Predicate::eq(column, tenant_id),
                    )
                    .await?
                }
                ScopeStrategy::JoinThroughParent {
                    parent,
                    foreign_key,
                } => match live.get(parent.as_str()) {
                    Some(parent_keys) if !parent_keys.is_empty() => {
                        tx.select_keys(
                            &spec.name,
                            &spec.primary_key,
                            &Predicate::any_of(foreign_key, parent_keys.clone()),
                        )
                        .await?
                    }
                    _ => Vec::new(),
                },
            };
            live.insert(&spec.name, keys);
        }

        for spec in self.catalog.iter_rev() {
            if missing.contains(spec.name.as_str()) {
                continue;
            }
            let deleted = match &spec.scope {
                ScopeStrategy::Direct { column } => {
                    tx.delete_rows(&spec.name, &Predicate::eq(column, tenant_id))
                        .await?
                }
                ScopeStrategy::JoinThroughParent {
                    parent,
                    foreign_key,
                } => match live.get(parent.as_str()) {
                    Some(parent_keys) if !parent_keys.is_empty() => {
                        tx.delete_rows(
                            &spec.name,
                            &Predicate::any_of(foreign_key, parent_keys.clone()),
                        )
                        .await?
                    }
                    _ => 0,
                },
            };
            tracing::debug!(tenant_id, entity = %spec.name, deleted, "purged");
            report.deleted.insert(spec.name.clone(), deleted);
        }

        for spec in self.catalog.iter() {
            if missing.contains(spec.name.as_str()) {
                continue;
            }
            let rows = snapshot.rows(&spec.name);
            let mut inserted = 0;
            for batch in rows.chunks(self.batch_size) {
                inserted += tx.insert_rows(&spec.name, batch).await?;
            }
            tracing::debug!(tenant_id, entity = %spec.name, inserted, "reinserted");
            report.inserted.insert(spec.name.clone(), inserted);
        }

        Ok(report)
    }
}
