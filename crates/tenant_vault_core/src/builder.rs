//! Snapshot builder: walks the catalog in dependency order and exports one
//! tenant's rows.
//!
//! `JoinThroughParent` entities are anchored strictly to the primary keys
//! captured for their parent earlier in the same run, never to an independent
//! tenant filter on the child table. Keys accumulate as the walk proceeds, so
//! grandchildren resolve against already-materialized ancestors.

use std::collections::{BTreeSet, HashMap};

use serde::{Deserialize, Serialize};

use crate::catalog::{Catalog, EntitySpec, ScopeStrategy};
use crate::ports::{PersistenceAdapter, Predicate};
use crate::snapshot::{key_text, RowRecord, Snapshot};

/// A read failure recovered during the walk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotWarning {
    pub entity: String,
    pub message: String,
}

impl std::fmt::Display for SnapshotWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.entity, self.message)
    }
}

#[derive(Debug, Clone)]
pub struct SnapshotOutcome {
    pub snapshot: Snapshot,
    pub warnings: Vec<SnapshotWarning>,
    /// Entities whose query was skipped because the parent captured nothing.
    pub skipped: Vec<String>,
}

pub struct SnapshotBuilder<'a> {
    catalog: &'a Catalog,
    store: &'a dyn PersistenceAdapter,
}

impl<'a> SnapshotBuilder<'a> {
    pub fn new(catalog: &'a Catalog, store: &'a dyn PersistenceAdapter) -> Self {
        Self { catalog, store }
    }

    /// Build a snapshot of `tenant_id`. Never fails as a whole: a read failure
    /// on one entity yields an empty set and a warning.
    pub async fn build(&self, tenant_id: &str) -> SnapshotOutcome {
        let mut snapshot = Snapshot::new(tenant_id);
        let mut warnings = Vec::new();
        let mut skipped = Vec::new();
        let mut captured: HashMap<&str, Vec<String>> = HashMap::new();

        for spec in self.catalog.iter() {
            let predicate = match &spec.scope {
                ScopeStrategy::Direct { column } => Predicate::eq(column, tenant_id),
                ScopeStrategy::JoinThroughParent {
                    parent,
                    foreign_key,
                } => {
                    let parent_keys = captured.get(parent.as_str()).cloned().unwrap_or_default();
                    if parent_keys.is_empty() {
                        tracing::debug!(
                            tenant_id,
                            entity = %spec.name,
                            parent = %parent,
                            "parent captured no rows, skipping query"
                        );
                        skipped.push(spec.name.clone());
                        captured.insert(&spec.name, Vec::new());
                        snapshot.tables.insert(spec.name.clone(), Vec::new());
                        continue;
                    }
                    Predicate::any_of(foreign_key, parent_keys)
                }
            };

            let rows = match self
                .store
                .select_rows(&spec.name, &predicate, &spec.primary_key)
                .await
            {
                Ok(rows) => rows,
                Err(e) => {
                    tracing::warn!(
                        tenant_id,
                        entity = %spec.name,
                        error = %e,
                        "snapshot read failed, capturing empty set"
                    );
                    warnings.push(SnapshotWarning {
                        entity: spec.name.clone(),
                        message: format!("read failed: {e}"),
                    });
                    Vec::new()
                }
            };

            captured.insert(&spec.name, primary_keys(spec, &rows));
            tracing::debug!(tenant_id, entity = %spec.name, rows = rows.len(), "captured");
            snapshot.tables.insert(spec.name.clone(), rows);
        }

        tracing::info!(
            tenant_id,
            entities = snapshot.tables.len(),
            rows = snapshot.total_rows(),
            warnings = warnings.len(),
            "snapshot built"
        );

        SnapshotOutcome {
            snapshot,
            warnings,
            skipped,
        }
    }
}

fn primary_keys(spec: &EntitySpec, rows: &[RowRecord]) -> Vec<String> {
    rows.iter()
        .filter_map(|row| row.get(&spec.primary_key).and_then(key_text))
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}
