//! Port traits for the relational store, the audit log and the archive.
//! Implemented by `tenant_vault_postgres` and by [`crate::memory`]; core logic
//! depends only on these traits.

use async_trait::async_trait;

use crate::audit::{AuditEvent, AuditFilter};
use crate::error::VaultError;
use crate::snapshot::RowRecord;

pub type Result<T> = std::result::Result<T, VaultError>;

/// Row filter. Values are always bound as parameters and compared in text form,
/// never spliced into statement text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Predicate {
    /// `column = value`
    Eq { column: String, value: String },
    /// `column IN (values)`. Callers never build one with an empty set.
    In { column: String, values: Vec<String> },
}

impl Predicate {
    pub fn eq(column: &str, value: &str) -> Self {
        Self::Eq {
            column: column.to_string(),
            value: value.to_string(),
        }
    }

    pub fn any_of(column: &str, values: Vec<String>) -> Self {
        Self::In {
            column: column.to_string(),
            values,
        }
    }

    pub fn column(&self) -> &str {
        match self {
            Self::Eq { column, .. } | Self::In { column, .. } => column,
        }
    }

    pub fn matches(&self, candidate: Option<&str>) -> bool {
        let Some(candidate) = candidate else {
            return false;
        };
        match self {
            Self::Eq { value, .. } => value == candidate,
            Self::In { values, .. } => values.iter().any(|v| v == candidate),
        }
    }
}

// ── Relational store ──────────────────────────────────────────

/// Relational store connection used by the snapshot builder and restore executor.
#[async_trait]
pub trait PersistenceAdapter: Send + Sync {
    /// Read all rows of `table` matching `predicate`, ordered by `order_by` text.
    async fn select_rows(
        &self,
        table: &str,
        predicate: &Predicate,
        order_by: &str,
    ) -> Result<Vec<RowRecord>>;

    /// Open a transaction. Dropping it without `commit` rolls it back.
    async fn begin(&self) -> Result<Box<dyn StoreTransaction>>;
}

/// One open transaction. Every write of a restore goes through a single instance.
#[async_trait]
pub trait StoreTransaction: Send {
    /// Try to take an exclusive advisory lock held until commit/rollback.
    /// Returns `false` immediately on contention.
    async fn try_advisory_lock(&mut self, key: &str) -> Result<bool>;

    /// Whether `table` exists in the destination schema.
    async fn table_exists(&mut self, table: &str) -> Result<bool>;

    /// Text form of `column` for every live row matching `predicate`.
    async fn select_keys(
        &mut self,
        table: &str,
        column: &str,
        predicate: &Predicate,
    ) -> Result<Vec<String>>;

    async fn delete_rows(&mut self, table: &str, predicate: &Predicate) -> Result<u64>;

    /// Insert rows verbatim, primary keys included.
    async fn insert_rows(&mut self, table: &str, rows: &[RowRecord]) -> Result<u64>;

    async fn commit(self: Box<Self>) -> Result<()>;

    async fn rollback(self: Box<Self>) -> Result<()>;
}

// ── Audit log ─────────────────────────────────────────────────

/// Append-only storage for hash-chained audit events.
#[async_trait]
pub trait AuditStore: Send + Sync {
    /// Start an append for `tenant_id`. Appends for one tenant are serialized:
    /// a second caller waits until the first commits or drops its handle.
    async fn begin_append(&self, tenant_id: &str) -> Result<Box<dyn AuditAppend>>;

    /// Events for `tenant_id` in chain order.
    async fn list_events(&self, tenant_id: &str, filter: &AuditFilter) -> Result<Vec<AuditEvent>>;
}

#[async_trait]
pub trait AuditAppend: Send {
    /// `current_hash` of the tenant's latest event, if any.
    async fn last_hash(&mut self) -> Result<Option<String>>;

    async fn insert(&mut self, event: &AuditEvent) -> Result<()>;

    async fn commit(self: Box<Self>) -> Result<()>;
}

// ── Archive ───────────────────────────────────────────────────

/// Durable key/value blob store. Keys look like `{tenant}/{folder}/{file}`.
#[async_trait]
pub trait ArchiveSink: Send + Sync {
    async fn put(&self, key: &str, bytes: &[u8]) -> Result<()>;

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Keys starting with `prefix`, sorted ascending.
    async fn list(&self, prefix: &str) -> Result<Vec<String>>;

    async fn delete(&self, key: &str) -> Result<()>;
}
