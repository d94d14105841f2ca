//! In-memory implementation of the persistence and audit ports.
//!
//! Transactions work on a private copy of the tables and replay their
//! operations onto the live state on commit; dropping one discards it. Advisory
//! locks are process-local.
//!
//! Failure injection, pauses and call counters are compiled in for unit tests
//! and behind the `testing` feature; production builds only get the fixture
//! helpers.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::anyhow;
use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{Notify, OwnedMutexGuard};

use crate::audit::{AuditEvent, AuditFilter};
use crate::ports::{
    AuditAppend, AuditStore, PersistenceAdapter, Predicate, Result, StoreTransaction,
};
use crate::snapshot::{key_text, RowRecord};

type Tables = BTreeMap<String, Vec<RowRecord>>;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Suspends the next matching store call until released. Lets tests observe a
/// restore while it holds its locks, or a snapshot stuck mid-read.
#[derive(Clone, Default)]
pub struct CallPause {
    pub reached: Arc<Notify>,
    pub release: Arc<Notify>,
}

#[derive(Default)]
struct Inner {
    tables: Mutex<Tables>,
    advisory_locks: Mutex<HashSet<String>>,
    fail_reads: Mutex<HashSet<String>>,
    fail_inserts: Mutex<HashSet<String>>,
    select_calls: Mutex<HashMap<String, usize>>,
    insert_pause: Mutex<Option<CallPause>>,
    select_pause: Mutex<Option<CallPause>>,
    events: Mutex<HashMap<String, Vec<AuditEvent>>>,
    chain_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    fail_audit: Mutex<bool>,
}

#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    // ── Fixture helpers ──

    /// Append rows to `table`, creating it if needed. Non-object values are ignored.
    pub fn seed(&self, table: &str, rows: Vec<Value>) {
        let mut tables = lock(&self.inner.tables);
        let entry = tables.entry(table.to_string()).or_default();
        entry.extend(rows.into_iter().filter_map(|row| match row {
            Value::Object(map) => Some(map.into_iter().collect::<RowRecord>()),
            _ => None,
        }));
    }

    pub fn create_table(&self, table: &str) {
        lock(&self.inner.tables).entry(table.to_string()).or_default();
    }

    pub fn drop_table(&self, table: &str) {
        lock(&self.inner.tables).remove(table);
    }

    /// Live rows of `table`, in stored order.
    pub fn rows(&self, table: &str) -> Vec<RowRecord> {
        lock(&self.inner.tables)
            .get(table)
            .cloned()
            .unwrap_or_default()
    }

    pub fn dump(&self) -> BTreeMap<String, Vec<RowRecord>> {
        lock(&self.inner.tables).clone()
    }
}

#[cfg(any(test, feature = "testing"))]
impl MemoryStore {
    // ── Failure injection ──

    pub fn fail_reads_on(&self, table: &str) {
        lock(&self.inner.fail_reads).insert(table.to_string());
    }

    pub fn fail_inserts_on(&self, table: &str) {
        lock(&self.inner.fail_inserts).insert(table.to_string());
    }

    pub fn clear_failures(&self) {
        lock(&self.inner.fail_reads).clear();
        lock(&self.inner.fail_inserts).clear();
        *lock(&self.inner.fail_audit) = false;
    }

    pub fn fail_audit_appends(&self, fail: bool) {
        *lock(&self.inner.fail_audit) = fail;
    }

    pub fn select_calls(&self, table: &str) -> usize {
        lock(&self.inner.select_calls)
            .get(table)
            .copied()
            .unwrap_or(0)
    }

    pub fn pause_next_insert(&self) -> CallPause {
        let pause = CallPause::default();
        *lock(&self.inner.insert_pause) = Some(pause.clone());
        pause
    }

    pub fn pause_next_select(&self) -> CallPause {
        let pause = CallPause::default();
        *lock(&self.inner.select_pause) = Some(pause.clone());
        pause
    }

    pub fn is_locked(&self, key: &str) -> bool {
        lock(&self.inner.advisory_locks).contains(key)
    }

    /// Raw access to a tenant's stored events, for tamper tests.
    pub fn with_events<R>(&self, tenant_id: &str, f: impl FnOnce(&mut Vec<AuditEvent>) -> R) -> R {
        let mut events = lock(&self.inner.events);
        f(events.entry(tenant_id.to_string()).or_default())
    }
}

async fn wait_if_paused(slot: &Mutex<Option<CallPause>>) {
    let pause = lock(slot).take();
    if let Some(pause) = pause {
        pause.reached.notify_one();
        pause.release.notified().await;
    }
}

fn missing_table(table: &str) -> anyhow::Error {
    anyhow!("relation \"{table}\" does not exist")
}

fn select_from(tables: &Tables, table: &str, predicate: &Predicate) -> Result<Vec<RowRecord>> {
    let rows = tables.get(table).ok_or_else(|| missing_table(table))?;
    Ok(rows
        .iter()
        .filter(|row| {
            predicate.matches(row.get(predicate.column()).and_then(key_text).as_deref())
        })
        .cloned()
        .collect())
}

fn delete_from(tables: &mut Tables, table: &str, predicate: &Predicate) -> Result<u64> {
    let rows = tables.get_mut(table).ok_or_else(|| missing_table(table))?;
    let before = rows.len();
    rows.retain(|row| !predicate.matches(row.get(predicate.column()).and_then(key_text).as_deref()));
    Ok((before - rows.len()) as u64)
}

fn insert_into(tables: &mut Tables, table: &str, rows: &[RowRecord]) -> Result<u64> {
    let existing = tables.get_mut(table).ok_or_else(|| missing_table(table))?;
    existing.extend_from_slice(rows);
    Ok(rows.len() as u64)
}

#[async_trait]
impl PersistenceAdapter for MemoryStore {
    async fn select_rows(
        &self,
        table: &str,
        predicate: &Predicate,
        order_by: &str,
    ) -> Result<Vec<RowRecord>> {
        *lock(&self.inner.select_calls)
            .entry(table.to_string())
            .or_default() += 1;
        wait_if_paused(&self.inner.select_pause).await;
        if lock(&self.inner.fail_reads).contains(table) {
            return Err(anyhow!("injected read failure on {table}").into());
        }
        let mut rows = select_from(&lock(&self.inner.tables), table, predicate)?;
        // NULL keys last, as Postgres orders ascending.
        rows.sort_by_key(|row| {
            let key = row.get(order_by).and_then(key_text);
            (key.is_none(), key)
        });
        Ok(rows)
    }

    async fn begin(&self) -> Result<Box<dyn StoreTransaction>> {
        let working = lock(&self.inner.tables).clone();
        Ok(Box::new(MemoryTransaction {
            inner: Arc::clone(&self.inner),
            working,
            ops: Vec::new(),
            held_locks: Vec::new(),
        }))
    }
}

enum Op {
    Delete { table: String, predicate: Predicate },
    Insert { table: String, rows: Vec<RowRecord> },
}

struct MemoryTransaction {
    inner: Arc<Inner>,
    working: Tables,
    ops: Vec<Op>,
    held_locks: Vec<String>,
}

impl Drop for MemoryTransaction {
    fn drop(&mut self) {
        let mut locks = lock(&self.inner.advisory_locks);
        for key in self.held_locks.drain(..) {
            locks.remove(&key);
        }
    }
}

#[async_trait]
impl StoreTransaction for MemoryTransaction {
    async fn try_advisory_lock(&mut self, key: &str) -> Result<bool> {
        if self.held_locks.iter().any(|k| k == key) {
            return Ok(true);
        }
        let acquired = lock(&self.inner.advisory_locks).insert(key.to_string());
        if acquired {
            self.held_locks.push(key.to_string());
        }
        Ok(acquired)
    }

    async fn table_exists(&mut self, table: &str) -> Result<bool> {
        Ok(self.working.contains_key(table))
    }

    async fn select_keys(
        &mut self,
        table: &str,
        column: &str,
        predicate: &Predicate,
    ) -> Result<Vec<String>> {
        Ok(select_from(&self.working, table, predicate)?
            .iter()
            .filter_map(|row| row.get(column).and_then(key_text))
            .collect())
    }

    async fn delete_rows(&mut self, table: &str, predicate: &Predicate) -> Result<u64> {
        let n = delete_from(&mut self.working, table, predicate)?;
        self.ops.push(Op::Delete {
            table: table.to_string(),
            predicate: predicate.clone(),
        });
        Ok(n)
    }

    async fn insert_rows(&mut self, table: &str, rows: &[RowRecord]) -> Result<u64> {
        wait_if_paused(&self.inner.insert_pause).await;
        if lock(&self.inner.fail_inserts).contains(table) {
            return Err(anyhow!("injected insert failure on {table}").into());
        }
        let n = insert_into(&mut self.working, table, rows)?;
        self.ops.push(Op::Insert {
            table: table.to_string(),
            rows: rows.to_vec(),
        });
        Ok(n)
    }

    async fn commit(mut self: Box<Self>) -> Result<()> {
        let mut live = lock(&self.inner.tables);
        let mut staged = live.clone();
        for op in self.ops.drain(..) {
            match op {
                Op::Delete { table, predicate } => {
                    delete_from(&mut staged, &table, &predicate)?;
                }
                Op::Insert { table, rows } => {
                    insert_into(&mut staged, &table, &rows)?;
                }
            }
        }
        *live = staged;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        Ok(())
    }
}

// ── Audit ─────────────────────────────────────────────────────

#[async_trait]
impl AuditStore for MemoryStore {
    async fn begin_append(&self, tenant_id: &str) -> Result<Box<dyn AuditAppend>> {
        if *lock(&self.inner.fail_audit) {
            return Err(anyhow!("injected audit store failure").into());
        }
        let chain_lock = Arc::clone(
            lock(&self.inner.chain_locks)
                .entry(tenant_id.to_string())
                .or_default(),
        );
        let guard = chain_lock.lock_owned().await;
        Ok(Box::new(MemoryAuditAppend {
            inner: Arc::clone(&self.inner),
            tenant_id: tenant_id.to_string(),
            pending: Vec::new(),
            _guard: guard,
        }))
    }

    async fn list_events(&self, tenant_id: &str, filter: &AuditFilter) -> Result<Vec<AuditEvent>> {
        Ok(lock(&self.inner.events)
            .get(tenant_id)
            .map(|events| {
                events
                    .iter()
                    .filter(|e| filter.matches(e))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }
}

struct MemoryAuditAppend {
    inner: Arc<Inner>,
    tenant_id: String,
    pending: Vec<AuditEvent>,
    _guard: OwnedMutexGuard<()>,
}

#[async_trait]
impl AuditAppend for MemoryAuditAppend {
    async fn last_hash(&mut self) -> Result<Option<String>> {
        if let Some(e) = self.pending.last() {
            return Ok(Some(e.current_hash.clone()));
        }
        Ok(lock(&self.inner.events)
            .get(&self.tenant_id)
            .and_then(|events| events.last())
            .map(|e| e.current_hash.clone()))
    }

    async fn insert(&mut self, event: &AuditEvent) -> Result<()> {
        self.pending.push(event.clone());
        Ok(())
    }

    async fn commit(mut self: Box<Self>) -> Result<()> {
        let pending = std::mem::take(&mut self.pending);
        lock(&self.inner.events)
            .entry(self.tenant_id.clone())
            .or_default()
            .extend(pending);
        Ok(())
    }
}
