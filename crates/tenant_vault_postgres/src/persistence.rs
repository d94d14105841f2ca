//! Postgres implementation of [`PersistenceAdapter`].
//!
//! Rows travel as JSONB: reads use `to_jsonb(t)`, writes use
//! `jsonb_populate_recordset`, so no per-table column mapping is needed. Every
//! predicate compares `column::text = ANY($1)` with the values bound as a text
//! array. Identifiers are validated and quoted, never taken from row data.

use anyhow::anyhow;
use async_trait::async_trait;
use serde_json::Value;
use sqlx::{PgPool, Postgres, Transaction};

use tenant_vault_core::catalog::is_identifier;
use tenant_vault_core::ports::{PersistenceAdapter, Predicate, Result, StoreTransaction};
use tenant_vault_core::RowRecord;

use crate::locks::{lock_key, try_advisory_xact_lock};

/// `"name"`, after checking the name is a plain lower-case identifier.
pub(crate) fn quote_ident(name: &str) -> anyhow::Result<String> {
    if is_identifier(name) {
        Ok(format!("\"{name}\""))
    } else {
        Err(anyhow!("refusing unsafe SQL identifier '{name}'"))
    }
}

/// Bound values for a predicate, always as a text array.
fn predicate_values(predicate: &Predicate) -> Vec<String> {
    match predicate {
        Predicate::Eq { value, .. } => vec![value.clone()],
        Predicate::In { values, .. } => values.clone(),
    }
}

fn into_row(value: Value) -> anyhow::Result<RowRecord> {
    match value {
        Value::Object(map) => Ok(map.into_iter().collect()),
        other => Err(anyhow!("expected a row object, got {other}")),
    }
}

/// Advisory keys arrive as `kind:id`.
fn advisory_key(key: &str) -> i64 {
    match key.split_once(':') {
        Some((kind, id)) => lock_key(kind, id),
        None => lock_key("advisory", key),
    }
}

// ── PgPersistence ─────────────────────────────────────────────

#[derive(Clone)]
pub struct PgPersistence {
    pool: PgPool,
    schema: String,
}

impl PgPersistence {
    pub fn new(pool: PgPool, schema: &str) -> anyhow::Result<Self> {
        quote_ident(schema)?;
        Ok(Self {
            pool,
            schema: schema.to_string(),
        })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    fn table(&self, table: &str) -> anyhow::Result<String> {
        Ok(format!("{}.{}", quote_ident(&self.schema)?, quote_ident(table)?))
    }
}

#[async_trait]
impl PersistenceAdapter for PgPersistence {
    async fn select_rows(
        &self,
        table: &str,
        predicate: &Predicate,
        order_by: &str,
    ) -> Result<Vec<RowRecord>> {
        let sql = format!(
            "SELECT to_jsonb(t) FROM {} AS t WHERE t.{}::text = ANY($1) ORDER BY t.{}::text",
            self.table(table)?,
            quote_ident(predicate.column())?,
            quote_ident(order_by)?,
        );
        let rows: Vec<Value> = sqlx::query_scalar(&sql)
            .bind(predicate_values(predicate))
            .fetch_all(&self.pool)
            .await
            .map_err(|e| anyhow!(e))?;
        Ok(rows
            .into_iter()
            .map(into_row)
            .collect::<anyhow::Result<Vec<_>>>()?)
    }

    async fn begin(&self) -> Result<Box<dyn StoreTransaction>> {
        let tx = self.pool.begin().await.map_err(|e| anyhow!(e))?;
        Ok(Box::new(PgTransaction {
            tx,
            schema: self.schema.clone(),
        }))
    }
}

// ── PgTransaction ─────────────────────────────────────────────

/// Dropping without `commit` lets sqlx roll the transaction back.
pub struct PgTransaction {
    tx: Transaction<'static, Postgres>,
    schema: String,
}

impl PgTransaction {
    fn table(&self, table: &str) -> anyhow::Result<String> {
        Ok(format!("{}.{}", quote_ident(&self.schema)?, quote_ident(table)?))
    }
}

#[async_trait]
impl StoreTransaction for PgTransaction {
    async fn try_advisory_lock(&mut self, key: &str) -> Result<bool> {
        Ok(try_advisory_xact_lock(&mut self.tx, advisory_key(key))
            .await
            .map_err(|e| anyhow!(e))?)
    }

    async fn table_exists(&mut self, table: &str) -> Result<bool> {
        let exists: bool = sqlx::query_scalar("SELECT to_regclass($1) IS NOT NULL")
            .bind(self.table(table)?)
            .fetch_one(&mut *self.tx)
            .await
            .map_err(|e| anyhow!(e))?;
        Ok(exists)
    }

    async fn select_keys(
        &mut self,
        table: &str,
        column: &str,
        predicate: &Predicate,
    ) -> Result<Vec<String>> {
        let sql = format!(
            "SELECT t.{col}::text FROM {} AS t WHERE t.{}::text = ANY($1) AND t.{col} IS NOT NULL",
            self.table(table)?,
            quote_ident(predicate.column())?,
            col = quote_ident(column)?,
        );
        let keys: Vec<String> = sqlx::query_scalar(&sql)
            .bind(predicate_values(predicate))
            .fetch_all(&mut *self.tx)
            .await
            .map_err(|e| anyhow!(e))?;
        Ok(keys)
    }

    async fn delete_rows(&mut self, table: &str, predicate: &Predicate) -> Result<u64> {
        let sql = format!(
            "DELETE FROM {} AS t WHERE t.{}::text = ANY($1)",
            self.table(table)?,
            quote_ident(predicate.column())?,
        );
        let done = sqlx::query(&sql)
            .bind(predicate_values(predicate))
            .execute(&mut *self.tx)
            .await
            .map_err(|e| anyhow!(e))?;
        Ok(done.rows_affected())
    }

    async fn insert_rows(&mut self, table: &str, rows: &[RowRecord]) -> Result<u64> {
        if rows.is_empty() {
            return Ok(0);
        }
        let target = self.table(table)?;
        // Keys are restored verbatim, identity columns included.
        let sql = format!(
            "INSERT INTO {target} OVERRIDING SYSTEM VALUE \
             SELECT * FROM jsonb_populate_recordset(NULL::{target}, $1)"
        );
        let payload = Value::Array(
            rows.iter()
                .map(|row| Value::Object(row.clone().into_iter().collect()))
                .collect(),
        );
        let done = sqlx::query(&sql)
            .bind(payload)
            .execute(&mut *self.tx)
            .await
            .map_err(|e| anyhow!(e))?;
        Ok(done.rows_affected())
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        self.tx.commit().await.map_err(|e| anyhow!(e))?;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        self.tx.rollback().await.map_err(|e| anyhow!(e))?;
        Ok(())
    }
}
