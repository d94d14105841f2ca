//! Postgres implementation of [`AuditStore`].
//!
//! Appends for one tenant serialize on a transaction-scoped advisory lock, so
//! reading the chain head and inserting the next event are atomic with respect
//! to every other writer, in any process.

use anyhow::anyhow;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, Transaction};
use uuid::Uuid;

use tenant_vault_core::audit::{AuditEvent, AuditFilter};
use tenant_vault_core::ports::{AuditAppend, AuditStore, Result};

use crate::locks::{advisory_xact_lock, lock_key};
use crate::persistence::quote_ident;

const MIGRATION: &str = include_str!("../migrations/0001_audit_events.sql");

type EventRow = (
    Uuid,
    String,
    Option<String>,
    String,
    String,
    DateTime<Utc>,
    String,
    String,
    serde_json::Value,
);

fn into_event(row: EventRow) -> AuditEvent {
    let (
        id,
        tenant_id,
        actor_id,
        event_type,
        description,
        occurred_at,
        previous_hash,
        current_hash,
        metadata,
    ) = row;
    AuditEvent {
        id,
        tenant_id,
        actor_id,
        event_type,
        description,
        occurred_at,
        previous_hash,
        current_hash,
        metadata,
    }
}

#[derive(Clone)]
pub struct PgAuditStore {
    pool: PgPool,
    table: String,
    schema: String,
}

impl PgAuditStore {
    pub fn new(pool: PgPool, schema: &str) -> anyhow::Result<Self> {
        Ok(Self {
            pool,
            table: format!("{}.audit_events", quote_ident(schema)?),
            schema: schema.to_string(),
        })
    }

    /// Create the audit table, indexes and append-only trigger if missing.
    pub async fn ensure_schema(&self) -> anyhow::Result<()> {
        let schema = quote_ident(&self.schema)?;
        let mut tx = self.pool.begin().await?;
        sqlx::query(&format!("CREATE SCHEMA IF NOT EXISTS {schema}"))
            .execute(&mut *tx)
            .await?;
        sqlx::query(&format!("SET LOCAL search_path TO {schema}"))
            .execute(&mut *tx)
            .await?;
        sqlx::raw_sql(MIGRATION).execute(&mut *tx).await?;
        tx.commit().await?;
        tracing::info!(schema = %self.schema, "audit schema ready");
        Ok(())
    }
}

#[async_trait]
impl AuditStore for PgAuditStore {
    async fn begin_append(&self, tenant_id: &str) -> Result<Box<dyn AuditAppend>> {
        let mut tx = self.pool.begin().await.map_err(|e| anyhow!(e))?;
        advisory_xact_lock(&mut tx, lock_key("audit_chain", tenant_id))
            .await
            .map_err(|e| anyhow!(e))?;
        Ok(Box::new(PgAuditAppend {
            tx,
            table: self.table.clone(),
            tenant_id: tenant_id.to_string(),
        }))
    }

    async fn list_events(&self, tenant_id: &str, filter: &AuditFilter) -> Result<Vec<AuditEvent>> {
        let sql = format!(
            r#"
            SELECT id, tenant_id, actor_id, event_type, description,
                   occurred_at, previous_hash, current_hash, metadata
            FROM {}
            WHERE tenant_id = $1
              AND ($2::timestamptz IS NULL OR occurred_at >= $2)
              AND ($3::timestamptz IS NULL OR occurred_at <= $3)
              AND (cardinality($4::text[]) = 0 OR event_type = ANY($4))
            ORDER BY seq
            "#,
            self.table
        );
        let rows = sqlx::query_as::<_, EventRow>(&sql)
            .bind(tenant_id)
            .bind(filter.from)
            .bind(filter.to)
            .bind(&filter.event_types)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| anyhow!(e))?;
        Ok(rows.into_iter().map(into_event).collect())
    }
}

struct PgAuditAppend {
    tx: Transaction<'static, Postgres>,
    table: String,
    tenant_id: String,
}

#[async_trait]
impl AuditAppend for PgAuditAppend {
    async fn last_hash(&mut self) -> Result<Option<String>> {
        let sql = format!(
            "SELECT current_hash FROM {} WHERE tenant_id = $1 ORDER BY seq DESC LIMIT 1",
            self.table
        );
        let hash: Option<String> = sqlx::query_scalar(&sql)
            .bind(&self.tenant_id)
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(|e| anyhow!(e))?;
        Ok(hash)
    }

    async fn insert(&mut self, event: &AuditEvent) -> Result<()> {
        let sql = format!(
            r#"
            INSERT INTO {} (
                id, tenant_id, actor_id, event_type, description,
                occurred_at, previous_hash, current_hash, metadata
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
            self.table
        );
        sqlx::query(&sql)
            .bind(event.id)
            .bind(&event.tenant_id)
            .bind(&event.actor_id)
            .bind(&event.event_type)
            .bind(&event.description)
            .bind(event.occurred_at)
            .bind(&event.previous_hash)
            .bind(&event.current_hash)
            .bind(&event.metadata)
            .execute(&mut *self.tx)
            .await
            .map_err(|e| anyhow!(e))?;
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        self.tx.commit().await.map_err(|e| anyhow!(e))?;
        Ok(())
    }
}
