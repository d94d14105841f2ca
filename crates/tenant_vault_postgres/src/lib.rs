//! Tenant vault PostgreSQL adapter.
//!
//! Implements the `tenant_vault_core` port traits over a shared `PgPool`.
//! All SQL is runtime-checked (`sqlx::query`, not `sqlx::query!`) so building
//! never needs a live database.

pub mod audit_store;
pub mod locks;
pub mod persistence;

use std::sync::Arc;

use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;

pub use audit_store::PgAuditStore;
pub use persistence::{PgPersistence, PgTransaction};

/// Both Postgres adapters over one pool.
#[derive(Clone)]
pub struct PgStores {
    pub pool: PgPool,
    pub persistence: Arc<PgPersistence>,
    pub audit: Arc<PgAuditStore>,
}

impl PgStores {
    pub fn new(pool: PgPool, schema: &str) -> anyhow::Result<Self> {
        Ok(Self {
            persistence: Arc::new(PgPersistence::new(pool.clone(), schema)?),
            audit: Arc::new(PgAuditStore::new(pool.clone(), schema)?),
            pool,
        })
    }

    pub async fn connect(database_url: &str, schema: &str) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await?;
        tracing::info!(schema, "connected to postgres");
        Self::new(pool, schema)
    }
}
