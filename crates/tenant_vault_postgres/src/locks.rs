//! Transaction-scoped advisory locks.
//!
//! Keys are derived from `(kind, id)` so unrelated subsystems sharing a
//! database do not collide. Locks are released when the transaction commits
//! or rolls back.

use sha2::{Digest, Sha256};
use sqlx::{Postgres, Transaction};

/// Stable 64-bit lock key: first 8 bytes of `sha256("{kind}:{id}")`.
pub fn lock_key(kind: &str, id: &str) -> i64 {
    let digest = Sha256::digest(format!("{kind}:{id}").as_bytes());
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    i64::from_be_bytes(bytes)
}

/// Block until the lock is granted.
pub async fn advisory_xact_lock(
    tx: &mut Transaction<'_, Postgres>,
    key: i64,
) -> Result<(), sqlx::Error> {
    sqlx::query("SELECT pg_advisory_xact_lock($1)")
        .bind(key)
        .execute(&mut **tx)
        .await?;
    Ok(())
}

/// Fail fast: `false` if another session holds the lock.
pub async fn try_advisory_xact_lock(
    tx: &mut Transaction<'_, Postgres>,
    key: i64,
) -> Result<bool, sqlx::Error> {
    let (acquired,): (bool,) = sqlx::query_as("SELECT pg_try_advisory_xact_lock($1)")
        .bind(key)
        .fetch_one(&mut **tx)
        .await?;
    Ok(acquired)
}
