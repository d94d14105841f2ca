//! Tamper-evident audit log: per-tenant chains of hash-linked events.

mod chain;
mod export;
mod recorder;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub use chain::{
    canonical_payload, compute_hash, seal, verify_chain, ChainFinding, ChainReport, GENESIS_HASH,
};
pub use export::export_text;
pub use recorder::{AuditRecorder, EventDraft};

/// One link in a tenant's audit chain. Append-only: never mutated or deleted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEvent {
    pub id: Uuid,
    pub tenant_id: String,
    pub actor_id: Option<String>,
    pub event_type: String,
    pub description: String,
    pub occurred_at: DateTime<Utc>,
    pub previous_hash: String,
    pub current_hash: String,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

/// Read-side filter for exports. An empty `event_types` admits every type.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AuditFilter {
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    #[serde(default)]
    pub event_types: Vec<String>,
}

impl AuditFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn matches(&self, event: &AuditEvent) -> bool {
        if self.from.is_some_and(|from| event.occurred_at < from) {
            return false;
        }
        if self.to.is_some_and(|to| event.occurred_at > to) {
            return false;
        }
        self.event_types.is_empty() || self.event_types.iter().any(|t| *t == event.event_type)
    }
}

/// Event types emitted by the backup flow.
pub mod event_types {
    pub const SNAPSHOT_CREATED: &str = "backup.snapshot_created";
    pub const RESTORE_COMPLETED: &str = "backup.restore_completed";
    pub const RESTORE_FAILED: &str = "backup.restore_failed";
}
