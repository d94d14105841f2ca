use std::sync::Arc;

use chrono::{SubsecRound, Utc};
use uuid::Uuid;

use super::{seal, verify_chain, AuditEvent, AuditFilter, ChainReport};
use crate::ports::{AuditStore, Result};

/// An event before it is linked into the chain.
#[derive(Debug, Clone)]
pub struct EventDraft {
    pub tenant_id: String,
    pub actor_id: Option<String>,
    pub event_type: String,
    pub description: String,
    pub metadata: serde_json::Value,
}

impl EventDraft {
    pub fn new(tenant_id: &str, event_type: &str, description: impl Into<String>) -> Self {
        Self {
            tenant_id: tenant_id.to_string(),
            actor_id: None,
            event_type: event_type.to_string(),
            description: description.into(),
            metadata: serde_json::Value::Null,
        }
    }

    pub fn actor(mut self, actor_id: Option<&str>) -> Self {
        self.actor_id = actor_id.map(str::to_string);
        self
    }

    pub fn metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }
}

/// Appends events to per-tenant chains.
///
/// Appends for one tenant are serialized by the store, so two concurrent
/// callers can never both link to the same `previous_hash`.
#[derive(Clone)]
pub struct AuditRecorder {
    store: Arc<dyn AuditStore>,
}

impl AuditRecorder {
    pub fn new(store: Arc<dyn AuditStore>) -> Self {
        Self { store }
    }

    /// Append and report failures. Most callers want [`Self::append_event`].
    pub async fn try_append(&self, draft: EventDraft) -> Result<AuditEvent> {
        let mut tx = self.store.begin_append(&draft.tenant_id).await?;
        let previous_hash = tx.last_hash().await?.unwrap_or_default();

        // Stores keep microseconds; hashing anything finer would not verify later.
        let event = seal(AuditEvent {
            id: Uuid::now_v7(),
            tenant_id: draft.tenant_id,
            actor_id: draft.actor_id,
            event_type: draft.event_type,
            description: draft.description,
            occurred_at: Utc::now().trunc_subsecs(6),
            previous_hash,
            current_hash: String::new(),
            metadata: draft.metadata,
        });

        tx.insert(&event).await?;
        tx.commit().await?;
        tracing::debug!(
            tenant_id = %event.tenant_id,
            event_type = %event.event_type,
            hash = %event.current_hash,
            "audit event appended"
        );
        Ok(event)
    }

    /// Append an event. Never fails the calling business operation: errors are
    /// logged and swallowed.
    pub async fn append_event(&self, draft: EventDraft) -> Option<AuditEvent> {
        let tenant_id = draft.tenant_id.clone();
        let event_type = draft.event_type.clone();
        match self.try_append(draft).await {
            Ok(event) => Some(event),
            Err(e) => {
                tracing::error!(
                    tenant_id = %tenant_id,
                    event_type = %event_type,
                    error = %e,
                    "audit append failed; event dropped"
                );
                None
            }
        }
    }

    pub async fn events(&self, tenant_id: &str, filter: &AuditFilter) -> Result<Vec<AuditEvent>> {
        self.store.list_events(tenant_id, filter).await
    }

    /// Verify the tenant's whole chain.
    pub async fn verify(&self, tenant_id: &str) -> Result<ChainReport> {
        let events = self.store.list_events(tenant_id, &AuditFilter::all()).await?;
        Ok(verify_chain(&events))
    }
}
