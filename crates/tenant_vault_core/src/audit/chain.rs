//! Hash linking and chain verification.
//!
//! Hash input is the canonical JSON of
//! `{actor_id, description, event_type, occurred_at, previous_hash, tenant_id}`
//! with keys in sorted order and `occurred_at` in RFC 3339 at microsecond
//! precision. Digest: SHA-256, hex-encoded. `metadata` is not sealed.

use chrono::SecondsFormat;
use serde::Serialize;
use sha2::{Digest, Sha256};
use uuid::Uuid;

use super::AuditEvent;

/// `previous_hash` of the first event in every chain.
pub const GENESIS_HASH: &str = "";

pub fn canonical_payload(event: &AuditEvent) -> String {
    // serde_json's default map is ordered by key.
    serde_json::json!({
        "actor_id": event.actor_id,
        "description": event.description,
        "event_type": event.event_type,
        "occurred_at": event.occurred_at.to_rfc3339_opts(SecondsFormat::Micros, true),
        "previous_hash": event.previous_hash,
        "tenant_id": event.tenant_id,
    })
    .to_string()
}

pub fn compute_hash(event: &AuditEvent) -> String {
    hex::encode(Sha256::digest(canonical_payload(event).as_bytes()))
}

/// Fill in `current_hash` from the event's sealed fields.
pub fn seal(mut event: AuditEvent) -> AuditEvent {
    event.current_hash = compute_hash(&event);
    event
}

/// Serialize-only: an internally tagged enum cannot read back
/// arbitrary-precision numbers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ChainFinding {
    /// First stored event does not start from the genesis hash (head deleted).
    GenesisNotEmpty {
        index: usize,
        event_id: Uuid,
        previous_hash: String,
    },
    /// Stored hash differs from the recomputed one (field tampered).
    HashMismatch {
        index: usize,
        event_id: Uuid,
        stored: String,
        recomputed: String,
    },
    /// `previous_hash` does not equal the prior event's hash (gap or rewrite).
    BrokenLink {
        index: usize,
        event_id: Uuid,
        expected_previous: String,
        found_previous: String,
    },
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ChainReport {
    pub events_checked: usize,
    pub head_hash: Option<String>,
    pub findings: Vec<ChainFinding>,
}

impl ChainReport {
    pub fn is_intact(&self) -> bool {
        self.findings.is_empty()
    }
}

/// Replay a tenant's full chain in order, recomputing every hash and checking
/// every link.
pub fn verify_chain(events: &[AuditEvent]) -> ChainReport {
    let mut findings = Vec::new();
    let mut expected_previous = GENESIS_HASH.to_string();

    for (index, event) in events.iter().enumerate() {
        if event.previous_hash != expected_previous {
            findings.push(if index == 0 {
                ChainFinding::GenesisNotEmpty {
                    index,
                    event_id: event.id,
                    previous_hash: event.previous_hash.clone(),
                }
            } else {
                ChainFinding::BrokenLink {
                    index,
                    event_id: event.id,
                    expected_previous: expected_previous.clone(),
                    found_previous: event.previous_hash.clone(),
                }
            });
        }

        let recomputed = compute_hash(event);
        if recomputed != event.current_hash {
            findings.push(ChainFinding::HashMismatch {
                index,
                event_id: event.id,
                stored: event.current_hash.clone(),
                recomputed,
            });
        }

        expected_previous = event.current_hash.clone();
    }

    ChainReport {
        events_checked: events.len(),
        head_hash: events.last().map(|e| e.current_hash.clone()),
        findings,
    }
}
