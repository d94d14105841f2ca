//! Tamper detection over chains written through `AuditRecorder`.

use std::sync::Arc;

use tenant_vault_core::audit::{event_types, GENESIS_HASH};
use tenant_vault_core::memory::MemoryStore;
use tenant_vault_core::{AuditFilter, AuditRecorder, ChainFinding, EventDraft};

async fn chain_of(store: &MemoryStore, tenant_id: &str, n: usize) -> AuditRecorder {
    let recorder = AuditRecorder::new(Arc::new(store.clone()));
    for i in 0..n {
        recorder
            .try_append(
                EventDraft::new(tenant_id, "invoice.issued", format!("invoice {i} issued"))
                    .actor(Some("u-1"))
                    .metadata(serde_json::json!({ "n": i })),
            )
            .await
            .unwrap();
    }
    recorder
}

#[tokio::test]
async fn untouched_chain_verifies() {
    let store = MemoryStore::new();
    let recorder = chain_of(&store, "T1", 4).await;

    let report = recorder.verify("T1").await.unwrap();
    assert!(report.is_intact());
    assert_eq!(report.events_checked, 4);

    let events = recorder.events("T1", &AuditFilter::all()).await.unwrap();
    assert_eq!(events[0].previous_hash, GENESIS_HASH);
    for pair in events.windows(2) {
        assert_eq!(pair[1].previous_hash, pair[0].current_hash);
    }
    assert_eq!(report.head_hash.as_deref(), Some(events[3].current_hash.as_str()));
}

#[tokio::test]
async fn edited_description_is_a_hash_mismatch() {
    let store = MemoryStore::new();
    let recorder = chain_of(&store, "T1", 3).await;

    store.with_events("T1", |events| {
        events[1].description = "invoice 1 voided".into();
    });

    let report = recorder.verify("T1").await.unwrap();
    assert_eq!(report.findings.len(), 1);
    assert!(matches!(
        report.findings[0],
        ChainFinding::HashMismatch { index: 1, .. }
    ));
}

#[tokio::test]
async fn rewritten_hash_breaks_the_next_link() {
    let store = MemoryStore::new();
    let recorder = chain_of(&store, "T1", 3).await;

    // Re-sealing a doctored event hides its own mismatch but not the link.
    store.with_events("T1", |events| {
        events[1].actor_id = Some("intruder".into());
        events[1].current_hash = tenant_vault_core::audit::compute_hash(&events[1]);
    });

    let report = recorder.verify("T1").await.unwrap();
    assert_eq!(report.findings.len(), 1);
    assert!(matches!(
        report.findings[0],
        ChainFinding::BrokenLink { index: 2, .. }
    ));
}

#[tokio::test]
async fn deleted_events_are_detected() {
    let store = MemoryStore::new();
    let recorder = chain_of(&store, "T1", 4).await;

    store.with_events("T1", |events| {
        events.remove(2);
    });
    let report = recorder.verify("T1").await.unwrap();
    assert!(matches!(
        report.findings.as_slice(),
        [ChainFinding::BrokenLink { index: 2, .. }]
    ));

    store.with_events("T1", |events| {
        events.remove(0);
    });
    let report = recorder.verify("T1").await.unwrap();
    assert!(report
        .findings
        .iter()
        .any(|f| matches!(f, ChainFinding::GenesisNotEmpty { index: 0, .. })));
}

#[tokio::test]
async fn metadata_is_outside_the_seal() {
    let store = MemoryStore::new();
    let recorder = chain_of(&store, "T1", 2).await;

    store.with_events("T1", |events| {
        events[0].metadata = serde_json::json!({ "n": 99 });
    });
    assert!(recorder.verify("T1").await.unwrap().is_intact());
}

#[tokio::test]
async fn tenants_have_independent_chains() {
    let store = MemoryStore::new();
    let recorder = chain_of(&store, "T1", 2).await;
    recorder
        .try_append(EventDraft::new("T2", event_types::SNAPSHOT_CREATED, "first for T2"))
        .await
        .unwrap();

    let t2 = recorder.events("T2", &AuditFilter::all()).await.unwrap();
    assert_eq!(t2.len(), 1);
    assert_eq!(t2[0].previous_hash, GENESIS_HASH);

    store.with_events("T1", |events| events.clear());
    assert!(recorder.verify("T2").await.unwrap().is_intact());
}

#[tokio::test]
async fn export_filters_by_type_and_range() {
    let store = MemoryStore::new();
    let recorder = chain_of(&store, "T1", 2).await;
    let snap = recorder
        .try_append(EventDraft::new("T1", event_types::SNAPSHOT_CREATED, "snapshot"))
        .await
        .unwrap();

    let only_backups = AuditFilter {
        event_types: vec![event_types::SNAPSHOT_CREATED.into()],
        ..Default::default()
    };
    let events = recorder.events("T1", &only_backups).await.unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].id, snap.id);

    let since = AuditFilter {
        from: Some(snap.occurred_at),
        ..Default::default()
    };
    let events = recorder.events("T1", &since).await.unwrap();
    assert!(events.iter().any(|e| e.id == snap.id));

    let text = tenant_vault_core::audit::export_text("T1", &only_backups, &events[..1]);
    assert!(text.contains("event types: backup.snapshot_created"));
}
