//! Snapshot/restore behaviour against the in-memory store, end to end through
//! `BackupService`.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use tenant_vault_core::audit::event_types;
use tenant_vault_core::memory::MemoryStore;
use tenant_vault_core::{
    restore_lock_key, AuditFilter, AuditRecorder, BackupService, BackupSettings, Catalog,
    MemoryArchiveSink, SnapshotArchive, SnapshotBuilder, VaultError,
};

// ── Fixtures ─────────────────────────────────────────────────────────────────

fn catalog() -> Arc<Catalog> {
    Arc::new(Catalog::business().unwrap())
}

fn empty_store(catalog: &Catalog) -> MemoryStore {
    let store = MemoryStore::new();
    for spec in catalog.iter() {
        store.create_table(&spec.name);
    }
    store
}

/// Tenant T1: 3 clients, 5 invoices across 2 of them, lines and payments.
/// Tenant T2: 1 client whose id is referenced by 2 invoices mislabelled T1.
fn seed_scenario(store: &MemoryStore) {
    store.seed(
        "company_settings",
        vec![
            json!({"id": "s-1", "tenant_id": "T1", "currency": "EUR"}),
            json!({"id": "s-2", "tenant_id": "T2", "currency": "USD"}),
        ],
    );
    store.seed(
        "clients",
        vec![
            json!({"id": 1, "tenant_id": "T1", "name": "Acme"}),
            json!({"id": 2, "tenant_id": "T1", "name": "Globex"}),
            json!({"id": 3, "tenant_id": "T1", "name": "Initech"}),
            json!({"id": 4, "tenant_id": "T2", "name": "Umbrella"}),
        ],
    );
    store.seed(
        "invoices",
        vec![
            json!({"id": 10, "client_id": 1, "tenant_id": "T1", "total": "100.00"}),
            json!({"id": 11, "client_id": 1, "tenant_id": "T1", "total": "250.00"}),
            json!({"id": 12, "client_id": 1, "tenant_id": "T1", "total": "75.50"}),
            json!({"id": 13, "client_id": 2, "tenant_id": "T1", "total": "10.00"}),
            json!({"id": 14, "client_id": 2, "tenant_id": "T1", "total": "999.99"}),
            // Colliding rows: labelled T1 but joined to T2's client.
            json!({"id": 40, "client_id": 4, "tenant_id": "T1", "total": "1.00"}),
            json!({"id": 41, "client_id": 4, "tenant_id": "T1", "total": "2.00"}),
        ],
    );
    store.seed(
        "invoice_lines",
        vec![
            json!({"id": 100, "invoice_id": 10, "qty": 2}),
            json!({"id": 101, "invoice_id": 13, "qty": 1}),
            json!({"id": 400, "invoice_id": 40, "qty": 9}),
        ],
    );
    store.seed(
        "payments",
        vec![json!({"id": 500, "invoice_id": 11, "amount": "250.00"})],
    );
    store.seed(
        "employees",
        vec![json!({"id": "e-1", "tenant_id": "T1", "name": "Ana"})],
    );
    store.seed(
        "time_entries",
        vec![json!({"id": 700, "employee_id": "e-1", "minutes": 90})],
    );
}

fn service(catalog: Arc<Catalog>, store: &MemoryStore, settings: BackupSettings) -> BackupService {
    let archive = SnapshotArchive::new(Arc::new(MemoryArchiveSink::new()), settings.retain_snapshots);
    BackupService::new(
        catalog,
        Arc::new(store.clone()),
        archive,
        AuditRecorder::new(Arc::new(store.clone())),
        settings,
    )
}

// ── Properties ───────────────────────────────────────────────────────────────

#[tokio::test]
async fn join_anchors_to_materialized_parent_ids() {
    let catalog = catalog();
    let store = empty_store(&catalog);
    seed_scenario(&store);

    let outcome = SnapshotBuilder::new(&catalog, &store).build("T1").await;
    let snapshot = outcome.snapshot;

    assert!(outcome.warnings.is_empty());
    assert_eq!(snapshot.rows("clients").len(), 3);
    assert_eq!(snapshot.rows("invoices").len(), 5);
    assert!(snapshot
        .rows("invoices")
        .iter()
        .all(|row| row["client_id"] != json!(4)));
    assert_eq!(snapshot.rows("invoice_lines").len(), 2);
    assert_eq!(snapshot.rows("payments").len(), 1);
    // No payslips exist, but employees captured a key, so the query ran.
    assert!(outcome.skipped.is_empty());
}

#[tokio::test]
async fn restore_then_snapshot_is_identical() {
    let catalog = catalog();
    let store = empty_store(&catalog);
    seed_scenario(&store);
    let svc = service(catalog.clone(), &store, BackupSettings::default());

    let first = svc.backup("T1", Some("admin")).await.unwrap();
    let report = svc.restore_latest("T1", Some("admin")).await.unwrap();
    assert_eq!(report.inserted["invoices"], 5);

    let again = SnapshotBuilder::new(&catalog, &store).build("T1").await.snapshot;
    assert_eq!(again.content_digest(), first.archived.digest);
    assert_eq!(again.row_counts(), first.row_counts);

    // Restoring the same snapshot twice changes nothing further.
    svc.restore_latest("T1", Some("admin")).await.unwrap();
    let third = SnapshotBuilder::new(&catalog, &store).build("T1").await.snapshot;
    assert_eq!(third.tables, again.tables);
}

#[tokio::test]
async fn restore_undoes_later_writes_without_touching_other_tenants() {
    let catalog = catalog();
    let store = empty_store(&catalog);
    seed_scenario(&store);
    let svc = service(catalog.clone(), &store, BackupSettings::default());

    let backup = svc.backup("T1", None).await.unwrap();
    let t2_before = SnapshotBuilder::new(&catalog, &store).build("T2").await.snapshot;

    store.seed("clients", vec![json!({"id": 5, "tenant_id": "T1", "name": "New"})]);
    store.seed("invoices", vec![json!({"id": 50, "client_id": 5, "total": "3.00"})]);
    store.seed("invoice_lines", vec![json!({"id": 501, "invoice_id": 50})]);

    svc.restore_latest("T1", None).await.unwrap();

    let t1_after = SnapshotBuilder::new(&catalog, &store).build("T1").await.snapshot;
    let t2_after = SnapshotBuilder::new(&catalog, &store).build("T2").await.snapshot;
    assert_eq!(t1_after.content_digest(), backup.archived.digest);
    assert_eq!(t2_after.content_digest(), t2_before.content_digest());
    assert!(!store.rows("invoice_lines").iter().any(|r| r["id"] == json!(501)));
}

#[tokio::test]
async fn forced_failure_on_last_insert_leaves_no_change() {
    let catalog = catalog();
    let store = empty_store(&catalog);
    seed_scenario(&store);
    let svc = service(catalog.clone(), &store, BackupSettings::default());
    svc.backup("T1", None).await.unwrap();

    store.seed("clients", vec![json!({"id": 6, "tenant_id": "T1", "name": "Late"})]);
    let before = store.dump();

    // Last catalog entity with rows in the snapshot is time_entries.
    store.fail_inserts_on("time_entries");
    let err = svc.restore_latest("T1", None).await.unwrap_err();
    assert!(matches!(err, VaultError::Store(_)));
    assert_eq!(store.dump(), before);

    let failures = svc
        .export_audit(
            "T1",
            &AuditFilter {
                event_types: vec![event_types::RESTORE_FAILED.into()],
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(failures.len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn concurrent_restore_is_rejected_not_interleaved() {
    let catalog = catalog();
    let store = empty_store(&catalog);
    seed_scenario(&store);
    let svc = Arc::new(service(catalog.clone(), &store, BackupSettings::default()));
    svc.backup("T1", None).await.unwrap();

    let pause = store.pause_next_insert();
    let first = svc.spawn_restore_latest("T1".into(), None);
    pause.reached.notified().await;

    // In-process guard rejects.
    let err = svc.restore_latest("T1", None).await.unwrap_err();
    assert!(matches!(err, VaultError::Busy(_)));
    assert!(err.is_retryable());

    // A second process (separate service, same store) hits the advisory lock.
    let other = service(catalog.clone(), &store, BackupSettings::default());
    let snapshot = SnapshotBuilder::new(&catalog, &store).build("T1").await.snapshot;
    let err = other
        .restore_snapshot("T1", None, &snapshot, tenant_vault_core::RestoreSource::Upload)
        .await
        .unwrap_err();
    assert!(matches!(err, VaultError::Busy(_)));
    assert!(store.is_locked(&restore_lock_key("T1")));

    // Other tenants proceed in parallel.
    other.backup("T2", None).await.unwrap();

    pause.release.notify_one();
    first.await.unwrap().unwrap();
    assert!(!store.is_locked(&restore_lock_key("T1")));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cancelled_restore_rolls_back() {
    let catalog = catalog();
    let store = empty_store(&catalog);
    seed_scenario(&store);
    let svc = Arc::new(service(catalog.clone(), &store, BackupSettings::default()));
    svc.backup("T1", None).await.unwrap();
    store.seed("clients", vec![json!({"id": 7, "tenant_id": "T1"})]);
    let before = store.dump();

    let pause = store.pause_next_insert();
    let handle = svc.spawn_restore_latest("T1".into(), None);
    pause.reached.notified().await;
    handle.abort();
    assert!(handle.await.unwrap_err().is_cancelled());

    assert_eq!(store.dump(), before);
    assert!(!store.is_locked(&restore_lock_key("T1")));
    svc.restore_latest("T1", None).await.unwrap();
}

#[tokio::test]
async fn restore_timeout_maps_to_rollback() {
    let catalog = catalog();
    let store = empty_store(&catalog);
    seed_scenario(&store);
    let settings = BackupSettings {
        restore_timeout: Duration::from_millis(50),
        ..Default::default()
    };
    let svc = service(catalog.clone(), &store, settings);
    svc.backup("T1", None).await.unwrap();
    let before = store.dump();

    let _pause = store.pause_next_insert();
    let err = svc.restore_latest("T1", None).await.unwrap_err();
    assert!(matches!(err, VaultError::TimedOut { retryable: false, .. }));
    assert_eq!(store.dump(), before);
}

#[tokio::test]
async fn malformed_upload_is_rejected_before_any_delete() {
    let catalog = catalog();
    let store = empty_store(&catalog);
    seed_scenario(&store);
    let svc = service(catalog.clone(), &store, BackupSettings::default());
    let before = store.dump();

    let err = svc
        .restore_upload("T1", None, br#"{"clients": []}"#)
        .await
        .unwrap_err();
    assert!(matches!(err, VaultError::Validation(_)));
    assert_eq!(err.http_status(), 400);
    assert_eq!(store.dump(), before);
}

#[tokio::test]
async fn uploaded_snapshot_replaces_tenant_data() {
    let catalog = catalog();
    let store = empty_store(&catalog);
    seed_scenario(&store);
    let svc = service(catalog.clone(), &store, BackupSettings::default());

    let payload = json!({
        "tables": {
            "clients": [{"id": 9, "tenant_id": "T1", "name": "Solo"}],
            "invoices": [{"id": 90, "client_id": 9, "total": "42.00"}],
            "legacy_notes": [{"id": 1}]
        }
    });
    let report = svc
        .restore_upload("T1", Some("ops"), &serde_json::to_vec(&payload).unwrap())
        .await
        .unwrap();

    assert!(report.warnings.iter().any(|w| w.starts_with("legacy_notes")));
    let after = SnapshotBuilder::new(&catalog, &store).build("T1").await.snapshot;
    assert_eq!(after.rows("clients").len(), 1);
    assert_eq!(after.rows("invoices").len(), 1);
    assert!(after.rows("employees").is_empty());
    // The mislabelled rows hang off T2's client and survive.
    assert_eq!(
        store
            .rows("invoices")
            .iter()
            .filter(|r| r["client_id"] == json!(4))
            .count(),
        2
    );
}

#[tokio::test]
async fn backup_and_restore_are_certified_in_the_chain() {
    let catalog = catalog();
    let store = empty_store(&catalog);
    seed_scenario(&store);
    let svc = service(catalog.clone(), &store, BackupSettings::default());

    svc.backup("T1", Some("admin")).await.unwrap();
    svc.restore_latest("T1", Some("admin")).await.unwrap();

    let events = svc.export_audit("T1", &AuditFilter::all()).await.unwrap();
    let types: Vec<&str> = events.iter().map(|e| e.event_type.as_str()).collect();
    assert_eq!(
        types,
        [event_types::SNAPSHOT_CREATED, event_types::RESTORE_COMPLETED]
    );
    assert_eq!(events[0].actor_id.as_deref(), Some("admin"));
    assert!(svc.verify_audit("T1").await.unwrap().is_intact());

    let text = svc.export_audit_text("T1", &AuditFilter::all()).await.unwrap();
    assert!(text.contains("events: 2"));
    assert!(text.contains(&events[1].current_hash));
}

#[tokio::test]
async fn audit_outage_never_blocks_backup() {
    let catalog = catalog();
    let store = empty_store(&catalog);
    seed_scenario(&store);
    let svc = service(catalog.clone(), &store, BackupSettings::default());

    store.fail_audit_appends(true);
    svc.backup("T1", None).await.unwrap();
    store.clear_failures();
    assert!(svc
        .export_audit("T1", &AuditFilter::all())
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn read_failure_still_archives_with_warning() {
    let catalog = catalog();
    let store = empty_store(&catalog);
    seed_scenario(&store);
    store.fail_reads_on("payments");
    let svc = service(catalog.clone(), &store, BackupSettings::default());

    let outcome = svc.backup("T1", None).await.unwrap();
    assert_eq!(outcome.warnings.len(), 1);
    assert_eq!(outcome.warnings[0].entity, "payments");
    assert_eq!(outcome.row_counts["clients"], 3);
    assert_eq!(outcome.archived.latest_key, None);
    assert_eq!(svc.list_snapshots("T1").await.unwrap().len(), 1);

    let events = svc.export_audit("T1", &AuditFilter::all()).await.unwrap();
    assert_eq!(events[0].metadata["partial"], json!(true));
}

#[tokio::test]
async fn partial_snapshot_never_replaces_latest() {
    let catalog = catalog();
    let store = empty_store(&catalog);
    seed_scenario(&store);
    let svc = service(catalog.clone(), &store, BackupSettings::default());

    let complete = svc.backup("T1", None).await.unwrap();
    assert!(complete.archived.latest_key.is_some());

    store.fail_reads_on("payments");
    let partial = svc.backup("T1", None).await.unwrap();
    assert_eq!(partial.warnings.len(), 1);
    assert_eq!(partial.archived.latest_key, None);
    store.clear_failures();

    // Restoring latest must not wipe the payments the partial run skipped.
    svc.restore_latest("T1", None).await.unwrap();
    assert_eq!(store.rows("payments").len(), 1);
    let after = SnapshotBuilder::new(&catalog, &store).build("T1").await.snapshot;
    assert_eq!(after.content_digest(), complete.archived.digest);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn snapshot_waits_for_in_flight_restore() {
    let catalog = catalog();
    let store = empty_store(&catalog);
    seed_scenario(&store);
    let svc = Arc::new(service(catalog.clone(), &store, BackupSettings::default()));
    let restored = svc.backup("T1", None).await.unwrap();
    store.seed("clients", vec![json!({"id": 8, "tenant_id": "T1", "name": "Later"})]);

    let pause = store.pause_next_insert();
    let restore = svc.spawn_restore_latest("T1".into(), None);
    pause.reached.notified().await;

    let reads_before = store.select_calls("clients");
    let mut backup = svc.spawn_backup("T1".into(), None);
    assert!(tokio::time::timeout(Duration::from_millis(100), &mut backup)
        .await
        .is_err());
    assert_eq!(store.select_calls("clients"), reads_before);

    pause.release.notify_one();
    restore.await.unwrap().unwrap();
    let outcome = backup.await.unwrap().unwrap();

    // Sees the restored state, never the half-deleted one or the pre-restore write.
    assert_eq!(outcome.archived.digest, restored.archived.digest);
    assert_eq!(outcome.row_counts["clients"], 3);
}

#[tokio::test]
async fn snapshot_timeout_is_retryable_and_archives_nothing() {
    let catalog = catalog();
    let store = empty_store(&catalog);
    seed_scenario(&store);
    let settings = BackupSettings {
        snapshot_timeout: Duration::from_millis(50),
        ..Default::default()
    };
    let svc = service(catalog.clone(), &store, settings);

    let _pause = store.pause_next_select();
    let err = svc.backup("T1", None).await.unwrap_err();
    assert!(matches!(err, VaultError::TimedOut { retryable: true, .. }));
    assert!(err.is_retryable());
    assert!(svc.list_snapshots("T1").await.unwrap().is_empty());
    assert!(svc
        .export_audit("T1", &AuditFilter::all())
        .await
        .unwrap()
        .is_empty());

    // The pause was consumed; a retry goes through.
    svc.backup("T1", None).await.unwrap();
    assert_eq!(svc.list_snapshots("T1").await.unwrap().len(), 1);
}

#[tokio::test]
async fn path_like_tenant_ids_are_refused() {
    let catalog = catalog();
    let store = empty_store(&catalog);
    let svc = service(catalog.clone(), &store, BackupSettings::default());
    let err = svc.backup("../T1", None).await.unwrap_err();
    assert!(matches!(err, VaultError::Validation(_)));
}
