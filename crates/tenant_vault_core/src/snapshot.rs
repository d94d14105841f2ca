//! Snapshot data model and upload validation.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::error::ValidationError;

/// Current on-disk snapshot format.
pub const SNAPSHOT_SCHEMA_VERSION: u32 = 1;

/// Opaque column -> value map. `BTreeMap` keeps serialization order stable.
pub type RowRecord = BTreeMap<String, Value>;

/// Point-in-time export of every catalog entity for one tenant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub tenant_id: String,
    pub created_at: DateTime<Utc>,
    pub schema_version: u32,
    pub tables: BTreeMap<String, Vec<RowRecord>>,
}

impl Snapshot {
    pub fn new(tenant_id: &str) -> Self {
        Self {
            tenant_id: tenant_id.to_string(),
            created_at: Utc::now(),
            schema_version: SNAPSHOT_SCHEMA_VERSION,
            tables: BTreeMap::new(),
        }
    }

    pub fn rows(&self, entity: &str) -> &[RowRecord] {
        self.tables.get(entity).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn row_counts(&self) -> BTreeMap<String, usize> {
        self.tables
            .iter()
            .map(|(name, rows)| (name.clone(), rows.len()))
            .collect()
    }

    pub fn total_rows(&self) -> usize {
        self.tables.values().map(Vec::len).sum()
    }

    /// SHA-256 over the canonical `tables` map. Ignores `created_at`, so two
    /// snapshots of identical data have the same digest.
    pub fn content_digest(&self) -> String {
        // String-keyed maps of JSON values always serialize.
        let bytes = serde_json::to_vec(&self.tables).unwrap_or_default();
        hex::encode(Sha256::digest(&bytes))
    }

    pub fn to_json_bytes(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }

    pub fn from_json_bytes(bytes: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(bytes)
    }

    /// Shape-check a caller-uploaded payload destined for `tenant_id`.
    ///
    /// Only `tables` is mandatory. A payload naming another tenant, or written
    /// by a newer format, is rejected.
    pub fn from_upload(tenant_id: &str, bytes: &[u8]) -> Result<Self, ValidationError> {
        let value: Value = serde_json::from_slice(bytes)
            .map_err(|e| ValidationError::MalformedJson(e.to_string()))?;
        let Value::Object(mut root) = value else {
            return Err(ValidationError::NotAnObject);
        };

        if let Some(found) = root.get("tenant_id").and_then(Value::as_str) {
            if found != tenant_id {
                return Err(ValidationError::TenantMismatch {
                    expected: tenant_id.to_string(),
                    found: found.to_string(),
                });
            }
        }

        let schema_version = match root.get("schema_version").and_then(Value::as_u64) {
            Some(v) if v > u64::from(SNAPSHOT_SCHEMA_VERSION) => {
                return Err(ValidationError::UnsupportedSchemaVersion {
                    found: u32::try_from(v).unwrap_or(u32::MAX),
                    supported: SNAPSHOT_SCHEMA_VERSION,
                })
            }
            Some(v) => v as u32,
            None => SNAPSHOT_SCHEMA_VERSION,
        };

        let created_at = root
            .get("created_at")
            .and_then(Value::as_str)
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(Utc::now);

        let Some(Value::Object(raw_tables)) = root.remove("tables") else {
            return Err(ValidationError::MissingTables);
        };

        let mut tables = BTreeMap::new();
        for (name, table) in raw_tables {
            let Value::Array(raw_rows) = table else {
                return Err(ValidationError::BadTable(name));
            };
            let mut rows = Vec::with_capacity(raw_rows.len());
            for row in raw_rows {
                let Value::Object(columns) = row else {
                    return Err(ValidationError::BadTable(name));
                };
                rows.push(columns.into_iter().collect::<RowRecord>());
            }
            tables.insert(name, rows);
        }

        Ok(Self {
            tenant_id: tenant_id.to_string(),
            created_at,
            schema_version,
            tables,
        })
    }
}

/// Text form of a key value, as compared by adapters (`column::text`).
/// Null and structured values have no key form.
pub fn key_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Null | Value::Array(_) | Value::Object(_) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn digest_ignores_created_at() {
        let mut a = Snapshot::new("t1");
        a.tables
            .insert("clients".into(), vec![RowRecord::from([("id".into(), json!(1))])]);
        let mut b = a.clone();
        b.created_at = a.created_at + chrono::Duration::hours(1);
        assert_eq!(a.content_digest(), b.content_digest());
        assert_eq!(a.content_digest().len(), 64);
    }

    #[test]
    fn upload_requires_tables_map() {
        let err = Snapshot::from_upload("t1", br#"{"tenant_id":"t1"}"#).unwrap_err();
        assert_eq!(err, ValidationError::MissingTables);

        let err = Snapshot::from_upload("t1", br#"{"tables": []}"#).unwrap_err();
        assert_eq!(err, ValidationError::MissingTables);

        let err = Snapshot::from_upload("t1", b"[1,2]").unwrap_err();
        assert_eq!(err, ValidationError::NotAnObject);

        let err = Snapshot::from_upload("t1", b"{not json").unwrap_err();
        assert!(matches!(err, ValidationError::MalformedJson(_)));
    }

    #[test]
    fn upload_rejects_bad_rows() {
        let err = Snapshot::from_upload("t1", br#"{"tables": {"clients": [1]}}"#).unwrap_err();
        assert_eq!(err, ValidationError::BadTable("clients".into()));

        let err = Snapshot::from_upload("t1", br#"{"tables": {"clients": {}}}"#).unwrap_err();
        assert_eq!(err, ValidationError::BadTable("clients".into()));
    }

    #[test]
    fn upload_rejects_foreign_tenant_and_future_format() {
        let err =
            Snapshot::from_upload("t1", br#"{"tenant_id":"t2","tables":{}}"#).unwrap_err();
        assert!(matches!(err, ValidationError::TenantMismatch { .. }));

        let err =
            Snapshot::from_upload("t1", br#"{"schema_version":99,"tables":{}}"#).unwrap_err();
        assert!(matches!(
            err,
            ValidationError::UnsupportedSchemaVersion { found: 99, .. }
        ));
    }

    #[test]
    fn minimal_upload_is_accepted() {
        let snap = Snapshot::from_upload(
            "t1",
            br#"{"tables":{"clients":[{"id":1,"tenant_id":"t1"}]}}"#,
        )
        .unwrap();
        assert_eq!(snap.tenant_id, "t1");
        assert_eq!(snap.schema_version, SNAPSHOT_SCHEMA_VERSION);
        assert_eq!(snap.rows("clients").len(), 1);
        assert!(snap.rows("invoices").is_empty());
    }

    #[test]
    fn archived_form_reloads() {
        let mut snap = Snapshot::new("t1");
        snap.tables.insert(
            "clients".into(),
            vec![RowRecord::from([("id".into(), json!("c-1"))])],
        );
        let bytes = snap.to_json_bytes().unwrap();
        assert_eq!(Snapshot::from_json_bytes(&bytes).unwrap(), snap);
        assert_eq!(Snapshot::from_upload("t1", &bytes).unwrap(), snap);
    }

    #[test]
    fn wide_numbers_keep_their_digits() {
        let payload = br#"{"tables": {"invoices": [
            {"id": 90071992547409931, "total": 12345678901234567.89, "rate": 0.1000}
        ]}}"#;
        let snap = Snapshot::from_upload("t1", payload).unwrap();
        let row = &snap.rows("invoices")[0];
        assert_eq!(key_text(&row["id"]).as_deref(), Some("90071992547409931"));

        let text = String::from_utf8(snap.to_json_bytes().unwrap()).unwrap();
        assert!(text.contains("12345678901234567.89"), "{text}");
        assert!(text.contains("0.1000"), "{text}");
        assert!(text.contains("90071992547409931"), "{text}");
        assert_eq!(Snapshot::from_json_bytes(text.as_bytes()).unwrap(), snap);
    }

    #[test]
    fn key_text_forms() {
        assert_eq!(key_text(&json!(42)), Some("42".into()));
        assert_eq!(key_text(&json!("abc")), Some("abc".into()));
        assert_eq!(key_text(&json!(null)), None);
        assert_eq!(key_text(&json!({"a": 1})), None);
    }
}
