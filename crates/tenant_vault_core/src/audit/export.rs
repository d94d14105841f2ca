use std::fmt::Write;

use chrono::SecondsFormat;

use super::{AuditEvent, AuditFilter};

/// Flattened plain-text dump of a tenant's events for regulatory submission.
/// Derived from the same stored events as the structured list.
pub fn export_text(tenant_id: &str, filter: &AuditFilter, events: &[AuditEvent]) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "AUDIT LOG EXPORT");
    let _ = writeln!(out, "tenant: {tenant_id}");
    let _ = writeln!(
        out,
        "range: {} .. {}",
        filter
            .from
            .map(|t| t.to_rfc3339_opts(SecondsFormat::Secs, true))
            .unwrap_or_else(|| "*".into()),
        filter
            .to
            .map(|t| t.to_rfc3339_opts(SecondsFormat::Secs, true))
            .unwrap_or_else(|| "*".into()),
    );
    if !filter.event_types.is_empty() {
        let _ = writeln!(out, "event types: {}", filter.event_types.join(", "));
    }
    let _ = writeln!(out, "events: {}", events.len());

    for (n, e) in events.iter().enumerate() {
        let _ = writeln!(out);
        let _ = writeln!(out, "#{} {}", n + 1, e.id);
        let _ = writeln!(
            out,
            "  occurred_at:   {}",
            e.occurred_at.to_rfc3339_opts(SecondsFormat::Micros, true)
        );
        let _ = writeln!(out, "  event_type:    {}", e.event_type);
        let _ = writeln!(out, "  actor:         {}", e.actor_id.as_deref().unwrap_or("-"));
        let _ = writeln!(out, "  description:   {}", single_line(&e.description));
        let _ = writeln!(out, "  previous_hash: {}", or_genesis(&e.previous_hash));
        let _ = writeln!(out, "  current_hash:  {}", e.current_hash);
        if !e.metadata.is_null() {
            let _ = writeln!(out, "  metadata:      {}", e.metadata);
        }
    }
    out
}

fn single_line(s: &str) -> String {
    s.replace(['\r', '\n'], " ")
}

fn or_genesis(hash: &str) -> &str {
    if hash.is_empty() {
        "(genesis)"
    } else {
        hash
    }
}
