//! Event Hasher
//!
//! Deterministic SHA-256 digest over an event's canonical fields and the
//! previous chain head.
//!
//! Field order: tenant key, actor id, actor label, resource type,
//! resource id, action, outcome, canonical details, request id,
//! previous hash, event time. Fields are joined with `FIELD_SEPARATOR`
//! and missing fields are rendered as the empty string.

use chrono::{DateTime, Utc};
use serde_json::{Number, Value};
use sha2::{Digest, Sha256};

use crate::ledger::event::{AuditEvent, Details};

/// ASCII unit separator. Rejected in event fields, escaped inside JSON.
pub const FIELD_SEPARATOR: char = '\u{1f}';

/// Largest integer an f64 holds exactly.
const MAX_EXACT_F64: f64 = 9_007_199_254_740_992.0;

/// Canonical event time: UTC, microsecond precision, `Z` suffix.
pub fn canonical_time(time: &DateTime<Utc>) -> String {
    time.format("%Y-%m-%dT%H:%M:%S%.6fZ").to_string()
}

/// Canonical JSON rendering of the details payload.
pub fn canonical_details(details: &Details) -> String {
    let mut out = String::new();
    write_object(details, &mut out);
    out
}

/// Canonical JSON rendering of any value.
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_value(value, &mut out);
    out
}

fn write_value(value: &Value, out: &mut String) {
    match value {
        Value::Null => out.push_str("null"),
        Value::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
        Value::Number(n) => out.push_str(&canonical_number(n)),
        Value::String(s) => write_string(s, out),
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_value(item, out);
            }
            out.push(']');
        }
        Value::Object(map) => write_object(map, out),
    }
}

fn write_object(map: &Details, out: &mut String) {
    let mut keys: Vec<&String> = map.keys().collect();
    keys.sort(); // bytewise, independent of map implementation

    out.push('{');
    for (i, key) in keys.iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        write_string(key, out);
        out.push(':');
        write_value(&map[key.as_str()], out);
    }
    out.push('}');
}

fn write_string(s: &str, out: &mut String) {
    // serde_json escapes control characters, so the separator never leaks
    match serde_json::to_string(s) {
        Ok(quoted) => out.push_str(&quoted),
        Err(_) => out.push_str("\"\""),
    }
}

fn canonical_number(n: &Number) -> String {
    if let Some(i) = n.as_i64() {
        return i.to_string();
    }
    if let Some(u) = n.as_u64() {
        return u.to_string();
    }
    match n.as_f64() {
        Some(f) if f.is_finite() && f.fract() == 0.0 && f.abs() <= MAX_EXACT_F64 => {
            (f as i64).to_string()
        }
        _ => n.to_string(),
    }
}

/// Create canonical string representation for hashing
pub fn canonical_string(event: &AuditEvent, prev_hash: &str) -> String {
    let sep = FIELD_SEPARATOR.to_string();
    let fields = [
        event.tenant_key.as_str(),
        event.actor_id.as_deref().unwrap_or(""),
        event.actor_label.as_deref().unwrap_or(""),
        event.resource_type.as_str(),
        event.resource_id.as_deref().unwrap_or(""),
        event.action.as_str(),
        event.outcome.as_str(),
        &canonical_details(&event.details),
        event.request_id.as_deref().unwrap_or(""),
        prev_hash,
        &canonical_time(&event.event_time),
    ];
    fields.join(&sep)
}

/// Calculate the SHA-256 digest of an event chained onto `prev_hash`
pub fn hash_event(event: &AuditEvent, prev_hash: &str) -> String {
    let canonical = canonical_string(event, prev_hash);
    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    hex::encode(hasher.finalize())
}
