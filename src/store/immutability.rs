//! Immutability Enforcement
//!
//! Audit events are protected inside the store itself: the migrations
//! install triggers that abort every UPDATE, DELETE and TRUNCATE against
//! `audit_events`, whichever credential issues it. This module names
//! those triggers, checks they are present, and turns the errors they
//! raise into `LedgerError::ImmutableLedgerViolation`.

use tracing::{error, warn};

use crate::error::LedgerError;

/// Prefix of every message raised by the immutability triggers.
pub const VIOLATION_MARKER: &str = "ImmutableLedgerViolation";

/// Triggers the Postgres migration installs.
pub const POSTGRES_TRIGGERS: &[(&str, &str)] = &[
    ("audit_events", "audit_events_immutable_rows"),
    ("audit_events", "audit_events_immutable_truncate"),
    ("audit_chain_state", "audit_chain_state_no_delete"),
];

/// Triggers the SQLite migration installs.
pub const SQLITE_TRIGGERS: &[&str] = &[
    "audit_events_no_update",
    "audit_events_no_delete",
    "audit_chain_state_no_delete",
];

/// Postgres `lock_not_available`, raised when `lock_timeout` expires.
const PG_LOCK_NOT_AVAILABLE: &str = "55P03";

/// SQLite BUSY, LOCKED and their extended codes.
const SQLITE_BUSY_CODES: &[&str] = &["5", "6", "261", "262", "517"];

/// Map a store error onto the ledger's error kinds.
pub fn classify(err: sqlx::Error) -> LedgerError {
    if let sqlx::Error::Database(db_err) = &err {
        let message = db_err.message();
        if message.contains(VIOLATION_MARKER) {
            warn!(reason = %message, "rejected mutation of audit history");
            return LedgerError::ImmutableLedgerViolation(message.to_string());
        }

        let code = db_err.code();
        let code = code.as_deref().unwrap_or_default();
        if code == PG_LOCK_NOT_AVAILABLE
            || SQLITE_BUSY_CODES.contains(&code)
            || message.contains("database is locked")
        {
            return LedgerError::LockTimeout(message.to_string());
        }
    }

    if matches!(err, sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_)) {
        return LedgerError::Serialization(err.to_string());
    }

    LedgerError::Database(err.to_string())
}

/// Compare the triggers found in the store against the expected set.
pub fn check_installed(found: &[String], expected: &[&str]) -> Result<(), LedgerError> {
    let missing: Vec<&str> = expected
        .iter()
        .copied()
        .filter(|name| !found.iter().any(|f| f == name))
        .collect();

    if missing.is_empty() {
        Ok(())
    } else {
        error!(missing = ?missing, "immutability triggers are not installed");
        Err(LedgerError::EnforcementMissing(format!(
            "missing triggers: {}",
            missing.join(", ")
        )))
    }
}
