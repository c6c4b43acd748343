//! Audit Events
//!
//! Defines the immutable audit event, the partition key it is chained
//! under, and the per-partition chain state.

use chrono::{DateTime, Timelike, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::{LedgerError, LedgerResult};
use crate::ledger::hasher::{self, FIELD_SEPARATOR};

/// Structured event payload. Canonicalized before hashing.
pub type Details = serde_json::Map<String, Value>;

/// Chain partition key: a tenant UUID or the system sentinel.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TenantKey(String);

impl TenantKey {
    /// Partition used for events that belong to no tenant.
    pub const SYSTEM: &'static str = "00000000-0000-0000-0000-000000000000";

    pub fn system() -> Self {
        Self(Self::SYSTEM.to_string())
    }

    /// Resolve a caller-supplied tenant id into a partition key.
    ///
    /// Absent or blank ids map to the system partition. Anything else must
    /// be a UUID and is normalized to its lowercase hyphenated form.
    pub fn resolve(tenant_id: Option<&str>) -> LedgerResult<Self> {
        let raw = match tenant_id.map(str::trim) {
            None | Some("") => return Ok(Self::system()),
            Some(raw) => raw,
        };

        Uuid::parse_str(raw)
            .map(|id| Self(id.hyphenated().to_string()))
            .map_err(|_| LedgerError::unknown_partition(raw))
    }

    /// Wrap a key read back from the store.
    pub(crate) fn from_stored(raw: String) -> Self {
        Self(raw)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_system(&self) -> bool {
        self.0 == Self::SYSTEM
    }
}

impl fmt::Display for TenantKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for TenantKey {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::resolve(Some(s))
    }
}

/// Result of the audited action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Outcome {
    Success,
    Failure,
    Denied,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Success => "SUCCESS",
            Outcome::Failure => "FAILURE",
            Outcome::Denied => "DENIED",
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<Outcome> for String {
    fn from(outcome: Outcome) -> Self {
        outcome.as_str().to_string()
    }
}

/// Action names used by the application's audited code paths.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AuditAction {
    LoginSuccess,
    LoginFailed,
    Logout,
    MfaEnabled,
    MfaDisabled,
    PatientView,
    PatientCreate,
    PatientUpdate,
    PatientDelete,
    DocumentUpload,
    DocumentView,
    DocumentDelete,
    ExtractionRun,
    ChrGenerate,
    ChrView,
    ChrSign,
    ChrAmend,
    ChrExport,
    UserCreate,
    UserUpdate,
    RoleChange,
    ExportBulk,
    PhiEgress,
}

impl AuditAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditAction::LoginSuccess => "login.success",
            AuditAction::LoginFailed => "login.failed",
            AuditAction::Logout => "logout",
            AuditAction::MfaEnabled => "mfa.enabled",
            AuditAction::MfaDisabled => "mfa.disabled",
            AuditAction::PatientView => "patient.view",
            AuditAction::PatientCreate => "patient.create",
            AuditAction::PatientUpdate => "patient.update",
            AuditAction::PatientDelete => "patient.delete",
            AuditAction::DocumentUpload => "document.upload",
            AuditAction::DocumentView => "document.view",
            AuditAction::DocumentDelete => "document.delete",
            AuditAction::ExtractionRun => "extraction.run",
            AuditAction::ChrGenerate => "chr.generate",
            AuditAction::ChrView => "chr.view",
            AuditAction::ChrSign => "chr.sign",
            AuditAction::ChrAmend => "chr.amend",
            AuditAction::ChrExport => "chr.export",
            AuditAction::UserCreate => "user.create",
            AuditAction::UserUpdate => "user.update",
            AuditAction::RoleChange => "role.change",
            AuditAction::ExportBulk => "export.bulk",
            AuditAction::PhiEgress => "phi.egress",
        }
    }
}

impl fmt::Display for AuditAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<AuditAction> for String {
    fn from(action: AuditAction) -> Self {
        action.as_str().to_string()
    }
}

/// Drop sub-microsecond precision so the time survives a store round trip.
pub fn truncate_to_micros(time: DateTime<Utc>) -> DateTime<Utc> {
    let nanos = time.nanosecond();
    time.with_nanosecond(nanos - nanos % 1_000).unwrap_or(time)
}

/// An audit event as produced by application code, before it is chained.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewAuditEvent {
    pub id: Uuid,
    pub tenant_id: Option<String>,
    pub event_time: DateTime<Utc>,
    pub actor_id: Option<String>,
    pub actor_label: Option<String>,
    pub resource_type: String,
    pub resource_id: Option<String>,
    pub action: String,
    pub outcome: String,
    #[serde(default)]
    pub details: Details,
    pub request_id: Option<String>,
}

impl NewAuditEvent {
    /// Start a new event. The id and event time are captured here.
    pub fn new(action: impl Into<String>, resource_type: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            tenant_id: None,
            event_time: truncate_to_micros(Utc::now()),
            actor_id: None,
            actor_label: None,
            resource_type: resource_type.into(),
            resource_id: None,
            action: action.into(),
            outcome: Outcome::Success.into(),
            details: Details::new(),
            request_id: None,
        }
    }

    pub fn tenant(mut self, tenant_id: impl Into<String>) -> Self {
        self.tenant_id = Some(tenant_id.into());
        self
    }

    pub fn actor(mut self, actor_id: impl Into<String>, actor_label: impl Into<String>) -> Self {
        self.actor_id = Some(actor_id.into());
        self.actor_label = Some(actor_label.into());
        self
    }

    pub fn actor_id(mut self, actor_id: impl Into<String>) -> Self {
        self.actor_id = Some(actor_id.into());
        self
    }

    pub fn actor_label(mut self, actor_label: impl Into<String>) -> Self {
        self.actor_label = Some(actor_label.into());
        self
    }

    pub fn resource_id(mut self, resource_id: impl Into<String>) -> Self {
        self.resource_id = Some(resource_id.into());
        self
    }

    pub fn outcome(mut self, outcome: impl Into<String>) -> Self {
        self.outcome = outcome.into();
        self
    }

    pub fn detail(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.details.insert(key.into(), value.into());
        self
    }

    pub fn details(mut self, details: Details) -> Self {
        self.details = details;
        self
    }

    pub fn request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    pub fn event_time(mut self, event_time: DateTime<Utc>) -> Self {
        self.event_time = truncate_to_micros(event_time);
        self
    }

    pub fn id(mut self, id: Uuid) -> Self {
        self.id = id;
        self
    }

    /// Reject events the hasher cannot represent unambiguously.
    pub fn validate(&self) -> LedgerResult<()> {
        if self.action.trim().is_empty() {
            return Err(LedgerError::InvalidEvent("action must not be empty".into()));
        }
        if self.resource_type.trim().is_empty() {
            return Err(LedgerError::InvalidEvent(
                "resource_type must not be empty".into(),
            ));
        }
        if self.outcome.trim().is_empty() {
            return Err(LedgerError::InvalidEvent("outcome must not be empty".into()));
        }

        let fields = [
            ("tenant_id", self.tenant_id.as_deref()),
            ("actor_id", self.actor_id.as_deref()),
            ("actor_label", self.actor_label.as_deref()),
            ("resource_type", Some(self.resource_type.as_str())),
            ("resource_id", self.resource_id.as_deref()),
            ("action", Some(self.action.as_str())),
            ("outcome", Some(self.outcome.as_str())),
            ("request_id", self.request_id.as_deref()),
        ];
        for (name, value) in fields {
            if value.is_some_and(|v| v.contains(FIELD_SEPARATOR)) {
                return Err(LedgerError::InvalidEvent(format!(
                    "{} contains the reserved field separator",
                    name
                )));
            }
        }

        Ok(())
    }

    /// Bind this event to its partition and chain position.
    pub(crate) fn seal(self, tenant_key: TenantKey, seq: i64, prev_hash: &str) -> AuditEvent {
        let mut event = AuditEvent {
            id: self.id,
            tenant_key,
            seq,
            event_time: self.event_time,
            actor_id: self.actor_id,
            actor_label: self.actor_label,
            resource_type: self.resource_type,
            resource_id: self.resource_id,
            action: self.action,
            outcome: self.outcome,
            details: self.details,
            request_id: self.request_id,
            prev_hash: prev_hash.to_string(),
            event_hash: String::new(), // Will be calculated
        };

        event.event_hash = event.calculate_hash(prev_hash);
        event
    }
}

/// A chained audit event. Never updated or deleted once persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEvent {
    pub id: Uuid,
    pub tenant_key: TenantKey,
    /// Position in the partition's chain, starting at 1.
    pub seq: i64,
    pub event_time: DateTime<Utc>,
    pub actor_id: Option<String>,
    pub actor_label: Option<String>,
    pub resource_type: String,
    pub resource_id: Option<String>,
    pub action: String,
    pub outcome: String,
    #[serde(default)]
    pub details: Details,
    pub request_id: Option<String>,
    pub prev_hash: String,
    pub event_hash: String,
}

impl AuditEvent {
    /// Digest of this event's fields chained onto `prev_hash`.
    pub fn calculate_hash(&self, prev_hash: &str) -> String {
        hasher::hash_event(self, prev_hash)
    }

    /// Recompute from stored fields and stored `prev_hash`.
    pub fn verify_hash(&self) -> bool {
        self.event_hash == self.calculate_hash(&self.prev_hash)
    }

    pub fn summary(&self) -> String {
        format!(
            "{} #{} {} {}/{} ({})",
            self.tenant_key,
            self.seq,
            self.action,
            self.resource_type,
            self.resource_id.as_deref().unwrap_or("-"),
            self.outcome
        )
    }
}

/// Head pointer of one partition's chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainState {
    pub tenant_key: TenantKey,
    pub last_hash: String,
    pub last_event_id: Option<Uuid>,
    pub last_seq: i64,
    pub updated_at: DateTime<Utc>,
}

impl ChainState {
    pub fn empty(tenant_key: TenantKey) -> Self {
        Self {
            tenant_key,
            last_hash: String::new(),
            last_event_id: None,
            last_seq: 0,
            updated_at: Utc::now(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.last_hash.is_empty() && self.last_seq == 0
    }

    /// The state after `event` becomes the head.
    pub fn advanced_to(&self, event: &AuditEvent) -> Self {
        Self {
            tenant_key: self.tenant_key.clone(),
            last_hash: event.event_hash.clone(),
            last_event_id: Some(event.id),
            last_seq: event.seq,
            updated_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_tenant_resolution() {
        assert!(TenantKey::resolve(None).unwrap().is_system());
        assert!(TenantKey::resolve(Some("  ")).unwrap().is_system());

        let key = TenantKey::resolve(Some("6F9619FF-8B86-D011-B42D-00C04FC964FF")).unwrap();
        assert_eq!(key.as_str(), "6f9619ff-8b86-d011-b42d-00c04fc964ff");

        let err = TenantKey::resolve(Some("acme-clinic")).unwrap_err();
        assert!(matches!(err, LedgerError::UnknownPartition(_)));
    }

    #[test]
    fn test_system_sentinel_resolves_to_system() {
        let key: TenantKey = TenantKey::SYSTEM.parse().unwrap();
        assert!(key.is_system());
    }

    #[test]
    fn test_builder_defaults() {
        let event = NewAuditEvent::new(AuditAction::PatientView, "patient")
            .tenant("6f9619ff-8b86-d011-b42d-00c04fc964ff")
            .actor("u-1", "clinician@example.org")
            .resource_id("p-42")
            .detail("fields", 3);

        assert_eq!(event.action, "patient.view");
        assert_eq!(event.outcome, "SUCCESS");
        assert_eq!(event.details.get("fields"), Some(&Value::from(3)));
        assert_eq!(event.event_time.nanosecond() % 1_000, 0);
        assert!(event.validate().is_ok());
    }

    #[test]
    fn test_validation_rejects_separator_and_empty_fields() {
        let event = NewAuditEvent::new("", "patient");
        assert!(matches!(event.validate(), Err(LedgerError::InvalidEvent(_))));

        let event = NewAuditEvent::new("patient.view", "patient").actor_label("a\u{1f}b");
        let err = event.validate().unwrap_err();
        assert!(err.to_string().contains("actor_label"));
    }

    #[test]
    fn test_truncate_to_micros() {
        let time = Utc.timestamp_opt(1_700_000_000, 123_456_789).unwrap();
        assert_eq!(truncate_to_micros(time).nanosecond(), 123_456_000);
    }

    #[test]
    fn test_seal_links_to_prev_hash() {
        let key = TenantKey::system();
        let first = NewAuditEvent::new("chr.view", "chr").seal(key.clone(), 1, "");
        let second = NewAuditEvent::new("chr.sign", "chr").seal(key, 2, &first.event_hash);

        assert_eq!(first.prev_hash, "");
        assert_eq!(second.prev_hash, first.event_hash);
        assert!(first.verify_hash());
        assert!(second.verify_hash());
        assert_eq!(first.event_hash.len(), 64);
    }

    #[test]
    fn test_chain_state_advance() {
        let key = TenantKey::system();
        let state = ChainState::empty(key.clone());
        assert!(state.is_empty());

        let event = NewAuditEvent::new("logout", "session").seal(key, 1, "");
        let next = state.advanced_to(&event);
        assert_eq!(next.last_hash, event.event_hash);
        assert_eq!(next.last_event_id, Some(event.id));
        assert_eq!(next.last_seq, 1);
    }
}
