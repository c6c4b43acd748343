//! Audit Coverage
//!
//! Producer-side helpers for the rule that every sensitive operation
//! records exactly one audit event, including failures and denials, and
//! does not complete if that event cannot be recorded.

use async_trait::async_trait;
use glob::Pattern;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use thiserror::Error;
use tracing::{debug, error};

use crate::error::{LedgerError, LedgerResult};
use crate::ledger::event::{AuditEvent, NewAuditEvent, Outcome, TenantKey};
use crate::ledger::Ledger;
use crate::store::LedgerStore;

/// Path prefixes of routes that read or change clinical data.
pub const CLINICAL_ROUTE_PATTERNS: &[&str] = &[
    "/patients*",
    "/documents*",
    "/chr*",
    "/fhir*",
    "/api/gap*",
    "/jobs*",
];

/// Calls that count as recording an audit event.
pub const AUDIT_MARKERS: &[&str] = &["append", "append_with_retry", "record", "run_audited", "record_denial"];

const AUDITED_METHODS: &[&str] = &["GET", "POST", "PUT", "PATCH", "DELETE"];

/// Anything that can durably record an audit event.
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn record(&self, event: NewAuditEvent) -> LedgerResult<AuditEvent>;
}

#[async_trait]
impl<S: LedgerStore> AuditSink for Ledger<S> {
    async fn record(&self, event: NewAuditEvent) -> LedgerResult<AuditEvent> {
        self.append_with_retry(event).await
    }
}

#[derive(Debug, Error)]
pub enum AuditedError<E> {
    #[error("{0}")]
    Operation(E),

    /// The audit event could not be recorded, so the result was withheld.
    #[error("audit could not be recorded: {0}")]
    Audit(LedgerError),
}

/// Run `op` and record its outcome. Fails closed: when the audit event
/// cannot be appended the caller gets `AuditedError::Audit`, never the
/// operation's result.
pub async fn run_audited<K, F, Fut, T, E>(
    sink: &K,
    event: NewAuditEvent,
    op: F,
) -> Result<T, AuditedError<E>>
where
    K: AuditSink + ?Sized,
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: fmt::Display,
{
    let result = op().await;

    let event = match &result {
        Ok(_) => event.outcome(Outcome::Success),
        Err(e) => event.outcome(Outcome::Failure).detail("error", e.to_string()),
    };
    let action = event.action.clone();

    if let Err(err) = sink.record(event).await {
        error!(action = %action, error = %err, "audit append failed, withholding result");
        return Err(AuditedError::Audit(err));
    }

    result.map_err(AuditedError::Operation)
}

/// Record that an action was refused before it ran.
pub async fn record_denial<K>(sink: &K, event: NewAuditEvent, reason: &str) -> LedgerResult<AuditEvent>
where
    K: AuditSink + ?Sized,
{
    sink.record(event.outcome(Outcome::Denied).detail("reason", reason))
        .await
}

/// One entry of an application's route table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteSpec {
    pub method: String,
    pub path: String,
    /// Audit calls the handler makes.
    pub audit_markers: Vec<String>,
}

impl RouteSpec {
    pub fn new(method: &str, path: &str, audit_markers: &[&str]) -> Self {
        Self {
            method: method.to_uppercase(),
            path: path.to_string(),
            audit_markers: audit_markers.iter().map(|m| m.to_string()).collect(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CoverageReport {
    pub sensitive_routes: usize,
    /// `METHOD path` of sensitive routes with no audit marker.
    pub missing: Vec<String>,
}

impl CoverageReport {
    pub fn is_complete(&self) -> bool {
        self.missing.is_empty()
    }
}

/// Which routes must audit, and what counts as auditing.
#[derive(Debug, Clone)]
pub struct CoveragePolicy {
    sensitive: Vec<Pattern>,
    markers: BTreeSet<String>,
}

impl CoveragePolicy {
    pub fn new(patterns: &[&str], markers: &[&str]) -> LedgerResult<Self> {
        let sensitive = patterns
            .iter()
            .map(|p| {
                Pattern::new(p)
                    .map_err(|e| LedgerError::Config(format!("invalid route pattern {}: {}", p, e)))
            })
            .collect::<LedgerResult<Vec<_>>>()?;
        Ok(Self {
            sensitive,
            markers: markers.iter().map(|m| m.to_string()).collect(),
        })
    }

    pub fn clinical() -> LedgerResult<Self> {
        Self::new(CLINICAL_ROUTE_PATTERNS, AUDIT_MARKERS)
    }

    pub fn is_sensitive(&self, route: &RouteSpec) -> bool {
        AUDITED_METHODS.contains(&route.method.as_str())
            && self.sensitive.iter().any(|p| p.matches(&route.path))
    }

    pub fn check(&self, routes: &[RouteSpec]) -> CoverageReport {
        let mut report = CoverageReport::default();
        for route in routes.iter().filter(|r| self.is_sensitive(r)) {
            report.sensitive_routes += 1;
            if !route.audit_markers.iter().any(|m| self.markers.contains(m)) {
                report.missing.push(format!("{} {}", route.method, route.path));
            }
        }
        report
    }
}

/// Sink that keeps what it was given, for producer conformance tests.
#[derive(Clone, Default)]
pub struct RecordingSink {
    events: Arc<Mutex<Vec<AuditEvent>>>,
    failing: bool,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// A sink whose every append fails.
    pub fn failing() -> Self {
        Self {
            events: Arc::default(),
            failing: true,
        }
    }

    /// Everything recorded so far. A panic elsewhere while the lock was
    /// held does not hide events already recorded.
    pub fn events(&self) -> Vec<AuditEvent> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn counts_by_request(&self) -> HashMap<String, usize> {
        let mut counts = HashMap::new();
        for event in self.events() {
            if let Some(request_id) = event.request_id {
                *counts.entry(request_id).or_insert(0) += 1;
            }
        }
        counts
    }
}

#[async_trait]
impl AuditSink for RecordingSink {
    async fn record(&self, event: NewAuditEvent) -> LedgerResult<AuditEvent> {
        if self.failing {
            return Err(LedgerError::Database("recording sink is failing".to_string()));
        }
        event.validate()?;
        let partition = TenantKey::resolve(event.tenant_id.as_deref())?;

        let mut events = self
            .events
            .lock()
            .map_err(|_| LedgerError::Database("recording sink poisoned".to_string()))?;
        let prev = events
            .iter()
            .rev()
            .find(|e| e.tenant_key == partition)
            .map(|e| (e.seq, e.event_hash.clone()))
            .unwrap_or((0, String::new()));
        let sealed = event.seal(partition, prev.0 + 1, &prev.1);
        debug!(event_id = %sealed.id, action = %sealed.action, "audit event recorded");
        events.push(sealed.clone());
        Ok(sealed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LedgerConfig;
    use crate::ledger::event::AuditAction;
    use crate::store::MemoryLedgerStore;

    #[tokio::test]
    async fn test_success_is_recorded_once() {
        let sink = RecordingSink::new();
        let value = run_audited(
            &sink,
            NewAuditEvent::new(AuditAction::PatientView, "patient").request_id("req-1"),
            || async { Ok::<_, String>(42) },
        )
        .await
        .unwrap();

        assert_eq!(value, 42);
        assert_eq!(sink.counts_by_request().get("req-1"), Some(&1));
        assert_eq!(sink.events()[0].outcome, "SUCCESS");
    }

    #[tokio::test]
    async fn test_failure_is_recorded_with_error() {
        let sink = RecordingSink::new();
        let err = run_audited(
            &sink,
            NewAuditEvent::new(AuditAction::DocumentUpload, "document"),
            || async { Err::<(), _>("storage full") },
        )
        .await
        .unwrap_err();

        assert!(matches!(err, AuditedError::Operation("storage full")));
        let events = sink.events();
        assert_eq!(events[0].outcome, "FAILURE");
        assert_eq!(events[0].details["error"], "storage full");
    }

    #[tokio::test]
    async fn test_unrecordable_audit_fails_closed() {
        let sink = RecordingSink::failing();
        let err = run_audited(
            &sink,
            NewAuditEvent::new(AuditAction::PhiEgress, "chr"),
            || async { Ok::<_, String>("payload") },
        )
        .await
        .unwrap_err();
        assert!(matches!(err, AuditedError::Audit(_)));
    }

    #[tokio::test]
    async fn test_unknown_tenant_fails_closed() {
        let ledger = Ledger::new(MemoryLedgerStore::new(), LedgerConfig::default());
        let err = run_audited(
            &ledger,
            NewAuditEvent::new(AuditAction::ChrExport, "chr").tenant("clinic-7"),
            || async { Ok::<_, String>(()) },
        )
        .await
        .unwrap_err();
        assert!(matches!(err, AuditedError::Audit(LedgerError::UnknownPartition(_))));
    }

    #[tokio::test]
    async fn test_denial_is_recorded() {
        let sink = RecordingSink::new();
        record_denial(
            &sink,
            NewAuditEvent::new(AuditAction::PatientView, "patient").actor_id("u-9"),
            "role lacks patient:read",
        )
        .await
        .unwrap();

        let events = sink.events();
        assert_eq!(events[0].outcome, "DENIED");
        assert_eq!(events[0].details["reason"], "role lacks patient:read");
    }

    #[tokio::test]
    async fn test_events_survive_a_poisoned_lock() {
        let sink = RecordingSink::new();
        sink.record(NewAuditEvent::new(AuditAction::PatientView, "patient").request_id("req-7"))
            .await
            .unwrap();

        let events = sink.events.clone();
        let _ = std::thread::spawn(move || {
            let _guard = events.lock().unwrap();
            panic!("producer crashed while holding the sink");
        })
        .join();
        assert!(sink.events.is_poisoned());

        assert_eq!(sink.events().len(), 1);
        assert_eq!(sink.counts_by_request().get("req-7"), Some(&1));
    }

    #[test]
    fn test_policy_flags_unaudited_sensitive_routes() {
        let policy = CoveragePolicy::clinical().unwrap();
        let routes = vec![
            RouteSpec::new("GET", "/patients/{id}", &["run_audited"]),
            RouteSpec::new("POST", "/documents", &[]),
            RouteSpec::new("DELETE", "/chr/{id}", &["append"]),
            RouteSpec::new("GET", "/health", &[]),
            RouteSpec::new("OPTIONS", "/patients", &[]),
        ];

        let report = policy.check(&routes);
        assert_eq!(report.sensitive_routes, 3);
        assert_eq!(report.missing, vec!["POST /documents".to_string()]);
        assert!(!report.is_complete());
    }

    #[test]
    fn test_invalid_pattern_is_config_error() {
        let err = CoveragePolicy::new(&["/patients[*"], AUDIT_MARKERS).unwrap_err();
        assert!(matches!(err, LedgerError::Config(_)));
    }
}
