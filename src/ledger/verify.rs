//! Chain Verification
//!
//! Replays each partition's chain from its first event and reports where,
//! if anywhere, the stored history stops matching its digests. Findings
//! are data, not errors; only infrastructure failures return `Err`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::{LedgerError, LedgerResult};
use crate::ledger::event::{AuditEvent, ChainState, TenantKey};
use crate::ledger::Ledger;
use crate::store::{LedgerStore, PartitionSnapshot};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FindingKind {
    /// Stored fields no longer produce the stored digest.
    FieldTamper,
    /// An event does not link to its predecessor.
    ChainBreak,
    /// The walk ended short of the recorded chain head.
    TruncatedTail,
    /// Events exist with no chain head recorded.
    OrphanPartition,
}

impl fmt::Display for FindingKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FindingKind::FieldTamper => "FIELD_TAMPER",
            FindingKind::ChainBreak => "CHAIN_BREAK",
            FindingKind::TruncatedTail => "TRUNCATED_TAIL",
            FindingKind::OrphanPartition => "ORPHAN_PARTITION",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PartitionReport {
    pub tenant_key: TenantKey,
    pub ok: bool,
    pub first_divergence_event_id: Option<Uuid>,
    pub kind: Option<FindingKind>,
    pub events_checked: usize,
    pub detail: Option<String>,
}

impl PartitionReport {
    fn clean(tenant_key: TenantKey, events_checked: usize) -> Self {
        Self {
            tenant_key,
            ok: true,
            first_divergence_event_id: None,
            kind: None,
            events_checked,
            detail: None,
        }
    }

    pub(crate) fn finding(
        tenant_key: TenantKey,
        kind: FindingKind,
        event_id: Option<Uuid>,
        events_checked: usize,
        detail: String,
    ) -> Self {
        Self {
            tenant_key,
            ok: false,
            first_divergence_event_id: event_id,
            kind: Some(kind),
            events_checked,
            detail: Some(detail),
        }
    }

    pub fn summary(&self) -> String {
        match self.kind {
            None => format!("{}: ok ({} events)", self.tenant_key, self.events_checked),
            Some(kind) => format!(
                "{}: {} at {} after {} events{}",
                self.tenant_key,
                kind,
                self.first_divergence_event_id
                    .map(|id| id.to_string())
                    .unwrap_or_else(|| "-".to_string()),
                self.events_checked,
                self.detail
                    .as_deref()
                    .map(|d| format!(" ({})", d))
                    .unwrap_or_default()
            ),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerificationReport {
    pub ok: bool,
    pub partitions: Vec<PartitionReport>,
    pub verified_at: DateTime<Utc>,
}

impl VerificationReport {
    pub fn from_partitions(partitions: Vec<PartitionReport>) -> Self {
        Self {
            ok: partitions.iter().all(|p| p.ok),
            partitions,
            verified_at: Utc::now(),
        }
    }

    pub fn failures(&self) -> impl Iterator<Item = &PartitionReport> {
        self.partitions.iter().filter(|p| !p.ok)
    }
}

/// Walk events in chain order starting from `anchor_prev`, stopping at
/// the first event that does not link or does not match its digest.
fn walk(
    tenant_key: &TenantKey,
    events: &[AuditEvent],
    anchor_prev: &str,
) -> Result<String, PartitionReport> {
    let mut expected_prev = anchor_prev.to_string();

    for (checked, event) in events.iter().enumerate() {
        if event.prev_hash != expected_prev {
            return Err(PartitionReport::finding(
                tenant_key.clone(),
                FindingKind::ChainBreak,
                Some(event.id),
                checked,
                format!(
                    "seq {} links to {} but the chain expects {}",
                    event.seq,
                    display_hash(&event.prev_hash),
                    display_hash(&expected_prev)
                ),
            ));
        }

        // Recompute with the expected link, never the stored one.
        let recomputed = event.calculate_hash(&expected_prev);
        if recomputed != event.event_hash {
            return Err(PartitionReport::finding(
                tenant_key.clone(),
                FindingKind::FieldTamper,
                Some(event.id),
                checked,
                format!("seq {} digest does not match its stored fields", event.seq),
            ));
        }

        expected_prev = event.event_hash.clone();
    }

    Ok(expected_prev)
}

/// Verify a whole partition: the walk from genesis must end on `head`.
///
/// Events with no recorded head are reported as an orphaned partition
/// once the walk itself is clean.
pub fn verify_chain(
    tenant_key: &TenantKey,
    events: &[AuditEvent],
    head: Option<&ChainState>,
) -> PartitionReport {
    let last_hash = match walk(tenant_key, events, "") {
        Ok(last_hash) => last_hash,
        Err(report) => return report,
    };

    let checked = events.len();
    match head {
        None if !events.is_empty() => PartitionReport::finding(
            tenant_key.clone(),
            FindingKind::OrphanPartition,
            events.first().map(|e| e.id),
            checked,
            "events exist but no chain head is recorded".to_string(),
        ),
        Some(head) if head.last_hash != last_hash => PartitionReport::finding(
            tenant_key.clone(),
            FindingKind::TruncatedTail,
            head.last_event_id,
            checked,
            format!(
                "walk ended at {} but the head records {} (seq {})",
                display_hash(&last_hash),
                display_hash(&head.last_hash),
                head.last_seq
            ),
        ),
        _ => PartitionReport::clean(tenant_key.clone(), checked),
    }
}

/// Verify a contiguous slice of a chain, such as an export, whose first
/// event links to `anchor_prev`. There is no head to compare against.
pub fn verify_segment(
    tenant_key: &TenantKey,
    events: &[AuditEvent],
    anchor_prev: &str,
) -> PartitionReport {
    match walk(tenant_key, events, anchor_prev) {
        Ok(_) => PartitionReport::clean(tenant_key.clone(), events.len()),
        Err(report) => report,
    }
}

/// Verify a partition as loaded from the store. A row that no longer
/// decodes is reported as tampered at that row, unless the chain already
/// diverges before it.
pub fn verify_snapshot(tenant_key: &TenantKey, snapshot: &PartitionSnapshot) -> PartitionReport {
    let Some(bad) = snapshot.undecodable.first() else {
        return verify_chain(tenant_key, &snapshot.events, snapshot.head.as_ref());
    };

    let before = &snapshot.events[..bad.position.min(snapshot.events.len())];
    if let Err(report) = walk(tenant_key, before, "") {
        return report;
    }
    PartitionReport::finding(
        tenant_key.clone(),
        FindingKind::FieldTamper,
        bad.event_id,
        before.len(),
        format!("stored row cannot be decoded: {}", bad.reason),
    )
}

pub(crate) fn display_hash(hash: &str) -> &str {
    if hash.is_empty() {
        "<genesis>"
    } else {
        hash.get(..16).unwrap_or(hash)
    }
}

impl<S: LedgerStore> Ledger<S> {
    /// Verify one partition, or every partition known to the store.
    pub async fn verify(&self, partition: Option<&TenantKey>) -> LedgerResult<VerificationReport> {
        let partitions = match partition {
            Some(key) => vec![key.clone()],
            None => self.store().partition_keys().await?,
        };

        let mut reports = Vec::with_capacity(partitions.len());
        for key in &partitions {
            let report = match self.store().load_partition(key).await {
                Ok(snapshot) => verify_snapshot(key, &snapshot),
                // The chain state row itself does not decode
                Err(LedgerError::Serialization(reason)) => PartitionReport::finding(
                    key.clone(),
                    FindingKind::FieldTamper,
                    None,
                    0,
                    format!("stored chain state cannot be decoded: {}", reason),
                ),
                Err(err) => return Err(err),
            };
            if report.ok {
                info!(tenant_key = %key, events = report.events_checked, "partition verified");
            } else {
                warn!(
                    tenant_key = %key,
                    kind = ?report.kind,
                    event_id = ?report.first_divergence_event_id,
                    events = report.events_checked,
                    "partition verification failed"
                );
            }
            reports.push(report);
        }

        let report = VerificationReport::from_partitions(reports);
        info!(
            ok = report.ok,
            partitions = report.partitions.len(),
            failures = report.failures().count(),
            "verification complete"
        );
        Ok(report)
    }
}
