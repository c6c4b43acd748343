//! Append Gate
//!
//! The only write path into the ledger. Each append locks its partition's
//! chain head, links the new event onto it, and commits the event and the
//! advanced head together.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::error::{LedgerError, LedgerResult};
use crate::ledger::event::{AuditEvent, NewAuditEvent, TenantKey};
use crate::ledger::Ledger;
use crate::store::{ChainTx, LedgerStore};

/// Outcome of a backfill run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BackfillSummary {
    pub partitions_chained: usize,
    pub events_chained: usize,
    pub heads_seeded: usize,
    /// Partitions with staged history that already had a chain.
    pub partitions_skipped: Vec<TenantKey>,
    /// Partitions the run could not process; the rest were still handled.
    pub failures: Vec<BackfillFailure>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackfillFailure {
    pub tenant_key: TenantKey,
    pub error: String,
}

impl BackfillSummary {
    fn failed(&mut self, tenant_key: TenantKey, err: LedgerError) {
        error!(tenant_key = %tenant_key, error = %err, "backfill failed for partition");
        self.failures.push(BackfillFailure {
            tenant_key,
            error: err.to_string(),
        });
    }
}

/// Delay before retrying after failed attempt `attempt` (1-based):
/// `base_ms` doubled per attempt, plus jitter. Saturates instead of
/// overflowing.
fn retry_delay(base_ms: u64, attempt: u32, jitter_ms: u64) -> Duration {
    let backoff = base_ms.saturating_mul(1u64 << attempt.saturating_sub(1).min(16));
    Duration::from_millis(backoff.saturating_add(jitter_ms))
}

impl<S: LedgerStore> Ledger<S> {
    /// Lock a partition, waiting at most the configured lock timeout.
    async fn lock_partition(&self, partition: &TenantKey) -> LedgerResult<S::Tx> {
        let limit = self.config().lock_timeout();
        match tokio::time::timeout(limit, self.store().begin_append(partition)).await {
            Ok(tx) => tx,
            Err(_) => Err(LedgerError::lock_timeout(
                partition.as_str(),
                limit.as_millis() as u64,
            )),
        }
    }

    /// Chain and persist one event. Nothing is stored unless this returns `Ok`.
    pub async fn append(&self, event: NewAuditEvent) -> LedgerResult<AuditEvent> {
        event.validate()?;
        let partition = TenantKey::resolve(event.tenant_id.as_deref())?;

        let mut tx = self.lock_partition(&partition).await?;
        let head = tx.head().clone();
        let sealed = event.seal(partition, head.last_seq + 1, &head.last_hash);

        tx.insert_event(&sealed).await?;
        tx.advance_head(&sealed).await?;
        tx.commit().await?;

        debug!(
            tenant_key = %sealed.tenant_key,
            event_id = %sealed.id,
            seq = sealed.seq,
            event_hash = %sealed.event_hash,
            action = %sealed.action,
            "audit event appended"
        );
        Ok(sealed)
    }

    /// Append, retrying lock timeouts with jittered exponential backoff.
    pub async fn append_with_retry(&self, event: NewAuditEvent) -> LedgerResult<AuditEvent> {
        let max_attempts = self.config().append_max_attempts.max(1);
        let base = self.config().append_backoff_ms;
        let mut attempt = 1;

        loop {
            match self.append(event.clone()).await {
                Err(err) if err.is_retryable() && attempt < max_attempts => {
                    let jitter = rand::thread_rng().gen_range(0..=base);
                    let delay = retry_delay(base, attempt, jitter);
                    warn!(
                        event_id = %event.id,
                        attempt,
                        max_attempts,
                        error = %err,
                        "append lock timeout, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                result => return result,
            }
        }
    }

    /// Link pre-ledger history into the chain. Safe to run repeatedly.
    ///
    /// A partition that fails is recorded in the summary and the run moves
    /// on to the next one.
    pub async fn backfill(&self) -> LedgerResult<BackfillSummary> {
        let mut summary = BackfillSummary::default();

        for partition in self.store().legacy_partitions().await? {
            match self.chain_legacy(&partition).await {
                Ok(Some(chained)) => {
                    summary.partitions_chained += 1;
                    summary.events_chained += chained;
                }
                Ok(None) => summary.partitions_skipped.push(partition),
                Err(err) => summary.failed(partition, err),
            }
        }

        for partition in self.store().partition_keys().await? {
            match self.seed_head(&partition).await {
                Ok(true) => summary.heads_seeded += 1,
                Ok(false) => {}
                Err(err) => summary.failed(partition, err),
            }
        }

        info!(
            partitions_chained = summary.partitions_chained,
            events_chained = summary.events_chained,
            heads_seeded = summary.heads_seeded,
            partitions_skipped = summary.partitions_skipped.len(),
            failures = summary.failures.len(),
            "backfill complete"
        );
        Ok(summary)
    }

    /// Chain a partition's staged history, provided nothing is stored for
    /// it yet. `None` when the partition already has events.
    async fn chain_legacy(&self, partition: &TenantKey) -> LedgerResult<Option<usize>> {
        let mut tx = self.lock_partition(partition).await?;
        if !tx.head().is_empty() || tx.tail_event().await?.is_some() {
            warn!(tenant_key = %partition, "partition already has events, legacy history left staged");
            return Ok(None);
        }

        let legacy = tx.take_legacy().await?;
        let mut chained = 0;
        for event in legacy {
            event.validate()?;
            let head = tx.head().clone();
            let sealed = event.seal(partition.clone(), head.last_seq + 1, &head.last_hash);
            tx.insert_event(&sealed).await?;
            tx.advance_head(&sealed).await?;
            chained += 1;
        }
        let last_hash = tx.head().last_hash.clone();
        tx.commit().await?;

        info!(tenant_key = %partition, events = chained, last_hash = %last_hash, "legacy history chained");
        Ok(Some(chained))
    }

    /// Point an orphaned partition's head at its latest stored event.
    async fn seed_head(&self, partition: &TenantKey) -> LedgerResult<bool> {
        let mut tx = self.lock_partition(partition).await?;
        if !tx.head().is_empty() {
            return Ok(false);
        }
        let Some(tail) = tx.tail_event().await? else {
            return Ok(false);
        };
        tx.advance_head(&tail).await?;
        tx.commit().await?;

        info!(
            tenant_key = %partition,
            event_id = %tail.id,
            seq = tail.seq,
            "chain head seeded from latest stored event"
        );
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LedgerConfig;
    use crate::ledger::event::{AuditAction, Outcome};
    use crate::store::MemoryLedgerStore;
    use chrono::{TimeZone, Utc};
    use std::time::Instant;

    const TENANT_A: &str = "6f9619ff-8b86-d011-b42d-00c04fc964ff";
    const TENANT_B: &str = "7c9e6679-7425-40de-944b-e07fc1f90ae7";

    fn ledger() -> Ledger<MemoryLedgerStore> {
        Ledger::new(
            MemoryLedgerStore::new(),
            LedgerConfig {
                lock_timeout_ms: 100,
                append_max_attempts: 5,
                append_backoff_ms: 10,
            },
        )
    }

    fn key(raw: &str) -> TenantKey {
        TenantKey::resolve(Some(raw)).unwrap()
    }

    #[tokio::test]
    async fn test_append_links_events() {
        let ledger = ledger();
        let mut hashes = Vec::new();
        for action in ["CREATE", "VIEW", "DELETE"] {
            let event = ledger
                .append(NewAuditEvent::new(action, "patient").tenant(TENANT_A))
                .await
                .unwrap();
            hashes.push(event);
        }

        assert_eq!(hashes[0].prev_hash, "");
        assert_eq!(hashes[1].prev_hash, hashes[0].event_hash);
        assert_eq!(hashes[2].prev_hash, hashes[1].event_hash);
        assert_eq!(hashes[2].seq, 3);

        let report = ledger.verify(Some(&key(TENANT_A))).await.unwrap();
        assert!(report.ok);
        assert_eq!(report.partitions[0].events_checked, 3);

        let snapshot = ledger.store().load_partition(&key(TENANT_A)).await.unwrap();
        assert_eq!(snapshot.head.unwrap().last_hash, hashes[2].event_hash);
    }

    #[tokio::test]
    async fn test_absent_tenant_goes_to_system_partition() {
        let ledger = ledger();
        let event = ledger
            .append(NewAuditEvent::new(AuditAction::LoginFailed, "session").outcome(Outcome::Failure))
            .await
            .unwrap();
        assert!(event.tenant_key.is_system());
    }

    #[tokio::test]
    async fn test_unresolvable_tenant_is_rejected() {
        let ledger = ledger();
        let err = ledger
            .append(NewAuditEvent::new("patient.view", "patient").tenant("not-a-uuid"))
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::UnknownPartition(_)));
        assert!(ledger.store().partition_keys().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_appends_form_one_chain() {
        let ledger = ledger();
        let mut handles = Vec::new();
        for worker in 0..8 {
            let ledger = ledger.clone();
            handles.push(tokio::spawn(async move {
                for i in 0..10 {
                    ledger
                        .append_with_retry(
                            NewAuditEvent::new("patient.view", "patient")
                                .tenant(TENANT_A)
                                .detail("worker", worker)
                                .detail("i", i),
                        )
                        .await
                        .unwrap();
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let report = ledger.verify(Some(&key(TENANT_A))).await.unwrap();
        assert!(report.ok, "{:?}", report);
        assert_eq!(report.partitions[0].events_checked, 80);
    }

    #[tokio::test]
    async fn test_held_partition_does_not_block_others() {
        let ledger = ledger();
        let _held = ledger.store().begin_append(&key(TENANT_A)).await.unwrap();

        let started = Instant::now();
        ledger
            .append(NewAuditEvent::new("patient.view", "patient").tenant(TENANT_B))
            .await
            .unwrap();
        assert!(started.elapsed() < Duration::from_millis(100));

        let err = ledger
            .append(NewAuditEvent::new("patient.view", "patient").tenant(TENANT_A))
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::LockTimeout(_)));
    }

    #[tokio::test]
    async fn test_lock_timeout_leaves_no_partial_state() {
        let ledger = ledger();
        ledger
            .append(NewAuditEvent::new("patient.create", "patient").tenant(TENANT_A))
            .await
            .unwrap();

        let held = ledger.store().begin_append(&key(TENANT_A)).await.unwrap();
        let err = ledger
            .append(NewAuditEvent::new("patient.view", "patient").tenant(TENANT_A))
            .await
            .unwrap_err();
        assert!(err.is_retryable());
        drop(held);

        ledger
            .append(NewAuditEvent::new("patient.view", "patient").tenant(TENANT_A))
            .await
            .unwrap();
        let report = ledger.verify(Some(&key(TENANT_A))).await.unwrap();
        assert!(report.ok);
        assert_eq!(report.partitions[0].events_checked, 2);
    }

    #[tokio::test]
    async fn test_retry_succeeds_once_lock_is_released() {
        let ledger = ledger();
        let held = ledger.store().begin_append(&key(TENANT_A)).await.unwrap();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(150)).await;
            drop(held);
        });

        let event = ledger
            .append_with_retry(NewAuditEvent::new("chr.sign", "chr").tenant(TENANT_A))
            .await
            .unwrap();
        assert_eq!(event.seq, 1);
    }

    #[tokio::test]
    async fn test_backfill_chains_legacy_history() {
        let ledger = ledger();
        let partition = key(TENANT_A);
        let legacy: Vec<NewAuditEvent> = (0..3)
            .map(|minute| {
                NewAuditEvent::new("patient.view", "patient")
                    .tenant(TENANT_A)
                    .event_time(Utc.with_ymd_and_hms(2024, 1, 1, 9, 2 - minute, 0).unwrap())
            })
            .collect();
        ledger.store().stage_legacy(&partition, &legacy).await.unwrap();

        let summary = ledger.backfill().await.unwrap();
        assert_eq!(summary.partitions_chained, 1);
        assert_eq!(summary.events_chained, 3);

        let snapshot = ledger.store().load_partition(&partition).await.unwrap();
        let times: Vec<_> = snapshot.events.iter().map(|e| e.event_time).collect();
        assert!(times.windows(2).all(|w| w[0] <= w[1]), "chained oldest first");
        let e0 = snapshot.events.last().unwrap().clone();

        let next = ledger
            .append(NewAuditEvent::new("patient.update", "patient").tenant(TENANT_A))
            .await
            .unwrap();
        assert_eq!(next.prev_hash, e0.event_hash);

        // Idempotent
        let again = ledger.backfill().await.unwrap();
        assert_eq!(again, BackfillSummary::default());
    }

    #[tokio::test]
    async fn test_backfill_skips_chained_partitions() {
        let ledger = ledger();
        let partition = key(TENANT_A);
        ledger
            .append(NewAuditEvent::new("patient.create", "patient").tenant(TENANT_A))
            .await
            .unwrap();
        ledger
            .store()
            .stage_legacy(&partition, &[NewAuditEvent::new("patient.view", "patient")])
            .await
            .unwrap();

        let summary = ledger.backfill().await.unwrap();
        assert_eq!(summary.partitions_skipped, vec![partition.clone()]);
        assert_eq!(summary.events_chained, 0);
        assert_eq!(ledger.store().legacy_partitions().await.unwrap(), vec![partition]);
    }

    #[tokio::test]
    async fn test_backfill_leaves_orphan_history_alone_and_continues() {
        let ledger = ledger();
        let orphan = key(TENANT_A);
        let fresh = key(TENANT_B);

        let e0 = NewAuditEvent::new("patient.view", "patient").seal(orphan.clone(), 1, "");
        let stored = e0.clone();
        ledger
            .store()
            .tamper(&orphan, move |events, head| {
                events.push(stored);
                *head = None;
            })
            .await;
        for partition in [&orphan, &fresh] {
            ledger
                .store()
                .stage_legacy(partition, &[NewAuditEvent::new("patient.create", "patient")])
                .await
                .unwrap();
        }

        let summary = ledger.backfill().await.unwrap();
        assert_eq!(summary.partitions_skipped, vec![orphan.clone()]);
        assert_eq!(summary.partitions_chained, 1);
        assert_eq!(summary.events_chained, 1);
        assert_eq!(summary.heads_seeded, 1);
        assert!(summary.failures.is_empty());
        assert_eq!(ledger.store().legacy_partitions().await.unwrap(), vec![orphan.clone()]);

        let snapshot = ledger.store().load_partition(&orphan).await.unwrap();
        assert_eq!(snapshot.events, vec![e0.clone()]);
        assert_eq!(snapshot.head.unwrap().last_hash, e0.event_hash);

        let report = ledger.verify(None).await.unwrap();
        assert!(report.ok, "{:?}", report);
    }

    #[tokio::test]
    async fn test_backfill_records_failures_and_moves_on() {
        let ledger = ledger();
        let held = key(TENANT_A);
        let fresh = key(TENANT_B);
        for partition in [&held, &fresh] {
            ledger
                .store()
                .stage_legacy(partition, &[NewAuditEvent::new("patient.create", "patient")])
                .await
                .unwrap();
        }

        let _lock = ledger.store().begin_append(&held).await.unwrap();
        let summary = ledger.backfill().await.unwrap();

        assert_eq!(summary.failures.len(), 1);
        assert_eq!(summary.failures[0].tenant_key, held);
        assert!(summary.failures[0].error.contains("Lock timeout"));
        assert_eq!(summary.partitions_chained, 1);
        assert_eq!(ledger.store().legacy_partitions().await.unwrap(), vec![held]);
    }

    #[test]
    fn test_retry_delay_grows_and_saturates() {
        assert_eq!(retry_delay(50, 1, 0), Duration::from_millis(50));
        assert_eq!(retry_delay(50, 3, 7), Duration::from_millis(207));
        assert_eq!(retry_delay(u64::MAX, 40, u64::MAX), Duration::from_millis(u64::MAX));
    }

    #[tokio::test]
    async fn test_backfill_seeds_orphaned_partition() {
        let ledger = ledger();
        let partition = key(TENANT_B);
        let e0 = NewAuditEvent::new("patient.view", "patient").seal(partition.clone(), 1, "");
        let stored = e0.clone();
        ledger
            .store()
            .tamper(&partition, move |events, head| {
                events.push(stored);
                *head = None;
            })
            .await;

        let summary = ledger.backfill().await.unwrap();
        assert_eq!(summary.heads_seeded, 1);

        let next = ledger
            .append(NewAuditEvent::new("patient.update", "patient").tenant(TENANT_B))
            .await
            .unwrap();
        assert_eq!(next.prev_hash, e0.event_hash);
        assert_eq!(next.seq, 2);
        assert!(ledger.verify(Some(&partition)).await.unwrap().ok);
    }
}
