//! In-Memory Ledger Store
//!
//! Process-local backend for tests and embedded use. Each partition has
//! its own async gate, so an append holds only its tenant's lock and
//! readers never wait on a writer.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};

use crate::error::{LedgerError, LedgerResult};
use crate::ledger::event::{AuditEvent, ChainState, NewAuditEvent, TenantKey};
use crate::ledger::query::{AuditPage, AuditQuery};
use crate::store::{ChainTx, LedgerStore, PartitionSnapshot};

type LegacyStaging = Arc<RwLock<HashMap<TenantKey, Vec<NewAuditEvent>>>>;

#[derive(Default)]
struct PartitionLog {
    head: Option<ChainState>,
    events: Vec<AuditEvent>,
}

#[derive(Default)]
struct PartitionSlot {
    gate: Arc<Mutex<()>>,
    log: RwLock<PartitionLog>,
}

#[derive(Clone, Default)]
pub struct MemoryLedgerStore {
    partitions: Arc<RwLock<HashMap<TenantKey, Arc<PartitionSlot>>>>,
    legacy: LegacyStaging,
}

impl MemoryLedgerStore {
    pub fn new() -> Self {
        Self::default()
    }

    async fn slot(&self, partition: &TenantKey) -> Option<Arc<PartitionSlot>> {
        self.partitions.read().await.get(partition).cloned()
    }

    async fn slot_or_create(&self, partition: &TenantKey) -> Arc<PartitionSlot> {
        let mut partitions = self.partitions.write().await;
        partitions.entry(partition.clone()).or_default().clone()
    }

    /// Rewrite stored history directly, bypassing the append path.
    #[cfg(test)]
    pub(crate) async fn tamper<F>(&self, partition: &TenantKey, f: F)
    where
        F: FnOnce(&mut Vec<AuditEvent>, &mut Option<ChainState>),
    {
        let slot = self.slot_or_create(partition).await;
        let mut log = slot.log.write().await;
        let PartitionLog { head, events } = &mut *log;
        f(events, head);
    }
}

pub struct MemoryChainTx {
    _guard: OwnedMutexGuard<()>,
    slot: Arc<PartitionSlot>,
    legacy: LegacyStaging,
    head: ChainState,
    staged: Vec<AuditEvent>,
    took_legacy: bool,
}

#[async_trait]
impl ChainTx for MemoryChainTx {
    fn head(&self) -> &ChainState {
        &self.head
    }

    async fn tail_event(&mut self) -> LedgerResult<Option<AuditEvent>> {
        if let Some(event) = self.staged.last() {
            return Ok(Some(event.clone()));
        }
        let log = self.slot.log.read().await;
        Ok(log.events.iter().max_by_key(|e| e.seq).cloned())
    }

    async fn take_legacy(&mut self) -> LedgerResult<Vec<NewAuditEvent>> {
        let legacy = self.legacy.read().await;
        let mut events = legacy.get(&self.head.tenant_key).cloned().unwrap_or_default();
        events.sort_by(|a, b| (a.event_time, a.id).cmp(&(b.event_time, b.id)));
        self.took_legacy = true;
        Ok(events)
    }

    async fn insert_event(&mut self, event: &AuditEvent) -> LedgerResult<()> {
        let log = self.slot.log.read().await;
        let clash = log
            .events
            .iter()
            .chain(self.staged.iter())
            .any(|e| e.id == event.id || e.seq == event.seq);
        if clash {
            return Err(LedgerError::Database(format!(
                "duplicate audit event {} at seq {}",
                event.id, event.seq
            )));
        }
        drop(log);

        self.staged.push(event.clone());
        Ok(())
    }

    async fn advance_head(&mut self, event: &AuditEvent) -> LedgerResult<()> {
        self.head = self.head.advanced_to(event);
        Ok(())
    }

    async fn commit(self) -> LedgerResult<()> {
        if self.took_legacy {
            self.legacy.write().await.remove(&self.head.tenant_key);
        }

        let mut log = self.slot.log.write().await;
        log.events.extend(self.staged);
        log.head = Some(self.head);
        Ok(())
    }
}

#[async_trait]
impl LedgerStore for MemoryLedgerStore {
    type Tx = MemoryChainTx;

    async fn migrate(&self) -> LedgerResult<()> {
        Ok(())
    }

    // Nothing outside the append path can reach stored events.
    async fn ensure_enforced(&self) -> LedgerResult<()> {
        Ok(())
    }

    async fn begin_append(&self, partition: &TenantKey) -> LedgerResult<Self::Tx> {
        let slot = self.slot_or_create(partition).await;
        let guard = slot.gate.clone().lock_owned().await;

        let head = slot
            .log
            .read()
            .await
            .head
            .clone()
            .unwrap_or_else(|| ChainState::empty(partition.clone()));

        Ok(MemoryChainTx {
            _guard: guard,
            slot,
            legacy: self.legacy.clone(),
            head,
            staged: Vec::new(),
            took_legacy: false,
        })
    }

    async fn partition_keys(&self) -> LedgerResult<Vec<TenantKey>> {
        let partitions = self.partitions.read().await;
        let mut keys = Vec::new();
        for (key, slot) in partitions.iter() {
            let log = slot.log.read().await;
            if log.head.is_some() || !log.events.is_empty() {
                keys.push(key.clone());
            }
        }
        keys.sort();
        Ok(keys)
    }

    async fn load_partition(&self, partition: &TenantKey) -> LedgerResult<PartitionSnapshot> {
        let Some(slot) = self.slot(partition).await else {
            return Ok(PartitionSnapshot::default());
        };
        let log = slot.log.read().await;
        let mut events = log.events.clone();
        events.sort_by_key(|e| e.seq);
        Ok(PartitionSnapshot {
            head: log.head.clone(),
            events,
            undecodable: Vec::new(),
        })
    }

    async fn query(&self, partition: &TenantKey, query: &AuditQuery) -> LedgerResult<AuditPage> {
        let limit = query.effective_limit();
        let offset = query.effective_offset();

        let mut events = match self.slot(partition).await {
            Some(slot) => {
                let log = slot.log.read().await;
                log.events
                    .iter()
                    .filter(|e| query.matches(e))
                    .cloned()
                    .collect::<Vec<_>>()
            }
            None => Vec::new(),
        };
        events.sort_by(|a, b| b.seq.cmp(&a.seq));

        let events = events
            .into_iter()
            .skip(offset as usize)
            .take(limit as usize + 1)
            .collect();
        Ok(AuditPage::from_overfetch(partition.clone(), events, limit, offset))
    }

    async fn stage_legacy(&self, partition: &TenantKey, events: &[NewAuditEvent]) -> LedgerResult<()> {
        let mut legacy = self.legacy.write().await;
        legacy
            .entry(partition.clone())
            .or_default()
            .extend(events.iter().cloned());
        Ok(())
    }

    async fn legacy_partitions(&self) -> LedgerResult<Vec<TenantKey>> {
        let legacy = self.legacy.read().await;
        let mut keys: Vec<TenantKey> = legacy
            .iter()
            .filter(|(_, events)| !events.is_empty())
            .map(|(key, _)| key.clone())
            .collect();
        keys.sort();
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn tenant(n: u8) -> TenantKey {
        TenantKey::resolve(Some(&format!("00000000-0000-0000-0000-0000000000{:02x}", n))).unwrap()
    }

    async fn append_one(store: &MemoryLedgerStore, key: &TenantKey, action: &str) -> AuditEvent {
        let mut tx = store.begin_append(key).await.unwrap();
        let head = tx.head().clone();
        let event = NewAuditEvent::new(action, "patient").seal(key.clone(), head.last_seq + 1, &head.last_hash);
        tx.insert_event(&event).await.unwrap();
        tx.advance_head(&event).await.unwrap();
        tx.commit().await.unwrap();
        event
    }

    #[tokio::test]
    async fn test_commit_makes_events_visible() {
        let store = MemoryLedgerStore::new();
        let key = tenant(1);
        let first = append_one(&store, &key, "patient.create").await;
        let second = append_one(&store, &key, "patient.view").await;

        let snapshot = store.load_partition(&key).await.unwrap();
        assert_eq!(snapshot.events.len(), 2);
        assert_eq!(second.prev_hash, first.event_hash);
        let head = snapshot.head.unwrap();
        assert_eq!(head.last_hash, second.event_hash);
        assert_eq!(head.last_seq, 2);
    }

    #[tokio::test]
    async fn test_dropped_transaction_leaves_no_trace() {
        let store = MemoryLedgerStore::new();
        let key = tenant(2);
        {
            let mut tx = store.begin_append(&key).await.unwrap();
            let event = NewAuditEvent::new("patient.view", "patient").seal(key.clone(), 1, "");
            tx.insert_event(&event).await.unwrap();
            tx.advance_head(&event).await.unwrap();
        }

        let snapshot = store.load_partition(&key).await.unwrap();
        assert!(snapshot.events.is_empty());
        assert!(snapshot.head.is_none());
        assert!(store.partition_keys().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_partitions_lock_independently() {
        let store = MemoryLedgerStore::new();
        let a = tenant(3);
        let b = tenant(4);

        let _held = store.begin_append(&a).await.unwrap();

        // B proceeds while A is held
        let other = tokio::time::timeout(Duration::from_millis(200), append_one(&store, &b, "logout")).await;
        assert!(other.is_ok());

        // A itself is blocked
        let blocked = tokio::time::timeout(Duration::from_millis(50), store.begin_append(&a)).await;
        assert!(blocked.is_err());
    }

    #[tokio::test]
    async fn test_duplicate_seq_is_rejected() {
        let store = MemoryLedgerStore::new();
        let key = tenant(5);
        let first = append_one(&store, &key, "chr.view").await;

        let mut tx = store.begin_append(&key).await.unwrap();
        let replay = NewAuditEvent::new("chr.view", "chr").seal(key.clone(), first.seq, "");
        assert!(matches!(tx.insert_event(&replay).await, Err(LedgerError::Database(_))));
    }

    #[tokio::test]
    async fn test_legacy_is_consumed_only_on_commit() {
        let store = MemoryLedgerStore::new();
        let key = tenant(6);
        store
            .stage_legacy(&key, &[NewAuditEvent::new("login.success", "session")])
            .await
            .unwrap();

        {
            let mut tx = store.begin_append(&key).await.unwrap();
            assert_eq!(tx.take_legacy().await.unwrap().len(), 1);
        }
        assert_eq!(store.legacy_partitions().await.unwrap(), vec![key.clone()]);

        let mut tx = store.begin_append(&key).await.unwrap();
        assert_eq!(tx.take_legacy().await.unwrap().len(), 1);
        tx.commit().await.unwrap();
        assert!(store.legacy_partitions().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_query_is_newest_first_and_scoped() {
        let store = MemoryLedgerStore::new();
        let a = tenant(7);
        let b = tenant(8);
        for action in ["patient.create", "patient.view", "patient.update"] {
            append_one(&store, &a, action).await;
        }
        append_one(&store, &b, "patient.view").await;

        let page = store
            .query(&a, &AuditQuery { limit: Some(2), ..Default::default() })
            .await
            .unwrap();
        assert_eq!(page.events.len(), 2);
        assert!(page.has_more);
        assert_eq!(page.events[0].action, "patient.update");
        assert!(page.events.iter().all(|e| e.tenant_key == a));
    }
}
