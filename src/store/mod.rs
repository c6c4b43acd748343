//! Ledger Storage
//!
//! The storage contract the ledger is written against, plus the
//! `Database` handle that dispatches to a Postgres or SQLite backend
//! chosen from the connection URL.

pub mod immutability;
pub mod memory;
pub mod postgres;
pub mod sqlite;

use async_trait::async_trait;
use std::time::Duration;
use uuid::Uuid;

use crate::config::StoreConfig;
use crate::error::{LedgerError, LedgerResult};
use crate::ledger::event::{AuditEvent, ChainState, NewAuditEvent, TenantKey};
use crate::ledger::query::{AuditPage, AuditQuery};

pub use memory::MemoryLedgerStore;
pub use postgres::PgLedgerStore;
pub use sqlite::SqliteLedgerStore;

/// Everything stored for one partition, read from a single snapshot.
#[derive(Debug, Clone, Default)]
pub struct PartitionSnapshot {
    pub head: Option<ChainState>,
    /// Events in chain order (`seq` ascending).
    pub events: Vec<AuditEvent>,
    /// Stored rows that no longer decode into an event, in chain order.
    pub undecodable: Vec<UndecodableRow>,
}

/// A stored event row whose columns cannot be read back as an event.
#[derive(Debug, Clone, PartialEq)]
pub struct UndecodableRow {
    /// Number of rows ahead of this one in chain order.
    pub position: usize,
    pub event_id: Option<Uuid>,
    pub reason: String,
}

impl PartitionSnapshot {
    /// Decode rows in chain order, setting aside the ones that fail.
    pub(crate) fn decode<R>(
        head: Option<ChainState>,
        rows: &[R],
        decode: impl Fn(&R) -> LedgerResult<AuditEvent>,
        event_id: impl Fn(&R) -> Option<Uuid>,
    ) -> Self {
        let mut events = Vec::with_capacity(rows.len());
        let mut undecodable = Vec::new();
        for (position, row) in rows.iter().enumerate() {
            match decode(row) {
                Ok(event) => events.push(event),
                Err(err) => undecodable.push(UndecodableRow {
                    position,
                    event_id: event_id(row),
                    reason: err.to_string(),
                }),
            }
        }
        Self {
            head,
            events,
            undecodable,
        }
    }
}

/// One open append transaction. Holds the partition lock until it is
/// committed or dropped; dropping rolls everything back.
#[async_trait]
pub trait ChainTx: Send {
    /// Chain head as read under the lock.
    fn head(&self) -> &ChainState;

    /// Latest stored event of the partition, by `seq`.
    async fn tail_event(&mut self) -> LedgerResult<Option<AuditEvent>>;

    /// Staged legacy events for this partition, oldest first. They are
    /// removed from staging when the transaction commits.
    async fn take_legacy(&mut self) -> LedgerResult<Vec<NewAuditEvent>>;

    async fn insert_event(&mut self, event: &AuditEvent) -> LedgerResult<()>;

    async fn advance_head(&mut self, event: &AuditEvent) -> LedgerResult<()>;

    async fn commit(self) -> LedgerResult<()>;
}

#[async_trait]
pub trait LedgerStore: Clone + Send + Sync + 'static {
    type Tx: ChainTx + 'static;

    async fn migrate(&self) -> LedgerResult<()>;

    /// Fail unless update/delete protection is active in the store.
    async fn ensure_enforced(&self) -> LedgerResult<()>;

    /// Create the partition's chain state if absent, then lock it.
    async fn begin_append(&self, partition: &TenantKey) -> LedgerResult<Self::Tx>;

    /// Partitions with a chain state row or at least one event.
    async fn partition_keys(&self) -> LedgerResult<Vec<TenantKey>>;

    async fn load_partition(&self, partition: &TenantKey) -> LedgerResult<PartitionSnapshot>;

    async fn query(&self, partition: &TenantKey, query: &AuditQuery) -> LedgerResult<AuditPage>;

    /// Stage pre-ledger history for a later backfill.
    async fn stage_legacy(&self, partition: &TenantKey, events: &[NewAuditEvent]) -> LedgerResult<()>;

    async fn legacy_partitions(&self) -> LedgerResult<Vec<TenantKey>>;
}

/// Store handle selected at runtime from the database URL.
#[derive(Clone)]
pub enum Database {
    Postgres(PgLedgerStore),
    Sqlite(SqliteLedgerStore),
}

impl Database {
    pub async fn connect(
        database_url: &str,
        store: &StoreConfig,
        lock_timeout: Duration,
    ) -> LedgerResult<Self> {
        if database_url.starts_with("postgres://") || database_url.starts_with("postgresql://") {
            let store = PgLedgerStore::connect(database_url, store, lock_timeout).await?;
            Ok(Database::Postgres(store))
        } else if database_url.starts_with("sqlite:") {
            let store = SqliteLedgerStore::connect(database_url, store, lock_timeout).await?;
            Ok(Database::Sqlite(store))
        } else {
            Err(LedgerError::Config(format!(
                "unsupported database URL scheme: {}",
                database_url.split(':').next().unwrap_or_default()
            )))
        }
    }

    pub fn backend_name(&self) -> &'static str {
        match self {
            Database::Postgres(_) => "postgres",
            Database::Sqlite(_) => "sqlite",
        }
    }
}

pub enum DatabaseTx {
    Postgres(<PgLedgerStore as LedgerStore>::Tx),
    Sqlite(<SqliteLedgerStore as LedgerStore>::Tx),
}

#[async_trait]
impl ChainTx for DatabaseTx {
    fn head(&self) -> &ChainState {
        match self {
            DatabaseTx::Postgres(tx) => tx.head(),
            DatabaseTx::Sqlite(tx) => tx.head(),
        }
    }

    async fn tail_event(&mut self) -> LedgerResult<Option<AuditEvent>> {
        match self {
            DatabaseTx::Postgres(tx) => tx.tail_event().await,
            DatabaseTx::Sqlite(tx) => tx.tail_event().await,
        }
    }

    async fn take_legacy(&mut self) -> LedgerResult<Vec<NewAuditEvent>> {
        match self {
            DatabaseTx::Postgres(tx) => tx.take_legacy().await,
            DatabaseTx::Sqlite(tx) => tx.take_legacy().await,
        }
    }

    async fn insert_event(&mut self, event: &AuditEvent) -> LedgerResult<()> {
        match self {
            DatabaseTx::Postgres(tx) => tx.insert_event(event).await,
            DatabaseTx::Sqlite(tx) => tx.insert_event(event).await,
        }
    }

    async fn advance_head(&mut self, event: &AuditEvent) -> LedgerResult<()> {
        match self {
            DatabaseTx::Postgres(tx) => tx.advance_head(event).await,
            DatabaseTx::Sqlite(tx) => tx.advance_head(event).await,
        }
    }

    async fn commit(self) -> LedgerResult<()> {
        match self {
            DatabaseTx::Postgres(tx) => tx.commit().await,
            DatabaseTx::Sqlite(tx) => tx.commit().await,
        }
    }
}

#[async_trait]
impl LedgerStore for Database {
    type Tx = DatabaseTx;

    async fn migrate(&self) -> LedgerResult<()> {
        match self {
            Database::Postgres(store) => store.migrate().await,
            Database::Sqlite(store) => store.migrate().await,
        }
    }

    async fn ensure_enforced(&self) -> LedgerResult<()> {
        match self {
            Database::Postgres(store) => store.ensure_enforced().await,
            Database::Sqlite(store) => store.ensure_enforced().await,
        }
    }

    async fn begin_append(&self, partition: &TenantKey) -> LedgerResult<Self::Tx> {
        match self {
            Database::Postgres(store) => store.begin_append(partition).await.map(DatabaseTx::Postgres),
            Database::Sqlite(store) => store.begin_append(partition).await.map(DatabaseTx::Sqlite),
        }
    }

    async fn partition_keys(&self) -> LedgerResult<Vec<TenantKey>> {
        match self {
            Database::Postgres(store) => store.partition_keys().await,
            Database::Sqlite(store) => store.partition_keys().await,
        }
    }

    async fn load_partition(&self, partition: &TenantKey) -> LedgerResult<PartitionSnapshot> {
        match self {
            Database::Postgres(store) => store.load_partition(partition).await,
            Database::Sqlite(store) => store.load_partition(partition).await,
        }
    }

    async fn query(&self, partition: &TenantKey, query: &AuditQuery) -> LedgerResult<AuditPage> {
        match self {
            Database::Postgres(store) => store.query(partition, query).await,
            Database::Sqlite(store) => store.query(partition, query).await,
        }
    }

    async fn stage_legacy(&self, partition: &TenantKey, events: &[NewAuditEvent]) -> LedgerResult<()> {
        match self {
            Database::Postgres(store) => store.stage_legacy(partition, events).await,
            Database::Sqlite(store) => store.stage_legacy(partition, events).await,
        }
    }

    async fn legacy_partitions(&self) -> LedgerResult<Vec<TenantKey>> {
        match self {
            Database::Postgres(store) => store.legacy_partitions().await,
            Database::Sqlite(store) => store.legacy_partitions().await,
        }
    }
}
