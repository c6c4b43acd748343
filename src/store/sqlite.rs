//! SQLite Ledger Store
//!
//! Single-node backend. SQLite has one writer at a time, so an append
//! transaction holds the database write lock rather than a per-partition
//! row lock: appends to different tenants serialize against each other
//! here. Chains stay correct; only the independence of partitions is
//! lost. Ids, times and details are stored as TEXT in their canonical
//! forms.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::{QueryBuilder, Row, Sqlite, Transaction};
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::StoreConfig;
use crate::error::{LedgerError, LedgerResult};
use crate::ledger::event::{AuditEvent, ChainState, Details, NewAuditEvent, TenantKey};
use crate::ledger::hasher::{canonical_details, canonical_time};
use crate::ledger::query::{AuditPage, AuditQuery};
use crate::store::immutability::{self, SQLITE_TRIGGERS};
use crate::store::{ChainTx, LedgerStore, PartitionSnapshot};

const EVENT_COLUMNS: &str = "id, tenant_key, seq, event_time, actor_id, actor_label, \
     resource_type, resource_id, action, outcome, details, request_id, prev_hash, event_hash";

const LEGACY_COLUMNS: &str = "id, tenant_key, event_time, actor_id, actor_label, \
     resource_type, resource_id, action, outcome, details, request_id";

const STATE_COLUMNS: &str = "tenant_key, last_hash, last_event_id, last_seq, updated_at";

#[derive(Clone)]
pub struct SqliteLedgerStore {
    pool: SqlitePool,
}

impl SqliteLedgerStore {
    pub async fn connect(
        database_url: &str,
        store: &StoreConfig,
        lock_timeout: Duration,
    ) -> LedgerResult<Self> {
        let options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(lock_timeout);

        // Every connection to `:memory:` opens its own empty database.
        let max_connections = if database_url.contains(":memory:") {
            1
        } else {
            store.max_connections
        };

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

fn parse_uuid(raw: &str) -> LedgerResult<Uuid> {
    Uuid::parse_str(raw)
        .map_err(|e| LedgerError::Serialization(format!("stored id {} is not a UUID: {}", raw, e)))
}

fn parse_time(raw: &str) -> LedgerResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| LedgerError::Serialization(format!("stored time {} is invalid: {}", raw, e)))
}

fn parse_details(raw: &str) -> LedgerResult<Details> {
    Ok(serde_json::from_str(raw)?)
}

fn event_from_row(row: &SqliteRow) -> LedgerResult<AuditEvent> {
    Ok(AuditEvent {
        id: parse_uuid(&row.try_get::<String, _>("id")?)?,
        tenant_key: TenantKey::from_stored(row.try_get("tenant_key")?),
        seq: row.try_get("seq")?,
        event_time: parse_time(&row.try_get::<String, _>("event_time")?)?,
        actor_id: row.try_get("actor_id")?,
        actor_label: row.try_get("actor_label")?,
        resource_type: row.try_get("resource_type")?,
        resource_id: row.try_get("resource_id")?,
        action: row.try_get("action")?,
        outcome: row.try_get("outcome")?,
        details: parse_details(&row.try_get::<String, _>("details")?)?,
        request_id: row.try_get("request_id")?,
        prev_hash: row.try_get("prev_hash")?,
        event_hash: row.try_get("event_hash")?,
    })
}

fn stored_event_id(row: &SqliteRow) -> Option<Uuid> {
    row.try_get::<String, _>("id")
        .ok()
        .and_then(|raw| Uuid::parse_str(&raw).ok())
}

fn legacy_from_row(row: &SqliteRow) -> LedgerResult<NewAuditEvent> {
    Ok(NewAuditEvent {
        id: parse_uuid(&row.try_get::<String, _>("id")?)?,
        tenant_id: Some(row.try_get("tenant_key")?),
        event_time: parse_time(&row.try_get::<String, _>("event_time")?)?,
        actor_id: row.try_get("actor_id")?,
        actor_label: row.try_get("actor_label")?,
        resource_type: row.try_get("resource_type")?,
        resource_id: row.try_get("resource_id")?,
        action: row.try_get("action")?,
        outcome: row.try_get("outcome")?,
        details: parse_details(&row.try_get::<String, _>("details")?)?,
        request_id: row.try_get("request_id")?,
    })
}

fn state_from_row(row: &SqliteRow) -> LedgerResult<ChainState> {
    let last_event_id: Option<String> = row.try_get("last_event_id")?;
    Ok(ChainState {
        tenant_key: TenantKey::from_stored(row.try_get("tenant_key")?),
        last_hash: row.try_get("last_hash")?,
        last_event_id: last_event_id.as_deref().map(parse_uuid).transpose()?,
        last_seq: row.try_get("last_seq")?,
        updated_at: parse_time(&row.try_get::<String, _>("updated_at")?)?,
    })
}

pub struct SqliteChainTx {
    tx: Transaction<'static, Sqlite>,
    head: ChainState,
}

#[async_trait]
impl ChainTx for SqliteChainTx {
    fn head(&self) -> &ChainState {
        &self.head
    }

    async fn tail_event(&mut self) -> LedgerResult<Option<AuditEvent>> {
        let sql = format!(
            "SELECT {} FROM audit_events WHERE tenant_key = ? ORDER BY seq DESC LIMIT 1",
            EVENT_COLUMNS
        );
        let row = sqlx::query(&sql)
            .bind(self.head.tenant_key.as_str())
            .fetch_optional(&mut *self.tx)
            .await?;
        row.as_ref().map(event_from_row).transpose()
    }

    async fn take_legacy(&mut self) -> LedgerResult<Vec<NewAuditEvent>> {
        let sql = format!(
            "SELECT {} FROM legacy_audit_events WHERE tenant_key = ?",
            LEGACY_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(self.head.tenant_key.as_str())
            .fetch_all(&mut *self.tx)
            .await?;
        sqlx::query("DELETE FROM legacy_audit_events WHERE tenant_key = ?")
            .bind(self.head.tenant_key.as_str())
            .execute(&mut *self.tx)
            .await?;

        let mut events = rows
            .iter()
            .map(legacy_from_row)
            .collect::<LedgerResult<Vec<_>>>()?;
        events.sort_by(|a, b| (a.event_time, a.id).cmp(&(b.event_time, b.id)));
        Ok(events)
    }

    async fn insert_event(&mut self, event: &AuditEvent) -> LedgerResult<()> {
        sqlx::query(
            r#"
            INSERT INTO audit_events (
                id, tenant_key, seq, event_time, actor_id, actor_label, resource_type,
                resource_id, action, outcome, details, request_id, prev_hash, event_hash
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(event.id.to_string())
        .bind(event.tenant_key.as_str())
        .bind(event.seq)
        .bind(canonical_time(&event.event_time))
        .bind(&event.actor_id)
        .bind(&event.actor_label)
        .bind(&event.resource_type)
        .bind(&event.resource_id)
        .bind(&event.action)
        .bind(&event.outcome)
        .bind(canonical_details(&event.details))
        .bind(&event.request_id)
        .bind(&event.prev_hash)
        .bind(&event.event_hash)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn advance_head(&mut self, event: &AuditEvent) -> LedgerResult<()> {
        let next = self.head.advanced_to(event);
        sqlx::query(
            r#"
            UPDATE audit_chain_state
            SET last_hash = ?, last_event_id = ?, last_seq = ?, updated_at = ?
            WHERE tenant_key = ?
            "#,
        )
        .bind(&next.last_hash)
        .bind(next.last_event_id.map(|id| id.to_string()))
        .bind(next.last_seq)
        .bind(canonical_time(&next.updated_at))
        .bind(next.tenant_key.as_str())
        .execute(&mut *self.tx)
        .await?;
        self.head = next;
        Ok(())
    }

    async fn commit(self) -> LedgerResult<()> {
        self.tx.commit().await?;
        Ok(())
    }
}

#[async_trait]
impl LedgerStore for SqliteLedgerStore {
    type Tx = SqliteChainTx;

    async fn migrate(&self) -> LedgerResult<()> {
        sqlx::migrate!("./migrations/sqlite").run(&self.pool).await?;
        info!("SQLite ledger migrations applied");
        Ok(())
    }

    async fn ensure_enforced(&self) -> LedgerResult<()> {
        let found: Vec<String> = sqlx::query_scalar(
            r#"
            SELECT name FROM sqlite_master
            WHERE type = 'trigger' AND tbl_name IN ('audit_events', 'audit_chain_state')
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        immutability::check_installed(&found, SQLITE_TRIGGERS)
    }

    async fn begin_append(&self, partition: &TenantKey) -> LedgerResult<Self::Tx> {
        let mut tx = self.pool.begin().await?;

        // A write first, so the transaction takes the write lock before it
        // reads the head and cannot be handed a stale snapshot.
        sqlx::query(
            r#"
            INSERT INTO audit_chain_state (tenant_key, last_hash, last_seq, updated_at)
            VALUES (?, '', 0, ?)
            ON CONFLICT (tenant_key) DO NOTHING
            "#,
        )
        .bind(partition.as_str())
        .bind(canonical_time(&Utc::now()))
        .execute(&mut *tx)
        .await?;

        let sql = format!(
            "SELECT {} FROM audit_chain_state WHERE tenant_key = ?",
            STATE_COLUMNS
        );
        let row = sqlx::query(&sql)
            .bind(partition.as_str())
            .fetch_one(&mut *tx)
            .await?;
        let head = state_from_row(&row)?;

        debug!(tenant_key = %partition, last_seq = head.last_seq, "partition locked");
        Ok(SqliteChainTx { tx, head })
    }

    async fn partition_keys(&self) -> LedgerResult<Vec<TenantKey>> {
        let keys: Vec<String> = sqlx::query_scalar(
            r#"
            SELECT tenant_key FROM audit_chain_state
            UNION
            SELECT tenant_key FROM audit_events
            ORDER BY 1
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(keys.into_iter().map(TenantKey::from_stored).collect())
    }

    async fn load_partition(&self, partition: &TenantKey) -> LedgerResult<PartitionSnapshot> {
        // In WAL mode the first read fixes the snapshot for the transaction.
        let mut tx = self.pool.begin().await?;

        let sql = format!(
            "SELECT {} FROM audit_chain_state WHERE tenant_key = ?",
            STATE_COLUMNS
        );
        let head = sqlx::query(&sql)
            .bind(partition.as_str())
            .fetch_optional(&mut *tx)
            .await?
            .as_ref()
            .map(state_from_row)
            .transpose()?;

        let sql = format!(
            "SELECT {} FROM audit_events WHERE tenant_key = ? ORDER BY seq ASC",
            EVENT_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(partition.as_str())
            .fetch_all(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(PartitionSnapshot::decode(head, &rows[..], event_from_row, stored_event_id))
    }

    async fn query(&self, partition: &TenantKey, query: &AuditQuery) -> LedgerResult<AuditPage> {
        let limit = query.effective_limit();
        let offset = query.effective_offset();

        let mut builder: QueryBuilder<Sqlite> = QueryBuilder::new(format!(
            "SELECT {} FROM audit_events WHERE tenant_key = ",
            EVENT_COLUMNS
        ));
        builder.push_bind(partition.as_str().to_string());
        if let Some(action) = &query.action {
            builder.push(" AND action = ").push_bind(action.clone());
        }
        if let Some(actor_id) = &query.actor_id {
            builder.push(" AND actor_id = ").push_bind(actor_id.clone());
        }
        if let Some(resource_type) = &query.resource_type {
            builder.push(" AND resource_type = ").push_bind(resource_type.clone());
        }
        if let Some(resource_id) = &query.resource_id {
            builder.push(" AND resource_id = ").push_bind(resource_id.clone());
        }
        // Canonical times are fixed width, so text order is time order.
        if let Some(start) = &query.start {
            builder.push(" AND event_time >= ").push_bind(canonical_time(start));
        }
        if let Some(end) = &query.end {
            builder.push(" AND event_time <= ").push_bind(canonical_time(end));
        }
        builder
            .push(" ORDER BY seq DESC LIMIT ")
            .push_bind(i64::from(limit) + 1)
            .push(" OFFSET ")
            .push_bind(i64::from(offset));

        let events = builder
            .build()
            .fetch_all(&self.pool)
            .await?
            .iter()
            .map(event_from_row)
            .collect::<LedgerResult<Vec<_>>>()?;

        Ok(AuditPage::from_overfetch(partition.clone(), events, limit, offset))
    }

    async fn stage_legacy(&self, partition: &TenantKey, events: &[NewAuditEvent]) -> LedgerResult<()> {
        let mut tx = self.pool.begin().await?;
        for event in events {
            sqlx::query(
                r#"
                INSERT INTO legacy_audit_events (
                    id, tenant_key, event_time, actor_id, actor_label, resource_type,
                    resource_id, action, outcome, details, request_id
                )
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(event.id.to_string())
            .bind(partition.as_str())
            .bind(canonical_time(&event.event_time))
            .bind(&event.actor_id)
            .bind(&event.actor_label)
            .bind(&event.resource_type)
            .bind(&event.resource_id)
            .bind(&event.action)
            .bind(&event.outcome)
            .bind(canonical_details(&event.details))
            .bind(&event.request_id)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn legacy_partitions(&self) -> LedgerResult<Vec<TenantKey>> {
        let keys: Vec<String> = sqlx::query_scalar(
            "SELECT DISTINCT tenant_key FROM legacy_audit_events ORDER BY tenant_key",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(keys.into_iter().map(TenantKey::from_stored).collect())
    }
}
