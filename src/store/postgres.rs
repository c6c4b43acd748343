//! Postgres Ledger Store
//!
//! Each partition's `audit_chain_state` row doubles as its mutex: an
//! append takes `SELECT ... FOR UPDATE` on it and holds it until commit,
//! so appends to one tenant are totally ordered while other tenants
//! proceed untouched.

use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::types::Json;
use sqlx::{Postgres, QueryBuilder, Row, Transaction};
use std::time::Duration;
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::StoreConfig;
use crate::error::LedgerResult;
use crate::ledger::event::{AuditEvent, ChainState, Details, NewAuditEvent, TenantKey};
use crate::ledger::query::{AuditPage, AuditQuery};
use crate::store::immutability::{self, POSTGRES_TRIGGERS};
use crate::store::{ChainTx, LedgerStore, PartitionSnapshot};

const EVENT_COLUMNS: &str = "id, tenant_key, seq, event_time, actor_id, actor_label, \
     resource_type, resource_id, action, outcome, details, request_id, prev_hash, event_hash";

const LEGACY_COLUMNS: &str = "id, tenant_key, event_time, actor_id, actor_label, \
     resource_type, resource_id, action, outcome, details, request_id";

const STATE_COLUMNS: &str = "tenant_key, last_hash, last_event_id, last_seq, updated_at";

#[derive(Clone)]
pub struct PgLedgerStore {
    pool: PgPool,
    lock_timeout: Duration,
}

impl PgLedgerStore {
    pub async fn connect(
        database_url: &str,
        store: &StoreConfig,
        lock_timeout: Duration,
    ) -> LedgerResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(store.max_connections)
            .connect(database_url)
            .await?;
        Ok(Self::from_pool(pool, lock_timeout))
    }

    pub fn from_pool(pool: PgPool, lock_timeout: Duration) -> Self {
        Self { pool, lock_timeout }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn event_from_row(row: &PgRow) -> LedgerResult<AuditEvent> {
    let details: Json<Details> = row.try_get("details")?;
    Ok(AuditEvent {
        id: row.try_get("id")?,
        tenant_key: TenantKey::from_stored(row.try_get("tenant_key")?),
        seq: row.try_get("seq")?,
        event_time: row.try_get("event_time")?,
        actor_id: row.try_get("actor_id")?,
        actor_label: row.try_get("actor_label")?,
        resource_type: row.try_get("resource_type")?,
        resource_id: row.try_get("resource_id")?,
        action: row.try_get("action")?,
        outcome: row.try_get("outcome")?,
        details: details.0,
        request_id: row.try_get("request_id")?,
        prev_hash: row.try_get("prev_hash")?,
        event_hash: row.try_get("event_hash")?,
    })
}

fn legacy_from_row(row: &PgRow) -> LedgerResult<NewAuditEvent> {
    let details: Json<Details> = row.try_get("details")?;
    Ok(NewAuditEvent {
        id: row.try_get("id")?,
        tenant_id: Some(row.try_get("tenant_key")?),
        event_time: row.try_get("event_time")?,
        actor_id: row.try_get("actor_id")?,
        actor_label: row.try_get("actor_label")?,
        resource_type: row.try_get("resource_type")?,
        resource_id: row.try_get("resource_id")?,
        action: row.try_get("action")?,
        outcome: row.try_get("outcome")?,
        details: details.0,
        request_id: row.try_get("request_id")?,
    })
}

fn state_from_row(row: &PgRow) -> LedgerResult<ChainState> {
    Ok(ChainState {
        tenant_key: TenantKey::from_stored(row.try_get("tenant_key")?),
        last_hash: row.try_get("last_hash")?,
        last_event_id: row.try_get("last_event_id")?,
        last_seq: row.try_get("last_seq")?,
        updated_at: row.try_get("updated_at")?,
    })
}

pub struct PgChainTx {
    tx: Transaction<'static, Postgres>,
    head: ChainState,
}

#[async_trait]
impl ChainTx for PgChainTx {
    fn head(&self) -> &ChainState {
        &self.head
    }

    async fn tail_event(&mut self) -> LedgerResult<Option<AuditEvent>> {
        let sql = format!(
            "SELECT {} FROM audit_events WHERE tenant_key = $1 ORDER BY seq DESC LIMIT 1",
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
            "DELETE FROM legacy_audit_events WHERE tenant_key = $1 RETURNING {}",
            LEGACY_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(self.head.tenant_key.as_str())
            .fetch_all(&mut *self.tx)
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
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            "#,
        )
        .bind(event.id)
        .bind(event.tenant_key.as_str())
        .bind(event.seq)
        .bind(event.event_time)
        .bind(&event.actor_id)
        .bind(&event.actor_label)
        .bind(&event.resource_type)
        .bind(&event.resource_id)
        .bind(&event.action)
        .bind(&event.outcome)
        .bind(Json(&event.details))
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
            SET last_hash = $2, last_event_id = $3, last_seq = $4, updated_at = $5
            WHERE tenant_key = $1
            "#,
        )
        .bind(next.tenant_key.as_str())
        .bind(&next.last_hash)
        .bind(next.last_event_id)
        .bind(next.last_seq)
        .bind(next.updated_at)
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
impl LedgerStore for PgLedgerStore {
    type Tx = PgChainTx;

    async fn migrate(&self) -> LedgerResult<()> {
        sqlx::migrate!("./migrations/postgres").run(&self.pool).await?;
        info!("Postgres ledger migrations applied");
        Ok(())
    }

    async fn ensure_enforced(&self) -> LedgerResult<()> {
        let found: Vec<String> = sqlx::query_scalar(
            r#"
            SELECT t.tgname::text
            FROM pg_trigger t
            JOIN pg_class c ON c.oid = t.tgrelid
            WHERE NOT t.tgisinternal
              AND t.tgenabled <> 'D'
              AND c.relname IN ('audit_events', 'audit_chain_state')
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let expected: Vec<&str> = POSTGRES_TRIGGERS.iter().map(|(_, name)| *name).collect();
        immutability::check_installed(&found, &expected)
    }

    async fn begin_append(&self, partition: &TenantKey) -> LedgerResult<Self::Tx> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("SELECT set_config('lock_timeout', $1, true)")
            .bind(format!("{}ms", self.lock_timeout.as_millis()))
            .execute(&mut *tx)
            .await?;

        // Concurrent first appends both land here; one inserts, the other no-ops.
        sqlx::query(
            r#"
            INSERT INTO audit_chain_state (tenant_key, last_hash, last_seq, updated_at)
            VALUES ($1, '', 0, NOW())
            ON CONFLICT (tenant_key) DO NOTHING
            "#,
        )
        .bind(partition.as_str())
        .execute(&mut *tx)
        .await?;

        let sql = format!(
            "SELECT {} FROM audit_chain_state WHERE tenant_key = $1 FOR UPDATE",
            STATE_COLUMNS
        );
        let row = sqlx::query(&sql)
            .bind(partition.as_str())
            .fetch_one(&mut *tx)
            .await?;
        let head = state_from_row(&row)?;

        debug!(tenant_key = %partition, last_seq = head.last_seq, "partition locked");
        Ok(PgChainTx { tx, head })
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
        let mut tx = self.pool.begin().await?;
        sqlx::query("SET TRANSACTION ISOLATION LEVEL REPEATABLE READ, READ ONLY")
            .execute(&mut *tx)
            .await?;

        let sql = format!(
            "SELECT {} FROM audit_chain_state WHERE tenant_key = $1",
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
            "SELECT {} FROM audit_events WHERE tenant_key = $1 ORDER BY seq ASC",
            EVENT_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(partition.as_str())
            .fetch_all(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(PartitionSnapshot::decode(head, &rows[..], event_from_row, |row| {
            row.try_get::<Uuid, _>("id").ok()
        }))
    }

    async fn query(&self, partition: &TenantKey, query: &AuditQuery) -> LedgerResult<AuditPage> {
        let limit = query.effective_limit();
        let offset = query.effective_offset();

        let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(format!(
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
        if let Some(start) = query.start {
            builder.push(" AND event_time >= ").push_bind(start);
        }
        if let Some(end) = query.end {
            builder.push(" AND event_time <= ").push_bind(end);
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
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
                "#,
            )
            .bind(event.id)
            .bind(partition.as_str())
            .bind(event.event_time)
            .bind(&event.actor_id)
            .bind(&event.actor_label)
            .bind(&event.resource_type)
            .bind(&event.resource_id)
            .bind(&event.action)
            .bind(&event.outcome)
            .bind(Json(&event.details))
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
