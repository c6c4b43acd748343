#![allow(dead_code)]

use std::time::Duration;
use tempfile::TempDir;
use uuid::Uuid;

use audit_ledger::config::{LedgerConfig, StoreConfig};
use audit_ledger::store::SqliteLedgerStore;
use audit_ledger::{Ledger, LedgerStore, NewAuditEvent, TenantKey};

pub const TENANT_A: &str = "6f9619ff-8b86-d011-b42d-00c04fc964ff";
pub const TENANT_B: &str = "7c9e6679-7425-40de-944b-e07fc1f90ae7";

/// A SQLite-backed ledger in a temporary directory.
pub struct TestLedger {
    pub ledger: Ledger<SqliteLedgerStore>,
    pub url: String,
    pub dir: TempDir,
}

impl TestLedger {
    pub fn store(&self) -> &SqliteLedgerStore {
        self.ledger.store()
    }

    pub fn pool(&self) -> &sqlx::SqlitePool {
        self.ledger.store().pool()
    }
}

pub fn test_ledger_config() -> LedgerConfig {
    LedgerConfig {
        lock_timeout_ms: 5_000,
        append_max_attempts: 5,
        append_backoff_ms: 10,
    }
}

/// Setup a migrated, enforced SQLite ledger on a temp file
pub async fn setup_sqlite_ledger() -> TestLedger {
    let dir = tempfile::tempdir().expect("Failed to create temp dir");
    let url = format!("sqlite://{}", dir.path().join("ledger.db").display());
    let config = test_ledger_config();

    let store = SqliteLedgerStore::connect(&url, &StoreConfig { max_connections: 5 }, config.lock_timeout())
        .await
        .expect("Failed to open SQLite store");
    store.migrate().await.expect("Failed to migrate");
    store.ensure_enforced().await.expect("Triggers missing after migration");

    TestLedger {
        ledger: Ledger::new(store, config),
        url,
        dir,
    }
}

pub fn tenant(raw: &str) -> TenantKey {
    TenantKey::resolve(Some(raw)).expect("valid tenant id")
}

/// A fresh random tenant, so shared databases don't collide across runs.
pub fn random_tenant() -> String {
    Uuid::new_v4().to_string()
}

/// A patient event for `tenant_id`
pub fn patient_event(tenant_id: &str, action: &str) -> NewAuditEvent {
    NewAuditEvent::new(action, "patient")
        .tenant(tenant_id)
        .actor("u-100", "clinician@example.org")
        .resource_id("p-42")
        .request_id(format!("req-{}", Uuid::new_v4()))
        .detail("fields", 3)
}

/// Waits used by concurrency tests
pub const SHORT_WAIT: Duration = Duration::from_millis(200);
