//! Audit Ledger
//!
//! Append-only, hash-chained audit history partitioned by tenant. Every
//! write goes through [`Ledger::append`]; [`Ledger::verify`] replays the
//! chains to detect tampering.

pub mod event;
pub mod export;
pub mod gate;
pub mod hasher;
pub mod query;
pub mod verify;

use std::sync::Arc;
use tracing::info;

use crate::config::{AppConfig, LedgerConfig};
use crate::error::LedgerResult;
use crate::store::{Database, LedgerStore};

pub use event::{AuditAction, AuditEvent, ChainState, Details, NewAuditEvent, Outcome, TenantKey};
pub use export::{ExportManifest, ExportVerification};
pub use gate::{BackfillFailure, BackfillSummary};
pub use query::{AuditPage, AuditQuery};
pub use verify::{FindingKind, PartitionReport, VerificationReport};

/// Handle to the ledger over a store backend. Cheap to clone.
#[derive(Clone)]
pub struct Ledger<S> {
    store: S,
    config: Arc<LedgerConfig>,
}

impl<S: LedgerStore> Ledger<S> {
    pub fn new(store: S, config: LedgerConfig) -> Self {
        Self {
            store,
            config: Arc::new(config),
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn config(&self) -> &LedgerConfig {
        &self.config
    }
}

impl Ledger<Database> {
    /// Connect, migrate, and refuse to run without immutability enforcement.
    pub async fn open(config: &AppConfig) -> LedgerResult<Self> {
        let database = Database::connect(
            &config.database_url,
            &config.store,
            config.ledger.lock_timeout(),
        )
        .await?;
        info!(backend = database.backend_name(), "Database connected");

        database.migrate().await?;
        database.ensure_enforced().await?;
        info!("Immutability enforcement verified");

        Ok(Self::new(database, config.ledger.clone()))
    }
}
