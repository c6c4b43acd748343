pub mod config;
pub mod coverage;
pub mod error;
pub mod ledger;
pub mod logging;
pub mod server;
pub mod store;

pub use error::{LedgerError, LedgerResult};
pub use ledger::{
    AuditAction, AuditEvent, AuditPage, AuditQuery, ChainState, Ledger, NewAuditEvent, Outcome,
    TenantKey, VerificationReport,
};
pub use store::{Database, LedgerStore, MemoryLedgerStore};
