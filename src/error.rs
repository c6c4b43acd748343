use thiserror::Error;

use crate::store::immutability;

impl From<serde_json::Error> for LedgerError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(format!("JSON serialization error: {}", err))
    }
}

impl From<sqlx::Error> for LedgerError {
    fn from(err: sqlx::Error) -> Self {
        immutability::classify(err)
    }
}

impl From<sqlx::migrate::MigrateError> for LedgerError {
    fn from(err: sqlx::migrate::MigrateError) -> Self {
        Self::Database(format!("Migration failed: {}", err))
    }
}

impl From<config::ConfigError> for LedgerError {
    fn from(err: config::ConfigError) -> Self {
        Self::Config(err.to_string())
    }
}

impl From<std::io::Error> for LedgerError {
    fn from(err: std::io::Error) -> Self {
        Self::Export(format!("I/O error: {}", err))
    }
}

#[derive(Error, Debug)]
pub enum LedgerError {
    /// An update or delete reached a committed audit event.
    #[error("Immutable ledger violation: {0}")]
    ImmutableLedgerViolation(String),

    #[error("Unknown partition: {0}")]
    UnknownPartition(String),

    /// The per-partition lock was not acquired in time. Safe to retry.
    #[error("Lock timeout: {0}")]
    LockTimeout(String),

    #[error("Invalid audit event: {0}")]
    InvalidEvent(String),

    /// The store is missing its immutability triggers.
    #[error("Immutability enforcement missing: {0}")]
    EnforcementMissing(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Export error: {0}")]
    Export(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl LedgerError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::LockTimeout(_))
    }

    pub fn lock_timeout(partition: &str, waited_ms: u64) -> Self {
        Self::LockTimeout(format!(
            "partition {} lock not acquired within {}ms",
            partition, waited_ms
        ))
    }

    pub fn unknown_partition(raw: &str) -> Self {
        Self::UnknownPartition(format!(
            "tenant key {:?} is not a valid tenant identifier",
            raw
        ))
    }
}

pub type LedgerResult<T> = Result<T, LedgerError>;
