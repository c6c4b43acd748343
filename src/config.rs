use serde::{Deserialize, Serialize};
use std::env;
use std::path::Path;
use std::time::Duration;

use crate::error::{LedgerError, LedgerResult};

/// Largest accepted base delay between retried appends.
pub const MAX_APPEND_BACKOFF_MS: u64 = 60_000;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub database_url: String,
    pub server_host: String,
    pub server_port: u16,
    pub export_dir: String,
    pub store: StoreConfig,
    pub ledger: LedgerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    pub max_connections: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerConfig {
    /// Upper bound on waiting for a partition lock.
    pub lock_timeout_ms: u64,
    pub append_max_attempts: u32,
    /// Base delay between retried appends; doubles per attempt.
    pub append_backoff_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self { max_connections: 10 }
    }
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            lock_timeout_ms: 5_000,
            append_max_attempts: 3,
            append_backoff_ms: 50,
        }
    }
}

impl LedgerConfig {
    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database_url: "sqlite://audit-ledger.db".to_string(),
            server_host: "0.0.0.0".to_string(),
            server_port: 3000,
            export_dir: "exports".to_string(),
            store: StoreConfig::default(),
            ledger: LedgerConfig::default(),
        }
    }
}

impl AppConfig {
    /// Load from `ledger.toml` (if present) and the environment
    pub fn load() -> LedgerResult<Self> {
        Self::load_from(None)
    }

    /// Load with an explicit config file, which must then exist
    pub fn load_from(path: Option<&Path>) -> LedgerResult<Self> {
        let defaults = AppConfig::default();

        let file_source = match path {
            Some(path) => config::File::from(path).required(true),
            None => config::File::with_name("ledger").required(false),
        };

        let settings = config::Config::builder()
            .set_default("database_url", defaults.database_url)?
            .set_default("server_host", defaults.server_host)?
            .set_default("server_port", i64::from(defaults.server_port))?
            .set_default("export_dir", defaults.export_dir)?
            .set_default("store.max_connections", i64::from(defaults.store.max_connections))?
            .set_default("ledger.lock_timeout_ms", defaults.ledger.lock_timeout_ms as i64)?
            .set_default("ledger.append_max_attempts", i64::from(defaults.ledger.append_max_attempts))?
            .set_default("ledger.append_backoff_ms", defaults.ledger.append_backoff_ms as i64)?
            .add_source(file_source)
            .add_source(
                config::Environment::with_prefix("LEDGER")
                    .prefix_separator("__")
                    .separator("__"),
            )
            .build()?;

        let mut app_config: AppConfig = settings.try_deserialize()?;

        // DATABASE_URL wins only when nothing more specific was given
        if env::var("LEDGER__DATABASE_URL").is_err() {
            if let Ok(url) = env::var("DATABASE_URL") {
                app_config.database_url = url;
            }
        }

        app_config.validate()?;
        Ok(app_config)
    }

    pub fn validate(&self) -> LedgerResult<()> {
        if self.database_url.trim().is_empty() {
            return Err(LedgerError::Config("database_url must be set".to_string()));
        }
        if self.store.max_connections == 0 {
            return Err(LedgerError::Config(
                "store.max_connections must be at least 1".to_string(),
            ));
        }
        if self.ledger.lock_timeout_ms == 0 {
            return Err(LedgerError::Config(
                "ledger.lock_timeout_ms must be positive".to_string(),
            ));
        }
        if self.ledger.append_max_attempts == 0 {
            return Err(LedgerError::Config(
                "ledger.append_max_attempts must be at least 1".to_string(),
            ));
        }
        if self.ledger.append_backoff_ms > MAX_APPEND_BACKOFF_MS {
            return Err(LedgerError::Config(format!(
                "ledger.append_backoff_ms must not exceed {}",
                MAX_APPEND_BACKOFF_MS
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config_is_valid() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.ledger.lock_timeout(), Duration::from_millis(5_000));
    }

    #[test]
    fn test_validation_rejects_zero_values() {
        let mut config = AppConfig::default();
        config.ledger.append_max_attempts = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.store.max_connections = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.ledger.lock_timeout_ms = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_caps_append_backoff() {
        let mut config = AppConfig::default();
        config.ledger.append_backoff_ms = MAX_APPEND_BACKOFF_MS;
        assert!(config.validate().is_ok());

        config.ledger.append_backoff_ms = u64::MAX;
        assert!(matches!(config.validate(), Err(LedgerError::Config(_))));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ledger.toml");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(
            file,
            "server_port = 8088\nexport_dir = \"/var/exports\"\n\n[ledger]\nlock_timeout_ms = 750\n"
        )
        .unwrap();

        let config = AppConfig::load_from(Some(&path)).unwrap();
        assert_eq!(config.server_port, 8088);
        assert_eq!(config.export_dir, "/var/exports");
        assert_eq!(config.ledger.lock_timeout_ms, 750);
        // untouched keys keep their defaults
        assert_eq!(config.ledger.append_max_attempts, 3);
        assert_eq!(config.store.max_connections, 10);
    }

    #[test]
    fn test_missing_explicit_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.toml");
        assert!(matches!(
            AppConfig::load_from(Some(&path)),
            Err(LedgerError::Config(_))
        ));
    }
}
