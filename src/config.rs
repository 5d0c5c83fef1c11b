// ABOUTME: TOML configuration for the importer binary
// ABOUTME: Proxy endpoint, target connection and import options, with env overrides for secrets

use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

use crate::error::{ImporterError, Result};
use crate::import::ImportOptions;
use crate::remote::ConnectionDescriptor;

pub const PASSWORD_ENV: &str = "PGDUMP_IMPORT_PASSWORD";
pub const API_KEY_ENV: &str = "PGDUMP_PROXY_API_KEY";

#[derive(Debug, Clone, Deserialize)]
pub struct ProxyConfig {
    pub url: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    pub api_key: Option<String>,
}

fn default_timeout_secs() -> u64 {
    90
}

impl ProxyConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ImporterConfig {
    pub proxy: ProxyConfig,
    pub connection: ConnectionDescriptor,
    #[serde(default)]
    pub import: ImportOptions,
}

impl ImporterConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            ImporterError::Config(format!("Failed to read {}: {}", path.display(), e))
        })?;
        let mut config = Self::from_toml(&raw)?;
        config.apply_env(|key| std::env::var(key).ok());
        config.import.validate()?;
        Ok(config)
    }

    pub fn from_toml(raw: &str) -> Result<Self> {
        toml::from_str(raw).map_err(|e| ImporterError::Config(e.to_string()))
    }

    /// Secrets from the environment win over the file.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(password) = lookup(PASSWORD_ENV) {
            self.connection.password = password;
        }
        if let Some(key) = lookup(API_KEY_ENV) {
            self.proxy.api_key = Some(key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::import::ExecutionOrder;
    use std::io::Write;

    const SAMPLE: &str = r#"
        [proxy]
        url = "https://proxy.example.com/functions/v1/execute-sql-external"

        [connection]
        host = "db.example.com"
        database = "logistics"
        user = "importer"
        password = "from-file"
        ssl = true

        [import]
        batch_size = 250
        execution_order = "file-order"
    "#;

    #[test]
    fn test_parses_sample() {
        let config = ImporterConfig::from_toml(SAMPLE).unwrap();
        assert_eq!(config.proxy.timeout(), Duration::from_secs(90));
        assert_eq!(config.connection.port, 5432);
        assert!(config.connection.ssl);
        assert_eq!(config.import.batch_size, 250);
        assert_eq!(config.import.execution_order, ExecutionOrder::FileOrder);
        assert!(config.import.use_transactions);
    }

    #[test]
    fn test_env_overrides_secrets() {
        let mut config = ImporterConfig::from_toml(SAMPLE).unwrap();
        config.apply_env(|key| match key {
            PASSWORD_ENV => Some("from-env".to_string()),
            API_KEY_ENV => Some("key".to_string()),
            _ => None,
        });
        assert_eq!(config.connection.password, "from-env");
        assert_eq!(config.proxy.api_key.as_deref(), Some("key"));
    }

    #[test]
    fn test_load_rejects_zero_batch_size() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            "{}",
            SAMPLE.replace("batch_size = 250", "batch_size = 0")
        )
        .unwrap();
        assert!(matches!(
            ImporterConfig::load(file.path()),
            Err(ImporterError::InvalidOptions(_))
        ));
    }

    #[test]
    fn test_missing_connection_is_config_error() {
        let err = ImporterConfig::from_toml("[proxy]\nurl = \"http://x\"\n").unwrap_err();
        assert!(matches!(err, ImporterError::Config(_)));
    }
}
