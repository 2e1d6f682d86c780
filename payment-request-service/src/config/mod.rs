//! Configuration module for payment-request-service.

use service_core::config as core_config;
use service_core::error::AppError;
use std::env;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct PaymentRequestConfig {
    pub common: core_config::Config,
    pub service_name: String,
    pub service_version: String,
    pub log_level: String,
    pub otlp_endpoint: Option<String>,
    pub database: DatabaseConfig,
    pub ledger: LedgerConfig,
}

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
}

#[derive(Debug, Clone)]
pub struct LedgerConfig {
    /// Upper bound on a single ledger call, in seconds.
    pub timeout_secs: u64,
}

impl LedgerConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self { timeout_secs: 30 }
    }
}

impl PaymentRequestConfig {
    pub fn from_env() -> Result<Self, AppError> {
        let common = core_config::Config::load()?;

        let timeout_secs = match env::var("LEDGER_TIMEOUT_SECS") {
            Ok(raw) => raw.parse::<u64>().ok().filter(|s| *s > 0).ok_or_else(|| {
                AppError::ConfigError(anyhow::anyhow!(
                    "LEDGER_TIMEOUT_SECS must be a positive integer, got '{}'",
                    raw
                ))
            })?,
            Err(_) => LedgerConfig::default().timeout_secs,
        };

        Ok(Self {
            common,
            service_name: env::var("SERVICE_NAME")
                .unwrap_or_else(|_| "payment-request-service".to_string()),
            service_version: env::var("SERVICE_VERSION")
                .unwrap_or_else(|_| env!("CARGO_PKG_VERSION").to_string()),
            log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            otlp_endpoint: env::var("OTLP_ENDPOINT").ok(),
            database: DatabaseConfig {
                url: env::var("DATABASE_URL").map_err(|_| {
                    AppError::ConfigError(anyhow::anyhow!("DATABASE_URL is required"))
                })?,
                max_connections: env::var("DATABASE_MAX_CONNECTIONS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(10),
                min_connections: env::var("DATABASE_MIN_CONNECTIONS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(2),
            },
            ledger: LedgerConfig { timeout_secs },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ledger_timeout_default() {
        let ledger = LedgerConfig::default();
        assert_eq!(ledger.timeout(), Duration::from_secs(30));
    }
}
