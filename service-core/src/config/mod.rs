use crate::error::AppError;
use config::{Config as Cfg, File};
use serde::Deserialize;

/// Listener settings shared by every service, read from `configuration.*`
/// and `APP__*` environment variables.
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    #[serde(default = "default_port")]
    pub port: u16,
    /// Explicit gRPC port. Falls back to `port + 1`.
    #[serde(default)]
    pub grpc_port: Option<u16>,
}

fn default_port() -> u16 {
    8080
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: default_port(),
            grpc_port: None,
        }
    }
}

impl Config {
    pub fn load() -> Result<Self, AppError> {
        dotenvy::dotenv().ok();

        let config = Cfg::builder()
            .add_source(File::with_name("configuration").required(false))
            .add_source(config::Environment::with_prefix("APP").separator("__"))
            .build()?;

        let config: Self = config.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Port for the gRPC listener. Zero stays zero so tests get an
    /// ephemeral port for both listeners.
    pub fn grpc_port(&self) -> u16 {
        match (self.grpc_port, self.port) {
            (Some(port), _) => port,
            (None, 0) => 0,
            (None, port) => port.saturating_add(1),
        }
    }

    fn validate(&self) -> Result<(), AppError> {
        if self.port != 0 && self.port == self.grpc_port() {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "HTTP and gRPC listeners cannot share port {}",
                self.port
            )));
        }
        Ok(())
    }
}
