use crate::{env_or_default, env_parse_or, ConfigError, FromEnv};
use std::net::Ipv4Addr;

/// Listener for the supervisor's health and metrics endpoints
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HealthServerConfig {
    pub host: String,
    pub port: u16,
}

impl HealthServerConfig {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Get the server address as "host:port"
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl FromEnv for HealthServerConfig {
    /// - TASKWORKER_HEALTH_HOST: defaults to 0.0.0.0
    /// - TASKWORKER_HEALTH_PORT: falls back to HEALTH_PORT, then 8082
    fn from_env() -> Result<Self, ConfigError> {
        let host = env_or_default("TASKWORKER_HEALTH_HOST", &Ipv4Addr::UNSPECIFIED.to_string());
        let fallback = env_parse_or("HEALTH_PORT", 8082u16)?;
        let port = env_parse_or("TASKWORKER_HEALTH_PORT", fallback)?;

        Ok(Self { host, port })
    }
}

impl Default for HealthServerConfig {
    fn default() -> Self {
        Self {
            host: Ipv4Addr::UNSPECIFIED.to_string(),
            port: 8082,
        }
    }
}
