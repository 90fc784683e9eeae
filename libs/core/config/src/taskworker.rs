use crate::{env_optional, env_or_default, env_parse_or, ConfigError, FromEnv};
use std::path::PathBuf;

/// Static settings for a taskworker process, read once at startup.
///
/// | Variable | Default |
/// |---|---|
/// | `TASKWORKER_BROKER_HOSTS` | `http://127.0.0.1:50051` (comma-separated) |
/// | `TASKWORKER_RPC_SECRET` | unset |
/// | `TASKWORKER_ROUTES` | unset (JSON object namespace → topic) |
/// | `SILO_MODE` | `monolith` |
/// | `TASKWORKER_HEALTH_CHECK_FILE` | unset |
/// | `TASKWORKER_REDIS_URL` | unset (in-memory dedup) |
/// | `TASKWORKER_NAMESPACE` | unset (all namespaces) |
/// | `TASKWORKER_CONCURRENCY` | `4` |
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TaskworkerSettings {
    pub broker_hosts: Vec<String>,
    pub rpc_secret: Option<String>,
    /// Raw JSON; parsed by the router so malformed input degrades instead of failing here.
    pub routes_json: Option<String>,
    pub silo_mode: String,
    pub health_check_file: Option<PathBuf>,
    pub redis_url: Option<String>,
    pub namespace: Option<String>,
    pub concurrency: usize,
}

impl Default for TaskworkerSettings {
    fn default() -> Self {
        Self {
            broker_hosts: vec!["http://127.0.0.1:50051".to_string()],
            rpc_secret: None,
            routes_json: None,
            silo_mode: "monolith".to_string(),
            health_check_file: None,
            redis_url: None,
            namespace: None,
            concurrency: 4,
        }
    }
}

impl TaskworkerSettings {
    pub fn with_broker_hosts(mut self, hosts: Vec<String>) -> Self {
        self.broker_hosts = hosts;
        self
    }

    pub fn with_rpc_secret(mut self, secret: impl Into<String>) -> Self {
        self.rpc_secret = Some(secret.into());
        self
    }

    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }
}

/// Split a comma-separated host list, dropping blanks.
pub fn parse_host_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|host| !host.is_empty())
        .map(str::to_string)
        .collect()
}

impl FromEnv for TaskworkerSettings {
    fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let broker_hosts = match env_optional("TASKWORKER_BROKER_HOSTS") {
            Some(raw) => {
                let hosts = parse_host_list(&raw);
                if hosts.is_empty() {
                    return Err(ConfigError::ParseError {
                        key: "TASKWORKER_BROKER_HOSTS".to_string(),
                        details: "no broker host listed".to_string(),
                    });
                }
                hosts
            }
            None => defaults.broker_hosts,
        };

        let concurrency = env_parse_or("TASKWORKER_CONCURRENCY", defaults.concurrency)?;
        if concurrency == 0 {
            return Err(ConfigError::ParseError {
                key: "TASKWORKER_CONCURRENCY".to_string(),
                details: "must be at least 1".to_string(),
            });
        }

        Ok(Self {
            broker_hosts,
            rpc_secret: env_optional("TASKWORKER_RPC_SECRET"),
            routes_json: env_optional("TASKWORKER_ROUTES"),
            silo_mode: env_or_default("SILO_MODE", &defaults.silo_mode),
            health_check_file: env_optional("TASKWORKER_HEALTH_CHECK_FILE").map(PathBuf::from),
            redis_url: env_optional("TASKWORKER_REDIS_URL"),
            namespace: env_optional("TASKWORKER_NAMESPACE"),
            concurrency,
        })
    }
}
