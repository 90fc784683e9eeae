//! Namespace → topic routing.
//!
//! Lookup order, first match wins:
//! 1. dynamic overrides read from the [`OptionsStore`] on every call
//! 2. the static route map parsed once from `TASKWORKER_ROUTES`
//! 3. the default topic, fixed at construction from the silo mode

use crate::constants::{CONTROL_TOPIC, DEFAULT_TOPIC, ROUTE_OVERRIDES_OPTION};
use core_config::taskworker::TaskworkerSettings;
use core_config::ConfigError;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use strum::{AsRefStr, Display, EnumString};

pub type RouteMap = HashMap<String, String>;

/// Live key-value options consulted at call time.
pub trait OptionsStore: Send + Sync {
    fn get(&self, key: &str) -> Option<Value>;
}

/// Options held in process memory, settable at runtime.
#[derive(Debug, Default)]
pub struct InMemoryOptions {
    values: RwLock<HashMap<String, Value>>,
}

impl InMemoryOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, key: impl Into<String>, value: Value) {
        let mut values = self.values.write().unwrap_or_else(|e| e.into_inner());
        values.insert(key.into(), value);
    }

    pub fn remove(&self, key: &str) -> Option<Value> {
        let mut values = self.values.write().unwrap_or_else(|e| e.into_inner());
        values.remove(key)
    }
}

impl OptionsStore for InMemoryOptions {
    fn get(&self, key: &str) -> Option<Value> {
        let values = self.values.read().unwrap_or_else(|e| e.into_inner());
        values.get(key).cloned()
    }
}

/// Parse a JSON object of namespace → topic.
pub fn parse_route_map(raw: &str) -> Result<RouteMap, ConfigError> {
    serde_json::from_str(raw).map_err(|e| ConfigError::ParseError {
        key: "TASKWORKER_ROUTES".to_string(),
        details: e.to_string(),
    })
}

/// Deployment identity of the running process.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Display, AsRefStr, EnumString)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum SiloMode {
    #[default]
    Monolith,
    Control,
    Region,
}

impl SiloMode {
    pub fn default_topic(&self) -> &'static str {
        match self {
            SiloMode::Control => CONTROL_TOPIC,
            SiloMode::Monolith | SiloMode::Region => DEFAULT_TOPIC,
        }
    }
}

pub struct Router {
    route_map: RouteMap,
    default_topic: String,
    options: Arc<dyn OptionsStore>,
}

impl std::fmt::Debug for Router {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Router")
            .field("route_map", &self.route_map)
            .field("default_topic", &self.default_topic)
            .finish_non_exhaustive()
    }
}

impl Router {
    /// Malformed `routes_json` is reported and routing continues with no
    /// static routes; it never prevents startup.
    pub fn new(routes_json: Option<&str>, silo_mode: SiloMode, options: Arc<dyn OptionsStore>) -> Self {
        let route_map = match routes_json.map(parse_route_map) {
            Some(Ok(map)) => map,
            Some(Err(e)) => {
                tracing::warn!(error = %e, "Ignoring malformed static task routes");
                RouteMap::new()
            }
            None => RouteMap::new(),
        };

        Self {
            route_map,
            default_topic: silo_mode.default_topic().to_string(),
            options,
        }
    }

    pub fn from_settings(settings: &TaskworkerSettings, options: Arc<dyn OptionsStore>) -> Self {
        let silo_mode = settings.silo_mode.parse().unwrap_or_else(|_| {
            tracing::warn!(silo_mode = %settings.silo_mode, "Unknown silo mode, assuming monolith");
            SiloMode::Monolith
        });
        Self::new(settings.routes_json.as_deref(), silo_mode, options)
    }

    pub fn route_namespace(&self, name: &str) -> String {
        if let Some(topic) = self.dynamic_override(name) {
            return topic;
        }
        if let Some(topic) = self.route_map.get(name) {
            return topic.clone();
        }
        self.default_topic.clone()
    }

    pub fn default_topic(&self) -> &str {
        &self.default_topic
    }

    fn dynamic_override(&self, name: &str) -> Option<String> {
        let overrides = self.options.get(ROUTE_OVERRIDES_OPTION)?;
        overrides.get(name)?.as_str().map(str::to_string)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn router(routes: Option<&str>, silo: SiloMode) -> (Router, Arc<InMemoryOptions>) {
        let options = Arc::new(InMemoryOptions::new());
        (Router::new(routes, silo, options.clone()), options)
    }

    #[test]
    fn test_dynamic_override_wins() {
        let (router, options) = router(Some(r#"{"examples": "static-topic"}"#), SiloMode::Region);
        assert_eq!(router.route_namespace("examples"), "static-topic");

        options.set(ROUTE_OVERRIDES_OPTION, json!({"examples": "override-topic"}));
        assert_eq!(router.route_namespace("examples"), "override-topic");

        options.remove(ROUTE_OVERRIDES_OPTION);
        assert_eq!(router.route_namespace("examples"), "static-topic");
    }

    #[test]
    fn test_default_topic_is_stable() {
        let (router, options) = router(None, SiloMode::Control);
        assert_eq!(router.route_namespace("anything"), CONTROL_TOPIC);

        // overrides for other namespaces do not leak
        options.set(ROUTE_OVERRIDES_OPTION, json!({"other": "x"}));
        for _ in 0..3 {
            assert_eq!(router.route_namespace("anything"), CONTROL_TOPIC);
        }
        assert_eq!(router.default_topic(), CONTROL_TOPIC);
    }

    #[test]
    fn test_malformed_routes_fall_back_to_default() {
        let (router, _) = router(Some("{not json"), SiloMode::Monolith);
        assert_eq!(router.route_namespace("examples"), DEFAULT_TOPIC);
        assert!(parse_route_map("{not json").is_err());
        assert!(parse_route_map(r#"["a"]"#).is_err());
    }

    #[test]
    fn test_non_string_override_is_ignored() {
        let (router, options) = router(None, SiloMode::Monolith);
        options.set(ROUTE_OVERRIDES_OPTION, json!({"examples": 42}));
        assert_eq!(router.route_namespace("examples"), DEFAULT_TOPIC);
    }

    #[test]
    fn test_silo_mode_parsing() {
        assert_eq!("CONTROL".parse::<SiloMode>().unwrap(), SiloMode::Control);
        assert_eq!("region".parse::<SiloMode>().unwrap(), SiloMode::Region);
        assert!("moon".parse::<SiloMode>().is_err());
    }

    #[test]
    fn test_from_settings() {
        let settings = TaskworkerSettings {
            silo_mode: "control".to_string(),
            routes_json: Some(r#"{"examples": "examples-topic"}"#.to_string()),
            ..TaskworkerSettings::default()
        };
        let router = Router::from_settings(&settings, Arc::new(InMemoryOptions::new()));
        assert_eq!(router.route_namespace("examples"), "examples-topic");
        assert_eq!(router.route_namespace("other"), CONTROL_TOPIC);
    }
}
