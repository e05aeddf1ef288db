//! Orchestrator configuration.
//!
//! Loaded from YAML, then adjusted from the environment:
//!
//! | variable | field |
//! |---|---|
//! | `ORCHESTRATOR_INIT_TIMEOUT_MS` | `init_timeout` |
//! | `ORCHESTRATOR_HEALTH_INTERVAL_MS` | `health_check_interval` |
//! | `ORCHESTRATOR_BASIC_READY_TIMEOUT_MS` | `basic_ready_timeout` |
//! | `ORCHESTRATOR_EVENT_BATCH_SIZE` | `events.batch_size` |
//! | `ORCHESTRATOR_EVENT_FLUSH_MS` | `events.flush_interval` |
//! | `ORCHESTRATOR_EVENT_MAX_QUEUE` | `events.max_queue_size` |
//! | `ORCHESTRATOR_MAX_RETRIES` | `retry.max_retries` |
//!
//! Unparseable values are ignored with a warning.

use crate::events::EventGeneratorConfig;
use crate::retry::RetryPolicyConfig;
use crate::router::RouteConfig;
use crate::services::{ServiceKind, ServiceTier};
use crate::{Error, ErrorContext, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::time::Duration;

/// A service the deployment expects to be registered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceConfig {
    pub name: String,
    pub kind: ServiceKind,
    #[serde(default)]
    pub required_for_basic: bool,
    #[serde(default)]
    pub required_for_enhanced: bool,
}

impl ServiceConfig {
    pub fn tier(&self) -> ServiceTier {
        ServiceTier::new(self.required_for_basic, self.required_for_enhanced)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    pub retry: RetryPolicyConfig,
    pub events: EventGeneratorConfig,
    #[serde(rename = "init_timeout_ms", with = "crate::utils::time::duration_ms")]
    pub init_timeout: Duration,
    #[serde(
        rename = "health_check_interval_ms",
        with = "crate::utils::time::duration_ms"
    )]
    pub health_check_interval: Duration,
    #[serde(
        rename = "basic_ready_timeout_ms",
        with = "crate::utils::time::duration_ms"
    )]
    pub basic_ready_timeout: Duration,
    pub services: Vec<ServiceConfig>,
    pub routes: BTreeMap<String, RouteConfig>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicyConfig::default(),
            events: EventGeneratorConfig::default(),
            init_timeout: Duration::from_millis(5000),
            health_check_interval: Duration::from_millis(30_000),
            basic_ready_timeout: Duration::from_millis(10_000),
            services: Vec::new(),
            routes: BTreeMap::new(),
        }
    }
}

impl OrchestratorConfig {
    pub fn from_yaml_str(content: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Reads, parses, applies environment overrides, then validates.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::configuration_with_context(
                format!("failed to read config: {}", e),
                ErrorContext::new()
                    .with_details(path.display().to_string())
                    .with_source("orchestrator_config"),
            )
        })?;
        let mut config: Self = serde_yaml::from_str(&content)?;
        config.apply_env_overrides();
        config.validate()?;
        tracing::info!(
            path = %path.display(),
            services = config.services.len(),
            routes = config.routes.len(),
            "loaded orchestrator config"
        );
        Ok(config)
    }

    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides_from(|key| std::env::var(key).ok());
    }

    /// Same as [`apply_env_overrides`](Self::apply_env_overrides) with a custom lookup.
    pub fn apply_overrides_from<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let millis = |key: &str| parse_var::<u64>(&lookup, key).map(Duration::from_millis);

        if let Some(d) = millis("ORCHESTRATOR_INIT_TIMEOUT_MS") {
            self.init_timeout = d;
        }
        if let Some(d) = millis("ORCHESTRATOR_HEALTH_INTERVAL_MS") {
            self.health_check_interval = d;
        }
        if let Some(d) = millis("ORCHESTRATOR_BASIC_READY_TIMEOUT_MS") {
            self.basic_ready_timeout = d;
        }
        if let Some(d) = millis("ORCHESTRATOR_EVENT_FLUSH_MS") {
            self.events.flush_interval = d;
        }
        if let Some(n) = parse_var::<usize>(&lookup, "ORCHESTRATOR_EVENT_BATCH_SIZE") {
            self.events.batch_size = n;
        }
        if let Some(n) = parse_var::<usize>(&lookup, "ORCHESTRATOR_EVENT_MAX_QUEUE") {
            self.events.max_queue_size = n;
        }
        if let Some(n) = parse_var::<u32>(&lookup, "ORCHESTRATOR_MAX_RETRIES") {
            self.retry.max_retries = n;
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.events.batch_size == 0 {
            return Err(config_error(
                "batch size must be at least 1",
                "events.batch_size",
                None,
            ));
        }
        if self.events.max_queue_size == 0 {
            return Err(config_error(
                "event queue must hold at least 1 event",
                "events.max_queue_size",
                None,
            ));
        }

        let mut declared = HashSet::new();
        for svc in &self.services {
            if !declared.insert(svc.name.as_str()) {
                return Err(config_error(
                    format!("service '{}' is declared twice", svc.name),
                    "services",
                    None,
                ));
            }
        }

        for (name, route) in &self.routes {
            route.validate(name)?;
            for candidate in &route.candidates {
                if !declared.contains(candidate.as_str()) {
                    return Err(config_error(
                        format!("route '{}' names undeclared service '{}'", name, candidate),
                        format!("routes.{}.candidates", name),
                        Some(candidate),
                    ));
                }
            }
        }
        Ok(())
    }

    pub fn service(&self, name: &str) -> Option<&ServiceConfig> {
        self.services.iter().find(|s| s.name == name)
    }
}

fn parse_var<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
) -> Option<T> {
    let raw = lookup(key)?;
    match raw.trim().parse::<T>() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!(key, value = %raw, "ignoring unparseable override");
            None
        }
    }
}

fn config_error(
    message: impl Into<String>,
    field: impl Into<String>,
    details: Option<&str>,
) -> Error {
    let mut ctx = ErrorContext::new()
        .with_field_path(field)
        .with_source("orchestrator_config");
    if let Some(d) = details {
        ctx = ctx.with_details(d);
    }
    Error::configuration_with_context(message, ctx)
}
