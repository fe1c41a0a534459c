//! # Configuration
//!
//! [`MessagingConfig`] gathers every configurable part of a messaging manager.
//! Every field carries a serde default, so an empty source yields a working
//! in-memory setup.
//!
//! Sources are layered, later ones overriding earlier ones:
//!
//! 1. `config/switchyard.{toml,yaml,json}` in the working directory, if present
//! 2. An explicit file passed to [`MessagingConfig::load`]; it must exist
//! 3. Environment variables prefixed `SWITCHYARD__` with `__` between keys,
//!    e.g. `SWITCHYARD__BACKEND__DLQ_SUFFIX=.dead`

use crate::backend::{BackendConfig, BindingConfig, ExchangeConfig, QueueConfig};
use crate::dlq::{DlqConfig, DlqPolicy};
use crate::error::ConfigurationError;
use crate::manager::ManagerConfig;
use crate::message::validate_name;
use crate::routing::{RouterConfig, RoutingRule, RoutingType};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use tracing::{debug, info};

/// Prefix of environment variable overrides
pub const ENV_PREFIX: &str = "SWITCHYARD";

/// Default file looked up in the working directory, without extension
pub const DEFAULT_CONFIG_FILE: &str = "config/switchyard";

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;

/// Complete messaging configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MessagingConfig {
    pub backend: BackendConfig,
    pub routing: RoutingConfig,
    pub dlq: DlqConfig,
    pub manager: ManagerConfig,
    pub topology: TopologyConfig,
}

/// Default routing engine settings and its declarative rules
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RoutingConfig {
    pub router: RouterConfig,
    pub rules: Vec<RoutingRule>,
}

/// Queues, exchanges and bindings declared when the manager starts
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TopologyConfig {
    pub exchanges: Vec<ExchangeConfig>,
    pub queues: Vec<QueueConfig>,
    pub bindings: Vec<BindingConfig>,
}

impl TopologyConfig {
    pub fn is_empty(&self) -> bool {
        self.exchanges.is_empty() && self.queues.is_empty() && self.bindings.is_empty()
    }
}

impl MessagingConfig {
    /// Load from the default file, `path` and the environment, then validate
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigurationError> {
        Self::load_with_env(
            path,
            config::Environment::with_prefix(ENV_PREFIX)
                .separator("__")
                .try_parsing(true),
        )
    }

    pub(crate) fn load_with_env(
        path: Option<&Path>,
        environment: config::Environment,
    ) -> Result<Self, ConfigurationError> {
        let mut builder = config::Config::builder()
            .add_source(config::File::with_name(DEFAULT_CONFIG_FILE).required(false));

        if let Some(path) = path {
            info!(path = %path.display(), "Loading messaging configuration");
            builder = builder.add_source(config::File::from(path).required(true));
        }

        let config = builder
            .add_source(environment)
            .build()
            .map_err(|e| ConfigurationError::Parsing {
                message: e.to_string(),
            })?;

        let loaded: Self = config
            .try_deserialize()
            .map_err(|e| ConfigurationError::Parsing {
                message: e.to_string(),
            })?;
        loaded.validate()?;

        debug!(
            backend = %loaded.backend.backend_type,
            rules = loaded.routing.rules.len(),
            queues = loaded.topology.queues.len(),
            "Messaging configuration loaded"
        );
        Ok(loaded)
    }

    /// Parse a TOML document and validate it
    pub fn from_toml(document: &str) -> Result<Self, ConfigurationError> {
        let loaded: Self = config::Config::builder()
            .add_source(config::File::from_str(document, config::FileFormat::Toml))
            .build()
            .and_then(|config| config.try_deserialize())
            .map_err(|e| ConfigurationError::Parsing {
                message: e.to_string(),
            })?;
        loaded.validate()?;
        Ok(loaded)
    }

    /// Check settings that serde cannot express
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        self.validate_backend()?;
        self.validate_routing()?;
        self.validate_dlq()?;
        self.manager.validate()?;
        self.validate_topology()
    }

    fn validate_backend(&self) -> Result<(), ConfigurationError> {
        if self.backend.dlq_suffix.is_empty() {
            return Err(ConfigurationError::Missing {
                key: "backend.dlq_suffix".to_string(),
            });
        }
        if self.backend.connect_timeout_seconds == 0 {
            return Err(invalid("backend.connect_timeout_seconds must be greater than zero"));
        }
        if self.backend.memory.max_queue_size == 0 {
            return Err(invalid("backend.memory.max_queue_size must be greater than zero"));
        }
        Ok(())
    }

    fn validate_routing(&self) -> Result<(), ConfigurationError> {
        let router = &self.routing.router;
        if router.enable_cache && router.cache_max_size == 0 {
            return Err(invalid(
                "routing.router.cache_max_size must be greater than zero when the cache is enabled",
            ));
        }

        let mut names = HashSet::new();
        for rule in &self.routing.rules {
            if rule.name.trim().is_empty() {
                return Err(invalid("routing rules need a name"));
            }
            if !names.insert(rule.name.as_str()) {
                return Err(invalid(format!("duplicate routing rule '{}'", rule.name)));
            }
            if rule.routing_type == RoutingType::Custom {
                return Err(invalid(format!(
                    "routing rule '{}' is custom; custom routers are attached in code",
                    rule.name
                )));
            }
        }
        Ok(())
    }

    fn validate_dlq(&self) -> Result<(), ConfigurationError> {
        self.dlq.validate()?;
        if self.dlq.policy == DlqPolicy::CustomHandler {
            debug!("DLQ custom handler policy selected; a handler must be supplied in code");
        }
        Ok(())
    }

    fn validate_topology(&self) -> Result<(), ConfigurationError> {
        let topology = &self.topology;
        for queue in &topology.queues {
            validate_name("topology.queues.name", &queue.name).map_err(|e| invalid(e.to_string()))?;
        }
        for exchange in &topology.exchanges {
            validate_name("topology.exchanges.name", &exchange.name)
                .map_err(|e| invalid(e.to_string()))?;
        }
        for binding in &topology.bindings {
            validate_name("topology.bindings.queue", &binding.queue)
                .map_err(|e| invalid(e.to_string()))?;
            validate_name("topology.bindings.exchange", &binding.exchange)
                .map_err(|e| invalid(e.to_string()))?;
        }
        Ok(())
    }
}

fn invalid(message: impl Into<String>) -> ConfigurationError {
    ConfigurationError::Invalid {
        message: message.into(),
    }
}
