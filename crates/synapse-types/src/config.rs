//! Process configuration for Synapse runners and correlators.
//!
//! `SynapseConfig` represents the `synapse.toml` file. Every field has a
//! default so an empty (or missing) file yields a working in-memory setup.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SynapseConfig {
    #[serde(default)]
    pub runner: RunnerConfig,
    #[serde(default)]
    pub correlator: CorrelatorConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub observability: ObservabilityConfig,
    #[serde(default)]
    pub event_bus: EventBusConfig,
}

/// Identity of the workflow instance controller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunnerConfig {
    #[serde(default = "default_runner_name")]
    pub name: String,
    #[serde(default = "default_namespace")]
    pub namespace: String,
    /// Worker reference recorded on deployed instances; the qualified
    /// runner name when empty.
    #[serde(default)]
    pub worker: String,
}

fn default_runner_name() -> String {
    "runner".to_string()
}

fn default_namespace() -> String {
    "default".to_string()
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            name: default_runner_name(),
            namespace: default_namespace(),
            worker: String::new(),
        }
    }
}

impl RunnerConfig {
    pub fn qualified_name(&self) -> String {
        format!("{}.{}", self.name, self.namespace)
    }

    pub fn worker_ref(&self) -> String {
        if self.worker.is_empty() {
            self.qualified_name()
        } else {
            self.worker.clone()
        }
    }
}

/// Identity of the correlation controller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CorrelatorConfig {
    #[serde(default = "default_correlator_name")]
    pub name: String,
    #[serde(default = "default_namespace")]
    pub namespace: String,
}

fn default_correlator_name() -> String {
    "correlator".to_string()
}

impl Default for CorrelatorConfig {
    fn default() -> Self {
        Self {
            name: default_correlator_name(),
            namespace: default_namespace(),
        }
    }
}

impl CorrelatorConfig {
    pub fn qualified_name(&self) -> String {
        format!("{}.{}", self.name, self.namespace)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// SQLite URL (e.g. `sqlite:///var/lib/synapse/synapse.db`). Empty
    /// selects the in-memory repository.
    #[serde(default)]
    pub url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_user_agent() -> String {
    "Synapse-Runtime/0.1".to_string()
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout_secs(),
            user_agent: default_user_agent(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    /// Export spans through OpenTelemetry (stdout exporter).
    #[serde(default)]
    pub otel: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventBusConfig {
    /// Capacity of the activity lifecycle broadcast channel.
    #[serde(default = "default_capacity")]
    pub capacity: usize,
}

fn default_capacity() -> usize {
    1024
}

impl Default for EventBusConfig {
    fn default() -> Self {
        Self {
            capacity: default_capacity(),
        }
    }
}
