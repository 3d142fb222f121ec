//! Service configuration
//!
//! Values come from, in increasing precedence: built-in defaults, an
//! optional TOML file, then `FOUNDRY_*` environment variables. Command-line
//! flags are applied by the binary on top of the result.
//!
//! ```toml
//! [queue]
//! max_retries = 3
//! stale_after_secs = 60
//!
//! [worker]
//! workers = 4
//!
//! [store]
//! backend = "rocksdb"
//! path = "./foundry-data"
//!
//! [debate]
//! max_rounds = 3
//!
//! # Replaces the built-in pairings entirely when present.
//! [collaboration.strategies.bug_fix]
//! leader = "claude-sonnet"
//! assistant = "gemini-3-pro"
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::agents::{AgentDescriptor, AgentRegistry, RegistryError};
use crate::debate::{validate_participants, Participant, DEFAULT_MAX_ROUNDS, MIN_ROUNDS};
use crate::queue::{BackoffPolicy, QueueConfig};
use crate::router::ClassifierKeywords;
use crate::workflow::{CollaborationStrategy, OrchestratorConfig};

/// Error type for configuration loading
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("Invalid value for {field}: {reason}")]
    Invalid { field: String, reason: String },

    #[error(transparent)]
    Registry(#[from] RegistryError),
}

pub type ConfigResult<T> = Result<T, ConfigError>;

fn invalid(field: &str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        field: field.to_string(),
        reason: reason.into(),
    }
}

// ============================================================================
// Sections
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueSection {
    pub max_retries: u32,
    pub stale_after_secs: u64,
    pub cleanup_interval_secs: u64,
    pub retention_secs: u64,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    /// Step time budget for tasks without their own timeout
    pub default_timeout_secs: u64,
}

impl Default for QueueSection {
    fn default() -> Self {
        let queue = QueueConfig::default();
        Self {
            max_retries: queue.max_retries,
            stale_after_secs: queue.stale_after.as_secs(),
            cleanup_interval_secs: queue.cleanup_interval.as_secs(),
            retention_secs: queue.retention.as_secs(),
            backoff_base_ms: queue.backoff.base.as_millis() as u64,
            backoff_max_ms: queue.backoff.max.as_millis() as u64,
            default_timeout_secs: 300,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerSection {
    pub workers: usize,
    pub poll_interval_ms: u64,
    pub heartbeat_interval_ms: u64,
}

impl Default for WorkerSection {
    fn default() -> Self {
        Self {
            workers: 4,
            poll_interval_ms: 500,
            heartbeat_interval_ms: 10_000,
        }
    }
}

/// Which task store backs the queue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreBackend {
    #[default]
    Memory,
    Rocksdb,
}

impl std::str::FromStr for StoreBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "memory" => Ok(Self::Memory),
            "rocksdb" | "rocks" => Ok(Self::Rocksdb),
            other => Err(format!("unknown store backend: {}", other)),
        }
    }
}

impl std::fmt::Display for StoreBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Memory => write!(f, "memory"),
            Self::Rocksdb => write!(f, "rocksdb"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreSection {
    pub backend: StoreBackend,
    pub path: PathBuf,
}

impl Default for StoreSection {
    fn default() -> Self {
        Self {
            backend: StoreBackend::Memory,
            path: PathBuf::from("foundry-data"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DebateSection {
    pub max_rounds: u32,
    pub participants: Vec<Participant>,
    /// Model that writes the final synthesis. Unset: assembled from the
    /// transcript without a model call.
    pub coordinator_model: Option<String>,
}

impl Default for DebateSection {
    fn default() -> Self {
        Self {
            max_rounds: DEFAULT_MAX_ROUNDS,
            participants: Participant::default_panel(),
            coordinator_model: None,
        }
    }
}

/// Leader/assistant pairings, keyed by step action
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CollaborationSection {
    pub enabled: bool,
    pub strategies: BTreeMap<String, CollaborationStrategy>,
}

impl Default for CollaborationSection {
    fn default() -> Self {
        Self {
            enabled: true,
            strategies: CollaborationStrategy::defaults(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentsSection {
    /// Roles registered in addition to the standard eight
    pub descriptors: Vec<AgentDescriptor>,
    /// Extra task-type → role routes
    pub task_types: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderSection {
    /// OpenAI-compatible endpoint. Unset: no real provider, every model
    /// call reports unavailable.
    pub base_url: Option<String>,
    /// Name of the environment variable holding the API key
    pub api_key_env: String,
    pub timeout_secs: u64,
}

impl Default for ProviderSection {
    fn default() -> Self {
        Self {
            base_url: None,
            api_key_env: "FOUNDRY_API_KEY".to_string(),
            timeout_secs: 120,
        }
    }
}

impl ProviderSection {
    /// Read the API key from the configured variable
    pub fn api_key(&self) -> Option<String> {
        std::env::var(&self.api_key_env)
            .ok()
            .filter(|k| !k.trim().is_empty())
    }
}

// ============================================================================
// FoundryConfig
// ============================================================================

/// Complete service configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FoundryConfig {
    pub queue: QueueSection,
    pub worker: WorkerSection,
    pub store: StoreSection,
    pub debate: DebateSection,
    pub collaboration: CollaborationSection,
    pub classifier: ClassifierKeywords,
    pub agents: AgentsSection,
    pub provider: ProviderSection,
}

impl FoundryConfig {
    /// Parse a TOML document
    pub fn from_toml_str(text: &str, origin: &Path) -> ConfigResult<Self> {
        toml::from_str(text).map_err(|source| ConfigError::Parse {
            path: origin.to_path_buf(),
            source,
        })
    }

    /// Read and parse a TOML file
    pub fn from_file(path: &Path) -> ConfigResult<Self> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text, path)
    }

    /// Defaults or `path`, then environment overrides, then validation
    pub fn load(path: Option<&Path>) -> ConfigResult<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `FOUNDRY_*` environment variables
    pub fn apply_env_overrides(&mut self) -> ConfigResult<()> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides from any key lookup. Unparseable numbers are errors,
    /// not silently ignored.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> ConfigResult<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        fn number<T: std::str::FromStr>(key: &str, value: &str) -> ConfigResult<T> {
            value
                .trim()
                .parse()
                .map_err(|_| invalid(key, format!("not a number: {}", value)))
        }

        if let Some(v) = lookup("FOUNDRY_MAX_RETRIES") {
            self.queue.max_retries = number("FOUNDRY_MAX_RETRIES", &v)?;
        }
        if let Some(v) = lookup("FOUNDRY_STALE_AFTER_SECS") {
            self.queue.stale_after_secs = number("FOUNDRY_STALE_AFTER_SECS", &v)?;
        }
        if let Some(v) = lookup("FOUNDRY_RETENTION_SECS") {
            self.queue.retention_secs = number("FOUNDRY_RETENTION_SECS", &v)?;
        }
        if let Some(v) = lookup("FOUNDRY_DEFAULT_TIMEOUT_SECS") {
            self.queue.default_timeout_secs = number("FOUNDRY_DEFAULT_TIMEOUT_SECS", &v)?;
        }
        if let Some(v) = lookup("FOUNDRY_WORKERS") {
            self.worker.workers = number("FOUNDRY_WORKERS", &v)?;
        }
        if let Some(v) = lookup("FOUNDRY_STORE") {
            self.store.backend = v
                .parse()
                .map_err(|reason: String| invalid("FOUNDRY_STORE", reason))?;
        }
        if let Some(v) = lookup("FOUNDRY_STORE_PATH") {
            self.store.path = PathBuf::from(v);
        }
        if let Some(v) = lookup("FOUNDRY_DEBATE_ROUNDS") {
            self.debate.max_rounds = number("FOUNDRY_DEBATE_ROUNDS", &v)?;
        }
        if let Some(v) = lookup("FOUNDRY_COORDINATOR_MODEL") {
            self.debate.coordinator_model = Some(v).filter(|m| !m.trim().is_empty());
        }
        if let Some(v) = lookup("FOUNDRY_COLLABORATION") {
            self.collaboration.enabled = match v.trim().to_ascii_lowercase().as_str() {
                "1" | "true" | "on" => true,
                "0" | "false" | "off" => false,
                _ => return Err(invalid("FOUNDRY_COLLABORATION", format!("not a flag: {}", v))),
            };
        }
        if let Some(v) = lookup("FOUNDRY_PROVIDER_URL") {
            self.provider.base_url = Some(v).filter(|u| !u.trim().is_empty());
        }
        if let Some(v) = lookup("FOUNDRY_PROVIDER_TIMEOUT_SECS") {
            self.provider.timeout_secs = number("FOUNDRY_PROVIDER_TIMEOUT_SECS", &v)?;
        }
        Ok(())
    }

    /// Reject values the service cannot run with
    pub fn validate(&self) -> ConfigResult<()> {
        if self.queue.stale_after_secs == 0 {
            return Err(invalid("queue.stale_after_secs", "must be positive"));
        }
        if self.queue.cleanup_interval_secs == 0 {
            return Err(invalid("queue.cleanup_interval_secs", "must be positive"));
        }
        if self.queue.backoff_base_ms > self.queue.backoff_max_ms {
            return Err(invalid(
                "queue.backoff_base_ms",
                "must not exceed queue.backoff_max_ms",
            ));
        }
        if self.queue.default_timeout_secs == 0 {
            return Err(invalid("queue.default_timeout_secs", "must be positive"));
        }
        if self.worker.workers == 0 {
            return Err(invalid("worker.workers", "at least one worker is required"));
        }
        if self.worker.poll_interval_ms == 0 {
            return Err(invalid("worker.poll_interval_ms", "must be positive"));
        }
        if self.worker.heartbeat_interval_ms == 0 {
            return Err(invalid("worker.heartbeat_interval_ms", "must be positive"));
        }
        // A claim must be refreshed well before it goes stale.
        if self.worker.heartbeat_interval_ms >= self.queue.stale_after_secs * 1000 {
            return Err(invalid(
                "worker.heartbeat_interval_ms",
                "must be shorter than queue.stale_after_secs",
            ));
        }
        if self.debate.max_rounds < MIN_ROUNDS {
            return Err(invalid(
                "debate.max_rounds",
                format!("must be at least {}", MIN_ROUNDS),
            ));
        }
        validate_participants(&self.debate.participants)
            .map_err(|reason| invalid("debate.participants", reason))?;
        for (action, strategy) in &self.collaboration.strategies {
            if strategy.leader.trim().is_empty() || strategy.assistant.trim().is_empty() {
                return Err(invalid(
                    &format!("collaboration.strategies.{}", action),
                    "leader and assistant models are required",
                ));
            }
        }
        if self.provider.timeout_secs == 0 {
            return Err(invalid("provider.timeout_secs", "must be positive"));
        }
        if self.store.backend == StoreBackend::Rocksdb
            && self.store.path.as_os_str().is_empty()
        {
            return Err(invalid("store.path", "required for the rocksdb backend"));
        }
        Ok(())
    }

    pub fn queue_config(&self) -> QueueConfig {
        QueueConfig {
            max_retries: self.queue.max_retries,
            stale_after: Duration::from_secs(self.queue.stale_after_secs),
            cleanup_interval: Duration::from_secs(self.queue.cleanup_interval_secs),
            retention: Duration::from_secs(self.queue.retention_secs),
            backoff: BackoffPolicy {
                base: Duration::from_millis(self.queue.backoff_base_ms),
                max: Duration::from_millis(self.queue.backoff_max_ms),
            },
        }
    }

    pub fn orchestrator_config(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            poll_interval: Duration::from_millis(self.worker.poll_interval_ms),
            heartbeat_interval: Duration::from_millis(self.worker.heartbeat_interval_ms),
            default_step_timeout: Duration::from_secs(self.queue.default_timeout_secs),
            debate_participants: self.debate.participants.clone(),
            debate_rounds: self.debate.max_rounds,
            collaboration: if self.collaboration.enabled {
                self.collaboration.strategies.clone()
            } else {
                BTreeMap::new()
            },
        }
    }

    /// Standard roles plus the configured extras
    pub fn agent_registry(&self) -> ConfigResult<AgentRegistry> {
        let mut registry = AgentRegistry::with_defaults();
        for descriptor in &self.agents.descriptors {
            registry.register(descriptor.clone())?;
        }
        for (task_type, role) in &self.agents.task_types {
            if !registry.contains(role) {
                return Err(invalid(
                    &format!("agents.task_types.{}", task_type),
                    format!("unknown role {}", role),
                ));
            }
            registry.map_task_type(task_type, role);
        }
        Ok(registry)
    }

    /// Render as TOML
    pub fn to_toml(&self) -> Result<String, toml::ser::Error> {
        toml::to_string_pretty(self)
    }
}
