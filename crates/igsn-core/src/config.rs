//! Registry configuration
//!
//! Loaded from YAML (`config/igsn.yaml` by default) with environment
//! overrides:
//!
//! - `IGSN_CONFIG`: configuration file path
//! - `IGSN_DATA_DIR`: request workspace and audit log root
//! - `IGSN_SCHEMAS_DIR`: schema file store
//!
//! Registrar passwords are never stored in the file; each allocation names
//! the environment variable holding its password in `password_env`.

use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::{IgsnError, Result};
use crate::schema::bundled_schemas_dir;
use crate::state::CompletionPolicy;
use crate::types::Allocation;

pub const CONFIG_ENV: &str = "IGSN_CONFIG";
pub const DATA_DIR_ENV: &str = "IGSN_DATA_DIR";
pub const SCHEMAS_DIR_ENV: &str = "IGSN_SCHEMAS_DIR";
pub const DEFAULT_CONFIG_PATH: &str = "config/igsn.yaml";

/// Root configuration
#[derive(Debug, Clone, Deserialize)]
pub struct RegistryConfig {
    /// Schema file store; the bundled schemas when unset.
    #[serde(default)]
    pub schemas_dir: Option<PathBuf>,
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    /// Refuse to start when any schema descriptor is broken.
    #[serde(default = "default_true")]
    pub strict_schemas: bool,
    /// Schema whose current version is sent to the registrar.
    #[serde(default = "default_registration_schema")]
    pub registration_schema: String,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub events: EventsConfig,
    #[serde(default)]
    pub registrar: RegistrarConfig,
    #[serde(default)]
    pub completion_policy: CompletionPolicy,
    #[serde(default)]
    pub allocations: Vec<AllocationConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct QueueConfig {
    #[serde(default = "default_parallel_workers")]
    pub parallel_workers: usize,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
}

impl QueueConfig {
    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            parallel_workers: default_parallel_workers(),
            max_attempts: default_max_attempts(),
            retry_backoff_ms: default_retry_backoff_ms(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct EventsConfig {
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            buffer_size: default_buffer_size(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RegistrarConfig {
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl RegistrarConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Default for RegistrarConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout_secs(),
        }
    }
}

/// Allocation as written in the configuration file.
#[derive(Debug, Clone, Deserialize)]
pub struct AllocationConfig {
    pub id: String,
    pub prefix: String,
    pub namespace: String,
    #[serde(default)]
    pub mds_url: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
    /// Environment variable holding the registrar password.
    #[serde(default)]
    pub password_env: Option<String>,
    #[serde(default)]
    pub test_mode: bool,
    #[serde(default)]
    pub landing_page_template: Option<String>,
}

impl AllocationConfig {
    /// Resolve the password from the environment.
    pub fn resolve(&self) -> Allocation {
        let password = self
            .password_env
            .as_deref()
            .and_then(|var| std::env::var(var).ok())
            .filter(|p| !p.is_empty());
        Allocation {
            id: self.id.clone(),
            prefix: self.prefix.clone(),
            namespace: self.namespace.clone(),
            mds_url: self.mds_url.clone(),
            username: self.username.clone(),
            password,
            test_mode: self.test_mode,
            landing_page_template: self.landing_page_template.clone(),
        }
    }
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("data")
}

fn default_true() -> bool {
    true
}

fn default_registration_schema() -> String {
    "igsn-registration-metadata-1.1".to_string()
}

fn default_parallel_workers() -> usize {
    4
}

fn default_max_attempts() -> u32 {
    3
}

fn default_retry_backoff_ms() -> u64 {
    500
}

fn default_buffer_size() -> usize {
    1024
}

fn default_timeout_secs() -> u64 {
    30
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            schemas_dir: None,
            data_dir: default_data_dir(),
            strict_schemas: true,
            registration_schema: default_registration_schema(),
            queue: QueueConfig::default(),
            events: EventsConfig::default(),
            registrar: RegistrarConfig::default(),
            completion_policy: CompletionPolicy::default(),
            allocations: Vec::new(),
        }
    }
}

impl RegistryConfig {
    /// Load configuration from a YAML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            IgsnError::Configuration(format!("cannot read {}: {e}", path.display()))
        })?;
        Self::from_yaml(&content)
    }

    /// Load configuration from a YAML string
    pub fn from_yaml(content: &str) -> Result<Self> {
        let config: RegistryConfig = serde_yaml::from_str(content)
            .map_err(|e| IgsnError::Configuration(format!("invalid configuration: {e}")))?;
        config.check()?;
        Ok(config)
    }

    /// Resolve from the environment: `IGSN_CONFIG` if set, else the default
    /// path if it exists, else defaults; then apply directory overrides.
    pub fn load() -> Result<Self> {
        let mut config = match std::env::var(CONFIG_ENV) {
            Ok(path) => Self::from_file(Path::new(&path))?,
            Err(_) if Path::new(DEFAULT_CONFIG_PATH).is_file() => {
                Self::from_file(Path::new(DEFAULT_CONFIG_PATH))?
            }
            Err(_) => Self::default(),
        };
        config.apply_env_overrides();
        Ok(config)
    }

    pub fn apply_env_overrides(&mut self) {
        if let Ok(dir) = std::env::var(DATA_DIR_ENV) {
            self.data_dir = PathBuf::from(dir);
        }
        if let Ok(dir) = std::env::var(SCHEMAS_DIR_ENV) {
            self.schemas_dir = Some(PathBuf::from(dir));
        }
    }

    pub fn schemas_dir(&self) -> PathBuf {
        self.schemas_dir.clone().unwrap_or_else(bundled_schemas_dir)
    }

    pub fn requests_dir(&self) -> PathBuf {
        self.data_dir.join("requests")
    }

    pub fn allocations(&self) -> HashMap<String, Allocation> {
        self.allocations
            .iter()
            .map(|a| (a.id.clone(), a.resolve()))
            .collect()
    }

    fn check(&self) -> Result<()> {
        if self.queue.parallel_workers == 0 {
            return Err(IgsnError::Configuration(
                "queue.parallel_workers must be at least 1".into(),
            ));
        }
        if self.queue.max_attempts == 0 {
            return Err(IgsnError::Configuration(
                "queue.max_attempts must be at least 1".into(),
            ));
        }
        if self.events.buffer_size == 0 {
            return Err(IgsnError::Configuration(
                "events.buffer_size must be at least 1".into(),
            ));
        }
        let mut seen = BTreeSet::new();
        for allocation in &self.allocations {
            if !seen.insert(allocation.id.as_str()) {
                return Err(IgsnError::Configuration(format!(
                    "duplicate allocation id '{}'",
                    allocation.id
                )));
            }
        }
        Ok(())
    }
}
