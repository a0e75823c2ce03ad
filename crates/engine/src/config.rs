//! `foursight.toml` and its environment-variable overrides.
//!
//! ```toml
//! stage = "prod"
//! environment = "data"
//!
//! [results]
//! root = "/var/lib/foursight/results"
//!
//! [worker]
//! pool_size = 4
//! time_limit_secs = 480
//!
//! [schedules.prod]
//! ten_min_checks = "cron(0/10 * * * ? *)"
//! morning_checks = "cron(0 10 * * ? *)"
//!
//! [disabled_groups]
//! dev = ["deployment_checks"]
//!
//! [environments.data]
//! api_url = "https://data.example.org"
//! credentials = "env:FOURSIGHT_DATA_TOKEN"
//! search_url = "https://search.example.org"
//! buckets = { raw = "files", processed = "wfoutput", logs = "tibanna-output" }
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::scheduler::parse_schedule;

pub const DEFAULT_CONFIG_FILE: &str = "foursight.toml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("could not parse '{path}': {message}")]
    Parse { path: PathBuf, message: String },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default = "default_stage")]
    pub stage: String,
    /// Environment used when a queue item names none.
    #[serde(default)]
    pub environment: Option<String>,
    #[serde(default)]
    pub results: ResultsConfig,
    /// Directory holding one subdirectory per object-store bucket. Without
    /// it buckets are kept in memory.
    #[serde(default)]
    pub buckets_root: Option<PathBuf>,
    #[serde(default)]
    pub queues: QueueConfig,
    #[serde(default)]
    pub worker: WorkerConfig,
    #[serde(default)]
    pub admin: AdminConfig,
    /// stage → group → AWS cron expression.
    #[serde(default)]
    pub schedules: BTreeMap<String, BTreeMap<String, String>>,
    /// stage → groups that fire nothing on that stage.
    #[serde(default)]
    pub disabled_groups: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    pub environments: BTreeMap<String, EnvironmentConfig>,
}

fn default_stage() -> String {
    "dev".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            stage: default_stage(),
            environment: None,
            results: ResultsConfig::default(),
            buckets_root: None,
            queues: QueueConfig::default(),
            worker: WorkerConfig::default(),
            admin: AdminConfig::default(),
            schedules: BTreeMap::new(),
            disabled_groups: BTreeMap::new(),
            environments: BTreeMap::new(),
        }
    }
}

/// Where results live: `<root>/<environment>/`. Without a root they are
/// kept in memory.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ResultsConfig {
    #[serde(default)]
    pub root: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct QueueConfig {
    pub visibility_timeout_secs: u64,
    pub redelivery_delay_secs: u64,
    /// Deliveries after which a transiently failing item is dropped.
    pub max_receives: u32,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            visibility_timeout_secs: 600,
            redelivery_delay_secs: 2,
            max_receives: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct WorkerConfig {
    pub pool_size: usize,
    pub secondary_pool_size: usize,
    pub time_limit_secs: u64,
    pub grace_secs: u64,
    pub poll_interval_ms: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            pool_size: 4,
            secondary_pool_size: 1,
            time_limit_secs: 480,
            grace_secs: 15,
            poll_interval_ms: 1000,
        }
    }
}

impl WorkerConfig {
    pub fn time_limit(&self) -> Duration {
        Duration::from_secs(self.time_limit_secs)
    }

    pub fn grace(&self) -> Duration {
        Duration::from_secs(self.grace_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct AdminConfig {
    pub bind: String,
    pub api_key: Option<String>,
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:8080".to_string(),
            api_key: None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EnvironmentConfig {
    pub api_url: String,
    #[serde(default)]
    pub credentials: String,
    #[serde(default)]
    pub search_url: Option<String>,
    #[serde(default)]
    pub workflow_url: Option<String>,
    #[serde(default)]
    pub buckets: BucketConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct BucketConfig {
    pub raw: String,
    pub processed: String,
    pub logs: String,
}

impl Config {
    /// Load from `path`, or from `foursight.toml` in the working directory
    /// when it exists, or defaults. Process environment overrides are then
    /// applied and the result validated.
    pub fn load(path: Option<&Path>) -> Result<Config, ConfigError> {
        let mut config = match path {
            Some(path) => Self::read(path)?,
            None => {
                let fallback = Path::new(DEFAULT_CONFIG_FILE);
                if fallback.exists() {
                    Self::read(fallback)?
                } else {
                    Config::default()
                }
            }
        };
        config.apply_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    pub fn read(path: &Path) -> Result<Config, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.to_path_buf(),
            source: e,
        })?;
        Self::parse(path, &content)
    }

    pub fn parse(path: &Path, content: &str) -> Result<Config, ConfigError> {
        toml::from_str(content).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            message: e.to_string(),
        })
    }

    /// Apply `FOURSIGHT_*` overrides read through `lookup`. Environment
    /// specific overrides go to the default environment.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(stage) = lookup("FOURSIGHT_STAGE") {
            self.stage = stage;
        }
        if let Some(env) = lookup("FOURSIGHT_ENV") {
            self.environment = Some(env);
        }
        if let Some(dir) = lookup("FOURSIGHT_RESULTS_DIR") {
            self.results.root = Some(PathBuf::from(dir));
        }
        if let Some(key) = lookup("FOURSIGHT_API_KEY") {
            self.admin.api_key = Some(key);
        }

        let Some(name) = self.default_environment() else {
            return;
        };
        let Some(env) = self.environments.get_mut(&name) else {
            return;
        };
        if let Some(url) = lookup("FOURSIGHT_SEARCH_URL") {
            env.search_url = Some(url);
        }
        if let Some(creds) = lookup("FOURSIGHT_CREDENTIALS") {
            env.credentials = creds;
        }
        if let Some(bucket) = lookup("FOURSIGHT_BUCKET_RAW") {
            env.buckets.raw = bucket;
        }
        if let Some(bucket) = lookup("FOURSIGHT_BUCKET_PROCESSED") {
            env.buckets.processed = bucket;
        }
        if let Some(bucket) = lookup("FOURSIGHT_BUCKET_LOGS") {
            env.buckets.logs = bucket;
        }
    }

    /// The configured default, or the only environment when there is one.
    pub fn default_environment(&self) -> Option<String> {
        if let Some(name) = &self.environment {
            return Some(name.clone());
        }
        if self.environments.len() == 1 {
            return self.environments.keys().next().cloned();
        }
        None
    }

    /// Collects every problem rather than stopping at the first.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut errors = Vec::new();

        if self.stage.trim().is_empty() {
            errors.push("stage must not be empty".to_string());
        }
        if let Some(name) = &self.environment {
            if !self.environments.contains_key(name) {
                errors.push(format!("default environment '{}' is not configured", name));
            }
        }
        for (name, env) in &self.environments {
            if name.trim().is_empty() {
                errors.push("environment names must not be empty".to_string());
            }
            if env.api_url.trim().is_empty() {
                errors.push(format!("environment '{}' has no api_url", name));
            }
        }
        for (stage, groups) in &self.schedules {
            for (group, expression) in groups {
                if let Err(e) = parse_schedule(expression) {
                    errors.push(format!("schedule {}/{}: {}", stage, group, e));
                }
            }
        }
        if self.worker.pool_size == 0 {
            errors.push("worker.pool_size must be at least 1".to_string());
        }
        if self.worker.time_limit_secs == 0 {
            errors.push("worker.time_limit_secs must be positive".to_string());
        }
        if self.queues.redelivery_delay_secs == 0 {
            errors.push("queues.redelivery_delay_secs must be at least 1".to_string());
        }
        let budget = self.worker.time_limit_secs + self.worker.grace_secs;
        if self.queues.visibility_timeout_secs <= budget {
            errors.push(format!(
                "queues.visibility_timeout_secs ({}) must exceed the worker budget ({})",
                self.queues.visibility_timeout_secs, budget
            ));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Invalid(errors.join("; ")))
        }
    }
}
