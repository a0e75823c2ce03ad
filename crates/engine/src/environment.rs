//! The frozen table of observed environments.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use crate::config::{Config, ConfigError};
use crate::error::CheckError;

/// An opaque credentials handle. `env:VAR` names an environment variable
/// read at connection time; anything else is the token itself.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Credentials(String);

impl Credentials {
    pub fn new(handle: impl Into<String>) -> Self {
        Self(handle.into())
    }

    pub fn resolve(&self) -> Result<Option<String>, CheckError> {
        if self.0.is_empty() {
            return Ok(None);
        }
        match self.0.strip_prefix("env:") {
            Some(var) => std::env::var(var).map(Some).map_err(|_| {
                CheckError::Validation(format!("credentials variable {} is not set", var))
            }),
            None => Ok(Some(self.0.clone())),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.starts_with("env:") {
            write!(f, "Credentials({})", self.0)
        } else if self.0.is_empty() {
            f.write_str("Credentials(none)")
        } else {
            f.write_str("Credentials(<redacted>)")
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Buckets {
    pub raw: String,
    pub processed: String,
    pub logs: String,
}

/// Endpoint bundle for one environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Environment {
    pub name: String,
    pub api_url: String,
    pub credentials: Credentials,
    pub search_url: Option<String>,
    pub workflow_url: Option<String>,
    pub buckets: Buckets,
}

impl Environment {
    pub fn new(name: impl Into<String>, api_url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            api_url: api_url.into(),
            credentials: Credentials::default(),
            search_url: None,
            workflow_url: None,
            buckets: Buckets::default(),
        }
    }

    pub fn credentials(&self) -> Result<Option<String>, CheckError> {
        self.credentials.resolve()
    }
}

/// Read-only after construction.
#[derive(Debug, Clone, Default)]
pub struct EnvironmentRegistry {
    envs: BTreeMap<String, Arc<Environment>>,
    default: Option<String>,
}

impl EnvironmentRegistry {
    pub fn new(
        environments: impl IntoIterator<Item = Environment>,
        default: Option<String>,
    ) -> Result<Self, ConfigError> {
        let mut envs = BTreeMap::new();
        for env in environments {
            if env.name.trim().is_empty() {
                return Err(ConfigError::Invalid("environment names must not be empty".into()));
            }
            let name = env.name.clone();
            if envs.insert(name.clone(), Arc::new(env)).is_some() {
                return Err(ConfigError::Invalid(format!(
                    "environment '{}' is defined twice",
                    name
                )));
            }
        }
        let default = match default {
            Some(name) if !envs.contains_key(&name) => {
                return Err(ConfigError::Invalid(format!(
                    "default environment '{}' is not configured",
                    name
                )))
            }
            Some(name) => Some(name),
            None if envs.len() == 1 => envs.keys().next().cloned(),
            None => None,
        };
        Ok(Self { envs, default })
    }

    pub fn from_config(config: &Config) -> Result<Self, ConfigError> {
        let envs = config.environments.iter().map(|(name, c)| Environment {
            name: name.clone(),
            api_url: c.api_url.clone(),
            credentials: Credentials::new(c.credentials.clone()),
            search_url: c.search_url.clone(),
            workflow_url: c.workflow_url.clone(),
            buckets: Buckets {
                raw: c.buckets.raw.clone(),
                processed: c.buckets.processed.clone(),
                logs: c.buckets.logs.clone(),
            },
        });
        Self::new(envs, config.environment.clone())
    }

    pub fn get(&self, name: &str) -> Option<Arc<Environment>> {
        self.envs.get(name).cloned()
    }

    /// `name`, or the default environment when `None`.
    pub fn resolve(&self, name: Option<&str>) -> Option<Arc<Environment>> {
        match name {
            Some(name) => self.get(name),
            None => self.default.as_deref().and_then(|n| self.get(n)),
        }
    }

    pub fn default_name(&self) -> Option<&str> {
        self.default.as_deref()
    }

    pub fn names(&self) -> Vec<&str> {
        self.envs.keys().map(String::as_str).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<Environment>> {
        self.envs.values()
    }

    pub fn len(&self) -> usize {
        self.envs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.envs.is_empty()
    }
}
