//! The root object handed to the scheduler, the workers and the admin
//! surface.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use foursight_queue::QueuePair;
use foursight_storage::ResultStore;

use crate::config::Config;
use crate::connection::{Connection, ConnectionFactory};
use crate::environment::{Environment, EnvironmentRegistry};
use crate::error::CheckError;
use crate::protocol::TimeBudget;
use crate::registry::Registry;

/// Knobs of the worker loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerSettings {
    /// Budget handed to each invocation.
    pub time_limit: Duration,
    /// Extra time before an invocation that ignores its budget is aborted.
    pub grace: Duration,
    /// Visibility timeout used when claiming an item.
    pub visibility: Duration,
    pub poll_interval: Duration,
    /// How soon an item that could not be finished becomes visible again.
    pub redelivery_delay: Duration,
    /// Deliveries after which an item that keeps failing transiently is
    /// dropped.
    pub max_receives: u32,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            time_limit: Duration::from_secs(480),
            grace: Duration::from_secs(15),
            visibility: Duration::from_secs(600),
            poll_interval: Duration::from_secs(1),
            redelivery_delay: Duration::from_secs(2),
            max_receives: 5,
        }
    }
}

impl WorkerSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            time_limit: config.worker.time_limit(),
            grace: config.worker.grace(),
            visibility: Duration::from_secs(config.queues.visibility_timeout_secs),
            poll_interval: config.worker.poll_interval(),
            redelivery_delay: Duration::from_secs(config.queues.redelivery_delay_secs),
            max_receives: config.queues.max_receives,
        }
    }
}

/// Process-wide state. Everything in it is read-only once built.
pub struct Context {
    pub stage: String,
    pub registry: Arc<Registry>,
    pub environments: Arc<EnvironmentRegistry>,
    pub queues: QueuePair,
    pub settings: WorkerSettings,
    results: BTreeMap<String, ResultStore>,
    connections: Arc<dyn ConnectionFactory>,
}

impl Context {
    pub fn new(
        stage: impl Into<String>,
        registry: Arc<Registry>,
        environments: Arc<EnvironmentRegistry>,
        queues: QueuePair,
        connections: Arc<dyn ConnectionFactory>,
    ) -> Self {
        Self {
            stage: stage.into(),
            registry,
            environments,
            queues,
            settings: WorkerSettings::default(),
            results: BTreeMap::new(),
            connections,
        }
    }

    pub fn with_settings(mut self, settings: WorkerSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Attach the result store of one environment.
    pub fn with_results(mut self, environment: impl Into<String>, store: ResultStore) -> Self {
        self.results.insert(environment.into(), store);
        self
    }

    pub fn results(&self, environment: &str) -> Result<&ResultStore, CheckError> {
        self.results.get(environment).ok_or_else(|| {
            CheckError::NotFound(format!("no result store for environment {}", environment))
        })
    }

    /// `name`, or the default environment.
    pub fn environment(&self, name: Option<&str>) -> Result<Arc<Environment>, CheckError> {
        self.environments.resolve(name).ok_or_else(|| match name {
            Some(name) => CheckError::NotFound(format!("environment {}", name)),
            None => CheckError::Validation("no environment given and no default configured".into()),
        })
    }

    pub async fn connect(
        &self,
        environment: &Arc<Environment>,
        budget: TimeBudget,
    ) -> Result<Connection, CheckError> {
        let services = self.connections.services(environment).await?;
        let results = self.results(&environment.name)?.clone();
        Ok(Connection::new(
            environment.clone(),
            self.stage.clone(),
            services,
            results,
            self.queues.clone(),
            budget,
        ))
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("stage", &self.stage)
            .field("environments", &self.environments.names())
            .field("queues", &self.queues)
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}
