//! Per-invocation handles onto an environment's services.

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;

use foursight_interchange::{CheckResult, Kwargs};
use foursight_queue::QueuePair;
use foursight_storage::{FsObjectStore, MemoryObjectStore, ObjectStore, ResultStore};

use crate::clients::{
    DomainApi, HttpDomainApi, HttpSearchClient, HttpWorkflowEngine, SearchClient, Unconfigured,
    WorkflowEngine,
};
use crate::environment::Environment;
use crate::error::CheckError;
use crate::protocol::TimeBudget;

/// One object store per configured bucket.
#[derive(Clone)]
pub struct BucketStores {
    pub raw: Arc<dyn ObjectStore>,
    pub processed: Arc<dyn ObjectStore>,
    pub logs: Arc<dyn ObjectStore>,
}

impl BucketStores {
    pub fn memory() -> Self {
        Self {
            raw: Arc::new(MemoryObjectStore::new()),
            processed: Arc::new(MemoryObjectStore::new()),
            logs: Arc::new(MemoryObjectStore::new()),
        }
    }
}

/// The external services of one environment.
#[derive(Clone)]
pub struct Services {
    pub api: Arc<dyn DomainApi>,
    pub workflows: Arc<dyn WorkflowEngine>,
    pub search: Arc<dyn SearchClient>,
    pub buckets: BucketStores,
}

/// Everything a check or action may touch, scoped to one invocation.
pub struct Connection {
    pub environment: Arc<Environment>,
    pub stage: String,
    pub api: Arc<dyn DomainApi>,
    pub workflows: Arc<dyn WorkflowEngine>,
    pub search: Arc<dyn SearchClient>,
    pub buckets: BucketStores,
    /// Results of this environment.
    pub results: ResultStore,
    pub queues: QueuePair,
    pub budget: TimeBudget,
}

impl Connection {
    pub fn new(
        environment: Arc<Environment>,
        stage: impl Into<String>,
        services: Services,
        results: ResultStore,
        queues: QueuePair,
        budget: TimeBudget,
    ) -> Self {
        tracing::debug!(environment = %environment.name, "connection opened");
        Self {
            environment,
            stage: stage.into(),
            api: services.api,
            workflows: services.workflows,
            search: services.search,
            buckets: services.buckets,
            results,
            queues,
            budget,
        }
    }

    /// The check result an action was queued from: the exact run named by
    /// `check_name` and `uuid`, or the latest result of that check.
    pub async fn upstream_check(&self, kwargs: &Kwargs) -> Result<CheckResult, CheckError> {
        let name = kwargs
            .check_name()
            .ok_or_else(|| CheckError::Validation("action kwargs carry no check_name".into()))?;
        if let Ok(uuid) = kwargs.run_id() {
            if let Some(found) = self.results.get_by_uuid(name, &uuid).await? {
                return Ok(found);
            }
        }
        self.results
            .get_latest(name)
            .await?
            .ok_or_else(|| CheckError::NotFound(format!("no result for check {}", name)))
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("environment", &self.environment.name)
            .field("stage", &self.stage)
            .finish_non_exhaustive()
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        tracing::debug!(environment = %self.environment.name, "connection released");
    }
}

/// Produces the services for an environment at connection time.
#[async_trait]
pub trait ConnectionFactory: Send + Sync + 'static {
    async fn services(&self, env: &Environment) -> Result<Services, CheckError>;
}

/// Hands out services fixed ahead of time, keyed by environment name.
#[derive(Clone, Default)]
pub struct StaticConnectionFactory {
    services: HashMap<String, Services>,
}

impl StaticConnectionFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, environment: impl Into<String>, services: Services) -> Self {
        self.services.insert(environment.into(), services);
        self
    }
}

#[async_trait]
impl ConnectionFactory for StaticConnectionFactory {
    async fn services(&self, env: &Environment) -> Result<Services, CheckError> {
        self.services
            .get(&env.name)
            .cloned()
            .ok_or_else(|| CheckError::NotFound(format!("no services for environment {}", env.name)))
    }
}

/// Builds HTTP clients from the environment's endpoints. Buckets are
/// directories under `buckets_root`, or process-wide memory stores.
pub struct HttpConnectionFactory {
    buckets_root: Option<PathBuf>,
    memory_buckets: Mutex<HashMap<String, Arc<dyn ObjectStore>>>,
}

impl HttpConnectionFactory {
    pub fn new(buckets_root: Option<PathBuf>) -> Self {
        Self {
            buckets_root,
            memory_buckets: Mutex::new(HashMap::new()),
        }
    }

    async fn bucket(&self, name: &str) -> Result<Arc<dyn ObjectStore>, CheckError> {
        if name.is_empty() {
            return Err(CheckError::Validation("bucket name is not configured".into()));
        }
        match &self.buckets_root {
            Some(root) => Ok(Arc::new(FsObjectStore::open(root.join(name)).await?)),
            None => {
                let mut buckets = self
                    .memory_buckets
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner);
                Ok(buckets
                    .entry(name.to_string())
                    .or_insert_with(|| Arc::new(MemoryObjectStore::new()))
                    .clone())
            }
        }
    }
}

#[async_trait]
impl ConnectionFactory for HttpConnectionFactory {
    async fn services(&self, env: &Environment) -> Result<Services, CheckError> {
        let token = env.credentials()?;
        let workflows: Arc<dyn WorkflowEngine> = match &env.workflow_url {
            Some(url) => Arc::new(HttpWorkflowEngine::new(url.clone(), token.clone())),
            None => Arc::new(Unconfigured),
        };
        let search: Arc<dyn SearchClient> = match &env.search_url {
            Some(url) => Arc::new(HttpSearchClient::new(url.clone())),
            None => Arc::new(Unconfigured),
        };
        Ok(Services {
            api: Arc::new(HttpDomainApi::new(env.api_url.clone(), token)),
            workflows,
            search,
            buckets: BucketStores {
                raw: self.bucket(&env.buckets.raw).await?,
                processed: self.bucket(&env.buckets.processed).await?,
                logs: self.bucket(&env.buckets.logs).await?,
            },
        })
    }
}
