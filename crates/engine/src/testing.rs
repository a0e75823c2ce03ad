//! An in-memory deployment for tests: one environment, memory queues,
//! memory stores, and memory clients whose state the test can inspect.

use std::sync::Arc;
use std::time::Duration;

use foursight_interchange::QueueItem;
use foursight_queue::{MemoryQueue, QueueError, QueuePair, SendOptions, WorkQueue};
use foursight_storage::{MemoryObjectStore, ResultStore, RetryPolicy};

use crate::clients::{MemoryDomainApi, MemoryWorkflowEngine, StaticSearchClient};
use crate::connection::{BucketStores, Connection, Services, StaticConnectionFactory};
use crate::context::{Context, WorkerSettings};
use crate::environment::{Buckets, Environment, EnvironmentRegistry};
use crate::error::CheckError;
use crate::protocol::TimeBudget;
use crate::registry::Registry;
use crate::worker::{WorkOutcome, Worker};

pub const ENVIRONMENT: &str = "test";

pub struct Fixture {
    pub ctx: Arc<Context>,
    pub api: Arc<MemoryDomainApi>,
    pub workflows: Arc<MemoryWorkflowEngine>,
    pub search: Arc<StaticSearchClient>,
    /// Log bucket, shared with every connection.
    pub logs: MemoryObjectStore,
    /// The bucket behind `results`.
    pub result_objects: MemoryObjectStore,
    pub results: ResultStore,
    pub primary: Arc<MemoryQueue>,
    pub secondary: Arc<MemoryQueue>,
}

impl Fixture {
    pub fn new(registry: Registry, stage: &str) -> Self {
        Self::with_settings(registry, stage, WorkerSettings::default())
    }

    pub fn with_settings(registry: Registry, stage: &str, settings: WorkerSettings) -> Self {
        let api = Arc::new(MemoryDomainApi::new());
        let workflows = Arc::new(MemoryWorkflowEngine::new());
        let search = Arc::new(StaticSearchClient::green());
        let logs = MemoryObjectStore::new();
        let result_objects = MemoryObjectStore::new();
        let results = ResultStore::new(Arc::new(result_objects.clone())).with_retry_policy(
            RetryPolicy {
                attempts: 3,
                base_delay: Duration::ZERO,
            },
        );
        let primary = Arc::new(MemoryQueue::new("primary"));
        let secondary = Arc::new(MemoryQueue::new("secondary"));

        let mut env = Environment::new(ENVIRONMENT, "memory://portal");
        env.buckets = Buckets {
            raw: "raw".into(),
            processed: "processed".into(),
            logs: "logs".into(),
        };
        let environments = EnvironmentRegistry::new([env], None)
            .unwrap_or_else(|_| EnvironmentRegistry::default());

        let services = Services {
            api: api.clone(),
            workflows: workflows.clone(),
            search: search.clone(),
            buckets: BucketStores {
                raw: Arc::new(MemoryObjectStore::new()),
                processed: Arc::new(MemoryObjectStore::new()),
                logs: Arc::new(logs.clone()),
            },
        };
        let factory = StaticConnectionFactory::new().with(ENVIRONMENT, services);

        let primary_queue: Arc<dyn WorkQueue> = primary.clone();
        let secondary_queue: Arc<dyn WorkQueue> = secondary.clone();
        let ctx = Context::new(
            stage,
            Arc::new(registry),
            Arc::new(environments),
            QueuePair::new(primary_queue, secondary_queue),
            Arc::new(factory),
        )
        .with_settings(settings)
        .with_results(ENVIRONMENT, results.clone());

        Self {
            ctx: Arc::new(ctx),
            api,
            workflows,
            search,
            logs,
            result_objects,
            results,
            primary,
            secondary,
        }
    }

    /// A connection with a fresh budget of `limit`, for calling a check or
    /// action directly.
    pub async fn connection(&self, limit: Duration) -> Result<Connection, CheckError> {
        let env = self.ctx.environment(Some(ENVIRONMENT))?;
        self.ctx.connect(&env, TimeBudget::start(limit)).await
    }

    pub fn worker(&self) -> Worker {
        Worker::new("test-0", self.ctx.clone(), self.primary.clone())
    }

    pub async fn enqueue(&self, item: &QueueItem) -> Result<String, QueueError> {
        self.primary.send(item.to_json(), SendOptions::new()).await
    }

    /// Process the primary queue until nothing is visible.
    pub async fn drain(&self) -> Result<Vec<WorkOutcome>, QueueError> {
        let worker = self.worker();
        let mut outcomes = Vec::new();
        while let Some(outcome) = worker.poll_once().await? {
            outcomes.push(outcome);
        }
        Ok(outcomes)
    }

    /// Queued items on the primary queue, parsed.
    pub fn primary_items(&self) -> Vec<QueueItem> {
        self.primary
            .peek_all()
            .iter()
            .filter_map(|body| QueueItem::from_json(body).ok())
            .collect()
    }
}
