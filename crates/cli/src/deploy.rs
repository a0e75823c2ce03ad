//! Assembles the process-wide context from configuration.

use std::error::Error;
use std::path::Path;
use std::sync::Arc;

use foursight_engine::{
    Config, Context, EnvironmentRegistry, HttpConnectionFactory, ScheduleTable, WorkerSettings,
};
use foursight_queue::{MemoryQueue, QueuePair, WorkQueue};
use foursight_storage::{FsObjectStore, MemoryObjectStore, ObjectStore, ResultStore, StorageError};

/// Everything a command needs to run checks.
pub(crate) struct Deployment {
    pub ctx: Arc<Context>,
    pub schedule: ScheduleTable,
}

pub(crate) async fn build(config: &Config) -> Result<Deployment, Box<dyn Error>> {
    let registry = foursight_checks::registry()?;
    let environments = EnvironmentRegistry::from_config(config)?;
    let schedule = ScheduleTable::from_config(config)?;

    let primary: Arc<dyn WorkQueue> = Arc::new(MemoryQueue::new("primary"));
    let secondary: Arc<dyn WorkQueue> = Arc::new(MemoryQueue::new("secondary"));
    let connections = HttpConnectionFactory::new(config.buckets_root.clone());

    let mut stores = Vec::new();
    for env in environments.iter() {
        let store = result_store(config.results.root.as_deref(), &env.name).await?;
        stores.push((env.name.clone(), store));
    }

    let mut ctx = Context::new(
        config.stage.clone(),
        Arc::new(registry),
        Arc::new(environments),
        QueuePair::new(primary, secondary),
        Arc::new(connections),
    )
    .with_settings(WorkerSettings::from_config(config));
    for (name, store) in stores {
        ctx = ctx.with_results(name, store);
    }

    Ok(Deployment {
        ctx: Arc::new(ctx),
        schedule,
    })
}

/// One directory per environment under `root`, or memory when no root is
/// configured.
async fn result_store(root: Option<&Path>, environment: &str) -> Result<ResultStore, StorageError> {
    let objects: Arc<dyn ObjectStore> = match root {
        Some(root) => Arc::new(FsObjectStore::open(root.join(environment)).await?),
        None => {
            tracing::warn!(environment, "no results root configured, results are kept in memory");
            Arc::new(MemoryObjectStore::new())
        }
    };
    Ok(ResultStore::new(objects))
}
