//! Dispatch machinery for foursight: the check and action registry, the
//! environment table, the cron scheduler, and the worker pool that runs
//! queued invocations and stores their results.

pub mod clients;
pub mod config;
mod connection;
mod context;
mod environment;
mod error;
mod protocol;
mod registry;
pub mod scheduler;
pub mod testing;
mod worker;

pub use config::{Config, ConfigError};
pub use connection::{
    BucketStores, Connection, ConnectionFactory, HttpConnectionFactory, Services,
    StaticConnectionFactory,
};
pub use context::{Context, WorkerSettings};
pub use environment::{Buckets, Credentials, Environment, EnvironmentRegistry};
pub use error::{CheckError, ErrorKind};
pub use protocol::{ActionFn, ActionOutput, CheckFn, TimeBudget, TIME_LIMIT_NOTE};
pub use registry::{
    display_title, validate_kwargs, ActionDescriptor, CheckDescriptor, ParamSpec, Registry,
    RegistryBuilder, RegistryError,
};
pub use scheduler::{FireReport, ScheduleTable, Scheduler};
pub use worker::{
    dispatch, execute, DispatchError, Dispatched, Executed, Record, WorkOutcome, Worker,
    WorkerPool,
};
