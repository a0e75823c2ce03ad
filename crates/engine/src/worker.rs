//! Claiming queue items, running them under a budget, storing results.

use std::any::Any;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::Instrument;

use foursight_interchange::{
    ActionResult, ActionStatus, CheckResult, CheckStatus, Kwargs, QueueItem, RunId,
};
use foursight_queue::{Message, QueueError, SendOptions, WorkQueue};
use foursight_storage::{validate_result_name, PutReport, ResultStore, StorageError};

use crate::context::Context;
use crate::environment::Environment;
use crate::error::CheckError;
use crate::protocol::{TimeBudget, TIME_LIMIT_NOTE};
use crate::registry::{ActionDescriptor, CheckDescriptor};

/// The stored outcome of one invocation.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Record {
    Check(CheckResult),
    Action(ActionResult),
}

impl Record {
    pub fn name(&self) -> &str {
        match self {
            Record::Check(r) => &r.name,
            Record::Action(r) => &r.name,
        }
    }

    pub fn uuid(&self) -> &RunId {
        match self {
            Record::Check(r) => &r.uuid,
            Record::Action(r) => &r.uuid,
        }
    }

    pub fn status(&self) -> &'static str {
        match self {
            Record::Check(r) => r.status.as_str(),
            Record::Action(r) => r.status.as_str(),
        }
    }

    async fn store(&self, results: &ResultStore, primary: bool) -> Result<PutReport, StorageError> {
        match self {
            Record::Check(r) => results.put(r, primary).await,
            Record::Action(r) => results.put(r, primary).await,
        }
    }
}

/// An invocation that ran (or was rejected) and is ready to store.
#[derive(Debug, Clone)]
pub struct Executed {
    pub environment: Arc<Environment>,
    pub record: Record,
    pub primary: bool,
    /// The invocation failed transiently and is worth running again.
    pub transient: bool,
    results: ResultStore,
}

/// A stored invocation.
#[derive(Debug, Clone)]
pub struct Dispatched {
    pub executed: Executed,
    pub put: PutReport,
    /// Message id of the linked action, when one was queued.
    pub action_queued: Option<String>,
}

#[derive(Debug)]
pub enum DispatchError {
    /// No environment or result store to run against. Retrying cannot help.
    Unroutable(CheckError),
    /// The result could not be written.
    Write(StorageError),
    /// The linked action could not be queued.
    Enqueue(QueueError),
    /// A transient failure on a delivery that will be retried. Nothing
    /// was written.
    Deferred { status: &'static str },
}

impl std::fmt::Display for DispatchError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DispatchError::Unroutable(e) => write!(f, "cannot route item: {}", e),
            DispatchError::Write(e) => write!(f, "could not write result: {}", e),
            DispatchError::Enqueue(e) => write!(f, "could not queue linked action: {}", e),
            DispatchError::Deferred { status } => {
                write!(f, "transient failure ({}), left for redelivery", status)
            }
        }
    }
}

impl std::error::Error for DispatchError {}

impl DispatchError {
    /// Whether another delivery of the same item could succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            DispatchError::Unroutable(_) => false,
            DispatchError::Write(e) => e.is_transient(),
            DispatchError::Enqueue(e) => e.is_transient(),
            DispatchError::Deferred { .. } => true,
        }
    }
}

enum Guarded<R> {
    Finished(R, Result<(), CheckError>),
    Panicked(String),
    TimedOut,
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Run `fut` on its own task so a panic stays inside it, and abort it
/// once `limit` has passed.
async fn guarded<R, Fut>(limit: Duration, fut: Fut) -> Guarded<R>
where
    R: Send + 'static,
    Fut: Future<Output = (R, Result<(), CheckError>)> + Send + 'static,
{
    let mut handle: JoinHandle<(R, Result<(), CheckError>)> = tokio::spawn(fut.in_current_span());
    match tokio::time::timeout(limit, &mut handle).await {
        Ok(Ok((record, outcome))) => Guarded::Finished(record, outcome),
        Ok(Err(join)) if join.is_panic() => Guarded::Panicked(panic_message(join.into_panic())),
        Ok(Err(join)) => Guarded::Panicked(join.to_string()),
        Err(_) => {
            handle.abort();
            Guarded::TimedOut
        }
    }
}

/// Run the check or action `item` names. Every failure short of an
/// unroutable item becomes a record. An unknown target is recorded as an
/// ERROR under its own name unless that name cannot key a result.
pub async fn execute(ctx: &Context, item: &QueueItem) -> Result<Executed, CheckError> {
    let environment = ctx.environment(item.environment.as_deref())?;
    let results = ctx.results(&environment.name)?.clone();
    let primary = item.kwargs.primary();

    let (record, transient) = if let Some(check) = ctx.registry.get_check(&item.target) {
        let (result, transient) = run_check(ctx, &environment, &check, &item.kwargs).await;
        (Record::Check(result), transient)
    } else if let Some(action) = ctx.registry.get_action(&item.target) {
        let (result, transient) = run_action(ctx, &environment, &action, &item.kwargs).await;
        (Record::Action(result), transient)
    } else {
        validate_result_name(&item.target).map_err(CheckError::Storage)?;
        let uuid = item.kwargs.run_id().unwrap_or_else(|_| RunId::now());
        let mut result = CheckResult::error(
            &item.target,
            uuid,
            format!("no check or action named {}", item.target),
        );
        result.kwargs = item.kwargs.clone();
        (Record::Check(result), false)
    };

    Ok(Executed {
        environment,
        record,
        primary,
        transient,
        results,
    })
}

fn fail_check(result: &mut CheckResult, message: &str) {
    result.status = CheckStatus::Error;
    result.summary = "Check failed to run".to_string();
    result.allow_action = false;
    result.add_note(message);
}

fn fail_action(result: &mut ActionResult, message: &str) {
    result.status = ActionStatus::Fail;
    result.add_note(message);
}

async fn run_check(
    ctx: &Context,
    environment: &Arc<Environment>,
    check: &CheckDescriptor,
    raw: &Kwargs,
) -> (CheckResult, bool) {
    let uuid = match raw.run_id() {
        Ok(uuid) => uuid,
        Err(e) => {
            let mut result = CheckResult::error(&check.name, RunId::now(), e.to_string());
            result.kwargs = raw.clone();
            return (result, false);
        }
    };
    let mut result = CheckResult::new(&check.name, uuid);
    result.action = check.linked_action.clone();
    result.kwargs = raw.clone();

    let kwargs = match check.validate(raw) {
        Ok(kwargs) => kwargs,
        Err(e) => {
            fail_check(&mut result, &e.to_string());
            return (result, false);
        }
    };
    result.kwargs = kwargs.clone();

    let budget = TimeBudget::start(ctx.settings.time_limit);
    let conn = match ctx.connect(environment, budget).await {
        Ok(conn) => conn,
        Err(e) => {
            fail_check(&mut result, &e.to_string());
            return (result, e.is_transient());
        }
    };

    let handler = check.handler.clone();
    let mut working = result.clone();
    let limit = ctx.settings.time_limit + ctx.settings.grace;
    let outcome = guarded(limit, async move {
        let outcome = handler.run(&conn, &kwargs, &mut working).await;
        drop(conn);
        (working, outcome)
    })
    .await;

    match outcome {
        Guarded::Finished(done, Ok(())) => (done, false),
        Guarded::Finished(mut done, Err(e)) => {
            fail_check(&mut done, &e.to_string());
            (done, e.is_transient())
        }
        Guarded::Panicked(message) => {
            fail_check(&mut result, &format!("check panicked: {}", message));
            (result, false)
        }
        Guarded::TimedOut => {
            tracing::warn!(limit = ?limit, "check ignored its budget and was aborted");
            fail_check(&mut result, TIME_LIMIT_NOTE);
            result.summary = "Check timed out".to_string();
            (result, false)
        }
    }
}

async fn run_action(
    ctx: &Context,
    environment: &Arc<Environment>,
    action: &ActionDescriptor,
    raw: &Kwargs,
) -> (ActionResult, bool) {
    let mut result = ActionResult::new(&action.name, RunId::now());
    result.kwargs = raw.clone();

    if raw.check_name().is_none() {
        fail_action(&mut result, "action kwargs carry no check_name");
        return (result, false);
    }
    let kwargs = match action.validate(raw) {
        Ok(kwargs) => kwargs,
        Err(e) => {
            fail_action(&mut result, &e.to_string());
            return (result, false);
        }
    };
    result.kwargs = kwargs.clone();

    let budget = TimeBudget::start(ctx.settings.time_limit);
    let conn = match ctx.connect(environment, budget).await {
        Ok(conn) => conn,
        Err(e) => {
            fail_action(&mut result, &e.to_string());
            return (result, e.is_transient());
        }
    };

    let handler = action.handler.clone();
    let mut working = result.clone();
    let limit = ctx.settings.time_limit + ctx.settings.grace;
    let outcome = guarded(limit, async move {
        let outcome = handler.run(&conn, &kwargs, &mut working).await;
        drop(conn);
        (working, outcome)
    })
    .await;

    match outcome {
        Guarded::Finished(done, Ok(())) => (done, false),
        Guarded::Finished(mut done, Err(e)) => {
            fail_action(&mut done, &e.to_string());
            (done, e.is_transient())
        }
        Guarded::Panicked(message) => {
            fail_action(&mut result, &format!("action panicked: {}", message));
            (result, false)
        }
        Guarded::TimedOut => {
            tracing::warn!(limit = ?limit, "action ignored its budget and was aborted");
            // Whatever it finished stays done; the next run picks up the rest.
            result.status = ActionStatus::Pend;
            result.add_note(TIME_LIMIT_NOTE);
            (result, false)
        }
    }
}

/// Execute `item`, store its record, and queue the linked action when the
/// check asks for it and the item was queued for this stage.
///
/// A transient failure is only written when `final_attempt` is set, so a
/// redelivery can still record a good result under the same run id.
pub async fn dispatch(
    ctx: &Context,
    item: &QueueItem,
    final_attempt: bool,
) -> Result<Dispatched, DispatchError> {
    let executed = execute(ctx, item)
        .await
        .map_err(DispatchError::Unroutable)?;
    if executed.transient && !final_attempt {
        return Err(DispatchError::Deferred {
            status: executed.record.status(),
        });
    }

    let put = executed
        .record
        .store(&executed.results, executed.primary)
        .await
        .map_err(DispatchError::Write)?;

    let action_queued = match &executed.record {
        Record::Check(result)
            if result.wants_action() && item.kwargs.queue_action() == Some(ctx.stage.as_str()) =>
        {
            match &result.action {
                Some(action) => {
                    let mut kwargs = Kwargs::new();
                    kwargs.set_check_name(&result.name);
                    kwargs.set_uuid(&result.uuid);
                    let mut next = QueueItem::new(action.clone(), kwargs);
                    if let Some(env) = &item.environment {
                        next = next.with_environment(env.clone());
                    }
                    let id = ctx
                        .queues
                        .primary
                        .send(next.to_json(), SendOptions::new())
                        .await
                        .map_err(DispatchError::Enqueue)?;
                    tracing::info!(action = %action, message_id = %id, "linked action queued");
                    Some(id)
                }
                None => None,
            }
        }
        _ => None,
    };

    Ok(Dispatched {
        executed,
        put,
        action_queued,
    })
}

/// What a worker did with one delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkOutcome {
    /// The record was written and the item deleted.
    Completed {
        target: String,
        uuid: RunId,
        status: String,
        action_queued: bool,
    },
    /// The item was left in the queue for redelivery.
    Retained { target: String, reason: String },
    /// The item could never run and was deleted.
    Discarded { reason: String },
}

/// Claims one item at a time from one queue.
pub struct Worker {
    name: String,
    ctx: Arc<Context>,
    queue: Arc<dyn WorkQueue>,
}

impl Worker {
    pub fn new(name: impl Into<String>, ctx: Arc<Context>, queue: Arc<dyn WorkQueue>) -> Self {
        Self {
            name: name.into(),
            ctx,
            queue,
        }
    }

    /// Claim and process at most one item. `None` when the queue had
    /// nothing visible.
    pub async fn poll_once(&self) -> Result<Option<WorkOutcome>, QueueError> {
        let mut messages = self.queue.receive(1, self.ctx.settings.visibility).await?;
        match messages.pop() {
            Some(message) => Ok(Some(self.process(message).await)),
            None => Ok(None),
        }
    }

    pub async fn process(&self, message: Message) -> WorkOutcome {
        let item = match QueueItem::from_json(&message.body) {
            Ok(item) => item,
            Err(e) => {
                tracing::warn!(worker = %self.name, message_id = %message.id, error = %e, "discarding unreadable item");
                self.delete(&message).await;
                return WorkOutcome::Discarded {
                    reason: e.to_string(),
                };
            }
        };
        let span = tracing::info_span!(
            "invocation",
            worker = %self.name,
            target = %item.target,
            uuid = item.kwargs.uuid_str().unwrap_or("-"),
        );
        self.handle(message, item).instrument(span).await
    }

    async fn handle(&self, message: Message, item: QueueItem) -> WorkOutcome {
        let final_attempt = message.receive_count >= self.ctx.settings.max_receives;
        match dispatch(&self.ctx, &item, final_attempt).await {
            Ok(done) => {
                self.delete(&message).await;
                let record = &done.executed.record;
                tracing::info!(status = record.status(), created = done.put.created, "invocation finished");
                WorkOutcome::Completed {
                    target: item.target,
                    uuid: record.uuid().clone(),
                    status: record.status().to_string(),
                    action_queued: done.action_queued.is_some(),
                }
            }
            Err(e) if !e.is_retryable() => {
                tracing::warn!(error = %e, receives = message.receive_count, "discarding item that cannot succeed on redelivery");
                self.delete(&message).await;
                WorkOutcome::Discarded {
                    reason: e.to_string(),
                }
            }
            Err(e) => {
                tracing::error!(error = %e, receives = message.receive_count, "item left for redelivery");
                let delay = self.ctx.settings.redelivery_delay;
                if let Err(e) = self.queue.change_visibility(&message.receipt, delay).await {
                    tracing::debug!(error = %e, "could not shorten visibility, waiting out the timeout");
                }
                WorkOutcome::Retained {
                    target: item.target,
                    reason: e.to_string(),
                }
            }
        }
    }

    async fn delete(&self, message: &Message) {
        match self.queue.delete(&message.receipt).await {
            Ok(()) => {}
            Err(QueueError::StaleHandle { .. }) => {
                tracing::warn!(message_id = %message.id, "receipt expired before delete, item will run again");
            }
            Err(e) => {
                tracing::warn!(message_id = %message.id, error = %e, "could not delete item");
            }
        }
    }

    /// Poll until `shutdown` flips or its sender goes away. An invocation
    /// in progress is finished first.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        tracing::info!(worker = %self.name, queue = self.queue.name(), "worker started");
        while !*shutdown.borrow() {
            let idle = match self.poll_once().await {
                Ok(Some(_)) => false,
                Ok(None) => true,
                Err(e) => {
                    tracing::warn!(worker = %self.name, error = %e, "receive failed");
                    true
                }
            };
            if idle {
                tokio::select! {
                    _ = tokio::time::sleep(self.ctx.settings.poll_interval) => {}
                    changed = shutdown.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
            }
        }
        tracing::info!(worker = %self.name, "worker stopped");
    }
}

/// A fixed number of workers on one queue.
pub struct WorkerPool {
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn spawn(
        label: &str,
        ctx: Arc<Context>,
        queue: Arc<dyn WorkQueue>,
        size: usize,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let handles = (0..size)
            .map(|i| {
                let worker = Worker::new(format!("{}-{}", label, i), ctx.clone(), queue.clone());
                tokio::spawn(worker.run(shutdown.clone()))
            })
            .collect();
        Self { handles }
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Wait for every worker to stop.
    pub async fn join(self) {
        for handle in self.handles {
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "worker task failed");
            }
        }
    }
}
