//! One-shot invocations through the same path the workers use.

use std::sync::Arc;

use foursight_engine::{dispatch, Context, WorkOutcome, Worker};
use foursight_interchange::{Kwargs, QueueItem, RunId};
use serde_json::{json, Value};

use super::{print_json, print_record, CmdResult};
use crate::OutputFormat;

pub(crate) struct CheckArgs<'a> {
    pub name: &'a str,
    pub kwargs: Option<&'a str>,
    pub primary: bool,
    pub queue_action: bool,
    pub env: Option<String>,
}

/// Run a check now and store its result. With `queue_action`, a linked
/// action that gets queued runs right after it.
pub(crate) async fn cmd_check(ctx: Arc<Context>, args: CheckArgs<'_>, output: OutputFormat) -> CmdResult {
    if ctx.registry.get_check(args.name).is_none() {
        return Err(format!("unknown check '{}'", args.name).into());
    }
    let mut kwargs = match args.kwargs {
        Some(text) => Kwargs::from_value(serde_json::from_str(text)?)?,
        None => Kwargs::new(),
    };
    if kwargs.uuid_str().is_none() {
        kwargs.set_uuid(&RunId::now());
    }
    if args.primary {
        kwargs.set_primary(true);
    }
    if args.queue_action {
        kwargs.set_queue_action(&ctx.stage);
    }

    let item = with_env(QueueItem::new(args.name, kwargs), args.env);
    let done = dispatch(&ctx, &item, true).await?;
    let record = serde_json::to_value(&done.executed.record)?;

    let mut actions = Vec::new();
    if done.action_queued.is_some() {
        let environment = done.executed.environment.name.clone();
        let worker = Worker::new("cli", ctx.clone(), ctx.queues.primary.clone());
        while let Some(outcome) = worker.poll_once().await? {
            if let WorkOutcome::Completed { target, uuid, .. } = outcome {
                let stored = ctx
                    .results(&environment)?
                    .get_by_uuid::<Value>(&target, &uuid)
                    .await?;
                actions.extend(stored);
            }
        }
    }

    match output {
        OutputFormat::Json if done.action_queued.is_some() => {
            print_json(&json!({ "result": record, "actions": actions }))
        }
        _ => {
            print_record(&record, output);
            for action in &actions {
                print_record(action, output);
            }
        }
    }
    Ok(())
}

/// Run an action against a stored check result. Without `uuid` the
/// check's latest result is used.
pub(crate) async fn cmd_action(
    ctx: Arc<Context>,
    name: &str,
    check_name: &str,
    uuid: Option<&str>,
    env: Option<String>,
    output: OutputFormat,
) -> CmdResult {
    if ctx.registry.get_action(name).is_none() {
        return Err(format!("unknown action '{}'", name).into());
    }
    let mut kwargs = Kwargs::new();
    kwargs.set_check_name(check_name);
    if let Some(uuid) = uuid {
        kwargs.set_uuid(&RunId::parse(uuid)?);
    }

    let item = with_env(QueueItem::new(name, kwargs), env);
    let done = dispatch(&ctx, &item, true).await?;
    print_record(&serde_json::to_value(&done.executed.record)?, output);
    Ok(())
}

fn with_env(item: QueueItem, env: Option<String>) -> QueueItem {
    match env {
        Some(env) => item.with_environment(env),
        None => item,
    }
}
