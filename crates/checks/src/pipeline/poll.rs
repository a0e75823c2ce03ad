use std::collections::BTreeMap;

use async_trait::async_trait;
use serde_json::json;

use foursight_engine::{
    ActionDescriptor, ActionFn, CheckDescriptor, CheckError, CheckFn, Connection,
    RegistryBuilder, TIME_LIMIT_NOTE,
};
use foursight_interchange::{ActionResult, CheckResult, CheckStatus, Kwargs};

use super::model::{RunState, WorkflowRun};
use super::start::record_progress;
use super::{fetch_run, listed, runs_in, sweep, Step, Transition, TEN_MIN_CHECKS};

pub(super) fn register(builder: &mut RegistryBuilder) {
    builder
        .check(
            CheckDescriptor::new("runs_to_poll", RunsToPoll)
                .describe("Running workflow runs whose shards the engine reports in a new state")
                .action("poll_runs")
                .group(TEN_MIN_CHECKS)
                .auto_action(),
        )
        .action(
            ActionDescriptor::new("poll_runs", PollRuns)
                .describe("Copy the engine's shard states onto the listed workflow runs"),
        );
}

/// Ask the engine about every launched shard of `run`. Returns whether
/// any shard changed.
async fn refresh(conn: &Connection, run: &mut WorkflowRun) -> Result<bool, CheckError> {
    let mut changed = false;
    for shard in run.shards.iter_mut().filter(|s| s.is_active()) {
        let Some(job_id) = shard.job_id.clone() else {
            continue;
        };
        let state = conn.workflows.status(&job_id).await?;
        changed |= shard.apply_job_state(&state);
    }
    Ok(changed)
}

struct RunsToPoll;

#[async_trait]
impl CheckFn for RunsToPoll {
    async fn run(
        &self,
        conn: &Connection,
        _kwargs: &Kwargs,
        result: &mut CheckResult,
    ) -> Result<(), CheckError> {
        let runs = runs_in(conn, &[RunState::Running]).await?;
        let total = runs.len();

        let mut processed = 0;
        let mut moved = Vec::new();
        let mut errors = BTreeMap::new();
        let mut cut_short = false;
        for mut run in runs {
            if conn.budget.is_past_time_limit() {
                cut_short = true;
                break;
            }
            match refresh(conn, &mut run).await {
                Ok(changed) if changed || run.rollup() != run.state => moved.push(run.uuid),
                Ok(_) => {}
                Err(err) => {
                    errors.insert(run.uuid, err.to_string());
                }
            }
            processed += 1;
        }

        result.status = if moved.is_empty() {
            CheckStatus::Pass
        } else {
            CheckStatus::Warn
        };
        result.allow_action = !moved.is_empty();
        result.summary = if moved.is_empty() {
            "No workflow runs changed state".to_string()
        } else {
            format!("{} workflow runs changed state", moved.len())
        };
        if !moved.is_empty() {
            result.action_message = format!("Will update {} workflow runs", moved.len());
        }
        if cut_short {
            result.add_note(TIME_LIMIT_NOTE);
            tracing::info!(processed, total, "poll cut short");
        }
        result.brief_output = json!({
            "processed": processed,
            "total": total,
            "changed": moved.len(),
            "errors": errors,
        });
        result.full_output = json!({ "runs": moved });
        Ok(())
    }
}

struct PollRuns;

#[async_trait]
impl ActionFn for PollRuns {
    async fn run(
        &self,
        conn: &Connection,
        kwargs: &Kwargs,
        result: &mut ActionResult,
    ) -> Result<(), CheckError> {
        let upstream = conn.upstream_check(kwargs).await?;
        sweep(conn, listed(&upstream.full_output, "runs"), &RefreshShards, result).await;
        Ok(())
    }
}

struct RefreshShards;

#[async_trait]
impl Transition for RefreshShards {
    async fn apply(&self, conn: &Connection, id: &str) -> Result<Step, CheckError> {
        let mut run = fetch_run(conn, id).await?;
        if run.state == RunState::Stopped {
            return Ok(Step::Ineligible);
        }
        if refresh(conn, &mut run).await? || run.rollup() != run.state {
            record_progress(conn, &run).await?;
        }
        Ok(Step::Converged)
    }
}
