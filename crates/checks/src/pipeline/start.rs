use async_trait::async_trait;
use serde_json::Value;

use foursight_engine::clients::LaunchRequest;
use foursight_engine::{
    ActionDescriptor, ActionFn, CheckDescriptor, CheckError, CheckFn, Connection,
    RegistryBuilder,
};
use foursight_interchange::{ActionResult, CheckResult, Kwargs};

use super::model::{RunState, ShardState, WorkflowRun};
use super::{listed, report_runs, runs_in, sweep, Step, Transition, TEN_MIN_CHECKS};

const STARTABLE: [RunState; 3] = [RunState::Pending, RunState::Inactive, RunState::Running];

pub(super) fn register(builder: &mut RegistryBuilder) {
    builder
        .check(
            CheckDescriptor::new("runs_to_start", RunsToStart)
                .describe("Workflow runs with shards whose dependencies have all completed")
                .action("start_runs")
                .group(TEN_MIN_CHECKS)
                .auto_action(),
        )
        .action(
            ActionDescriptor::new("start_runs", StartRuns)
                .describe("Launch every ready shard of the listed workflow runs"),
        );
}

struct RunsToStart;

#[async_trait]
impl CheckFn for RunsToStart {
    async fn run(
        &self,
        conn: &Connection,
        _kwargs: &Kwargs,
        result: &mut CheckResult,
    ) -> Result<(), CheckError> {
        let ready: Vec<String> = runs_in(conn, &STARTABLE)
            .await?
            .into_iter()
            .filter(|run| !run.launchable().is_empty())
            .map(|run| run.uuid)
            .collect();
        report_runs(result, ready, "ready to start");
        Ok(())
    }
}

struct StartRuns;

#[async_trait]
impl ActionFn for StartRuns {
    async fn run(
        &self,
        conn: &Connection,
        kwargs: &Kwargs,
        result: &mut ActionResult,
    ) -> Result<(), CheckError> {
        let upstream = conn.upstream_check(kwargs).await?;
        sweep(conn, listed(&upstream.full_output, "runs"), &LaunchReady, result).await;
        Ok(())
    }
}

struct LaunchReady;

#[async_trait]
impl Transition for LaunchReady {
    async fn apply(&self, conn: &Connection, id: &str) -> Result<Step, CheckError> {
        let item = conn.api.get(id).await?;
        let mut run = WorkflowRun::from_item(&item)?;
        if !STARTABLE.contains(&run.state) {
            return Ok(Step::Ineligible);
        }
        let ready: Vec<String> = run.launchable().iter().map(|s| s.name.clone()).collect();
        if ready.is_empty() {
            return Ok(Step::Converged);
        }

        let inputs = item.get("input").cloned().unwrap_or(Value::Null);
        let mut launched = 0;
        let mut first_error = None;
        for name in ready {
            let request = LaunchRequest {
                workflow: run.workflow.clone(),
                run: run.uuid.clone(),
                shard: name.clone(),
                inputs: inputs.clone(),
            };
            match conn.workflows.launch(&request).await {
                Ok(job_id) => {
                    tracing::info!(run = %run.uuid, shard = %name, job = %job_id, "shard launched");
                    if let Some(shard) = run.shard_mut(&name) {
                        shard.state = ShardState::Running;
                        shard.job_id = Some(job_id);
                    }
                    launched += 1;
                }
                Err(err) => {
                    first_error.get_or_insert(err);
                }
            }
        }
        if launched > 0 {
            record_progress(conn, &run).await?;
        }
        match first_error {
            Some(err) => Err(err.into()),
            None => Ok(Step::Converged),
        }
    }
}

/// Write the shards and the rolled-up state back to the portal.
pub(super) async fn record_progress(conn: &Connection, run: &WorkflowRun) -> Result<(), CheckError> {
    conn.api.patch(&run.uuid, run.progress_patch()).await?;
    Ok(())
}
