use async_trait::async_trait;
use serde_json::json;

use foursight_engine::{
    ActionDescriptor, ActionFn, CheckDescriptor, CheckError, CheckFn, Connection, ErrorKind,
    ParamSpec, RegistryBuilder,
};
use foursight_interchange::{ActionResult, CheckResult, Kwargs};

use super::model::RunState;
use super::{fetch_run, listed, report_runs, sweep, Step, Transition};

pub(super) fn register(builder: &mut RegistryBuilder) {
    builder
        .check(
            CheckDescriptor::new("runs_to_kill", RunsToKill)
                .describe("The listed workflow runs that are still live")
                .param(ParamSpec::new("runs").required())
                .action("kill_runs"),
        )
        .action(
            ActionDescriptor::new("kill_runs", KillRuns)
                .describe("Kill the jobs of the listed workflow runs and mark them stopped"),
        );
}

struct RunsToKill;

#[async_trait]
impl CheckFn for RunsToKill {
    async fn run(
        &self,
        conn: &Connection,
        kwargs: &Kwargs,
        result: &mut CheckResult,
    ) -> Result<(), CheckError> {
        let requested = kwargs.get_str_list("runs").unwrap_or_default();
        let mut live = Vec::new();
        let mut missing = Vec::new();
        for id in requested {
            match fetch_run(conn, &id).await {
                Ok(run) if !run.state.is_terminal() => live.push(run.uuid),
                Ok(_) => {}
                Err(err) if err.kind() == ErrorKind::NotFound => missing.push(id),
                Err(err) => return Err(err),
            }
        }
        report_runs(result, live, "to kill");
        if !missing.is_empty() {
            result.add_note(&format!("not found: {}", missing.join(", ")));
            result.brief_output["missing"] = json!(missing);
        }
        Ok(())
    }
}

struct KillRuns;

#[async_trait]
impl ActionFn for KillRuns {
    async fn run(
        &self,
        conn: &Connection,
        kwargs: &Kwargs,
        result: &mut ActionResult,
    ) -> Result<(), CheckError> {
        let upstream = conn.upstream_check(kwargs).await?;
        sweep(conn, listed(&upstream.full_output, "runs"), &Kill, result).await;
        Ok(())
    }
}

struct Kill;

#[async_trait]
impl Transition for Kill {
    async fn apply(&self, conn: &Connection, id: &str) -> Result<Step, CheckError> {
        let run = fetch_run(conn, id).await?;
        match run.state {
            RunState::Stopped => return Ok(Step::Converged),
            RunState::Completed => return Ok(Step::Ineligible),
            _ => {}
        }
        for shard in run.shards.iter().filter(|s| s.is_active()) {
            if let Some(job_id) = &shard.job_id {
                conn.workflows.kill(job_id).await?;
            }
        }
        conn.api
            .patch(id, json!({ "state": RunState::Stopped }))
            .await?;
        tracing::info!(run = %id, "workflow run stopped");
        Ok(Step::Converged)
    }
}
