//! Resetting failed shards so the start pair launches them again.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde_json::json;

use foursight_engine::{
    ActionDescriptor, ActionFn, CheckDescriptor, CheckError, CheckFn, Connection, ParamSpec,
    RegistryBuilder,
};
use foursight_interchange::{ActionResult, CheckResult, Kwargs};

use super::model::{looks_like_spot_failure, spot_marker_key, RunState, Shard, WorkflowRun};
use super::start::record_progress;
use super::{fetch_run, report_runs, runs_in, sweep, Step, Transition, HOURLY_CHECKS, TEN_MIN_CHECKS};

pub(super) fn register(builder: &mut RegistryBuilder) {
    builder
        .check(
            CheckDescriptor::new("spot_failed_runs", FailedRuns { spot_only: true })
                .describe("Failed workflow runs with shards lost to spot instance reclamation")
                .action("reset_spot_failed_runs")
                .group(TEN_MIN_CHECKS)
                .auto_action(),
        )
        .action(
            ActionDescriptor::new("reset_spot_failed_runs", ResetRuns { spot_only: true })
                .describe("Reset the spot-failed shards of the listed workflow runs"),
        )
        .check(
            CheckDescriptor::new("failed_runs", FailedRuns { spot_only: false })
                .describe("Failed workflow runs, whatever the cause")
                .param(ParamSpec::new("reset_all").default_value(false))
                .action("reset_failed_runs")
                .group(HOURLY_CHECKS),
        )
        .action(
            ActionDescriptor::new("reset_failed_runs", ResetRuns { spot_only: false })
                .describe("Reset every failed shard of the listed workflow runs"),
        );
}

/// Whether the shard died with its spot instance. The log bucket marker
/// decides when present; the failure text is the fallback.
async fn spot_failed(conn: &Connection, shard: &Shard) -> Result<bool, CheckError> {
    if let Some(job_id) = &shard.job_id {
        if conn.buckets.logs.head(&spot_marker_key(job_id)).await?.is_some() {
            return Ok(true);
        }
    }
    Ok(shard.failure.as_deref().is_some_and(looks_like_spot_failure))
}

/// Names of the failed shards the pair would reset.
async fn resettable(
    conn: &Connection,
    run: &WorkflowRun,
    spot_only: bool,
) -> Result<Vec<String>, CheckError> {
    let mut names = Vec::new();
    for shard in run.failed_shards() {
        if !spot_only || spot_failed(conn, shard).await? {
            names.push(shard.name.clone());
        }
    }
    Ok(names)
}

struct FailedRuns {
    spot_only: bool,
}

#[async_trait]
impl CheckFn for FailedRuns {
    async fn run(
        &self,
        conn: &Connection,
        kwargs: &Kwargs,
        result: &mut CheckResult,
    ) -> Result<(), CheckError> {
        let mut shards = BTreeMap::new();
        for run in runs_in(conn, &[RunState::Failed]).await? {
            let names = resettable(conn, &run, self.spot_only).await?;
            if !names.is_empty() {
                shards.insert(run.uuid, names);
            }
        }

        let runs: Vec<String> = shards.keys().cloned().collect();
        let what = if self.spot_only {
            "failed on spot instances"
        } else {
            "failed"
        };
        report_runs(result, runs, what);
        result.full_output["shards"] = json!(shards);

        // Resetting every failure is only automatic when asked for.
        if !self.spot_only && !kwargs.get_bool("reset_all").unwrap_or(false) {
            result.allow_action = false;
        }
        Ok(())
    }
}

struct ResetRuns {
    spot_only: bool,
}

#[async_trait]
impl ActionFn for ResetRuns {
    async fn run(
        &self,
        conn: &Connection,
        kwargs: &Kwargs,
        result: &mut ActionResult,
    ) -> Result<(), CheckError> {
        let upstream = conn.upstream_check(kwargs).await?;
        let listed: BTreeMap<String, Vec<String>> = upstream
            .full_output
            .get("shards")
            .cloned()
            .map(serde_json::from_value)
            .transpose()
            .map_err(|e| CheckError::Validation(format!("unreadable shard list: {}", e)))?
            .unwrap_or_default();
        let candidates = listed.keys().cloned().collect();
        let transition = ResetShards {
            listed,
            spot_only: self.spot_only,
        };
        sweep(conn, candidates, &transition, result).await;
        Ok(())
    }
}

struct ResetShards {
    listed: BTreeMap<String, Vec<String>>,
    spot_only: bool,
}

#[async_trait]
impl Transition for ResetShards {
    async fn apply(&self, conn: &Connection, id: &str) -> Result<Step, CheckError> {
        let mut run = fetch_run(conn, id).await?;
        if run.state == RunState::Stopped {
            return Ok(Step::Ineligible);
        }
        let wanted = self.listed.get(id).map(Vec::as_slice).unwrap_or_default();
        let still_failed = resettable(conn, &run, self.spot_only).await?;

        let mut reset = Vec::new();
        for name in wanted.iter().filter(|n| still_failed.contains(*n)) {
            if let Some(shard) = run.shard_mut(name) {
                shard.reset();
                reset.push(name.as_str());
            }
        }
        if !reset.is_empty() {
            tracing::info!(run = %run.uuid, shards = ?reset, "shards reset");
            record_progress(conn, &run).await?;
        }
        Ok(Step::Converged)
    }
}
