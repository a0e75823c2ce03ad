use async_trait::async_trait;
use serde_json::json;

use foursight_engine::{
    ActionDescriptor, ActionFn, CheckDescriptor, CheckError, CheckFn, Connection,
    RegistryBuilder,
};
use foursight_interchange::{ActionResult, CheckResult, Kwargs};

use super::model::RunState;
use super::{fetch_run, listed, report_runs, runs_in, sweep, Step, Transition, HOURLY_CHECKS};

pub(super) fn register(builder: &mut RegistryBuilder) {
    builder
        .check(
            CheckDescriptor::new("qc_failed_runs", QcFailedRuns)
                .describe("Workflow runs held back by a failing quality metric")
                .action("ignore_qc_failures")
                .group(HOURLY_CHECKS),
        )
        .action(
            ActionDescriptor::new("ignore_qc_failures", IgnoreQcFailures)
                .describe("Let the listed workflow runs proceed despite their quality metrics"),
        );
}

struct QcFailedRuns;

#[async_trait]
impl CheckFn for QcFailedRuns {
    async fn run(
        &self,
        conn: &Connection,
        _kwargs: &Kwargs,
        result: &mut CheckResult,
    ) -> Result<(), CheckError> {
        let runs = runs_in(conn, &[RunState::QualityMetricFailed])
            .await?
            .into_iter()
            .map(|run| run.uuid)
            .collect();
        report_runs(result, runs, "failed quality metrics");
        Ok(())
    }
}

struct IgnoreQcFailures;

#[async_trait]
impl ActionFn for IgnoreQcFailures {
    async fn run(
        &self,
        conn: &Connection,
        kwargs: &Kwargs,
        result: &mut ActionResult,
    ) -> Result<(), CheckError> {
        let upstream = conn.upstream_check(kwargs).await?;
        sweep(conn, listed(&upstream.full_output, "runs"), &IgnoreQc, result).await;
        Ok(())
    }
}

struct IgnoreQc;

#[async_trait]
impl Transition for IgnoreQc {
    async fn apply(&self, conn: &Connection, id: &str) -> Result<Step, CheckError> {
        let run = fetch_run(conn, id).await?;
        if run.state != RunState::QualityMetricFailed {
            return Ok(if run.ignore_output_quality_metrics {
                Step::Converged
            } else {
                Step::Ineligible
            });
        }
        conn.api
            .patch(
                id,
                json!({
                    "ignore_output_quality_metrics": true,
                    "state": RunState::Running,
                }),
            )
            .await?;
        tracing::info!(run = %id, "quality metric failure ignored");
        Ok(Step::Converged)
    }
}
