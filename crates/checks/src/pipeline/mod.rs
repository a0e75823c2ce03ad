//! Check/action pairs that move workflow runs through their states.
//!
//! Each check searches the portal for runs needing one transition and
//! lists them in `full_output.runs`. Its action re-reads every listed run
//! before writing, so a stale list or a second concurrent action does no
//! harm.

mod create;
mod kill;
mod link;
pub mod model;
mod poll;
mod qc;
mod reset;
mod start;

use async_trait::async_trait;
use rand::seq::SliceRandom;
use serde_json::{json, Value};

use foursight_engine::clients::SearchQuery;
use foursight_engine::{ActionOutput, CheckError, Connection, RegistryBuilder};
use foursight_interchange::{ActionResult, CheckResult, CheckStatus};

use model::{RunState, WorkflowRun, WORKFLOW_RUN};

pub const TEN_MIN_CHECKS: &str = "ten_min_checks";
pub const HOURLY_CHECKS: &str = "hourly_checks";
pub const MORNING_CHECKS: &str = "morning_checks";

pub fn register(builder: &mut RegistryBuilder) {
    start::register(builder);
    poll::register(builder);
    reset::register(builder);
    kill::register(builder);
    link::register(builder);
    qc::register(builder);
    create::register(builder);
}

// ──────────────────────────────────────────────
// Checks
// ──────────────────────────────────────────────

/// Workflow runs in any of `states`.
pub(crate) async fn runs_in(
    conn: &Connection,
    states: &[RunState],
) -> Result<Vec<WorkflowRun>, CheckError> {
    let query = SearchQuery::new(WORKFLOW_RUN).is_in("state", states.iter().map(|s| s.as_str()));
    let items = conn.api.search(&query).await?;
    items.iter().map(WorkflowRun::from_item).collect()
}

/// Fill `result` from the runs a check selected. Candidates make the
/// result `WARN` and eligible for its action.
pub(crate) fn report_runs(result: &mut CheckResult, runs: Vec<String>, what: &str) {
    if runs.is_empty() {
        result.status = CheckStatus::Pass;
        result.summary = format!("No workflow runs {}", what);
        result.allow_action = false;
    } else {
        result.status = CheckStatus::Warn;
        result.summary = format!("{} workflow runs {}", runs.len(), what);
        result.allow_action = true;
        result.action_message = format!("Will act on {} workflow runs", runs.len());
    }
    result.brief_output = json!({ "count": runs.len() });
    result.full_output = json!({ "runs": runs });
}

/// String list under `key` of a check's `full_output`.
pub(crate) fn listed(output: &Value, key: &str) -> Vec<String> {
    output
        .get(key)
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

// ──────────────────────────────────────────────
// Actions
// ──────────────────────────────────────────────

/// What one pass over a candidate ended with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Step {
    /// The candidate is now in the state the action wants, whether or not
    /// this pass wrote anything.
    Converged,
    /// The candidate no longer qualifies; nothing was written.
    Ineligible,
}

/// The per-candidate half of an action.
#[async_trait]
pub(crate) trait Transition: Send + Sync {
    async fn apply(&self, conn: &Connection, id: &str) -> Result<Step, CheckError>;
}

/// Visit `candidates` in random order until done or out of budget, then
/// record the outcome in `result`.
pub(crate) async fn sweep(
    conn: &Connection,
    candidates: Vec<String>,
    transition: &dyn Transition,
    result: &mut ActionResult,
) {
    let mut order = candidates;
    order.shuffle(&mut rand::thread_rng());

    let mut output = ActionOutput::new();
    let mut cut_short = false;
    for id in order {
        if conn.budget.is_past_time_limit() {
            cut_short = true;
            break;
        }
        match transition.apply(conn, &id).await {
            Ok(Step::Converged) => output.succeeded(id),
            Ok(Step::Ineligible) => output.skipped(id),
            Err(err) => {
                tracing::warn!(action = %result.name, candidate = %id, error = %err, "candidate failed");
                output.failed(id, err);
            }
        }
    }
    output.success.sort();
    output.skipped.sort();
    tracing::info!(
        action = %result.name,
        success = output.success.len(),
        error = output.error.len(),
        skipped = output.skipped.len(),
        cut_short,
        "sweep finished"
    );
    output.finish(result, cut_short);
}

/// Re-read a run straight from the portal.
pub(crate) async fn fetch_run(conn: &Connection, id: &str) -> Result<WorkflowRun, CheckError> {
    let item = conn.api.get(id).await?;
    WorkflowRun::from_item(&item)
}
