//! Attaching a finished run's output files to the entities it ran on.

use async_trait::async_trait;
use serde_json::{json, Value};

use foursight_engine::{
    ActionDescriptor, ActionFn, CheckDescriptor, CheckError, CheckFn, Connection,
    RegistryBuilder,
};
use foursight_interchange::{ActionResult, CheckResult, Kwargs};

use super::model::{RunState, WorkflowRun, WORKFLOW_RUN};
use super::{fetch_run, listed, report_runs, sweep, Step, Transition, TEN_MIN_CHECKS};
use foursight_engine::clients::SearchQuery;

const LINKED_STATUS: &str = "output_files_linked_status";
const PROCESSED_FILES: &str = "processed_files";

pub(super) fn register(builder: &mut RegistryBuilder) {
    builder
        .check(
            CheckDescriptor::new("output_files_to_link", OutputFilesToLink)
                .describe("Completed workflow runs whose output files are not yet linked")
                .action("link_output_files")
                .group(TEN_MIN_CHECKS)
                .auto_action(),
        )
        .action(
            ActionDescriptor::new("link_output_files", LinkOutputFiles)
                .describe("Add each output file to the processed files of its samples"),
        );
}

struct OutputFilesToLink;

#[async_trait]
impl CheckFn for OutputFilesToLink {
    async fn run(
        &self,
        conn: &Connection,
        _kwargs: &Kwargs,
        result: &mut CheckResult,
    ) -> Result<(), CheckError> {
        let query = SearchQuery::new(WORKFLOW_RUN)
            .eq("state", RunState::Completed.as_str())
            .missing(LINKED_STATUS);
        let runs = conn
            .api
            .search(&query)
            .await?
            .iter()
            .filter_map(|item| item.get("uuid").and_then(Value::as_str))
            .map(str::to_string)
            .collect();
        report_runs(result, runs, "with unlinked output files");
        Ok(())
    }
}

struct LinkOutputFiles;

#[async_trait]
impl ActionFn for LinkOutputFiles {
    async fn run(
        &self,
        conn: &Connection,
        kwargs: &Kwargs,
        result: &mut ActionResult,
    ) -> Result<(), CheckError> {
        let upstream = conn.upstream_check(kwargs).await?;
        sweep(conn, listed(&upstream.full_output, "runs"), &LinkFiles, result).await;
        Ok(())
    }
}

/// The `linkto_location` tags of an output file. A single string counts
/// as one tag.
fn link_locations(file: &Value) -> Vec<String> {
    match file.get("linkto_location") {
        Some(Value::String(s)) => vec![s.clone()],
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(Value::as_str)
            .map(str::to_string)
            .collect(),
        _ => Vec::new(),
    }
}

/// Entities an output file goes to for one location tag.
fn parents_for(run: &WorkflowRun, location: &str) -> Result<Vec<String>, String> {
    match location {
        "Sample" if run.samples.is_empty() => Err("run has no samples".to_string()),
        "Sample" => Ok(run.samples.clone()),
        "SampleProcessing" => run
            .sample_processing
            .clone()
            .map(|sp| vec![sp])
            .ok_or_else(|| "run has no sample processing".to_string()),
        other => Err(format!("unknown linkto_location {}", other)),
    }
}

/// Append `file` to the parent's processed files unless it is already
/// there.
async fn link_to(conn: &Connection, parent: &str, file: &str) -> Result<(), CheckError> {
    let current = conn.api.get(parent).await?;
    let mut files: Vec<Value> = current
        .get(PROCESSED_FILES)
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();
    if files.iter().any(|f| f.as_str() == Some(file)) {
        return Ok(());
    }
    files.push(Value::String(file.to_string()));
    conn.api
        .patch(parent, json!({ PROCESSED_FILES: files }))
        .await?;
    tracing::debug!(parent = %parent, file = %file, "output file linked");
    Ok(())
}

async fn link_file(conn: &Connection, run: &WorkflowRun, file_id: &str) -> Result<(), String> {
    let file = conn.api.get(file_id).await.map_err(|e| e.to_string())?;
    let locations = link_locations(&file);
    if locations.is_empty() {
        return Err("no linkto_location".to_string());
    }
    for location in locations {
        for parent in parents_for(run, &location)? {
            link_to(conn, &parent, file_id)
                .await
                .map_err(|e| format!("{}: {}", parent, e))?;
        }
    }
    Ok(())
}

struct LinkFiles;

#[async_trait]
impl Transition for LinkFiles {
    async fn apply(&self, conn: &Connection, id: &str) -> Result<Step, CheckError> {
        let run = fetch_run(conn, id).await?;
        if run.output_files_linked_status.as_deref() == Some("success") {
            return Ok(Step::Converged);
        }
        if run.state != RunState::Completed {
            return Ok(Step::Ineligible);
        }

        let mut errors = Vec::new();
        for file_id in &run.output_files {
            if let Err(message) = link_file(conn, &run, file_id).await {
                errors.push(format!("{}: {}", file_id, message));
            }
        }
        let status = if errors.is_empty() { "success" } else { "error" };
        conn.api.patch(id, json!({ LINKED_STATUS: status })).await?;

        if errors.is_empty() {
            Ok(Step::Converged)
        } else {
            Err(CheckError::Domain(errors.join("; ")))
        }
    }
}
