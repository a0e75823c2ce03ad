//! Creating workflow runs for entities that lack one.
//!
//! A `Workflow` template item names the workflow, the parent type it runs
//! on, and its steps:
//!
//! ```json
//! {"@type": "Workflow", "name": "bwa-mem", "parent_type": "SampleProcessing",
//!  "steps": [{"name": "align"}, {"name": "call", "depends_on": ["align"]}]}
//! ```

use std::collections::BTreeSet;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use foursight_engine::clients::SearchQuery;
use foursight_engine::{
    ActionDescriptor, ActionFn, CheckDescriptor, CheckError, CheckFn, Connection, ParamSpec,
    RegistryBuilder,
};
use foursight_interchange::{ActionResult, CheckResult, CheckStatus, Kwargs};

use super::model::{RunState, Shard, WORKFLOW_RUN};
use super::{sweep, Step, Transition, MORNING_CHECKS};

const WORKFLOW: &str = "Workflow";
const PARENT_TYPES: [&str; 3] = ["Case", "SampleProcessing", "Sample"];

pub(super) fn register(builder: &mut RegistryBuilder) {
    builder
        .check(
            CheckDescriptor::new("runs_to_create", RunsToCreate)
                .describe("Entities with no workflow run for a template that applies to them")
                .param(ParamSpec::new("workflow"))
                .param(
                    ParamSpec::new("parent_type")
                        .default_value("SampleProcessing")
                        .choices(PARENT_TYPES),
                )
                .action("create_runs")
                .group(MORNING_CHECKS),
        )
        .action(
            ActionDescriptor::new("create_runs", CreateRuns)
                .describe("Create a pending workflow run for each listed entity"),
        );
}

#[derive(Debug, Clone, Deserialize)]
struct TemplateStep {
    name: String,
    #[serde(default)]
    depends_on: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct Template {
    name: String,
    parent_type: String,
    #[serde(default)]
    steps: Vec<TemplateStep>,
}

impl Template {
    fn from_item(item: &Value) -> Result<Self, CheckError> {
        serde_json::from_value(item.clone())
            .map_err(|e| CheckError::Validation(format!("workflow template is malformed: {}", e)))
    }

    fn shards(&self) -> Vec<Shard> {
        self.steps
            .iter()
            .map(|step| {
                let mut shard = Shard::pending(&step.name);
                shard.depends_on = step.depends_on.clone();
                shard
            })
            .collect()
    }
}

/// One run to create: a template applied to a parent.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
struct Pending {
    workflow: String,
    parent: String,
}

impl Pending {
    fn id(&self) -> String {
        format!("{}:{}", self.workflow, self.parent)
    }

    fn parse(id: &str) -> Result<Self, CheckError> {
        let (workflow, parent) = id
            .split_once(':')
            .ok_or_else(|| CheckError::Validation(format!("bad candidate {}", id)))?;
        Ok(Self {
            workflow: workflow.to_string(),
            parent: parent.to_string(),
        })
    }
}

async fn templates(
    conn: &Connection,
    parent_type: &str,
    workflow: Option<&str>,
) -> Result<Vec<Template>, CheckError> {
    let mut query = SearchQuery::new(WORKFLOW).eq("parent_type", parent_type);
    if let Some(name) = workflow {
        query = query.eq("name", name);
    }
    let found: Vec<Template> = conn
        .api
        .search(&query)
        .await?
        .iter()
        .map(Template::from_item)
        .collect::<Result<_, _>>()?;
    if let (Some(name), true) = (workflow, found.is_empty()) {
        return Err(CheckError::NotFound(format!(
            "workflow template {} for {}",
            name, parent_type
        )));
    }
    Ok(found)
}

/// Parents that already have a run of `workflow`.
async fn covered(conn: &Connection, workflow: &str) -> Result<BTreeSet<String>, CheckError> {
    let query = SearchQuery::new(WORKFLOW_RUN).eq("workflow", workflow);
    Ok(conn
        .api
        .search(&query)
        .await?
        .iter()
        .filter_map(|item| item.get("parent").and_then(Value::as_str))
        .map(str::to_string)
        .collect())
}

struct RunsToCreate;

#[async_trait]
impl CheckFn for RunsToCreate {
    async fn run(
        &self,
        conn: &Connection,
        kwargs: &Kwargs,
        result: &mut CheckResult,
    ) -> Result<(), CheckError> {
        let parent_type = kwargs.get_str("parent_type").unwrap_or("SampleProcessing");
        let parents: Vec<String> = conn
            .api
            .search(&SearchQuery::new(parent_type))
            .await?
            .iter()
            .filter_map(|item| item.get("uuid").and_then(Value::as_str))
            .map(str::to_string)
            .collect();

        let mut pending = Vec::new();
        for template in templates(conn, parent_type, kwargs.get_str("workflow")).await? {
            let done = covered(conn, &template.name).await?;
            pending.extend(
                parents
                    .iter()
                    .filter(|p| !done.contains(*p))
                    .map(|p| Pending {
                        workflow: template.name.clone(),
                        parent: p.clone(),
                    }),
            );
        }
        pending.sort();

        let count = pending.len();
        if count == 0 {
            result.status = CheckStatus::Pass;
            result.summary = "No workflow runs to create".to_string();
        } else {
            result.status = CheckStatus::Warn;
            result.summary = format!("{} workflow runs to create", count);
            result.allow_action = true;
            result.action_message = format!("Will create {} workflow runs", count);
        }
        result.brief_output = json!({ "count": count, "parent_type": parent_type });
        result.full_output = json!({
            "parent_type": parent_type,
            "runs": pending.iter().map(Pending::id).collect::<Vec<_>>(),
        });
        Ok(())
    }
}

struct CreateRuns;

#[async_trait]
impl ActionFn for CreateRuns {
    async fn run(
        &self,
        conn: &Connection,
        kwargs: &Kwargs,
        result: &mut ActionResult,
    ) -> Result<(), CheckError> {
        let upstream = conn.upstream_check(kwargs).await?;
        let parent_type = upstream
            .full_output
            .get("parent_type")
            .and_then(Value::as_str)
            .ok_or_else(|| CheckError::Validation("upstream result names no parent_type".into()))?
            .to_string();
        let candidates = super::listed(&upstream.full_output, "runs");
        sweep(conn, candidates, &CreateRun { parent_type }, result).await;
        Ok(())
    }
}

struct CreateRun {
    parent_type: String,
}

#[async_trait]
impl Transition for CreateRun {
    async fn apply(&self, conn: &Connection, id: &str) -> Result<Step, CheckError> {
        let pending = Pending::parse(id)?;
        let existing = SearchQuery::new(WORKFLOW_RUN)
            .eq("workflow", pending.workflow.as_str())
            .eq("parent", pending.parent.as_str())
            .limit(1);
        if !conn.api.search(&existing).await?.is_empty() {
            return Ok(Step::Converged);
        }

        let template = templates(conn, &self.parent_type, Some(&pending.workflow))
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| CheckError::NotFound(format!("workflow template {}", pending.workflow)))?;
        let parent = conn.api.get(&pending.parent).await?;
        let samples = match self.parent_type.as_str() {
            "Sample" => vec![Value::String(pending.parent.clone())],
            _ => parent
                .get("samples")
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default(),
        };
        let sample_processing = match self.parent_type.as_str() {
            "SampleProcessing" => Value::String(pending.parent.clone()),
            _ => parent.get("sample_processing").cloned().unwrap_or(Value::Null),
        };

        let body = json!({
            "workflow": template.name,
            "state": RunState::Pending,
            "parent": pending.parent,
            "parent_type": self.parent_type,
            "shards": template.shards(),
            "samples": samples,
            "sample_processing": sample_processing,
            "output_files": [],
        });
        let created = conn.api.post(WORKFLOW_RUN, body).await?;
        tracing::info!(
            workflow = %pending.workflow,
            parent = %pending.parent,
            run = created.get("uuid").and_then(serde_json::Value::as_str).unwrap_or("?"),
            "workflow run created"
        );
        Ok(Step::Converged)
    }
}
