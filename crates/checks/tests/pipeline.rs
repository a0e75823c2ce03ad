use std::time::Duration;

use bytes::Bytes;
use serde_json::{json, Value};

use foursight_checks::registry;
use foursight_engine::clients::{DomainApi, JobState, LaunchRequest, SearchQuery, WorkflowEngine};
use foursight_engine::testing::Fixture;
use foursight_engine::{dispatch, execute, Record, WorkerSettings, TIME_LIMIT_NOTE};
use foursight_interchange::{
    ActionResult, ActionStatus, CheckResult, CheckStatus, Kwargs, QueueItem, RunId,
};
use foursight_storage::{ObjectStore, Precondition};

fn fixture() -> Fixture {
    Fixture::new(registry().unwrap(), "prod")
}

fn workflow_run(uuid: &str, state: &str, shards: Value) -> Value {
    json!({
        "@type": "WorkflowRun",
        "uuid": uuid,
        "workflow": "bwa-mem",
        "state": state,
        "shards": shards,
    })
}

/// Run a check through the worker path and store its result.
async fn run_check(fx: &Fixture, name: &str, args: Value) -> CheckResult {
    let mut kwargs = Kwargs::from_value(args).unwrap();
    // Run ids have microsecond resolution; keep successive runs apart.
    std::thread::sleep(Duration::from_millis(1));
    kwargs.set_uuid(&RunId::now());
    kwargs.set_primary(true);
    let dispatched = dispatch(&fx.ctx, &QueueItem::new(name, kwargs), true)
        .await
        .unwrap();
    match dispatched.executed.record {
        Record::Check(result) => result,
        other => panic!("expected a check result, got {:?}", other),
    }
}

/// Run an action against a stored check result without storing its own.
async fn run_action(fx: &Fixture, name: &str, upstream: &CheckResult) -> ActionResult {
    let mut kwargs = Kwargs::new();
    kwargs.set_check_name(&upstream.name);
    kwargs.set_uuid(&upstream.uuid);
    let executed = execute(&fx.ctx, &QueueItem::new(name, kwargs)).await.unwrap();
    match executed.record {
        Record::Action(result) => result,
        other => panic!("expected an action result, got {:?}", other),
    }
}

fn success(result: &ActionResult) -> Vec<String> {
    serde_json::from_value(result.output["success"].clone()).unwrap()
}

fn field<'a>(item: &'a Value, path: &str) -> &'a Value {
    path.split('.').fold(item, |v, part| match part.parse::<usize>() {
        Ok(i) => &v[i],
        Err(_) => &v[part],
    })
}

async fn launch(fx: &Fixture, run: &str, shard: &str) -> String {
    fx.workflows
        .launch(&LaunchRequest {
            workflow: "bwa-mem".into(),
            run: run.into(),
            shard: shard.into(),
            inputs: Value::Null,
        })
        .await
        .unwrap()
}

// ──────────────────────────────────────────────
// Start
// ──────────────────────────────────────────────

#[tokio::test]
async fn start_launches_ready_shards_once() {
    let fx = fixture();
    fx.api.insert(workflow_run(
        "run-1",
        "pending",
        json!([
            {"name": "align", "state": "pending"},
            {"name": "call", "state": "pending", "depends_on": ["align"]}
        ]),
    ));
    fx.api.insert(workflow_run(
        "run-2",
        "running",
        json!([
            {"name": "align", "state": "completed"},
            {"name": "call", "state": "pending", "depends_on": ["align"]}
        ]),
    ));
    fx.api.insert(workflow_run(
        "run-3",
        "running",
        json!([{"name": "align", "state": "running", "job_id": "job-x"}]),
    ));

    let check = run_check(&fx, "runs_to_start", json!({})).await;
    assert_eq!(check.status, CheckStatus::Warn);
    assert!(check.allow_action);
    assert_eq!(check.full_output, json!({"runs": ["run-1", "run-2"]}));

    let first = run_action(&fx, "start_runs", &check).await;
    assert_eq!(first.status, ActionStatus::Done);
    assert_eq!(success(&first), vec!["run-1", "run-2"]);

    let launched: Vec<(String, String)> = fx
        .workflows
        .launches()
        .into_iter()
        .map(|r| (r.run, r.shard))
        .collect();
    assert_eq!(launched.len(), 2);
    assert!(launched.contains(&("run-1".into(), "align".into())));
    assert!(launched.contains(&("run-2".into(), "call".into())));

    let run1 = fx.api.item("run-1").unwrap();
    assert_eq!(run1["state"], "running");
    assert_eq!(field(&run1, "shards.0.state"), "running");
    assert!(field(&run1, "shards.0.job_id").is_string());
    assert_eq!(field(&run1, "shards.1.state"), "pending");

    let second = run_action(&fx, "start_runs", &check).await;
    assert_eq!(success(&second), success(&first));
    assert_eq!(fx.workflows.launches().len(), 2);
}

#[tokio::test]
async fn start_skips_runs_that_were_stopped_meanwhile() {
    let fx = fixture();
    fx.api.insert(workflow_run(
        "run-1",
        "pending",
        json!([{"name": "align", "state": "pending"}]),
    ));
    let check = run_check(&fx, "runs_to_start", json!({})).await;
    fx.api
        .patch("run-1", json!({"state": "stopped"}))
        .await
        .unwrap();

    let action = run_action(&fx, "start_runs", &check).await;
    assert_eq!(action.status, ActionStatus::Done);
    assert_eq!(action.output["skipped"], json!(["run-1"]));
    assert!(fx.workflows.launches().is_empty());
}

// ──────────────────────────────────────────────
// Poll
// ──────────────────────────────────────────────

#[tokio::test]
async fn poll_copies_engine_states_and_rolls_up() {
    let fx = fixture();
    let job = launch(&fx, "run-1", "align").await;
    fx.api.insert(workflow_run(
        "run-1",
        "running",
        json!([{"name": "align", "state": "running", "job_id": job}]),
    ));

    let quiet = run_check(&fx, "runs_to_poll", json!({})).await;
    assert_eq!(quiet.status, CheckStatus::Pass);
    assert!(!quiet.allow_action);

    fx.workflows.set_state(&job, JobState::Succeeded);
    let check = run_check(&fx, "runs_to_poll", json!({})).await;
    assert_eq!(check.status, CheckStatus::Warn);
    assert_eq!(check.full_output["runs"], json!(["run-1"]));

    let first = run_action(&fx, "poll_runs", &check).await;
    assert_eq!(first.status, ActionStatus::Done);
    let run = fx.api.item("run-1").unwrap();
    assert_eq!(run["state"], "completed");
    assert_eq!(field(&run, "shards.0.state"), "completed");

    let writes = fx.api.write_count();
    let second = run_action(&fx, "poll_runs", &check).await;
    assert_eq!(success(&second), success(&first));
    assert_eq!(fx.api.write_count(), writes);
}

#[tokio::test(start_paused = true)]
async fn poll_check_stops_at_its_budget() {
    let settings = WorkerSettings {
        time_limit: Duration::from_secs(1),
        ..WorkerSettings::default()
    };
    let fx = Fixture::with_settings(registry().unwrap(), "prod", settings);
    for i in 0..1000 {
        let id = format!("run-{:04}", i);
        let job = launch(&fx, &id, "align").await;
        fx.api.insert(workflow_run(
            &id,
            "running",
            json!([{"name": "align", "state": "running", "job_id": job}]),
        ));
    }
    fx.workflows.set_latency(Duration::from_millis(10));

    let mut kwargs = Kwargs::new();
    kwargs.set_uuid(&RunId::now());
    kwargs.set_primary(true);
    fx.enqueue(&QueueItem::new("runs_to_poll", kwargs)).await.unwrap();
    let outcomes = fx.drain().await.unwrap();
    assert_eq!(outcomes.len(), 1);

    let result: CheckResult = fx.results.get_primary("runs_to_poll").await.unwrap().unwrap();
    assert_eq!(result.status, CheckStatus::Pass);
    assert!(result.description.contains(TIME_LIMIT_NOTE));
    let processed = result.brief_output["processed"].as_u64().unwrap();
    assert!(processed >= 1 && processed < 1000, "processed {}", processed);
    assert_eq!(result.brief_output["total"], 1000);
    assert!(fx.primary.is_empty());
}

#[tokio::test(start_paused = true)]
async fn poll_action_pends_when_its_budget_runs_out() {
    let settings = WorkerSettings {
        time_limit: Duration::from_secs(1),
        ..WorkerSettings::default()
    };
    let fx = Fixture::with_settings(registry().unwrap(), "prod", settings);
    let total = 200;
    for i in 0..total {
        let id = format!("run-{:04}", i);
        let job = launch(&fx, &id, "align").await;
        fx.workflows.set_state(&job, JobState::Succeeded);
        fx.api.insert(workflow_run(
            &id,
            "running",
            json!([{"name": "align", "state": "running", "job_id": job}]),
        ));
    }

    let check = run_check(&fx, "runs_to_poll", json!({})).await;
    assert_eq!(check.full_output["runs"].as_array().unwrap().len(), total);

    // Each run now costs 10ms of engine time; the action gets through about
    // half before its budget is spent.
    fx.workflows.set_latency(Duration::from_millis(10));
    let action = run_action(&fx, "poll_runs", &check).await;
    assert_eq!(action.status, ActionStatus::Pend);
    assert!(action.description.contains(TIME_LIMIT_NOTE));
    assert_eq!(action.output["note"], TIME_LIMIT_NOTE);
    let done = success(&action);
    assert!(!done.is_empty() && done.len() < total, "converged {}", done.len());
    for id in &done {
        assert_eq!(fx.api.item(id).unwrap()["state"], "completed");
    }
}

// ──────────────────────────────────────────────
// Reset
// ──────────────────────────────────────────────

#[tokio::test]
async fn spot_reset_touches_only_spot_failed_shards() {
    let fx = fixture();
    fx.api.insert(workflow_run(
        "run-1",
        "failed",
        json!([
            {"name": "shard-0", "state": "failed", "job_id": "job-a", "failure": "exit status 1"},
            {"name": "shard-1", "state": "failed", "job_id": "job-b", "failure": "out of memory"}
        ]),
    ));
    fx.logs
        .put("job-a.spot_failure", Bytes::from_static(b""), Precondition::None)
        .await
        .unwrap();

    let check = run_check(&fx, "spot_failed_runs", json!({})).await;
    assert_eq!(check.status, CheckStatus::Warn);
    assert_eq!(check.full_output["shards"], json!({"run-1": ["shard-0"]}));

    let action = run_action(&fx, "reset_spot_failed_runs", &check).await;
    assert_eq!(action.status, ActionStatus::Done);
    let run = fx.api.item("run-1").unwrap();
    assert_eq!(field(&run, "shards.0.state"), "pending");
    assert!(field(&run, "shards.0.job_id").is_null());
    assert_eq!(field(&run, "shards.1.state"), "failed");
    assert_eq!(field(&run, "shards.1.failure"), "out of memory");
    assert_eq!(run["state"], "failed");

    let again = run_action(&fx, "reset_spot_failed_runs", &check).await;
    assert_eq!(success(&again), success(&action));
}

#[tokio::test]
async fn spot_failure_text_is_a_fallback() {
    let fx = fixture();
    fx.api.insert(workflow_run(
        "run-1",
        "failed",
        json!([{"name": "s", "state": "failed", "job_id": "job-c",
                "failure": "Host EC2 (instance i-0abc) terminated."}]),
    ));
    fx.api.insert(workflow_run(
        "run-2",
        "failed",
        json!([{"name": "s", "state": "failed", "job_id": "job-d", "failure": "bad input"}]),
    ));
    let check = run_check(&fx, "spot_failed_runs", json!({})).await;
    assert_eq!(check.full_output["runs"], json!(["run-1"]));
}

#[tokio::test]
async fn resetting_every_failure_needs_the_flag() {
    let fx = fixture();
    fx.api.insert(workflow_run(
        "run-1",
        "failed",
        json!([{"name": "s", "state": "failed", "failure": "bad input"}]),
    ));

    let plain = run_check(&fx, "failed_runs", json!({})).await;
    assert_eq!(plain.status, CheckStatus::Warn);
    assert!(!plain.allow_action);

    let flagged = run_check(&fx, "failed_runs", json!({"reset_all": true})).await;
    assert!(flagged.allow_action);

    let action = run_action(&fx, "reset_failed_runs", &flagged).await;
    assert_eq!(action.status, ActionStatus::Done);
    let run = fx.api.item("run-1").unwrap();
    assert_eq!(run["state"], "pending");
}

// ──────────────────────────────────────────────
// Kill
// ──────────────────────────────────────────────

#[tokio::test]
async fn kill_stops_listed_runs() {
    let fx = fixture();
    let job = launch(&fx, "run-1", "align").await;
    fx.api.insert(workflow_run(
        "run-1",
        "running",
        json!([{"name": "align", "state": "running", "job_id": job}]),
    ));
    fx.api.insert(workflow_run("run-2", "completed", json!([])));

    let check = run_check(
        &fx,
        "runs_to_kill",
        json!({"runs": ["run-1", "run-2", "run-404"]}),
    )
    .await;
    assert_eq!(check.full_output["runs"], json!(["run-1"]));
    assert!(check.description.contains("run-404"));

    let first = run_action(&fx, "kill_runs", &check).await;
    assert_eq!(first.status, ActionStatus::Done);
    assert_eq!(fx.workflows.kills(), vec![job.clone()]);
    assert_eq!(fx.api.item("run-1").unwrap()["state"], "stopped");

    let second = run_action(&fx, "kill_runs", &check).await;
    assert_eq!(success(&second), success(&first));
    assert_eq!(fx.workflows.kills().len(), 1);
}

#[tokio::test]
async fn kill_check_requires_runs() {
    let fx = fixture();
    let check = run_check(&fx, "runs_to_kill", json!({})).await;
    assert_eq!(check.status, CheckStatus::Error);
}

// ──────────────────────────────────────────────
// Output files
// ──────────────────────────────────────────────

fn seed_linkable(fx: &Fixture) {
    fx.api.insert(json!({"@type": "Sample", "uuid": "sample-1"}));
    fx.api.insert(json!({"@type": "SampleProcessing", "uuid": "sp-1", "processed_files": ["old"]}));
    fx.api.insert(json!({"@type": "OutputFile", "uuid": "file-1", "linkto_location": ["Sample"]}));
    fx.api.insert(json!({"@type": "OutputFile", "uuid": "file-2", "linkto_location": "SampleProcessing"}));
    let mut run = workflow_run("run-1", "completed", json!([{"name": "s", "state": "completed"}]));
    run["output_files"] = json!(["file-1", "file-2"]);
    run["samples"] = json!(["sample-1"]);
    run["sample_processing"] = json!("sp-1");
    fx.api.insert(run);
}

#[tokio::test]
async fn concurrent_links_add_each_file_once() {
    let fx = fixture();
    seed_linkable(&fx);

    let check = run_check(&fx, "output_files_to_link", json!({})).await;
    assert_eq!(check.full_output["runs"], json!(["run-1"]));

    let (a, b) = tokio::join!(
        run_action(&fx, "link_output_files", &check),
        run_action(&fx, "link_output_files", &check),
    );
    assert_eq!(a.status, ActionStatus::Done);
    assert_eq!(b.status, ActionStatus::Done);
    assert_eq!(success(&a), success(&b));

    assert_eq!(fx.api.item("sample-1").unwrap()["processed_files"], json!(["file-1"]));
    assert_eq!(fx.api.item("sp-1").unwrap()["processed_files"], json!(["old", "file-2"]));
    assert_eq!(fx.api.item("run-1").unwrap()["output_files_linked_status"], "success");

    let after = run_check(&fx, "output_files_to_link", json!({})).await;
    assert_eq!(after.status, CheckStatus::Pass);
}

#[tokio::test]
async fn unlinkable_file_marks_the_run() {
    let fx = fixture();
    fx.api.insert(json!({"@type": "OutputFile", "uuid": "file-9"}));
    let mut run = workflow_run("run-1", "completed", json!([]));
    run["output_files"] = json!(["file-9"]);
    fx.api.insert(run);

    let check = run_check(&fx, "output_files_to_link", json!({})).await;
    let action = run_action(&fx, "link_output_files", &check).await;
    assert_eq!(action.status, ActionStatus::Fail);
    assert!(action.output["error"]["run-1"]
        .as_str()
        .unwrap()
        .contains("no linkto_location"));
    assert_eq!(fx.api.item("run-1").unwrap()["output_files_linked_status"], "error");
}

// ──────────────────────────────────────────────
// QC
// ──────────────────────────────────────────────

#[tokio::test]
async fn ignoring_qc_failures_resumes_runs() {
    let fx = fixture();
    fx.api.insert(workflow_run(
        "run-1",
        "quality-metric-failed",
        json!([{"name": "s", "state": "completed", "qc_failed": true}]),
    ));
    let check = run_check(&fx, "qc_failed_runs", json!({})).await;
    assert_eq!(check.full_output["runs"], json!(["run-1"]));

    let first = run_action(&fx, "ignore_qc_failures", &check).await;
    let run = fx.api.item("run-1").unwrap();
    assert_eq!(run["state"], "running");
    assert_eq!(run["ignore_output_quality_metrics"], true);

    let second = run_action(&fx, "ignore_qc_failures", &check).await;
    assert_eq!(success(&second), success(&first));

    // The next poll notices the run is really complete.
    let poll = run_check(&fx, "runs_to_poll", json!({})).await;
    assert_eq!(poll.full_output["runs"], json!(["run-1"]));
    run_action(&fx, "poll_runs", &poll).await;
    assert_eq!(fx.api.item("run-1").unwrap()["state"], "completed");
}

// ──────────────────────────────────────────────
// Creation
// ──────────────────────────────────────────────

#[tokio::test]
async fn creates_runs_for_uncovered_parents() {
    let fx = fixture();
    fx.api.insert(json!({
        "@type": "Workflow",
        "uuid": "wf-1",
        "name": "bwa-mem",
        "parent_type": "SampleProcessing",
        "steps": [{"name": "align"}, {"name": "call", "depends_on": ["align"]}]
    }));
    fx.api.insert(json!({"@type": "SampleProcessing", "uuid": "sp-1", "samples": ["s1"]}));
    fx.api.insert(json!({"@type": "SampleProcessing", "uuid": "sp-2", "samples": ["s2", "s3"]}));
    let mut existing = workflow_run("run-1", "running", json!([]));
    existing["parent"] = json!("sp-1");
    fx.api.insert(existing);

    let check = run_check(&fx, "runs_to_create", json!({"workflow": "bwa-mem"})).await;
    assert_eq!(check.status, CheckStatus::Warn);
    assert_eq!(check.full_output["runs"], json!(["bwa-mem:sp-2"]));

    let first = run_action(&fx, "create_runs", &check).await;
    assert_eq!(first.status, ActionStatus::Done);
    let second = run_action(&fx, "create_runs", &check).await;
    assert_eq!(success(&second), success(&first));

    let query = SearchQuery::new("WorkflowRun").eq("parent", "sp-2");
    let created = fx.api.search(&query).await.unwrap();
    assert_eq!(created.len(), 1);
    let run = &created[0];
    assert_eq!(run["state"], "pending");
    assert_eq!(run["samples"], json!(["s2", "s3"]));
    assert_eq!(run["sample_processing"], "sp-2");
    assert_eq!(field(run, "shards.1.depends_on"), &json!(["align"]));

    let after = run_check(&fx, "runs_to_create", json!({})).await;
    assert_eq!(after.status, CheckStatus::Pass);
}

#[tokio::test]
async fn creation_rejects_unknown_templates_and_parent_types() {
    let fx = fixture();
    let missing = run_check(&fx, "runs_to_create", json!({"workflow": "nope"})).await;
    assert_eq!(missing.status, CheckStatus::Error);

    let bad_type = run_check(&fx, "runs_to_create", json!({"parent_type": "Family"})).await;
    assert_eq!(bad_type.status, CheckStatus::Error);
    assert!(!bad_type.allow_action);
}
