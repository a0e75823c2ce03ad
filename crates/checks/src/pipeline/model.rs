//! Workflow runs as the portal stores them, and the rules that move them
//! between states.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use foursight_engine::clients::JobState;
use foursight_engine::CheckError;

pub const WORKFLOW_RUN: &str = "WorkflowRun";

/// Suffix of the marker object the job runner drops in the log bucket
/// when a spot instance is reclaimed.
pub const SPOT_MARKER_SUFFIX: &str = ".spot_failure";

/// Failure descriptions that point at a reclaimed spot instance. Only
/// consulted when no marker is present.
pub const SPOT_FAILURE_PATTERNS: [&str; 4] = [
    "EC2 instance terminated",
    "spot instance",
    "Host EC2 (instance",
    "Job terminated by spot",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RunState {
    Pending,
    Inactive,
    Running,
    Completed,
    Failed,
    QualityMetricFailed,
    Stopped,
}

impl RunState {
    pub fn as_str(self) -> &'static str {
        match self {
            RunState::Pending => "pending",
            RunState::Inactive => "inactive",
            RunState::Running => "running",
            RunState::Completed => "completed",
            RunState::Failed => "failed",
            RunState::QualityMetricFailed => "quality-metric-failed",
            RunState::Stopped => "stopped",
        }
    }

    /// No further transition happens without a person.
    pub fn is_terminal(self) -> bool {
        matches!(self, RunState::Completed | RunState::Stopped)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ShardState {
    Pending,
    Running,
    Completed,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Shard {
    pub name: String,
    pub state: ShardState,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<String>,
    #[serde(default)]
    pub qc_failed: bool,
}

impl Shard {
    pub fn pending(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: ShardState::Pending,
            depends_on: Vec::new(),
            job_id: None,
            failure: None,
            qc_failed: false,
        }
    }

    /// Back to `pending` with no job attached.
    pub fn reset(&mut self) {
        self.state = ShardState::Pending;
        self.job_id = None;
        self.failure = None;
        self.qc_failed = false;
    }

    /// Fold the engine's report into the shard. Returns whether anything
    /// changed.
    pub fn apply_job_state(&mut self, job: &JobState) -> bool {
        let (state, failure) = match job {
            JobState::Pending | JobState::Running => (ShardState::Running, None),
            JobState::Succeeded => (ShardState::Completed, None),
            JobState::Failed { reason } => (ShardState::Failed, Some(reason.clone())),
            JobState::Killed => (ShardState::Failed, Some("job killed".to_string())),
        };
        if self.state == state && self.failure == failure {
            return false;
        }
        self.state = state;
        self.failure = failure;
        true
    }

    /// Launched and not yet finished.
    pub fn is_active(&self) -> bool {
        self.state == ShardState::Running && self.job_id.is_some()
    }
}

/// The fields of a portal `WorkflowRun` the pipeline reads and writes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowRun {
    pub uuid: String,
    pub workflow: String,
    pub state: RunState,
    #[serde(default)]
    pub shards: Vec<Shard>,
    #[serde(default)]
    pub ignore_output_quality_metrics: bool,
    #[serde(default)]
    pub output_files: Vec<String>,
    #[serde(default)]
    pub output_files_linked_status: Option<String>,
    #[serde(default)]
    pub sample_processing: Option<String>,
    #[serde(default)]
    pub samples: Vec<String>,
    /// The entity the run was created for.
    #[serde(default)]
    pub parent: Option<String>,
    #[serde(default)]
    pub parent_type: Option<String>,
}

impl WorkflowRun {
    pub fn from_item(item: &Value) -> Result<Self, CheckError> {
        serde_json::from_value(item.clone()).map_err(|e| {
            let id = item.get("uuid").and_then(Value::as_str).unwrap_or("?");
            CheckError::Validation(format!("workflow run {} is malformed: {}", id, e))
        })
    }

    /// State implied by the shards. Runs a person stopped stay stopped.
    pub fn rollup(&self) -> RunState {
        if self.state == RunState::Stopped {
            return RunState::Stopped;
        }
        if self.shards.iter().any(|s| s.state == ShardState::Failed) {
            return RunState::Failed;
        }
        if !self.shards.is_empty() && self.shards.iter().all(|s| s.state == ShardState::Completed) {
            let qc_failed = self.shards.iter().any(|s| s.qc_failed);
            return if qc_failed && !self.ignore_output_quality_metrics {
                RunState::QualityMetricFailed
            } else {
                RunState::Completed
            };
        }
        if self.shards.iter().all(|s| s.state == ShardState::Pending) {
            return RunState::Pending;
        }
        RunState::Running
    }

    fn shard_completed(&self, name: &str) -> bool {
        self.shards
            .iter()
            .any(|s| s.name == name && s.state == ShardState::Completed)
    }

    /// Pending shards whose dependencies have all completed.
    pub fn launchable(&self) -> Vec<&Shard> {
        self.shards
            .iter()
            .filter(|s| s.state == ShardState::Pending)
            .filter(|s| s.depends_on.iter().all(|d| self.shard_completed(d)))
            .collect()
    }

    pub fn failed_shards(&self) -> impl Iterator<Item = &Shard> {
        self.shards.iter().filter(|s| s.state == ShardState::Failed)
    }

    pub fn shard_mut(&mut self, name: &str) -> Option<&mut Shard> {
        self.shards.iter_mut().find(|s| s.name == name)
    }

    /// Patch body carrying the shards and the rolled-up state.
    pub fn progress_patch(&self) -> Value {
        serde_json::json!({
            "shards": self.shards,
            "state": self.rollup(),
        })
    }
}

/// Whether a failure description reads like a reclaimed spot instance.
pub fn looks_like_spot_failure(description: &str) -> bool {
    SPOT_FAILURE_PATTERNS
        .iter()
        .any(|pattern| description.contains(pattern))
}

pub fn spot_marker_key(job_id: &str) -> String {
    format!("{}{}", job_id, SPOT_MARKER_SUFFIX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn shard(name: &str, state: ShardState) -> Shard {
        let mut s = Shard::pending(name);
        s.state = state;
        s
    }

    fn run(shards: Vec<Shard>) -> WorkflowRun {
        WorkflowRun {
            uuid: "r".into(),
            workflow: "w".into(),
            state: RunState::Running,
            shards,
            ignore_output_quality_metrics: false,
            output_files: Vec::new(),
            output_files_linked_status: None,
            sample_processing: None,
            samples: Vec::new(),
            parent: None,
            parent_type: None,
        }
    }

    #[test]
    fn rollup_rules() {
        use ShardState::*;
        assert_eq!(run(vec![shard("a", Pending)]).rollup(), RunState::Pending);
        assert_eq!(
            run(vec![shard("a", Completed), shard("b", Pending)]).rollup(),
            RunState::Running
        );
        assert_eq!(
            run(vec![shard("a", Failed), shard("b", Running)]).rollup(),
            RunState::Failed
        );
        assert_eq!(
            run(vec![shard("a", Completed), shard("b", Completed)]).rollup(),
            RunState::Completed
        );

        let mut qc = run(vec![shard("a", Completed)]);
        qc.shards[0].qc_failed = true;
        assert_eq!(qc.rollup(), RunState::QualityMetricFailed);
        qc.ignore_output_quality_metrics = true;
        assert_eq!(qc.rollup(), RunState::Completed);

        let mut stopped = run(vec![shard("a", Running)]);
        stopped.state = RunState::Stopped;
        assert_eq!(stopped.rollup(), RunState::Stopped);
    }

    #[test]
    fn launchable_waits_for_dependencies() {
        use ShardState::*;
        let mut align = shard("align", Completed);
        align.depends_on = vec![];
        let mut call = shard("call", Pending);
        call.depends_on = vec!["align".into()];
        let mut annotate = shard("annotate", Pending);
        annotate.depends_on = vec!["call".into()];
        let r = run(vec![align, call, annotate]);
        let names: Vec<&str> = r.launchable().iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["call"]);
    }

    #[test]
    fn terminal_states_and_failed_shards() {
        use ShardState::*;
        assert!(RunState::Completed.is_terminal());
        assert!(RunState::Stopped.is_terminal());
        assert!(!RunState::Failed.is_terminal());
        assert!(!RunState::QualityMetricFailed.is_terminal());

        let r = run(vec![shard("a", Failed), shard("b", Completed), shard("c", Failed)]);
        let names: Vec<&str> = r.failed_shards().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["a", "c"]);
    }

    #[test]
    fn job_states_map_onto_shards() {
        let mut s = shard("a", ShardState::Running);
        assert!(!s.apply_job_state(&JobState::Running));
        assert!(s.apply_job_state(&JobState::Failed {
            reason: "Host EC2 (instance i-1) terminated".into()
        }));
        assert_eq!(s.state, ShardState::Failed);
        assert!(looks_like_spot_failure(s.failure.as_deref().unwrap()));
        assert!(!looks_like_spot_failure("out of memory"));
    }

    #[test]
    fn parses_portal_item() {
        let r = WorkflowRun::from_item(&json!({
            "@type": "WorkflowRun",
            "uuid": "r1",
            "workflow": "bwa-mem",
            "state": "quality-metric-failed",
            "shards": [{"name": "s0", "state": "completed", "qc_failed": true}],
            "sid": 12
        }))
        .unwrap();
        assert_eq!(r.state, RunState::QualityMetricFailed);
        assert!(r.shards[0].qc_failed);
        assert!(WorkflowRun::from_item(&json!({"uuid": "bad"})).is_err());
    }
}
