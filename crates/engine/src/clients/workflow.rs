use std::collections::BTreeMap;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::http::{join_url, JsonRequest, Method};
use super::{ApiError, Unconfigured};

/// State of one launched job as the engine reports it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum JobState {
    Pending,
    Running,
    Succeeded,
    Failed { reason: String },
    Killed,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Succeeded | JobState::Failed { .. } | JobState::Killed
        )
    }
}

/// A job to launch for one shard of a workflow run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LaunchRequest {
    pub workflow: String,
    pub run: String,
    pub shard: String,
    #[serde(default)]
    pub inputs: Value,
}

/// The engine that executes pipeline jobs.
#[async_trait]
pub trait WorkflowEngine: Send + Sync + 'static {
    /// Start a job. Returns its id.
    async fn launch(&self, request: &LaunchRequest) -> Result<String, ApiError>;

    async fn status(&self, job_id: &str) -> Result<JobState, ApiError>;

    async fn kill(&self, job_id: &str) -> Result<(), ApiError>;
}

#[async_trait]
impl WorkflowEngine for Unconfigured {
    async fn launch(&self, _request: &LaunchRequest) -> Result<String, ApiError> {
        Err(ApiError::NotConfigured {
            service: "workflow",
        })
    }

    async fn status(&self, _job_id: &str) -> Result<JobState, ApiError> {
        Err(ApiError::NotConfigured {
            service: "workflow",
        })
    }

    async fn kill(&self, _job_id: &str) -> Result<(), ApiError> {
        Err(ApiError::NotConfigured {
            service: "workflow",
        })
    }
}

// ──────────────────────────────────────────────
// HTTP
// ──────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct HttpWorkflowEngine {
    base_url: String,
    token: Option<String>,
    timeout: Duration,
}

impl HttpWorkflowEngine {
    pub fn new(base_url: impl Into<String>, token: Option<String>) -> Self {
        Self {
            base_url: base_url.into(),
            token,
            timeout: Duration::from_secs(30),
        }
    }

    fn request(&self, method: Method, path: &str) -> JsonRequest {
        JsonRequest::new(method, join_url(&self.base_url, path), self.timeout)
            .bearer(self.token.as_deref())
    }
}

#[async_trait]
impl WorkflowEngine for HttpWorkflowEngine {
    async fn launch(&self, request: &LaunchRequest) -> Result<String, ApiError> {
        let body = serde_json::to_value(request).map_err(|e| ApiError::Decode {
            url: join_url(&self.base_url, "jobs"),
            message: e.to_string(),
        })?;
        let response = self.request(Method::Post, "jobs").body(body).send().await?;
        response
            .get("job_id")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| ApiError::Decode {
                url: join_url(&self.base_url, "jobs"),
                message: "response has no job_id".into(),
            })
    }

    async fn status(&self, job_id: &str) -> Result<JobState, ApiError> {
        let path = format!("jobs/{}", job_id);
        let body = self.request(Method::Get, &path).send().await?;
        serde_json::from_value(body).map_err(|e| ApiError::Decode {
            url: join_url(&self.base_url, &path),
            message: e.to_string(),
        })
    }

    async fn kill(&self, job_id: &str) -> Result<(), ApiError> {
        let path = format!("jobs/{}", job_id);
        match self.request(Method::Delete, &path).send().await {
            Ok(_) => Ok(()),
            // Already gone.
            Err(ApiError::Status { status: 404, .. }) => Ok(()),
            Err(e) => Err(e),
        }
    }
}

// ──────────────────────────────────────────────
// In memory
// ──────────────────────────────────────────────

#[derive(Debug, Default)]
struct Jobs {
    next: u64,
    jobs: BTreeMap<String, (LaunchRequest, JobState)>,
    kills: Vec<String>,
    latency: Duration,
}

/// Jobs that stay wherever the test puts them.
#[derive(Debug, Default)]
pub struct MemoryWorkflowEngine {
    jobs: Mutex<Jobs>,
}

impl MemoryWorkflowEngine {
    pub fn new() -> Self {
        Self::default()
    }

    fn jobs(&self) -> std::sync::MutexGuard<'_, Jobs> {
        self.jobs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set_state(&self, job_id: &str, state: JobState) {
        if let Some(job) = self.jobs().jobs.get_mut(job_id) {
            job.1 = state;
        }
    }

    pub fn launches(&self) -> Vec<LaunchRequest> {
        self.jobs().jobs.values().map(|(r, _)| r.clone()).collect()
    }

    pub fn kills(&self) -> Vec<String> {
        self.jobs().kills.clone()
    }

    /// Delay every status query by `latency`, on tokio's clock.
    pub fn set_latency(&self, latency: Duration) {
        self.jobs().latency = latency;
    }
}

#[async_trait]
impl WorkflowEngine for MemoryWorkflowEngine {
    async fn launch(&self, request: &LaunchRequest) -> Result<String, ApiError> {
        let mut jobs = self.jobs();
        jobs.next += 1;
        let id = format!("job-{}", jobs.next);
        jobs.jobs
            .insert(id.clone(), (request.clone(), JobState::Pending));
        Ok(id)
    }

    async fn status(&self, job_id: &str) -> Result<JobState, ApiError> {
        let latency = self.jobs().latency;
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        self.jobs()
            .jobs
            .get(job_id)
            .map(|(_, state)| state.clone())
            .ok_or_else(|| ApiError::NotFound {
                what: format!("job {}", job_id),
            })
    }

    async fn kill(&self, job_id: &str) -> Result<(), ApiError> {
        let mut jobs = self.jobs();
        if let Some(job) = jobs.jobs.get_mut(job_id) {
            job.1 = JobState::Killed;
        }
        jobs.kills.push(job_id.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn job_state_wire_form() {
        let failed = JobState::Failed {
            reason: "spot instance reclaimed".into(),
        };
        let value = serde_json::to_value(&failed).unwrap();
        assert_eq!(
            value,
            json!({"state": "failed", "reason": "spot instance reclaimed"})
        );
        assert!(failed.is_terminal());
        assert!(!JobState::Running.is_terminal());
    }

    #[tokio::test]
    async fn memory_jobs_move_through_states() {
        let engine = MemoryWorkflowEngine::new();
        let id = engine
            .launch(&LaunchRequest {
                workflow: "bwa-mem".into(),
                run: "r1".into(),
                shard: "s1".into(),
                inputs: Value::Null,
            })
            .await
            .unwrap();
        assert_eq!(engine.status(&id).await.unwrap(), JobState::Pending);
        engine.set_state(&id, JobState::Running);
        engine.kill(&id).await.unwrap();
        assert_eq!(engine.status(&id).await.unwrap(), JobState::Killed);
        assert_eq!(engine.kills(), vec![id]);
    }
}
