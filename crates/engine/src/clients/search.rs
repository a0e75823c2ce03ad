use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::http::{join_url, JsonRequest, Method};
use super::{ApiError, Unconfigured};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Green,
    Yellow,
    Red,
}

/// The subset of `_cluster/health` the checks read.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterHealth {
    pub status: HealthStatus,
    #[serde(default)]
    pub number_of_nodes: u64,
    #[serde(default)]
    pub unassigned_shards: u64,
}

/// The search cluster backing the portal.
#[async_trait]
pub trait SearchClient: Send + Sync + 'static {
    async fn cluster_health(&self) -> Result<ClusterHealth, ApiError>;
}

#[async_trait]
impl SearchClient for Unconfigured {
    async fn cluster_health(&self) -> Result<ClusterHealth, ApiError> {
        Err(ApiError::NotConfigured { service: "search" })
    }
}

#[derive(Debug, Clone)]
pub struct HttpSearchClient {
    url: String,
    timeout: Duration,
}

impl HttpSearchClient {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            timeout: Duration::from_secs(10),
        }
    }
}

#[async_trait]
impl SearchClient for HttpSearchClient {
    async fn cluster_health(&self) -> Result<ClusterHealth, ApiError> {
        let url = join_url(&self.url, "_cluster/health");
        let body = JsonRequest::new(Method::Get, url.clone(), self.timeout)
            .send()
            .await?;
        serde_json::from_value(body).map_err(|e| ApiError::Decode {
            url,
            message: e.to_string(),
        })
    }
}

/// Reports whatever health it was last given.
#[derive(Debug)]
pub struct StaticSearchClient {
    health: Mutex<Result<ClusterHealth, ApiError>>,
}

impl StaticSearchClient {
    pub fn new(health: ClusterHealth) -> Self {
        Self {
            health: Mutex::new(Ok(health)),
        }
    }

    pub fn green() -> Self {
        Self::new(ClusterHealth {
            status: HealthStatus::Green,
            number_of_nodes: 3,
            unassigned_shards: 0,
        })
    }

    pub fn set(&self, health: Result<ClusterHealth, ApiError>) {
        *self.health.lock().unwrap_or_else(PoisonError::into_inner) = health;
    }
}

#[async_trait]
impl SearchClient for StaticSearchClient {
    async fn cluster_health(&self) -> Result<ClusterHealth, ApiError> {
        self.health
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}
