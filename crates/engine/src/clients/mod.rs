//! Clients for the services checks observe: the domain API, the workflow
//! engine, and the search cluster.
//!
//! Each is a trait with an HTTP implementation for deployments and an
//! in-memory one for tests and local runs.

mod domain;
mod http;
mod search;
mod workflow;

use std::fmt;

pub use domain::{DomainApi, Filter, HttpDomainApi, MemoryDomainApi, SearchQuery};
pub use search::{ClusterHealth, HealthStatus, HttpSearchClient, SearchClient, StaticSearchClient};
pub use workflow::{HttpWorkflowEngine, JobState, LaunchRequest, MemoryWorkflowEngine, WorkflowEngine};

use crate::error::ErrorKind;

/// Errors from an external service.
#[derive(Debug, Clone, PartialEq)]
pub enum ApiError {
    /// The request never got a response.
    Transport { url: String, message: String },
    /// The service answered with a non-success status.
    Status {
        url: String,
        status: u16,
        message: String,
    },
    /// The requested entity does not exist.
    NotFound { what: String },
    /// The response body was not what the client expected.
    Decode { url: String, message: String },
    /// The service refused a write for a domain reason.
    Rejected { what: String, message: String },
    /// No endpoint is configured for this service in the environment.
    NotConfigured { service: &'static str },
}

impl ApiError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ApiError::Transport { .. } => ErrorKind::TransientIo,
            ApiError::Status { status, .. } if *status == 404 => ErrorKind::NotFound,
            ApiError::Status { status, .. } if *status == 429 || *status >= 500 => {
                ErrorKind::TransientIo
            }
            ApiError::Status { .. } => ErrorKind::Validation,
            ApiError::NotFound { .. } => ErrorKind::NotFound,
            ApiError::Decode { .. } => ErrorKind::Validation,
            ApiError::Rejected { .. } => ErrorKind::DomainFailure,
            ApiError::NotConfigured { .. } => ErrorKind::Validation,
        }
    }
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ApiError::Transport { url, message } => {
                write!(f, "request to {} failed: {}", url, message)
            }
            ApiError::Status {
                url,
                status,
                message,
            } => {
                if message.is_empty() {
                    write!(f, "{} answered {}", url, status)
                } else {
                    write!(f, "{} answered {}: {}", url, status, message)
                }
            }
            ApiError::NotFound { what } => write!(f, "{} not found", what),
            ApiError::Decode { url, message } => {
                write!(f, "could not decode response from {}: {}", url, message)
            }
            ApiError::Rejected { what, message } => write!(f, "{} rejected: {}", what, message),
            ApiError::NotConfigured { service } => {
                write!(f, "no {} endpoint configured for this environment", service)
            }
        }
    }
}

impl std::error::Error for ApiError {}

/// Stand-in for a service the environment has no endpoint for.
#[derive(Debug, Clone, Copy, Default)]
pub struct Unconfigured;
