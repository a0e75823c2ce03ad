use std::fmt;

use serde::Serialize;

use foursight_interchange::InterchangeError;
use foursight_queue::QueueError;
use foursight_storage::{StorageError, Transient};

use crate::clients::ApiError;

/// How a failure is handled, independent of where it came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Timeouts, refused connections, 5xx. Retried with bounded backoff;
    /// the queue item is kept for redelivery.
    TransientIo,
    /// A descriptor or entity does not exist.
    NotFound,
    /// Bad kwargs or a malformed payload. Retrying would loop.
    Validation,
    /// The observed platform reported a logical failure.
    DomainFailure,
    /// The wall-clock budget ran out.
    Timeout,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::TransientIo => "transient_io",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Validation => "validation",
            ErrorKind::DomainFailure => "domain_failure",
            ErrorKind::Timeout => "timeout",
        };
        f.write_str(s)
    }
}

/// Errors a check or action can return across the worker boundary.
#[derive(Debug)]
pub enum CheckError {
    Api(ApiError),
    Storage(StorageError),
    Queue(QueueError),
    NotFound(String),
    Validation(String),
    Domain(String),
    Timeout(String),
}

impl CheckError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            CheckError::Api(e) => e.kind(),
            CheckError::Storage(StorageError::NotFound { .. }) => ErrorKind::NotFound,
            CheckError::Storage(e) if e.is_transient() => ErrorKind::TransientIo,
            CheckError::Storage(_) => ErrorKind::Validation,
            CheckError::Queue(e) if e.is_transient() => ErrorKind::TransientIo,
            CheckError::Queue(_) => ErrorKind::Validation,
            CheckError::NotFound(_) => ErrorKind::NotFound,
            CheckError::Validation(_) => ErrorKind::Validation,
            CheckError::Domain(_) => ErrorKind::DomainFailure,
            CheckError::Timeout(_) => ErrorKind::Timeout,
        }
    }

    pub fn is_transient(&self) -> bool {
        self.kind() == ErrorKind::TransientIo
    }
}

impl fmt::Display for CheckError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CheckError::Api(e) => write!(f, "{}", e),
            CheckError::Storage(e) => write!(f, "{}", e),
            CheckError::Queue(e) => write!(f, "{}", e),
            CheckError::NotFound(what) => write!(f, "not found: {}", what),
            CheckError::Validation(msg) => write!(f, "invalid input: {}", msg),
            CheckError::Domain(msg) => write!(f, "domain failure: {}", msg),
            CheckError::Timeout(msg) => write!(f, "timed out: {}", msg),
        }
    }
}

impl std::error::Error for CheckError {}

impl Transient for CheckError {
    fn is_transient(&self) -> bool {
        CheckError::is_transient(self)
    }
}

impl From<ApiError> for CheckError {
    fn from(e: ApiError) -> Self {
        CheckError::Api(e)
    }
}

impl From<StorageError> for CheckError {
    fn from(e: StorageError) -> Self {
        CheckError::Storage(e)
    }
}

impl From<QueueError> for CheckError {
    fn from(e: QueueError) -> Self {
        CheckError::Queue(e)
    }
}

impl From<InterchangeError> for CheckError {
    fn from(e: InterchangeError) -> Self {
        CheckError::Validation(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_follow_source() {
        assert_eq!(
            CheckError::from(StorageError::Unavailable("x".into())).kind(),
            ErrorKind::TransientIo
        );
        assert_eq!(
            CheckError::from(QueueError::StaleHandle { handle: "h".into() }).kind(),
            ErrorKind::Validation
        );
        assert_eq!(
            CheckError::from(ApiError::Status {
                url: "u".into(),
                status: 503,
                message: String::new()
            })
            .kind(),
            ErrorKind::TransientIo
        );
        assert_eq!(
            CheckError::from(ApiError::Status {
                url: "u".into(),
                status: 404,
                message: String::new()
            })
            .kind(),
            ErrorKind::NotFound
        );
        assert!(!CheckError::Domain("qc".into()).is_transient());
    }
}
