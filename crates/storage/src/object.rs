use async_trait::async_trait;
use bytes::Bytes;

use crate::error::StorageError;

/// Precondition for conditional writes.
///
/// Version tokens are opaque strings; each backend decides what they encode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Precondition {
    /// Write unconditionally.
    None,
    /// Write only if nothing exists at the key.
    DoesNotExist,
    /// Write only if the current version equals the token.
    MatchesVersion(String),
}

/// Result of a conditional write. A failed precondition is a normal outcome,
/// not an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOutcome {
    Written { version: String },
    PreconditionFailed { current: Option<String> },
}

impl WriteOutcome {
    pub fn is_written(&self) -> bool {
        matches!(self, WriteOutcome::Written { .. })
    }
}

/// Metadata about a stored object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectMeta {
    pub path: String,
    pub size: u64,
    pub version: String,
}

/// A stored object body with its version token.
#[derive(Debug, Clone)]
pub struct Object {
    pub data: Bytes,
    pub version: String,
}

/// A flat key/value object store: one bucket.
///
/// Keys are `/`-separated paths. Implementations must be `Send + Sync +
/// 'static` so a store can sit behind an `Arc` shared by workers and the
/// admin surface.
#[async_trait]
pub trait ObjectStore: Send + Sync + 'static {
    /// Read an object. `Ok(None)` when the key is absent.
    async fn get(&self, path: &str) -> Result<Option<Object>, StorageError>;

    /// Write with a precondition.
    async fn put(
        &self,
        path: &str,
        data: Bytes,
        precondition: Precondition,
    ) -> Result<WriteOutcome, StorageError>;

    /// Metadata without the body. `Ok(None)` when the key is absent.
    async fn head(&self, path: &str) -> Result<Option<ObjectMeta>, StorageError>;

    /// All objects whose key starts with `prefix`, sorted by key.
    async fn list(&self, prefix: &str) -> Result<Vec<ObjectMeta>, StorageError>;

    /// Remove an object. Deleting an absent key succeeds.
    async fn delete(&self, path: &str) -> Result<(), StorageError>;
}

/// Reject keys no backend should accept.
pub(crate) fn validate_key(path: &str) -> Result<(), StorageError> {
    let invalid = |message: &str| StorageError::InvalidKey {
        key: path.to_string(),
        message: message.to_string(),
    };
    if path.is_empty() {
        return Err(invalid("empty key"));
    }
    if path.starts_with('/') {
        return Err(invalid("absolute key"));
    }
    if path.split('/').any(|seg| seg.is_empty() || seg == "." || seg == "..") {
        return Err(invalid("empty or relative path segment"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_validation() {
        assert!(validate_key("check/latest.json").is_ok());
        assert!(validate_key("").is_err());
        assert!(validate_key("/abs").is_err());
        assert!(validate_key("a//b").is_err());
        assert!(validate_key("a/../b").is_err());
        assert!(validate_key("a/").is_err());
    }
}
