use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::StorageError;
use crate::object::{validate_key, Object, ObjectMeta, ObjectStore, Precondition, WriteOutcome};

/// In-memory object store.
///
/// Thread-safe via `RwLock`. Versions are a per-key counter. Used by tests
/// and by single-process deployments that do not need durable results.
///
/// Transport failures can be injected with [`MemoryObjectStore::fail_next_puts`]
/// and [`MemoryObjectStore::fail_next_gets`]; permanent write refusals with
/// [`MemoryObjectStore::reject_next_puts`].
#[derive(Debug, Default, Clone)]
pub struct MemoryObjectStore {
    objects: Arc<RwLock<BTreeMap<String, StoredObject>>>,
    failing_puts: Arc<AtomicUsize>,
    failing_gets: Arc<AtomicUsize>,
    rejecting_puts: Arc<AtomicUsize>,
}

#[derive(Debug, Clone)]
struct StoredObject {
    data: Bytes,
    version: u64,
}

impl StoredObject {
    fn meta(&self, path: &str) -> ObjectMeta {
        ObjectMeta {
            path: path.to_string(),
            size: self.data.len() as u64,
            version: self.version.to_string(),
        }
    }
}

fn poisoned() -> StorageError {
    StorageError::Backend("lock poisoned".into())
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` writes fail with `Unavailable`.
    pub fn fail_next_puts(&self, n: usize) {
        self.failing_puts.store(n, Ordering::SeqCst);
    }

    /// Make the next `n` writes fail with a non-transient `Backend` error.
    pub fn reject_next_puts(&self, n: usize) {
        self.rejecting_puts.store(n, Ordering::SeqCst);
    }

    /// Make the next `n` reads fail with `Unavailable`.
    pub fn fail_next_gets(&self, n: usize) {
        self.failing_gets.store(n, Ordering::SeqCst);
    }

    /// Number of stored objects.
    pub fn len(&self) -> usize {
        self.objects.read().map(|o| o.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn armed(counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn take_failure(counter: &AtomicUsize, path: &str) -> Result<(), StorageError> {
        if Self::armed(counter) {
            return Err(StorageError::Unavailable(format!(
                "injected failure for {path}"
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn get(&self, path: &str) -> Result<Option<Object>, StorageError> {
        validate_key(path)?;
        Self::take_failure(&self.failing_gets, path)?;
        let objects = self.objects.read().map_err(|_| poisoned())?;
        Ok(objects.get(path).map(|o| Object {
            data: o.data.clone(),
            version: o.version.to_string(),
        }))
    }

    async fn put(
        &self,
        path: &str,
        data: Bytes,
        precondition: Precondition,
    ) -> Result<WriteOutcome, StorageError> {
        validate_key(path)?;
        Self::take_failure(&self.failing_puts, path)?;
        if Self::armed(&self.rejecting_puts) {
            return Err(StorageError::Backend(format!("write refused for {path}")));
        }
        let mut objects = self.objects.write().map_err(|_| poisoned())?;
        let current = objects.get(path);

        match precondition {
            Precondition::None => {}
            Precondition::DoesNotExist => {
                if let Some(obj) = current {
                    return Ok(WriteOutcome::PreconditionFailed {
                        current: Some(obj.version.to_string()),
                    });
                }
            }
            Precondition::MatchesVersion(expected) => match current {
                Some(obj) if obj.version.to_string() == expected => {}
                other => {
                    return Ok(WriteOutcome::PreconditionFailed {
                        current: other.map(|o| o.version.to_string()),
                    });
                }
            },
        }

        let version = current.map_or(1, |o| o.version + 1);
        objects.insert(path.to_string(), StoredObject { data, version });
        Ok(WriteOutcome::Written {
            version: version.to_string(),
        })
    }

    async fn head(&self, path: &str) -> Result<Option<ObjectMeta>, StorageError> {
        validate_key(path)?;
        let objects = self.objects.read().map_err(|_| poisoned())?;
        Ok(objects.get(path).map(|o| o.meta(path)))
    }

    async fn list(&self, prefix: &str) -> Result<Vec<ObjectMeta>, StorageError> {
        let objects = self.objects.read().map_err(|_| poisoned())?;
        Ok(objects
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, o)| o.meta(k))
            .collect())
    }

    async fn delete(&self, path: &str) -> Result<(), StorageError> {
        validate_key(path)?;
        self.objects.write().map_err(|_| poisoned())?.remove(path);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn injected_failures_are_consumed() {
        let store = MemoryObjectStore::new();
        store.fail_next_puts(1);
        let first = store
            .put("a/b.json", Bytes::from_static(b"{}"), Precondition::None)
            .await;
        assert!(matches!(first, Err(StorageError::Unavailable(_))));
        let second = store
            .put("a/b.json", Bytes::from_static(b"{}"), Precondition::None)
            .await
            .unwrap();
        assert!(second.is_written());
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn clones_share_contents() {
        let store = MemoryObjectStore::new();
        let other = store.clone();
        store
            .put("k", Bytes::from_static(b"v"), Precondition::None)
            .await
            .unwrap();
        assert!(other.get("k").await.unwrap().is_some());
    }
}
