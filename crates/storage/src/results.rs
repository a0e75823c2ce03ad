//! The append-only result log.
//!
//! Layout inside one bucket:
//!
//! ```text
//! <name>/<run id>.json     one record per invocation, written once
//! <name>/latest.json       newest record for the name
//! <name>/primary.json      newest record written with `primary = true`
//! ```
//!
//! Per-run keys never collide across workers because each invocation has
//! its own run id. The two pointers are shared, so they are moved with a
//! compare-and-swap on the run id they hold: a pointer only ever advances
//! to a newer run.

use std::collections::{BTreeSet, VecDeque};
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use time::OffsetDateTime;

use foursight_interchange::{ResultRecord, RunId};

use crate::error::StorageError;
use crate::object::{validate_key, ObjectStore, Precondition, WriteOutcome};
use crate::retry::{with_retry, RetryPolicy};

pub const LATEST: &str = "latest";
pub const PRIMARY: &str = "primary";

/// Attempts at moving a pointer before reporting contention.
const POINTER_ATTEMPTS: u32 = 5;

/// What happened to one canonical pointer during a `put`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PointerOutcome {
    /// The pointer now holds this record.
    Updated,
    /// The pointer already holds a newer run and was left alone.
    Superseded { current: String },
    /// Concurrent writers kept moving the pointer; it was not updated.
    Contended,
}

/// Summary of a `put`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PutReport {
    pub key: String,
    /// False when the run key already held a record. The stored record is
    /// kept and the pointers are moved to it instead.
    pub created: bool,
    pub latest: PointerOutcome,
    pub primary: Option<PointerOutcome>,
}

#[derive(Deserialize)]
struct PointerHead {
    uuid: String,
}

/// Check and action results over an object store.
#[derive(Clone)]
pub struct ResultStore {
    store: Arc<dyn ObjectStore>,
    retry: RetryPolicy,
}

impl std::fmt::Debug for ResultStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResultStore")
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}

/// Result names become the first segment of every key written for them,
/// so they must be a single, non-relative path segment.
pub fn validate_result_name(name: &str) -> Result<(), StorageError> {
    if name.contains('/') {
        return Err(StorageError::InvalidKey {
            key: name.to_string(),
            message: "result names must be a single path segment".to_string(),
        });
    }
    validate_key(name)
}

fn run_key(name: &str, uuid: &str) -> String {
    format!("{name}/{uuid}.json")
}

fn pointer_key(name: &str, pointer: &str) -> String {
    format!("{name}/{pointer}.json")
}

/// Run id embedded in a per-run key, or `None` for pointers and strays.
fn run_id_of_key(name: &str, key: &str) -> Option<RunId> {
    let stem = key.strip_prefix(name)?.strip_prefix('/')?.strip_suffix(".json")?;
    RunId::parse(stem).ok()
}

fn decode<R: DeserializeOwned>(path: &str, data: &[u8]) -> Result<R, StorageError> {
    serde_json::from_slice(data).map_err(|e| StorageError::Corrupt {
        path: path.to_string(),
        message: e.to_string(),
    })
}

impl ResultStore {
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self {
            store,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Write a record under its run key and advance `latest` (and `primary`
    /// when asked). The per-run write is retried on transient failure;
    /// if it still fails the error is returned and no pointer moves.
    ///
    /// Run keys are written once. Putting a second record with the same run
    /// id (a redelivered invocation) leaves the first in place and only
    /// re-drives the pointers toward it.
    pub async fn put<R: ResultRecord>(
        &self,
        record: &R,
        primary: bool,
    ) -> Result<PutReport, StorageError> {
        let name = record.name();
        validate_result_name(name)?;
        let uuid = record.uuid().as_str();
        let encoded = Bytes::from(
            serde_json::to_vec(record).map_err(|e| StorageError::Serialization(e.to_string()))?,
        );

        let key = run_key(name, uuid);
        let outcome = with_retry(&self.retry, "put result", || {
            self.store.put(&key, encoded.clone(), Precondition::DoesNotExist)
        })
        .await?;
        let (created, body) = match outcome {
            WriteOutcome::Written { .. } => (true, encoded),
            WriteOutcome::PreconditionFailed { .. } => {
                let existing = with_retry(&self.retry, "read result", || self.store.get(&key))
                    .await?
                    .ok_or_else(|| StorageError::NotFound { path: key.clone() })?;
                tracing::debug!(result = %name, uuid = %uuid, "run already recorded, keeping first write");
                (false, existing.data)
            }
        };

        let latest = self.advance_pointer(name, LATEST, uuid, &body).await?;
        let primary = if primary {
            Some(self.advance_pointer(name, PRIMARY, uuid, &body).await?)
        } else {
            None
        };

        tracing::debug!(result = %name, uuid = %uuid, created, ?latest, ?primary, "result written");
        Ok(PutReport {
            key,
            created,
            latest,
            primary,
        })
    }

    async fn advance_pointer(
        &self,
        name: &str,
        pointer: &str,
        uuid: &str,
        body: &Bytes,
    ) -> Result<PointerOutcome, StorageError> {
        let key = pointer_key(name, pointer);
        for _ in 0..POINTER_ATTEMPTS {
            let current = with_retry(&self.retry, "read pointer", || self.store.get(&key)).await?;
            let precondition = match current {
                None => Precondition::DoesNotExist,
                Some(obj) => {
                    // An unreadable pointer is replaced rather than trusted.
                    if let Ok(head) = serde_json::from_slice::<PointerHead>(&obj.data) {
                        if head.uuid.as_str() > uuid {
                            return Ok(PointerOutcome::Superseded {
                                current: head.uuid,
                            });
                        }
                    }
                    Precondition::MatchesVersion(obj.version)
                }
            };
            let outcome = with_retry(&self.retry, "write pointer", || {
                self.store.put(&key, body.clone(), precondition.clone())
            })
            .await?;
            if let WriteOutcome::Written { .. } = outcome {
                return Ok(PointerOutcome::Updated);
            }
        }
        tracing::warn!(result = %name, pointer, uuid, "pointer contended, left unchanged");
        Ok(PointerOutcome::Contended)
    }

    async fn read<R: DeserializeOwned>(&self, key: &str) -> Result<Option<R>, StorageError> {
        let obj = with_retry(&self.retry, "read result", || self.store.get(key)).await?;
        obj.map(|o| decode(key, &o.data)).transpose()
    }

    /// The record at `latest.json`.
    pub async fn get_latest<R: DeserializeOwned>(&self, name: &str) -> Result<Option<R>, StorageError> {
        self.read(&pointer_key(name, LATEST)).await
    }

    /// The record at `primary.json`.
    pub async fn get_primary<R: DeserializeOwned>(
        &self,
        name: &str,
    ) -> Result<Option<R>, StorageError> {
        self.read(&pointer_key(name, PRIMARY)).await
    }

    /// The record written by run `uuid`.
    pub async fn get_by_uuid<R: DeserializeOwned>(
        &self,
        name: &str,
        uuid: &RunId,
    ) -> Result<Option<R>, StorageError> {
        self.read(&run_key(name, uuid.as_str())).await
    }

    /// Run ids recorded under `name`, oldest first.
    pub async fn run_ids(&self, name: &str) -> Result<Vec<RunId>, StorageError> {
        let prefix = format!("{name}/");
        let metas = with_retry(&self.retry, "list results", || self.store.list(&prefix)).await?;
        let mut ids: Vec<RunId> = metas
            .iter()
            .filter_map(|m| run_id_of_key(name, &m.path))
            .collect();
        ids.sort();
        Ok(ids)
    }

    /// The record whose run id is nearest `target`, if it is within
    /// `tolerance`. Ties go to the earlier record.
    pub async fn get_closest<R: DeserializeOwned>(
        &self,
        name: &str,
        target: OffsetDateTime,
        tolerance: Duration,
    ) -> Result<Option<R>, StorageError> {
        let ids = self.run_ids(name).await?;
        let Some(best) = closest_run(&ids, target, tolerance) else {
            return Ok(None);
        };
        self.get_by_uuid(name, best).await
    }

    /// Records with `from <= run id <= to`, oldest first, fetched lazily.
    pub async fn list_between<R: DeserializeOwned>(
        &self,
        name: &str,
        from: &RunId,
        to: &RunId,
    ) -> Result<ResultHistory<R>, StorageError> {
        let keys = self
            .run_ids(name)
            .await?
            .into_iter()
            .filter(|id| id >= from && id <= to)
            .map(|id| run_key(name, id.as_str()))
            .collect();
        Ok(ResultHistory {
            store: self.clone(),
            keys,
            _record: PhantomData,
        })
    }

    /// Every result name present in the bucket.
    pub async fn list_names(&self) -> Result<Vec<String>, StorageError> {
        let metas = with_retry(&self.retry, "list names", || self.store.list("")).await?;
        let names: BTreeSet<String> = metas
            .iter()
            .filter_map(|m| m.path.split_once('/').map(|(n, _)| n.to_string()))
            .collect();
        Ok(names.into_iter().collect())
    }
}

/// Pick the run nearest `target` within `tolerance`; `ids` must be sorted
/// ascending so that the first of two equidistant runs wins.
pub fn closest_run(ids: &[RunId], target: OffsetDateTime, tolerance: Duration) -> Option<&RunId> {
    let mut best: Option<(&RunId, Duration)> = None;
    for id in ids {
        let distance = (id.to_datetime() - target).unsigned_abs();
        if distance > tolerance {
            continue;
        }
        match best {
            Some((_, d)) if d <= distance => {}
            _ => best = Some((id, distance)),
        }
    }
    best.map(|(id, _)| id)
}

/// A lazy, oldest-first walk over stored records.
pub struct ResultHistory<R> {
    store: ResultStore,
    keys: VecDeque<String>,
    _record: PhantomData<fn() -> R>,
}

impl<R: DeserializeOwned> ResultHistory<R> {
    /// The next record, or `None` when the walk is done. Records removed
    /// since the listing are skipped.
    pub async fn next(&mut self) -> Option<Result<R, StorageError>> {
        while let Some(key) = self.keys.pop_front() {
            match self.store.read::<R>(&key).await {
                Ok(Some(record)) => return Some(Ok(record)),
                Ok(None) => continue,
                Err(e) => return Some(Err(e)),
            }
        }
        None
    }

    /// Records not yet fetched.
    pub fn remaining(&self) -> usize {
        self.keys.len()
    }

    /// Drain the walk into a vector.
    pub async fn collect(mut self) -> Result<Vec<R>, StorageError> {
        let mut out = Vec::with_capacity(self.keys.len());
        while let Some(record) = self.next().await {
            out.push(record?);
        }
        Ok(out)
    }
}
