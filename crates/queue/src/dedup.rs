//! Queue deduplication.
//!
//! Drains a queue in batches and re-enqueues one canonical copy per
//! `(target, uuid)` key, tagged with the run's audit tag and carrying the
//! highest `sid` seen so far. Within a batch every message sharing a key
//! folds into a single copy. A key already re-enqueued by an earlier batch
//! of the same run is dropped. Each batch is sent before it is deleted, so a
//! failure between the two leaves duplicates behind rather than losing work.
//!
//! The pass stops when the time budget is spent, when it has accounted for
//! the starting queue depth, when a receive comes back empty, or when it
//! receives one of its own canonical copies.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;

use foursight_interchange::QueueItem;

use crate::error::QueueError;
use crate::queue::{SendOptions, WorkQueue};

/// Largest batch a receive may ask for.
pub const MAX_BATCH: usize = 10;
/// Shortest redelivery delay on re-enqueued copies.
pub const MIN_REDELIVERY_DELAY: Duration = Duration::from_secs(2);

/// Parameters of one deduplication pass.
#[derive(Debug, Clone)]
pub struct DedupOptions {
    /// Wall-clock budget for the pass.
    pub budget: Duration,
    /// Starting sid, normally the domain's current maximum.
    pub initial_max_sid: i64,
    /// Starting queue depth. `None` asks the queue.
    pub expected: Option<u64>,
    /// Messages per receive, clamped to `1..=MAX_BATCH`.
    pub batch_size: usize,
    /// Visibility timeout for received batches.
    pub visibility: Duration,
    /// Delay on re-enqueued copies, at least `MIN_REDELIVERY_DELAY`.
    pub redelivery_delay: Duration,
    /// Audit tag written to `fs_detail` on every re-enqueued copy.
    pub run_tag: String,
}

impl DedupOptions {
    pub fn new(budget: Duration, initial_max_sid: i64, run_tag: impl Into<String>) -> Self {
        Self {
            budget,
            initial_max_sid,
            expected: None,
            batch_size: MAX_BATCH,
            visibility: Duration::from_secs(60),
            redelivery_delay: MIN_REDELIVERY_DELAY,
            run_tag: run_tag.into(),
        }
    }
}

/// Why a pass ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// The time budget ran out.
    Budget,
    /// `replaced + repeat_replaced` reached the starting depth.
    Quota,
    /// A receive returned nothing.
    Drained,
    /// One of this pass's own re-enqueued copies came back.
    Cycled,
}

/// Counters from one pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DedupReport {
    /// Keys re-enqueued for the first time in this pass.
    pub replaced: u64,
    /// Extra messages folded into a copy re-enqueued in the same batch.
    pub repeat_replaced: u64,
    /// Messages dropped because an earlier batch already re-enqueued the key.
    pub deduplicated: u64,
    /// Unparseable messages (deleted).
    pub problems: u64,
    /// Keys whose re-enqueue failed; their messages were left in place.
    pub send_failures: u64,
    /// Highest sid observed, and the sid carried by the last batch.
    pub max_sid: i64,
    /// Starting queue depth the quota was measured against.
    pub expected: u64,
    pub stop_reason: StopReason,
    pub elapsed: Duration,
    pub run_tag: String,
}

impl DedupReport {
    /// Messages the pass consumed and accounted for.
    pub fn processed(&self) -> u64 {
        self.replaced + self.repeat_replaced + self.deduplicated
    }
}

/// A key's canonical copy waiting to be sent at the end of a batch.
struct Pending {
    key: (String, String),
    item: QueueItem,
    receipts: Vec<String>,
    repeats: u64,
}

/// Run one deduplication pass over `queue`.
///
/// Only receive failures and the initial depth query abort the pass; per
/// message and per key failures are counted in the report.
pub async fn deduplicate(
    queue: &dyn WorkQueue,
    options: &DedupOptions,
) -> Result<DedupReport, QueueError> {
    let start = Instant::now();
    let batch_size = options.batch_size.clamp(1, MAX_BATCH);
    let delay = options.redelivery_delay.max(MIN_REDELIVERY_DELAY);
    let expected = match options.expected {
        Some(n) => n,
        None => queue.stats().await?.visible,
    };

    let mut report = DedupReport {
        replaced: 0,
        repeat_replaced: 0,
        deduplicated: 0,
        problems: 0,
        send_failures: 0,
        max_sid: options.initial_max_sid,
        expected,
        stop_reason: StopReason::Drained,
        elapsed: Duration::ZERO,
        run_tag: options.run_tag.clone(),
    };
    let mut seen: HashSet<(String, String)> = HashSet::new();
    let mut sent_ids: HashSet<String> = HashSet::new();

    let stop_reason = loop {
        if start.elapsed() >= options.budget {
            break StopReason::Budget;
        }
        if report.replaced + report.repeat_replaced >= expected {
            break StopReason::Quota;
        }

        let batch = queue.receive(batch_size, options.visibility).await?;
        if batch.is_empty() {
            break StopReason::Drained;
        }

        let mut pending: Vec<Pending> = Vec::new();
        let mut pending_index: HashMap<(String, String), usize> = HashMap::new();
        let mut to_delete: Vec<String> = Vec::new();
        let mut cycled = false;

        for message in batch {
            if sent_ids.contains(&message.id) {
                cycled = true;
                if let Err(e) = queue.change_visibility(&message.receipt, Duration::ZERO).await {
                    tracing::debug!(queue = queue.name(), error = %e, "could not release own copy");
                }
                continue;
            }

            let parsed = QueueItem::from_json(&message.body)
                .ok()
                .and_then(|item| item.dedup_key().map(|key| (key, item)));
            let Some((key, item)) = parsed else {
                tracing::warn!(queue = queue.name(), id = %message.id, "unparseable message dropped");
                report.problems += 1;
                to_delete.push(message.receipt);
                continue;
            };

            if let Some(sid) = item.kwargs.sid() {
                report.max_sid = report.max_sid.max(sid);
            }

            if let Some(&i) = pending_index.get(&key) {
                pending[i].receipts.push(message.receipt);
                pending[i].repeats += 1;
            } else if seen.contains(&key) {
                report.deduplicated += 1;
                to_delete.push(message.receipt);
            } else {
                pending_index.insert(key.clone(), pending.len());
                pending.push(Pending {
                    key,
                    item,
                    receipts: vec![message.receipt],
                    repeats: 0,
                });
            }
        }

        // Send first, then delete what the sends now represent.
        for mut p in pending {
            p.item.kwargs.set_sid(report.max_sid);
            p.item.kwargs.set_fs_detail(&options.run_tag);
            match queue
                .send(p.item.to_json(), SendOptions::new().with_delay(delay))
                .await
            {
                Ok(id) => {
                    sent_ids.insert(id);
                    seen.insert(p.key);
                    report.replaced += 1;
                    report.repeat_replaced += p.repeats;
                    to_delete.extend(p.receipts);
                }
                Err(e) => {
                    tracing::warn!(
                        queue = queue.name(),
                        target = %p.key.0,
                        uuid = %p.key.1,
                        error = %e,
                        "re-enqueue failed, leaving originals in place"
                    );
                    report.send_failures += 1;
                }
            }
        }

        for receipt in to_delete {
            if let Err(e) = queue.delete(&receipt).await {
                tracing::warn!(queue = queue.name(), error = %e, "delete after re-enqueue failed");
            }
        }

        if cycled {
            break StopReason::Cycled;
        }
    };

    report.stop_reason = stop_reason;
    report.elapsed = start.elapsed();
    tracing::info!(
        queue = queue.name(),
        replaced = report.replaced,
        repeat_replaced = report.repeat_replaced,
        deduplicated = report.deduplicated,
        problems = report.problems,
        send_failures = report.send_failures,
        max_sid = report.max_sid,
        stop_reason = ?report.stop_reason,
        "deduplication pass finished"
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MemoryQueue;
    use foursight_interchange::Kwargs;
    use serde_json::json;

    fn item(target: &str, uuid: &str, sid: i64) -> String {
        let kwargs = Kwargs::from_value(json!({"uuid": uuid, "sid": sid})).unwrap();
        QueueItem::new(target, kwargs).to_json()
    }

    async fn drain(queue: &MemoryQueue) -> Vec<QueueItem> {
        tokio::time::advance(Duration::from_secs(60)).await;
        queue
            .receive(100, Duration::from_secs(60))
            .await
            .unwrap()
            .into_iter()
            .map(|m| QueueItem::from_json(&m.body).unwrap())
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn three_message_queue_collapses_to_two() {
        let q = MemoryQueue::new("secondary");
        q.send(item("t", "u1", 5), SendOptions::new()).await.unwrap();
        q.send(item("t", "u1", 7), SendOptions::new()).await.unwrap();
        q.send(item("t", "u2", 3), SendOptions::new()).await.unwrap();

        let opts = DedupOptions::new(Duration::from_secs(60), 0, "dedup-run-1");
        let report = deduplicate(&q, &opts).await.unwrap();
        assert_eq!(report.replaced, 2);
        assert_eq!(report.repeat_replaced, 1);
        assert_eq!(report.deduplicated, 0);
        assert_eq!(report.processed(), 3);
        assert_eq!(report.max_sid, 7);
        assert_eq!(report.stop_reason, StopReason::Quota);

        let items = drain(&q).await;
        assert_eq!(items.len(), 2);
        let mut uuids: Vec<&str> = items.iter().filter_map(|i| i.kwargs.uuid_str()).collect();
        uuids.sort();
        assert_eq!(uuids, vec!["u1", "u2"]);
        for i in &items {
            assert_eq!(i.kwargs.sid(), Some(7));
            assert_eq!(i.kwargs.fs_detail(), Some("dedup-run-1"));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn later_batches_drop_keys_already_sent() {
        let q = MemoryQueue::new("secondary");
        // 12 messages over 2 keys: the first batch of 10 sends both copies,
        // the remaining 2 are dropped.
        for i in 0..12 {
            let uuid = if i % 2 == 0 { "a" } else { "b" };
            q.send(item("t", uuid, i), SendOptions::new()).await.unwrap();
        }
        let mut opts = DedupOptions::new(Duration::from_secs(60), 100, "tag");
        opts.expected = Some(12);
        let report = deduplicate(&q, &opts).await.unwrap();
        assert_eq!(report.replaced, 2);
        assert_eq!(report.repeat_replaced, 8);
        assert_eq!(report.deduplicated, 2);
        assert_eq!(report.stop_reason, StopReason::Drained);
        assert_eq!(drain(&q).await.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn target_is_part_of_the_key() {
        let q = MemoryQueue::new("secondary");
        q.send(item("x", "u1", 1), SendOptions::new()).await.unwrap();
        q.send(item("y", "u1", 1), SendOptions::new()).await.unwrap();
        let opts = DedupOptions::new(Duration::from_secs(60), 0, "tag");
        let report = deduplicate(&q, &opts).await.unwrap();
        assert_eq!(report.replaced, 2);
        assert_eq!(drain(&q).await.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn unparseable_messages_are_problems_and_deleted() {
        let q = MemoryQueue::new("secondary");
        q.send("not json".into(), SendOptions::new()).await.unwrap();
        q.send(r#"{"target":"t","kwargs":{}}"#.into(), SendOptions::new())
            .await
            .unwrap();
        q.send(item("t", "u1", 1), SendOptions::new()).await.unwrap();
        let opts = DedupOptions::new(Duration::from_secs(60), 0, "tag");
        let report = deduplicate(&q, &opts).await.unwrap();
        assert_eq!(report.problems, 2);
        assert_eq!(report.replaced, 1);
        assert_eq!(drain(&q).await.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn send_failure_rolls_back_key_and_keeps_originals() {
        let q = MemoryQueue::new("secondary");
        q.send(item("t", "u1", 1), SendOptions::new()).await.unwrap();
        q.send(item("t", "u1", 2), SendOptions::new()).await.unwrap();
        q.send(item("t", "u2", 3), SendOptions::new()).await.unwrap();
        q.fail_next_sends(1);

        let mut opts = DedupOptions::new(Duration::from_secs(60), 0, "tag");
        opts.expected = Some(3);
        let report = deduplicate(&q, &opts).await.unwrap();
        assert_eq!(report.send_failures, 1);
        assert_eq!(report.replaced, 1);
        assert_eq!(report.repeat_replaced, 0);
        // u1's two originals (in flight) plus u2's canonical copy.
        assert_eq!(q.len(), 3);

        // Once the originals come back, a second pass collapses them.
        tokio::time::advance(Duration::from_secs(61)).await;
        let report = deduplicate(&q, &DedupOptions::new(Duration::from_secs(60), 0, "tag-2"))
            .await
            .unwrap();
        assert_eq!(report.send_failures, 0);
        assert_eq!(drain(&q).await.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn zero_budget_does_nothing() {
        let q = MemoryQueue::new("secondary");
        q.send(item("t", "u1", 1), SendOptions::new()).await.unwrap();
        let opts = DedupOptions::new(Duration::ZERO, 0, "tag");
        let report = deduplicate(&q, &opts).await.unwrap();
        assert_eq!(report.stop_reason, StopReason::Budget);
        assert_eq!(report.processed(), 0);
        assert_eq!(q.len(), 1);
    }
}
