use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use foursight_interchange::{Kwargs, QueueItem};
use foursight_queue::{
    deduplicate, DedupOptions, Message, MemoryQueue, QueueError, QueueStats, SendOptions,
    StopReason, WorkQueue,
};
use proptest::prelude::*;
use serde_json::json;

fn item(target: &str, uuid: &str, sid: i64) -> String {
    let kwargs = Kwargs::from_value(json!({"uuid": uuid, "sid": sid})).unwrap();
    QueueItem::new(target, kwargs).to_json()
}

async fn remaining_items(queue: &MemoryQueue) -> Vec<QueueItem> {
    tokio::time::advance(Duration::from_secs(600)).await;
    queue
        .receive(usize::MAX, Duration::from_secs(60))
        .await
        .unwrap()
        .into_iter()
        .map(|m| QueueItem::from_json(&m.body).unwrap())
        .collect()
}

/// Moves the clock forward before every receive, so delayed copies come
/// back within one pass.
struct SlowQueue(MemoryQueue);

#[async_trait]
impl WorkQueue for SlowQueue {
    fn name(&self) -> &str {
        self.0.name()
    }

    async fn send(&self, body: String, options: SendOptions) -> Result<String, QueueError> {
        self.0.send(body, options).await
    }

    async fn receive(&self, max: usize, visibility: Duration) -> Result<Vec<Message>, QueueError> {
        tokio::time::advance(Duration::from_secs(3)).await;
        self.0.receive(max, visibility).await
    }

    async fn delete(&self, receipt: &str) -> Result<(), QueueError> {
        self.0.delete(receipt).await
    }

    async fn change_visibility(
        &self,
        receipt: &str,
        visibility: Duration,
    ) -> Result<(), QueueError> {
        self.0.change_visibility(receipt, visibility).await
    }

    async fn stats(&self) -> Result<QueueStats, QueueError> {
        self.0.stats().await
    }

    async fn purge(&self) -> Result<(), QueueError> {
        self.0.purge().await
    }
}

#[tokio::test(start_paused = true)]
async fn pass_stops_when_its_own_copy_returns() {
    let q = SlowQueue(MemoryQueue::new("secondary"));
    q.send(item("t", "u1", 1), SendOptions::new()).await.unwrap();

    let mut opts = DedupOptions::new(Duration::from_secs(600), 0, "tag");
    opts.expected = Some(1_000);
    let report = deduplicate(&q, &opts).await.unwrap();
    assert_eq!(report.stop_reason, StopReason::Cycled);
    assert_eq!(report.replaced, 1);
    assert_eq!(report.deduplicated, 0);

    // The copy was released, not deleted.
    assert_eq!(remaining_items(&q.0).await.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn budget_is_checked_between_batches() {
    let q = SlowQueue(MemoryQueue::new("secondary"));
    for i in 0..30 {
        q.send(item("t", &format!("u{i}"), i), SendOptions::new())
            .await
            .unwrap();
    }
    // Each receive costs 3s of clock; a 5s budget allows two batches.
    let opts = DedupOptions::new(Duration::from_secs(5), 0, "tag");
    let report = deduplicate(&q, &opts).await.unwrap();
    assert_eq!(report.stop_reason, StopReason::Budget);
    assert_eq!(report.replaced, 20);
}

fn run_paused<F: std::future::Future>(f: F) -> F::Output {
    tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .start_paused(true)
        .build()
        .unwrap()
        .block_on(f)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn dedup_invariants(
        messages in prop::collection::vec((0usize..2, 0usize..6, 0i64..1_000), 1..45),
        batch_size in 1usize..=10,
    ) {
        let targets = ["check_a", "check_b"];
        let domain_max = messages.iter().map(|m| m.2).max().unwrap_or(0);
        let distinct: HashSet<(usize, usize)> = messages.iter().map(|m| (m.0, m.1)).collect();

        let (report, left) = run_paused(async {
            let q = MemoryQueue::new("secondary");
            for (t, u, sid) in &messages {
                q.send(item(targets[*t], &format!("u{u}"), *sid), SendOptions::new())
                    .await
                    .unwrap();
            }
            let mut opts = DedupOptions::new(Duration::from_secs(600), domain_max, "tag");
            opts.batch_size = batch_size;
            let report = deduplicate(&q, &opts).await.unwrap();
            (report, remaining_items(&q).await)
        });

        prop_assert_eq!(report.processed(), messages.len() as u64);
        prop_assert_eq!(report.replaced, distinct.len() as u64);
        prop_assert_eq!(left.len(), distinct.len());
        let keys: HashSet<(String, String)> =
            left.iter().filter_map(QueueItem::dedup_key).collect();
        prop_assert_eq!(keys.len(), distinct.len());
        for i in &left {
            prop_assert!(i.kwargs.sid().unwrap() >= domain_max);
        }
    }

    #[test]
    fn single_batch_carries_observed_max(
        messages in prop::collection::vec((0usize..3, 0i64..1_000), 1..=10),
    ) {
        let observed_max = messages.iter().map(|m| m.1).max().unwrap_or(0);
        let left = run_paused(async {
            let q = MemoryQueue::new("secondary");
            for (u, sid) in &messages {
                q.send(item("t", &format!("u{u}"), *sid), SendOptions::new())
                    .await
                    .unwrap();
            }
            let opts = DedupOptions::new(Duration::from_secs(600), 0, "tag");
            deduplicate(&q, &opts).await.unwrap();
            remaining_items(&q).await
        });
        for i in &left {
            prop_assert_eq!(i.kwargs.sid(), Some(observed_max));
        }
    }
}
