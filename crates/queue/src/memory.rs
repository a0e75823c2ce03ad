//! In-memory work queue.
//!
//! Visibility timeouts and delays run on `tokio::time`, so tests with a
//! paused clock control redelivery exactly.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use uuid::Uuid;

use crate::error::QueueError;
use crate::queue::{Message, QueueStats, SendOptions, WorkQueue};

#[derive(Debug)]
struct Entry {
    id: String,
    body: String,
    /// Receivable once `Instant::now() >= visible_at`.
    visible_at: Instant,
    /// Handle of the most recent delivery.
    receipt: Option<String>,
    receive_count: u32,
}

/// Single-process queue with real visibility-timeout semantics.
#[derive(Debug)]
pub struct MemoryQueue {
    name: String,
    entries: Mutex<VecDeque<Entry>>,
    failing_sends: AtomicUsize,
}

fn poison_err<T>(_: PoisonError<T>) -> QueueError {
    QueueError::Backend("queue lock poisoned".into())
}

impl MemoryQueue {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            entries: Mutex::new(VecDeque::new()),
            failing_sends: AtomicUsize::new(0),
        }
    }

    /// Make the next `n` sends fail with `Unavailable`.
    pub fn fail_next_sends(&self, n: usize) {
        self.failing_sends.store(n, Ordering::SeqCst);
    }

    /// Bodies of every message still in the queue, in send order,
    /// regardless of visibility.
    pub fn peek_all(&self) -> Vec<String> {
        self.entries
            .lock()
            .map(|e| e.iter().map(|entry| entry.body.clone()).collect())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl WorkQueue for MemoryQueue {
    fn name(&self) -> &str {
        &self.name
    }

    async fn send(&self, body: String, options: SendOptions) -> Result<String, QueueError> {
        let armed = self
            .failing_sends
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if armed {
            return Err(QueueError::Unavailable(format!(
                "injected send failure on {}",
                self.name
            )));
        }

        let id = Uuid::new_v4().to_string();
        let visible_at = Instant::now() + options.delay.unwrap_or(Duration::ZERO);
        self.entries.lock().map_err(poison_err)?.push_back(Entry {
            id: id.clone(),
            body,
            visible_at,
            receipt: None,
            receive_count: 0,
        });
        tracing::trace!(queue = %self.name, id = %id, "message sent");
        Ok(id)
    }

    async fn receive(&self, max: usize, visibility: Duration) -> Result<Vec<Message>, QueueError> {
        let now = Instant::now();
        let mut entries = self.entries.lock().map_err(poison_err)?;
        let mut out = Vec::new();
        for entry in entries.iter_mut() {
            if out.len() >= max {
                break;
            }
            if entry.visible_at > now {
                continue;
            }
            let receipt = Uuid::new_v4().to_string();
            entry.receipt = Some(receipt.clone());
            entry.visible_at = now + visibility;
            entry.receive_count += 1;
            out.push(Message {
                id: entry.id.clone(),
                receipt,
                body: entry.body.clone(),
                receive_count: entry.receive_count,
            });
        }
        Ok(out)
    }

    async fn delete(&self, receipt: &str) -> Result<(), QueueError> {
        let mut entries = self.entries.lock().map_err(poison_err)?;
        let position = entries
            .iter()
            .position(|e| e.receipt.as_deref() == Some(receipt));
        match position {
            Some(i) => {
                entries.remove(i);
                Ok(())
            }
            None => Err(QueueError::StaleHandle {
                handle: receipt.to_string(),
            }),
        }
    }

    async fn change_visibility(
        &self,
        receipt: &str,
        visibility: Duration,
    ) -> Result<(), QueueError> {
        let mut entries = self.entries.lock().map_err(poison_err)?;
        let entry = entries
            .iter_mut()
            .find(|e| e.receipt.as_deref() == Some(receipt))
            .ok_or_else(|| QueueError::StaleHandle {
                handle: receipt.to_string(),
            })?;
        entry.visible_at = Instant::now() + visibility;
        Ok(())
    }

    async fn stats(&self) -> Result<QueueStats, QueueError> {
        let now = Instant::now();
        let entries = self.entries.lock().map_err(poison_err)?;
        let mut stats = QueueStats::default();
        for entry in entries.iter() {
            if entry.visible_at <= now {
                stats.visible += 1;
            } else if entry.receipt.is_some() {
                stats.in_flight += 1;
            } else {
                stats.delayed += 1;
            }
        }
        Ok(stats)
    }

    async fn purge(&self) -> Result<(), QueueError> {
        self.entries.lock().map_err(poison_err)?.clear();
        tracing::info!(queue = %self.name, "queue purged");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const VIS: Duration = Duration::from_secs(30);

    #[tokio::test(start_paused = true)]
    async fn received_messages_are_invisible_until_timeout() {
        let q = MemoryQueue::new("q");
        q.send("a".into(), SendOptions::new()).await.unwrap();

        let first = q.receive(10, VIS).await.unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].receive_count, 1);
        assert!(q.receive(10, VIS).await.unwrap().is_empty());
        assert_eq!(
            q.stats().await.unwrap(),
            QueueStats {
                visible: 0,
                in_flight: 1,
                delayed: 0
            }
        );

        tokio::time::advance(VIS).await;
        let second = q.receive(10, VIS).await.unwrap();
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].id, first[0].id);
        assert_eq!(second[0].receive_count, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn redelivery_invalidates_old_handle() {
        let q = MemoryQueue::new("q");
        q.send("a".into(), SendOptions::new()).await.unwrap();
        let first = q.receive(1, VIS).await.unwrap().remove(0);
        tokio::time::advance(VIS).await;
        let second = q.receive(1, VIS).await.unwrap().remove(0);

        let stale = q.delete(&first.receipt).await;
        assert!(matches!(stale, Err(QueueError::StaleHandle { .. })));
        q.delete(&second.receipt).await.unwrap();
        assert!(q.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn delayed_send_is_held_back() {
        let q = MemoryQueue::new("q");
        q.send("later".into(), SendOptions::new().with_delay(Duration::from_secs(2)))
            .await
            .unwrap();
        assert_eq!(q.stats().await.unwrap().delayed, 1);
        assert!(q.receive(10, VIS).await.unwrap().is_empty());
        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(q.receive(10, VIS).await.unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn change_visibility_zero_releases() {
        let q = MemoryQueue::new("q");
        q.send("a".into(), SendOptions::new()).await.unwrap();
        let m = q.receive(1, VIS).await.unwrap().remove(0);
        q.change_visibility(&m.receipt, Duration::ZERO).await.unwrap();
        assert_eq!(q.receive(1, VIS).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn receive_respects_max_and_order() {
        let q = MemoryQueue::new("q");
        for i in 0..5 {
            q.send(format!("m{i}"), SendOptions::new()).await.unwrap();
        }
        let got: Vec<String> = q
            .receive(3, VIS)
            .await
            .unwrap()
            .into_iter()
            .map(|m| m.body)
            .collect();
        assert_eq!(got, vec!["m0", "m1", "m2"]);
        q.purge().await.unwrap();
        assert_eq!(q.stats().await.unwrap(), QueueStats::default());
    }

    #[tokio::test]
    async fn injected_send_failure() {
        let q = MemoryQueue::new("q");
        q.fail_next_sends(1);
        assert!(q.send("a".into(), SendOptions::new()).await.unwrap_err().is_transient());
        q.send("a".into(), SendOptions::new()).await.unwrap();
        assert_eq!(q.len(), 1);
    }
}
