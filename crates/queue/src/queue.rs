use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;

use crate::error::QueueError;

/// Options for `send`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SendOptions {
    /// Hold the message back this long before it becomes receivable.
    pub delay: Option<Duration>,
}

impl SendOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub const fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }
}

/// One delivery of a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Queue-assigned id, stable across redeliveries.
    pub id: String,
    /// Handle for this delivery; `delete` and `change_visibility` take it.
    pub receipt: String,
    pub body: String,
    /// How many times the message has been delivered, including this one.
    pub receive_count: u32,
}

/// Approximate queue depth.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    /// Receivable now.
    pub visible: u64,
    /// Claimed and inside a visibility timeout.
    pub in_flight: u64,
    /// Sent with a delay that has not yet elapsed.
    pub delayed: u64,
}

/// An at-least-once queue with visibility timeouts.
///
/// A received message stays in the queue, invisible, until it is deleted
/// with its receipt handle or its visibility timeout runs out. In the second
/// case it is delivered again.
#[async_trait]
pub trait WorkQueue: Send + Sync + 'static {
    /// Name used in logs and the admin surface.
    fn name(&self) -> &str;

    /// Enqueue a body. Returns the queue-assigned message id.
    async fn send(&self, body: String, options: SendOptions) -> Result<String, QueueError>;

    /// Claim up to `max` messages for `visibility`.
    async fn receive(&self, max: usize, visibility: Duration) -> Result<Vec<Message>, QueueError>;

    /// Remove a claimed message.
    async fn delete(&self, receipt: &str) -> Result<(), QueueError>;

    /// Reset the visibility timeout of a claimed message to `visibility`
    /// from now. Zero releases it immediately.
    async fn change_visibility(&self, receipt: &str, visibility: Duration)
        -> Result<(), QueueError>;

    async fn stats(&self) -> Result<QueueStats, QueueError>;

    /// Drop every message. Administrative only.
    async fn purge(&self) -> Result<(), QueueError>;
}

/// The two queues of a deployment.
#[derive(Clone)]
pub struct QueuePair {
    /// Scheduled checks and their linked actions.
    pub primary: Arc<dyn WorkQueue>,
    /// Deferred follow-up work.
    pub secondary: Arc<dyn WorkQueue>,
}

impl QueuePair {
    pub fn new(primary: Arc<dyn WorkQueue>, secondary: Arc<dyn WorkQueue>) -> Self {
        Self { primary, secondary }
    }
}

impl std::fmt::Debug for QueuePair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueuePair")
            .field("primary", &self.primary.name())
            .field("secondary", &self.secondary.name())
            .finish()
    }
}
