/// Errors returned by a work queue.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    /// Transport-level failure. Worth retrying.
    #[error("queue unavailable: {0}")]
    Unavailable(String),

    /// The receipt handle no longer names an in-flight delivery: the item
    /// was deleted, or its visibility timeout expired and it was delivered
    /// again under a new handle.
    #[error("stale receipt handle: {handle}")]
    StaleHandle { handle: String },

    /// Any other backend-specific failure.
    #[error("queue backend error: {0}")]
    Backend(String),
}

impl QueueError {
    pub fn is_transient(&self) -> bool {
        matches!(self, QueueError::Unavailable(_))
    }
}
