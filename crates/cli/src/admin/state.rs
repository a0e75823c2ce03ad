//! Shared state for the admin router.

use std::sync::Arc;

use foursight_engine::Context;

/// Handed to every handler behind an `Arc`.
pub(crate) struct AdminState {
    pub ctx: Arc<Context>,
    /// Requests other than `/health` must present this key when set.
    pub api_key: Option<String>,
}

impl AdminState {
    pub fn new(ctx: Arc<Context>, api_key: Option<String>) -> Self {
        Self {
            ctx,
            api_key: api_key.filter(|k| !k.is_empty()),
        }
    }
}
